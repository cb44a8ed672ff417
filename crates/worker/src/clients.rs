//! HTTP clients for downstream portal services
//!
//! Every failure is reported as a [`ServiceError`] so the executors can hand
//! it to their classification table unchanged: non-success responses keep
//! their status code, connection failures and timeouts carry none.

use std::time::Duration;

use async_trait::async_trait;
use portal_processes::ServiceError;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::executors::{DidValidation, DidValidationService, Mail, MailDispatcher, WalletService};

/// Build the HTTP client shared by all service clients
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(timeout).build()
}

/// JSON client for one downstream service
#[derive(Clone)]
pub struct ServiceClient {
    service: &'static str,
    base_url: String,
    http: reqwest::Client,
}

impl ServiceClient {
    pub fn new(service: &'static str, base_url: &str, http: reqwest::Client) -> Self {
        Self {
            service,
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn transport_error(&self, e: reqwest::Error) -> ServiceError {
        ServiceError::transport(self.service, e.to_string())
    }

    /// POST a JSON body, decoding the JSON response
    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ServiceError> {
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let response = self.check_status(response).await?;

        // A 2xx with an unreadable body will not fix itself on retry
        response.json().await.map_err(|e| {
            ServiceError::transport(self.service, format!("invalid response body: {e}"))
                .with_recoverable(false)
        })
    }

    /// POST a JSON body, ignoring the response body
    pub async fn post_no_content<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), ServiceError> {
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.check_status(response).await?;
        Ok(())
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response, ServiceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        debug!(service = self.service, status = status.as_u16(), "service returned error");
        Err(ServiceError::status(
            self.service,
            status.as_u16(),
            error_message(status, &body),
        ))
    }
}

/// Short message for a failed response
fn error_message(status: StatusCode, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        status.to_string()
    } else {
        let mut message: String = body.chars().take(500).collect();
        if message.len() < body.len() {
            message.push_str("...");
        }
        format!("{status}: {message}")
    }
}

// ============================================
// Wallet service
// ============================================

#[derive(Serialize)]
struct CreateWalletRequest {
    application_id: Uuid,
}

#[derive(Deserialize)]
struct CreateWalletResponse {
    did: String,
}

pub struct HttpWalletService {
    client: ServiceClient,
}

impl HttpWalletService {
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            client: ServiceClient::new("wallet-service", base_url, http),
        }
    }
}

#[async_trait]
impl WalletService for HttpWalletService {
    async fn create_wallet(&self, application_id: Uuid) -> Result<String, ServiceError> {
        let response: CreateWalletResponse = self
            .client
            .post("/api/wallets", &CreateWalletRequest { application_id })
            .await?;
        Ok(response.did)
    }
}

// ============================================
// DID validation service
// ============================================

#[derive(Serialize)]
struct ValidateDidRequest<'a> {
    did: &'a str,
}

pub struct HttpDidValidationService {
    client: ServiceClient,
}

impl HttpDidValidationService {
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            client: ServiceClient::new("did-validation", base_url, http),
        }
    }
}

#[async_trait]
impl DidValidationService for HttpDidValidationService {
    async fn validate_did(&self, did: &str) -> Result<DidValidation, ServiceError> {
        self.client
            .post("/api/did/validate", &ValidateDidRequest { did })
            .await
    }
}

// ============================================
// Mail service
// ============================================

pub struct HttpMailDispatcher {
    client: ServiceClient,
}

impl HttpMailDispatcher {
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            client: ServiceClient::new("mail-service", base_url, http),
        }
    }
}

#[derive(Serialize)]
struct SendMailRequest<'a> {
    recipient: &'a str,
    template: &'a str,
    parameters: &'a std::collections::BTreeMap<String, String>,
}

#[async_trait]
impl MailDispatcher for HttpMailDispatcher {
    async fn send_mail(&self, mail: &Mail) -> Result<(), ServiceError> {
        let request = SendMailRequest {
            recipient: &mail.recipient,
            template: &mail.template,
            parameters: &mail.parameters,
        };
        self.client.post_no_content("/api/mails", &request).await
    }
}
