//! Mailing executor
//!
//! `SEND_MAIL` dispatches every unsent mail queued for the process. Each mail
//! is marked sent as soon as the dispatcher accepts it, so a retried step
//! only sends what is left.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use portal_processes::{
    ErrorClassification, InitializationResult, ProcessError, ProcessStepTypeId,
    ProcessTypeExecutor, ProcessTypeId, ServiceError, StepExecutionResult,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::repositories::RepositoryError;

/// Mail queued by the portal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mail {
    pub id: Uuid,
    pub process_id: Uuid,
    pub recipient: String,
    pub template: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[async_trait]
pub trait MailingRepository: Send + Sync {
    /// Mails of the process not yet sent, oldest first
    async fn get_unsent_mails(&self, process_id: Uuid) -> Result<Vec<Mail>, RepositoryError>;

    async fn mark_mail_sent(&self, mail_id: Uuid) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait MailDispatcher: Send + Sync {
    async fn send_mail(&self, mail: &Mail) -> Result<(), ServiceError>;
}

/// Unsent mails loaded at initialization
#[derive(Debug, Clone, Default)]
pub struct MailingContext {
    pub unsent: Vec<Mail>,
}

pub struct MailingExecutor {
    repository: Arc<dyn MailingRepository>,
    dispatcher: Arc<dyn MailDispatcher>,
    classification: ErrorClassification,
}

impl MailingExecutor {
    pub fn new(repository: Arc<dyn MailingRepository>, dispatcher: Arc<dyn MailDispatcher>) -> Self {
        Self {
            repository,
            dispatcher,
            classification: Self::classification_table(),
        }
    }

    pub fn classification_table() -> ErrorClassification {
        ErrorClassification::new(ProcessTypeId::Mailing)
            .with_retrigger(ProcessStepTypeId::SendMail, ProcessStepTypeId::RetriggerSendMail)
    }

    async fn send_mails(
        &self,
        context: &mut MailingContext,
        cancel: &CancellationToken,
    ) -> Result<StepExecutionResult, ProcessError> {
        if context.unsent.is_empty() {
            return Ok(StepExecutionResult::done().with_message("no unsent mails"));
        }

        let total = context.unsent.len();
        let mut sent = 0;
        while let Some(mail) = context.unsent.first() {
            if cancel.is_cancelled() {
                return Err(ProcessError::recoverable(format!(
                    "interrupted after {sent} of {total} mails"
                )));
            }

            if let Err(e) = self.dispatcher.send_mail(mail).await {
                let message = format!("{} ({sent} of {total} mails sent)", e.message);
                return Err(self.classification.into_process_error(
                    ProcessStepTypeId::SendMail,
                    ServiceError { message, ..e }.into(),
                ));
            }
            self.repository.mark_mail_sent(mail.id).await?;
            debug!(mail_id = %mail.id, template = %mail.template, "mail sent");

            context.unsent.remove(0);
            sent += 1;
        }

        info!(count = sent, "mails sent");
        Ok(StepExecutionResult::done().with_message(format!("{sent} mails sent")))
    }
}

#[async_trait]
impl ProcessTypeExecutor for MailingExecutor {
    const PROCESS_TYPE_ID: ProcessTypeId = ProcessTypeId::Mailing;
    type Context = MailingContext;

    fn executable_step_type_ids(&self) -> BTreeSet<ProcessStepTypeId> {
        BTreeSet::from([ProcessStepTypeId::SendMail])
    }

    fn is_lock_requested(&self, _step_type_id: ProcessStepTypeId) -> bool {
        false
    }

    fn error_classification(&self) -> &ErrorClassification {
        &self.classification
    }

    #[instrument(skip(self, _step_type_ids))]
    async fn initialize_process(
        &self,
        process_id: Uuid,
        _step_type_ids: &BTreeSet<ProcessStepTypeId>,
    ) -> Result<(Self::Context, InitializationResult), ProcessError> {
        let unsent = self.repository.get_unsent_mails(process_id).await?;
        Ok((MailingContext { unsent }, InitializationResult::unmodified()))
    }

    async fn execute_process_step(
        &self,
        context: &mut Self::Context,
        step_type_id: ProcessStepTypeId,
        _step_type_ids: &BTreeSet<ProcessStepTypeId>,
        cancel: &CancellationToken,
    ) -> Result<StepExecutionResult, ProcessError> {
        match step_type_id {
            ProcessStepTypeId::SendMail => self.send_mails(context, cancel).await,
            other => Err(ProcessError::system(format!(
                "step type {other} is not executable by the mailing executor"
            ))),
        }
    }
}
