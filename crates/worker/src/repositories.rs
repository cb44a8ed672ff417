//! PostgreSQL repositories for portal business data
//!
//! The executors only see the collaborator traits; these implementations are
//! wired in by the binary and share the pool of the process store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use portal_processes::process::ParseIdError;
use portal_processes::ProcessError;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{error, instrument};
use uuid::Uuid;

use crate::executors::{
    Application, ChecklistEntry, ChecklistEntryStatusId, ChecklistEntryTypeId,
    ChecklistRepository, Mail, MailingRepository,
};

/// SQL schema for the business tables (requires the process schema)
pub const SCHEMA: &str = include_str!("../migrations/0001_portal.sql");

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(e: sqlx::Error) -> Self {
        RepositoryError::Database(e.to_string())
    }
}

impl From<ParseIdError> for RepositoryError {
    fn from(e: ParseIdError) -> Self {
        RepositoryError::InvalidData(e.to_string())
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(e: serde_json::Error) -> Self {
        RepositoryError::InvalidData(e.to_string())
    }
}

impl From<RepositoryError> for ProcessError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound(message) => ProcessError::not_found(message),
            RepositoryError::InvalidData(message) => ProcessError::conflict(message),
            // Database hiccups leave the step pending for the next pass
            RepositoryError::Database(message) => ProcessError::recoverable(message),
        }
    }
}

/// Apply the business schema (idempotent)
pub async fn migrate(pool: &PgPool) -> Result<(), RepositoryError> {
    sqlx::raw_sql(SCHEMA).execute(pool).await.map_err(|e| {
        error!("Failed to apply portal schema: {}", e);
        RepositoryError::from(e)
    })?;
    Ok(())
}

// ============================================
// Checklist
// ============================================

#[derive(Clone)]
pub struct PgChecklistRepository {
    pool: PgPool,
}

impl PgChecklistRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn application_from_row(row: &PgRow) -> Result<Application, RepositoryError> {
    let status: String = row.get("status");
    Ok(Application {
        id: row.get("id"),
        process_id: row.get("process_id"),
        status: status.parse()?,
        did: row.get("did"),
    })
}

fn entry_from_row(row: &PgRow) -> Result<ChecklistEntry, RepositoryError> {
    let entry_type: String = row.get("entry_type_id");
    let status: String = row.get("status_id");
    Ok(ChecklistEntry {
        entry_type_id: entry_type.parse()?,
        status_id: status.parse()?,
        comment: row.get("comment"),
    })
}

/// Fail with `NotFound` when an update touched no row
fn expect_row(rows_affected: u64, what: impl FnOnce() -> String) -> Result<(), RepositoryError> {
    if rows_affected == 0 {
        Err(RepositoryError::NotFound(what()))
    } else {
        Ok(())
    }
}

#[async_trait]
impl ChecklistRepository for PgChecklistRepository {
    #[instrument(skip(self))]
    async fn find_application_for_process(
        &self,
        process_id: Uuid,
    ) -> Result<Option<Application>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, process_id, status, did FROM applications WHERE process_id = $1",
        )
        .bind(process_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(application_from_row).transpose()
    }

    async fn get_checklist(&self, application_id: Uuid) -> Result<Vec<ChecklistEntry>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT entry_type_id, status_id, comment
            FROM application_checklist
            WHERE application_id = $1
            ORDER BY entry_type_id
            "#,
        )
        .bind(application_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn create_checklist_entries(
        &self,
        application_id: Uuid,
        entry_type_ids: &[ChecklistEntryTypeId],
    ) -> Result<(), RepositoryError> {
        let entry_type_ids: Vec<String> =
            entry_type_ids.iter().map(|t| t.as_str().to_string()).collect();

        sqlx::query(
            r#"
            INSERT INTO application_checklist (application_id, entry_type_id, status_id)
            SELECT $1, entry_type_id, $2
            FROM UNNEST($3::text[]) AS entry_type_id
            ON CONFLICT (application_id, entry_type_id) DO NOTHING
            "#,
        )
        .bind(application_id)
        .bind(ChecklistEntryStatusId::ToDo.as_str())
        .bind(entry_type_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_checklist_entry(
        &self,
        application_id: Uuid,
        entry_type_id: ChecklistEntryTypeId,
        status_id: ChecklistEntryStatusId,
        comment: Option<String>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE application_checklist
            SET status_id = $1, comment = $2, date_last_changed = NOW()
            WHERE application_id = $3 AND entry_type_id = $4
            "#,
        )
        .bind(status_id.as_str())
        .bind(comment)
        .bind(application_id)
        .bind(entry_type_id.as_str())
        .execute(&self.pool)
        .await?;

        expect_row(result.rows_affected(), || {
            format!("checklist entry {entry_type_id} of application {application_id}")
        })
    }

    async fn set_application_did(&self, application_id: Uuid, did: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE applications SET did = $1, date_last_changed = NOW() WHERE id = $2",
        )
        .bind(did)
        .bind(application_id)
        .execute(&self.pool)
        .await?;

        expect_row(result.rows_affected(), || format!("application {application_id}"))
    }

    #[instrument(skip(self))]
    async fn activate_application(&self, application_id: Uuid) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE applications SET status = 'CONFIRMED', date_last_changed = NOW() WHERE id = $1",
        )
        .bind(application_id)
        .execute(&self.pool)
        .await?;

        expect_row(result.rows_affected(), || format!("application {application_id}"))
    }
}

// ============================================
// Mailing
// ============================================

#[derive(Clone)]
pub struct PgMailingRepository {
    pool: PgPool,
}

impl PgMailingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn mail_from_row(row: &PgRow) -> Result<Mail, RepositoryError> {
    let parameters: String = row.get("parameters");
    let parameters: BTreeMap<String, String> = serde_json::from_str(&parameters)?;
    Ok(Mail {
        id: row.get("id"),
        process_id: row.get("process_id"),
        recipient: row.get("recipient"),
        template: row.get("template"),
        parameters,
    })
}

#[async_trait]
impl MailingRepository for PgMailingRepository {
    #[instrument(skip(self))]
    async fn get_unsent_mails(&self, process_id: Uuid) -> Result<Vec<Mail>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, process_id, recipient, template, parameters::text AS parameters
            FROM mails
            WHERE process_id = $1 AND date_sent IS NULL
            ORDER BY date_created, id
            "#,
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(mail_from_row).collect()
    }

    async fn mark_mail_sent(&self, mail_id: Uuid) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE mails SET date_sent = NOW() WHERE id = $1")
            .bind(mail_id)
            .execute(&self.pool)
            .await?;

        expect_row(result.rows_affected(), || format!("mail {mail_id}"))
    }
}
