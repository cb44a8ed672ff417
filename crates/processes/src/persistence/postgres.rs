//! PostgreSQL implementation of ProcessStore
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency via single-statement version checks
//! - Expiring advisory locks stored on the process row
//! - Step change sets applied in one transaction

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::process::{
    Process, ProcessStep, ProcessStepChanges, ProcessStepTypeId, ProcessTypeId,
};

/// SQL schema for the process tables
pub const SCHEMA: &str = include_str!("../../migrations/0001_processes.sql");

/// PostgreSQL implementation of ProcessStore
///
/// # Example
///
/// ```ignore
/// use portal_processes::PostgresProcessStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/portal").await?;
/// let store = PostgresProcessStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresProcessStore {
    pool: PgPool,
}

impl PostgresProcessStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the process schema (idempotent)
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to apply process schema: {}", e);
                StoreError::Database(e.to_string())
            })?;
        Ok(())
    }

    async fn process_exists(&self, process_id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 AS found FROM processes WHERE id = $1")
            .bind(process_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(row.is_some())
    }

    /// Turn a failed optimistic update into `Ok(false)` or `ProcessNotFound`
    async fn unchanged(&self, process_id: Uuid) -> Result<bool, StoreError> {
        if self.process_exists(process_id).await? {
            Ok(false)
        } else {
            Err(StoreError::ProcessNotFound(process_id))
        }
    }
}

fn process_from_row(row: &PgRow) -> Result<Process, StoreError> {
    let process_type_id: String = row.get("process_type_id");
    Ok(Process {
        id: row.get("id"),
        process_type_id: process_type_id.parse()?,
        version: row.get("version"),
        lock_expiry_date: row.get("lock_expiry_date"),
        date_last_claimed: row.get("date_last_claimed"),
    })
}

fn step_from_row(row: &PgRow) -> Result<ProcessStep, StoreError> {
    let step_type: String = row.get("process_step_type_id");
    let status: String = row.get("process_step_status_id");
    Ok(ProcessStep {
        id: row.get("id"),
        process_id: row.get("process_id"),
        process_step_type_id: step_type.parse()?,
        process_step_status_id: status.parse()?,
        date_created: row.get("date_created"),
        date_last_changed: row.get("date_last_changed"),
        message: row.get("message"),
    })
}

async fn apply_changes(
    tx: &mut Transaction<'_, Postgres>,
    process_id: Uuid,
    changes: ProcessStepChanges,
) -> Result<(), StoreError> {
    for update in changes.updates {
        let result = sqlx::query(
            r#"
            UPDATE process_steps
            SET process_step_status_id = $1,
                message = COALESCE($2, message),
                date_last_changed = NOW()
            WHERE id = $3 AND process_id = $4
            "#,
        )
        .bind(update.process_step_status_id.as_str())
        .bind(&update.message)
        .bind(update.step_id)
        .bind(process_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Database(format!(
                "step {} does not belong to process {}",
                update.step_id, process_id
            )));
        }
    }

    for step in changes.new_steps {
        sqlx::query(
            r#"
            INSERT INTO process_steps
                (id, process_id, process_step_type_id, process_step_status_id, message)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(step.id)
        .bind(process_id)
        .bind(step.process_step_type_id.as_str())
        .bind(step.process_step_status_id.as_str())
        .bind(&step.message)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
    }

    Ok(())
}

#[async_trait]
impl ProcessStore for PostgresProcessStore {
    #[instrument(skip(self))]
    async fn create_process(&self, process_type_id: ProcessTypeId) -> Result<Process, StoreError> {
        let process = Process::new(process_type_id);

        sqlx::query(
            r#"
            INSERT INTO processes (id, process_type_id, version, lock_expiry_date)
            VALUES ($1, $2, $3, NULL)
            "#,
        )
        .bind(process.id)
        .bind(process_type_id.as_str())
        .bind(process.version)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create process: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(process_id = %process.id, %process_type_id, "created process");
        Ok(process)
    }

    #[instrument(skip(self))]
    async fn get_process(&self, process_id: Uuid) -> Result<Process, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, process_type_id, version, lock_expiry_date, date_last_claimed
            FROM processes
            WHERE id = $1
            "#,
        )
        .bind(process_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get process: {}", e);
            StoreError::Database(e.to_string())
        })?
        .ok_or(StoreError::ProcessNotFound(process_id))?;

        process_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_process_steps(&self, process_id: Uuid) -> Result<Vec<ProcessStep>, StoreError> {
        if !self.process_exists(process_id).await? {
            return Err(StoreError::ProcessNotFound(process_id));
        }

        let rows = sqlx::query(
            r#"
            SELECT id, process_id, process_step_type_id, process_step_status_id,
                   date_created, date_last_changed, message
            FROM process_steps
            WHERE process_id = $1
            ORDER BY date_created, id
            "#,
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get process steps: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(step_from_row).collect()
    }

    #[instrument(skip(self, process_type_ids, step_type_ids))]
    async fn find_due_processes(
        &self,
        process_type_ids: &[ProcessTypeId],
        step_type_ids: &[ProcessStepTypeId],
        batch_size: usize,
    ) -> Result<Vec<DueProcess>, StoreError> {
        if process_type_ids.is_empty() || step_type_ids.is_empty() {
            return Ok(vec![]);
        }

        let process_types: Vec<String> = process_type_ids.iter().map(|t| t.to_string()).collect();
        let step_types: Vec<String> = step_type_ids.iter().map(|t| t.to_string()).collect();

        let rows = sqlx::query(
            r#"
            SELECT p.id, p.process_type_id, p.version, p.lock_expiry_date, p.date_last_claimed,
                   array_agg(DISTINCT s.process_step_type_id) AS step_type_ids
            FROM processes p
            JOIN process_steps s ON s.process_id = p.id
            WHERE s.process_step_status_id = 'TODO'
              AND p.process_type_id = ANY($1)
              AND s.process_step_type_id = ANY($2)
              AND (p.lock_expiry_date IS NULL OR p.lock_expiry_date <= NOW())
            GROUP BY p.id
            ORDER BY p.date_last_claimed ASC NULLS FIRST, MIN(s.date_created), p.id
            LIMIT $3
            "#,
        )
        .bind(&process_types)
        .bind(&step_types)
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find due processes: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let mut due = Vec::with_capacity(rows.len());
        for row in rows {
            let step_type_names: Vec<String> = row.get("step_type_ids");
            let step_type_ids = step_type_names
                .iter()
                .map(|s| s.parse())
                .collect::<Result<BTreeSet<ProcessStepTypeId>, _>>()?;
            due.push(DueProcess {
                process: process_from_row(&row)?,
                step_type_ids,
            });
        }

        debug!(count = due.len(), "found due processes");
        Ok(due)
    }

    #[instrument(skip(self))]
    async fn try_claim_process(
        &self,
        process_id: Uuid,
        expected_version: i64,
        lock_expiry: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE processes
            SET version = version + 1,
                lock_expiry_date = $3,
                date_last_claimed = NOW()
            WHERE id = $1
              AND version = $2
              AND (lock_expiry_date IS NULL OR lock_expiry_date <= NOW())
            "#,
        )
        .bind(process_id)
        .bind(expected_version)
        .bind(lock_expiry)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim process: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.unchanged(process_id).await
    }

    #[instrument(skip(self, changes), fields(new_steps = changes.new_steps.len(), updates = changes.updates.len()))]
    async fn save_process_steps(
        &self,
        process_id: Uuid,
        expected_version: i64,
        changes: ProcessStepChanges,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE processes
            SET version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(process_id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            drop(tx);
            self.unchanged(process_id).await?;
            return Err(StoreError::ConcurrencyConflict {
                process_id,
                expected_version,
            });
        }

        apply_changes(&mut tx, process_id, changes).await.map_err(|e| {
            error!(%process_id, "Failed to apply step changes: {}", e);
            e
        })?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn release_process(
        &self,
        process_id: Uuid,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE processes
            SET version = version + 1,
                lock_expiry_date = NULL
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(process_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to release process: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.unchanged(process_id).await
    }

    #[instrument(skip(self))]
    async fn bump_version(&self, process_id: Uuid, expected_version: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE processes
            SET version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(process_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to bump process version: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.unchanged(process_id).await
    }
}
