//! ProcessStore trait and persistence types
//!
//! This is the only contract through which process and step rows are read or
//! mutated. Every mutation is guarded by the process `version`.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::process::{Process, ProcessStep, ProcessStepChanges, ProcessStepTypeId, ProcessTypeId};

/// Errors from the store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("process not found: {0}")]
    ProcessNotFound(Uuid),

    #[error("concurrency conflict on process {process_id}: expected version {expected_version}")]
    ConcurrencyConflict {
        process_id: Uuid,
        expected_version: i64,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<crate::process::ParseIdError> for StoreError {
    fn from(e: crate::process::ParseIdError) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// A process with pending work, as returned by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DueProcess {
    pub process: Process,

    /// Step types with a `TODO` step, restricted to the requested step types
    pub step_type_ids: BTreeSet<ProcessStepTypeId>,
}

/// Persistence for processes and their steps
#[async_trait]
pub trait ProcessStore: Send + Sync + 'static {
    // =========================================================================
    // Process lifecycle
    // =========================================================================

    /// Create an unlocked process at version 0
    async fn create_process(&self, process_type_id: ProcessTypeId) -> Result<Process, StoreError>;

    /// Get a process by id
    async fn get_process(&self, process_id: Uuid) -> Result<Process, StoreError>;

    /// All steps of a process (any status), ordered by creation
    async fn get_process_steps(&self, process_id: Uuid) -> Result<Vec<ProcessStep>, StoreError>;

    // =========================================================================
    // Discovery
    // =========================================================================

    /// Find processes with pending work
    ///
    /// Only processes of `process_type_ids` having a `TODO` step of one of
    /// `step_type_ids` are returned, and only if their lock is absent or
    /// expired. Ordered by their oldest pending step.
    async fn find_due_processes(
        &self,
        process_type_ids: &[ProcessTypeId],
        step_type_ids: &[ProcessStepTypeId],
        batch_size: usize,
    ) -> Result<Vec<DueProcess>, StoreError>;

    // =========================================================================
    // Optimistic concurrency
    // =========================================================================

    /// Claim a process
    ///
    /// Succeeds only if the version still equals `expected_version` and the
    /// process is not locked (or its lock has expired). On success the version
    /// is incremented and the lock set to `lock_expiry` (`None` clears it).
    async fn try_claim_process(
        &self,
        process_id: Uuid,
        expected_version: i64,
        lock_expiry: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;

    /// Apply a step change set and increment the version, atomically
    ///
    /// Fails with [`StoreError::ConcurrencyConflict`] if the version moved.
    async fn save_process_steps(
        &self,
        process_id: Uuid,
        expected_version: i64,
        changes: ProcessStepChanges,
    ) -> Result<(), StoreError>;

    /// Clear the lock and increment the version
    async fn release_process(&self, process_id: Uuid, expected_version: i64)
        -> Result<bool, StoreError>;

    /// Increment the version, leaving the lock untouched
    async fn bump_version(&self, process_id: Uuid, expected_version: i64)
        -> Result<bool, StoreError>;
}
