//! Process type executor trait definition

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::classification::ErrorClassification;
use super::error::ProcessError;
use crate::process::{ProcessStepStatusId, ProcessStepTypeId, ProcessTypeId};

/// Result of [`ProcessTypeExecutor::initialize_process`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializationResult {
    /// The executor changed business data while initializing
    pub modified: bool,

    /// Step types to schedule before any step runs (backfill)
    pub schedule_step_type_ids: Option<BTreeSet<ProcessStepTypeId>>,
}

impl InitializationResult {
    pub fn unmodified() -> Self {
        Self::default()
    }

    /// Initialization that backfills missing steps
    pub fn schedule<I>(step_type_ids: I) -> Self
    where
        I: IntoIterator<Item = ProcessStepTypeId>,
    {
        let step_type_ids: BTreeSet<_> = step_type_ids.into_iter().collect();
        if step_type_ids.is_empty() {
            return Self::unmodified();
        }
        Self {
            modified: true,
            schedule_step_type_ids: Some(step_type_ids),
        }
    }

    pub fn with_modified(mut self, modified: bool) -> Self {
        self.modified = modified;
        self
    }
}

/// Intent returned by [`ProcessTypeExecutor::execute_process_step`]
///
/// The engine translates this into committed step state; executors never
/// write step records themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepExecutionResult {
    /// The executor changed business data
    pub modified: bool,

    /// New status of the executed step (`TODO` keeps it pending)
    pub status: ProcessStepStatusId,

    /// Step types to schedule
    pub next_step_type_ids: Option<BTreeSet<ProcessStepTypeId>>,

    /// Step types whose pending steps are skipped
    pub skip_step_type_ids: Option<BTreeSet<ProcessStepTypeId>>,

    /// Message stored on the executed step
    pub process_message: Option<String>,
}

impl StepExecutionResult {
    fn with_status(status: ProcessStepStatusId) -> Self {
        Self {
            modified: true,
            status,
            next_step_type_ids: None,
            skip_step_type_ids: None,
            process_message: None,
        }
    }

    /// Step completed
    pub fn done() -> Self {
        Self::with_status(ProcessStepStatusId::Done)
    }

    /// Step completed, schedule follow-up steps
    pub fn done_then<I>(next_step_type_ids: I) -> Self
    where
        I: IntoIterator<Item = ProcessStepTypeId>,
    {
        Self::done().with_next(next_step_type_ids)
    }

    /// Step not ready yet; stays pending without business changes
    pub fn waiting(message: impl Into<String>) -> Self {
        Self {
            modified: false,
            ..Self::with_status(ProcessStepStatusId::Todo)
        }
        .with_message(message)
    }

    /// Step deliberately not performed
    pub fn skipped(message: impl Into<String>) -> Self {
        Self::with_status(ProcessStepStatusId::Skipped).with_message(message)
    }

    pub fn with_next<I>(mut self, step_type_ids: I) -> Self
    where
        I: IntoIterator<Item = ProcessStepTypeId>,
    {
        self.next_step_type_ids
            .get_or_insert_with(BTreeSet::new)
            .extend(step_type_ids);
        self
    }

    pub fn with_skip<I>(mut self, step_type_ids: I) -> Self
    where
        I: IntoIterator<Item = ProcessStepTypeId>,
    {
        self.skip_step_type_ids
            .get_or_insert_with(BTreeSet::new)
            .extend(step_type_ids);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.process_message = Some(message.into());
        self
    }
}

/// Business logic for all step types of one process type
///
/// One instance is shared across concurrently executing processes, so all
/// per-process state lives in [`Self::Context`], created by
/// `initialize_process` and threaded through every `execute_process_step`
/// call of the same pass.
///
/// # Example
///
/// ```ignore
/// struct MailingExecutor { /* collaborators */ }
///
/// #[async_trait]
/// impl ProcessTypeExecutor for MailingExecutor {
///     const PROCESS_TYPE_ID: ProcessTypeId = ProcessTypeId::Mailing;
///     type Context = MailingContext;
///     // ...
/// }
/// ```
#[async_trait]
pub trait ProcessTypeExecutor: Send + Sync + 'static {
    /// Process type served by this executor
    const PROCESS_TYPE_ID: ProcessTypeId;

    /// Per-process state for one engine pass
    type Context: Send + 'static;

    /// Step types this executor runs
    fn executable_step_type_ids(&self) -> BTreeSet<ProcessStepTypeId>;

    fn is_executable_step_type_id(&self, step_type_id: ProcessStepTypeId) -> bool {
        self.executable_step_type_ids().contains(&step_type_id)
    }

    /// Whether running this step type needs an exclusive, expiring lock
    fn is_lock_requested(&self, step_type_id: ProcessStepTypeId) -> bool;

    /// Failure classification table of this process type
    fn error_classification(&self) -> &ErrorClassification;

    /// Load and validate per-process state before any step runs
    ///
    /// Fails with [`ProcessError::NotFound`] or [`ProcessError::Conflict`] if
    /// the owning business entity is missing or in an invalid state.
    async fn initialize_process(
        &self,
        process_id: Uuid,
        step_type_ids: &BTreeSet<ProcessStepTypeId>,
    ) -> Result<(Self::Context, InitializationResult), ProcessError>;

    /// Perform the side effect of one step
    ///
    /// Must tolerate re-invocation after a crash that happened before the
    /// status was committed.
    async fn execute_process_step(
        &self,
        context: &mut Self::Context,
        step_type_id: ProcessStepTypeId,
        step_type_ids: &BTreeSet<ProcessStepTypeId>,
        cancel: &CancellationToken,
    ) -> Result<StepExecutionResult, ProcessError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waiting_keeps_step_pending() {
        let result = StepExecutionResult::waiting("checklist incomplete");
        assert_eq!(result.status, ProcessStepStatusId::Todo);
        assert!(!result.modified);
        assert_eq!(result.process_message.as_deref(), Some("checklist incomplete"));
    }

    #[test]
    fn test_builders_accumulate_step_sets() {
        let result = StepExecutionResult::done_then([ProcessStepTypeId::ValidateDid])
            .with_next([ProcessStepTypeId::ActivateApplication])
            .with_skip([ProcessStepTypeId::RetriggerCreateWallet]);

        assert_eq!(
            result.next_step_type_ids,
            Some(BTreeSet::from([
                ProcessStepTypeId::ValidateDid,
                ProcessStepTypeId::ActivateApplication
            ]))
        );
        assert_eq!(
            result.skip_step_type_ids,
            Some(BTreeSet::from([ProcessStepTypeId::RetriggerCreateWallet]))
        );
    }

    #[test]
    fn test_empty_backfill_schedules_nothing() {
        let result = InitializationResult::schedule(Vec::<ProcessStepTypeId>::new());
        assert!(result.schedule_step_type_ids.is_none());
        assert!(!result.modified);
    }
}
