//! Manual step helpers
//!
//! Used when a user action, not the polling engine, advances a process
//! inline (for example an administrator re-triggering a failed step).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::steps::PendingProcessSteps;
use super::types::{Process, ProcessStepStatusId, ProcessStepTypeId, ProcessTypeId};
use crate::persistence::{ProcessStore, StoreError};

/// Errors from manual step handling
#[derive(Debug, thiserror::Error)]
pub enum ManualStepError {
    #[error("process not found: {0}")]
    ProcessNotFound(Uuid),

    #[error("step type {step_type_id} does not belong to process type {process_type_id}")]
    StepTypeMismatch {
        process_type_id: ProcessTypeId,
        step_type_id: ProcessStepTypeId,
    },

    #[error("process {process_id} is locked until {lock_expiry_date}")]
    ProcessLocked {
        process_id: Uuid,
        lock_expiry_date: DateTime<Utc>,
    },

    #[error("process {process_id} has no pending step {step_type_id}")]
    StepNotPending {
        process_id: Uuid,
        step_type_id: ProcessStepTypeId,
    },

    #[error("{0} is not a retrigger step type")]
    NotRetriggerStep(ProcessStepTypeId),

    /// Invariant violation: the caller must check eligibility before locking
    #[error("process {0} is already locked")]
    AlreadyLocked(Uuid),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ManualStepError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ProcessNotFound(id) => ManualStepError::ProcessNotFound(id),
            other => ManualStepError::Store(other),
        }
    }
}

fn ensure_owned(
    process_type_id: ProcessTypeId,
    step_type_id: ProcessStepTypeId,
) -> Result<(), ManualStepError> {
    if process_type_id.owns(step_type_id) {
        Ok(())
    } else {
        Err(ManualStepError::StepTypeMismatch {
            process_type_id,
            step_type_id,
        })
    }
}

/// A pending step being completed by a user action
pub struct ManualProcessStep<'a, S: ProcessStore + ?Sized> {
    store: &'a S,
    process: Process,
    step_type_id: ProcessStepTypeId,
    pending: PendingProcessSteps,
}

impl<'a, S: ProcessStore + ?Sized> ManualProcessStep<'a, S> {
    /// Load a process and verify the step can be completed manually
    ///
    /// The process must own the step type, must not be locked, and must have a
    /// `TODO` step of that type.
    #[instrument(skip(store))]
    pub async fn load(
        store: &'a S,
        process_id: Uuid,
        step_type_id: ProcessStepTypeId,
    ) -> Result<Self, ManualStepError> {
        let process = store.get_process(process_id).await?;
        ensure_owned(process.process_type_id, step_type_id)?;

        if let Some(lock_expiry_date) = process.lock_expiry_date {
            if lock_expiry_date > Utc::now() {
                return Err(ManualStepError::ProcessLocked {
                    process_id,
                    lock_expiry_date,
                });
            }
        }

        let steps = store.get_process_steps(process_id).await?;
        let pending = PendingProcessSteps::from_steps(process_id, &steps);
        if !pending.contains(step_type_id) {
            return Err(ManualStepError::StepNotPending {
                process_id,
                step_type_id,
            });
        }

        Ok(Self {
            store,
            process,
            step_type_id,
            pending,
        })
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    pub fn step_type_id(&self) -> ProcessStepTypeId {
        self.step_type_id
    }

    /// Pending step types, including those scheduled through this helper
    pub fn pending_step_type_ids(&self) -> BTreeSet<ProcessStepTypeId> {
        self.pending.step_type_ids()
    }

    /// Lock the process until `lock_expiry`
    pub async fn request_lock(&mut self, lock_expiry: DateTime<Utc>) -> Result<(), ManualStepError> {
        if self.process.is_locked() {
            return Err(ManualStepError::AlreadyLocked(self.process.id));
        }

        let claimed = self
            .store
            .try_claim_process(self.process.id, self.process.version, Some(lock_expiry))
            .await?;
        if !claimed {
            return Err(ManualStepError::Store(StoreError::ConcurrencyConflict {
                process_id: self.process.id,
                expected_version: self.process.version,
            }));
        }

        self.process.version += 1;
        self.process.lock_expiry_date = Some(lock_expiry);
        debug!(process_id = %self.process.id, %lock_expiry, "locked process");
        Ok(())
    }

    /// Skip pending steps of the given types; the step being completed is never skipped
    pub fn skip_process_steps<I>(&mut self, step_type_ids: I)
    where
        I: IntoIterator<Item = ProcessStepTypeId>,
    {
        let own = self.step_type_id;
        self.pending
            .skip(step_type_ids.into_iter().filter(|t| *t != own));
    }

    /// Schedule the given step types unless already pending
    pub fn schedule_process_steps<I>(&mut self, step_type_ids: I) -> Result<(), ManualStepError>
    where
        I: IntoIterator<Item = ProcessStepTypeId>,
    {
        let step_type_ids: Vec<_> = step_type_ids.into_iter().collect();
        for step_type_id in &step_type_ids {
            ensure_owned(self.process.process_type_id, *step_type_id)?;
        }
        self.pending.schedule_missing(step_type_ids);
        Ok(())
    }

    /// Mark the step `DONE`, commit all accumulated changes and release the lock
    ///
    /// The commit itself increments the version, so without a lock no further
    /// bump is needed.
    #[instrument(skip(self), fields(process_id = %self.process.id, step_type_id = %self.step_type_id))]
    pub async fn finalize_process_step(mut self) -> Result<Process, ManualStepError> {
        self.pending
            .complete(self.step_type_id, ProcessStepStatusId::Done, None);

        let changes = self.pending.take_changes();
        self.store
            .save_process_steps(self.process.id, self.process.version, changes)
            .await?;
        self.process.version += 1;

        if self.process.lock_expiry_date.is_some() {
            let released = self
                .store
                .release_process(self.process.id, self.process.version)
                .await?;
            if !released {
                return Err(ManualStepError::Store(StoreError::ConcurrencyConflict {
                    process_id: self.process.id,
                    expected_version: self.process.version,
                }));
            }
            self.process.version += 1;
            self.process.lock_expiry_date = None;
        }

        info!(version = self.process.version, "finalized manual step");
        Ok(self.process)
    }
}

/// Complete a `RETRIGGER_*` step and schedule the step it re-enters
#[instrument(skip(store))]
pub async fn retrigger<S: ProcessStore + ?Sized>(
    store: &S,
    process_id: Uuid,
    retrigger_step_type_id: ProcessStepTypeId,
) -> Result<Process, ManualStepError> {
    let target = retrigger_step_type_id
        .retriggered_step_type_id()
        .ok_or(ManualStepError::NotRetriggerStep(retrigger_step_type_id))?;

    let mut step = ManualProcessStep::load(store, process_id, retrigger_step_type_id).await?;
    step.schedule_process_steps([target])?;
    step.finalize_process_step().await
}

/// Create a process with its initial `TODO` steps
#[instrument(skip(store, initial_step_type_ids))]
pub async fn start_process<S, I>(
    store: &S,
    process_type_id: ProcessTypeId,
    initial_step_type_ids: I,
) -> Result<Process, ManualStepError>
where
    S: ProcessStore + ?Sized,
    I: IntoIterator<Item = ProcessStepTypeId>,
{
    let initial: Vec<_> = initial_step_type_ids.into_iter().collect();
    for step_type_id in &initial {
        ensure_owned(process_type_id, *step_type_id)?;
    }

    let process = store.create_process(process_type_id).await?;
    let mut pending = PendingProcessSteps::from_steps(process.id, &[]);
    pending.schedule_missing(initial);

    if pending.has_changes() {
        store
            .save_process_steps(process.id, process.version, pending.take_changes())
            .await?;
    }

    info!(process_id = %process.id, %process_type_id, "started process");
    Ok(store.get_process(process.id).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryProcessStore;
    use chrono::Duration;

    async fn checklist_with(
        store: &InMemoryProcessStore,
        steps: &[ProcessStepTypeId],
    ) -> Process {
        start_process(store, ProcessTypeId::ApplicationChecklist, steps.iter().copied())
            .await
            .expect("should start process")
    }

    #[tokio::test]
    async fn test_start_process_creates_todo_steps() {
        let store = InMemoryProcessStore::new();
        let process = checklist_with(
            &store,
            &[ProcessStepTypeId::CreateWallet, ProcessStepTypeId::CreateWallet],
        )
        .await;

        assert_eq!(process.version, 1);
        let steps = store.get_process_steps(process.id).await.expect("should load");
        assert_eq!(steps.len(), 1);
        assert!(steps[0].is_pending());
    }

    #[tokio::test]
    async fn test_start_process_rejects_foreign_step() {
        let store = InMemoryProcessStore::new();
        let err = start_process(&store, ProcessTypeId::Mailing, [ProcessStepTypeId::CreateWallet])
            .await
            .unwrap_err();
        assert!(matches!(err, ManualStepError::StepTypeMismatch { .. }));
        assert_eq!(store.process_count(), 0);
    }

    #[tokio::test]
    async fn test_load_validations() {
        let store = InMemoryProcessStore::new();
        let process = checklist_with(&store, &[ProcessStepTypeId::RetriggerValidateDid]).await;

        let err = ManualProcessStep::load(&store, Uuid::now_v7(), ProcessStepTypeId::ValidateDid)
            .await
            .err()
            .expect("should fail");
        assert!(matches!(err, ManualStepError::ProcessNotFound(_)));

        let err = ManualProcessStep::load(&store, process.id, ProcessStepTypeId::SendMail)
            .await
            .err()
            .expect("should fail");
        assert!(matches!(err, ManualStepError::StepTypeMismatch { .. }));

        let err = ManualProcessStep::load(&store, process.id, ProcessStepTypeId::ValidateDid)
            .await
            .err()
            .expect("should fail");
        assert!(matches!(err, ManualStepError::StepNotPending { .. }));

        store.set_lock_expiry(process.id, Some(Utc::now() + Duration::minutes(1)));
        let err = ManualProcessStep::load(&store, process.id, ProcessStepTypeId::RetriggerValidateDid)
            .await
            .err()
            .expect("should fail");
        assert!(matches!(err, ManualStepError::ProcessLocked { .. }));
    }

    #[tokio::test]
    async fn test_retrigger_schedules_target_step() {
        let store = InMemoryProcessStore::new();
        let process = checklist_with(&store, &[ProcessStepTypeId::RetriggerValidateDid]).await;

        let updated = retrigger(&store, process.id, ProcessStepTypeId::RetriggerValidateDid)
            .await
            .expect("should retrigger");
        assert_eq!(updated.version, process.version + 1);
        assert!(updated.lock_expiry_date.is_none());

        let retrigger_steps =
            store.steps_of_type(process.id, ProcessStepTypeId::RetriggerValidateDid);
        assert_eq!(
            retrigger_steps[0].process_step_status_id,
            ProcessStepStatusId::Done
        );
        let validate = store.steps_of_type(process.id, ProcessStepTypeId::ValidateDid);
        assert_eq!(validate.len(), 1);
        assert!(validate[0].is_pending());
    }

    #[tokio::test]
    async fn test_retrigger_rejects_regular_step() {
        let store = InMemoryProcessStore::new();
        let process = checklist_with(&store, &[ProcessStepTypeId::ValidateDid]).await;

        let err = retrigger(&store, process.id, ProcessStepTypeId::ValidateDid)
            .await
            .unwrap_err();
        assert!(matches!(err, ManualStepError::NotRetriggerStep(_)));
    }

    #[tokio::test]
    async fn test_lock_then_finalize_releases() {
        let store = InMemoryProcessStore::new();
        let process = checklist_with(&store, &[ProcessStepTypeId::ActivateApplication]).await;

        let mut step = ManualProcessStep::load(&store, process.id, ProcessStepTypeId::ActivateApplication)
            .await
            .expect("should load");
        step.request_lock(Utc::now() + Duration::minutes(5))
            .await
            .expect("should lock");

        // The lock is visible to everyone else
        let locked = store.get_process(process.id).await.expect("should load");
        assert!(locked.is_locked());

        let err = step
            .request_lock(Utc::now() + Duration::minutes(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ManualStepError::AlreadyLocked(_)));

        let finalized = step.finalize_process_step().await.expect("should finalize");
        assert!(finalized.lock_expiry_date.is_none());

        let stored = store.get_process(process.id).await.expect("should load");
        assert_eq!(stored, finalized);
        assert_eq!(stored.version, process.version + 3);
    }

    #[tokio::test]
    async fn test_schedule_then_skip_round_trip() {
        let store = InMemoryProcessStore::new();
        let process = checklist_with(
            &store,
            &[ProcessStepTypeId::ActivateApplication, ProcessStepTypeId::RetriggerCreateWallet],
        )
        .await;
        let types = [
            ProcessStepTypeId::RetriggerCreateWallet,
            ProcessStepTypeId::RetriggerValidateDid,
        ];

        let mut step = ManualProcessStep::load(&store, process.id, ProcessStepTypeId::ActivateApplication)
            .await
            .expect("should load");
        step.schedule_process_steps(types).expect("should schedule");
        step.skip_process_steps(types);
        step.finalize_process_step().await.expect("should finalize");

        for step_type in types {
            let steps = store.steps_of_type(process.id, step_type);
            assert!(!steps.is_empty());
            assert!(steps.iter().all(|s| matches!(
                s.process_step_status_id,
                ProcessStepStatusId::Skipped | ProcessStepStatusId::Duplicate
            )));
        }
        assert_eq!(store.pending_step_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_manual_step_conflicts() {
        let store = InMemoryProcessStore::new();
        let process = checklist_with(&store, &[ProcessStepTypeId::RetriggerCreateWallet]).await;

        let step = ManualProcessStep::load(&store, process.id, ProcessStepTypeId::RetriggerCreateWallet)
            .await
            .expect("should load");
        store
            .bump_version(process.id, process.version)
            .await
            .expect("should bump");

        let err = step.finalize_process_step().await.unwrap_err();
        assert!(matches!(
            err,
            ManualStepError::Store(StoreError::ConcurrencyConflict { .. })
        ));
    }
}
