//! Process execution service
//!
//! The `ProcessExecutionService` is the generic driver of all processes:
//! - Discovering processes with pending executable steps
//! - Claiming them through the version counter (and lock, when requested)
//! - Initializing the owning executor and running due steps
//! - Committing step intents as step records, then releasing the process
//!
//! It is the only component that writes process and step rows.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::executor::{
    AnyProcessTypeExecutor, ProcessError, ProcessTypeExecutorRegistry, RegistryError,
    StepExecutionResult,
};
use crate::persistence::{DueProcess, ProcessStore, StoreError};
use crate::process::{PendingProcessSteps, Process, ProcessStepStatusId, ProcessStepTypeId};
use crate::worker::duration_millis;

/// Configuration for the execution service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum processes discovered per pass
    pub batch_size: usize,

    /// Duration of the lock taken for lock-requesting steps
    #[serde(with = "duration_millis")]
    pub lock_expiry: Duration,

    /// Processes of one batch executed concurrently
    pub max_concurrent_processes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            lock_expiry: Duration::from_secs(300),
            max_concurrent_processes: 4,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_lock_expiry(mut self, lock_expiry: Duration) -> Self {
        self.lock_expiry = lock_expiry;
        self
    }

    pub fn with_max_concurrent_processes(mut self, max: usize) -> Self {
        self.max_concurrent_processes = max.max(1);
        self
    }
}

/// Errors from the execution service
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error or invalid step type returned by an executor
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Executor reported a programming invariant violation
    #[error("system fault in process {process_id}: {message}")]
    System { process_id: Uuid, message: String },
}

impl EngineError {
    /// Whether the error must terminate the worker
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Registry(_) | EngineError::System { .. })
    }
}

/// What happened to one discovered process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Steps were executed and committed; `steps_completed` of them left
    /// `TODO` (done, failed or skipped by their own result)
    Executed {
        steps_executed: usize,
        steps_completed: usize,
    },

    /// Another worker claimed the process first
    Skipped,

    /// The version moved while the process was being executed
    Conflict,

    /// The executor could not initialize the process; its steps stay `TODO`
    InitializationFailed { message: String },

    /// Shutdown interrupted the pass; the running step was not committed
    Cancelled,
}

/// Counters for one discovery and execution round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub processes_found: usize,
    pub processes_executed: usize,
    pub steps_executed: usize,
    pub steps_completed: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub initialization_failures: usize,
    pub cancelled: usize,
    pub errors: usize,
}

impl PassSummary {
    /// Whether discovery returned any work
    pub fn found_work(&self) -> bool {
        self.processes_found > 0
    }

    /// Whether any step left `TODO` during the pass
    ///
    /// Recoverable failures and waiting steps are executed without
    /// progressing, so a pass made only of those does not count.
    pub fn made_progress(&self) -> bool {
        self.steps_completed > 0
    }

    fn record(&mut self, outcome: &ProcessOutcome) {
        match outcome {
            ProcessOutcome::Executed {
                steps_executed,
                steps_completed,
            } => {
                self.processes_executed += 1;
                self.steps_executed += steps_executed;
                self.steps_completed += steps_completed;
            }
            ProcessOutcome::Skipped => self.skipped += 1,
            ProcessOutcome::Conflict => self.conflicts += 1,
            ProcessOutcome::InitializationFailed { .. } => self.initialization_failures += 1,
            ProcessOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

/// Process execution service
///
/// # Example
///
/// ```ignore
/// use portal_processes::prelude::*;
///
/// let mut registry = ProcessTypeExecutorRegistry::new();
/// registry.register(MailingExecutor::new(repository, dispatcher))?;
///
/// let service = ProcessExecutionService::new(store, registry, EngineConfig::default());
/// let summary = service.run_pass(&CancellationToken::new()).await?;
/// ```
pub struct ProcessExecutionService<S: ProcessStore> {
    store: Arc<S>,
    registry: Arc<ProcessTypeExecutorRegistry>,
    config: EngineConfig,
}

impl<S: ProcessStore> ProcessExecutionService<S> {
    pub fn new(store: Arc<S>, registry: ProcessTypeExecutorRegistry, config: EngineConfig) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &ProcessTypeExecutorRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Discover due processes and execute them
    ///
    /// Non-fatal per-process errors are logged and counted; a fatal error
    /// aborts the pass and is returned.
    #[instrument(skip(self, cancel))]
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<PassSummary, EngineError> {
        let process_type_ids = self.registry.process_type_ids();
        let step_type_ids = self.registry.executable_step_type_ids();

        let due = self
            .store
            .find_due_processes(&process_type_ids, &step_type_ids, self.config.batch_size)
            .await?;

        let mut summary = PassSummary {
            processes_found: due.len(),
            ..PassSummary::default()
        };
        if due.is_empty() {
            return Ok(summary);
        }
        debug!(count = due.len(), "executing due processes");

        let mut results = stream::iter(due)
            .map(|d| self.execute_process(d, cancel))
            .buffer_unordered(self.config.max_concurrent_processes.max(1));

        while let Some(result) = results.next().await {
            match result {
                Ok(outcome) => summary.record(&outcome),
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "fatal error while executing processes");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "process execution failed");
                    summary.errors += 1;
                }
            }
        }

        info!(
            found = summary.processes_found,
            executed = summary.processes_executed,
            steps = summary.steps_executed,
            completed = summary.steps_completed,
            conflicts = summary.conflicts,
            "pass complete"
        );
        Ok(summary)
    }

    /// Claim and execute one discovered process
    #[instrument(
        skip(self, due, cancel),
        fields(
            process_id = %due.process.id,
            process_type_id = %due.process.process_type_id,
            version = due.process.version
        )
    )]
    pub async fn execute_process(
        &self,
        due: DueProcess,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, EngineError> {
        if cancel.is_cancelled() {
            return Ok(ProcessOutcome::Cancelled);
        }

        let DueProcess {
            mut process,
            step_type_ids,
        } = due;
        let executor = self.registry.get(process.process_type_id)?;

        // Claim, taking the lock right away if any due step asks for it
        let lock_requested = step_type_ids
            .iter()
            .any(|s| executor.is_executable_step_type_id(*s) && executor.is_lock_requested(*s));
        let lock_expiry = lock_requested.then(|| self.lock_expiry_from_now());
        if !self
            .store
            .try_claim_process(process.id, process.version, lock_expiry)
            .await?
        {
            debug!("process claimed by another worker");
            return Ok(ProcessOutcome::Skipped);
        }
        process.version += 1;
        process.lock_expiry_date = lock_expiry;
        process.date_last_claimed = Some(Utc::now());

        let steps = self.store.get_process_steps(process.id).await?;
        let mut pending = PendingProcessSteps::from_steps(process.id, &steps);

        let (mut context, init) = match executor
            .initialize_process(process.id, &pending.step_type_ids())
            .await
        {
            Ok(initialized) => initialized,
            Err(ProcessError::System(message)) => {
                return Err(EngineError::System {
                    process_id: process.id,
                    message,
                })
            }
            Err(e) => {
                warn!(error = %e, "process initialization failed");
                self.finish(&mut process).await?;
                return Ok(ProcessOutcome::InitializationFailed {
                    message: e.to_string(),
                });
            }
        };

        if let Some(schedule) = init.schedule_step_type_ids {
            self.registry
                .validate_step_type_ids(process.process_type_id, &schedule)?;
            pending.schedule_missing(schedule);
        }
        if pending.has_changes() {
            debug!(modified = init.modified, "persisting steps scheduled during initialization");
            if !self.commit(&mut process, &mut pending).await? {
                return Ok(ProcessOutcome::Conflict);
            }
        }

        let mut executed: BTreeSet<ProcessStepTypeId> = BTreeSet::new();
        let mut steps_executed = 0;
        let mut steps_completed = 0;

        while let Some(step_type_id) = pending
            .step_type_ids()
            .into_iter()
            .find(|s| !executed.contains(s) && executor.is_executable_step_type_id(*s))
        {
            executed.insert(step_type_id);

            if executor.is_lock_requested(step_type_id) && !process.is_locked() {
                let lock_expiry = self.lock_expiry_from_now();
                if !self
                    .store
                    .try_claim_process(process.id, process.version, Some(lock_expiry))
                    .await?
                {
                    debug!(%step_type_id, "lost process while acquiring lock");
                    return Ok(ProcessOutcome::Conflict);
                }
                process.version += 1;
                process.lock_expiry_date = Some(lock_expiry);
            }

            let step_type_ids = pending.step_type_ids();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(%step_type_id, "shutdown requested, leaving step pending");
                    self.finish(&mut process).await?;
                    return Ok(ProcessOutcome::Cancelled);
                }
                result = executor.execute_process_step(&mut context, step_type_id, &step_type_ids, cancel) => result,
            };

            if self.apply_result(&process, executor.as_ref(), &mut pending, step_type_id, result)? {
                steps_completed += 1;
            }
            steps_executed += 1;

            if !self.commit(&mut process, &mut pending).await? {
                return Ok(ProcessOutcome::Conflict);
            }
        }

        self.finish(&mut process).await?;
        Ok(ProcessOutcome::Executed {
            steps_executed,
            steps_completed,
        })
    }

    /// Translate an executor result into pending step changes
    ///
    /// Returns whether the step left `TODO`.
    fn apply_result(
        &self,
        process: &Process,
        executor: &dyn AnyProcessTypeExecutor,
        pending: &mut PendingProcessSteps,
        step_type_id: ProcessStepTypeId,
        result: Result<StepExecutionResult, ProcessError>,
    ) -> Result<bool, EngineError> {
        let process_type_id = executor.process_type_id();

        match result {
            Ok(result) => {
                if let Some(next) = &result.next_step_type_ids {
                    self.registry.validate_step_type_ids(process_type_id, next)?;
                }
                if let Some(skip) = &result.skip_step_type_ids {
                    self.registry.validate_step_type_ids(process_type_id, skip)?;
                }

                debug!(%step_type_id, status = %result.status, modified = result.modified, "step executed");
                let completed = result.status != ProcessStepStatusId::Todo;
                pending.complete(step_type_id, result.status, result.process_message);
                if let Some(skip) = result.skip_step_type_ids {
                    pending.skip(skip);
                }
                if let Some(next) = result.next_step_type_ids {
                    pending.schedule(next);
                }
                Ok(completed)
            }
            Err(ProcessError::Recoverable { message }) => {
                warn!(%step_type_id, error = %message, "recoverable step failure, will retry");
                pending.complete(step_type_id, ProcessStepStatusId::Todo, Some(message));
                Ok(false)
            }
            Err(ProcessError::Terminal {
                message,
                retrigger_step_type_id,
            }) => {
                warn!(%step_type_id, error = %message, retrigger = ?retrigger_step_type_id, "step failed");
                pending.complete(step_type_id, ProcessStepStatusId::Failed, Some(message));
                if let Some(retrigger) = retrigger_step_type_id {
                    self.registry
                        .validate_step_type_ids(process_type_id, [&retrigger])?;
                    pending.schedule([retrigger]);
                }
                Ok(true)
            }
            Err(e @ (ProcessError::NotFound(_) | ProcessError::Conflict(_))) => {
                warn!(%step_type_id, error = %e, "step failed");
                pending.complete(step_type_id, ProcessStepStatusId::Failed, Some(e.to_string()));
                Ok(true)
            }
            Err(ProcessError::System(message)) => Err(EngineError::System {
                process_id: process.id,
                message,
            }),
        }
    }

    /// Commit accumulated step changes; `false` if the version moved
    async fn commit(
        &self,
        process: &mut Process,
        pending: &mut PendingProcessSteps,
    ) -> Result<bool, EngineError> {
        let changes = pending.take_changes();
        if changes.is_empty() {
            return Ok(true);
        }

        match self
            .store
            .save_process_steps(process.id, process.version, changes)
            .await
        {
            Ok(()) => {
                process.version += 1;
                Ok(true)
            }
            Err(StoreError::ConcurrencyConflict { .. }) => {
                warn!("process modified concurrently, changes discarded");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Release the lock, or bump the version if none was taken
    async fn finish(&self, process: &mut Process) -> Result<(), EngineError> {
        let finished = if process.lock_expiry_date.is_some() {
            self.store
                .release_process(process.id, process.version)
                .await?
        } else {
            self.store.bump_version(process.id, process.version).await?
        };

        if finished {
            process.version += 1;
            process.lock_expiry_date = None;
        } else {
            warn!("process modified concurrently before release");
        }
        Ok(())
    }

    fn lock_expiry_from_now(&self) -> chrono::DateTime<Utc> {
        let millis = i64::try_from(self.config.lock_expiry.as_millis()).unwrap_or(i64::MAX);
        Utc::now() + chrono::Duration::milliseconds(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::executor::{ErrorClassification, InitializationResult, ProcessTypeExecutor};
    use crate::persistence::InMemoryProcessStore;
    use crate::process::{start_process, ProcessTypeId};

    type Script = HashMap<ProcessStepTypeId, VecDeque<Result<StepExecutionResult, ProcessError>>>;

    /// Mailing executor replaying scripted results per step type
    #[derive(Default)]
    struct ScriptedExecutor {
        script: Mutex<Script>,
        calls: Arc<Mutex<Vec<ProcessStepTypeId>>>,
        init_error: Option<ProcessError>,
        lock_requested: BTreeSet<ProcessStepTypeId>,
        classification: Option<ErrorClassification>,
        block_on: Option<ProcessStepTypeId>,
    }

    impl ScriptedExecutor {
        fn new() -> Self {
            Self {
                classification: Some(ErrorClassification::new(ProcessTypeId::Mailing)),
                ..Self::default()
            }
        }

        fn on(self, step: ProcessStepTypeId, result: Result<StepExecutionResult, ProcessError>) -> Self {
            self.script.lock().entry(step).or_default().push_back(result);
            self
        }
    }

    #[async_trait]
    impl ProcessTypeExecutor for ScriptedExecutor {
        const PROCESS_TYPE_ID: ProcessTypeId = ProcessTypeId::Mailing;
        type Context = ();

        fn executable_step_type_ids(&self) -> BTreeSet<ProcessStepTypeId> {
            BTreeSet::from([ProcessStepTypeId::SendMail])
        }

        fn is_lock_requested(&self, step_type_id: ProcessStepTypeId) -> bool {
            self.lock_requested.contains(&step_type_id)
        }

        fn error_classification(&self) -> &ErrorClassification {
            self.classification
                .as_ref()
                .expect("should have a classification table")
        }

        async fn initialize_process(
            &self,
            _process_id: Uuid,
            _step_type_ids: &BTreeSet<ProcessStepTypeId>,
        ) -> Result<((), InitializationResult), ProcessError> {
            match &self.init_error {
                Some(e) => Err(e.clone()),
                None => Ok(((), InitializationResult::unmodified())),
            }
        }

        async fn execute_process_step(
            &self,
            _context: &mut (),
            step_type_id: ProcessStepTypeId,
            _step_type_ids: &BTreeSet<ProcessStepTypeId>,
            _cancel: &CancellationToken,
        ) -> Result<StepExecutionResult, ProcessError> {
            self.calls.lock().push(step_type_id);
            if self.block_on == Some(step_type_id) {
                std::future::pending::<()>().await;
            }
            self.script
                .lock()
                .get_mut(&step_type_id)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Ok(StepExecutionResult::done()))
        }
    }

    async fn service_with(
        executor: ScriptedExecutor,
    ) -> (ProcessExecutionService<InMemoryProcessStore>, Process) {
        let store = Arc::new(InMemoryProcessStore::new());
        let process = start_process(store.as_ref(), ProcessTypeId::Mailing, [ProcessStepTypeId::SendMail])
            .await
            .expect("should start process");

        let mut registry = ProcessTypeExecutorRegistry::new();
        registry.register(executor).expect("should register");
        (
            ProcessExecutionService::new(store, registry, EngineConfig::default()),
            process,
        )
    }

    fn status_of(
        service: &ProcessExecutionService<InMemoryProcessStore>,
        process: &Process,
        step: ProcessStepTypeId,
    ) -> Vec<ProcessStepStatusId> {
        service
            .store()
            .steps_of_type(process.id, step)
            .iter()
            .map(|s| s.process_step_status_id)
            .collect()
    }

    #[tokio::test]
    async fn test_successful_step_is_done() {
        let (service, process) = service_with(ScriptedExecutor::new()).await;

        let summary = service
            .run_pass(&CancellationToken::new())
            .await
            .expect("pass should succeed");

        assert_eq!(summary.processes_found, 1);
        assert_eq!(summary.steps_executed, 1);
        assert_eq!(
            status_of(&service, &process, ProcessStepTypeId::SendMail),
            vec![ProcessStepStatusId::Done]
        );
        assert_eq!(service.store().pending_step_count(), 0);

        // Inert now
        let summary = service
            .run_pass(&CancellationToken::new())
            .await
            .expect("pass should succeed");
        assert!(!summary.found_work());
    }

    #[tokio::test]
    async fn test_recoverable_failure_leaves_step_pending() {
        let executor = ScriptedExecutor::new().on(
            ProcessStepTypeId::SendMail,
            Err(ProcessError::recoverable("mail relay unavailable")),
        );
        let (service, process) = service_with(executor).await;

        let summary = service
            .run_pass(&CancellationToken::new())
            .await
            .expect("pass should succeed");
        assert_eq!(summary.steps_executed, 1);
        assert!(!summary.made_progress());

        let steps = service
            .store()
            .steps_of_type(process.id, ProcessStepTypeId::SendMail);
        assert_eq!(steps.len(), 1);
        assert!(steps[0].is_pending());
        assert_eq!(steps[0].message.as_deref(), Some("mail relay unavailable"));

        // Next pass uses the default (success) result
        let summary = service
            .run_pass(&CancellationToken::new())
            .await
            .expect("pass should succeed");
        assert!(summary.made_progress());
        assert_eq!(
            status_of(&service, &process, ProcessStepTypeId::SendMail),
            vec![ProcessStepStatusId::Done]
        );
    }

    #[tokio::test]
    async fn test_terminal_failure_schedules_single_retrigger() {
        let executor = ScriptedExecutor::new().on(
            ProcessStepTypeId::SendMail,
            Err(ProcessError::terminal_with_retrigger(
                "recipient rejected",
                ProcessStepTypeId::RetriggerSendMail,
            )),
        );
        let (service, process) = service_with(executor).await;

        service
            .run_pass(&CancellationToken::new())
            .await
            .expect("pass should succeed");

        let failed = service
            .store()
            .steps_of_type(process.id, ProcessStepTypeId::SendMail);
        assert_eq!(failed[0].process_step_status_id, ProcessStepStatusId::Failed);
        assert_eq!(failed[0].message.as_deref(), Some("recipient rejected"));
        assert_eq!(
            status_of(&service, &process, ProcessStepTypeId::RetriggerSendMail),
            vec![ProcessStepStatusId::Todo]
        );

        // The retrigger step is not executable by the engine; nothing more is due
        let summary = service
            .run_pass(&CancellationToken::new())
            .await
            .expect("pass should succeed");
        assert!(!summary.found_work());
    }

    #[tokio::test]
    async fn test_initialization_failure_keeps_steps_pending() {
        let executor = ScriptedExecutor {
            init_error: Some(ProcessError::not_found("no mailing data for process")),
            ..ScriptedExecutor::new()
        };
        let (service, process) = service_with(executor).await;

        let summary = service
            .run_pass(&CancellationToken::new())
            .await
            .expect("pass should succeed");

        assert_eq!(summary.initialization_failures, 1);
        assert_eq!(
            status_of(&service, &process, ProcessStepTypeId::SendMail),
            vec![ProcessStepStatusId::Todo]
        );
        let stored = service.store().get_process(process.id).await.expect("should load");
        assert!(stored.lock_expiry_date.is_none());
    }

    #[tokio::test]
    async fn test_system_fault_is_fatal() {
        let executor = ScriptedExecutor::new().on(
            ProcessStepTypeId::SendMail,
            Err(ProcessError::system("mail template registry corrupted")),
        );
        let (service, _) = service_with(executor).await;

        let err = service
            .run_pass(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_foreign_next_step_is_fatal() {
        let executor = ScriptedExecutor::new().on(
            ProcessStepTypeId::SendMail,
            Ok(StepExecutionResult::done_then([ProcessStepTypeId::CreateWallet])),
        );
        let (service, process) = service_with(executor).await;

        let err = service
            .run_pass(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Registry(_)));
        assert_eq!(
            status_of(&service, &process, ProcessStepTypeId::SendMail),
            vec![ProcessStepStatusId::Todo]
        );
    }

    #[tokio::test]
    async fn test_stale_due_process_is_skipped() {
        let (service, process) = service_with(ScriptedExecutor::new()).await;
        let due = service
            .store()
            .find_due_processes(&[ProcessTypeId::Mailing], &[ProcessStepTypeId::SendMail], 10)
            .await
            .expect("should query")
            .remove(0);

        // Another worker got there first
        service
            .store()
            .bump_version(process.id, due.process.version)
            .await
            .expect("should bump");

        let outcome = service
            .execute_process(due, &CancellationToken::new())
            .await
            .expect("should not error");
        assert_eq!(outcome, ProcessOutcome::Skipped);
        assert_eq!(
            status_of(&service, &process, ProcessStepTypeId::SendMail),
            vec![ProcessStepStatusId::Todo]
        );
    }

    #[tokio::test]
    async fn test_lock_requested_step_locks_then_releases() {
        let executor = ScriptedExecutor {
            lock_requested: BTreeSet::from([ProcessStepTypeId::SendMail]),
            ..ScriptedExecutor::new()
        };
        let (service, process) = service_with(executor).await;

        let due = service
            .store()
            .find_due_processes(&[ProcessTypeId::Mailing], &[ProcessStepTypeId::SendMail], 10)
            .await
            .expect("should query")
            .remove(0);
        let outcome = service
            .execute_process(due, &CancellationToken::new())
            .await
            .expect("should execute");
        assert_eq!(
            outcome,
            ProcessOutcome::Executed {
                steps_executed: 1,
                steps_completed: 1
            }
        );

        let stored = service.store().get_process(process.id).await.expect("should load");
        assert!(stored.lock_expiry_date.is_none());
        // claim + save + release
        assert_eq!(stored.version, process.version + 3);
    }

    #[tokio::test]
    async fn test_cancellation_mid_step_commits_nothing() {
        let executor = ScriptedExecutor {
            block_on: Some(ProcessStepTypeId::SendMail),
            ..ScriptedExecutor::new()
        };
        let calls = executor.calls.clone();
        let (service, process) = service_with(executor).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let watcher = calls.clone();
        tokio::spawn(async move {
            while watcher.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            trigger.cancel();
        });

        let summary = service.run_pass(&cancel).await.expect("pass should succeed");

        assert_eq!(summary.cancelled, 1);
        assert_eq!(calls.lock().len(), 1);
        assert_eq!(
            status_of(&service, &process, ProcessStepTypeId::SendMail),
            vec![ProcessStepStatusId::Todo]
        );
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .with_batch_size(0)
            .with_lock_expiry(Duration::from_secs(60))
            .with_max_concurrent_processes(8);

        assert_eq!(config.batch_size, 1);
        assert_eq!(config.lock_expiry, Duration::from_secs(60));
        assert_eq!(config.max_concurrent_processes, 8);

        let json = serde_json::to_value(&config).expect("should serialize");
        assert_eq!(json["lock_expiry"], 60_000);
    }
}
