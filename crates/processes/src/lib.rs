//! # Process Execution Engine
//!
//! A PostgreSQL-backed step runner that advances long-lived business processes
//! one step at a time, tolerating crash/restart, partial failure and
//! concurrent workers.
//!
//! ## Features
//!
//! - **Audit trail**: step records are never deleted; every transition is a status change
//! - **Optimistic concurrency**: a version counter plus an expiring lock per process
//! - **Pluggable executors**: one [`ProcessTypeExecutor`] per process type, dispatched by registry
//! - **Explicit error classification**: retry, fail with retrigger, or fail terminally
//! - **Cooperative shutdown**: running steps are raced against a cancellation token
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ProcessWorker                           │
//! │  (poll loop, idle backoff, shutdown)                         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ProcessExecutionService                      │
//! │  (discover due processes, claim, execute steps, commit)      │
//! └─────────────────────────────────────────────────────────────┘
//!                │                                  │
//!                ▼                                  ▼
//! ┌───────────────────────────┐    ┌────────────────────────────┐
//! │ ProcessTypeExecutorRegistry│    │        ProcessStore        │
//! │ (one executor per type)    │    │ (processes, process_steps) │
//! └───────────────────────────┘    └────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use portal_processes::prelude::*;
//!
//! struct MailingExecutor { /* repositories, dispatcher */ }
//!
//! #[async_trait]
//! impl ProcessTypeExecutor for MailingExecutor {
//!     const PROCESS_TYPE_ID: ProcessTypeId = ProcessTypeId::Mailing;
//!     type Context = MailingContext;
//!
//!     fn executable_step_type_ids(&self) -> BTreeSet<ProcessStepTypeId> {
//!         BTreeSet::from([ProcessStepTypeId::SendMail])
//!     }
//!
//!     // ... implement other trait methods
//! }
//!
//! let mut registry = ProcessTypeExecutorRegistry::new();
//! registry.register(MailingExecutor::new(/* ... */))?;
//!
//! let service = ProcessExecutionService::new(store, registry, EngineConfig::default());
//! ProcessWorker::new("worker-1", Arc::new(service), PollerConfig::default())
//!     .run(cancel)
//!     .await?;
//! ```

pub mod engine;
pub mod executor;
pub mod persistence;
pub mod process;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{
        EngineConfig, EngineError, PassSummary, ProcessExecutionService, ProcessOutcome,
    };
    pub use crate::executor::{
        ErrorClassification, FaultClass, InitializationResult, ProcessError, ProcessTypeExecutor,
        ProcessTypeExecutorRegistry, ServiceError, StepExecutionResult, StepFailure,
    };
    pub use crate::persistence::{
        DueProcess, InMemoryProcessStore, PostgresProcessStore, ProcessStore, StoreError,
    };
    pub use crate::process::{
        retrigger, start_process, ManualProcessStep, ManualStepError, Process, ProcessStep,
        ProcessStepStatusId, ProcessStepTypeId, ProcessTypeId,
    };
    pub use crate::worker::{PollerConfig, ProcessWorker};
    pub use async_trait::async_trait;
    pub use tokio_util::sync::CancellationToken;
}

// Re-export key types at crate root
pub use engine::{EngineConfig, EngineError, PassSummary, ProcessExecutionService, ProcessOutcome};
pub use executor::{
    ErrorClassification, FaultClass, InitializationResult, ProcessError, ProcessTypeExecutor,
    ProcessTypeExecutorRegistry, RegistryError, ServiceError, StepExecutionResult, StepFailure,
};
pub use persistence::{DueProcess, InMemoryProcessStore, PostgresProcessStore, ProcessStore, StoreError};
pub use process::{
    retrigger, start_process, ManualProcessStep, ManualStepError, PendingProcessSteps, Process,
    ProcessStep, ProcessStepChanges, ProcessStepStatusId, ProcessStepTypeId, ProcessTypeId,
};
pub use worker::{PollBackoff, PollerConfig, ProcessWorker, WorkerStats};
