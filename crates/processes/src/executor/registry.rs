//! Executor registry for type-erased dispatch
//!
//! The registry maps each process type to exactly one executor. Typed
//! executors are wrapped so the engine can drive them without knowing their
//! context type.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::classification::ErrorClassification;
use super::definition::{InitializationResult, ProcessTypeExecutor, StepExecutionResult};
use super::error::ProcessError;
use crate::process::{ProcessStepTypeId, ProcessTypeId};

/// Executor context with its concrete type erased
pub type ErasedContext = Box<dyn Any + Send>;

/// Type-erased executor interface
///
/// This trait allows the engine to work with executors without knowing their
/// context types.
#[async_trait]
pub trait AnyProcessTypeExecutor: Send + Sync {
    fn process_type_id(&self) -> ProcessTypeId;

    fn executable_step_type_ids(&self) -> BTreeSet<ProcessStepTypeId>;

    fn is_executable_step_type_id(&self, step_type_id: ProcessStepTypeId) -> bool;

    fn is_lock_requested(&self, step_type_id: ProcessStepTypeId) -> bool;

    fn error_classification(&self) -> &ErrorClassification;

    async fn initialize_process(
        &self,
        process_id: Uuid,
        step_type_ids: &BTreeSet<ProcessStepTypeId>,
    ) -> Result<(ErasedContext, InitializationResult), ProcessError>;

    async fn execute_process_step(
        &self,
        context: &mut ErasedContext,
        step_type_id: ProcessStepTypeId,
        step_type_ids: &BTreeSet<ProcessStepTypeId>,
        cancel: &CancellationToken,
    ) -> Result<StepExecutionResult, ProcessError>;
}

/// Wrapper to implement AnyProcessTypeExecutor for any ProcessTypeExecutor
struct ExecutorWrapper<E: ProcessTypeExecutor> {
    inner: E,
}

#[async_trait]
impl<E: ProcessTypeExecutor> AnyProcessTypeExecutor for ExecutorWrapper<E> {
    fn process_type_id(&self) -> ProcessTypeId {
        E::PROCESS_TYPE_ID
    }

    fn executable_step_type_ids(&self) -> BTreeSet<ProcessStepTypeId> {
        self.inner.executable_step_type_ids()
    }

    fn is_executable_step_type_id(&self, step_type_id: ProcessStepTypeId) -> bool {
        self.inner.is_executable_step_type_id(step_type_id)
    }

    fn is_lock_requested(&self, step_type_id: ProcessStepTypeId) -> bool {
        self.inner.is_lock_requested(step_type_id)
    }

    fn error_classification(&self) -> &ErrorClassification {
        self.inner.error_classification()
    }

    async fn initialize_process(
        &self,
        process_id: Uuid,
        step_type_ids: &BTreeSet<ProcessStepTypeId>,
    ) -> Result<(ErasedContext, InitializationResult), ProcessError> {
        let (context, result) = self
            .inner
            .initialize_process(process_id, step_type_ids)
            .await?;
        Ok((Box::new(context), result))
    }

    async fn execute_process_step(
        &self,
        context: &mut ErasedContext,
        step_type_id: ProcessStepTypeId,
        step_type_ids: &BTreeSet<ProcessStepTypeId>,
        cancel: &CancellationToken,
    ) -> Result<StepExecutionResult, ProcessError> {
        let context = context.downcast_mut::<E::Context>().ok_or_else(|| {
            ProcessError::system(format!(
                "context passed to {} executor has the wrong type",
                E::PROCESS_TYPE_ID
            ))
        })?;
        self.inner
            .execute_process_step(context, step_type_id, step_type_ids, cancel)
            .await
    }
}

/// Registry of process type executors, one per process type
#[derive(Default)]
pub struct ProcessTypeExecutorRegistry {
    executors: HashMap<ProcessTypeId, Arc<dyn AnyProcessTypeExecutor>>,
}

impl ProcessTypeExecutorRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor
    ///
    /// Rejects a second executor for the same process type, executable step
    /// types owned by another process type, and classification tables that
    /// reference foreign step types.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = ProcessTypeExecutorRegistry::new();
    /// registry.register(MailingExecutor::new(repository, dispatcher))?;
    /// ```
    pub fn register<E: ProcessTypeExecutor>(&mut self, executor: E) -> Result<(), RegistryError> {
        let process_type_id = E::PROCESS_TYPE_ID;
        if self.executors.contains_key(&process_type_id) {
            return Err(RegistryError::DuplicateProcessType(process_type_id));
        }

        for step_type_id in executor.executable_step_type_ids() {
            Self::check_owned(process_type_id, step_type_id)?;
        }

        let classification = executor.error_classification();
        if classification.process_type_id() != process_type_id {
            return Err(RegistryError::ClassificationMismatch {
                expected: process_type_id,
                actual: classification.process_type_id(),
            });
        }
        for (step, retrigger) in classification.retriggers() {
            Self::check_owned(process_type_id, step)?;
            Self::check_owned(process_type_id, retrigger)?;
        }

        self.executors
            .insert(process_type_id, Arc::new(ExecutorWrapper { inner: executor }));
        Ok(())
    }

    fn check_owned(
        process_type_id: ProcessTypeId,
        step_type_id: ProcessStepTypeId,
    ) -> Result<(), RegistryError> {
        if process_type_id.owns(step_type_id) {
            Ok(())
        } else {
            Err(RegistryError::ForeignStepType {
                process_type_id,
                step_type_id,
            })
        }
    }

    /// Check if a process type has an executor
    pub fn contains(&self, process_type_id: ProcessTypeId) -> bool {
        self.executors.contains_key(&process_type_id)
    }

    /// Get the executor of a process type
    pub fn get(
        &self,
        process_type_id: ProcessTypeId,
    ) -> Result<Arc<dyn AnyProcessTypeExecutor>, RegistryError> {
        self.executors
            .get(&process_type_id)
            .cloned()
            .ok_or(RegistryError::UnknownProcessType(process_type_id))
    }

    /// Verify that step types returned for a process belong to its type
    pub fn validate_step_type_ids<'a, I>(
        &self,
        process_type_id: ProcessTypeId,
        step_type_ids: I,
    ) -> Result<(), RegistryError>
    where
        I: IntoIterator<Item = &'a ProcessStepTypeId>,
    {
        for step_type_id in step_type_ids {
            Self::check_owned(process_type_id, *step_type_id)?;
        }
        Ok(())
    }

    /// Get the number of registered executors
    pub fn len(&self) -> usize {
        self.executors.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// Registered process types, sorted
    pub fn process_type_ids(&self) -> Vec<ProcessTypeId> {
        let mut ids: Vec<_> = self.executors.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Executable step types across all registered executors, sorted
    pub fn executable_step_type_ids(&self) -> Vec<ProcessStepTypeId> {
        self.executors
            .values()
            .flat_map(|e| e.executable_step_type_ids())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl fmt::Debug for ProcessTypeExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessTypeExecutorRegistry")
            .field("process_types", &self.process_type_ids())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No executor registered for the process type
    #[error("no executor registered for process type {0}")]
    UnknownProcessType(ProcessTypeId),

    #[error("an executor for process type {0} is already registered")]
    DuplicateProcessType(ProcessTypeId),

    #[error("step type {step_type_id} does not belong to process type {process_type_id}")]
    ForeignStepType {
        process_type_id: ProcessTypeId,
        step_type_id: ProcessStepTypeId,
    },

    #[error("classification table for {actual} registered for {expected}")]
    ClassificationMismatch {
        expected: ProcessTypeId,
        actual: ProcessTypeId,
    },
}
