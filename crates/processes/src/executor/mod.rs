//! Process type executor contract
//!
//! This module provides:
//! - [`ProcessTypeExecutor`], implemented once per process type
//! - [`ProcessError`] and the [`ErrorClassification`] tables mapping raw
//!   failures onto it
//! - [`ProcessTypeExecutorRegistry`] for dispatch by process type

mod classification;
mod definition;
mod error;
mod registry;

pub use classification::{
    ErrorClassification, FaultClass, ServiceError, StepFailure, DEFAULT_RECOVERABLE_STATUS_CODES,
};
pub use definition::{InitializationResult, ProcessTypeExecutor, StepExecutionResult};
pub use error::ProcessError;
pub use registry::{
    AnyProcessTypeExecutor, ErasedContext, ProcessTypeExecutorRegistry, RegistryError,
};
