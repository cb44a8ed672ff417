//! Errors returned by process type executors

use serde::{Deserialize, Serialize};

use crate::process::ProcessStepTypeId;

/// Failure of an executor call
///
/// The engine only distinguishes these outcomes; how a concrete failure maps
/// onto them is decided by the executor's [`ErrorClassification`] table.
///
/// [`ErrorClassification`]: super::ErrorClassification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ProcessError {
    /// Expected to resolve on retry; the step stays `TODO`
    #[error("{message}")]
    Recoverable { message: String },

    /// Will not resolve on retry; the step becomes `FAILED`
    #[error("{message}")]
    Terminal {
        message: String,
        /// Step type scheduled as the re-entry point for this failure
        retrigger_step_type_id: Option<ProcessStepTypeId>,
    },

    /// The business entity owning the process is missing
    #[error("not found: {0}")]
    NotFound(String),

    /// The business entity is in a state that does not allow processing
    #[error("conflict: {0}")]
    Conflict(String),

    /// Programming invariant violation; terminates the worker
    #[error("system fault: {0}")]
    System(String),
}

impl ProcessError {
    /// Create a recoverable error
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable {
            message: message.into(),
        }
    }

    /// Create a terminal error without retrigger step
    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Terminal {
            message: message.into(),
            retrigger_step_type_id: None,
        }
    }

    /// Create a terminal error scheduling the given retrigger step
    pub fn terminal_with_retrigger(
        message: impl Into<String>,
        retrigger_step_type_id: ProcessStepTypeId,
    ) -> Self {
        Self::Terminal {
            message: message.into(),
            retrigger_step_type_id: Some(retrigger_step_type_id),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::System(message.into())
    }

    /// Whether this error must terminate the worker
    pub fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }
}
