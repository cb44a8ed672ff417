//! Error classification tables
//!
//! Each process type publishes one [`ErrorClassification`] that turns raw step
//! failures into one of three outcomes. Rules, in order:
//!
//! 1. an explicit `recoverable` flag on a [`ServiceError`] wins
//! 2. a status code in the recoverable set (502, 503, 504 by default) retries
//! 3. a service error without status code (transport failure, timeout) retries
//! 4. anything else fails, scheduling the retrigger step configured for the
//!    failing step type if there is one

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::ProcessError;
use crate::process::{ProcessStepTypeId, ProcessTypeId};

/// Status codes retried by default
pub const DEFAULT_RECOVERABLE_STATUS_CODES: [u16; 3] = [502, 503, 504];

/// Failure reported by a downstream service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{service}: {message}")]
pub struct ServiceError {
    /// Name of the downstream service
    pub service: String,

    /// HTTP status, `None` if no response was received
    pub status_code: Option<u16>,

    pub message: String,

    /// Explicit override of the status code rules
    pub recoverable: Option<bool>,
}

impl ServiceError {
    /// Error with a response status
    pub fn status(service: impl Into<String>, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            status_code: Some(status_code),
            message: message.into(),
            recoverable: None,
        }
    }

    /// Error without a response (connection refused, timeout)
    pub fn transport(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            status_code: None,
            message: message.into(),
            recoverable: None,
        }
    }

    /// Mark the error as recoverable or not regardless of status
    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = Some(recoverable);
        self
    }
}

/// A raw failure raised while executing a step
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepFailure {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Outcome of classifying a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultClass {
    /// Leave the step `TODO` for a later pass
    Retry,
    /// Mark the step `FAILED` and schedule the given retrigger step
    FailWithRetrigger(ProcessStepTypeId),
    /// Mark the step `FAILED`
    FailTerminal,
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultClass::Retry => write!(f, "retry"),
            FaultClass::FailWithRetrigger(step) => write!(f, "fail-with-retrigger({step})"),
            FaultClass::FailTerminal => write!(f, "fail-terminal"),
        }
    }
}

/// Classification table for one process type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClassification {
    process_type_id: ProcessTypeId,
    recoverable_status_codes: BTreeSet<u16>,
    retriggers: BTreeMap<ProcessStepTypeId, ProcessStepTypeId>,
}

impl ErrorClassification {
    /// Table with the default recoverable status codes and no retriggers
    pub fn new(process_type_id: ProcessTypeId) -> Self {
        Self {
            process_type_id,
            recoverable_status_codes: DEFAULT_RECOVERABLE_STATUS_CODES.into_iter().collect(),
            retriggers: BTreeMap::new(),
        }
    }

    /// Replace the set of status codes that are retried
    pub fn with_recoverable_status_codes<I>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        self.recoverable_status_codes = codes.into_iter().collect();
        self
    }

    /// Schedule `retrigger` when `step` fails terminally
    pub fn with_retrigger(mut self, step: ProcessStepTypeId, retrigger: ProcessStepTypeId) -> Self {
        self.retriggers.insert(step, retrigger);
        self
    }

    pub fn process_type_id(&self) -> ProcessTypeId {
        self.process_type_id
    }

    /// Retrigger step configured for a step type
    pub fn retrigger_for(&self, step: ProcessStepTypeId) -> Option<ProcessStepTypeId> {
        self.retriggers.get(&step).copied()
    }

    /// All (step, retrigger) pairs
    pub fn retriggers(&self) -> impl Iterator<Item = (ProcessStepTypeId, ProcessStepTypeId)> + '_ {
        self.retriggers.iter().map(|(s, r)| (*s, *r))
    }

    pub fn is_recoverable_status(&self, status_code: u16) -> bool {
        self.recoverable_status_codes.contains(&status_code)
    }

    /// Classify a failure of the given step type
    pub fn classify(&self, step: ProcessStepTypeId, failure: &StepFailure) -> FaultClass {
        let retry = match failure {
            StepFailure::Service(error) => match (error.recoverable, error.status_code) {
                (Some(recoverable), _) => recoverable,
                (None, Some(code)) => self.is_recoverable_status(code),
                (None, None) => true,
            },
            StepFailure::Validation(_) | StepFailure::NotFound(_) | StepFailure::Conflict(_) => {
                false
            }
        };

        if retry {
            return FaultClass::Retry;
        }
        match self.retrigger_for(step) {
            Some(retrigger) => FaultClass::FailWithRetrigger(retrigger),
            None => FaultClass::FailTerminal,
        }
    }

    /// Classify a failure and express it as the engine's error
    pub fn into_process_error(&self, step: ProcessStepTypeId, failure: StepFailure) -> ProcessError {
        let message = failure.to_string();
        match self.classify(step, &failure) {
            FaultClass::Retry => ProcessError::recoverable(message),
            FaultClass::FailWithRetrigger(retrigger) => {
                ProcessError::terminal_with_retrigger(message, retrigger)
            }
            FaultClass::FailTerminal => ProcessError::terminal(message),
        }
    }
}
