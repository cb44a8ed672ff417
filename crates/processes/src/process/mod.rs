//! Process data model and step-state helpers
//!
//! This module provides:
//! - [`Process`] / [`ProcessStep`] records and their type/status enums
//! - [`PendingProcessSteps`] for accumulating step transitions
//! - [`ManualProcessStep`] for advancing a process from a user action

mod manual;
mod steps;
mod types;

pub use manual::{retrigger, start_process, ManualProcessStep, ManualStepError};
pub use steps::{NewProcessStep, PendingProcessSteps, ProcessStepChanges, ProcessStepUpdate};
pub use types::{
    ParseIdError, Process, ProcessStep, ProcessStepStatusId, ProcessStepTypeId, ProcessTypeId,
};
