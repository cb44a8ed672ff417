//! Process execution engine
//!
//! The engine discovers processes with pending steps, dispatches them to
//! their executor and commits the outcome.

mod service;

pub use service::{EngineConfig, EngineError, PassSummary, ProcessExecutionService, ProcessOutcome};
