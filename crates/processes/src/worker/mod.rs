//! Worker loop driving the execution service
//!
//! This module provides:
//! - [`ProcessWorker`] that repeats engine passes until cancelled
//! - [`PollBackoff`] / [`PollerConfig`] for the idle poll interval

mod poller;
mod runner;

pub(crate) use poller::duration_millis;
pub use poller::{PollBackoff, PollerConfig};
pub use runner::{ProcessWorker, WorkerStats};
