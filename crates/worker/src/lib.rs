//! Onboarding portal process worker
//!
//! Wires the process execution engine to the portal's business
//! collaborators: the executors for the application checklist and mailing
//! process types, reqwest clients for downstream services and sqlx
//! repositories for business data.

pub mod clients;
pub mod config;
pub mod executors;
pub mod repositories;
pub mod telemetry;

pub use config::{ConfigError, WorkerConfig};
pub use executors::{build_registry, ChecklistExecutor, MailingExecutor};
pub use repositories::RepositoryError;
pub use telemetry::{init_tracing, DEFAULT_LOG_FILTER};
