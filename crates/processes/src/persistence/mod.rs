//! Persistence layer for processes and steps
//!
//! This module provides:
//! - [`ProcessStore`] trait, the narrow contract the engine persists through
//! - [`InMemoryProcessStore`] for testing
//! - [`PostgresProcessStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryProcessStore;
pub use postgres::{PostgresProcessStore, SCHEMA};
pub use store::{DueProcess, ProcessStore, StoreError};
