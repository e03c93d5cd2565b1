//! Account service
//!
//! Deposits, withdrawals, balances and statements over the double-entry
//! ledger, behind validation, admission control and circuit breaking.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod id;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod service;

// Re-exports for convenience
pub use errors::{ServiceError, ServiceResult, StartupError};
pub use middleware::{build_stack, Stack};
pub use service::{AccountService, CoreService};
