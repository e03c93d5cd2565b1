//! Account ledger core
//!
//! Double-entry bookkeeping over a transactional account store.
//!
//! # Architecture
//!
//! - **Store**: accounts, transactions and charges behind [`AccountStore`]
//! - **Unit of work**: one atomic store transaction per transfer, rolled back on drop
//! - **Row locks**: the only per-entity mutual exclusion, no global lock
//!
//! # Invariants
//!
//! - Every transaction has exactly one debit and one credit of equal amount
//! - User balances never go negative
//! - A failed or cancelled transfer leaves no partial effect

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]

pub mod config;
pub mod error;
pub mod ledger;
pub mod store;
pub mod types;

// Re-exports
pub use config::DatabaseConfig;
pub use error::{Error, FieldErrors, Result};
#[cfg(any(test, feature = "mocks"))]
pub use ledger::MockLedgerEngine;
pub use ledger::{Ledger, LedgerEngine};
pub use store::{AccountStore, FailPoint, MemoryStore, PgStore, UnitOfWork};
pub use types::{
    amount_violation, Account, AccountId, Charge, ChargeLeg, TransactionId, TransactionKind,
    AMOUNT_SCALE, MAX_BALANCE,
};
