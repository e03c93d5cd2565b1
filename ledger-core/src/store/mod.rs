//! Account store abstraction
//!
//! # Tables
//!
//! - `accounts` - One row per account (key: id), balance mutated only by the engine
//! - `transactions` - Append-only transaction headers
//! - `charges` - Append-only debit/credit legs (two per transaction)
//!
//! Reads outside a unit of work never block on row locks. Mutations go through a
//! [`UnitOfWork`], which owns a single atomic store transaction.

pub mod memory;
pub mod postgres;

use crate::{
    error::Result,
    types::{Account, AccountId, Charge, NewAccount, NewCharge, TransactionId, TransactionKind},
};
use async_trait::async_trait;
use rust_decimal::Decimal;

pub use memory::{FailPoint, MemoryStore};
pub use postgres::PgStore;

/// Durable storage for accounts, transactions and charges
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Insert a zero-balance account row
    async fn insert_account(&self, account: &NewAccount) -> Result<()>;

    /// Fetch an account by id, `None` when absent
    async fn fetch_account(&self, id: AccountId) -> Result<Option<Account>>;

    /// All committed charges against `id`, ordered by (`created_at`, `transaction_id`)
    async fn fetch_charges(&self, id: AccountId) -> Result<Vec<Charge>>;

    /// Open an atomic unit of work
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;
}

/// Atomic multi-statement unit of work
///
/// Every effect staged through a unit of work becomes visible on
/// [`commit`](UnitOfWork::commit) or not at all. Dropping a unit of work
/// without committing discards its effects and releases its row locks, so
/// early returns and cancelled futures leave no partial state behind.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Append a transaction header, returning its store-assigned id
    async fn insert_transaction(&mut self, kind: TransactionKind) -> Result<TransactionId>;

    /// Stage one charge leg
    async fn insert_charge(&mut self, charge: &NewCharge) -> Result<()>;

    /// Read an account balance while taking an exclusive lock on its row.
    ///
    /// The lock is held until the unit of work ends. Concurrent callers
    /// locking the same row wait here.
    async fn lock_balance(&mut self, id: AccountId) -> Result<Decimal>;

    /// Stage a new balance for a row previously locked by this unit of work
    async fn set_balance(&mut self, id: AccountId, balance: Decimal) -> Result<()>;

    /// Make all staged effects durable and release locks
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard all staged effects and release locks
    async fn rollback(self: Box<Self>) -> Result<()>;
}
