//! In-process account store
//!
//! Same contract as the Postgres store:
//! - Row locks are per-account async mutexes held by the unit of work
//! - Reads see committed state only and never wait on row locks
//! - Staged writes are applied under one journal lock on commit
//!
//! Round-trip latency and one-shot failures can be injected to exercise
//! timeout and rollback paths.

use super::{AccountStore, UnitOfWork};
use crate::{
    error::{Error, Result},
    types::{
        Account, AccountId, Charge, NewAccount, NewCharge, Transaction, TransactionId,
        TransactionKind,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use tracing::debug;

/// Step of a unit of work at which a failure can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// Opening the unit of work
    Begin,
    /// Appending the transaction header
    InsertTransaction,
    /// Staging a charge
    InsertCharge,
    /// Locking the balance row
    LockBalance,
    /// Staging the new balance
    SetBalance,
    /// Committing
    Commit,
}

/// In-memory [`AccountStore`]
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    rows: DashMap<AccountId, Row>,
    journal: Mutex<Journal>,
    next_transaction_id: AtomicI64,
    latency: Duration,
    fail_point: Mutex<Option<FailPoint>>,
}

struct Row {
    email: String,
    currency: String,
    lock: Arc<RowLock<()>>,
}

#[derive(Default)]
struct Journal {
    balances: HashMap<AccountId, Decimal>,
    transactions: Vec<Transaction>,
    charges: Vec<Charge>,
    last_commit_at: Option<DateTime<Utc>>,
}

impl Journal {
    /// Commit timestamps are strictly increasing so charge order matches commit order
    fn next_commit_at(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let at = match self.last_commit_at {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last_commit_at = Some(at);
        at
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("accounts", &self.shared.rows.len())
            .field("latency", &self.shared.latency)
            .finish()
    }
}

impl MemoryStore {
    /// Empty store with no simulated latency
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store that sleeps `latency` on every store round-trip
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                latency,
                ..Shared::default()
            }),
        }
    }

    /// Fail the next unit-of-work step matching `point`
    pub fn fail_next(&self, point: FailPoint) {
        *self.shared.fail_point.lock() = Some(point);
    }

    /// All committed transactions in commit order
    pub fn transactions(&self) -> Vec<Transaction> {
        self.shared.journal.lock().transactions.clone()
    }

    /// All committed charges in commit order
    pub fn charges(&self) -> Vec<Charge> {
        self.shared.journal.lock().charges.clone()
    }

    fn trip(&self, point: FailPoint) -> Result<()> {
        self.shared.trip(point)
    }

    async fn round_trip(&self) {
        self.shared.round_trip().await;
    }
}

impl Shared {
    fn trip(&self, point: FailPoint) -> Result<()> {
        let mut armed = self.fail_point.lock();
        if *armed == Some(point) {
            *armed = None;
            return Err(Error::Internal(format!("injected failure at {:?}", point)));
        }
        Ok(())
    }

    async fn round_trip(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn insert_account(&self, account: &NewAccount) -> Result<()> {
        self.round_trip().await;

        match self.shared.rows.entry(account.id) {
            Entry::Occupied(_) => {
                return Err(Error::Internal(format!(
                    "duplicate account id {}",
                    account.id
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(Row {
                    email: account.email.clone(),
                    currency: account.currency.clone(),
                    lock: Arc::new(RowLock::new(())),
                });
            }
        }

        self.shared
            .journal
            .lock()
            .balances
            .insert(account.id, Decimal::ZERO);
        Ok(())
    }

    async fn fetch_account(&self, id: AccountId) -> Result<Option<Account>> {
        self.round_trip().await;

        let Some((email, currency)) = self
            .shared
            .rows
            .get(&id)
            .map(|row| (row.email.clone(), row.currency.clone()))
        else {
            return Ok(None);
        };

        let balance = self
            .shared
            .journal
            .lock()
            .balances
            .get(&id)
            .copied()
            .unwrap_or(Decimal::ZERO);

        Ok(Some(Account {
            id,
            email,
            currency,
            balance,
        }))
    }

    async fn fetch_charges(&self, id: AccountId) -> Result<Vec<Charge>> {
        self.round_trip().await;

        let mut charges: Vec<Charge> = self
            .shared
            .journal
            .lock()
            .charges
            .iter()
            .filter(|c| c.account_id == id)
            .cloned()
            .collect();
        charges.sort_by_key(|c| (c.created_at, c.transaction_id));
        Ok(charges)
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        self.round_trip().await;
        self.trip(FailPoint::Begin)?;

        Ok(Box::new(MemoryUnitOfWork {
            shared: self.shared.clone(),
            transactions: Vec::new(),
            charges: Vec::new(),
            locks: HashMap::new(),
            balances: HashMap::new(),
        }))
    }
}

/// Unit of work over a [`MemoryStore`]
pub struct MemoryUnitOfWork {
    shared: Arc<Shared>,
    transactions: Vec<Transaction>,
    charges: Vec<NewCharge>,
    locks: HashMap<AccountId, OwnedMutexGuard<()>>,
    balances: HashMap<AccountId, Decimal>,
}

impl Drop for MemoryUnitOfWork {
    fn drop(&mut self) {
        if !self.locks.is_empty() || !self.transactions.is_empty() {
            debug!(
                locks = self.locks.len(),
                transactions = self.transactions.len(),
                "Discarding uncommitted unit of work"
            );
        }
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn insert_transaction(&mut self, kind: TransactionKind) -> Result<TransactionId> {
        self.shared.round_trip().await;
        self.shared.trip(FailPoint::InsertTransaction)?;

        // Ids are never reused, even when the unit of work rolls back
        let id = TransactionId(self.shared.next_transaction_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.transactions.push(Transaction { id, kind });
        Ok(id)
    }

    async fn insert_charge(&mut self, charge: &NewCharge) -> Result<()> {
        self.shared.round_trip().await;
        self.shared.trip(FailPoint::InsertCharge)?;

        if !self.shared.rows.contains_key(&charge.account_id) {
            return Err(Error::NotFound(charge.account_id));
        }
        if !self.transactions.iter().any(|t| t.id == charge.transaction_id) {
            return Err(Error::Internal(format!(
                "charge references unknown transaction {}",
                charge.transaction_id
            )));
        }
        self.charges.push(charge.clone());
        Ok(())
    }

    async fn lock_balance(&mut self, id: AccountId) -> Result<Decimal> {
        self.shared.round_trip().await;
        self.shared.trip(FailPoint::LockBalance)?;

        if let Some(staged) = self.balances.get(&id) {
            return Ok(*staged);
        }

        if !self.locks.contains_key(&id) {
            // Clone the lock out so no map shard is held across the await
            let lock = self
                .shared
                .rows
                .get(&id)
                .map(|row| row.lock.clone())
                .ok_or(Error::NotFound(id))?;
            let guard = lock.lock_owned().await;
            self.locks.insert(id, guard);
        }

        let balance = self
            .shared
            .journal
            .lock()
            .balances
            .get(&id)
            .copied()
            .unwrap_or(Decimal::ZERO);
        Ok(balance)
    }

    async fn set_balance(&mut self, id: AccountId, balance: Decimal) -> Result<()> {
        self.shared.round_trip().await;
        self.shared.trip(FailPoint::SetBalance)?;

        if !self.locks.contains_key(&id) {
            return Err(Error::Internal(format!(
                "balance of account {} written without row lock",
                id
            )));
        }
        self.balances.insert(id, balance);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.shared.round_trip().await;
        this.shared.trip(FailPoint::Commit)?;

        let transactions = std::mem::take(&mut this.transactions);
        let charges = std::mem::take(&mut this.charges);
        let balances = std::mem::take(&mut this.balances);

        {
            let mut journal = this.shared.journal.lock();
            let created_at = journal.next_commit_at();
            journal.balances.extend(balances);
            journal.transactions.extend(transactions);
            journal.charges.extend(charges.into_iter().map(|c| Charge {
                transaction_id: c.transaction_id,
                account_id: c.account_id,
                leg: c.leg,
                amount: c.amount,
                created_at,
            }));
        }

        // Row locks are released only after the journal reflects the commit
        this.locks.clear();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.transactions.clear();
        this.charges.clear();
        this.balances.clear();
        this.locks.clear();
        Ok(())
    }
}
