//! Double-entry ledger engine
//!
//! Every deposit and withdrawal is one store transaction that:
//!
//! 1. Appends a transaction header
//! 2. Stages a matched debit/credit charge pair of equal amount
//! 3. Reads the user balance under an exclusive row lock
//! 4. Writes the new balance and commits
//!
//! Any failure discards every staged effect. The lock-protected balance check
//! here is the only authoritative one; checks made before reaching the engine
//! are advisory.

use crate::{
    error::{Error, Result},
    store::{AccountStore, UnitOfWork},
    types::{
        amount_violation, Account, AccountId, Charge, ChargeLeg, NewAccount, NewCharge,
        TransactionKind, MAX_BALANCE,
    },
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Transactional ledger operations
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait LedgerEngine: Send + Sync {
    /// Insert a zero-balance account
    async fn create_account(&self, email: &str, currency: &str, id: AccountId) -> Result<()>;

    /// Deposit: move `amount` from `system` to `user`, returning the new user balance
    async fn credit_user(&self, amount: Decimal, user: AccountId, system: AccountId)
        -> Result<Decimal>;

    /// Withdrawal: move `amount` from `user` to `system`, returning the new user balance
    async fn debit_user(&self, amount: Decimal, user: AccountId, system: AccountId)
        -> Result<Decimal>;

    /// Fetch an account, `NotFound` when absent
    async fn get_account(&self, id: AccountId) -> Result<Account>;

    /// Charges against an account in chronological order
    async fn get_account_charges(&self, id: AccountId) -> Result<Vec<Charge>>;
}

/// [`LedgerEngine`] over any [`AccountStore`]
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn AccountStore>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}

impl Ledger {
    /// Create a ledger over `store`
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self { store }
    }

    async fn transfer(
        &self,
        kind: TransactionKind,
        amount: Decimal,
        user: AccountId,
        system: AccountId,
    ) -> Result<Decimal> {
        if system.is_zero() {
            return Err(Error::Internal(format!(
                "{} for account {} has no system account",
                kind, user
            )));
        }
        if let Some(violation) = amount_violation(amount) {
            return Err(Error::bad_request("amount", violation));
        }

        let started = Instant::now();
        let mut uow = self.store.begin().await?;

        match apply(uow.as_mut(), kind, amount, user, system).await {
            Ok(balance) => {
                uow.commit().await?;
                debug!(
                    account_id = %user,
                    kind = %kind,
                    amount = %amount,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Transfer committed"
                );
                Ok(balance)
            }
            Err(err) => {
                if let Err(rollback_err) = uow.rollback().await {
                    error!(
                        account_id = %user,
                        error = %rollback_err,
                        "Rollback failed after {}", err
                    );
                }
                Err(err)
            }
        }
    }
}

/// Stage one double-entry transfer inside `uow`
async fn apply(
    uow: &mut dyn UnitOfWork,
    kind: TransactionKind,
    amount: Decimal,
    user: AccountId,
    system: AccountId,
) -> Result<Decimal> {
    let transaction_id = uow.insert_transaction(kind).await?;

    let (debited, credited) = match kind {
        TransactionKind::Deposit => (system, user),
        TransactionKind::Withdrawal => (user, system),
    };
    uow.insert_charge(&NewCharge {
        transaction_id,
        account_id: debited,
        leg: ChargeLeg::Debit,
        amount,
    })
    .await?;
    uow.insert_charge(&NewCharge {
        transaction_id,
        account_id: credited,
        leg: ChargeLeg::Credit,
        amount,
    })
    .await?;

    // Serializes every mutator of this account until commit or rollback
    let balance = uow.lock_balance(user).await?;

    let new_balance = match kind {
        TransactionKind::Deposit => balance
            .checked_add(amount)
            .filter(|b| *b <= MAX_BALANCE)
            .ok_or_else(|| Error::bad_request("amount", "too large"))?,
        TransactionKind::Withdrawal => balance
            .checked_sub(amount)
            .ok_or_else(|| Error::bad_request("amount", "too large"))?,
    };
    if new_balance < Decimal::ZERO {
        return Err(Error::insufficient_balance());
    }

    uow.set_balance(user, new_balance).await?;
    Ok(new_balance)
}

#[async_trait]
impl LedgerEngine for Ledger {
    async fn create_account(&self, email: &str, currency: &str, id: AccountId) -> Result<()> {
        self.store
            .insert_account(&NewAccount {
                id,
                email: email.to_string(),
                currency: currency.to_string(),
            })
            .await?;

        info!(account_id = %id, currency = currency, "Account created");
        Ok(())
    }

    async fn credit_user(
        &self,
        amount: Decimal,
        user: AccountId,
        system: AccountId,
    ) -> Result<Decimal> {
        self.transfer(TransactionKind::Deposit, amount, user, system)
            .await
    }

    async fn debit_user(
        &self,
        amount: Decimal,
        user: AccountId,
        system: AccountId,
    ) -> Result<Decimal> {
        self.transfer(TransactionKind::Withdrawal, amount, user, system)
            .await
    }

    async fn get_account(&self, id: AccountId) -> Result<Account> {
        self.store
            .fetch_account(id)
            .await?
            .ok_or(Error::NotFound(id))
    }

    async fn get_account_charges(&self, id: AccountId) -> Result<Vec<Charge>> {
        self.store.fetch_charges(id).await
    }
}
