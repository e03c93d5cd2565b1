//! Account service contract and its core implementation
//!
//! Every middleware layer implements [`AccountService`] and wraps another
//! one, so the whole stack is a single trait object.

use crate::errors::{ServiceError, ServiceResult, StartupError};
use crate::id::IdGenerator;
use crate::metrics::LEDGER_OPERATION_DURATION;
use crate::models::{
    AccountRequest, CreateAccountRequest, Statement, StatementLine, SystemAccounts,
    TransferRequest,
};
use async_trait::async_trait;
use ledger_core::{Account, AccountId, Charge, ChargeLeg, LedgerEngine};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountService: Send + Sync {
    async fn create_account(&self, req: CreateAccountRequest) -> ServiceResult<Account>;

    /// Returns the new balance
    async fn deposit(&self, req: TransferRequest) -> ServiceResult<Decimal>;

    /// Returns the new balance
    async fn withdraw(&self, req: TransferRequest) -> ServiceResult<Decimal>;

    async fn balance(&self, req: AccountRequest) -> ServiceResult<Decimal>;

    async fn statement(&self, req: AccountRequest) -> ServiceResult<Statement>;
}

/// Innermost service: id issuance and routing onto the ledger engine
pub struct CoreService {
    ledger: Arc<dyn LedgerEngine>,
    system_accounts: Arc<SystemAccounts>,
    ids: IdGenerator,
}

impl CoreService {
    /// Build the core, refusing to start if any configured system account
    /// is missing or holds a different currency than its key.
    pub async fn new(
        ledger: Arc<dyn LedgerEngine>,
        system_accounts: Arc<SystemAccounts>,
        ids: IdGenerator,
    ) -> Result<Self, StartupError> {
        for (currency, id) in system_accounts.iter() {
            let account = match ledger.get_account(id).await {
                Ok(account) => account,
                Err(ledger_core::Error::NotFound(_)) => {
                    return Err(StartupError::SystemAccountMissing {
                        currency: currency.to_string(),
                        id,
                    })
                }
                Err(e) => return Err(e.into()),
            };

            if !account.currency.eq_ignore_ascii_case(currency) {
                return Err(StartupError::CurrencyMismatch {
                    currency: currency.to_string(),
                    id,
                    actual: account.currency,
                });
            }
            info!(currency = currency, account_id = %id, "System account verified");
        }

        Ok(Self {
            ledger,
            system_accounts,
            ids,
        })
    }

    /// Zero when the currency is absent or unsupported; the engine rejects it
    fn system_account_for(&self, currency: Option<&str>) -> AccountId {
        currency
            .and_then(|c| self.system_accounts.get(c))
            .unwrap_or_default()
    }
}

#[async_trait]
impl AccountService for CoreService {
    async fn create_account(&self, req: CreateAccountRequest) -> ServiceResult<Account> {
        let id = self.ids.next_id();
        let currency = req.currency.to_ascii_uppercase();

        let timer = LEDGER_OPERATION_DURATION
            .with_label_values(&["create_account"])
            .start_timer();
        self.ledger.create_account(&req.email, &currency, id).await?;
        timer.observe_duration();

        Ok(Account {
            id,
            email: req.email,
            currency,
            balance: Decimal::ZERO,
        })
    }

    async fn deposit(&self, req: TransferRequest) -> ServiceResult<Decimal> {
        let system = self.system_account_for(req.currency.as_deref());

        let timer = LEDGER_OPERATION_DURATION
            .with_label_values(&["credit_user"])
            .start_timer();
        let balance = self
            .ledger
            .credit_user(req.amount, req.account_id, system)
            .await?;
        timer.observe_duration();

        Ok(balance.normalize())
    }

    async fn withdraw(&self, req: TransferRequest) -> ServiceResult<Decimal> {
        let system = self.system_account_for(req.currency.as_deref());

        let timer = LEDGER_OPERATION_DURATION
            .with_label_values(&["debit_user"])
            .start_timer();
        let balance = self
            .ledger
            .debit_user(req.amount, req.account_id, system)
            .await?;
        timer.observe_duration();

        Ok(balance.normalize())
    }

    async fn balance(&self, req: AccountRequest) -> ServiceResult<Decimal> {
        let account = self.ledger.get_account(req.account_id).await?;
        Ok(account.balance.normalize())
    }

    async fn statement(&self, req: AccountRequest) -> ServiceResult<Statement> {
        let started = Instant::now();
        let charges = self.ledger.get_account_charges(req.account_id).await?;
        let lines = fold_statement(charges)?;

        debug!(
            account_id = %req.account_id,
            lines = lines.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Statement assembled"
        );
        Ok(Statement {
            account_id: req.account_id,
            lines,
        })
    }
}

/// Fold charges in chronological order into running-balance lines
pub fn fold_statement(mut charges: Vec<Charge>) -> ServiceResult<Vec<StatementLine>> {
    charges.sort_by_key(|c| (c.created_at, c.transaction_id));

    let mut running = Decimal::ZERO;
    charges
        .into_iter()
        .map(|charge| {
            running = running.checked_add(charge.signed_amount()).ok_or_else(|| {
                error!(
                    account_id = %charge.account_id,
                    transaction_id = %charge.transaction_id,
                    "Statement running balance overflowed"
                );
                ServiceError::Internal("statement balance overflow".to_string())
            })?;
            let amount = Some(charge.amount.normalize());
            let (debit, credit) = match charge.leg {
                ChargeLeg::Debit => (amount, None),
                ChargeLeg::Credit => (None, amount),
            };
            Ok(StatementLine {
                date: charge.created_at.date_naive(),
                debit,
                credit,
                balance: running.normalize(),
            })
        })
        .collect()
}
