use chrono::NaiveDate;
use ledger_core::AccountId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ===== Service Requests =====

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreateAccountRequest {
    pub email: String,
    pub currency: String,
}

/// Deposit or withdrawal
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub account_id: AccountId,
    pub amount: Decimal,
    /// Caller-supplied owner email
    pub email: String,
    /// Currency of record, filled in by validation before the core sees it
    pub currency: Option<String>,
}

impl TransferRequest {
    pub fn new(account_id: AccountId, amount: Decimal, email: impl Into<String>) -> Self {
        Self {
            account_id,
            amount,
            email: email.into(),
            currency: None,
        }
    }
}

/// Read of a single account on behalf of its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRequest {
    pub account_id: AccountId,
    pub email: String,
}

impl AccountRequest {
    pub fn new(account_id: AccountId, email: impl Into<String>) -> Self {
        Self {
            account_id,
            email: email.into(),
        }
    }
}

// ===== Statement =====

/// One charge folded into the running balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatementLine {
    pub date: NaiveDate,
    pub debit: Option<Decimal>,
    pub credit: Option<Decimal>,
    pub balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statement {
    #[serde(rename = "acctID")]
    pub account_id: AccountId,
    pub lines: Vec<StatementLine>,
}

// ===== System Accounts =====

/// Pooled counter-leg account per supported currency
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemAccounts {
    by_currency: HashMap<String, AccountId>,
}

impl SystemAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` for `currency`; codes are case-insensitive
    pub fn insert(&mut self, currency: &str, id: AccountId) {
        self.by_currency.insert(currency.to_ascii_uppercase(), id);
    }

    pub fn get(&self, currency: &str) -> Option<AccountId> {
        self.by_currency.get(&currency.to_ascii_uppercase()).copied()
    }

    pub fn is_system_account(&self, id: AccountId) -> bool {
        self.by_currency.values().any(|sys| *sys == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, AccountId)> {
        self.by_currency.iter().map(|(c, id)| (c.as_str(), *id))
    }

    pub fn len(&self) -> usize {
        self.by_currency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_currency.is_empty()
    }
}

impl FromIterator<(String, AccountId)> for SystemAccounts {
    fn from_iter<I: IntoIterator<Item = (String, AccountId)>>(iter: I) -> Self {
        let mut accounts = Self::new();
        for (currency, id) in iter {
            accounts.insert(&currency, id);
        }
        accounts
    }
}

// ===== HTTP Bodies =====

#[derive(Debug, Clone, Deserialize)]
pub struct TransferBody {
    pub amount: Decimal,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAccountResponse {
    #[serde(rename = "acctID")]
    pub account_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub balance: String,
}

impl From<Decimal> for BalanceResponse {
    fn from(balance: Decimal) -> Self {
        Self {
            balance: balance.normalize().to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
