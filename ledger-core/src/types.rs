//! Core types for the ledger
//!
//! All types are designed for:
//! - Exact arithmetic (Decimal for money)
//! - Cheap copies of identifiers across task boundaries
//! - A one-to-one mapping onto the persisted rows

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Public account identifier.
///
/// Opaque 64-bit value, roughly time-ordered when issued by the account
/// service. Zero is never a valid account.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AccountId(i64);

impl AccountId {
    /// Wrap a raw identifier
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Raw value
    pub const fn as_i64(&self) -> i64 {
        self.0
    }

    /// True for the zero value, which never resolves to an account
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AccountId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(AccountId)
    }
}

impl From<i64> for AccountId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Ledger account row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Public identifier
    pub id: AccountId,

    /// Owner email of record
    pub email: String,

    /// ISO 4217 currency code, upper case
    pub currency: String,

    /// Current balance
    pub balance: Decimal,
}

/// Account to be inserted with a zero balance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    /// Identifier issued by the caller
    pub id: AccountId,

    /// Owner email
    pub email: String,

    /// Currency code
    pub currency: String,
}

/// Store-assigned transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub i64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a ledger transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Value flows from the system account to the user
    Deposit,
    /// Value flows from the user to the system account
    Withdrawal,
}

impl TransactionKind {
    /// Persisted representation
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdrawal => "withdrawal",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TransactionKind::Deposit),
            "withdrawal" => Ok(TransactionKind::Withdrawal),
            other => Err(format!("unknown transaction type `{}`", other)),
        }
    }
}

/// Side of a double-entry charge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargeLeg {
    /// Value leaves the account
    Debit,
    /// Value enters the account
    Credit,
}

impl ChargeLeg {
    /// Persisted representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeLeg::Debit => "debit",
            ChargeLeg::Credit => "credit",
        }
    }
}

impl fmt::Display for ChargeLeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChargeLeg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debit" => Ok(ChargeLeg::Debit),
            "credit" => Ok(ChargeLeg::Credit),
            other => Err(format!("unknown charge type `{}`", other)),
        }
    }
}

/// Decimal places kept by the persisted `NUMERIC(20, 4)` amount columns
pub const AMOUNT_SCALE: u32 = 4;

/// Largest balance or amount the persisted columns hold
pub const MAX_BALANCE: Decimal = dec!(9999999999999999.9999);

/// Reason `amount` cannot be posted, or `None` when it can
pub fn amount_violation(amount: Decimal) -> Option<&'static str> {
    if amount < Decimal::ZERO {
        Some("negative")
    } else if amount.normalize().scale() > AMOUNT_SCALE {
        Some("too many decimal places")
    } else if amount > MAX_BALANCE {
        Some("too large")
    } else {
        None
    }
}

/// Appended transaction header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Identifier
    pub id: TransactionId,

    /// Deposit or withdrawal
    pub kind: TransactionKind,
}

/// Charge to be staged inside a unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCharge {
    /// Owning transaction
    pub transaction_id: TransactionId,

    /// Charged account
    pub account_id: AccountId,

    /// Debit or credit
    pub leg: ChargeLeg,

    /// Non-negative amount
    pub amount: Decimal,
}

/// One leg of a committed double-entry transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charge {
    /// Owning transaction
    pub transaction_id: TransactionId,

    /// Charged account
    pub account_id: AccountId,

    /// Debit or credit
    pub leg: ChargeLeg,

    /// Amount
    pub amount: Decimal,

    /// Commit-time timestamp
    pub created_at: DateTime<Utc>,
}

impl Charge {
    /// Effect of this charge on the charged account's balance
    pub fn signed_amount(&self) -> Decimal {
        match self.leg {
            ChargeLeg::Credit => self.amount,
            ChargeLeg::Debit => -self.amount,
        }
    }
}
