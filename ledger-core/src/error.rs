//! Error types for the ledger

use crate::types::AccountId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Caller-correctable business rule violation, tagged by field
    #[error("missing/invalid params: {0}")]
    BadRequest(FieldErrors),

    /// Referenced account does not exist
    #[error("record not found: {0}")]
    NotFound(AccountId),

    /// Store failure annotated with the operation that failed
    #[error("{context}: {source}")]
    Store {
        /// Operation being performed
        context: &'static str,
        /// Underlying driver error
        #[source]
        source: sqlx::Error,
    },

    /// Invariant violation not attributable to the caller
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Single-field bad request
    pub fn bad_request(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::BadRequest(FieldErrors::single(field, message))
    }

    /// Shorthand for the ledger's authoritative balance floor violation
    pub fn insufficient_balance() -> Self {
        Self::bad_request("amount", "insufficient balance")
    }
}

/// Field name to message map carried by bad requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<String, String>);

impl FieldErrors {
    /// Map with a single entry
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(field.into(), message.into());
        Self(fields)
    }

    /// Record a message for `field`, replacing any earlier one
    pub fn insert(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.insert(field.into(), message.into());
    }

    /// True when no field has been recorded
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Message recorded for `field`
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    /// Iterate over (field, message) pairs in field order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, message) in &self.0 {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", field, message)?;
            first = false;
        }
        Ok(())
    }
}

/// Attach operation context to raw driver errors
pub trait StoreContext<T> {
    /// Wrap the error as [`Error::Store`] with `context`
    fn context(self, context: &'static str) -> Result<T>;
}

impl<T> StoreContext<T> for std::result::Result<T, sqlx::Error> {
    fn context(self, context: &'static str) -> Result<T> {
        self.map_err(|source| Error::Store { context, source })
    }
}
