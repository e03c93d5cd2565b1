//! Request validation
//!
//! Rejects malformed, unauthorized and rule-violating requests before they
//! reach the core. Account reads use the ledger's non-locking lookups, so the
//! balance check on withdrawals is advisory only: the engine re-checks under
//! the row lock.

use super::Layer;
use crate::errors::{ServiceError, ServiceResult};
use crate::models::{
    AccountRequest, CreateAccountRequest, Statement, SystemAccounts, TransferRequest,
};
use crate::service::AccountService;
use async_trait::async_trait;
use lazy_static::lazy_static;
use ledger_core::{amount_violation, Account, AccountId, FieldErrors, LedgerEngine};
use regex::Regex;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error};

lazy_static! {
    static ref EMAIL_RE: Regex =
        Regex::new(r"^[\w\.-]+@[a-zA-Z\d\.-]+\.[a-zA-Z]{2,}$").expect("email pattern compiles");
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

pub struct ValidationLayer {
    ledger: Arc<dyn LedgerEngine>,
    system_accounts: Arc<SystemAccounts>,
}

impl ValidationLayer {
    pub fn new(ledger: Arc<dyn LedgerEngine>, system_accounts: Arc<SystemAccounts>) -> Self {
        Self {
            ledger,
            system_accounts,
        }
    }
}

impl Layer for ValidationLayer {
    fn layer(&self, inner: Arc<dyn AccountService>) -> Arc<dyn AccountService> {
        Arc::new(Validation {
            inner,
            ledger: self.ledger.clone(),
            system_accounts: self.system_accounts.clone(),
        })
    }
}

pub struct Validation {
    inner: Arc<dyn AccountService>,
    ledger: Arc<dyn LedgerEngine>,
    system_accounts: Arc<SystemAccounts>,
}

impl Validation {
    /// Resolve the account and check the caller's email against the one of record
    async fn owned_account(&self, email: &str, account_id: AccountId) -> ServiceResult<Account> {
        let account = self.ledger.get_account(account_id).await?;
        if account.email != email {
            debug!(account_id = %account_id, "Owner email mismatch");
            return Err(ServiceError::bad_request("email", "mismatch"));
        }
        Ok(account)
    }

    /// Checks shared by deposits and withdrawals; returns the target account
    async fn check_transfer(&self, req: &TransferRequest) -> ServiceResult<Account> {
        let mut fields = FieldErrors::default();
        if let Some(violation) = amount_violation(req.amount) {
            fields.insert("amount", violation);
        }
        if req.email.trim().is_empty() {
            fields.insert("email", "missing/invalid");
        }
        if self.system_accounts.is_system_account(req.account_id) {
            fields.insert("acctID", "system account not allowed");
        }
        if !fields.is_empty() {
            return Err(ServiceError::BadRequest(fields));
        }

        let account = self.owned_account(&req.email, req.account_id).await?;

        if self.system_accounts.get(&account.currency).is_none() {
            error!(
                account_id = %account.id,
                currency = %account.currency,
                "Account currency has no system account"
            );
            return Err(ServiceError::Internal(format!(
                "no system account for {}",
                account.currency
            )));
        }
        Ok(account)
    }

    fn check_owner_email(email: &str) -> ServiceResult<()> {
        if email.trim().is_empty() {
            return Err(ServiceError::bad_request("email", "missing/invalid"));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountService for Validation {
    async fn create_account(&self, req: CreateAccountRequest) -> ServiceResult<Account> {
        let mut fields = FieldErrors::default();
        if !is_valid_email(&req.email) {
            fields.insert("email", "invalid");
        }
        if self.system_accounts.get(&req.currency).is_none() {
            fields.insert("currency", "unsupported");
        }
        if !fields.is_empty() {
            return Err(ServiceError::BadRequest(fields));
        }

        self.inner.create_account(req).await
    }

    async fn deposit(&self, mut req: TransferRequest) -> ServiceResult<Decimal> {
        let account = self.check_transfer(&req).await?;
        req.currency = Some(account.currency);
        self.inner.deposit(req).await
    }

    async fn withdraw(&self, mut req: TransferRequest) -> ServiceResult<Decimal> {
        let account = self.check_transfer(&req).await?;

        // Fail fast; the engine's locked check is authoritative
        if account.balance < req.amount {
            return Err(ServiceError::bad_request("amount", "insufficient balance"));
        }

        req.currency = Some(account.currency);
        self.inner.withdraw(req).await
    }

    async fn balance(&self, req: AccountRequest) -> ServiceResult<Decimal> {
        Self::check_owner_email(&req.email)?;
        self.owned_account(&req.email, req.account_id).await?;
        self.inner.balance(req).await
    }

    async fn statement(&self, req: AccountRequest) -> ServiceResult<Statement> {
        Self::check_owner_email(&req.email)?;
        self.owned_account(&req.email, req.account_id).await?;
        self.inner.statement(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::MockAccountService;
    use ledger_core::MockLedgerEngine;
    use mockall::predicate::eq;
    use rust_decimal_macros::dec;

    const USD_SYSTEM: AccountId = AccountId::new(1);
    const USER: AccountId = AccountId::new(1_000);

    fn system_accounts() -> Arc<SystemAccounts> {
        let mut accounts = SystemAccounts::new();
        accounts.insert("USD", USD_SYSTEM);
        Arc::new(accounts)
    }

    fn user_account(currency: &str, balance: Decimal) -> Account {
        Account {
            id: USER,
            email: "a@b.com".to_string(),
            currency: currency.to_string(),
            balance,
        }
    }

    fn ledger_with(account: Account) -> MockLedgerEngine {
        let mut ledger = MockLedgerEngine::new();
        ledger
            .expect_get_account()
            .with(eq(USER))
            .returning(move |_| Ok(account.clone()));
        ledger
    }

    fn validation(inner: MockAccountService, ledger: MockLedgerEngine) -> Arc<dyn AccountService> {
        ValidationLayer::new(Arc::new(ledger), system_accounts()).layer(Arc::new(inner))
    }

    fn field(err: ServiceError, name: &str) -> String {
        match err {
            ServiceError::BadRequest(fields) => fields.get(name).unwrap_or_default().to_string(),
            other => panic!("expected bad request, got {:?}", other),
        }
    }

    #[test]
    fn test_email_pattern() {
        assert!(is_valid_email("a@b.com"));
        assert!(is_valid_email("first.last-1@mail.example.org"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("no-at-sign.com"));
        assert!(!is_valid_email(""));
    }

    #[tokio::test]
    async fn test_create_account_rejects_bad_input_without_reaching_core() {
        let mut inner = MockAccountService::new();
        inner.expect_create_account().never();
        let service = validation(inner, MockLedgerEngine::new());

        let err = service
            .create_account(CreateAccountRequest {
                email: "not-an-email".to_string(),
                currency: "XYZ".to_string(),
            })
            .await
            .unwrap_err();

        match err {
            ServiceError::BadRequest(fields) => {
                assert_eq!(fields.get("email"), Some("invalid"));
                assert_eq!(fields.get("currency"), Some("unsupported"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_account_passes_valid_request() {
        let mut inner = MockAccountService::new();
        inner
            .expect_create_account()
            .times(1)
            .returning(|req| {
                Ok(Account {
                    id: USER,
                    email: req.email,
                    currency: req.currency,
                    balance: Decimal::ZERO,
                })
            });
        let service = validation(inner, MockLedgerEngine::new());

        let account = service
            .create_account(CreateAccountRequest {
                email: "a@b.com".to_string(),
                currency: "usd".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(account.id, USER);
    }

    #[tokio::test]
    async fn test_negative_amount_rejected_without_store_access() {
        let mut inner = MockAccountService::new();
        inner.expect_deposit().never();
        let mut ledger = MockLedgerEngine::new();
        ledger.expect_get_account().never();
        let service = validation(inner, ledger);

        let err = service
            .deposit(TransferRequest::new(USER, dec!(-1), "a@b.com"))
            .await
            .unwrap_err();
        assert_eq!(field(err, "amount"), "negative");
    }

    #[tokio::test]
    async fn test_unpersistable_amounts_rejected_without_store_access() {
        let mut inner = MockAccountService::new();
        inner.expect_deposit().never();
        inner.expect_withdraw().never();
        let mut ledger = MockLedgerEngine::new();
        ledger.expect_get_account().never();
        let service = validation(inner, ledger);

        let err = service
            .deposit(TransferRequest::new(USER, dec!(0.00001), "a@b.com"))
            .await
            .unwrap_err();
        assert_eq!(field(err, "amount"), "too many decimal places");

        let err = service
            .withdraw(TransferRequest::new(USER, Decimal::MAX, "a@b.com"))
            .await
            .unwrap_err();
        assert_eq!(field(err, "amount"), "too large");
    }

    #[tokio::test]
    async fn test_system_account_target_rejected() {
        let mut inner = MockAccountService::new();
        inner.expect_withdraw().never();
        let mut ledger = MockLedgerEngine::new();
        ledger.expect_get_account().never();
        let service = validation(inner, ledger);

        let err = service
            .withdraw(TransferRequest::new(USD_SYSTEM, dec!(1), "a@b.com"))
            .await
            .unwrap_err();
        assert_eq!(field(err, "acctID"), "system account not allowed");
    }

    #[tokio::test]
    async fn test_email_mismatch_rejected() {
        let mut inner = MockAccountService::new();
        inner.expect_deposit().never();
        inner.expect_balance().never();
        let service = validation(inner, ledger_with(user_account("USD", dec!(10))));

        let err = service
            .deposit(TransferRequest::new(USER, dec!(1), "intruder@b.com"))
            .await
            .unwrap_err();
        assert_eq!(field(err, "email"), "mismatch");

        let err = service
            .balance(AccountRequest::new(USER, "intruder@b.com"))
            .await
            .unwrap_err();
        assert_eq!(field(err, "email"), "mismatch");
    }

    #[tokio::test]
    async fn test_missing_account_propagates_not_found() {
        let mut ledger = MockLedgerEngine::new();
        ledger
            .expect_get_account()
            .returning(|id| Err(ledger_core::Error::NotFound(id)));
        let service = validation(MockAccountService::new(), ledger);

        let err = service
            .statement(AccountRequest::new(USER, "a@b.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(id) if id == USER));
    }

    #[tokio::test]
    async fn test_deposit_injects_currency() {
        let mut inner = MockAccountService::new();
        inner
            .expect_deposit()
            .withf(|req| req.currency.as_deref() == Some("USD"))
            .times(1)
            .returning(|_| Ok(dec!(15)));
        let service = validation(inner, ledger_with(user_account("USD", dec!(10))));

        let balance = service
            .deposit(TransferRequest::new(USER, dec!(5), "a@b.com"))
            .await
            .unwrap();
        assert_eq!(balance, dec!(15));
    }

    #[tokio::test]
    async fn test_withdraw_advisory_balance_check() {
        let mut inner = MockAccountService::new();
        inner.expect_withdraw().never();
        let service = validation(inner, ledger_with(user_account("USD", dec!(10))));

        let err = service
            .withdraw(TransferRequest::new(USER, dec!(10.01), "a@b.com"))
            .await
            .unwrap_err();
        assert_eq!(field(err, "amount"), "insufficient balance");
    }

    #[tokio::test]
    async fn test_currency_without_system_account_is_internal() {
        let mut inner = MockAccountService::new();
        inner.expect_deposit().never();
        let service = validation(inner, ledger_with(user_account("GBP", dec!(10))));

        let err = service
            .deposit(TransferRequest::new(USER, dec!(1), "a@b.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Internal(_)));
    }

    #[tokio::test]
    async fn test_empty_owner_email_rejected() {
        let service = validation(MockAccountService::new(), MockLedgerEngine::new());
        let err = service
            .balance(AccountRequest::new(USER, " "))
            .await
            .unwrap_err();
        assert_eq!(field(err, "email"), "missing/invalid");
    }
}
