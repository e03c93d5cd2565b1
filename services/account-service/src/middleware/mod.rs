//! Middleware stack around the core service
//!
//! Each layer is an [`AccountService`] wrapping an inner one. The order is
//! fixed by [`build_stack`]:
//!
//! ```text
//! transport → Admission → Circuit Breaker → Validation → Core
//! ```
//!
//! Admission sheds load before anything else runs. The breaker sees every call
//! that was admitted, so validation reads against a failing store trip it too.

pub mod admission;
pub mod circuit;
pub mod validation;

use crate::errors::StartupError;
use crate::models::SystemAccounts;
use crate::service::AccountService;
use ledger_core::LedgerEngine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use admission::{AdmissionConfig, AdmissionLayer};
pub use circuit::{BreakerConfig, CircuitBreaker, CircuitBreakerLayer, CircuitState, Snapshot};
pub use validation::ValidationLayer;

/// Wraps a service in one more layer
pub trait Layer: Send + Sync {
    fn layer(&self, inner: Arc<dyn AccountService>) -> Arc<dyn AccountService>;
}

/// Composes layers; the first layer added is the outermost
#[derive(Default)]
pub struct ServiceBuilder {
    layers: Vec<Box<dyn Layer>>,
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer<L: Layer + 'static>(mut self, layer: L) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn service(self, core: Arc<dyn AccountService>) -> Arc<dyn AccountService> {
        self.layers
            .iter()
            .rev()
            .fold(core, |inner, layer| layer.layer(inner))
    }
}

/// Logical endpoint, one admission gate and breaker each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    CreateAccount,
    Deposit,
    Withdraw,
    Balance,
    Statement,
}

impl Endpoint {
    pub const ALL: [Endpoint; 5] = [
        Endpoint::CreateAccount,
        Endpoint::Deposit,
        Endpoint::Withdraw,
        Endpoint::Balance,
        Endpoint::Statement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::CreateAccount => "create_account",
            Endpoint::Deposit => "deposit",
            Endpoint::Withdraw => "withdraw",
            Endpoint::Balance => "balance",
            Endpoint::Statement => "statement",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per [`Endpoint`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerEndpoint<T> {
    pub create_account: T,
    pub deposit: T,
    pub withdraw: T,
    pub balance: T,
    pub statement: T,
}

impl<T> PerEndpoint<T> {
    pub fn from_fn(mut f: impl FnMut(Endpoint) -> T) -> Self {
        Self {
            create_account: f(Endpoint::CreateAccount),
            deposit: f(Endpoint::Deposit),
            withdraw: f(Endpoint::Withdraw),
            balance: f(Endpoint::Balance),
            statement: f(Endpoint::Statement),
        }
    }

    pub fn get(&self, endpoint: Endpoint) -> &T {
        match endpoint {
            Endpoint::CreateAccount => &self.create_account,
            Endpoint::Deposit => &self.deposit,
            Endpoint::Withdraw => &self.withdraw,
            Endpoint::Balance => &self.balance,
            Endpoint::Statement => &self.statement,
        }
    }

    pub fn try_map<U, E>(
        &self,
        mut f: impl FnMut(Endpoint, &T) -> Result<U, E>,
    ) -> Result<PerEndpoint<U>, E> {
        Ok(PerEndpoint {
            create_account: f(Endpoint::CreateAccount, &self.create_account)?,
            deposit: f(Endpoint::Deposit, &self.deposit)?,
            withdraw: f(Endpoint::Withdraw, &self.withdraw)?,
            balance: f(Endpoint::Balance, &self.balance)?,
            statement: f(Endpoint::Statement, &self.statement)?,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (Endpoint, &T)> {
        Endpoint::ALL.into_iter().map(move |e| (e, self.get(e)))
    }
}

/// Assembled service plus the handles the transport needs
pub struct Stack {
    pub service: Arc<dyn AccountService>,
    pub breakers: Arc<PerEndpoint<CircuitBreaker>>,
}

/// Wrap `core` as Admission → Circuit Breaker → Validation → Core
pub fn build_stack(
    core: Arc<dyn AccountService>,
    ledger: Arc<dyn LedgerEngine>,
    system_accounts: Arc<SystemAccounts>,
    limits: &PerEndpoint<AdmissionConfig>,
    breakers: &PerEndpoint<BreakerConfig>,
) -> Result<Stack, StartupError> {
    let admission = AdmissionLayer::new(limits)?;
    let circuit = CircuitBreakerLayer::new(breakers)?;
    let breakers = circuit.breakers();

    let service = ServiceBuilder::new()
        .layer(admission)
        .layer(circuit)
        .layer(ValidationLayer::new(ledger, system_accounts))
        .service(core);

    Ok(Stack { service, breakers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ServiceResult;
    use crate::models::{AccountRequest, CreateAccountRequest, Statement, TransferRequest};
    use async_trait::async_trait;
    use ledger_core::{Account, AccountId};
    use parking_lot::Mutex;
    use rust_decimal::Decimal;

    /// Records the order in which layers see a call
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    struct Recorded {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        inner: Arc<dyn AccountService>,
    }

    impl Layer for Recorder {
        fn layer(&self, inner: Arc<dyn AccountService>) -> Arc<dyn AccountService> {
            Arc::new(Recorded {
                name: self.name,
                log: self.log.clone(),
                inner,
            })
        }
    }

    #[async_trait]
    impl AccountService for Recorded {
        async fn create_account(&self, req: CreateAccountRequest) -> ServiceResult<Account> {
            self.log.lock().push(self.name);
            self.inner.create_account(req).await
        }
        async fn deposit(&self, req: TransferRequest) -> ServiceResult<Decimal> {
            self.inner.deposit(req).await
        }
        async fn withdraw(&self, req: TransferRequest) -> ServiceResult<Decimal> {
            self.inner.withdraw(req).await
        }
        async fn balance(&self, req: AccountRequest) -> ServiceResult<Decimal> {
            self.log.lock().push(self.name);
            self.inner.balance(req).await
        }
        async fn statement(&self, req: AccountRequest) -> ServiceResult<Statement> {
            self.inner.statement(req).await
        }
    }

    #[tokio::test]
    async fn test_first_layer_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut core = crate::service::MockAccountService::new();
        core.expect_balance().returning(|_| Ok(Decimal::ONE));

        let service = ServiceBuilder::new()
            .layer(Recorder { name: "outer", log: log.clone() })
            .layer(Recorder { name: "middle", log: log.clone() })
            .layer(Recorder { name: "inner", log: log.clone() })
            .service(Arc::new(core));

        let balance = service
            .balance(AccountRequest::new(AccountId::new(1), "a@b.com"))
            .await
            .unwrap();
        assert_eq!(balance, Decimal::ONE);
        assert_eq!(*log.lock(), vec!["outer", "middle", "inner"]);
    }

    #[test]
    fn test_per_endpoint_lookup() {
        let names = PerEndpoint::from_fn(|e| e.as_str().len());
        assert_eq!(*names.get(Endpoint::Deposit), "deposit".len());
        assert_eq!(names.iter().count(), 5);

        let doubled: Result<PerEndpoint<usize>, ()> = names.try_map(|_, n| Ok(n * 2));
        assert_eq!(doubled.unwrap().statement, "statement".len() * 2);
    }
}
