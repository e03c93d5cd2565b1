//! Integration tests for the account service
//!
//! Runs the full stack (admission → breaker → validation → core → ledger)
//! over the in-memory store:
//! - Account lifecycle end to end
//! - Concurrent withdrawals against one account
//! - Load shedding and breaker trips
//! - HTTP surface and error bodies

use account_service::{
    build_stack,
    handlers::{self, AppState},
    id::IdGenerator,
    middleware::{AdmissionConfig, BreakerConfig, CircuitState, PerEndpoint},
    models::{AccountRequest, CreateAccountRequest, SystemAccounts, TransferRequest},
    AccountService, CoreService, ServiceError, Stack,
};
use actix_web::{http::StatusCode, test, App};
use ledger_core::{AccountId, FailPoint, Ledger, LedgerEngine, MemoryStore};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const USD_SYSTEM: AccountId = AccountId::new(1);
const EUR_SYSTEM: AccountId = AccountId::new(2);

struct TestEnvironment {
    store: MemoryStore,
    stack: Stack,
}

impl TestEnvironment {
    async fn new() -> Self {
        Self::with_limits(AdmissionConfig {
            slo_ms: 2_000,
            rate: 10_000,
            burst: 10_000,
        })
        .await
    }

    async fn with_limits(limits: AdmissionConfig) -> Self {
        Self::build(MemoryStore::new(), limits).await
    }

    async fn build(store: MemoryStore, limits: AdmissionConfig) -> Self {
        let ledger: Arc<dyn LedgerEngine> = Arc::new(Ledger::new(Arc::new(store.clone())));
        ledger
            .create_account("usd@ledger.local", "USD", USD_SYSTEM)
            .await
            .unwrap();
        ledger
            .create_account("eur@ledger.local", "EUR", EUR_SYSTEM)
            .await
            .unwrap();

        let mut system_accounts = SystemAccounts::new();
        system_accounts.insert("USD", USD_SYSTEM);
        system_accounts.insert("EUR", EUR_SYSTEM);
        let system_accounts = Arc::new(system_accounts);

        let core = CoreService::new(
            ledger.clone(),
            system_accounts.clone(),
            IdGenerator::new(7).unwrap(),
        )
        .await
        .unwrap();

        let breakers = PerEndpoint::from_fn(|_| BreakerConfig {
            failure_ratio: 0.5,
            window: 4,
            min_calls: 4,
            cooldown_ms: 60_000,
            half_open_trials: 1,
        });

        let stack = build_stack(
            Arc::new(core),
            ledger,
            system_accounts,
            &PerEndpoint::from_fn(|_| limits),
            &breakers,
        )
        .unwrap();

        Self { store, stack }
    }

    fn service(&self) -> &Arc<dyn AccountService> {
        &self.stack.service
    }

    async fn open_account(&self, email: &str, currency: &str) -> AccountId {
        self.service()
            .create_account(CreateAccountRequest {
                email: email.to_string(),
                currency: currency.to_string(),
            })
            .await
            .unwrap()
            .id
    }
}

#[tokio::test]
async fn test_end_to_end_account_lifecycle() {
    let env = TestEnvironment::new().await;
    let service = env.service();
    let id = env.open_account("a@b.com", "USD").await;

    let balance = service.balance(AccountRequest::new(id, "a@b.com")).await.unwrap();
    assert_eq!(balance.to_string(), "0");

    let balance = service
        .deposit(TransferRequest::new(id, dec!(100.00), "a@b.com"))
        .await
        .unwrap();
    assert_eq!(balance.to_string(), "100");

    let balance = service
        .withdraw(TransferRequest::new(id, dec!(30.00), "a@b.com"))
        .await
        .unwrap();
    assert_eq!(balance.to_string(), "70");

    let err = service
        .withdraw(TransferRequest::new(id, dec!(1000.00), "a@b.com"))
        .await
        .unwrap_err();
    match err {
        ServiceError::BadRequest(fields) => {
            assert_eq!(fields.get("amount"), Some("insufficient balance"))
        }
        other => panic!("unexpected error {:?}", other),
    }

    let balance = service.balance(AccountRequest::new(id, "a@b.com")).await.unwrap();
    assert_eq!(balance.to_string(), "70");

    let statement = service
        .statement(AccountRequest::new(id, "a@b.com"))
        .await
        .unwrap();
    assert_eq!(statement.lines.len(), 2);
    assert_eq!(statement.lines[0].credit, Some(dec!(100)));
    assert_eq!(statement.lines[1].debit, Some(dec!(30)));
    assert_eq!(statement.lines[1].balance, dec!(70));
}

#[tokio::test]
async fn test_deposit_routes_to_currency_system_account() {
    let env = TestEnvironment::new().await;
    let id = env.open_account("eu@b.com", "eur").await;

    env.service()
        .deposit(TransferRequest::new(id, dec!(12.5), "eu@b.com"))
        .await
        .unwrap();

    let charges = env.store.charges();
    assert_eq!(charges.len(), 2);
    assert!(charges.iter().any(|c| c.account_id == EUR_SYSTEM));
    assert!(!charges.iter().any(|c| c.account_id == USD_SYSTEM));
}

#[tokio::test]
async fn test_validation_rejects_without_store_effects() {
    let env = TestEnvironment::new().await;
    let service = env.service();
    let id = env.open_account("a@b.com", "USD").await;

    let cases = vec![
        TransferRequest::new(id, dec!(-5), "a@b.com"),
        TransferRequest::new(USD_SYSTEM, dec!(5), "usd@ledger.local"),
        TransferRequest::new(id, dec!(5), "someone@else.com"),
    ];
    for req in cases {
        assert!(matches!(
            service.deposit(req).await,
            Err(ServiceError::BadRequest(_))
        ));
    }

    let err = service
        .create_account(CreateAccountRequest {
            email: "a@b.com".to_string(),
            currency: "JPY".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(_)));

    assert!(env.store.transactions().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_withdrawals() {
    let env = TestEnvironment::new().await;
    let id = env.open_account("a@b.com", "USD").await;
    env.service()
        .deposit(TransferRequest::new(id, dec!(50), "a@b.com"))
        .await
        .unwrap();

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let service = env.service().clone();
            tokio::spawn(async move {
                service
                    .withdraw(TransferRequest::new(id, dec!(10), "a@b.com"))
                    .await
            })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(balance) => {
                assert!(balance >= Decimal::ZERO);
                successes += 1;
            }
            Err(ServiceError::BadRequest(fields)) => {
                assert_eq!(fields.get("amount"), Some("insufficient balance"));
            }
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }

    assert_eq!(successes, 5);
    let balance = env
        .service()
        .balance(AccountRequest::new(id, "a@b.com"))
        .await
        .unwrap();
    assert!(balance.is_zero());
}

#[tokio::test]
async fn test_admission_sheds_excess_load() {
    let env = TestEnvironment::with_limits(AdmissionConfig {
        slo_ms: 20,
        rate: 1,
        burst: 2,
    })
    .await;
    let id = env.open_account("a@b.com", "USD").await;

    let req = || AccountRequest::new(id, "a@b.com");
    assert!(env.service().balance(req()).await.is_ok());
    assert!(env.service().balance(req()).await.is_ok());
    assert!(matches!(
        env.service().balance(req()).await,
        Err(ServiceError::ServiceUnavailable(_))
    ));
}

#[tokio::test]
async fn test_store_failures_trip_breaker() {
    let env = TestEnvironment::new().await;
    let id = env.open_account("a@b.com", "USD").await;

    for _ in 0..4 {
        env.store.fail_next(FailPoint::Begin);
        let err = env
            .service()
            .deposit(TransferRequest::new(id, dec!(1), "a@b.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Internal(_)));
    }
    assert_eq!(env.stack.breakers.deposit.state(), CircuitState::Open);

    // Short-circuits even though the store has recovered
    let err = env
        .service()
        .deposit(TransferRequest::new(id, dec!(1), "a@b.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ServiceUnavailable(_)));

    // Other endpoints are unaffected
    assert_eq!(env.stack.breakers.withdraw.state(), CircuitState::Closed);
    assert!(env
        .service()
        .balance(AccountRequest::new(id, "a@b.com"))
        .await
        .is_ok());

    env.stack.breakers.deposit.reset();
    assert!(env
        .service()
        .deposit(TransferRequest::new(id, dec!(1), "a@b.com"))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_deadline_expiries_trip_breaker() {
    // Every store round trip takes 30ms; a deposit needs four before it can finish
    let env = TestEnvironment::build(
        MemoryStore::with_latency(Duration::from_millis(30)),
        AdmissionConfig {
            slo_ms: 100,
            rate: 10_000,
            burst: 10_000,
        },
    )
    .await;
    let id = env.open_account("a@b.com", "USD").await;

    for _ in 0..4 {
        let err = env
            .service()
            .deposit(TransferRequest::new(id, dec!(1), "a@b.com"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::ServiceUnavailable("deadline exceeded")
        ));
    }
    assert_eq!(env.stack.breakers.deposit.state(), CircuitState::Open);

    let err = env
        .service()
        .deposit(TransferRequest::new(id, dec!(1), "a@b.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ServiceUnavailable("circuit open")));

    // Expired transfers were rolled back
    assert!(env.store.transactions().is_empty());
    assert!(env.store.charges().is_empty());
}

#[tokio::test]
async fn test_unpersistable_amounts_rejected() {
    let env = TestEnvironment::new().await;
    let id = env.open_account("a@b.com", "USD").await;

    let err = env
        .service()
        .deposit(TransferRequest::new(id, dec!(0.00001), "a@b.com"))
        .await
        .unwrap_err();
    match err {
        ServiceError::BadRequest(fields) => {
            assert_eq!(fields.get("amount"), Some("too many decimal places"))
        }
        other => panic!("unexpected error {:?}", other),
    }

    let err = env
        .service()
        .deposit(TransferRequest::new(id, Decimal::MAX, "a@b.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(_)));
    assert!(env.store.transactions().is_empty());
}

// ===== HTTP =====

macro_rules! app {
    ($env:expr) => {
        test::init_service(
            App::new()
                .app_data(actix_web::web::Data::new(AppState {
                    service: $env.stack.service.clone(),
                    breakers: $env.stack.breakers.clone(),
                }))
                .configure(handlers::configure_routes),
        )
        .await
    };
}

#[actix_web::test]
async fn test_http_account_flow() {
    let env = TestEnvironment::new().await;
    let app = app!(env);

    let req = test::TestRequest::post()
        .uri("/accounts")
        .set_json(json!({ "email": "a@b.com", "currency": "USD" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: Value = test::read_body_json(resp).await;
    let id = body["acctID"].as_str().unwrap().to_string();

    let req = test::TestRequest::post()
        .uri(&format!("/accounts/{}/deposit", id))
        .set_json(json!({ "amount": "100.00", "email": "a@b.com" }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body, json!({ "balance": "100" }));

    let req = test::TestRequest::post()
        .uri(&format!("/accounts/{}/withdraw", id))
        .set_json(json!({ "amount": "1000", "email": "a@b.com" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body, json!({ "fields": { "amount": "insufficient balance" } }));

    let req = test::TestRequest::get()
        .uri(&format!("/accounts/{}/balance", id))
        .insert_header(("email", "a@b.com"))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body, json!({ "balance": "100" }));

    let req = test::TestRequest::get()
        .uri(&format!("/accounts/{}/statement", id))
        .insert_header(("email", "a@b.com"))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["lines"].as_array().unwrap().len(), 1);
    assert_eq!(body["lines"][0]["credit"], json!("100"));
}

#[actix_web::test]
async fn test_http_error_mapping() {
    let env = TestEnvironment::new().await;
    let app = app!(env);

    let req = test::TestRequest::get()
        .uri("/accounts/12ab/balance")
        .insert_header(("email", "a@b.com"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body, json!({ "fields": { "acctID": "invalid format" } }));

    let req = test::TestRequest::get()
        .uri("/accounts/99/balance")
        .insert_header(("email", "a@b.com"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body, json!({ "id": 99 }));

    let req = test::TestRequest::get()
        .uri("/accounts/99/balance")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body, json!({ "fields": { "email": "missing or invalid" } }));

    let req = test::TestRequest::post()
        .uri("/accounts/99/deposit")
        .insert_header(("content-type", "application/json"))
        .set_payload("{not json")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body, json!({ "fields": { "request body": "malformed JSON" } }));
}

#[actix_web::test]
async fn test_http_operational_endpoints() {
    let env = TestEnvironment::new().await;
    let app = app!(env);

    let req = test::TestRequest::get().uri("/health").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "healthy");

    let req = test::TestRequest::get().uri("/circuit-breakers").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let breakers = body.as_array().unwrap();
    assert_eq!(breakers.len(), 5);
    assert!(breakers.iter().all(|b| b["state"] == "closed"));

    let req = test::TestRequest::get().uri("/metrics").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
}
