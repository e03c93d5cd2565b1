use crate::errors::{ServiceError, ServiceResult};
use crate::metrics::{metrics_handler, REQUESTS_TOTAL, REQUEST_DURATION};
use crate::middleware::{CircuitBreaker, Endpoint, PerEndpoint, Snapshot};
use crate::models::*;
use crate::service::AccountService;
use actix_web::{web, HttpRequest, HttpResponse};
use ledger_core::AccountId;
use std::future::Future;
use std::sync::Arc;
use tracing::error;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<dyn AccountService>,
    pub breakers: Arc<PerEndpoint<CircuitBreaker>>,
}

/// Record outcome and latency for one endpoint call
async fn observe<T, F>(endpoint: Endpoint, call: F) -> ServiceResult<T>
where
    F: Future<Output = ServiceResult<T>>,
{
    let timer = REQUEST_DURATION
        .with_label_values(&[endpoint.as_str()])
        .start_timer();
    let result = call.await;
    timer.observe_duration();

    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    REQUESTS_TOTAL
        .with_label_values(&[endpoint.as_str(), outcome])
        .inc();
    result
}

fn parse_account_id(raw: &str) -> ServiceResult<AccountId> {
    raw.parse()
        .map_err(|_| ServiceError::bad_request("acctID", "invalid format"))
}

fn owner_email(req: &HttpRequest) -> ServiceResult<String> {
    req.headers()
        .get("email")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ServiceError::bad_request("email", "missing or invalid"))
}

// ===== Health Check =====
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ===== Metrics =====
pub async fn metrics() -> HttpResponse {
    match metrics_handler() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

// ===== Circuit Breakers =====
pub async fn circuit_breakers(state: web::Data<AppState>) -> HttpResponse {
    let snapshots: Vec<Snapshot> = state.breakers.iter().map(|(_, cb)| cb.snapshot()).collect();
    HttpResponse::Ok().json(snapshots)
}

// ===== Create Account =====
pub async fn create_account(
    state: web::Data<AppState>,
    body: web::Json<CreateAccountRequest>,
) -> Result<HttpResponse, ServiceError> {
    let account = observe(
        Endpoint::CreateAccount,
        state.service.create_account(body.into_inner()),
    )
    .await?;

    Ok(HttpResponse::Created().json(CreateAccountResponse {
        account_id: account.id.to_string(),
    }))
}

// ===== Deposit =====
pub async fn deposit(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<TransferBody>,
) -> Result<HttpResponse, ServiceError> {
    let account_id = parse_account_id(&path)?;
    let body = body.into_inner();

    let balance = observe(
        Endpoint::Deposit,
        state
            .service
            .deposit(TransferRequest::new(account_id, body.amount, body.email)),
    )
    .await?;

    Ok(HttpResponse::Ok().json(BalanceResponse::from(balance)))
}

// ===== Withdraw =====
pub async fn withdraw(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<TransferBody>,
) -> Result<HttpResponse, ServiceError> {
    let account_id = parse_account_id(&path)?;
    let body = body.into_inner();

    let balance = observe(
        Endpoint::Withdraw,
        state
            .service
            .withdraw(TransferRequest::new(account_id, body.amount, body.email)),
    )
    .await?;

    Ok(HttpResponse::Ok().json(BalanceResponse::from(balance)))
}

// ===== Balance =====
pub async fn balance(
    state: web::Data<AppState>,
    path: web::Path<String>,
    req: HttpRequest,
) -> Result<HttpResponse, ServiceError> {
    let account_id = parse_account_id(&path)?;
    let email = owner_email(&req)?;

    let balance = observe(
        Endpoint::Balance,
        state.service.balance(AccountRequest::new(account_id, email)),
    )
    .await?;

    Ok(HttpResponse::Ok().json(BalanceResponse::from(balance)))
}

// ===== Statement =====
pub async fn statement(
    state: web::Data<AppState>,
    path: web::Path<String>,
    req: HttpRequest,
) -> Result<HttpResponse, ServiceError> {
    let account_id = parse_account_id(&path)?;
    let email = owner_email(&req)?;

    let statement = observe(
        Endpoint::Statement,
        state.service.statement(AccountRequest::new(account_id, email)),
    )
    .await?;

    Ok(HttpResponse::Ok().json(statement))
}

/// Malformed JSON bodies become field-tagged bad requests
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        tracing::debug!("Rejected request body: {}", err);
        ServiceError::bad_request("request body", "malformed JSON").into()
    })
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .service(
            web::scope("/accounts")
                .route("", web::post().to(create_account))
                .route("/{id}/deposit", web::post().to(deposit))
                .route("/{id}/withdraw", web::post().to(withdraw))
                .route("/{id}/balance", web::get().to(balance))
                .route("/{id}/statement", web::get().to(statement)),
        )
        .route("/circuit-breakers", web::get().to(circuit_breakers))
        .route("/metrics", web::get().to(metrics))
        .route("/health", web::get().to(health_check));
}
