use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use ledger_core::{AccountId, FieldErrors};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Errors crossing the service boundary
///
/// Store details never leave the process: they are logged where they are
/// converted and collapse to [`ServiceError::Internal`].
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("missing/invalid params: {0}")]
    BadRequest(FieldErrors),

    #[error("record not found: {0}")]
    NotFound(AccountId),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(&'static str),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn bad_request(field: impl Into<String>, message: impl Into<String>) -> Self {
        ServiceError::BadRequest(FieldErrors::single(field, message))
    }

    /// Outcomes that say something about downstream health
    pub fn is_downstream_failure(&self) -> bool {
        matches!(
            self,
            ServiceError::Internal(_) | ServiceError::ServiceUnavailable(_)
        )
    }

    /// Short label used in metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::BadRequest(_) => "bad_request",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::ServiceUnavailable(_) => "unavailable",
            ServiceError::Internal(_) => "internal",
        }
    }
}

impl From<ledger_core::Error> for ServiceError {
    fn from(err: ledger_core::Error) -> Self {
        match err {
            ledger_core::Error::BadRequest(fields) => ServiceError::BadRequest(fields),
            ledger_core::Error::NotFound(id) => ServiceError::NotFound(id),
            ledger_core::Error::Store { context, source } => {
                error!(context = context, error = %source, "Store failure");
                ServiceError::Internal(context.to_string())
            }
            ledger_core::Error::Internal(msg) => {
                error!(error = %msg, "Ledger invariant violated");
                ServiceError::Internal(msg)
            }
        }
    }
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            ServiceError::BadRequest(fields) => json!({ "fields": fields }),
            ServiceError::NotFound(id) => json!({ "id": id }),
            ServiceError::ServiceUnavailable(_) => json!({ "message": "service unavailable" }),
            ServiceError::Internal(_) => json!({ "message": "server error" }),
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Conditions that must stop the process before it serves traffic
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("system account {id} for {currency} does not exist")]
    SystemAccountMissing { currency: String, id: AccountId },

    #[error("system account {id} holds {actual}, configured for {currency}")]
    CurrencyMismatch {
        currency: String,
        id: AccountId,
        actual: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),

    #[error(transparent)]
    Ledger(#[from] ledger_core::Error),
}
