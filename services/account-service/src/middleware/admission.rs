//! Admission control
//!
//! One token bucket per endpoint. A request waits for a token only while the
//! wait still fits inside its latency budget; otherwise it is shed at once
//! with `ServiceUnavailable`. The same deadline then bounds the inner call, and
//! an expired call is dropped, which rolls back any open unit of work.

use super::{Endpoint, Layer, PerEndpoint};
use crate::errors::{ServiceError, ServiceResult, StartupError};
use crate::metrics::ADMISSION_REJECTIONS;
use crate::models::{AccountRequest, CreateAccountRequest, Statement, TransferRequest};
use crate::service::AccountService;
use async_trait::async_trait;
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use ledger_core::Account;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Per-endpoint admission settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Latency budget in milliseconds, covering token wait and the call itself
    pub slo_ms: u64,
    /// Tokens per second
    pub rate: u32,
    /// Bucket capacity
    pub burst: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            slo_ms: 500,
            rate: 100,
            burst: 50,
        }
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct Gate {
    endpoint: Endpoint,
    limiter: DirectLimiter,
    clock: DefaultClock,
    slo: Duration,
}

impl Gate {
    pub fn new(endpoint: Endpoint, config: &AdmissionConfig) -> Result<Self, StartupError> {
        let rate = NonZeroU32::new(config.rate).ok_or_else(|| {
            StartupError::Config(format!("limits.{}.rate must be positive", endpoint))
        })?;
        let burst = NonZeroU32::new(config.burst).ok_or_else(|| {
            StartupError::Config(format!("limits.{}.burst must be positive", endpoint))
        })?;
        if config.slo_ms == 0 {
            return Err(StartupError::Config(format!(
                "limits.{}.slo_ms must be positive",
                endpoint
            )));
        }

        Ok(Self {
            endpoint,
            limiter: RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)),
            clock: DefaultClock::default(),
            slo: Duration::from_millis(config.slo_ms),
        })
    }

    /// Run `call` if a token is obtained in time, bounded by the same deadline
    pub async fn run<T, F>(&self, call: F) -> ServiceResult<T>
    where
        F: Future<Output = ServiceResult<T>>,
    {
        let deadline = Instant::now() + self.slo;
        self.acquire(deadline).await?;

        match tokio::time::timeout_at(deadline, call).await {
            Ok(result) => result,
            Err(_) => {
                ADMISSION_REJECTIONS
                    .with_label_values(&[self.endpoint.as_str(), "deadline"])
                    .inc();
                warn!(endpoint = %self.endpoint, slo_ms = self.slo.as_millis() as u64, "Deadline exceeded");
                Err(ServiceError::ServiceUnavailable("deadline exceeded"))
            }
        }
    }

    async fn acquire(&self, deadline: Instant) -> ServiceResult<()> {
        loop {
            let wait = match self.limiter.check() {
                Ok(()) => return Ok(()),
                Err(not_until) => not_until.wait_time_from(self.clock.now()),
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if wait > remaining {
                ADMISSION_REJECTIONS
                    .with_label_values(&[self.endpoint.as_str(), "rate"])
                    .inc();
                warn!(
                    endpoint = %self.endpoint,
                    wait_ms = wait.as_millis() as u64,
                    "Rate limit exceeded, shedding request"
                );
                return Err(ServiceError::ServiceUnavailable("rate limited"));
            }

            tokio::time::sleep(wait).await;
        }
    }
}

pub struct AdmissionLayer {
    gates: Arc<PerEndpoint<Gate>>,
}

impl AdmissionLayer {
    pub fn new(limits: &PerEndpoint<AdmissionConfig>) -> Result<Self, StartupError> {
        let gates = limits.try_map(Gate::new)?;
        Ok(Self {
            gates: Arc::new(gates),
        })
    }
}

impl Layer for AdmissionLayer {
    fn layer(&self, inner: Arc<dyn AccountService>) -> Arc<dyn AccountService> {
        Arc::new(Admission {
            inner,
            gates: self.gates.clone(),
        })
    }
}

pub struct Admission {
    inner: Arc<dyn AccountService>,
    gates: Arc<PerEndpoint<Gate>>,
}

#[async_trait]
impl AccountService for Admission {
    async fn create_account(&self, req: CreateAccountRequest) -> ServiceResult<Account> {
        self.gates
            .create_account
            .run(self.inner.create_account(req))
            .await
    }

    async fn deposit(&self, req: TransferRequest) -> ServiceResult<Decimal> {
        self.gates.deposit.run(self.inner.deposit(req)).await
    }

    async fn withdraw(&self, req: TransferRequest) -> ServiceResult<Decimal> {
        self.gates.withdraw.run(self.inner.withdraw(req)).await
    }

    async fn balance(&self, req: AccountRequest) -> ServiceResult<Decimal> {
        self.gates.balance.run(self.inner.balance(req)).await
    }

    async fn statement(&self, req: AccountRequest) -> ServiceResult<Statement> {
        self.gates.statement.run(self.inner.statement(req)).await
    }
}
