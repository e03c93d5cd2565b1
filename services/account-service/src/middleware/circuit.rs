//! Circuit breaking
//!
//! One breaker per endpoint, fed by the calls that got past admission:
//!
//! - **Closed**: calls pass, outcomes fill a rolling window. Trips to open once
//!   `min_calls` outcomes are in and the failure ratio exceeds `failure_ratio`
//!   (at 1.0, once every outcome in the window is a failure).
//! - **Open**: calls fail with `ServiceUnavailable` until the cooldown elapses.
//! - **Half-open**: up to `half_open_trials` trial calls are let through.
//!   That many successes close the breaker, one failure re-opens it.
//!
//! `Internal` and `ServiceUnavailable` answers are failures, as are calls
//! cancelled before answering (the deadline expired around them).
//! `BadRequest` and `NotFound` are healthy answers.

use super::{Endpoint, Layer, PerEndpoint};
use crate::errors::{ServiceError, ServiceResult, StartupError};
use crate::metrics::{BREAKER_STATE, BREAKER_TRANSITIONS};
use crate::models::{AccountRequest, CreateAccountRequest, Statement, TransferRequest};
use crate::service::AccountService;
use async_trait::async_trait;
use ledger_core::Account;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn gauge_value(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

/// Per-endpoint breaker settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Opens when failures / outcomes exceeds this, in (0, 1]
    pub failure_ratio: f64,
    /// Number of most recent outcomes considered
    pub window: usize,
    /// Outcomes required before the ratio is trusted
    pub min_calls: usize,
    pub cooldown_ms: u64,
    pub half_open_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            window: 20,
            min_calls: 10,
            cooldown_ms: 5_000,
            half_open_trials: 3,
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self, endpoint: Endpoint) -> Result<(), StartupError> {
        let invalid = |what: &str| {
            Err(StartupError::Config(format!(
                "breakers.{}.{}",
                endpoint, what
            )))
        };
        if !(self.failure_ratio > 0.0 && self.failure_ratio <= 1.0) {
            return invalid("failure_ratio must be in (0, 1]");
        }
        if self.window == 0 {
            return invalid("window must be positive");
        }
        if self.min_calls == 0 || self.min_calls > self.window {
            return invalid("min_calls must be in 1..=window");
        }
        if self.half_open_trials == 0 {
            return invalid("half_open_trials must be positive");
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub endpoint: Endpoint,
    pub state: CircuitState,
    pub calls: usize,
    pub failures: usize,
    pub trials_in_flight: u32,
}

struct Inner {
    state: CircuitState,
    /// true = failure
    outcomes: VecDeque<bool>,
    failures: usize,
    opened_at: Option<Instant>,
    trials_in_flight: u32,
    trial_successes: u32,
    /// Bumped on every transition so stale permits are ignored
    generation: u64,
}

pub struct CircuitBreaker {
    endpoint: Endpoint,
    config: BreakerConfig,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

/// Admission ticket for one call through the breaker.
///
/// A permit dropped without an outcome belongs to a cancelled call and is
/// recorded as a failure.
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    done: bool,
}

impl Permit<'_> {
    pub fn record(mut self, failed: bool) {
        self.done = true;
        self.breaker.on_outcome(self.generation, self.trial, failed);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.done = true;
            self.breaker.on_outcome(self.generation, self.trial, true);
        }
    }
}

impl CircuitBreaker {
    pub fn new(endpoint: Endpoint, config: BreakerConfig) -> Result<Self, StartupError> {
        config.validate(endpoint)?;
        BREAKER_STATE
            .with_label_values(&[endpoint.as_str()])
            .set(CircuitState::Closed.gauge_value());

        Ok(Self {
            endpoint,
            config,
            cooldown: Duration::from_millis(config.cooldown_ms),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                outcomes: VecDeque::with_capacity(config.window),
                failures: 0,
                opened_at: None,
                trials_in_flight: 0,
                trial_successes: 0,
                generation: 0,
            }),
        })
    }

    /// Execute `call` with circuit breaker protection
    pub async fn call<T, F, Fut>(&self, call: F) -> ServiceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ServiceResult<T>>,
    {
        let permit = self.try_acquire()?;
        let result = call().await;
        permit.record(matches!(&result, Err(e) if e.is_downstream_failure()));
        result
    }

    pub fn try_acquire(&self) -> ServiceResult<Permit<'_>> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let cooled = inner
                .opened_at
                .map_or(true, |at| at.elapsed() >= self.cooldown);
            if !cooled {
                return Err(ServiceError::ServiceUnavailable("circuit open"));
            }
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        let trial = inner.state == CircuitState::HalfOpen;
        if trial {
            if inner.trials_in_flight + inner.trial_successes >= self.config.half_open_trials {
                return Err(ServiceError::ServiceUnavailable("circuit half-open"));
            }
            inner.trials_in_flight += 1;
        }

        Ok(Permit {
            breaker: self,
            generation: inner.generation,
            trial,
            done: false,
        })
    }

    fn on_outcome(&self, generation: u64, trial: bool, failed: bool) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }

        if trial {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
            if failed {
                warn!(endpoint = %self.endpoint, "Trial call failed, circuit re-opened");
                self.transition(&mut inner, CircuitState::Open);
            } else {
                inner.trial_successes += 1;
                if inner.trial_successes >= self.config.half_open_trials {
                    info!(endpoint = %self.endpoint, "Circuit recovered");
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            return;
        }

        inner.outcomes.push_back(failed);
        if failed {
            inner.failures += 1;
        }
        if inner.outcomes.len() > self.config.window {
            if let Some(true) = inner.outcomes.pop_front() {
                inner.failures -= 1;
            }
        }

        let calls = inner.outcomes.len();
        if self.should_trip(inner.failures, calls) {
            warn!(
                endpoint = %self.endpoint,
                failures = inner.failures,
                calls = calls,
                "Circuit breaker TRIPPED"
            );
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    fn should_trip(&self, failures: usize, calls: usize) -> bool {
        if calls < self.config.min_calls {
            return false;
        }
        if self.config.failure_ratio >= 1.0 {
            return failures == calls;
        }
        failures as f64 / calls as f64 > self.config.failure_ratio
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        info!(
            endpoint = %self.endpoint,
            from = inner.state.as_str(),
            to = to.as_str(),
            "Circuit breaker transition"
        );

        inner.state = to;
        inner.generation += 1;
        inner.outcomes.clear();
        inner.failures = 0;
        inner.trials_in_flight = 0;
        inner.trial_successes = 0;
        inner.opened_at = (to == CircuitState::Open).then(Instant::now);

        BREAKER_TRANSITIONS
            .with_label_values(&[self.endpoint.as_str(), to.as_str()])
            .inc();
        BREAKER_STATE
            .with_label_values(&[self.endpoint.as_str()])
            .set(to.gauge_value());
    }

    /// Manually reset the circuit breaker
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        info!(endpoint = %self.endpoint, "Circuit breaker manually reset to Closed");
        self.transition(&mut inner, CircuitState::Closed);
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock();
        Snapshot {
            endpoint: self.endpoint,
            state: inner.state,
            calls: inner.outcomes.len(),
            failures: inner.failures,
            trials_in_flight: inner.trials_in_flight,
        }
    }
}

pub struct CircuitBreakerLayer {
    breakers: Arc<PerEndpoint<CircuitBreaker>>,
}

impl CircuitBreakerLayer {
    pub fn new(configs: &PerEndpoint<BreakerConfig>) -> Result<Self, StartupError> {
        let breakers = configs.try_map(|endpoint, config| CircuitBreaker::new(endpoint, *config))?;
        Ok(Self {
            breakers: Arc::new(breakers),
        })
    }

    pub fn breakers(&self) -> Arc<PerEndpoint<CircuitBreaker>> {
        self.breakers.clone()
    }
}

impl Layer for CircuitBreakerLayer {
    fn layer(&self, inner: Arc<dyn AccountService>) -> Arc<dyn AccountService> {
        Arc::new(CircuitBreakerService {
            inner,
            breakers: self.breakers.clone(),
        })
    }
}

pub struct CircuitBreakerService {
    inner: Arc<dyn AccountService>,
    breakers: Arc<PerEndpoint<CircuitBreaker>>,
}

#[async_trait]
impl AccountService for CircuitBreakerService {
    async fn create_account(&self, req: CreateAccountRequest) -> ServiceResult<Account> {
        self.breakers
            .create_account
            .call(|| self.inner.create_account(req))
            .await
    }

    async fn deposit(&self, req: TransferRequest) -> ServiceResult<Decimal> {
        self.breakers.deposit.call(|| self.inner.deposit(req)).await
    }

    async fn withdraw(&self, req: TransferRequest) -> ServiceResult<Decimal> {
        self.breakers.withdraw.call(|| self.inner.withdraw(req)).await
    }

    async fn balance(&self, req: AccountRequest) -> ServiceResult<Decimal> {
        self.breakers.balance.call(|| self.inner.balance(req)).await
    }

    async fn statement(&self, req: AccountRequest) -> ServiceResult<Statement> {
        self.breakers.statement.call(|| self.inner.statement(req)).await
    }
}
