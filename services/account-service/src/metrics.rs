use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Request metrics
    pub static ref REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("account_requests_total", "Total requests by endpoint and outcome"),
        &["endpoint", "outcome"]
    ).expect("metric can be created");

    pub static ref REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("account_request_duration_seconds", "Request duration in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["endpoint"]
    ).expect("metric can be created");

    // Admission control
    pub static ref ADMISSION_REJECTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("admission_rejections_total", "Requests shed by admission control"),
        &["endpoint", "reason"]
    ).expect("metric can be created");

    // Circuit breakers
    pub static ref BREAKER_TRANSITIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("circuit_breaker_transitions_total", "Circuit breaker state transitions"),
        &["endpoint", "state"]
    ).expect("metric can be created");

    /// 0 = closed, 1 = half-open, 2 = open
    pub static ref BREAKER_STATE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("circuit_breaker_state", "Current circuit breaker state"),
        &["endpoint"]
    ).expect("metric can be created");

    // Ledger
    pub static ref LEDGER_OPERATION_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("ledger_operation_duration_seconds", "Ledger engine call duration in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        &["operation"]
    ).expect("metric can be created");
}

/// Register all metrics with the given registry
pub fn register_metrics(registry: &Registry) -> Result<(), prometheus::Error> {
    registry.register(Box::new(REQUESTS_TOTAL.clone()))?;
    registry.register(Box::new(REQUEST_DURATION.clone()))?;
    registry.register(Box::new(ADMISSION_REJECTIONS.clone()))?;
    registry.register(Box::new(BREAKER_TRANSITIONS.clone()))?;
    registry.register(Box::new(BREAKER_STATE.clone()))?;
    registry.register(Box::new(LEDGER_OPERATION_DURATION.clone()))?;
    Ok(())
}

/// Render the service registry in Prometheus text format
pub fn metrics_handler() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        let registry = Registry::new();
        assert!(register_metrics(&registry).is_ok());

        // Registering twice into the same registry is rejected
        assert!(register_metrics(&registry).is_err());
    }

    #[test]
    fn test_metrics_handler_renders_registered_metrics() {
        let registry = Registry::new();
        register_metrics(&registry).unwrap();
        ADMISSION_REJECTIONS
            .with_label_values(&["deposit", "rate"])
            .inc();

        let mut buffer = vec![];
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        let output = String::from_utf8(buffer).unwrap();
        assert!(output.contains("admission_rejections_total"));
    }
}
