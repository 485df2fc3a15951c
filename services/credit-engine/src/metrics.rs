use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // Cache metrics
    pub static ref CACHE_HITS: IntCounter = register_int_counter!(
        "credit_cache_hits_total",
        "Balance reads served from the cache"
    ).expect("metric can be created");

    pub static ref CACHE_MISSES: IntCounter = register_int_counter!(
        "credit_cache_misses_total",
        "Balance reads that fell through to the ledger"
    ).expect("metric can be created");

    // Business metrics
    pub static ref TOKENS_PURCHASED: IntCounter = register_int_counter!(
        "credit_tokens_purchased_total",
        "Total units added by purchases"
    ).expect("metric can be created");

    pub static ref DEDUCTIONS_ADMITTED: IntCounter = register_int_counter!(
        "credit_deductions_admitted_total",
        "Deductions admitted against the cached balance"
    ).expect("metric can be created");

    pub static ref DEDUCTIONS_REJECTED: IntCounter = register_int_counter!(
        "credit_deductions_rejected_total",
        "Deductions refused for insufficient credit"
    ).expect("metric can be created");

    // Write-behind metrics
    pub static ref PENDING_USAGE: IntGauge = register_int_gauge!(
        "credit_pending_usage",
        "Admitted usage not yet durable in the ledger"
    ).expect("metric can be created");

    pub static ref USAGE_WRITE_RETRIES: IntCounter = register_int_counter!(
        "credit_usage_write_retries_total",
        "Retried usage appends"
    ).expect("metric can be created");

    pub static ref USAGE_WRITE_FAILURES: IntCounter = register_int_counter!(
        "credit_usage_write_failures_total",
        "Usage appends abandoned after the retry budget"
    ).expect("metric can be created");

    // Repair metrics
    pub static ref REPAIRS: IntCounterVec = register_int_counter_vec!(
        "credit_repairs_total",
        "Cache repairs by trigger and outcome",
        &["trigger", "outcome"]
    ).expect("metric can be created");

    pub static ref REPAIRS_DROPPED: IntCounter = register_int_counter!(
        "credit_repairs_dropped_total",
        "Repair requests dropped because the queue was full or closed"
    ).expect("metric can be created");
}

/// Generate metrics output in Prometheus text format
pub fn metrics_handler() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_handler() {
        TOKENS_PURCHASED.inc();
        REPAIRS.with_label_values(&["queue", "ok"]).inc();

        let output = metrics_handler().unwrap();
        assert!(output.contains("credit_tokens_purchased_total"));
        assert!(output.contains("credit_repairs_total"));
    }
}
