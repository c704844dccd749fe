//! Metrics module for billing-engine.
//! Provides Prometheus metrics for billing commands, batch jobs and dunning actions.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_counter_vec, register_histogram_vec, register_int_counter_vec,
    CounterVec, Encoder, HistogramVec, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Store operation duration histogram
pub static STORE_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "billing_store_query_duration_seconds",
            "Billing store operation duration"
        ),
        &["operation"]
    )
    .expect("Failed to register STORE_QUERY_DURATION")
});

/// Invoice operations counter
pub static INVOICE_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Subscription operations counter
pub static SUBSCRIPTION_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Dunning actions counter
pub static DUNNING_ACTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Batch job runs counter
pub static BATCH_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Per-item batch failures
pub static BATCH_ITEM_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Batch job duration histogram
pub static BATCH_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Payment amount counter by currency (monetary tracking)
pub static PAYMENT_AMOUNT_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup; repeated calls are no-ops.
pub fn init_metrics() {
    INVOICE_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_invoice_operations_total",
                "Total invoice operations by operation type"
            ),
            &["operation"]
        )
        .expect("Failed to register INVOICE_OPERATIONS_TOTAL")
    });

    SUBSCRIPTION_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_subscription_operations_total",
                "Total subscription operations by operation type"
            ),
            &["operation"]
        )
        .expect("Failed to register SUBSCRIPTION_OPERATIONS_TOTAL")
    });

    DUNNING_ACTIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_dunning_actions_total",
                "Total dunning actions by action type"
            ),
            &["action"]
        )
        .expect("Failed to register DUNNING_ACTIONS_TOTAL")
    });

    BATCH_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_batch_runs_total", "Total batch job runs by status"),
            &["job", "status"]
        )
        .expect("Failed to register BATCH_RUNS_TOTAL")
    });

    BATCH_ITEM_FAILURES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_batch_item_failures_total",
                "Items that failed inside a batch job"
            ),
            &["job"]
        )
        .expect("Failed to register BATCH_ITEM_FAILURES_TOTAL")
    });

    // Batch jobs walk the whole candidate set, so the buckets reach further out
    BATCH_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "billing_batch_duration_seconds",
                "Batch job duration",
                vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]
            ),
            &["job"]
        )
        .expect("Failed to register BATCH_DURATION")
    });

    PAYMENT_AMOUNT_TOTAL.get_or_init(|| {
        register_counter_vec!(
            opts!(
                "billing_payment_amount_total",
                "Total payment amount recorded by currency"
            ),
            &["currency"]
        )
        .expect("Failed to register PAYMENT_AMOUNT_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*STORE_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record an invoice operation.
pub fn record_invoice_operation(operation: &str) {
    if let Some(counter) = INVOICE_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

/// Record a subscription operation.
pub fn record_subscription_operation(operation: &str) {
    if let Some(counter) = SUBSCRIPTION_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

/// Record a dunning action.
pub fn record_dunning_action(action: &str) {
    if let Some(counter) = DUNNING_ACTIONS_TOTAL.get() {
        counter.with_label_values(&[action]).inc();
    }
}

/// Record a finished batch job.
pub fn record_batch_run(job: &str, status: &str, failed_items: u64, duration_secs: f64) {
    if let Some(counter) = BATCH_RUNS_TOTAL.get() {
        counter.with_label_values(&[job, status]).inc();
    }
    if let Some(counter) = BATCH_ITEM_FAILURES_TOTAL.get() {
        counter.with_label_values(&[job]).inc_by(failed_items);
    }
    if let Some(histogram) = BATCH_DURATION.get() {
        histogram.with_label_values(&[job]).observe(duration_secs);
    }
}

/// Record a payment amount for financial tracking.
pub fn record_payment_amount(currency: &str, amount: f64) {
    if let Some(counter) = PAYMENT_AMOUNT_TOTAL.get() {
        counter.with_label_values(&[currency]).inc_by(amount.abs());
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
