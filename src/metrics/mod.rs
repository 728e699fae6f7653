//! In-process counters exported in Prometheus text format at `/metrics`.

use axum::http::header;
use axum::response::IntoResponse;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const ORDERS_CREATED: &str = "storefront_orders_created_total";
pub const PAYMENTS_PAID: &str = "storefront_payments_paid_total";
pub const PAYMENTS_FAILED: &str = "storefront_payments_failed_total";
pub const GATEWAY_UNAVAILABLE: &str = "storefront_gateway_unavailable_total";
pub const GATEWAY_REJECTED: &str = "storefront_gateway_rejected_total";
pub const CALLBACK_SIGNATURE_REJECTED: &str = "storefront_callback_signature_rejected_total";
pub const VERIFICATION_NOOP: &str = "storefront_verification_noop_total";
pub const VERIFICATION_EXHAUSTED: &str = "storefront_verification_exhausted_total";
pub const COUPON_EXHAUSTED_AT_COMMIT: &str = "storefront_coupon_exhausted_at_commit_total";
pub const CAPTURE_AFTER_FINAL: &str = "storefront_capture_after_final_total";
pub const ZERO_TOTAL_SETTLED: &str = "storefront_zero_total_settled_total";
pub const FULFILLMENT_ANOMALIES: &str = "storefront_fulfillment_anomalies_total";
pub const RECONCILIATION_RESOLVED: &str = "storefront_reconciliation_resolved_total";
pub const GATEWAY_CALL_SECONDS: &str = "storefront_gateway_call_seconds";

#[derive(Debug, Clone, Default)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Count and sum only; the sum is kept in microseconds.
#[derive(Debug, Clone, Default)]
pub struct Histogram {
    sum_micros: Arc<AtomicU64>,
    count: Arc<AtomicU64>,
}

impl Histogram {
    pub fn observe(&self, value: Duration) {
        self.sum_micros
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum_seconds(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: DashMap<String, Counter>,
    histograms: DashMap<String, Histogram>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create_counter(&self, name: &str) -> Counter {
        self.counters
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn get_or_create_histogram(&self, name: &str) -> Histogram {
        self.histograms
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn export_metrics(&self) -> String {
        let mut counters: Vec<(String, u64)> = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().get()))
            .collect();
        counters.sort();

        let mut histograms: Vec<(String, u64, f64)> = self
            .histograms
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().get_count(),
                    entry.value().get_sum_seconds(),
                )
            })
            .collect();
        histograms.sort_by(|a, b| a.0.cmp(&b.0));

        let mut output = String::new();
        for (name, value) in counters {
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, value));
        }
        for (name, count, sum) in histograms {
            output.push_str(&format!("# TYPE {} summary\n", name));
            output.push_str(&format!("{}_count {}\n", name, count));
            output.push_str(&format!("{}_sum {}\n", name, sum));
        }
        output
    }
}

lazy_static::lazy_static! {
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

pub fn increment_counter(name: &str) {
    METRICS.get_or_create_counter(name).inc();
}

pub fn observe_duration(name: &str, value: Duration) {
    METRICS.get_or_create_histogram(name).observe(value);
}

pub fn counter_value(name: &str) -> u64 {
    METRICS.get_or_create_counter(name).get()
}

pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.export_metrics(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_is_sorted_prometheus_text() {
        let registry = MetricsRegistry::new();
        registry.get_or_create_counter("b_total").inc();
        registry.get_or_create_counter("a_total").inc();
        registry.get_or_create_counter("a_total").inc();
        registry
            .get_or_create_histogram("call_seconds")
            .observe(Duration::from_millis(1500));

        let text = registry.export_metrics();
        let a = text.find("a_total 2").unwrap();
        let b = text.find("b_total 1").unwrap();
        assert!(a < b);
        assert!(text.contains("call_seconds_count 1"));
        assert!(text.contains("call_seconds_sum 1.5"));
    }
}
