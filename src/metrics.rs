//! Prometheus metrics
//!
//! - Claim outcomes and records handed out
//! - HTTP requests by method and status
//! - Pool size by status, refreshed on scrape

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::error;

use crate::storage::StatusCounts;

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = build_registry();

    pub static ref CLAIMS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("recordpool_claims_total", "Claim requests by outcome"),
        &["outcome"]
    ).expect("valid claims_total metric");

    pub static ref RECORDS_CLAIMED_TOTAL: IntCounter = IntCounter::new(
        "recordpool_records_claimed_total",
        "Records moved from unused to used by claims"
    ).expect("valid records_claimed_total metric");

    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("recordpool_http_requests_total", "HTTP requests"),
        &["method", "status"]
    ).expect("valid http_requests_total metric");

    pub static ref RECORDS_BY_STATUS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("recordpool_records", "Records per status"),
        &["status"]
    ).expect("valid records metric");
}

fn build_registry() -> Registry {
    let registry = Registry::new();
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(CLAIMS_TOTAL.clone()),
        Box::new(RECORDS_CLAIMED_TOTAL.clone()),
        Box::new(HTTP_REQUESTS_TOTAL.clone()),
        Box::new(RECORDS_BY_STATUS.clone()),
    ];
    for collector in collectors {
        if let Err(e) = registry.register(collector) {
            error!(error = %e, "Failed to register metric");
        }
    }
    registry
}

/// Outcome label for a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Full,
    Partial,
    Empty,
    Rejected,
    Failed,
}

impl ClaimOutcome {
    fn as_str(self) -> &'static str {
        match self {
            ClaimOutcome::Full => "full",
            ClaimOutcome::Partial => "partial",
            ClaimOutcome::Empty => "empty",
            ClaimOutcome::Rejected => "rejected",
            ClaimOutcome::Failed => "failed",
        }
    }
}

pub fn record_claim(outcome: ClaimOutcome, claimed: usize) {
    CLAIMS_TOTAL.with_label_values(&[outcome.as_str()]).inc();
    RECORDS_CLAIMED_TOTAL.inc_by(claimed as u64);
}

pub fn record_http_request(method: &str, status: u16) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, &status.to_string()])
        .inc();
}

pub fn update_pool_gauges(counts: &StatusCounts) {
    RECORDS_BY_STATUS.reset();
    for (status, count) in &counts.by_status {
        RECORDS_BY_STATUS
            .with_label_values(&[status.as_str()])
            .set(*count as i64);
    }
}

/// Export all metrics in Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_claim_metrics() {
        record_claim(ClaimOutcome::Partial, 3);
        let text = export_metrics();
        assert!(text.contains("recordpool_claims_total"));
        assert!(text.contains("recordpool_records_claimed_total"));
    }

    #[test]
    fn test_http_requests_are_labelled_by_method_and_status() {
        let before = HTTP_REQUESTS_TOTAL.with_label_values(&["PATCH", "418"]).get();
        record_http_request("PATCH", 418);
        assert_eq!(
            HTTP_REQUESTS_TOTAL.with_label_values(&["PATCH", "418"]).get(),
            before + 1
        );
    }

    #[test]
    fn test_pool_gauges_follow_counts() {
        let mut counts = StatusCounts::default();
        counts.add(&crate::record::RecordStatus::Unused);
        counts.add(&crate::record::RecordStatus::Used);
        counts.add(&crate::record::RecordStatus::Used);
        update_pool_gauges(&counts);

        assert_eq!(RECORDS_BY_STATUS.with_label_values(&["used"]).get(), 2);
        assert_eq!(RECORDS_BY_STATUS.with_label_values(&["unused"]).get(), 1);
    }
}
