//! Storage error tracking on a prometheus registry

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, Registry, TextEncoder};
use std::sync::OnceLock;
use tracing::error;

use crate::error::StorageError;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static STORAGE_ERRORS: OnceLock<Option<IntCounterVec>> = OnceLock::new();
static DEGRADED_READS: OnceLock<Option<IntCounterVec>> = OnceLock::new();

fn register(name: &str, help: &str, labels: &[&str]) -> Option<IntCounterVec> {
    let counter = IntCounterVec::new(prometheus::opts!(name, help), labels).ok()?;
    REGISTRY.register(Box::new(counter.clone())).ok();
    Some(counter)
}

fn storage_errors() -> Option<&'static IntCounterVec> {
    STORAGE_ERRORS
        .get_or_init(|| {
            register(
                "storage_errors_total",
                "Storage failures by error id and category",
                &["id", "category"],
            )
        })
        .as_ref()
}

fn degraded_reads() -> Option<&'static IntCounterVec> {
    DEGRADED_READS
        .get_or_init(|| {
            register(
                "storage_degraded_reads_total",
                "Reads answered with an empty result after a failure",
                &["operation"],
            )
        })
        .as_ref()
}

/// Registers every counter up front so they show in the first scrape.
pub fn init_metrics() {
    storage_errors();
    degraded_reads();
}

/// Exception reporter: logs the classified error and counts it.
pub fn track_exception(err: &StorageError) {
    error!(
        id = %err.id,
        category = err.category.as_str(),
        details = %serde_json::Value::Object(err.details.clone()),
        "{}",
        err.message
    );
    if let Some(counter) = storage_errors() {
        counter.with_label_values(&[err.id.as_str(), err.category.as_str()]).inc();
    }
}

/// Tracks a failed read that the caller sees as an empty result.
pub fn track_degraded_read(operation: &str, err: &StorageError) {
    track_exception(err);
    if let Some(counter) = degraded_reads() {
        counter.with_label_values(&[operation]).inc();
    }
}

pub fn error_count(id: &str, category: &str) -> u64 {
    storage_errors().map_or(0, |c| c.with_label_values(&[id, category]).get())
}

/// Prometheus text exposition of the storage registry.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_exception_counts_by_id() {
        init_metrics();
        let err = StorageError::user("STORAGE_METRICS_TEST", "boom");
        let before = error_count("STORAGE_METRICS_TEST", "USER");
        track_exception(&err);
        track_degraded_read("metrics_test", &err);
        assert_eq!(error_count("STORAGE_METRICS_TEST", "USER"), before + 2);
        assert!(gather_metrics().contains("storage_degraded_reads_total"));
    }
}
