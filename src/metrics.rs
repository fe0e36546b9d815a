// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
pub enum Unit {
    Count,
    Seconds,
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {
        { let _ = (&$value $(, &$label_value)*); }
    };
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {
        { let _ = (&$value $(, &$label_value)*); }
    };
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {
        { let _ = (&$value $(, &$label_value)*); }
    };
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {
        { let _ = &$unit; }
    };
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {
        { let _ = &$unit; }
    };
}

#[cfg(not(feature = "observability"))]
use crate::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use std::time::Duration;

/// Registers descriptions for every metric the pipeline emits. Call once at startup.
pub fn describe_metrics() {
    describe_counter!(
        "forge_blocks_scanned_total",
        Unit::Count,
        "Blocks fully scanned by the block walker, labeled by network."
    );
    describe_counter!(
        "forge_candidates_total",
        Unit::Count,
        "Contract candidates extracted from transfer logs."
    );
    describe_counter!(
        "forge_contracts_total",
        Unit::Count,
        "Contracts leaving a pass, labeled by outcome (promoted, rejected, failed)."
    );
    describe_counter!(
        "forge_explorer_requests_total",
        Unit::Count,
        "Explorer API requests, labeled by outcome."
    );
    describe_histogram!(
        "forge_limiter_wait_seconds",
        Unit::Seconds,
        "Time spent waiting on the explorer rate limiter."
    );
    describe_gauge!(
        "forge_cursor_block",
        "Next block the walker will fetch, labeled by network."
    );
    describe_gauge!(
        "forge_pending_contracts",
        "Contracts waiting in the New set, labeled by network."
    );
    describe_gauge!(
        "forge_unhandled_blocks",
        "Saved blocks not yet marked handled, labeled by network."
    );
}

/// Starts the Prometheus scrape endpoint.
#[cfg(feature = "observability")]
pub fn install_exporter(listen: &str) -> anyhow::Result<()> {
    let addr: std::net::SocketAddr = listen.parse()?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_metrics();
    log::info!("📈 Prometheus exporter listening on {}", addr);
    Ok(())
}

#[cfg(not(feature = "observability"))]
pub fn install_exporter(listen: &str) -> anyhow::Result<()> {
    log::warn!(
        "metrics.enabled is set but the observability feature is off, not listening on {}",
        listen
    );
    Ok(())
}

// --- Helper functions to update metrics ---

pub fn increment_blocks_scanned(network: &str) {
    counter!("forge_blocks_scanned_total", 1, "network" => network.to_string());
}

pub fn increment_candidates(network: &str, count: u64) {
    counter!("forge_candidates_total", count, "network" => network.to_string());
}

pub fn increment_contracts(network: &str, outcome: &'static str) {
    counter!("forge_contracts_total", 1, "network" => network.to_string(), "outcome" => outcome);
}

pub fn increment_explorer_requests(outcome: &'static str) {
    counter!("forge_explorer_requests_total", 1, "outcome" => outcome);
}

pub fn record_limiter_wait(waited: Duration) {
    histogram!("forge_limiter_wait_seconds", waited.as_secs_f64());
}

pub fn set_cursor_block(network: &str, block: u64) {
    gauge!("forge_cursor_block", block as f64, "network" => network.to_string());
}

pub fn set_pending_contracts(network: &str, count: usize) {
    gauge!("forge_pending_contracts", count as f64, "network" => network.to_string());
}

pub fn set_unhandled_blocks(network: &str, count: usize) {
    gauge!("forge_unhandled_blocks", count as f64, "network" => network.to_string());
}
