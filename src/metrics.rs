//! Prometheus-based metrics module
//!
//! Counters live in a lazily created registry and are registered on first
//! use of [`init_metrics`] or [`gather`].

use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Connection Metrics ===

    /// Successful dials per transport scheme
    pub static ref DIALS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("loomwire_dials_total", "Connections established by dialers"),
        &["transport"]
    ).expect("valid metric definition");

    /// Successful accepts per transport scheme
    pub static ref ACCEPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("loomwire_accepts_total", "Connections established by listeners"),
        &["transport"]
    ).expect("valid metric definition");

    /// TLS handshakes by credential mode and outcome
    pub static ref HANDSHAKES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("loomwire_tls_handshakes_total", "TLS handshakes by mode and outcome"),
        &["mode", "outcome"]
    ).expect("valid metric definition");

    // === Traffic Metrics ===

    /// Bytes written to raw streams
    pub static ref BYTES_SENT: IntCounter = IntCounter::new(
        "loomwire_bytes_sent_total",
        "Total bytes written to stream connections"
    ).expect("valid metric definition");

    /// Bytes read from raw streams
    pub static ref BYTES_RECEIVED: IntCounter = IntCounter::new(
        "loomwire_bytes_received_total",
        "Total bytes read from stream connections"
    ).expect("valid metric definition");

    /// Messages dropped for exceeding the receive-size ceiling
    pub static ref MESSAGES_DISCARDED: IntCounter = IntCounter::new(
        "loomwire_messages_discarded_total",
        "Messages dropped because they exceeded recv-size-max"
    ).expect("valid metric definition");
}

static INIT: Once = Once::new();

/// Register all metrics with the global registry
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY.register(Box::new(DIALS_TOTAL.clone())).ok();
        REGISTRY.register(Box::new(ACCEPTS_TOTAL.clone())).ok();
        REGISTRY.register(Box::new(HANDSHAKES_TOTAL.clone())).ok();
        REGISTRY.register(Box::new(BYTES_SENT.clone())).ok();
        REGISTRY.register(Box::new(BYTES_RECEIVED.clone())).ok();
        REGISTRY.register(Box::new(MESSAGES_DISCARDED.clone())).ok();
    });
}

/// Encode every metric in the Prometheus text format
pub fn gather() -> String {
    init_metrics();
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_counters() {
        MESSAGES_DISCARDED.inc();
        DIALS_TOTAL.with_label_values(&["tcp"]).inc();
        let text = gather();
        assert!(text.contains("loomwire_messages_discarded_total"));
        assert!(text.contains("loomwire_dials_total{transport=\"tcp\"}"));
    }
}
