//! Prometheus-based metrics module
//!
//! Counters are process-wide and registered once with `REGISTRY`; the
//! `/metrics` endpoint in `metrics_api` renders them.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Traffic Metrics ===

    pub static ref TRAFFIC_BYTES_UPLOADED: IntCounter = IntCounter::new(
        "flowgate_traffic_bytes_uploaded_total",
        "Total bytes relayed client to server"
    ).unwrap();

    pub static ref TRAFFIC_BYTES_DOWNLOADED: IntCounter = IntCounter::new(
        "flowgate_traffic_bytes_downloaded_total",
        "Total bytes relayed server to client"
    ).unwrap();

    // === Inbound Metrics ===

    /// Accepted TCP connections per inbound
    pub static ref INBOUND_CONNECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("flowgate_inbound_connections_total", "Accepted connections per inbound"),
        &["tag"]
    ).unwrap();

    /// Active TCP connections per inbound
    pub static ref INBOUND_CONNECTIONS_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("flowgate_inbound_connections_active", "Active connections per inbound"),
        &["tag"]
    ).unwrap();

    /// Datagrams read per inbound
    pub static ref INBOUND_PACKETS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("flowgate_inbound_packets_total", "Datagrams received per inbound"),
        &["tag"]
    ).unwrap();

    /// Connection handler failures per inbound (closed errors excluded)
    pub static ref INBOUND_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("flowgate_inbound_errors_total", "Handler failures per inbound"),
        &["tag"]
    ).unwrap();

    // === Outbound Metrics ===

    pub static ref OUTBOUND_CONNECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("flowgate_outbound_connections_total", "Flows handed to each outbound"),
        &["tag"]
    ).unwrap();

    // === Router Metrics ===

    /// Rule hits per rule label
    pub static ref ROUTER_RULE_HITS: IntCounterVec = IntCounterVec::new(
        Opts::new("flowgate_router_rule_hits_total", "Number of times each routing rule was matched"),
        &["rule"]
    ).unwrap();

    pub static ref ROUTER_DECISIONS_TOTAL: IntCounter = IntCounter::new(
        "flowgate_router_decisions_total",
        "Total number of routing decisions made"
    ).unwrap();

    // === DNS Metrics ===

    pub static ref DNS_QUERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("flowgate_dns_queries_total", "DNS exchanges and lookups per transport"),
        &["transport"]
    ).unwrap();

    pub static ref DNS_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("flowgate_dns_failures_total", "Failed DNS exchanges and lookups per transport"),
        &["transport"]
    ).unwrap();
}

/// Register all metrics with the global registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(TRAFFIC_BYTES_UPLOADED.clone())).ok();
    REGISTRY.register(Box::new(TRAFFIC_BYTES_DOWNLOADED.clone())).ok();

    REGISTRY.register(Box::new(INBOUND_CONNECTIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(INBOUND_CONNECTIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(INBOUND_PACKETS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(INBOUND_ERRORS_TOTAL.clone())).ok();

    REGISTRY.register(Box::new(OUTBOUND_CONNECTIONS_TOTAL.clone())).ok();

    REGISTRY.register(Box::new(ROUTER_RULE_HITS.clone())).ok();
    REGISTRY.register(Box::new(ROUTER_DECISIONS_TOTAL.clone())).ok();

    REGISTRY.register(Box::new(DNS_QUERIES_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(DNS_FAILURES_TOTAL.clone())).ok();
}

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 / 2), "1.50 MB");
    }

    #[test]
    fn test_init_metrics_is_repeatable() {
        init_metrics();
        init_metrics();
        ROUTER_DECISIONS_TOTAL.inc();
        let families = REGISTRY.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "flowgate_router_decisions_total"));
    }
}
