//! Metrics collection and exposition.
//!
//! # Metrics
//! - `relay_gateway_requests_total` (counter): store calls by op, outcome
//! - `relay_gateway_request_duration_seconds` (histogram): store call latency
//! - `relay_gateway_failovers_total` (counter): calls served after a failover
//! - `relay_endpoint_health` (gauge): 1=healthy, 0=not
//! - `relay_feed_events_total` (counter): change events by kind
//! - `relay_feed_resyncs_total` (counter): resyncs by outcome
//! - `relay_hub_subscribers` (gauge): live subscriptions per scope
//! - `relay_hub_deliveries_total` (counter): events enqueued to subscribers
//! - `relay_hub_disconnects_total` (counter): forced disconnects by reason
//! - `relay_cache_lookups_total` (counter): cache resolutions by source

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Instant;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_gateway_op(op: &'static str, outcome: &'static str, start: Instant) {
    counter!("relay_gateway_requests_total", "op" => op, "outcome" => outcome).increment(1);
    histogram!("relay_gateway_request_duration_seconds", "op" => op)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_failover(op: &'static str) {
    counter!("relay_gateway_failovers_total", "op" => op).increment(1);
}

pub fn record_endpoint_health(address: &str, healthy: bool) {
    gauge!("relay_endpoint_health", "endpoint" => address.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_feed_event(kind: &'static str) {
    counter!("relay_feed_events_total", "kind" => kind).increment(1);
}

pub fn record_resync(outcome: &'static str) {
    counter!("relay_feed_resyncs_total", "outcome" => outcome).increment(1);
}

pub fn record_subscribers(scope: &str, count: usize) {
    gauge!("relay_hub_subscribers", "scope" => scope.to_string()).set(count as f64);
}

pub fn record_deliveries(count: usize) {
    counter!("relay_hub_deliveries_total").increment(count as u64);
}

pub fn record_disconnect(reason: &'static str) {
    counter!("relay_hub_disconnects_total", "reason" => reason).increment(1);
}

pub fn record_cache_lookup(source: &'static str) {
    counter!("relay_cache_lookups_total", "source" => source).increment(1);
}
