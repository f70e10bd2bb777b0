use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};

use crate::config::MetricsConfig;

pub fn init_metrics() {
    describe_counter!(
        "gateway_requests_total",
        "Total routed inference requests by model and outcome"
    );
    describe_histogram!(
        "gateway_request_duration_seconds",
        "End-to-end routing duration in seconds, retries included"
    );
    describe_counter!(
        "gateway_upstream_failures_total",
        "Failed forwarding attempts by model and failure kind"
    );
    describe_counter!(
        "gateway_retries_total",
        "Forwarding attempts beyond the first, by model"
    );
    describe_counter!(
        "gateway_stream_outcomes_total",
        "Streaming requests by model and terminal outcome"
    );
    describe_counter!(
        "gateway_health_probes_total",
        "Health probes by result (healthy/unhealthy)"
    );
    describe_histogram!(
        "gateway_health_probe_duration_seconds",
        "Health probe latency in seconds"
    );
    describe_histogram!(
        "gateway_health_cycle_duration_seconds",
        "Duration of a full health check cycle"
    );
    describe_gauge!(
        "gateway_healthy_servers",
        "Healthy servers seen in the last health check cycle"
    );
    describe_counter!(
        "gateway_deregistrations_total",
        "Servers deregistered by reason (failures/admin)"
    );
    describe_counter!(
        "gateway_registrations_total",
        "Server registrations by initial health"
    );
}

pub fn start_prometheus(config: &MetricsConfig) -> Result<(), BuildError> {
    init_metrics();

    let duration_matcher = Matcher::Suffix(String::from("duration_seconds"));
    let duration_buckets = [
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
    ];

    let ip_addr: IpAddr = config
        .host
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
    let socket_addr = SocketAddr::new(ip_addr, config.port);

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .upkeep_timeout(Duration::from_secs(5 * 60))
        .set_buckets_for_metric(duration_matcher, &duration_buckets)?
        .install()
}

/// Model label for requests rejected before any server was selected. The
/// requested name is client input and must not become a label value.
pub const UNROUTED_MODEL: &str = "unknown";

pub struct GatewayMetrics;

impl GatewayMetrics {
    pub fn record_request(model: &str, outcome: &'static str) {
        counter!("gateway_requests_total",
            "model" => model.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    pub fn record_request_duration(duration: Duration) {
        histogram!("gateway_request_duration_seconds").record(duration.as_secs_f64());
    }

    pub fn record_upstream_failure(model: &str, kind: &'static str) {
        counter!("gateway_upstream_failures_total",
            "model" => model.to_string(),
            "kind" => kind
        )
        .increment(1);
    }

    pub fn record_retry(model: &str) {
        counter!("gateway_retries_total", "model" => model.to_string()).increment(1);
    }

    pub fn record_stream_outcome(model: &str, outcome: &'static str) {
        counter!("gateway_stream_outcomes_total",
            "model" => model.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    pub fn record_probe(healthy: bool, latency: Duration) {
        let result = if healthy { "healthy" } else { "unhealthy" };
        counter!("gateway_health_probes_total", "result" => result).increment(1);
        histogram!("gateway_health_probe_duration_seconds").record(latency.as_secs_f64());
    }

    pub fn record_health_cycle(duration: Duration, healthy_count: usize) {
        histogram!("gateway_health_cycle_duration_seconds").record(duration.as_secs_f64());
        gauge!("gateway_healthy_servers").set(healthy_count as f64);
    }

    pub fn record_deregistration(reason: &'static str) {
        counter!("gateway_deregistrations_total", "reason" => reason).increment(1);
    }

    pub fn record_registration(healthy: bool) {
        let initial = if healthy { "healthy" } else { "unhealthy" };
        counter!("gateway_registrations_total", "initial_health" => initial).increment(1);
    }
}
