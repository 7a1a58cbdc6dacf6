//! Prometheus text exposition format.
//!
//! Renders balancer stats, per-service snapshots, and circuit breaker
//! states for scraping by a Prometheus server or compatible agent.

use std::collections::BTreeMap;
use std::fmt::Write;

use zerogrid_core::{CircuitState, CircuitStats, LoadBalancerStats};

use crate::collector::ServiceSnapshot;

/// Render the balancer's metrics in Prometheus text format.
///
/// Balancer-wide figures are unlabelled; per-service figures carry a
/// `service` label and breaker figures a `circuit` label.
pub fn render_prometheus(
    stats: &LoadBalancerStats,
    services: &[ServiceSnapshot],
    circuits: &BTreeMap<String, CircuitStats>,
) -> String {
    let mut out = String::new();

    gauge(&mut out, "zerogrid_instances_active", "Instances in running state.", stats.active_instances);
    gauge(&mut out, "zerogrid_instances_total", "Instances in any state.", stats.total_instances);
    gauge(&mut out, "zerogrid_queued_requests_total", "Requests waiting for an instance.", stats.queued_requests);
    counter(&mut out, "zerogrid_requests_served_total", "Requests completed successfully.", stats.total_requests_served);
    gauge(&mut out, "zerogrid_requests_per_second", "Successful requests per second.", format_args!("{:.2}", stats.requests_per_second));
    gauge(&mut out, "zerogrid_latency_avg_ms", "Mean request latency in milliseconds.", format_args!("{:.2}", stats.avg_latency_ms));
    gauge(&mut out, "zerogrid_latency_p95_ms", "P95 request latency in milliseconds.", format_args!("{:.2}", stats.p95_latency_ms));
    gauge(&mut out, "zerogrid_latency_p99_ms", "P99 request latency in milliseconds.", format_args!("{:.2}", stats.p99_latency_ms));

    labelled(&mut out, "zerogrid_service_requests_served_total", "counter", "Requests completed successfully per service.", services, |s| s.requests_served.to_string());
    labelled(&mut out, "zerogrid_service_requests_failed_total", "counter", "Requests that ended in an error per service.", services, |s| s.requests_failed.to_string());
    labelled(&mut out, "zerogrid_service_requests_per_second", "gauge", "Successful requests per second per service.", services, |s| format!("{:.2}", s.requests_per_second));
    labelled(&mut out, "zerogrid_service_latency_p99_ms", "gauge", "P99 latency per service in milliseconds.", services, |s| format!("{:.2}", s.latency.p99_ms));
    labelled(&mut out, "zerogrid_service_queued_requests", "gauge", "Queue depth per service.", services, |s| s.queued_requests.to_string());
    labelled(&mut out, "zerogrid_service_running_instances", "gauge", "Running instances per service.", services, |s| s.running_instances.to_string());

    out.push_str("# HELP zerogrid_circuit_state Breaker state (0 closed, 1 half-open, 2 open).\n");
    out.push_str("# TYPE zerogrid_circuit_state gauge\n");
    for (key, c) in circuits {
        let _ = writeln!(out, "zerogrid_circuit_state{{circuit=\"{}\"}} {}", escape_label(key), state_value(c.state));
    }
    out.push_str("# HELP zerogrid_circuit_failures Consecutive failures per breaker.\n");
    out.push_str("# TYPE zerogrid_circuit_failures gauge\n");
    for (key, c) in circuits {
        let _ = writeln!(out, "zerogrid_circuit_failures{{circuit=\"{}\"}} {}", escape_label(key), c.failures);
    }

    out
}

fn gauge(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    sample(out, name, "gauge", help, value);
}

fn counter(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    sample(out, name, "counter", help, value);
}

fn sample(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}

fn labelled(
    out: &mut String,
    name: &str,
    kind: &str,
    help: &str,
    services: &[ServiceSnapshot],
    value: impl Fn(&ServiceSnapshot) -> String,
) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    for s in services {
        let _ = writeln!(out, "{name}{{service=\"{}\"}} {}", escape_label(&s.service_id), value(s));
    }
}

fn state_value(state: CircuitState) -> u8 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    }
}

/// Escape a label value per the exposition format.
fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::LatencySummary;

    fn test_stats() -> LoadBalancerStats {
        LoadBalancerStats {
            active_instances: 3,
            total_instances: 4,
            queued_requests: 7,
            total_requests_served: 1200,
            avg_latency_ms: 12.5,
            p95_latency_ms: 40.0,
            p99_latency_ms: 88.25,
            requests_per_second: 150.5,
            scaling_events: Vec::new(),
        }
    }

    fn test_snapshot(service_id: &str) -> ServiceSnapshot {
        ServiceSnapshot {
            service_id: service_id.to_string(),
            requests_served: 600,
            requests_failed: 3,
            requests_per_second: 75.25,
            latency: LatencySummary {
                avg_ms: 10.0,
                p95_ms: 30.0,
                p99_ms: 45.8,
            },
            queued_requests: 2,
            running_instances: 1,
        }
    }

    #[test]
    fn render_empty() {
        let output = render_prometheus(&LoadBalancerStats::default(), &[], &BTreeMap::new());
        assert!(output.contains("# TYPE zerogrid_requests_served_total counter"));
        assert!(output.contains("zerogrid_instances_active 0\n"));
        assert!(output.contains("# TYPE zerogrid_circuit_state gauge"));
    }

    #[test]
    fn render_balancer_and_services() {
        let output = render_prometheus(
            &test_stats(),
            &[test_snapshot("api"), test_snapshot("web")],
            &BTreeMap::new(),
        );

        assert!(output.contains("zerogrid_instances_total 4\n"));
        assert!(output.contains("zerogrid_requests_per_second 150.50\n"));
        assert!(output.contains("zerogrid_latency_p99_ms 88.25\n"));
        assert!(output.contains("zerogrid_service_requests_served_total{service=\"api\"} 600"));
        assert!(output.contains("zerogrid_service_requests_failed_total{service=\"web\"} 3"));
        assert!(output.contains("zerogrid_service_latency_p99_ms{service=\"api\"} 45.80"));
        assert!(output.contains("zerogrid_service_queued_requests{service=\"web\"} 2"));
    }

    #[test]
    fn render_circuits() {
        let mut circuits = BTreeMap::new();
        circuits.insert("api:i-1".to_string(), CircuitStats { state: CircuitState::Open, failures: 5 });
        circuits.insert("api:i-2".to_string(), CircuitStats { state: CircuitState::HalfOpen, failures: 0 });

        let output = render_prometheus(&test_stats(), &[], &circuits);
        assert!(output.contains("zerogrid_circuit_state{circuit=\"api:i-1\"} 2"));
        assert!(output.contains("zerogrid_circuit_state{circuit=\"api:i-2\"} 1"));
        assert!(output.contains("zerogrid_circuit_failures{circuit=\"api:i-1\"} 5"));
    }

    #[test]
    fn render_format_is_prometheus_compatible() {
        let output = render_prometheus(&test_stats(), &[test_snapshot("a\"b")], &BTreeMap::new());

        for line in output.lines() {
            if line.starts_with('#') {
                continue;
            }
            let (series, value) = line.rsplit_once(' ').expect("series and value");
            assert!(value.parse::<f64>().is_ok(), "bad value: {line}");
            assert!(!series.is_empty());
        }
        assert!(output.contains("service=\"a\\\"b\""));
    }
}
