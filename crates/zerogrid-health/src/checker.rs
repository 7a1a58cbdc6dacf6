//! Health check probe logic.
//!
//! One-shot HTTP probes against an instance endpoint, and a readiness
//! wait that polls until the endpoint is healthy or a deadline passes.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use zerogrid_core::HealthCheckSpec;

/// Upper bound for a single probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(self) -> bool {
        self == ProbeResult::Healthy
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method(http::Method::GET)
            .uri(path)
            .header(http::header::HOST, address)
            .header(http::header::USER_AGENT, "zerogrid-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "health probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| {
        debug!(%uri, "health probe timed out");
        ProbeResult::Failed
    })
}

/// Probe `address` every `spec.interval` until it answers healthy or
/// `spec.timeout` has elapsed. Returns whether it became healthy.
pub async fn wait_until_healthy(address: &str, spec: &HealthCheckSpec) -> bool {
    let deadline = Instant::now() + spec.timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let probe_timeout = DEFAULT_PROBE_TIMEOUT.min(remaining).max(Duration::from_millis(1));

        if http_probe(address, &spec.path, probe_timeout).await.is_healthy() {
            debug!(%address, attempts, "endpoint became healthy");
            return true;
        }

        let next = Instant::now() + spec.interval;
        if next >= deadline {
            debug!(%address, attempts, "endpoint not healthy before timeout");
            return false;
        }
        tokio::time::sleep_until(next).await;
    }
}
