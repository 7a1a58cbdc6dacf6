//! Forwarding a request to the instance chosen by the dispatcher.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::debug;

use zerogrid_core::{Instance, UpstreamRequest, UpstreamResponse};

/// Delivers a request to one instance.
///
/// `Err` means the instance could not serve the request at all
/// (connection refused, reset, malformed response); it counts against
/// the instance's circuit. Any HTTP response, including 5xx, is `Ok`.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward(
        &self,
        instance: &Instance,
        request: &UpstreamRequest,
    ) -> anyhow::Result<UpstreamResponse>;
}

/// HTTP/1.1 forwarder opening one connection per request.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    connect_timeout: Duration,
}

impl HttpUpstream {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for HttpUpstream {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(
        &self,
        instance: &Instance,
        request: &UpstreamRequest,
    ) -> anyhow::Result<UpstreamResponse> {
        let address = instance.endpoint.as_str();
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .with_context(|| format!("connect to {address} timed out"))?
            .with_context(|| format!("connect to {address}"))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .with_context(|| format!("http handshake with {address}"))?;

        // Drive the connection in the background.
        let endpoint = address.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(%endpoint, error = %e, "upstream connection closed with error");
            }
        });

        let path = if request.path_and_query.is_empty() {
            "/"
        } else {
            request.path_and_query.as_str()
        };
        let mut req = http::Request::builder()
            .method(request.method.clone())
            .uri(path)
            .body(Full::new(request.body.clone()))
            .context("build upstream request")?;

        let headers = req.headers_mut();
        copy_end_to_end(&request.headers, headers);
        headers.insert(
            header::HOST,
            HeaderValue::from_str(address).context("endpoint is not a valid host header")?,
        );

        let resp = sender
            .send_request(req)
            .await
            .with_context(|| format!("send request to {address}"))?;
        let (parts, body) = resp.into_parts();
        let body = body
            .collect()
            .await
            .with_context(|| format!("read response body from {address}"))?
            .to_bytes();

        let mut headers = HeaderMap::new();
        copy_end_to_end(&parts.headers, &mut headers);

        Ok(UpstreamResponse {
            status: parts.status,
            headers,
            body,
        })
    }
}

/// Headers that describe a single connection and must not be forwarded.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}

fn copy_end_to_end(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if !is_hop_by_hop(name) {
            to.append(name.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::{get, post};
    use bytes::Bytes;
    use http::{Method, StatusCode};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    fn instance(endpoint: &str) -> Instance {
        Instance::new("i-1", "api", endpoint)
    }

    #[tokio::test]
    async fn forwards_method_path_headers_and_body() {
        let app = Router::new()
            .route(
                "/echo",
                post(|headers: HeaderMap, body: Bytes| async move {
                    let tag = headers
                        .get("x-tag")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    (StatusCode::CREATED, [("x-echo-tag", tag)], body)
                }),
            )
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }));
        let endpoint = serve(app).await;
        let upstream = HttpUpstream::default();

        let mut request = UpstreamRequest::new(Method::POST, "/echo").with_body("payload");
        request
            .headers
            .insert("x-tag", HeaderValue::from_static("blue"));
        request
            .headers
            .insert(header::CONNECTION, HeaderValue::from_static("close"));

        let resp = upstream.forward(&instance(&endpoint), &request).await.unwrap();
        assert_eq!(resp.status, StatusCode::CREATED);
        assert_eq!(resp.body, Bytes::from_static(b"payload"));
        assert_eq!(resp.headers.get("x-echo-tag").unwrap(), "blue");

        let resp = upstream
            .forward(&instance(&endpoint), &UpstreamRequest::get("/missing"))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn connection_refused_is_an_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = HttpUpstream::default()
            .forward(&instance(&addr), &UpstreamRequest::get("/"))
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn hop_by_hop_headers_filtered() {
        let mut from = HeaderMap::new();
        from.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        from.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        from.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let mut to = HeaderMap::new();
        copy_end_to_end(&from, &mut to);
        assert_eq!(to.len(), 1);
        assert!(to.contains_key(header::CONTENT_TYPE));
    }
}
