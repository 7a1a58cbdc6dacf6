//! `/svc/{service}/{*path}`: inbound traffic routed through the balancer.

use std::collections::HashMap;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::Response;
use tracing::debug;

use zerogrid_core::{UpstreamRequest, UpstreamResponse};

use crate::ApiState;
use crate::handlers::fabric_error;

/// ANY /svc/{service}/{*path}
pub async fn proxy(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let service = params.get("service").cloned().unwrap_or_default();
    let path_and_query = upstream_path(params.get("path").map(String::as_str), uri.query());

    let request = UpstreamRequest {
        method,
        path_and_query,
        headers,
        body,
    };
    debug!(%service, method = %request.method, path = %request.path_and_query, "proxying request");

    match state.balancer.route(&service, request).await {
        Ok(response) => into_response(response),
        Err(e) => {
            debug!(%service, error = %e, "proxied request failed");
            fabric_error(&e)
        }
    }
}

/// Path forwarded to the instance: the wildcard tail plus the query.
fn upstream_path(tail: Option<&str>, query: Option<&str>) -> String {
    let mut path = format!("/{}", tail.unwrap_or_default().trim_start_matches('/'));
    if let Some(q) = query {
        path.push('?');
        path.push_str(q);
    }
    path
}

fn into_response(upstream: UpstreamResponse) -> Response {
    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = upstream.headers;
    response
}
