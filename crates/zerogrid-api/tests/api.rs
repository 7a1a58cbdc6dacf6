//! Router-level tests: every route driven through `oneshot` against a
//! balancer backed by in-memory factory and upstream.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use zerogrid_api::build_router;
use zerogrid_autoscale::InstanceFactory;
use zerogrid_balancer::{LoadBalancer, Upstream};
use zerogrid_core::{
    Instance, InstanceStatus, ServiceDefinition, UpstreamRequest, UpstreamResponse, ZeroGridConfig,
};

#[derive(Default)]
struct Factory {
    created: AtomicU32,
}

#[async_trait]
impl InstanceFactory for Factory {
    async fn create(&self, service: &ServiceDefinition) -> anyhow::Result<Instance> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let mut inst = Instance::new(format!("{}-{n}", service.id), &service.id, "127.0.0.1:1");
        inst.status = InstanceStatus::Running;
        Ok(inst)
    }

    async fn destroy(&self, _instance: &Instance) -> anyhow::Result<()> {
        Ok(())
    }

    async fn health_check(&self, _instance: &Instance) -> bool {
        true
    }
}

/// Echoes method and path; paths under `/fail` are transport errors.
struct Echo;

#[async_trait]
impl Upstream for Echo {
    async fn forward(
        &self,
        _instance: &Instance,
        request: &UpstreamRequest,
    ) -> anyhow::Result<UpstreamResponse> {
        if request.path_and_query.starts_with("/fail") {
            anyhow::bail!("connection reset");
        }
        let mut response = UpstreamResponse::new(
            StatusCode::ACCEPTED,
            format!("{} {}", request.method, request.path_and_query),
        );
        response
            .headers
            .insert("x-echo-body-len", request.body.len().into());
        Ok(response)
    }
}

async fn app() -> (Router, Arc<LoadBalancer>) {
    let balancer = Arc::new(LoadBalancer::from_config(
        &ZeroGridConfig::default(),
        Arc::new(Factory::default()),
        Arc::new(Echo),
    ));
    balancer
        .register_service(ServiceDefinition::new("api", "API", "http"))
        .await
        .unwrap();
    (build_router(balancer.clone()), balancer)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let resp = app.clone().oneshot(request).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, headers, body)
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let (status, _, body) = send(app, Request::get(uri).body(Body::empty()).unwrap()).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn lists_registered_services() {
    let (app, _) = app().await;
    let (status, json) = get_json(&app, "/api/v1/services").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["data"][0]["id"], "api");
    assert_eq!(json["data"][0]["type"], "http");
}

#[tokio::test]
async fn register_maps_errors_to_status() {
    let (app, balancer) = app().await;

    let post = |body: &str| {
        Request::post("/api/v1/services")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    };

    let (status, _, _) = send(&app, post(r#"{"id":"worker","name":"Worker","type":"job"}"#)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(balancer.services().len(), 2);

    let (status, _, _) = send(&app, post(r#"{"id":"worker","name":"Worker","type":"job"}"#)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _, body) = send(&app, post(r#"{"id":"","name":"Empty","type":"job"}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["success"], false);
    assert!(json["error"].as_str().unwrap().contains("empty"));
}

#[tokio::test]
async fn proxy_routes_through_balancer() {
    let (app, balancer) = app().await;

    let request = Request::post("/svc/api/v1/items?limit=5")
        .body(Body::from("hello"))
        .unwrap();
    let (status, headers, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, b"POST /v1/items?limit=5");
    assert_eq!(headers["x-echo-body-len"], "5");
    assert_eq!(balancer.get_instances("api").unwrap().len(), 1);
    assert_eq!(balancer.get_stats().total_requests_served, 1);
}

#[tokio::test]
async fn proxy_service_root() {
    let (app, _) = app().await;
    let (status, _, body) = send(&app, Request::get("/svc/api").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, b"GET /");
}

#[tokio::test]
async fn proxy_unknown_service_is_404() {
    let (app, _) = app().await;
    let (status, json) = get_json(&app, "/svc/nope/anything").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn proxy_upstream_failure_is_502() {
    let (app, balancer) = app().await;
    let (status, json) = get_json(&app, "/svc/api/fail").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(json["error"].as_str().unwrap().contains("upstream error"));

    let circuits = balancer.get_circuit_stats();
    assert_eq!(circuits.len(), 1);
    assert_eq!(circuits.values().next().unwrap().failures, 1);
}

#[tokio::test]
async fn instances_and_service_metrics() {
    let (app, _) = app().await;
    let (status, _, _) = send(&app, Request::get("/svc/api/x").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, json) = get_json(&app, "/api/v1/services/api/instances").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"][0]["service_id"], "api");
    assert_eq!(json["data"][0]["status"], "running");
    assert_eq!(json["data"][0]["total_requests"], 1);

    let (status, json) = get_json(&app, "/api/v1/services/api/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["requests_served"], 1);
    assert_eq!(json["data"]["running_instances"], 1);

    let (status, _) = get_json(&app, "/api/v1/services/nope/instances").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = get_json(&app, "/api/v1/services/nope/metrics").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stats_circuits_and_events() {
    let (app, _) = app().await;
    send(&app, Request::get("/svc/api/x").body(Body::empty()).unwrap()).await;

    let (status, json) = get_json(&app, "/api/v1/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["total_instances"], 1);
    assert_eq!(json["data"]["total_requests_served"], 1);

    let (status, json) = get_json(&app, "/api/v1/circuits").await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["data"].is_object());

    let (status, json) = get_json(&app, "/api/v1/scaling-events?limit=1").await;
    assert_eq!(status, StatusCode::OK);
    let events = json["data"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["action"], "scale_up");
    assert_eq!(events[0]["service_id"], "api");
}

#[tokio::test]
async fn unregister_then_gone() {
    let (app, balancer) = app().await;

    let (status, _, body) = send(
        &app,
        Request::delete("/api/v1/services/api").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["data"]["rejected_requests"], 0);
    assert!(balancer.services().is_empty());

    let (status, _, _) = send(
        &app,
        Request::delete("/api/v1/services/api").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn prometheus_endpoint_returns_text() {
    let (app, _) = app().await;
    send(&app, Request::get("/svc/api/x").body(Body::empty()).unwrap()).await;

    let (status, headers, body) = send(&app, Request::get("/metrics").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE].to_str().unwrap().contains("text/plain"));
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("zerogrid_"));
    assert!(text.contains("service=\"api\""));
}
