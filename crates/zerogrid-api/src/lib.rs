//! zerogrid-api — HTTP surface for ZeroGrid.
//!
//! Provides axum route handlers for inspecting and managing the load
//! balancer, plus the proxy route that sends traffic through it.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/services` | List registered services |
//! | POST | `/api/v1/services` | Register a service |
//! | DELETE | `/api/v1/services/{id}` | Unregister a service |
//! | GET | `/api/v1/services/{id}/instances` | List instances |
//! | GET | `/api/v1/services/{id}/metrics` | Request figures for one service |
//! | GET | `/api/v1/stats` | Balancer-wide stats |
//! | GET | `/api/v1/circuits` | Circuit breaker states |
//! | GET | `/api/v1/scaling-events` | Recent scaling events |
//! | GET | `/metrics` | Prometheus exposition |
//! | ANY | `/svc/{service}/{*path}` | Route a request through the balancer |

pub mod handlers;
pub mod proxy;

use std::sync::Arc;

use axum::Router;
use axum::routing::{any, delete, get};
use zerogrid_balancer::LoadBalancer;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub balancer: Arc<LoadBalancer>,
}

/// Build the complete router (REST + metrics + proxy).
pub fn build_router(balancer: Arc<LoadBalancer>) -> Router {
    let state = ApiState { balancer };

    let api_routes = Router::new()
        .route("/services", get(handlers::list_services).post(handlers::register_service))
        .route("/services/{id}", delete(handlers::unregister_service))
        .route("/services/{id}/instances", get(handlers::list_instances))
        .route("/services/{id}/metrics", get(handlers::get_service_metrics))
        .route("/stats", get(handlers::get_stats))
        .route("/circuits", get(handlers::list_circuits))
        .route("/scaling-events", get(handlers::list_scaling_events));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/svc/{service}", any(proxy::proxy))
        .route("/svc/{service}/{*path}", any(proxy::proxy))
        .with_state(state)
}
