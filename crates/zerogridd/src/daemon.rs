//! Serve mode: wires the factory, upstream, balancer and API together
//! and runs until Ctrl-C.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use zerogrid_balancer::{HttpUpstream, LoadBalancer};
use zerogrid_core::ZeroGridConfig;
use zerogrid_core::duration::format_duration;
use zerogrid_health::EndpointPoolFactory;

/// Build the balancer for `config` and register every configured service.
/// Control loops are not started.
pub async fn build_balancer(config: &ZeroGridConfig) -> anyhow::Result<Arc<LoadBalancer>> {
    let factory = Arc::new(EndpointPoolFactory::from_config(config));
    let upstream = Arc::new(HttpUpstream::default());
    let balancer = Arc::new(LoadBalancer::from_config(config, factory, upstream));

    for svc in &config.services {
        balancer
            .register_service(svc.definition.clone())
            .await
            .with_context(|| format!("register service {}", svc.definition.id))?;
        info!(
            service = %svc.definition.id,
            endpoints = svc.endpoints.len(),
            min = svc.definition.scaling.min_instances,
            max = svc.definition.scaling.max_instances,
            "service configured"
        );
    }
    Ok(balancer)
}

/// Run the daemon.
pub async fn run(config: ZeroGridConfig, addr: SocketAddr) -> anyhow::Result<()> {
    info!(services = config.services.len(), "ZeroGrid daemon starting");

    let balancer = build_balancer(&config).await?;
    balancer.start();

    let router = zerogrid_api::build_router(Arc::clone(&balancer));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "API server starting");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Stop the loops even when the server failed.
    balancer.stop().await;
    served?;

    info!("ZeroGrid daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

/// Human-readable summary printed by `check-config`.
pub fn summarize(config: &ZeroGridConfig) -> String {
    let mut out = String::new();
    let b = &config.balancer;
    let _ = writeln!(
        out,
        "balancer: request_timeout={} max_queue_size={} scaling_interval={} queue_interval={}",
        format_duration(b.request_timeout),
        b.max_queue_size,
        format_duration(b.scaling_interval),
        format_duration(b.queue_interval),
    );
    let cb = &config.circuit_breaker;
    let _ = writeln!(
        out,
        "circuit_breaker: failure_threshold={} reset_timeout={} half_open_requests={}",
        cb.failure_threshold,
        format_duration(cb.reset_timeout),
        cb.half_open_requests,
    );
    let _ = writeln!(out, "services: {}", config.services.len());
    for svc in &config.services {
        let d = &svc.definition;
        let _ = writeln!(
            out,
            "  {} ({}): instances {}..={} endpoints={} health={}",
            d.id,
            d.service_type,
            d.scaling.min_instances,
            d.scaling.max_instances,
            svc.endpoints.len(),
            d.health.path,
        );
    }
    out
}
