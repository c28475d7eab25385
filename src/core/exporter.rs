//! Aggregate metrics snapshot over the running state.
//!
//! Composes the context readers into a flat set of gauge values per service
//! and per backend, ready for whatever scrape endpoint the embedding daemon
//! exposes. Collection takes the shared lock through the readers only, so a
//! service disappearing mid-walk is skipped, not an error.

use serde::Serialize;

use super::context::Context;

/// Gauge values for one virtual service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetrics {
    pub service: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    /// Mean backend health.
    pub health: f64,
    pub backends: u16,
}

/// Gauge values for one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendMetrics {
    pub service: String,
    pub backend: String,
    pub host: String,
    pub port: u16,
    pub health: f64,
    pub status: String,
    pub weight: i32,
    pub uptime_secs: f64,
}

/// One collection pass over every service and backend.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub services: Vec<ServiceMetrics>,
    pub backends: Vec<BackendMetrics>,
}

/// Walk the running state and collect all gauge values.
pub async fn collect(ctx: &Context) -> MetricsSnapshot {
    let mut snapshot = MetricsSnapshot::default();

    for vs_id in ctx.list_services().await {
        let Ok(service) = ctx.get_service(&vs_id).await else {
            continue;
        };

        snapshot.services.push(ServiceMetrics {
            service: vs_id.clone(),
            host: service.options.host.clone(),
            port: service.options.port,
            protocol: service.options.protocol.clone(),
            health: service.health,
            backends: service.backends_count,
        });

        for rs_id in service.backends {
            let Ok(backend) = ctx.get_backend(&vs_id, &rs_id).await else {
                continue;
            };
            snapshot.backends.push(BackendMetrics {
                service: vs_id.clone(),
                backend: rs_id,
                host: backend.options.host.clone(),
                port: backend.options.port,
                health: backend.metrics.health,
                status: backend.metrics.status.to_string(),
                weight: backend.options.weight,
                uptime_secs: backend.metrics.uptime.as_secs_f64(),
            });
        }
    }

    snapshot
}
