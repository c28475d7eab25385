//! Runtime entities: virtual services and their backends.
//!
//! These are the objects living inside the context's state map. A `Backend`
//! owns its probe task handle; dropping a backend without stopping the probe
//! still ends the task, but removal paths stop it explicitly first so the
//! final removed update is ordered before the map entry disappears.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

use super::options::{BackendOptions, ServiceOptions};
use crate::error::{Error, Result};
use crate::ipvs::ServiceEntry;
use crate::pulse::{self, Pulse, PulseHandle, PulseId, Update};
use crate::shutdown::Signal;

/// One real server behind a virtual service.
pub(crate) struct Backend {
    pub(crate) options: BackendOptions,
    /// Resolved destination address.
    pub(crate) ip: IpAddr,
    /// Handle to the probe task; exactly one per live backend.
    monitor: PulseHandle,
    /// Latest observed probe metrics.
    pub(crate) metrics: pulse::Metrics,
}

impl Backend {
    pub(crate) fn health(&self) -> f64 {
        self.metrics.health
    }

    /// Record a new weight, returning the previous one.
    pub(crate) fn update_weight(&mut self, weight: i32) -> i32 {
        std::mem::replace(&mut self.options.weight, weight)
    }

    /// Stop the probe task.
    pub(crate) fn stop_monitor(&self) {
        self.monitor.stop();
    }
}

/// One virtual service with its backends.
pub(crate) struct Service {
    pub(crate) vs_id: String,
    pub(crate) options: ServiceOptions,
    /// Kernel-level descriptor this service was programmed with.
    pub(crate) entry: ServiceEntry,
    pub(crate) backends: HashMap<String, Backend>,
}

impl Service {
    pub(crate) fn new(vs_id: String, options: ServiceOptions, entry: ServiceEntry) -> Self {
        Self {
            vs_id,
            options,
            entry,
            backends: HashMap::new(),
        }
    }

    pub(crate) fn backend_exists(&self, rs_id: &str) -> bool {
        self.backends.contains_key(rs_id)
    }

    /// Register a validated backend and start its probe task.
    pub(crate) fn register_backend(
        &mut self,
        rs_id: &str,
        options: BackendOptions,
        ip: IpAddr,
        updates: UnboundedSender<Update>,
        shutdown: Signal,
    ) -> Result<()> {
        info!(
            backend = rs_id,
            service = %self.vs_id,
            "registering new backend"
        );

        let pulse_options = self.options.pulse.clone().unwrap_or_default();
        let pulse = Pulse::new(&options.host, options.port, &pulse_options)
            .map_err(Error::Validation)?;
        let monitor = pulse.spawn(PulseId::new(&self.vs_id, rs_id), updates, shutdown);

        self.backends.insert(
            rs_id.to_string(),
            Backend {
                options,
                ip,
                monitor,
                metrics: pulse::Metrics::default(),
            },
        );
        Ok(())
    }

    /// Deregister a backend, stopping its probe first.
    pub(crate) fn remove_backend(&mut self, rs_id: &str) -> Result<BackendOptions> {
        let backend = self
            .backends
            .get(rs_id)
            .ok_or_else(|| Error::ObjectNotFound(format!("rsID: {rs_id}")))?;
        backend.stop_monitor();
        let backend = self
            .backends
            .remove(rs_id)
            .ok_or_else(|| Error::ObjectNotFound(format!("rsID: {rs_id}")))?;
        Ok(backend.options)
    }

    /// Stop every probe and drop all backends.
    pub(crate) fn cleanup(&mut self) {
        for (rs_id, backend) in self.backends.drain() {
            info!(
                backend = %rs_id,
                service = %self.vs_id,
                "cleaning up now orphaned backend"
            );
            backend.stop_monitor();
        }
    }

    /// Aggregate view over the live backends.
    pub(crate) fn stats(&self) -> ServiceInfo {
        let mut info = ServiceInfo {
            options: self.options.clone(),
            health: 0.0,
            backends: Vec::with_capacity(self.backends.len()),
            backends_count: self.backends.len() as u16,
            fallback: self.options.fallback.clone(),
        };

        if info.backends_count != 0 {
            for (rs_id, backend) in &self.backends {
                info.health += backend.health();
                info.backends.push(rs_id.clone());
            }
            info.health /= f64::from(info.backends_count);
        }
        // A service without backends cannot be healthy; health stays 0.

        info
    }
}

/// Information about a virtual service: its options, backends and overall
/// health.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub options: ServiceOptions,
    /// Arithmetic mean of backend healths; 0 with no backends.
    pub health: f64,
    pub backends: Vec<String>,
    pub backends_count: u16,
    pub fallback: String,
}

/// Information about a backend: its options and latest probe metrics.
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub options: BackendOptions,
    pub metrics: pulse::Metrics,
}
