//! Reconciliation against an external desired-state store.
//!
//! The store maps `vsID` to a [`ServiceConfig`] document. Reconciliation
//! reads all documents, diffs them against the running state
//! ([`Context::compare_with`]) and applies the difference
//! ([`Context::synchronize`]) under one exclusive lock.
//!
//! Apply replaces rather than patches: IPVS has no atomic update of
//! service-level parameters, so a changed service is torn down and
//! re-created, accepting the momentary traffic gap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::context::Context;
use super::options::{BackendOptions, ServiceOptions};
use crate::error::{Error, Result};
use crate::kv::{self, KvBackend};
use crate::shutdown::Shutdown;

/// Sync state values reported by [`SyncStatus`].
pub const SYNC_STATUS_OK: &str = "ok";
/// See [`SYNC_STATUS_OK`].
pub const SYNC_STATUS_NEEDED: &str = "need sync";

/// A sync pass running longer than this is reported as stuck.
const SYNC_DEADLINE: Duration = Duration::from_secs(60);

/// One service with its backends, as desired state describes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub service_options: ServiceOptions,
    pub service_backends: HashMap<String, BackendOptions>,
}

/// Store document shape; a document without options is ignored.
#[derive(Deserialize)]
#[serde(default)]
struct StoredServiceConfig {
    service_options: Option<ServiceOptions>,
    service_backends: HashMap<String, BackendOptions>,
}

impl Default for StoredServiceConfig {
    fn default() -> Self {
        Self {
            service_options: None,
            service_backends: HashMap::new(),
        }
    }
}

/// Difference between running and desired state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed_services: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed_backends: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub updated_services: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub updated_backends: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub new_services: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub new_backends: Vec<String>,
    /// `ok` when every bucket is empty, `need sync` otherwise.
    pub status: String,
}

impl SyncStatus {
    fn finalize(mut self) -> Self {
        let clean = self.removed_services.is_empty()
            && self.removed_backends.is_empty()
            && self.updated_services.is_empty()
            && self.updated_backends.is_empty()
            && self.new_services.is_empty()
            && self.new_backends.is_empty();
        self.status = if clean { SYNC_STATUS_OK } else { SYNC_STATUS_NEEDED }.to_string();
        self
    }

    /// Whether running and desired state already agree.
    pub fn in_sync(&self) -> bool {
        self.status == SYNC_STATUS_OK
    }
}

fn backend_name(vs_id: &str, rs_id: &str) -> String {
    format!("[{vs_id}/{rs_id}]")
}

impl Context {
    /// Diff the running state against `desired` without applying anything.
    pub async fn compare_with(&self, mut desired: HashMap<String, ServiceConfig>) -> SyncStatus {
        let services = self.services.read().await;
        let mut status = SyncStatus::default();

        for (vs_id, service) in services.iter() {
            let Some(mut desired_config) = desired.remove(vs_id) else {
                debug!(service = %vs_id, "service not found in store");
                status.removed_services.push(vs_id.clone());
                continue;
            };

            if !service.options.desired_eq(&desired_config.service_options) {
                debug!(service = %vs_id, "service is outdated");
                status.updated_services.push(vs_id.clone());
            }

            for (rs_id, backend) in &service.backends {
                match desired_config.service_backends.remove(rs_id) {
                    None => {
                        debug!(backend = %backend_name(vs_id, rs_id), "backend not found in store");
                        status.removed_backends.push(backend_name(vs_id, rs_id));
                    }
                    Some(desired_backend) => {
                        if !backend.options.desired_eq(&desired_backend) {
                            debug!(backend = %backend_name(vs_id, rs_id), "backend is outdated");
                            status.updated_backends.push(backend_name(vs_id, rs_id));
                        }
                    }
                }
            }

            for rs_id in desired_config.service_backends.keys() {
                debug!(backend = %backend_name(vs_id, rs_id), "new backend found");
                status.new_backends.push(backend_name(vs_id, rs_id));
            }
        }

        for vs_id in desired.keys() {
            debug!(service = %vs_id, "new service found");
            status.new_services.push(vs_id.clone());
        }

        status.finalize()
    }

    /// Converge the running state onto `desired`.
    ///
    /// Order of application: services are removed or replaced first, then
    /// backends of surviving services are diffed and replaced, then missing
    /// backends are created, then entirely new services.
    pub async fn synchronize(&self, mut desired: HashMap<String, ServiceConfig>) -> Result<()> {
        let mut services = self.services.write().await;
        info!("synchronizing with the store");

        // Remove or replace services.
        let running: Vec<String> = services.keys().cloned().collect();
        let mut surviving = Vec::new();
        for vs_id in running {
            if !desired.contains_key(&vs_id) {
                debug!(service = %vs_id, "service not in desired state, removing");
                // Take the destinations out of the kernel individually
                // before the service, so connections drain deterministically
                // instead of relying on the cascade.
                let backends: Vec<String> = services
                    .get(&vs_id)
                    .map(|vs| vs.backends.keys().cloned().collect())
                    .unwrap_or_default();
                for rs_id in backends {
                    self.remove_backend_locked(&mut services, &vs_id, &rs_id)
                        .await?;
                }
                self.remove_service_locked(&mut services, &vs_id).await?;
                continue;
            }

            let unchanged = match (services.get(&vs_id), desired.get(&vs_id)) {
                (Some(vs), Some(cfg)) => vs.options.desired_eq(&cfg.service_options),
                _ => false,
            };

            if unchanged {
                surviving.push(vs_id);
            } else if let Some(config) = desired.remove(&vs_id) {
                debug!(service = %vs_id, "service is outdated, replacing");
                self.remove_service_locked(&mut services, &vs_id).await?;
                self.create_service_locked(&mut services, &vs_id, &config)
                    .await?;
            }
        }

        // Diff backends of surviving services, then create missing ones.
        for vs_id in surviving {
            let Some(config) = desired.remove(&vs_id) else {
                continue;
            };
            let mut pending = config.service_backends;

            let running_backends: Vec<String> = services
                .get(&vs_id)
                .map(|vs| vs.backends.keys().cloned().collect())
                .unwrap_or_default();

            for rs_id in running_backends {
                match pending.remove(&rs_id) {
                    None => {
                        debug!(backend = %backend_name(&vs_id, &rs_id), "backend not in desired state, removing");
                        self.remove_backend_locked(&mut services, &vs_id, &rs_id)
                            .await?;
                    }
                    Some(desired_backend) => {
                        let unchanged = services
                            .get(&vs_id)
                            .and_then(|vs| vs.backends.get(&rs_id))
                            .is_some_and(|rs| rs.options.desired_eq(&desired_backend));
                        if !unchanged {
                            debug!(backend = %backend_name(&vs_id, &rs_id), "backend is outdated, replacing");
                            self.remove_backend_locked(&mut services, &vs_id, &rs_id)
                                .await?;
                            self.create_backend_locked(
                                &mut services,
                                &vs_id,
                                &rs_id,
                                &desired_backend,
                            )
                            .await?;
                        }
                    }
                }
            }

            if !pending.is_empty() {
                info!(service = %vs_id, count = pending.len(), "creating new backends");
            }
            for (rs_id, backend_options) in pending {
                self.create_backend_locked(&mut services, &vs_id, &rs_id, &backend_options)
                    .await?;
            }
        }

        // Entirely new services.
        if !desired.is_empty() {
            info!(count = desired.len(), "creating new services");
        }
        for (vs_id, config) in desired {
            self.create_service_locked(&mut services, &vs_id, &config)
                .await?;
        }

        info!("successfully synchronized with the store");
        Ok(())
    }
}

/// Handle to the external desired-state store.
pub struct Store {
    ctx: Arc<Context>,
    kv: Arc<dyn KvBackend>,
    service_path: String,
    backend_path: String,
    stop: Shutdown,
}

impl Store {
    /// Connect to a store addressed by `urls` and attach it to the context.
    ///
    /// Runs one initial sync; with a non-zero `sync_period` (seconds) a
    /// periodic reconciler task keeps running until [`Store::close`] or
    /// context shutdown.
    pub async fn new(
        ctx: Arc<Context>,
        urls: &[String],
        service_path: &str,
        backend_path: &str,
        sync_period: u64,
        use_tls: bool,
    ) -> Result<Arc<Self>> {
        let target = kv::parse_urls(urls)?;
        let backend = kv::connect(&target, use_tls)?;
        Self::with_backend(ctx, backend, &target.path, service_path, backend_path, sync_period)
            .await
    }

    /// Like [`Store::new`] but over an already-constructed backend.
    pub async fn with_backend(
        ctx: Arc<Context>,
        backend: Arc<dyn KvBackend>,
        root: &str,
        service_path: &str,
        backend_path: &str,
        sync_period: u64,
    ) -> Result<Arc<Self>> {
        let store = Arc::new(Self {
            ctx: Arc::clone(&ctx),
            kv: backend,
            service_path: kv::join_key(root, service_path),
            backend_path: kv::join_key(root, backend_path),
            stop: Shutdown::new(),
        });

        store
            .kv
            .create_dir(&store.service_path)
            .await
            .map_err(Error::Store)?;
        store
            .kv
            .create_dir(&store.backend_path)
            .await
            .map_err(Error::Store)?;

        ctx.set_store(&store);
        store.sync().await;

        if sync_period > 0 {
            let periodic = Arc::clone(&store);
            let mut stop = store.stop.subscribe();
            let mut ctx_stop = ctx.shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(sync_period));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The constructor already ran the first sync.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let started = Instant::now();
                            periodic.sync().await;
                            let elapsed = started.elapsed();
                            if elapsed > SYNC_DEADLINE {
                                error!(elapsed_secs = elapsed.as_secs(), "store sync exceeded deadline, reconciler may be stuck");
                            }
                        }
                        _ = stop.triggered() => break,
                        _ = ctx_stop.triggered() => break,
                    }
                }
                debug!("store reconciler stopped");
            });
        }

        Ok(store)
    }

    /// One reconciliation cycle. Transient store failures abandon the cycle;
    /// the next tick retries.
    pub async fn sync(&self) {
        let desired = match self.fetch_desired().await {
            Ok(desired) => desired,
            Err(e) => {
                error!(error = %e, "error while reading desired state from the store");
                return;
            }
        };

        if let Err(e) = self.ctx.synchronize(desired).await {
            error!(error = %e, "error while synchronizing with the store");
        }
    }

    /// Diff-only view of the current divergence.
    pub async fn sync_status(&self) -> Result<SyncStatus> {
        let desired = self.fetch_desired().await?;
        Ok(self.ctx.compare_with(desired).await)
    }

    /// Stop the periodic reconciler.
    pub fn close(&self) {
        self.stop.trigger();
    }

    /// Read and decode every service document under the service path.
    async fn fetch_desired(&self) -> Result<HashMap<String, ServiceConfig>> {
        let pairs = self
            .kv
            .list(&self.service_path)
            .await
            .map_err(Error::Store)?;

        let mut desired = HashMap::new();
        for pair in pairs {
            if pair.value.is_empty() {
                continue;
            }
            let id = kv::key_id(&pair.key).to_string();
            let stored: StoredServiceConfig = serde_json::from_slice(&pair.value)
                .map_err(|e| Error::Store(anyhow::anyhow!("bad document at {}: {e}", pair.key)))?;
            let Some(service_options) = stored.service_options else {
                continue;
            };

            let mut config = ServiceConfig {
                service_options,
                service_backends: stored.service_backends,
            };
            // Normalize defaults now so the diff compares like with like;
            // creation re-validates authoritatively.
            if let Err(e) = config.service_options.validate(None) {
                warn!(service = %id, error = %e, "desired service options failed validation");
            }
            desired.insert(id, config);
        }
        Ok(desired)
    }
}
