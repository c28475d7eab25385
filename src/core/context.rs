//! The context: authoritative state manager for services and backends.
//!
//! Every mutation of the virtual-server table goes through a [`Context`]
//! method. Write operations hold the exclusive lock for their whole
//! duration, kernel calls included, which gives a total order on state
//! changes; readers take the shared lock and see a consistent prefix of that
//! order.
//!
//! A kernel failure never mutates in-memory state: the map is only touched
//! after the corresponding IPVS call succeeded (or the kernel reported the
//! object already present). Discovery announcements and VIP aliases are
//! side effects: their failures are logged and tolerated.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};

use parking_lot::RwLock as SyncRwLock;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::entities::{BackendInfo, Service, ServiceInfo};
use super::notify;
use super::options::{self, BackendOptions, ServiceOptions};
use super::sync::{ServiceConfig, Store};
use crate::disco;
use crate::error::{Error, Result, ValidationError};
use crate::ipvs::{IpvsDriver, Pool, ServiceEntry};
use crate::pulse::Update;
use crate::shutdown::Shutdown;
use crate::vip::VipManager;

/// Name under which the daemon registers itself with discovery.
const SELF_SERVICE_NAME: &str = "larb";

/// Context construction options.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    /// Consul agent URL for discovery announcements; empty disables them.
    pub disco: Option<String>,
    /// Local endpoints; the first one doubles as the default service host.
    pub endpoints: Vec<IpAddr>,
    /// Flush the kernel table on startup.
    pub flush: bool,
    /// Port the daemon's own API is reachable on, announced via discovery.
    pub listen_port: u16,
    /// Link to add VIP aliases on.
    pub vip_interface: Option<String>,
}

/// The state manager. Construct with [`Context::new`], share as `Arc`.
pub struct Context {
    pub(crate) ipvs: Arc<dyn IpvsDriver>,
    pub(crate) disco: Arc<dyn disco::Driver>,
    endpoint: Option<IpAddr>,
    vip: Option<VipManager>,
    pub(crate) services: RwLock<HashMap<String, Service>>,
    pub(crate) pulse_tx: UnboundedSender<Update>,
    pub(crate) shutdown: Shutdown,
    store: SyncRwLock<Option<Weak<Store>>>,
}

impl Context {
    /// Create a context, building the discovery driver from the options.
    pub async fn new(options: ContextOptions, ipvs: Arc<dyn IpvsDriver>) -> Result<Arc<Self>> {
        let disco = disco::from_url(options.disco.as_deref())
            .map_err(|e| Error::Config(e.to_string()))?;
        Self::with_drivers(options, ipvs, disco).await
    }

    /// Create a context with explicit drivers.
    pub async fn with_drivers(
        options: ContextOptions,
        ipvs: Arc<dyn IpvsDriver>,
        disco: Arc<dyn disco::Driver>,
    ) -> Result<Arc<Self>> {
        info!("initializing IPVS context");

        if let Err(e) = ipvs.init().await {
            error!(error = %e, "unable to initialize IPVS context");
            return Err(e);
        }

        if options.flush {
            if let Err(e) = ipvs.flush().await {
                error!(error = %e, "unable to clean up IPVS pools - ensure ip_vs is loaded");
                ipvs.exit().await;
                return Err(e);
            }
        }

        let vip = match options.vip_interface.as_deref() {
            Some(link) if !link.is_empty() => match VipManager::new(link).await {
                Ok(manager) => {
                    info!(link, "VIPs will be added to interface");
                    Some(manager)
                }
                Err(e) => {
                    ipvs.exit().await;
                    return Err(Error::Config(e.to_string()));
                }
            },
            _ => None,
        };

        let (pulse_tx, pulse_rx) = mpsc::unbounded_channel();

        let ctx = Arc::new(Self {
            ipvs,
            disco,
            endpoint: options.endpoints.first().copied(),
            vip,
            services: RwLock::new(HashMap::new()),
            pulse_tx,
            shutdown: Shutdown::new(),
            store: SyncRwLock::new(None),
        });

        if let (Some(endpoint), true) = (ctx.endpoint, options.listen_port != 0) {
            if let Err(e) = ctx
                .disco
                .expose(SELF_SERVICE_NAME, &endpoint.to_string(), options.listen_port)
                .await
            {
                error!(error = %e, "unable to register the daemon with discovery");
            }
        }

        // Pulse notification sink; drains probe updates for the context's
        // whole lifetime.
        tokio::spawn(notify::run(
            Arc::clone(&ctx),
            pulse_rx,
            ctx.shutdown.subscribe(),
        ));

        Ok(ctx)
    }

    /// The daemon's default endpoint, used for services without a host.
    pub fn endpoint(&self) -> Option<IpAddr> {
        self.endpoint
    }

    /// Attach the external store handle.
    pub(crate) fn set_store(&self, store: &Arc<Store>) {
        *self.store.write() = Some(Arc::downgrade(store));
    }

    /// Whether an external store is attached and alive.
    pub fn store_exists(&self) -> bool {
        self.store
            .read()
            .as_ref()
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Find the kernel pool whose service matches `entry`'s address tuple.
    ///
    /// `Ok(None)` means the table was readable but holds no such service.
    pub(crate) async fn pool_for(&self, entry: &ServiceEntry) -> Result<Option<Pool>> {
        let pools = self.ipvs.pools().await.map_err(|e| {
            error!(error = %e, "failed to read pools from IPVS");
            e
        })?;
        debug!(count = pools.len(), "kernel pools");
        Ok(pools.into_iter().find(|p| p.service.same_tuple(entry)))
    }

    /// Register a new virtual service and its bundled backends.
    pub async fn create_service(&self, vs_id: &str, config: &ServiceConfig) -> Result<()> {
        let mut services = self.services.write().await;
        self.create_service_locked(&mut services, vs_id, config)
            .await
    }

    pub(crate) async fn create_service_locked(
        &self,
        services: &mut HashMap<String, Service>,
        vs_id: &str,
        config: &ServiceConfig,
    ) -> Result<()> {
        let mut service_options = config.service_options.clone();
        service_options.validate(self.endpoint)?;

        if services.contains_key(vs_id) {
            return Err(Error::ObjectExists(format!("vsID: {vs_id}")));
        }

        let vip = service_options
            .resolved
            .ok_or(ValidationError::MissingEndpoint)?;

        if let Some(manager) = &self.vip {
            match manager.add(vip).await {
                Ok(()) => {
                    service_options.del_if_addr = true;
                    info!(vip = %vip, link = manager.link(), "VIP alias added");
                }
                Err(e) => {
                    warn!(
                        vip = %vip,
                        link = manager.link(),
                        service = vs_id,
                        error = %e,
                        "failed to add VIP alias"
                    );
                }
            }
        }

        info!(
            service = vs_id,
            vip = %vip,
            port = service_options.port,
            "creating virtual service"
        );

        let flags = service_options.sched_flags();
        let entry = ServiceEntry {
            vip: vip.to_string(),
            port: service_options.port,
            protocol: service_options.protocol_num,
            sched: service_options.lb_method.clone(),
            flags,
        };

        // Racy against other processes by nature; "skip if already present"
        // keeps creation idempotent.
        if matches!(self.pool_for(&entry).await, Ok(Some(_))) {
            info!(
                vip = %entry.vip,
                port = entry.port,
                "service already present in the kernel, skipping creation"
            );
        } else {
            let programmed = if flags.is_empty() {
                self.ipvs
                    .add_service(&entry.vip, entry.port, entry.protocol, &entry.sched)
                    .await
            } else {
                self.ipvs
                    .add_service_with_flags(
                        &entry.vip,
                        entry.port,
                        entry.protocol,
                        &entry.sched,
                        &flags.to_wire(),
                    )
                    .await
            };
            if let Err(e) = programmed {
                error!(error = %e, "error while creating virtual service");
                return Err(e);
            }
        }

        services.insert(
            vs_id.to_string(),
            Service::new(vs_id.to_string(), service_options.clone(), entry),
        );

        if let Err(e) = self
            .disco
            .expose(vs_id, &vip.to_string(), service_options.port)
            .await
        {
            error!(error = %e, "error while exposing service to discovery");
        }

        // A failure here leaves the service installed with a subset of
        // backends; reconciliation converges it.
        for (rs_id, backend_options) in &config.service_backends {
            self.create_backend_locked(services, vs_id, rs_id, backend_options)
                .await?;
        }

        Ok(())
    }

    /// Register a new backend with a virtual service.
    pub async fn create_backend(
        &self,
        vs_id: &str,
        rs_id: &str,
        options: &BackendOptions,
    ) -> Result<()> {
        let mut services = self.services.write().await;
        self.create_backend_locked(&mut services, vs_id, rs_id, options)
            .await
    }

    pub(crate) async fn create_backend_locked(
        &self,
        services: &mut HashMap<String, Service>,
        vs_id: &str,
        rs_id: &str,
        options: &BackendOptions,
    ) -> Result<()> {
        let vs = services
            .get(vs_id)
            .ok_or_else(|| Error::ObjectNotFound(format!("vsID: {vs_id}")))?;
        if vs.backend_exists(rs_id) {
            return Err(Error::ObjectExists(format!("rsID: {rs_id}")));
        }

        let mut backend_options = options.clone();
        backend_options.validate()?;
        backend_options.vs_id = vs_id.to_string();

        let ip = backend_options
            .resolved
            .ok_or(ValidationError::MissingEndpoint)?;
        let service_ip = vs.options.resolved.ok_or(ValidationError::MissingEndpoint)?;
        if !options::same_family(ip, service_ip) {
            return Err(Error::IncompatibleAfs);
        }

        info!(
            backend = rs_id,
            host = %ip,
            port = backend_options.port,
            service = vs_id,
            "creating backend"
        );

        let pool = self.pool_for(&vs.entry).await?.ok_or_else(|| {
            error!(service = vs_id, "service missing from the kernel table");
            Error::ipvs(format!("no kernel pool for service {vs_id}"))
        })?;

        let dest_ip = ip.to_string();
        let max_weight = vs.options.max_weight;
        let already_present = pool
            .dests
            .iter()
            .any(|d| d.ip == dest_ip && d.port == backend_options.port);

        if already_present {
            info!(
                backend = rs_id,
                host = %dest_ip,
                port = backend_options.port,
                service = vs_id,
                "backend already present in the kernel, skipping creation"
            );
        } else if let Err(e) = self
            .ipvs
            .add_dest(
                &vs.entry.vip,
                vs.entry.port,
                &dest_ip,
                backend_options.port,
                vs.entry.protocol,
                max_weight,
                vs.options.method_id,
            )
            .await
        {
            error!(service = vs_id, backend = rs_id, error = %e, "error while creating backend");
            return Err(e);
        }

        // The kernel runs this destination at MaxWeight; the cached weight
        // must agree so the stash records real prior weights.
        backend_options.weight = max_weight;

        let vs = services
            .get_mut(vs_id)
            .ok_or_else(|| Error::ObjectNotFound(format!("vsID: {vs_id}")))?;
        vs.register_backend(
            rs_id,
            backend_options,
            ip,
            self.pulse_tx.clone(),
            self.shutdown.subscribe(),
        )
    }

    /// Update a backend's weight, returning the previous one.
    ///
    /// The dynamic weight is never written back to the external store: the
    /// store carries desired MaxWeight, not live weight.
    pub async fn update_backend(&self, vs_id: &str, rs_id: &str, weight: i32) -> Result<i32> {
        let mut services = self.services.write().await;
        self.update_backend_locked(&mut services, vs_id, rs_id, weight)
            .await
    }

    pub(crate) async fn update_backend_locked(
        &self,
        services: &mut HashMap<String, Service>,
        vs_id: &str,
        rs_id: &str,
        weight: i32,
    ) -> Result<i32> {
        let vs = services
            .get(vs_id)
            .ok_or_else(|| Error::ObjectNotFound(format!("vsID: {vs_id}")))?;
        let rs = vs
            .backends
            .get(rs_id)
            .ok_or_else(|| Error::ObjectNotFound(format!("rsID: {rs_id}")))?;

        info!(service = vs_id, backend = rs_id, weight, "updating backend weight");

        if let Err(e) = self
            .ipvs
            .update_dest(
                &vs.entry.vip,
                vs.entry.port,
                &rs.ip.to_string(),
                rs.options.port,
                vs.entry.protocol,
                weight,
                vs.options.method_id,
            )
            .await
        {
            error!(service = vs_id, backend = rs_id, error = %e, "error while updating backend");
            return Err(e);
        }

        let previous = services
            .get_mut(vs_id)
            .and_then(|vs| vs.backends.get_mut(rs_id))
            .map(|rs| rs.update_weight(weight))
            .ok_or_else(|| Error::ObjectNotFound(format!("rsID: {rs_id}")))?;
        Ok(previous)
    }

    /// Deregister a virtual service, returning its options.
    pub async fn remove_service(&self, vs_id: &str) -> Result<ServiceOptions> {
        let mut services = self.services.write().await;
        self.remove_service_locked(&mut services, vs_id).await
    }

    pub(crate) async fn remove_service_locked(
        &self,
        services: &mut HashMap<String, Service>,
        vs_id: &str,
    ) -> Result<ServiceOptions> {
        let vs = services
            .get(vs_id)
            .ok_or_else(|| Error::ObjectNotFound(format!("vsID: {vs_id}")))?;

        if let Some(manager) = &self.vip {
            if vs.options.del_if_addr {
                if let Some(ip) = vs.options.resolved {
                    match manager.remove(ip).await {
                        Ok(()) => info!(vip = %ip, link = manager.link(), "VIP alias removed"),
                        Err(e) => warn!(
                            vip = %ip,
                            link = manager.link(),
                            service = vs_id,
                            error = %e,
                            "failed to remove VIP alias"
                        ),
                    }
                }
            }
        }

        info!(
            service = vs_id,
            vip = %vs.entry.vip,
            port = vs.entry.port,
            "removing virtual service"
        );

        if let Err(e) = self
            .ipvs
            .del_service(&vs.entry.vip, vs.entry.port, vs.entry.protocol)
            .await
        {
            error!(service = vs_id, error = %e, "error while removing virtual service");
            return Err(e);
        }

        let mut vs = services
            .remove(vs_id)
            .ok_or_else(|| Error::ObjectNotFound(format!("vsID: {vs_id}")))?;
        vs.cleanup();

        if let Err(e) = self.disco.remove(vs_id).await {
            error!(error = %e, "error while removing service from discovery");
        }

        Ok(vs.options)
    }

    /// Deregister a backend, returning its options.
    pub async fn remove_backend(&self, vs_id: &str, rs_id: &str) -> Result<BackendOptions> {
        let mut services = self.services.write().await;
        self.remove_backend_locked(&mut services, vs_id, rs_id)
            .await
    }

    pub(crate) async fn remove_backend_locked(
        &self,
        services: &mut HashMap<String, Service>,
        vs_id: &str,
        rs_id: &str,
    ) -> Result<BackendOptions> {
        let vs = services
            .get(vs_id)
            .ok_or_else(|| Error::ObjectNotFound(format!("vsID: {vs_id}")))?;
        let rs = vs
            .backends
            .get(rs_id)
            .ok_or_else(|| Error::ObjectNotFound(format!("rsID: {rs_id}")))?;

        info!(service = vs_id, backend = rs_id, "removing backend");

        if let Err(e) = self
            .ipvs
            .del_dest(
                &vs.entry.vip,
                vs.entry.port,
                &rs.ip.to_string(),
                rs.options.port,
                vs.entry.protocol,
            )
            .await
        {
            error!(service = vs_id, backend = rs_id, error = %e, "error while removing backend");
            return Err(e);
        }

        let vs = services
            .get_mut(vs_id)
            .ok_or_else(|| Error::ObjectNotFound(format!("vsID: {vs_id}")))?;
        vs.remove_backend(rs_id)
    }

    /// Ids of all registered services, in unspecified order.
    pub async fn list_services(&self) -> Vec<String> {
        self.services.read().await.keys().cloned().collect()
    }

    /// Aggregate information about one service.
    pub async fn get_service(&self, vs_id: &str) -> Result<ServiceInfo> {
        let services = self.services.read().await;
        let vs = services
            .get(vs_id)
            .ok_or_else(|| Error::ObjectNotFound(format!("vsID: {vs_id}")))?;
        Ok(vs.stats())
    }

    /// Options and latest metrics of one backend.
    pub async fn get_backend(&self, vs_id: &str, rs_id: &str) -> Result<BackendInfo> {
        let services = self.services.read().await;
        let vs = services
            .get(vs_id)
            .ok_or_else(|| Error::ObjectNotFound(format!("vsID: {vs_id}")))?;
        let rs = vs
            .backends
            .get(rs_id)
            .ok_or_else(|| Error::ObjectNotFound(format!("rsID: {rs_id}")))?;
        Ok(BackendInfo {
            options: rs.options.clone(),
            metrics: rs.metrics.clone(),
        })
    }

    /// Shut down: stop background tasks, tear every service out of the
    /// kernel, release the driver.
    pub async fn close(&self) {
        info!("shutting down IPVS context");

        // Also ends the notification loop and every probe task.
        self.shutdown.trigger();

        let vs_ids = self.list_services().await;
        for vs_id in vs_ids {
            if let Err(e) = self.remove_service(&vs_id).await {
                error!(service = %vs_id, error = %e, "error while removing service during shutdown");
            }
        }

        self.ipvs.exit().await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::sync::ServiceConfig;
    use crate::ipvs::testing::{Call, RecordingIpvs};
    use crate::ipvs::{DestEntry, SchedFlags, IPPROTO_TCP, SCHED_SH_FALLBACK, SCHED_SH_PORT};
    use crate::pulse;

    /// Discovery fake recording every announcement.
    #[derive(Default)]
    pub(crate) struct RecordingDisco {
        pub exposed: parking_lot::Mutex<Vec<(String, String, u16)>>,
        pub removed: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl disco::Driver for RecordingDisco {
        async fn expose(&self, name: &str, host: &str, port: u16) -> anyhow::Result<()> {
            self.exposed.lock().push((name.into(), host.into(), port));
            Ok(())
        }

        async fn remove(&self, name: &str) -> anyhow::Result<()> {
            self.removed.lock().push(name.into());
            Ok(())
        }
    }

    pub(crate) async fn test_context() -> (Arc<Context>, Arc<RecordingIpvs>, Arc<RecordingDisco>) {
        let ipvs = Arc::new(RecordingIpvs::new());
        let disco = Arc::new(RecordingDisco::default());
        let ctx = Context::with_drivers(
            ContextOptions::default(),
            Arc::clone(&ipvs) as Arc<dyn IpvsDriver>,
            Arc::clone(&disco) as Arc<dyn disco::Driver>,
        )
        .await
        .unwrap();
        (ctx, ipvs, disco)
    }

    pub(crate) fn service_config(lb_method: &str, sh_flags: &str) -> ServiceConfig {
        ServiceConfig {
            service_options: crate::core::options::ServiceOptions {
                host: "localhost".into(),
                port: 80,
                protocol: "tcp".into(),
                lb_method: lb_method.into(),
                sh_flags: sh_flags.into(),
                pulse: Some(pulse::Options {
                    kind: "none".into(),
                    ..pulse::Options::default()
                }),
                ..crate::core::options::ServiceOptions::default()
            },
            service_backends: HashMap::new(),
        }
    }

    pub(crate) fn seeded_pool() -> Pool {
        Pool {
            service: ServiceEntry {
                vip: "127.0.0.1".into(),
                port: 80,
                protocol: IPPROTO_TCP,
                sched: "wrr".into(),
                flags: SchedFlags::default(),
            },
            dests: Vec::new(),
        }
    }

    pub(crate) fn backend_options(host: &str, port: u16) -> BackendOptions {
        BackendOptions {
            host: host.into(),
            port,
            ..BackendOptions::default()
        }
    }

    #[tokio::test]
    async fn test_service_is_created() {
        let (ctx, ipvs, disco) = test_context().await;
        ctx.create_service("vs1", &service_config("sh", ""))
            .await
            .unwrap();

        assert_eq!(
            ipvs.calls(),
            vec![Call::AddService {
                vip: "127.0.0.1".into(),
                port: 80,
                protocol: IPPROTO_TCP,
                sched: "sh".into(),
            }]
        );
        assert_eq!(
            disco.exposed.lock().as_slice(),
            &[("vs1".to_string(), "127.0.0.1".to_string(), 80)]
        );
    }

    #[tokio::test]
    async fn test_service_is_created_with_sh_flags() {
        let (ctx, ipvs, _disco) = test_context().await;
        ctx.create_service("vs1", &service_config("sh", "sh-port|sh-fallback"))
            .await
            .unwrap();

        let expected = SchedFlags(SCHED_SH_FALLBACK | SCHED_SH_PORT).to_wire().to_vec();
        assert_eq!(
            ipvs.calls(),
            vec![Call::AddServiceWithFlags {
                vip: "127.0.0.1".into(),
                port: 80,
                protocol: IPPROTO_TCP,
                sched: "sh".into(),
                flags: expected,
            }]
        );
    }

    #[tokio::test]
    async fn test_service_is_created_with_generic_custom_flags() {
        let (ctx, ipvs, _disco) = test_context().await;
        ctx.create_service("vs1", &service_config("sh", "flag-1|flag-2|flag-3"))
            .await
            .unwrap();

        match &ipvs.calls()[0] {
            Call::AddServiceWithFlags { flags, .. } => {
                assert_eq!(flags[..4], [0x38, 0, 0, 0]);
            }
            other => panic!("unexpected call: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_service_conflicts() {
        let (ctx, _ipvs, _disco) = test_context().await;
        ctx.create_service("vs1", &service_config("wrr", ""))
            .await
            .unwrap();
        let err = ctx
            .create_service("vs1", &service_config("wrr", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ObjectExists(_)));
    }

    #[tokio::test]
    async fn test_create_skips_kernel_when_pool_present() {
        let (ctx, ipvs, _disco) = test_context().await;
        ipvs.set_pools(vec![seeded_pool()]);

        ctx.create_service("vs1", &service_config("wrr", ""))
            .await
            .unwrap();

        assert!(ipvs.calls().is_empty(), "no kernel call expected");
        assert_eq!(ctx.list_services().await, vec!["vs1".to_string()]);
    }

    #[tokio::test]
    async fn test_create_service_kernel_failure_leaves_no_state() {
        let (ctx, ipvs, disco) = test_context().await;
        ipvs.fail("add_service");

        let err = ctx
            .create_service("vs1", &service_config("wrr", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IpvsSyscall(_)));
        assert!(ctx.list_services().await.is_empty());
        assert!(disco.exposed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_create_backend_programs_dest_at_max_weight() {
        let (ctx, ipvs, _disco) = test_context().await;
        ctx.create_service("vs1", &service_config("wrr", ""))
            .await
            .unwrap();
        ipvs.set_pools(vec![seeded_pool()]);

        ctx.create_backend("vs1", "rs1", &backend_options("127.0.0.1", 8080))
            .await
            .unwrap();

        let calls = ipvs.calls();
        assert_eq!(
            calls[1],
            Call::AddDest {
                vip: "127.0.0.1".into(),
                vport: 80,
                rip: "127.0.0.1".into(),
                rport: 8080,
                protocol: IPPROTO_TCP,
                weight: 100,
                fwd: crate::ipvs::FWD_MASQUERADE,
            }
        );

        let info = ctx.get_backend("vs1", "rs1").await.unwrap();
        assert_eq!(info.options.weight, 100);
    }

    #[tokio::test]
    async fn test_create_backend_skips_existing_dest() {
        let (ctx, ipvs, _disco) = test_context().await;
        ctx.create_service("vs1", &service_config("wrr", ""))
            .await
            .unwrap();

        let mut pool = seeded_pool();
        pool.dests.push(DestEntry {
            ip: "127.0.0.1".into(),
            port: 8080,
            weight: 100,
        });
        ipvs.set_pools(vec![pool]);

        ctx.create_backend("vs1", "rs1", &backend_options("127.0.0.1", 8080))
            .await
            .unwrap();

        assert!(
            !ipvs.calls().iter().any(|c| matches!(c, Call::AddDest { .. })),
            "destination must not be re-added"
        );
        assert!(ctx.get_backend("vs1", "rs1").await.is_ok());
    }

    #[tokio::test]
    async fn test_create_backend_rejects_mixed_families() {
        let (ctx, ipvs, _disco) = test_context().await;
        ctx.create_service("vs1", &service_config("wrr", ""))
            .await
            .unwrap();
        ipvs.set_pools(vec![seeded_pool()]);

        let err = ctx
            .create_backend("vs1", "rs1", &backend_options("::1", 8080))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IncompatibleAfs));
    }

    #[tokio::test]
    async fn test_create_backend_unknown_service() {
        let (ctx, _ipvs, _disco) = test_context().await;
        let err = ctx
            .create_backend("ghost", "rs1", &backend_options("127.0.0.1", 8080))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_backend_conflicts() {
        let (ctx, ipvs, _disco) = test_context().await;
        ctx.create_service("vs1", &service_config("wrr", ""))
            .await
            .unwrap();
        ipvs.set_pools(vec![seeded_pool()]);

        ctx.create_backend("vs1", "rs1", &backend_options("127.0.0.1", 8080))
            .await
            .unwrap();
        let err = ctx
            .create_backend("vs1", "rs1", &backend_options("127.0.0.1", 8080))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ObjectExists(_)));
    }

    #[tokio::test]
    async fn test_update_backend_returns_previous_weight() {
        let (ctx, ipvs, _disco) = test_context().await;
        ctx.create_service("vs1", &service_config("wrr", ""))
            .await
            .unwrap();
        ipvs.set_pools(vec![seeded_pool()]);
        ctx.create_backend("vs1", "rs1", &backend_options("127.0.0.1", 8080))
            .await
            .unwrap();

        assert_eq!(ctx.update_backend("vs1", "rs1", 40).await.unwrap(), 100);
        assert_eq!(ctx.update_backend("vs1", "rs1", 70).await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_update_backend_kernel_failure_keeps_weight() {
        let (ctx, ipvs, _disco) = test_context().await;
        ctx.create_service("vs1", &service_config("wrr", ""))
            .await
            .unwrap();
        ipvs.set_pools(vec![seeded_pool()]);
        ctx.create_backend("vs1", "rs1", &backend_options("127.0.0.1", 8080))
            .await
            .unwrap();

        ipvs.fail("update_dest");
        let err = ctx.update_backend("vs1", "rs1", 40).await.unwrap_err();
        assert!(matches!(err, Error::IpvsSyscall(_)));
        assert_eq!(
            ctx.get_backend("vs1", "rs1").await.unwrap().options.weight,
            100
        );
    }

    #[tokio::test]
    async fn test_remove_service_failure_keeps_state() {
        let (ctx, ipvs, _disco) = test_context().await;
        ctx.create_service("vs1", &service_config("wrr", ""))
            .await
            .unwrap();

        ipvs.fail("del_service");
        let err = ctx.remove_service("vs1").await.unwrap_err();
        assert!(matches!(err, Error::IpvsSyscall(_)));
        assert_eq!(ctx.list_services().await, vec!["vs1".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_service_withdraws_announcement() {
        let (ctx, ipvs, disco) = test_context().await;
        ctx.create_service("vs1", &service_config("wrr", ""))
            .await
            .unwrap();
        ipvs.set_pools(vec![seeded_pool()]);
        ctx.create_backend("vs1", "rs1", &backend_options("127.0.0.1", 8080))
            .await
            .unwrap();

        let options = ctx.remove_service("vs1").await.unwrap();
        assert_eq!(options.port, 80);
        assert!(ctx.list_services().await.is_empty());
        assert_eq!(disco.removed.lock().as_slice(), &["vs1".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_backend() {
        let (ctx, ipvs, _disco) = test_context().await;
        ctx.create_service("vs1", &service_config("wrr", ""))
            .await
            .unwrap();
        ipvs.set_pools(vec![seeded_pool()]);
        ctx.create_backend("vs1", "rs1", &backend_options("127.0.0.1", 8080))
            .await
            .unwrap();

        let options = ctx.remove_backend("vs1", "rs1").await.unwrap();
        assert_eq!(options.port, 8080);
        assert!(matches!(
            ctx.get_backend("vs1", "rs1").await,
            Err(Error::ObjectNotFound(_))
        ));

        assert!(ipvs
            .calls()
            .iter()
            .any(|c| matches!(c, Call::DelDest { rport: 8080, .. })));
    }

    #[tokio::test]
    async fn test_get_service_aggregates_health() {
        let (ctx, ipvs, _disco) = test_context().await;
        ctx.create_service("vs1", &service_config("wrr", ""))
            .await
            .unwrap();
        ipvs.set_pools(vec![seeded_pool()]);
        ctx.create_backend("vs1", "rs1", &backend_options("127.0.0.1", 8080))
            .await
            .unwrap();
        ctx.create_backend("vs1", "rs2", &backend_options("127.0.0.1", 8081))
            .await
            .unwrap();

        {
            let mut services = ctx.services.write().await;
            let vs = services.get_mut("vs1").unwrap();
            vs.backends.get_mut("rs1").unwrap().metrics.health = 1.0;
            vs.backends.get_mut("rs2").unwrap().metrics.health = 0.0;
        }

        let info = ctx.get_service("vs1").await.unwrap();
        assert_eq!(info.backends_count, 2);
        assert_eq!(info.health, 0.5);
        assert!(matches!(
            ctx.get_service("ghost").await,
            Err(Error::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_close_empties_the_kernel_table() {
        let (ctx, ipvs, _disco) = test_context().await;
        ctx.create_service("vs1", &service_config("wrr", ""))
            .await
            .unwrap();
        ctx.create_service("vs2", &service_config("wrr", ""))
            .await
            .unwrap();

        ctx.close().await;

        assert!(ctx.list_services().await.is_empty());
        let removals = ipvs
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::DelService { .. }))
            .count();
        assert_eq!(removals, 2);
        assert!(ctx.shutdown.is_triggered());
    }
}
