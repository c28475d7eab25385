//! Service-discovery announcers.
//!
//! The context announces virtual services through a [`Driver`] so the
//! discovery system stays pluggable. Announce failures are logged by the
//! caller and never block an operation; the [`NoneDriver`] lets everything
//! run without a discovery system at all.

mod consul;

pub use consul::ConsulDriver;

use std::sync::Arc;

use async_trait::async_trait;

/// Announce and withdraw named endpoints.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Publish `name` as an endpoint at `host:port`.
    async fn expose(&self, name: &str, host: &str, port: u16) -> anyhow::Result<()>;

    /// Withdraw a previously published name.
    async fn remove(&self, name: &str) -> anyhow::Result<()>;
}

/// Driver that announces nothing, so callers can treat discovery uniformly.
pub struct NoneDriver;

#[async_trait]
impl Driver for NoneDriver {
    async fn expose(&self, _name: &str, _host: &str, _port: u16) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remove(&self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Build a driver from an optional Consul agent URL.
pub fn from_url(url: Option<&str>) -> anyhow::Result<Arc<dyn Driver>> {
    match url {
        Some(url) if !url.is_empty() => Ok(Arc::new(ConsulDriver::new(url)?)),
        _ => Ok(Arc::new(NoneDriver)),
    }
}
