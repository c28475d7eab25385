//! Consul agent announcer.
//!
//! Talks to the local Consul agent's HTTP API: services are registered with
//! the announced name as both ID and service name, and deregistered by the
//! same ID.

use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;

use super::Driver;

#[derive(Serialize)]
struct Registration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Address")]
    address: &'a str,
    #[serde(rename = "Port")]
    port: u16,
}

/// Announcer backed by a Consul agent.
pub struct ConsulDriver {
    client: Client,
    base: Url,
}

impl ConsulDriver {
    /// Create a driver for the agent at `url` (e.g. `http://127.0.0.1:8500`).
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let base = Url::parse(url).with_context(|| format!("bad Consul agent URL: {url}"))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to create Consul HTTP client")?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, path: &str) -> anyhow::Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("bad Consul endpoint path: {path}"))
    }
}

#[async_trait]
impl Driver for ConsulDriver {
    async fn expose(&self, name: &str, host: &str, port: u16) -> anyhow::Result<()> {
        let url = self.endpoint("/v1/agent/service/register")?;
        let body = Registration {
            id: name,
            name,
            address: host,
            port,
        };
        let response = self.client.put(url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "Consul rejected registration of {name}: {}",
                response.status()
            ));
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> anyhow::Result<()> {
        let url = self.endpoint(&format!("/v1/agent/service/deregister/{name}"))?;
        let response = self.client.put(url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "Consul rejected deregistration of {name}: {}",
                response.status()
            ));
        }
        Ok(())
    }
}
