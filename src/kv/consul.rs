//! Consul KV store backend (the `consul` scheme).
//!
//! Uses the agent's HTTP KV API. Listing asks for the key names under a
//! prefix and fetches each value raw, so no payload decoding is involved.
//! Directory nodes follow the Consul convention of a trailing slash.

use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};

use super::{KvBackend, KvPair, WriteOptions};

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Store backend over the Consul KV HTTP API.
pub struct ConsulKvBackend {
    client: Client,
    base: Url,
}

impl ConsulKvBackend {
    /// Create a backend for the agent at `host` (`host` or `host:port`).
    pub fn new(host: &str, use_tls: bool) -> anyhow::Result<Self> {
        let scheme = if use_tls { "https" } else { "http" };
        let base = Url::parse(&format!("{scheme}://{host}"))
            .with_context(|| format!("bad Consul host: {host}"))?;
        let client = Client::builder()
            .timeout(CONNECTION_TIMEOUT)
            .build()
            .context("failed to create Consul HTTP client")?;
        Ok(Self { client, base })
    }

    fn kv_url(&self, key: &str) -> anyhow::Result<Url> {
        // Consul keys never start with a slash.
        let key = key.trim_start_matches('/');
        self.base
            .join(&format!("/v1/kv/{key}"))
            .with_context(|| format!("bad store key: {key}"))
    }
}

#[async_trait]
impl KvBackend for ConsulKvBackend {
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<KvPair>> {
        let mut url = self.kv_url(&format!("{}/", prefix.trim_end_matches('/')))?;
        url.set_query(Some("keys"));

        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = response.error_for_status()?.json().await?;

        let mut pairs = Vec::new();
        for key in keys {
            if key.ends_with('/') {
                continue;
            }
            if let Some(pair) = self.get(&key).await? {
                pairs.push(pair);
            }
        }
        Ok(pairs)
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<KvPair>> {
        let mut url = self.kv_url(key)?;
        url.set_query(Some("raw"));

        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value = response.error_for_status()?.bytes().await?;
        Ok(Some(KvPair {
            key: key.trim_start_matches('/').to_string(),
            value: value.to_vec(),
        }))
    }

    async fn put(
        &self,
        key: &str,
        value: &[u8],
        opts: Option<&WriteOptions>,
    ) -> anyhow::Result<()> {
        if opts.is_some_and(|o| o.is_dir) {
            return self.create_dir(key).await;
        }
        let url = self.kv_url(key)?;
        let response = self.client.put(url).body(value.to_vec()).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("Consul rejected put of {key}: {}", response.status()));
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete_tree(&self, prefix: &str) -> anyhow::Result<()> {
        let mut url = self.kv_url(prefix)?;
        url.set_query(Some("recurse"));
        let response = self.client.delete(url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "Consul rejected delete of {prefix}: {}",
                response.status()
            ));
        }
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> anyhow::Result<()> {
        let url = self.kv_url(&format!("{}/", path.trim_end_matches('/')))?;
        let response = self.client.put(url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "Consul rejected directory {path}: {}",
                response.status()
            ));
        }
        Ok(())
    }
}
