//! Pluggable key-value stores for desired-state configuration.
//!
//! The reconciler reads and writes desired state through [`KvBackend`],
//! keeping the actual store system pluggable. Bundled backends:
//!
//! - `file` - plain files under a directory tree
//! - `mock` - in-memory, for tests and development
//! - `boltdb` - embedded redb database
//! - `consul` - Consul KV over the agent HTTP API
//!
//! The `etcd` and `zookeeper` schemes are recognized by the URL parser but
//! their drivers live outside this crate; selecting one reports a
//! configuration error.
//!
//! A store is addressed by one or more URLs. Every URL must carry the same
//! scheme and the same path; the shared path becomes the key prefix (or
//! filesystem root) all store keys live under.

mod consul;
mod file;
mod memory;
mod redb;

pub use consul::ConsulKvBackend;
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use redb::RedbBackend;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::error::{Error, Result};

/// One key with its stored document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
}

/// Options for a put operation.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Create a directory node instead of a value (tree-shaped stores).
    pub is_dir: bool,
    /// Expire the entry after this duration, where the backend supports it.
    pub ttl: Option<Duration>,
}

/// Operations every store backend provides.
///
/// Keys are slash-separated paths. Listing a prefix that does not exist
/// yields an empty result, not an error; transient failures are errors and
/// abandon the current reconciliation cycle.
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    /// List all entries directly under a prefix.
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<KvPair>>;

    /// Read one entry.
    async fn get(&self, key: &str) -> anyhow::Result<Option<KvPair>>;

    /// Write one entry.
    async fn put(&self, key: &str, value: &[u8], opts: Option<&WriteOptions>) -> anyhow::Result<()>;

    /// Whether a key exists.
    async fn exists(&self, key: &str) -> anyhow::Result<bool>;

    /// Remove a prefix and everything under it.
    async fn delete_tree(&self, prefix: &str) -> anyhow::Result<()>;

    /// Ensure a directory node exists (no-op for flat stores).
    async fn create_dir(&self, path: &str) -> anyhow::Result<()>;
}

/// Store backend schemes on the configuration boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    File,
    Consul,
    Etcd,
    Zookeeper,
    Boltdb,
    Mock,
}

impl Scheme {
    /// Wire name of this scheme.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Consul => "consul",
            Self::Etcd => "etcd",
            Self::Zookeeper => "zookeeper",
            Self::Boltdb => "boltdb",
            Self::Mock => "mock",
        }
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(Self::File),
            "consul" => Ok(Self::Consul),
            "etcd" => Ok(Self::Etcd),
            "zookeeper" => Ok(Self::Zookeeper),
            "boltdb" => Ok(Self::Boltdb),
            "mock" => Ok(Self::Mock),
            other => Err(Error::StoreConfig(format!(
                "unsupported store scheme: {other}"
            ))),
        }
    }
}

/// Parsed and validated multi-URL store address.
#[derive(Debug, Clone)]
pub struct StoreTarget {
    pub scheme: Scheme,
    pub hosts: Vec<String>,
    /// Shared URL path: key prefix or filesystem root.
    pub path: String,
}

/// Parse store URLs, enforcing that all share one scheme and one path.
pub fn parse_urls(urls: &[String]) -> Result<StoreTarget> {
    if urls.is_empty() {
        return Err(Error::StoreConfig("no store URLs given".into()));
    }

    let mut scheme: Option<(Scheme, String)> = None;
    let mut path: Option<String> = None;
    let mut hosts = Vec::new();

    for raw in urls {
        let url = Url::parse(raw)
            .map_err(|e| Error::StoreConfig(format!("bad store URL {raw}: {e}")))?;
        let raw_scheme = url.scheme().to_ascii_lowercase();

        if let Some((_, ref seen)) = scheme {
            if *seen != raw_scheme {
                return Err(Error::StoreConfig(
                    "schemes must be the same for all store URLs".into(),
                ));
            }
        } else {
            scheme = Some((raw_scheme.parse()?, raw_scheme.clone()));
        }

        let url_path = url.path().to_string();
        if let Some(ref seen) = path {
            if *seen != url_path {
                return Err(Error::StoreConfig(
                    "paths must be the same for all store URLs".into(),
                ));
            }
        } else {
            path = Some(url_path);
        }

        match url.host_str() {
            Some(host) if !host.is_empty() => match url.port() {
                Some(port) => hosts.push(format!("{host}:{port}")),
                None => hosts.push(host.to_string()),
            },
            _ => {}
        }
    }

    let (scheme, _) =
        scheme.ok_or_else(|| Error::StoreConfig("no store URLs given".into()))?;
    Ok(StoreTarget {
        scheme,
        hosts,
        path: path.unwrap_or_default(),
    })
}

/// Build the backend for a parsed store target.
pub fn connect(target: &StoreTarget, use_tls: bool) -> Result<Arc<dyn KvBackend>> {
    match target.scheme {
        Scheme::File => Ok(Arc::new(FileBackend::new())),
        Scheme::Mock => Ok(Arc::new(MemoryBackend::new())),
        Scheme::Boltdb => {
            let backend = RedbBackend::open(&target.path)
                .map_err(|e| Error::StoreConfig(format!("cannot open {}: {e}", target.path)))?;
            Ok(Arc::new(backend))
        }
        Scheme::Consul => {
            let host = target
                .hosts
                .first()
                .ok_or_else(|| Error::StoreConfig("consul store needs a host".into()))?;
            let backend = ConsulKvBackend::new(host, use_tls)
                .map_err(|e| Error::StoreConfig(e.to_string()))?;
            Ok(Arc::new(backend))
        }
        Scheme::Etcd | Scheme::Zookeeper => Err(Error::StoreConfig(format!(
            "no bundled driver for scheme: {}",
            target.scheme.as_str()
        ))),
    }
}

/// Join two slash-separated key segments.
pub fn join_key(base: &str, segment: &str) -> String {
    let base = base.trim_end_matches('/');
    let segment = segment.trim_start_matches('/');
    if base.is_empty() {
        segment.to_string()
    } else if segment.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{segment}")
    }
}

/// Final path segment of a key, used as the object id.
pub fn key_id(key: &str) -> &str {
    key.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(key)
}
