//! Filesystem store backend (the `file` scheme).
//!
//! Keys map directly onto paths: directories are directories, values are
//! files. Listing reads the files directly under the prefix directory;
//! nothing is cached, so edits made by hand show up on the next sync.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs;

use super::{join_key, KvBackend, KvPair, WriteOptions};

/// Store backend over plain files.
#[derive(Default)]
pub struct FileBackend;

impl FileBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl KvBackend for FileBackend {
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<KvPair>> {
        let mut entries = match fs::read_dir(prefix).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("cannot list {prefix}")),
        };

        let mut pairs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("cannot list {prefix}"))?
        {
            let path = entry.path();
            if !entry
                .file_type()
                .await
                .with_context(|| format!("cannot stat {}", path.display()))?
                .is_file()
            {
                continue;
            }
            let value = fs::read(&path)
                .await
                .with_context(|| format!("cannot read {}", path.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            pairs.push(KvPair {
                key: join_key(prefix, &name),
                value,
            });
        }

        Ok(pairs)
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<KvPair>> {
        match fs::read(key).await {
            Ok(value) => Ok(Some(KvPair {
                key: key.to_string(),
                value,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("cannot read {key}")),
        }
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
        if let Some(parent) = Path::new(key).parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        fs::write(key, value)
            .await
            .with_context(|| format!("cannot write {key}"))
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        match fs::metadata(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("cannot stat {key}")),
        }
    }

    async fn delete_tree(&self, prefix: &str) -> anyhow::Result<()> {
        match fs::remove_dir_all(prefix).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("cannot remove {prefix}")),
        }
    }

    async fn create_dir(&self, path: &str) -> anyhow::Result<()> {
        fs::create_dir_all(path)
            .await
            .with_context(|| format!("cannot create {path}"))
    }
}
