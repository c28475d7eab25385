//! Embedded database store backend (the `boltdb` scheme).
//!
//! A single-file ACID store backed by redb. Directory nodes are implicit,
//! so `create_dir` has nothing to create beyond the database file itself.
//! TTLs are not supported by this backend and are ignored.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use super::{KvBackend, KvPair, WriteOptions};

const STORE_TABLE: TableDefinition<'static, &'static str, &'static [u8]> =
    TableDefinition::new("store");

/// Store backend over an embedded redb database file.
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<Database>,
}

impl RedbBackend {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }

        let db = Database::create(path)
            .with_context(|| format!("cannot open store database {}", path.display()))?;

        // Create the table up front so reads on a fresh file succeed.
        let txn = db.begin_write().context("init transaction")?;
        txn.open_table(STORE_TABLE).context("init store table")?;
        txn.commit().context("init commit")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn list_sync(&self, prefix: &str) -> anyhow::Result<Vec<KvPair>> {
        let subtree = format!("{}/", prefix.trim_end_matches('/'));
        let txn = self.db.begin_read().context("read transaction")?;
        let table = txn.open_table(STORE_TABLE).context("open store table")?;

        let mut pairs = Vec::new();
        for item in table.iter().context("iterate store table")? {
            let (key, value) = item.context("read store entry")?;
            if key.value().starts_with(&subtree) {
                pairs.push(KvPair {
                    key: key.value().to_string(),
                    value: value.value().to_vec(),
                });
            }
        }
        Ok(pairs)
    }

    fn get_sync(&self, key: &str) -> anyhow::Result<Option<KvPair>> {
        let txn = self.db.begin_read().context("read transaction")?;
        let table = txn.open_table(STORE_TABLE).context("open store table")?;
        Ok(table
            .get(key)
            .with_context(|| format!("read {key}"))?
            .map(|guard| KvPair {
                key: key.to_string(),
                value: guard.value().to_vec(),
            }))
    }

    fn put_sync(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let txn = self.db.begin_write().context("write transaction")?;
        {
            let mut table = txn.open_table(STORE_TABLE).context("open store table")?;
            table.insert(key, value).with_context(|| format!("write {key}"))?;
        }
        txn.commit().context("commit write")
    }

    fn delete_tree_sync(&self, prefix: &str) -> anyhow::Result<()> {
        let subtree = format!("{}/", prefix.trim_end_matches('/'));
        let txn = self.db.begin_write().context("write transaction")?;
        {
            let mut table = txn.open_table(STORE_TABLE).context("open store table")?;
            let doomed: Vec<String> = table
                .iter()
                .context("iterate store table")?
                .filter_map(|item| item.ok())
                .map(|(key, _)| key.value().to_string())
                .filter(|key| key == prefix || key.starts_with(&subtree))
                .collect();
            for key in doomed {
                table
                    .remove(key.as_str())
                    .with_context(|| format!("remove {key}"))?;
            }
        }
        txn.commit().context("commit delete")
    }
}

#[async_trait]
impl KvBackend for RedbBackend {
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<KvPair>> {
        let backend = self.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || backend.list_sync(&prefix))
            .await
            .context("task join")?
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<KvPair>> {
        let backend = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || backend.get_sync(&key))
            .await
            .context("task join")?
    }

    async fn put(
        &self,
        key: &str,
        value: &[u8],
        _opts: Option<&WriteOptions>,
    ) -> anyhow::Result<()> {
        let backend = self.clone();
        let key = key.to_string();
        let value = value.to_vec();
        tokio::task::spawn_blocking(move || backend.put_sync(&key, &value))
            .await
            .context("task join")?
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete_tree(&self, prefix: &str) -> anyhow::Result<()> {
        let backend = self.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || backend.delete_tree_sync(&prefix))
            .await
            .context("task join")?
    }

    async fn create_dir(&self, _path: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
