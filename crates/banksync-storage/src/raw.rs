//! Raw capture stores: latest provider response per (connection, provider, external id).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use banksync_core::{RawRecord, RawRecordKey};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRawRecord {
    pub record_id: Uuid,
    pub content_hash: String,
    pub byte_size: usize,
    /// An earlier capture existed for the same key and was superseded.
    pub replaced: bool,
}

/// Schema-tolerant persistence for untouched provider payloads.
///
/// `store` always keeps the freshest capture for a key; payloads are opaque documents.
#[async_trait]
pub trait RawCaptureStore: Send + Sync {
    async fn store(&self, record: &RawRecord) -> anyhow::Result<StoredRawRecord>;

    async fn latest(
        &self,
        tenant_id: Uuid,
        key: &RawRecordKey,
    ) -> anyhow::Result<Option<RawRecord>>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn payload_hash(record: &RawRecord) -> anyhow::Result<(String, usize)> {
    let bytes = serde_json::to_vec(&record.payload).context("serializing raw payload")?;
    Ok((sha256_hex(&bytes), bytes.len()))
}

#[derive(Debug, Default)]
pub struct MemoryRawStore {
    records: RwLock<HashMap<RawRecordKey, RawRecord>>,
}

impl MemoryRawStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl RawCaptureStore for MemoryRawStore {
    async fn store(&self, record: &RawRecord) -> anyhow::Result<StoredRawRecord> {
        let (content_hash, byte_size) = payload_hash(record)?;
        let previous = self
            .records
            .write()
            .await
            .insert(record.key.clone(), record.clone());
        Ok(StoredRawRecord {
            record_id: record.id,
            content_hash,
            byte_size,
            replaced: previous.is_some(),
        })
    }

    async fn latest(
        &self,
        tenant_id: Uuid,
        key: &RawRecordKey,
    ) -> anyhow::Result<Option<RawRecord>> {
        Ok(self
            .records
            .read()
            .await
            .get(key)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }
}

/// One JSON file per record key, replaced atomically via temp-file rename.
#[derive(Debug, Clone)]
pub struct FileRawStore {
    root: PathBuf,
}

impl FileRawStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_relative_path(&self, tenant_id: Uuid, key: &RawRecordKey) -> PathBuf {
        let slug = key
            .external_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect::<String>();
        let digest = sha256_hex(key.external_id.as_bytes());
        PathBuf::from(tenant_id.to_string())
            .join(key.connection_id.to_string())
            .join(&key.provider)
            .join(format!("{slug}.{}.json", &digest[..12]))
    }
}

#[async_trait]
impl RawCaptureStore for FileRawStore {
    async fn store(&self, record: &RawRecord) -> anyhow::Result<StoredRawRecord> {
        let (content_hash, byte_size) = payload_hash(record)?;
        let relative_path = self.record_relative_path(record.tenant_id, &record.key);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating raw record directory {}", parent.display()))?;

        let replaced = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking raw record path {}", absolute_path.display()))?;

        let bytes = serde_json::to_vec_pretty(record).context("serializing raw record")?;
        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp raw record {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp raw record {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp raw record {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp raw record {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredRawRecord {
            record_id: record.id,
            content_hash,
            byte_size,
            replaced,
        })
    }

    async fn latest(
        &self,
        tenant_id: Uuid,
        key: &RawRecordKey,
    ) -> anyhow::Result<Option<RawRecord>> {
        let path = self.root.join(self.record_relative_path(tenant_id, key));
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking raw record path {}", path.display()))?
        {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading raw record {}", path.display()))?;
        let record: RawRecord = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing raw record {}", path.display()))?;
        Ok(Some(record).filter(|r| r.tenant_id == tenant_id))
    }
}
