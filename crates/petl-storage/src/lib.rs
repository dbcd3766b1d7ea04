//! Blob storage seam + reference-data cache for partner ETL.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "petl-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no blob stored at `{0}`")]
    NotFound(String),
    #[error("invalid blob key `{0}`")]
    InvalidKey(String),
    #[error("storage io failure for `{key}`: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    fn io(key: &str, source: std::io::Error) -> Self {
        Self::Io {
            key: key.to_string(),
            source,
        }
    }
}

/// Flat key/value blob storage addressed by `/`-separated keys.
///
/// Single-object writes and deletes are atomic; there are no cross-object transactions.
/// Deleting a missing key is not an error.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn BlobStore,
    key: &str,
    value: &T,
) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).with_context(|| format!("serializing {key}"))?;
    store
        .put(key, bytes)
        .await
        .with_context(|| format!("writing {key}"))
}

pub async fn get_json<T: DeserializeOwned>(store: &dyn BlobStore, key: &str) -> anyhow::Result<T> {
    let bytes = store.get(key).await.with_context(|| format!("reading {key}"))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {key}"))
}

/// Delete every blob under `prefix`, returning how many were removed.
pub async fn delete_prefix(store: &dyn BlobStore, prefix: &str) -> Result<usize, StorageError> {
    let keys = store.list(prefix).await?;
    for key in &keys {
        store.delete(key).await?;
    }
    Ok(keys.len())
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && key
            .split('/')
            .all(|segment| !segment.is_empty() && !segment.starts_with('.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

/// Prefixes may end in a partial segment (`a/b/P1_`) or a trailing `/`.
fn validate_prefix(prefix: &str) -> Result<(), StorageError> {
    let escapes = prefix
        .split('/')
        .any(|segment| segment == ".." || segment == ".");
    if prefix.starts_with('/') || escapes {
        Err(StorageError::InvalidKey(prefix.to_string()))
    } else {
        Ok(())
    }
}

/// Write bytes to `path` through a temp file in the same directory and an atomic rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Blob store rooted at a local directory; keys map onto relative paths.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, seg| path.join(seg)))
    }

    async fn collect_keys(
        &self,
        start: PathBuf,
        start_key: String,
        prefix: &str,
    ) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut pending = vec![(start, start_key)];

        while let Some((dir, dir_key)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StorageError::io(prefix, err)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| StorageError::io(prefix, err))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let key = if dir_key.is_empty() {
                    name
                } else {
                    format!("{dir_key}/{name}")
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| StorageError::io(&key, err))?;
                if file_type.is_dir() {
                    if key.starts_with(prefix) || prefix.starts_with(&format!("{key}/")) {
                        pending.push((entry.path(), key));
                    }
                } else if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        write_atomic(&path, &bytes).await.map_err(|err| {
            StorageError::io(key, std::io::Error::new(ErrorKind::Other, format!("{err:#}")))
        })?;
        debug!(key, bytes = bytes.len(), "stored blob");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(err) => Err(StorageError::io(key, err)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        validate_prefix(prefix)?;
        // Walk from the deepest directory the prefix fully names.
        let (start, start_key) = match prefix.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => (
                dir.split('/').fold(self.root.clone(), |path, seg| path.join(seg)),
                dir.to_string(),
            ),
            _ => (self.root.clone(), String::new()),
        };
        self.collect_keys(start, start_key, prefix).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key, "deleted blob");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io(key, err)),
        }
    }
}

/// In-process blob store, used for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.lock().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        validate_key(key)?;
        self.blobs.lock().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        validate_key(key)?;
        self.blobs
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        validate_prefix(prefix)?;
        let blobs = self.blobs.lock().await;
        Ok(blobs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        self.blobs.lock().await.remove(key);
        Ok(())
    }
}

/// Occupation code → title lookup. Non-temporal reference data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OccupationTaxonomy {
    titles: BTreeMap<String, String>,
}

impl OccupationTaxonomy {
    pub fn new(titles: BTreeMap<String, String>) -> Self {
        Self { titles }
    }

    pub fn title_for(&self, code: &str) -> Option<&str> {
        self.titles.get(code).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.titles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.titles.is_empty()
    }
}

/// Reference taxonomy cached in a local directory, independent of quarter.
///
/// The blob at `storage_path` is fetched at most once per cache directory: the
/// first load writes a local copy, and every later load (including from a fresh
/// `ReferenceCache`) reads that copy instead of the store.
pub struct ReferenceCache {
    store: Arc<dyn BlobStore>,
    cache_dir: PathBuf,
    storage_path: String,
    taxonomy: OnceCell<Arc<OccupationTaxonomy>>,
}

impl ReferenceCache {
    pub fn new(
        store: Arc<dyn BlobStore>,
        cache_dir: impl Into<PathBuf>,
        storage_path: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cache_dir: cache_dir.into(),
            storage_path: storage_path.into(),
            taxonomy: OnceCell::new(),
        }
    }

    pub fn local_path(&self) -> PathBuf {
        self.cache_dir.join(self.storage_path.replace('/', "__"))
    }

    pub async fn taxonomy(&self) -> anyhow::Result<Arc<OccupationTaxonomy>> {
        self.taxonomy
            .get_or_try_init(|| self.load())
            .await
            .map(Arc::clone)
    }

    async fn load(&self) -> anyhow::Result<Arc<OccupationTaxonomy>> {
        let local = self.local_path();
        let bytes = if fs::try_exists(&local)
            .await
            .with_context(|| format!("checking cache file {}", local.display()))?
        {
            debug!(path = %local.display(), "reading cached taxonomy");
            fs::read(&local)
                .await
                .with_context(|| format!("reading cache file {}", local.display()))?
        } else {
            info!(storage_path = %self.storage_path, "fetching taxonomy into local cache");
            let bytes = self
                .store
                .get(&self.storage_path)
                .await
                .with_context(|| format!("fetching taxonomy {}", self.storage_path))?;
            write_atomic(&local, &bytes).await?;
            bytes
        };

        let taxonomy: OccupationTaxonomy = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing taxonomy {}", self.storage_path))?;
        Ok(Arc::new(taxonomy))
    }
}
