//! Big-column blob backends.

use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ktable_codec::BlobStore;
use ktable_common::{human_bytes, BlobId, KtableError, Result};
use tracing::{debug, info, warn};

use crate::cache::Cache;

/// Blobs as `{blob_id}.big` files in one directory.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_of(&self, id: &BlobId) -> PathBuf {
        self.root.join(format!("{id}.big"))
    }
}

impl BlobStore for LocalBlobStore {
    fn fetch(&self, id: &BlobId) -> Result<Vec<u8>> {
        debug!(blob_id = %id, "reading local blob");
        match fs::read(self.path_of(id)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(KtableError::NotFound(format!("blob {id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn upload(&self, id: &BlobId, data: &[u8]) -> Result<()> {
        debug!(blob_id = %id, size = %human_bytes(data.len() as u64), "writing local blob");
        fs::write(self.path_of(id), data)?;
        Ok(())
    }
}

/// Moves compressed blob bytes to and from the remote service.
pub trait BlobTransfer: Send + Sync {
    fn download(&self, id: &BlobId) -> Result<Vec<u8>>;
    fn upload(&self, id: &BlobId, compressed: &[u8]) -> Result<()>;
}

impl BlobTransfer for LocalBlobStore {
    fn download(&self, id: &BlobId) -> Result<Vec<u8>> {
        BlobStore::fetch(self, id)
    }

    fn upload(&self, id: &BlobId, compressed: &[u8]) -> Result<()> {
        BlobStore::upload(self, id, compressed)
    }
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| KtableError::Execution(format!("corrupt gzip blob: {e}")))?;
    Ok(out)
}

pub fn cache_key(id: &BlobId) -> String {
    format!("big.{id}")
}

/// Gzip-compressing backend with a local cache in front of a [`BlobTransfer`].
///
/// The cache holds compressed bytes. Cache failures are logged and treated
/// as misses; without a cache every fetch downloads.
pub struct CachedBlobStore {
    cache: Option<Arc<Cache>>,
    transfer: Arc<dyn BlobTransfer>,
}

impl CachedBlobStore {
    pub fn new(cache: Arc<Cache>, transfer: Arc<dyn BlobTransfer>) -> Self {
        Self {
            cache: Some(cache),
            transfer,
        }
    }

    pub fn uncached(transfer: Arc<dyn BlobTransfer>) -> Self {
        Self {
            cache: None,
            transfer,
        }
    }

    pub fn cache(&self) -> Option<&Arc<Cache>> {
        self.cache.as_ref()
    }
}

impl BlobStore for CachedBlobStore {
    fn fetch(&self, id: &BlobId) -> Result<Vec<u8>> {
        let Some(cache) = &self.cache else {
            info!(blob_id = %id, "fetching blob");
            return gunzip(&self.transfer.download(id)?);
        };
        let key = cache_key(id);
        let entry = match cache.key(&key) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(blob_id = %id, error = %e, "cache unavailable, downloading");
                return gunzip(&self.transfer.download(id)?);
            }
        };
        let guard = match entry.lock() {
            Ok(guard) => guard,
            Err(e) => {
                warn!(blob_id = %id, error = %e, "cache entry unavailable, downloading");
                return gunzip(&self.transfer.download(id)?);
            }
        };

        let cached = guard.get(None).unwrap_or_else(|e| {
            warn!(blob_id = %id, error = %e, "cache read failed");
            None
        });
        if let Some(comp) = cached {
            match gunzip(&comp) {
                Ok(data) => {
                    debug!(blob_id = %id, "blob cache hit");
                    return Ok(data);
                }
                Err(e) => {
                    warn!(blob_id = %id, error = %e, "dropping corrupt cached blob");
                    if let Err(e) = cache.remove(&key) {
                        warn!(blob_id = %id, error = %e, "cache remove failed");
                    }
                }
            }
        }

        info!(blob_id = %id, "fetching blob");
        let comp = self.transfer.download(id)?;
        let data = gunzip(&comp)?;
        if let Err(e) = guard.set(&comp) {
            warn!(blob_id = %id, error = %e, "cache write failed");
        }
        Ok(data)
    }

    fn upload(&self, id: &BlobId, data: &[u8]) -> Result<()> {
        let comp = gzip(data)?;
        info!(
            blob_id = %id,
            raw = %human_bytes(data.len() as u64),
            compressed = %human_bytes(comp.len() as u64),
            "uploading blob"
        );
        self.transfer.upload(id, &comp)?;
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.set(&cache_key(id), &comp) {
                warn!(blob_id = %id, error = %e, "cache write failed");
            }
        }
        Ok(())
    }
}
