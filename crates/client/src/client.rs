use std::sync::Arc;

use ktable_codec::BlobStore;
use ktable_common::{BlobId, ClientConfig, Result};
use ktable_storage::{BlobTransfer, Cache, CachedBlobStore};
use tracing::{info, warn};

use crate::http::HttpTransport;
use crate::table::{Table, TableCore};
use crate::transport::{Endpoint, Transport};

/// Entry point: one transport, one config and one local blob cache shared by
/// every table handle it opens.
///
/// A cache directory that cannot be opened disables the cache instead of
/// failing; blobs are then downloaded on every read.
pub struct Client {
    transport: Arc<dyn Transport>,
    config: Arc<ClientConfig>,
    cache: Option<Arc<Cache>>,
    blob_store: Option<Arc<dyn BlobStore>>,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let cache = match Cache::new(
            config.cache_dir.as_str(),
            config.cache_max_entries,
            config.cache_max_bytes,
        ) {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                warn!(cache_dir = %config.cache_dir, error = %e, "blob cache disabled");
                None
            }
        };
        info!(
            cache_dir = %config.cache_dir,
            cache_entries = cache.as_ref().map(|c| c.len()).unwrap_or(0),
            "ktable client ready"
        );
        Ok(Self {
            transport,
            config: Arc::new(config),
            cache,
            blob_store: None,
        })
    }

    /// Client over HTTP at `base_url`, optionally authenticated with a bearer token.
    pub fn http(
        base_url: impl Into<String>,
        bearer_token: Option<String>,
        config: ClientConfig,
    ) -> Result<Self> {
        let transport = HttpTransport::new(base_url, bearer_token, &config)?;
        Self::new(Arc::new(transport), config)
    }

    /// Replaces the default cached remote blob backend for big columns.
    pub fn with_blob_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(store);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The local blob cache; `None` when its directory could not be opened.
    pub fn cache(&self) -> Option<&Arc<Cache>> {
        self.cache.as_ref()
    }

    /// Opens a handle on table `id`, fetching its schema if it exists.
    pub fn table(&self, id: &str) -> Result<Table> {
        let blobs = match &self.blob_store {
            Some(store) => store.clone(),
            None => {
                let transfer = RemoteBlobTransfer {
                    transport: self.transport.clone(),
                    table_id: id.to_string(),
                };
                let transfer = Arc::new(transfer);
                let store = match &self.cache {
                    Some(cache) => CachedBlobStore::new(cache.clone(), transfer),
                    None => CachedBlobStore::uncached(transfer),
                };
                Arc::new(store) as Arc<dyn BlobStore>
            }
        };
        Table::open(TableCore::new(
            id.to_string(),
            self.transport.clone(),
            self.config.clone(),
            blobs,
        ))
    }
}

/// Blob bytes moved through the table service's big endpoints.
struct RemoteBlobTransfer {
    transport: Arc<dyn Transport>,
    table_id: String,
}

impl RemoteBlobTransfer {
    fn request(&self, endpoint: Endpoint, id: &BlobId) -> crate::transport::Request {
        crate::transport::Request::new(endpoint)
            .param("table_id", self.table_id.as_str())
            .param("big_id", id.as_str())
    }
}

impl BlobTransfer for RemoteBlobTransfer {
    fn download(&self, id: &BlobId) -> Result<Vec<u8>> {
        self.transport.call(&self.request(Endpoint::BigDownload, id))
    }

    fn upload(&self, id: &BlobId, data: &[u8]) -> Result<()> {
        let req = self.request(Endpoint::BigUpload, id).bytes(data.to_vec());
        self.transport.call(&req)?;
        Ok(())
    }
}
