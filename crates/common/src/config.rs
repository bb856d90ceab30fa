use serde::{Deserialize, Serialize};

use crate::error::{KtableError, Result};

/// Client-side settings shared by the table client, codecs and cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub cache_dir: String,
    pub cache_max_entries: usize,
    pub cache_max_bytes: u64,
    /// Buffered insert rows that trigger an automatic flush.
    pub insert_flush_rows: usize,
    /// Response batches are re-chunked to this many rows before decoding.
    pub decode_chunk_rows: usize,
    /// Delays between select page attempts; one attempt per entry.
    pub select_retry_backoff_ms: Vec<u64>,
    /// Big-column blob rotation ceiling.
    pub max_bigfile_bytes: usize,
    pub http_timeout_secs: u64,
    pub fetch_chunk_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir()
                .join("ktable_cache")
                .to_string_lossy()
                .to_string(),
            cache_max_entries: 100,
            cache_max_bytes: 64 * 1024 * 1024,
            insert_flush_rows: 5_000,
            decode_chunk_rows: 2_000,
            select_retry_backoff_ms: vec![500, 2_000, 5_000, 20_000],
            max_bigfile_bytes: 64 * 1024 * 1024,
            http_timeout_secs: 60,
            fetch_chunk_bytes: 64 * 1024,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl ClientConfig {
    /// Defaults overridden by `KTABLE_*` environment variables.
    ///
    /// Values that fail to parse are ignored.
    pub fn from_env() -> Self {
        let mut c = Self::default();
        if let Ok(v) = std::env::var("KTABLE_CACHE_DIR") {
            if !v.trim().is_empty() {
                c.cache_dir = v;
            }
        }
        if let Some(v) = env_parse::<usize>("KTABLE_CACHE_MAX_ENTRIES") {
            c.cache_max_entries = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("KTABLE_CACHE_MAX_BYTES") {
            c.cache_max_bytes = v.max(1024);
        }
        if let Some(v) = env_parse::<usize>("KTABLE_INSERT_FLUSH_ROWS") {
            c.insert_flush_rows = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("KTABLE_DECODE_CHUNK_ROWS") {
            c.decode_chunk_rows = v.max(1);
        }
        if let Ok(v) = std::env::var("KTABLE_SELECT_RETRY_BACKOFF_MS") {
            let parsed = v
                .split(',')
                .map(|s| s.trim().parse::<u64>())
                .collect::<std::result::Result<Vec<_>, _>>();
            if let Ok(list) = parsed {
                if !list.is_empty() {
                    c.select_retry_backoff_ms = list;
                }
            }
        }
        if let Some(v) = env_parse::<usize>("KTABLE_MAX_BIGFILE_BYTES") {
            c.max_bigfile_bytes = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("KTABLE_HTTP_TIMEOUT_SECS") {
            c.http_timeout_secs = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("KTABLE_FETCH_CHUNK_BYTES") {
            c.fetch_chunk_bytes = v.max(1);
        }
        c
    }

    pub fn validate(&self) -> Result<()> {
        if self.select_retry_backoff_ms.is_empty() {
            return Err(KtableError::InvalidConfig(
                "select_retry_backoff_ms must contain at least one delay".to_string(),
            ));
        }
        if self.decode_chunk_rows == 0 || self.fetch_chunk_bytes == 0 {
            return Err(KtableError::InvalidConfig(
                "decode_chunk_rows and fetch_chunk_bytes must be > 0".to_string(),
            ));
        }
        if self.insert_flush_rows == 0 {
            return Err(KtableError::InvalidConfig(
                "insert_flush_rows must be > 0".to_string(),
            ));
        }
        if self.cache_max_entries == 0 {
            return Err(KtableError::InvalidConfig(
                "cache_max_entries must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
