//! Bounded LRU cache of opaque byte payloads, one file per entry.
//!
//! The in-memory index mirrors the files under `root`; it is rebuilt from a
//! directory listing at startup. Files are named by the URL-safe base64 of
//! their key.
//!
//! Two levels of locking:
//! - one index mutex guards LRU order, sizes and file presence
//! - each key has its own mutex, held by callers through [`Entry::lock`] to
//!   serialize check-then-fill sequences on that key
//!
//! Eviction only takes the index mutex, so it never waits on a busy entry. A
//! reader racing an eviction sees a miss.

use std::collections::VecDeque;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use ktable_common::{human_bytes, KtableError, Result};
use tracing::{debug, info, warn};

struct Slot {
    key: String,
    size: u64,
    lock: Arc<Mutex<()>>,
}

#[derive(Default)]
struct CacheIndex {
    // least recently used first
    slots: VecDeque<Slot>,
    tot_bytes: u64,
}

impl CacheIndex {
    fn position(&self, key: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.key == key)
    }
}

pub struct Cache {
    root: PathBuf,
    max_entries: usize,
    max_bytes: u64,
    max_entry_size: u64,
    index: Mutex<CacheIndex>,
}

fn cache_err(context: &str, path: &Path, err: std::io::Error) -> KtableError {
    KtableError::Cache(format!("{context} {}: {err}", path.display()))
}

pub fn encode_key(key: &str) -> String {
    URL_SAFE.encode(key.as_bytes())
}

pub fn decode_key(filename: &str) -> Option<String> {
    let bytes = URL_SAFE.decode(filename.as_bytes()).ok()?;
    String::from_utf8(bytes).ok()
}

impl Cache {
    /// Opens (or creates) a cache under `root`, recovering entries already on
    /// disk in modification-time order and evicting down to the bounds.
    pub fn new(root: impl Into<PathBuf>, max_entries: usize, max_bytes: u64) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| cache_err("create cache dir", &root, e))?;
        let cache = Self {
            max_entries: max_entries.max(1),
            max_bytes,
            max_entry_size: max_bytes / 16,
            index: Mutex::new(CacheIndex::default()),
            root,
        };
        cache.recover()?;
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_entry_size(&self) -> u64 {
        self.max_entry_size
    }

    fn lock_index(&self) -> Result<MutexGuard<'_, CacheIndex>> {
        self.index
            .lock()
            .map_err(|_| KtableError::Cache("cache index lock poisoned".to_string()))
    }

    fn path_of(&self, key: &str) -> PathBuf {
        self.root.join(encode_key(key))
    }

    fn recover(&self) -> Result<()> {
        let listing =
            fs::read_dir(&self.root).map_err(|e| cache_err("list cache dir", &self.root, e))?;
        let mut found: Vec<(SystemTime, String, u64)> = Vec::new();
        for dirent in listing {
            let dirent = dirent.map_err(|e| cache_err("list cache dir", &self.root, e))?;
            let path = dirent.path();
            let meta = match dirent.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let key = dirent.file_name().to_str().and_then(decode_key);
            let Some(key) = key else {
                warn!(path = %path.display(), "removing undecodable cache file");
                let _ = fs::remove_file(&path);
                continue;
            };
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((mtime, key, meta.len()));
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));

        let mut index = self.lock_index()?;
        for (_, key, size) in found {
            debug!(key = %key, size = %human_bytes(size), "recovered cache file");
            index.tot_bytes += size;
            index.slots.push_back(Slot {
                key,
                size,
                lock: Arc::new(Mutex::new(())),
            });
        }
        self.make_space(&mut index, 0, None);
        while index.slots.len() > self.max_entries {
            self.evict_front(&mut index, None);
        }
        info!(
            entries = index.slots.len(),
            total = %human_bytes(index.tot_bytes),
            root = %self.root.display(),
            "cache recovered"
        );
        Ok(())
    }

    // Removes the least recently used slot other than `keep`.
    fn evict_front(&self, index: &mut CacheIndex, keep: Option<&str>) -> bool {
        let Some(pos) = index.slots.iter().position(|s| Some(s.key.as_str()) != keep) else {
            return false;
        };
        let Some(slot) = index.slots.remove(pos) else {
            return false;
        };
        index.tot_bytes -= slot.size;
        let path = self.path_of(&slot.key);
        match fs::remove_file(&path) {
            Ok(()) => info!(key = %slot.key, size = %human_bytes(slot.size), "evicted cache entry"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(key = %slot.key, "evicted cache entry already gone")
            }
            Err(e) => warn!(key = %slot.key, error = %e, "failed to remove evicted cache file"),
        }
        true
    }

    fn make_space(&self, index: &mut CacheIndex, needed: u64, keep: Option<&str>) {
        while index.tot_bytes + needed > self.max_bytes {
            if !self.evict_front(index, keep) {
                break;
            }
        }
    }

    /// Handle for `key`, promoted to most recently used.
    ///
    /// A new key at capacity evicts the least recently used entry first.
    pub fn key(&self, key: &str) -> Result<Entry<'_>> {
        let mut index = self.lock_index()?;
        if let Some(pos) = index.position(key) {
            if let Some(slot) = index.slots.remove(pos) {
                let lock = slot.lock.clone();
                index.slots.push_back(slot);
                return Ok(Entry {
                    cache: self,
                    key: key.to_string(),
                    lock,
                });
            }
        }
        if index.slots.len() >= self.max_entries {
            self.evict_front(&mut index, None);
        }
        let lock = Arc::new(Mutex::new(()));
        index.slots.push_back(Slot {
            key: key.to_string(),
            size: 0,
            lock: lock.clone(),
        });
        Ok(Entry {
            cache: self,
            key: key.to_string(),
            lock,
        })
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let mut index = self.lock_index()?;
        let Some(pos) = index.position(key) else {
            return Ok(());
        };
        if let Some(slot) = index.slots.remove(pos) {
            index.tot_bytes -= slot.size;
        }
        let path = self.path_of(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(key = %key, "removing but already gone");
                Ok(())
            }
            Err(e) => Err(cache_err("remove", &path, e)),
        }
    }

    /// Sum of the sizes of all indexed entries.
    pub fn tot_bytes(&self) -> u64 {
        self.lock_index().map(|i| i.tot_bytes).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock_index().map(|i| i.slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when `key` is indexed and its file is on disk.
    pub fn contains(&self, key: &str) -> bool {
        let indexed = self
            .lock_index()
            .map(|i| i.position(key).is_some())
            .unwrap_or(false);
        indexed && self.path_of(key).is_file()
    }

    /// Locks `key` and reads it. A miss on a key with no file leaves no slot.
    pub fn get(&self, key: &str, max_age: Option<Duration>) -> Result<Option<Vec<u8>>> {
        let entry = self.key(key)?;
        let guard = entry.lock()?;
        let found = guard.get(max_age)?;
        if found.is_none() && !guard.exists() {
            self.forget(key)?;
        }
        Ok(found)
    }

    // Drops the slot for `key` if its file is gone.
    fn forget(&self, key: &str) -> Result<()> {
        let mut index = self.lock_index()?;
        if self.path_of(key).is_file() {
            return Ok(());
        }
        let Some(pos) = index.position(key) else {
            return Ok(());
        };
        if let Some(slot) = index.slots.remove(pos) {
            index.tot_bytes -= slot.size;
        }
        Ok(())
    }

    /// Locks `key` and stores `value`; `Ok(false)` when it is too large to cache.
    pub fn set(&self, key: &str, value: &[u8]) -> Result<bool> {
        let entry = self.key(key)?;
        let guard = entry.lock()?;
        guard.set(value)
    }

    fn store(&self, key: &str, value: &[u8]) -> Result<bool> {
        let size = value.len() as u64;
        if size > self.max_entry_size {
            debug!(
                key = %key,
                size = %human_bytes(size),
                limit = %human_bytes(self.max_entry_size),
                "value too large to cache"
            );
            return Ok(false);
        }
        let path = self.path_of(key);
        let staging = self
            .root
            .join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&staging, value).map_err(|e| cache_err("write", &staging, e))?;

        let mut index = match self.lock_index() {
            Ok(index) => index,
            Err(e) => {
                let _ = fs::remove_file(&staging);
                return Err(e);
            }
        };
        let old = index
            .position(key)
            .and_then(|pos| index.slots.get(pos))
            .map(|s| s.size)
            .unwrap_or(0);
        index.tot_bytes -= old;
        self.make_space(&mut index, size, Some(key));
        if let Err(e) = fs::rename(&staging, &path) {
            index.tot_bytes += old;
            let _ = fs::remove_file(&staging);
            return Err(cache_err("rename into", &path, e));
        }
        match index.position(key) {
            Some(pos) => {
                if let Some(slot) = index.slots.get_mut(pos) {
                    slot.size = size;
                }
            }
            // evicted between key() and set(); the file is back so the slot must be too
            None => index.slots.push_back(Slot {
                key: key.to_string(),
                size,
                lock: Arc::new(Mutex::new(())),
            }),
        }
        index.tot_bytes += size;
        while index.slots.len() > self.max_entries {
            if !self.evict_front(&mut index, Some(key)) {
                break;
            }
        }
        Ok(true)
    }
}

/// Handle to one cache key. Obtain via [`Cache::key`].
pub struct Entry<'a> {
    cache: &'a Cache,
    key: String,
    lock: Arc<Mutex<()>>,
}

impl<'a> Entry<'a> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Takes the per-key lock; concurrent writers to the same key serialize here.
    pub fn lock(&self) -> Result<EntryGuard<'_>> {
        let guard = self
            .lock
            .lock()
            .map_err(|_| KtableError::Cache(format!("cache entry lock poisoned: {}", self.key)))?;
        Ok(EntryGuard {
            entry: self,
            _guard: guard,
        })
    }
}

/// A locked cache entry.
pub struct EntryGuard<'e> {
    entry: &'e Entry<'e>,
    _guard: MutexGuard<'e, ()>,
}

impl EntryGuard<'_> {
    fn path(&self) -> PathBuf {
        self.entry.cache.path_of(&self.entry.key)
    }

    pub fn exists(&self) -> bool {
        self.path().is_file()
    }

    /// Time since the entry was last written; `None` when missing.
    pub fn age(&self) -> Result<Option<Duration>> {
        let path = self.path();
        match fs::metadata(&path) {
            Ok(meta) => {
                let mtime = meta.modified().map_err(|e| cache_err("stat", &path, e))?;
                Ok(Some(
                    SystemTime::now()
                        .duration_since(mtime)
                        .unwrap_or(Duration::ZERO),
                ))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(cache_err("stat", &path, e)),
        }
    }

    /// Stored bytes, or `None` when missing or older than `max_age`.
    ///
    /// Expired files are left in place for LRU eviction.
    pub fn get(&self, max_age: Option<Duration>) -> Result<Option<Vec<u8>>> {
        if let Some(max_age) = max_age {
            match self.age()? {
                None => return Ok(None),
                Some(age) if age > max_age => {
                    info!(
                        key = %self.entry.key,
                        age_secs = age.as_secs_f64(),
                        max_age_secs = max_age.as_secs_f64(),
                        "cache entry expired"
                    );
                    return Ok(None);
                }
                Some(_) => {}
            }
        }
        let path = self.path();
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(cache_err("read", &path, e)),
        }
    }

    pub fn set(&self, value: &[u8]) -> Result<bool> {
        self.entry.cache.store(&self.entry.key, value)
    }
}
