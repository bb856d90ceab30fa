//! Local persistence for the ktable client.
//!
//! Architecture role:
//! - bounded LRU disk cache shared by blob backends
//! - big-column blob backends implementing [`ktable_codec::BlobStore`]
//!
//! Key modules:
//! - [`cache`]
//! - [`blob`]

pub mod blob;
pub mod cache;

pub use blob::{BlobTransfer, CachedBlobStore, LocalBlobStore};
pub use cache::{Cache, Entry, EntryGuard};
