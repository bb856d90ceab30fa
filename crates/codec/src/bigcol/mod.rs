//! Big columns: oversized string/binary cells moved out of line.
//!
//! A big column keeps its type; each cell holds a token:
//! - short values (`< STR_LIMIT` bytes): the value followed by `~`
//! - long values: the first `STR_MIN` characters, `~`, then
//!   `{blob_id}:{offset}:{size}` pointing into an uploaded blob
//!
//! Tokens sort close to their values, which lets equality on long values be
//! pushed down as a prefix range (see [`inner_exp`]).

pub mod batch;
pub mod buffer;
pub mod query;
pub mod reference;

use arrow_schema::{DataType, Field};
use ktable_common::{BlobId, Result};

pub use batch::{decode_batch, encode_batch};
pub use buffer::BigBuffer;
pub use query::inner_exp;
pub use reference::{BigRef, Pointer};

/// Values at least this many bytes long are externalised.
pub const STR_LIMIT: usize = 128;
/// Characters (bytes for binary) kept inline in front of a pointer.
pub const STR_MIN: usize = 12;
/// Blob size that triggers an upload and a fresh blob id.
pub const MAX_BIGFILE_SIZE: usize = 64 * 1024 * 1024;
/// Longest value accepted in a string/binary column not marked big.
pub const SMALL_MAX: usize = 256;

/// Field metadata key marking a big column.
pub const BIG_META: &str = "big";

pub fn is_big_field(field: &Field) -> bool {
    matches!(field.data_type(), DataType::Utf8 | DataType::Binary)
        && field.metadata().contains_key(BIG_META)
}

/// Storage backend for big-column blobs.
pub trait BlobStore: Send + Sync {
    /// Full content of a previously uploaded blob.
    fn fetch(&self, id: &BlobId) -> Result<Vec<u8>>;
    fn upload(&self, id: &BlobId, data: &[u8]) -> Result<()>;
}
