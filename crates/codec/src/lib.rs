//! Storage codecs between the user-facing and the stored table layout.
//!
//! Architecture role:
//! - [`schema`] maps outer schemas to inner schemas and back
//! - [`bsquare`] derives bounding columns for geometries and rewrites spatial predicates
//! - [`bigcol`] moves oversized cells into blobs behind inline tokens
//!
//! Write path: `bsquare::encode` then `bigcol::encode_batch`.
//! Read path: `bigcol::decode_batch` then `bsquare::decode`.

pub mod bigcol;
pub mod bsquare;
pub mod schema;

pub use bigcol::{BigBuffer, BlobStore};
pub use schema::{transform_inward, transform_outward};
