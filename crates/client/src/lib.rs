//! Blocking client for the ktable service.
//!
//! Architecture role:
//! - turns user queries into pushdown queries plus an exact local filter
//! - encodes writes into the stored layout and decodes reads back
//! - drives paged selects, replaces and transactions over a [`Transport`]
//!
//! Key modules:
//! - [`client`] and [`table`]: handles and table lifecycle
//! - [`cursor`]: lazy, restartable results
//! - [`tx`]: buffered transactional writes, replace and delete
//! - [`transport`] / [`http`]: the request seam and its HTTP implementation

mod scan;

pub mod client;
pub mod convert;
pub mod cursor;
pub mod http;
pub mod query;
pub mod table;
pub mod transport;
pub mod tx;

pub use client::Client;
pub use convert::{batch_to_rows, rows_to_batch};
pub use cursor::{Batches, Cursor, Pages, Rows};
pub use http::HttpTransport;
pub use query::IntoQuery;
pub use table::Table;
pub use transport::{Body, ByteChunks, Endpoint, Request, Transport};
pub use tx::Transaction;
