//! Server-side transactions with client-side write buffering.

use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use ktable_codec::{bigcol, bsquare, BigBuffer};
use ktable_common::{KtableError, Result, TxId};
use ktable_wire::{encode_frames, Frame};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::convert::{align_to_schema, batch_to_rows, rows_to_batch};
use crate::cursor::Cursor;
use crate::query::{inner_query, is_null_literal, ExactFilter, IntoQuery};
use crate::scan::{RawScan, ScanRequest};
use crate::table::TableCore;
use crate::transport::{json_response, Endpoint};

/// One open transaction on a table.
///
/// Inserted rows are buffered and sent in batches; big-column values written
/// by those batches sit in a per-transaction [`BigBuffer`] until flushed.
/// Dropping a transaction that was neither committed nor rolled back rolls
/// it back.
///
/// Not meant to be shared across threads; open one per caller.
pub struct Transaction {
    core: Arc<TableCore>,
    id: TxId,
    buf: Vec<RecordBatch>,
    buf_rows: usize,
    big: Arc<BigBuffer>,
    finished: bool,
}

impl Transaction {
    pub(crate) fn begin(core: Arc<TableCore>) -> Result<Self> {
        // fail before opening a server transaction on an unbound handle
        core.schemas()?;
        let resp = core.transport.call(&core.request(Endpoint::Begin))?;
        let body = json_response(Endpoint::Begin, &resp)?;
        let id = body
            .get("tx_id")
            .and_then(Value::as_str)
            .map(|s| TxId(s.to_string()))
            .ok_or_else(|| {
                KtableError::Server(format!("begin response carried no tx_id: {body}"))
            })?;
        info!(table_id = %core.id, tx_id = %id, "transaction started");
        let big = Arc::new(BigBuffer::with_max_size(
            core.blobs.clone(),
            core.config.max_bigfile_bytes,
        ));
        Ok(Self {
            core,
            id,
            buf: Vec::new(),
            buf_rows: 0,
            big,
            finished: false,
        })
    }

    pub fn id(&self) -> &TxId {
        &self.id
    }

    /// Rows buffered and not yet sent.
    pub fn buffered_rows(&self) -> usize {
        self.buf_rows
    }

    /// Buffers `batch`, flushing once the buffer passes the configured row count.
    ///
    /// Columns are matched by name against the table schema; absent nullable
    /// columns are filled with nulls.
    pub fn insert(&mut self, batch: &RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        let outer = self.core.schemas()?.outer;
        let aligned = align_to_schema(batch, &outer)?;
        self.buf_rows += aligned.num_rows();
        self.buf.push(aligned);
        if self.buf_rows > self.core.config.insert_flush_rows {
            self.flush()?;
        }
        Ok(())
    }

    pub fn insert_rows(&mut self, rows: &[Value]) -> Result<()> {
        let outer = self.core.schemas()?.outer;
        let batch = rows_to_batch(&outer, rows)?;
        self.insert(&batch)
    }

    /// Encodes and sends the buffered rows.
    pub fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let outer = self.core.schemas()?.outer;
        let merged = concat_batches(&outer, &self.buf)
            .map_err(|e| KtableError::Execution(format!("insert buffer merge failed: {e}")))?;
        let encoded = bsquare::encode(&merged)?;
        let encoded = bigcol::encode_batch(&encoded, &self.big)?;
        let body = encode_frames(&[Frame::data(encoded)])?;
        info!(
            table_id = %self.core.id,
            tx_id = %self.id,
            rows = self.buf_rows,
            bytes = body.len(),
            "flushing inserts"
        );
        let req = self
            .core
            .request(Endpoint::Insert)
            .param("tx_id", self.id.0.as_str())
            .bytes(body);
        let resp = self.core.transport.call(&req)?;
        json_response(Endpoint::Insert, &resp)?;
        self.buf.clear();
        self.buf_rows = 0;
        Ok(())
    }

    /// Removes the rows matching `query` and returns them.
    ///
    /// Candidate rows pruned by the server that do not match exactly are
    /// written back unchanged. The caller may insert modified versions of the
    /// returned rows; whatever it does not reinsert stays deleted.
    pub fn replace(&mut self, query: impl IntoQuery) -> Result<Vec<RecordBatch>> {
        let query = match query.into_query()? {
            Some(q) if !is_null_literal(&q) => q,
            _ => {
                return Err(KtableError::InvalidArgument(
                    "replace needs a query; use 1 == 1 to match every row".to_string(),
                ))
            }
        };
        self.flush()?;

        let schemas = self.core.schemas()?;
        let mut exact = ExactFilter::new(query.clone(), &schemas.outer)?;
        let inner = inner_query(&schemas.outer, &schemas.inner, &query)?;
        let mut body = Map::new();
        body.insert("query".to_string(), Value::String(inner.to_string()));
        info!(
            table_id = %self.core.id,
            tx_id = %self.id,
            query = %inner,
            "replace"
        );
        let request = Arc::new(ScanRequest {
            endpoint: Endpoint::Replace,
            table_id: self.core.id.clone(),
            tx_id: Some(self.id.clone()),
            body,
        });
        // the server has already removed what it streamed; never replay
        let raw = RawScan::new(self.core.transport.clone(), request, Arc::new(Vec::new()));

        let mut matched = Vec::new();
        let mut kept = Vec::new();
        for batch in raw {
            let decoded = self.core.decode(&schemas.inner, &batch?, Some(&self.big))?;
            let (hit, rest) = exact.split(&decoded)?;
            if hit.num_rows() > 0 {
                matched.push(hit);
            }
            if rest.num_rows() > 0 {
                kept.push(rest);
            }
        }
        debug!(
            matched = matched.iter().map(RecordBatch::num_rows).sum::<usize>(),
            kept = kept.iter().map(RecordBatch::num_rows).sum::<usize>(),
            "replace split"
        );
        for batch in &kept {
            self.insert(batch)?;
        }
        Ok(matched)
    }

    /// [`Transaction::replace`] with rows as JSON objects.
    pub fn replace_rows(&mut self, query: impl IntoQuery) -> Result<Vec<Map<String, Value>>> {
        let mut rows = Vec::new();
        for batch in self.replace(query)? {
            rows.extend(batch_to_rows(&batch)?);
        }
        Ok(rows)
    }

    /// Deletes the rows matching `query`, returning how many were removed.
    pub fn delete(&mut self, query: impl IntoQuery) -> Result<usize> {
        let removed = self
            .replace(query)?
            .iter()
            .map(RecordBatch::num_rows)
            .sum::<usize>();
        info!(table_id = %self.core.id, tx_id = %self.id, rows = removed, "deleted rows");
        Ok(removed)
    }

    /// Selection that sees this transaction's own writes.
    pub fn select(&mut self, query: impl IntoQuery, cols: &[&str]) -> Result<Cursor> {
        let query = query.into_query()?;
        self.flush()?;
        self.core
            .select_cursor(query, cols, Some(self.id.clone()), Some(self.big.clone()))
    }

    pub fn commit(mut self) -> Result<()> {
        self.flush()?;
        self.big.flush()?;
        let req = self
            .core
            .request(Endpoint::Commit)
            .param("tx_id", self.id.0.as_str());
        let resp = self.core.transport.call(&req)?;
        json_response(Endpoint::Commit, &resp)?;
        self.finished = true;
        info!(table_id = %self.core.id, tx_id = %self.id, "transaction committed");
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.send_rollback()
    }

    fn send_rollback(&self) -> Result<()> {
        let req = self
            .core
            .request(Endpoint::Rollback)
            .param("tx_id", self.id.0.as_str());
        let resp = self.core.transport.call(&req)?;
        json_response(Endpoint::Rollback, &resp)?;
        info!(
            table_id = %self.core.id,
            tx_id = %self.id,
            discarded_rows = self.buf_rows,
            "transaction rolled back"
        );
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(
            table_id = %self.core.id,
            tx_id = %self.id,
            "transaction dropped without commit, rolling back"
        );
        if let Err(e) = self.send_rollback() {
            error!(table_id = %self.core.id, tx_id = %self.id, error = %e, "ignored: rollback failed");
        }
    }
}
