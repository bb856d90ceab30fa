//! Lazy, restartable result cursors.

use std::collections::VecDeque;
use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use ktable_codec::BigBuffer;
use ktable_common::{KtableError, Result};
use ktable_expr::Op;
use serde_json::{Map, Value};

use crate::convert::{batch_to_rows, project};
use crate::query::ExactFilter;
use crate::scan::{RawScan, ScanRequest};
use crate::table::TableCore;

/// A selection that has not run yet.
///
/// Every call to [`Cursor::batches`] issues the request anew, so a cursor can
/// be iterated any number of times.
pub struct Cursor {
    core: Arc<TableCore>,
    inner: SchemaRef,
    request: Arc<ScanRequest>,
    outer: SchemaRef,
    // re-applied client side; pushdown only prunes
    exact: Option<Op>,
    cols: Option<Vec<String>>,
    pending: Option<Arc<BigBuffer>>,
}

impl Cursor {
    pub(crate) fn new(
        core: Arc<TableCore>,
        inner: SchemaRef,
        outer: SchemaRef,
        request: ScanRequest,
        exact: Option<Op>,
        cols: Option<Vec<String>>,
        pending: Option<Arc<BigBuffer>>,
    ) -> Self {
        Self {
            core,
            inner,
            outer,
            exact,
            request: Arc::new(request),
            cols,
            pending,
        }
    }

    /// Decoded, exactly filtered batches.
    pub fn batches(&self) -> Result<Batches> {
        let exact = match &self.exact {
            Some(query) => Some(ExactFilter::new(query.clone(), &self.outer)?),
            None => None,
        };
        let backoff = Arc::new(self.core.config.select_retry_backoff_ms.clone());
        Ok(Batches {
            raw: RawScan::new(self.core.transport.clone(), self.request.clone(), backoff),
            core: self.core.clone(),
            inner: self.inner.clone(),
            exact,
            cols: self.cols.clone(),
            pending: self.pending.clone(),
            chunk_rows: self.core.config.decode_chunk_rows.max(1),
            queue: VecDeque::new(),
            failed: false,
        })
    }

    /// Rows as JSON objects.
    pub fn rows(&self) -> Result<Rows> {
        Ok(Rows {
            batches: self.batches()?,
            current: VecDeque::new(),
        })
    }

    /// Batches of exactly `size` rows, except the last.
    ///
    /// A `size` of 0 yields batches as decoded.
    pub fn pages(&self, size: usize) -> Result<Pages> {
        Ok(Pages {
            batches: self.batches()?,
            size,
            held: Vec::new(),
            held_rows: 0,
            done: false,
        })
    }

    pub fn collect_batches(&self) -> Result<Vec<RecordBatch>> {
        self.batches()?.collect()
    }

    /// Number of matching rows; consumes one full iteration.
    pub fn count(&self) -> Result<usize> {
        let mut total = 0;
        for batch in self.batches()? {
            total += batch?.num_rows();
        }
        Ok(total)
    }
}

pub struct Batches {
    raw: RawScan,
    core: Arc<TableCore>,
    inner: SchemaRef,
    exact: Option<ExactFilter>,
    cols: Option<Vec<String>>,
    pending: Option<Arc<BigBuffer>>,
    chunk_rows: usize,
    queue: VecDeque<RecordBatch>,
    failed: bool,
}

impl Batches {
    fn refill(&mut self) -> Option<Result<()>> {
        let raw = match self.raw.next()? {
            Ok(b) => b,
            Err(e) => return Some(Err(e)),
        };
        let mut offset = 0;
        while offset < raw.num_rows() {
            let len = self.chunk_rows.min(raw.num_rows() - offset);
            self.queue.push_back(raw.slice(offset, len));
            offset += len;
        }
        Some(Ok(()))
    }

    fn finish(&mut self, raw: RecordBatch) -> Result<RecordBatch> {
        let batch = self
            .core
            .decode(&self.inner, &raw, self.pending.as_deref())?;
        let batch = match self.exact.as_mut() {
            Some(exact) => exact.filter(&batch)?,
            None => batch,
        };
        match &self.cols {
            Some(cols) => project(&batch, cols),
            None => Ok(batch),
        }
    }
}

impl Iterator for Batches {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let Some(raw) = self.queue.pop_front() else {
                match self.refill()? {
                    Ok(()) => continue,
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                }
            };
            match self.finish(raw) {
                Ok(b) if b.num_rows() == 0 => continue,
                Ok(b) => return Some(Ok(b)),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

pub struct Rows {
    batches: Batches,
    current: VecDeque<Map<String, Value>>,
}

impl Iterator for Rows {
    type Item = Result<Map<String, Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.current.pop_front() {
                return Some(Ok(row));
            }
            let batch = match self.batches.next()? {
                Ok(b) => b,
                Err(e) => return Some(Err(e)),
            };
            match batch_to_rows(&batch) {
                Ok(rows) => self.current.extend(rows),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

pub struct Pages {
    batches: Batches,
    size: usize,
    held: Vec<RecordBatch>,
    held_rows: usize,
    done: bool,
}

impl Pages {
    fn take(&mut self, rows: usize) -> Result<RecordBatch> {
        let Some(schema) = self.held.first().map(|b| b.schema()) else {
            return Err(KtableError::Execution("no rows held for page".to_string()));
        };
        let all = concat_batches(&schema, &self.held)
            .map_err(|e| KtableError::Execution(format!("page assembly failed: {e}")))?;
        let page = all.slice(0, rows);
        let rest = all.slice(rows, all.num_rows() - rows);
        self.held.clear();
        self.held_rows = rest.num_rows();
        if rest.num_rows() > 0 {
            self.held.push(rest);
        }
        Ok(page)
    }
}

impl Iterator for Pages {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.size == 0 {
            return self.batches.next();
        }
        loop {
            if self.held_rows >= self.size {
                return Some(self.take(self.size));
            }
            if self.done {
                if self.held_rows == 0 {
                    return None;
                }
                return Some(self.take(self.held_rows));
            }
            match self.batches.next() {
                Some(Ok(b)) => {
                    self.held_rows += b.num_rows();
                    self.held.push(b);
                }
                Some(Err(e)) => {
                    self.done = true;
                    self.held.clear();
                    self.held_rows = 0;
                    return Some(Err(e));
                }
                None => self.done = true,
            }
        }
    }
}
