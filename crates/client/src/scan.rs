//! Server-paged batch streams with cursor continuation.

use std::sync::Arc;
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use ktable_common::{KtableError, Result, TxId};
use ktable_wire::FrameStream;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::transport::{ByteChunks, Endpoint, Request, Transport};

/// One step of a paged response.
#[derive(Debug)]
pub(crate) enum Fetched {
    Batch(RecordBatch),
    /// The server wants the same request re-issued with this cursor.
    Continue(String),
    Done,
}

/// A logical paged request; only the cursor changes between pages.
#[derive(Debug, Clone)]
pub(crate) struct ScanRequest {
    pub endpoint: Endpoint,
    pub table_id: String,
    pub tx_id: Option<TxId>,
    pub body: Map<String, Value>,
}

impl ScanRequest {
    fn with_cursor(&self, cursor: &str) -> Request {
        let mut body = self.body.clone();
        body.insert("cursor".to_string(), Value::String(cursor.to_string()));
        let mut req = Request::new(self.endpoint).param("table_id", self.table_id.as_str());
        if let Some(tx) = &self.tx_id {
            req = req.param("tx_id", tx.0.as_str());
        }
        req.json(Value::Object(body))
    }
}

/// Raw inner batches across every page of a request.
///
/// A page that fails with a transient error before yielding anything is
/// retried after each delay in `backoff` in turn; after a batch of the page
/// was handed out the error surfaces, since replaying would duplicate rows.
pub(crate) struct RawScan {
    transport: Arc<dyn Transport>,
    request: Arc<ScanRequest>,
    backoff: Arc<Vec<u64>>,
    cursor: String,
    frames: Option<FrameStream<ByteChunks>>,
    page_yielded: bool,
    attempt: usize,
    done: bool,
}

impl RawScan {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        request: Arc<ScanRequest>,
        backoff: Arc<Vec<u64>>,
    ) -> Self {
        Self {
            transport,
            request,
            backoff,
            cursor: String::new(),
            frames: None,
            page_yielded: false,
            attempt: 0,
            done: false,
        }
    }

    fn fetch(&mut self) -> Result<Fetched> {
        if self.frames.is_none() {
            let req = self.request.with_cursor(&self.cursor);
            self.frames = Some(FrameStream::new(self.transport.stream(&req)?));
        }
        let Some(frames) = self.frames.as_mut() else {
            return Ok(Fetched::Done);
        };
        for frame in frames.by_ref() {
            let frame = frame?;
            if let Some(message) = frame.error_message() {
                return Err(KtableError::Server(message.to_string()));
            }
            if let Some(cursor) = frame.cursor_token() {
                return Ok(Fetched::Continue(cursor.to_string()));
            }
            if !frame.metadata.is_empty() {
                warn!(metadata = ?frame.metadata, "ignoring frame metadata");
            }
            match frame.batch {
                Some(b) if b.num_rows() > 0 => return Ok(Fetched::Batch(b)),
                _ => continue,
            }
        }
        Ok(Fetched::Done)
    }
}

impl Iterator for RawScan {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.fetch() {
                Ok(Fetched::Batch(b)) => {
                    self.page_yielded = true;
                    return Some(Ok(b));
                }
                Ok(Fetched::Continue(cursor)) => {
                    info!(
                        endpoint = %self.request.endpoint,
                        table_id = %self.request.table_id,
                        cursor = %cursor,
                        "continuing with cursor"
                    );
                    self.cursor = cursor;
                    self.frames = None;
                    self.page_yielded = false;
                    self.attempt = 0;
                }
                Ok(Fetched::Done) => self.done = true,
                Err(e) if e.is_transient() && !self.page_yielded => {
                    let Some(delay) = self.backoff.get(self.attempt).copied() else {
                        self.done = true;
                        return Some(Err(e));
                    };
                    self.attempt += 1;
                    warn!(
                        endpoint = %self.request.endpoint,
                        table_id = %self.request.table_id,
                        attempt = self.attempt,
                        delay_ms = delay,
                        error = %e,
                        "retrying page"
                    );
                    std::thread::sleep(Duration::from_millis(delay));
                    self.frames = None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
