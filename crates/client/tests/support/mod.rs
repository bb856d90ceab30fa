#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use arrow::array::{ArrayRef, Int64Array, StringArray};
use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use ktable_client::{Body, ByteChunks, Client, Endpoint, Request, Transport};
use ktable_common::{ClientConfig, KtableError, Result};
use ktable_expr::{parse, Predicate, GEOMETRY_META};
use ktable_wire::{decode_frames, encode_frames, Frame};
use serde_json::{json, Value};

pub fn unique_path(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("{prefix}_{nanos}"))
}

/// Small chunks, tiny backoffs and a private cache directory.
pub fn test_config(prefix: &str) -> ClientConfig {
    ClientConfig {
        cache_dir: unique_path(prefix).to_string_lossy().to_string(),
        select_retry_backoff_ms: vec![1, 1],
        decode_chunk_rows: 2,
        ..ClientConfig::default()
    }
}

pub fn client(server: &Arc<FakeServer>, prefix: &str) -> Client {
    Client::new(server.clone(), test_config(prefix)).expect("client")
}

pub fn geo_field(name: &str) -> Field {
    Field::new(name, DataType::Utf8, true)
        .with_metadata(HashMap::from([(GEOMETRY_META.to_string(), "1".to_string())]))
}

pub fn big_field(name: &str) -> Field {
    Field::new(name, DataType::Utf8, true)
        .with_metadata(HashMap::from([("big".to_string(), "1".to_string())]))
}

/// `name: string, loc: geometry`
pub fn places_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("name", DataType::Utf8, true),
        geo_field("loc"),
    ]))
}

pub fn places(rows: &[(&str, &str)]) -> RecordBatch {
    let names: ArrayRef = Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.0)));
    let locs: ArrayRef = Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.1)));
    RecordBatch::try_new(places_schema(), vec![names, locs]).expect("places batch")
}

/// `n: int64`
pub fn numbers_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("n", DataType::Int64, true)]))
}

pub fn numbers(values: impl IntoIterator<Item = i64>) -> RecordBatch {
    let col: ArrayRef = Arc::new(Int64Array::from_iter_values(values));
    RecordBatch::try_new(numbers_schema(), vec![col]).expect("numbers batch")
}

/// Sorted values of string column `name` across `batches`.
pub fn strings(batches: &[RecordBatch], name: &str) -> Vec<String> {
    let mut out = Vec::new();
    for b in batches {
        let idx = b.schema().index_of(name).expect("column");
        let col = b
            .column(idx)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("string column");
        out.extend(col.iter().map(|v| v.unwrap_or("<null>").to_string()));
    }
    out.sort();
    out
}

/// Sorted values of int64 column `name` across `batches`.
pub fn ints(batches: &[RecordBatch], name: &str) -> Vec<i64> {
    let mut out = Vec::new();
    for b in batches {
        let idx = b.schema().index_of(name).expect("column");
        let col = b
            .column(idx)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64 column");
        out.extend(col.iter().flatten());
    }
    out.sort();
    out
}

struct StoredTable {
    inner: SchemaRef,
    rows: Vec<RecordBatch>,
}

struct OpenTx {
    table: String,
    rows: Vec<RecordBatch>,
}

#[derive(Default)]
struct ServerState {
    tables: HashMap<String, StoredTable>,
    txs: HashMap<String, OpenTx>,
    cursors: HashMap<String, VecDeque<RecordBatch>>,
    blobs: HashMap<String, Vec<u8>>,
    next_id: u64,
    fail_selects: usize,
    error_frame: Option<String>,
    calls: HashMap<Endpoint, usize>,
    last_select: Option<Value>,
}

/// In-memory implementation of the table service protocol.
///
/// Filters with the same predicate compiler as the client, against the
/// stored (inner) layout. Paged endpoints return at most `page_rows` rows per
/// response followed by a cursor frame.
pub struct FakeServer {
    state: Mutex<ServerState>,
    page_rows: usize,
    chunk_bytes: usize,
}

impl FakeServer {
    pub fn new(page_rows: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState::default()),
            page_rows: page_rows.max(1),
            chunk_bytes: 13,
        })
    }

    /// Next `n` select requests fail with a transient error.
    pub fn fail_next_selects(&self, n: usize) {
        self.state.lock().expect("state").fail_selects = n;
    }

    /// Next select response is an in-stream error frame.
    pub fn error_next_select(&self, message: &str) {
        self.state.lock().expect("state").error_frame = Some(message.to_string());
    }

    pub fn calls(&self, endpoint: Endpoint) -> usize {
        self.state
            .lock()
            .expect("state")
            .calls
            .get(&endpoint)
            .copied()
            .unwrap_or(0)
    }

    pub fn open_transactions(&self) -> usize {
        self.state.lock().expect("state").txs.len()
    }

    pub fn blob_count(&self) -> usize {
        self.state.lock().expect("state").blobs.len()
    }

    pub fn committed_rows(&self, table: &str) -> usize {
        self.state
            .lock()
            .expect("state")
            .tables
            .get(table)
            .map(|t| t.rows.iter().map(RecordBatch::num_rows).sum())
            .unwrap_or(0)
    }

    /// Stored (encoded) rows of a committed table, merged.
    pub fn stored(&self, table: &str) -> RecordBatch {
        let state = self.state.lock().expect("state");
        let t = state.tables.get(table).expect("table");
        concat_batches(&t.inner, &t.rows).expect("concat")
    }

    /// JSON body of the most recent select request.
    pub fn last_select(&self) -> Option<Value> {
        self.state.lock().expect("state").last_select.clone()
    }

    fn handle(&self, req: &Request) -> Result<Vec<u8>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| KtableError::Execution("fake server poisoned".to_string()))?;
        *state.calls.entry(req.endpoint).or_insert(0) += 1;
        let table_id = req.param_value("table_id").unwrap_or_default().to_string();
        let tx_id = req.param_value("tx_id").map(str::to_string);

        match req.endpoint {
            Endpoint::Create => {
                let Body::Bytes(bytes) = &req.body else {
                    return Err(KtableError::Server("create needs a batch stream".to_string()));
                };
                let inner = decode_frames(bytes)?
                    .into_iter()
                    .find_map(|f| f.schema)
                    .ok_or_else(|| KtableError::Server("create without schema".to_string()))?;
                state.tables.insert(
                    table_id,
                    StoredTable {
                        inner,
                        rows: Vec::new(),
                    },
                );
                ok()
            }
            Endpoint::Schema => {
                let t = state
                    .tables
                    .get(&table_id)
                    .ok_or_else(|| KtableError::NotFound(format!("schema: {table_id}")))?;
                encode_frames(&[Frame::schema_only(t.inner.clone())])
            }
            Endpoint::Drop | Endpoint::DeleteSchema => {
                state
                    .tables
                    .remove(&table_id)
                    .ok_or_else(|| KtableError::NotFound(format!("drop: {table_id}")))?;
                ok()
            }
            Endpoint::Begin => {
                let rows = state
                    .tables
                    .get(&table_id)
                    .ok_or_else(|| KtableError::NotFound(format!("begin: {table_id}")))?
                    .rows
                    .clone();
                state.next_id += 1;
                let id = format!("tx-{}", state.next_id);
                state.txs.insert(
                    id.clone(),
                    OpenTx {
                        table: table_id,
                        rows,
                    },
                );
                Ok(json!({ "tx_id": id }).to_string().into_bytes())
            }
            Endpoint::Commit => {
                let tx = take_tx(&mut state, tx_id)?;
                let t = state
                    .tables
                    .get_mut(&tx.table)
                    .ok_or_else(|| KtableError::NotFound(format!("commit: {}", tx.table)))?;
                t.rows = tx.rows;
                ok()
            }
            Endpoint::Rollback => {
                take_tx(&mut state, tx_id)?;
                ok()
            }
            Endpoint::Insert => {
                let Body::Bytes(bytes) = &req.body else {
                    return Err(KtableError::Server("insert needs a batch stream".to_string()));
                };
                let batches = decode_frames(bytes)?
                    .into_iter()
                    .filter_map(|f| f.batch)
                    .collect::<Vec<_>>();
                let rows = rows_mut(&mut state, &table_id, tx_id.as_deref())?;
                rows.extend(batches);
                ok()
            }
            Endpoint::Select => {
                let body = json_body(req)?;
                state.last_select = Some(body.clone());
                if state.fail_selects > 0 {
                    state.fail_selects -= 1;
                    return Err(KtableError::Transport("injected: 503".to_string()));
                }
                if let Some(message) = state.error_frame.take() {
                    return encode_frames(&[Frame::error(message)]);
                }
                let cursor = body["cursor"].as_str().unwrap_or_default().to_string();
                if cursor.is_empty() {
                    let inner = inner_of(&state, &table_id)?;
                    let rows = rows_mut(&mut state, &table_id, tx_id.as_deref())?.clone();
                    let (hit, _) = split_rows(&inner, &rows, &body["query"])?;
                    let hit = match body["cols"].as_array() {
                        Some(cols) => project(&hit, cols)?,
                        None => hit,
                    };
                    self.page(&mut state, hit)
                } else {
                    self.resume(&mut state, &cursor)
                }
            }
            Endpoint::Replace => {
                let body = json_body(req)?;
                let cursor = body["cursor"].as_str().unwrap_or_default().to_string();
                if !cursor.is_empty() {
                    return self.resume(&mut state, &cursor);
                }
                if tx_id.is_none() {
                    return Err(KtableError::Server("replace outside a transaction".to_string()));
                }
                let inner = inner_of(&state, &table_id)?;
                let rows = rows_mut(&mut state, &table_id, tx_id.as_deref())?;
                let (hit, rest) = split_rows(&inner, rows, &body["query"])?;
                *rows = vec![rest];
                self.page(&mut state, hit)
            }
            Endpoint::BigUpload => {
                let Body::Bytes(bytes) = &req.body else {
                    return Err(KtableError::Server("upload needs bytes".to_string()));
                };
                let id = req
                    .param_value("big_id")
                    .ok_or_else(|| KtableError::Server("missing big_id".to_string()))?;
                state.blobs.insert(id.to_string(), bytes.clone());
                ok()
            }
            Endpoint::BigDownload => {
                let id = req.param_value("big_id").unwrap_or_default();
                state
                    .blobs
                    .get(id)
                    .cloned()
                    .ok_or_else(|| KtableError::NotFound(format!("blob {id}")))
            }
        }
    }

    fn page(&self, state: &mut ServerState, rows: RecordBatch) -> Result<Vec<u8>> {
        let mut pages = VecDeque::new();
        let mut offset = 0;
        while offset < rows.num_rows() {
            let len = self.page_rows.min(rows.num_rows() - offset);
            pages.push_back(rows.slice(offset, len));
            offset += len;
        }
        if pages.is_empty() {
            return encode_frames(&[Frame::data(rows)]);
        }
        state.next_id += 1;
        let token = format!("c-{}", state.next_id);
        state.cursors.insert(token.clone(), pages);
        self.resume(state, &token)
    }

    fn resume(&self, state: &mut ServerState, token: &str) -> Result<Vec<u8>> {
        let pages = state
            .cursors
            .get_mut(token)
            .ok_or_else(|| KtableError::Server(format!("unknown cursor {token}")))?;
        let Some(page) = pages.pop_front() else {
            return Ok(Vec::new());
        };
        let mut frames = vec![Frame::data(page)];
        if pages.is_empty() {
            state.cursors.remove(token);
        } else {
            frames.push(Frame::cursor(token));
        }
        encode_frames(&frames)
    }
}

impl Transport for FakeServer {
    fn call(&self, req: &Request) -> Result<Vec<u8>> {
        self.handle(req)
    }

    fn stream(&self, req: &Request) -> Result<ByteChunks> {
        let bytes = self.handle(req)?;
        let chunks = bytes
            .chunks(self.chunk_bytes)
            .map(|c| Ok(c.to_vec()))
            .collect::<Vec<_>>();
        Ok(Box::new(chunks.into_iter()))
    }
}

fn ok() -> Result<Vec<u8>> {
    Ok(br#"{"ok":true}"#.to_vec())
}

fn json_body(req: &Request) -> Result<Value> {
    match &req.body {
        Body::Json(v) => Ok(v.clone()),
        _ => Err(KtableError::Server(format!("{} needs a JSON body", req.endpoint))),
    }
}

fn take_tx(state: &mut ServerState, tx_id: Option<String>) -> Result<OpenTx> {
    let id = tx_id.ok_or_else(|| KtableError::Server("missing tx_id".to_string()))?;
    state
        .txs
        .remove(&id)
        .ok_or_else(|| KtableError::Server(format!("unknown transaction {id}")))
}

fn inner_of(state: &ServerState, table_id: &str) -> Result<SchemaRef> {
    state
        .tables
        .get(table_id)
        .map(|t| t.inner.clone())
        .ok_or_else(|| KtableError::NotFound(format!("table {table_id}")))
}

fn rows_mut<'a>(
    state: &'a mut ServerState,
    table_id: &str,
    tx_id: Option<&str>,
) -> Result<&'a mut Vec<RecordBatch>> {
    match tx_id {
        Some(id) => state
            .txs
            .get_mut(id)
            .map(|tx| &mut tx.rows)
            .ok_or_else(|| KtableError::Server(format!("unknown transaction {id}"))),
        None => state
            .tables
            .get_mut(table_id)
            .map(|t| &mut t.rows)
            .ok_or_else(|| KtableError::NotFound(format!("table {table_id}"))),
    }
}

/// (matching, non-matching) rows for a pushdown query; `null` matches all.
fn split_rows(
    inner: &SchemaRef,
    rows: &[RecordBatch],
    query: &Value,
) -> Result<(RecordBatch, RecordBatch)> {
    let all = concat_batches(inner, rows)
        .map_err(|e| KtableError::Execution(format!("concat: {e}")))?;
    match query.as_str() {
        None => Ok((all, RecordBatch::new_empty(inner.clone()))),
        Some(text) => Predicate::compile(&parse(text)?, inner)?.split(&all),
    }
}

fn project(batch: &RecordBatch, cols: &[Value]) -> Result<RecordBatch> {
    let schema = batch.schema();
    let indices = cols
        .iter()
        .filter_map(Value::as_str)
        .map(|c| {
            schema
                .index_of(c)
                .map_err(|_| KtableError::Server(format!("no column {c}")))
        })
        .collect::<Result<Vec<_>>>()?;
    batch
        .project(&indices)
        .map_err(|e| KtableError::Execution(format!("project: {e}")))
}
