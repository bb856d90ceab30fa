use std::sync::{Arc, Mutex};

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use ktable_codec::{bigcol, bsquare, transform_inward, transform_outward, BigBuffer, BlobStore};
use ktable_common::{ClientConfig, KtableError, Result, TxId};
use ktable_expr::Op;
use ktable_wire::{decode_frames, encode_frames, Frame};
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::convert::adopt_metadata;
use crate::cursor::Cursor;
use crate::query::{check_fields, inner_query, ExactFilter, IntoQuery};
use crate::scan::ScanRequest;
use crate::transport::{json_response, Endpoint, Request, Transport};
use crate::tx::Transaction;

#[derive(Debug, Clone)]
pub(crate) struct Schemas {
    pub outer: SchemaRef,
    pub inner: SchemaRef,
}

impl Schemas {
    fn from_outer(outer: SchemaRef) -> Self {
        let inner = transform_inward(&outer);
        Self { outer, inner }
    }

    fn from_inner(inner: SchemaRef) -> Self {
        let outer = transform_outward(&inner);
        Self { outer, inner }
    }
}

/// State shared by a table handle, its cursors and its transactions.
pub(crate) struct TableCore {
    pub id: String,
    pub transport: Arc<dyn Transport>,
    pub config: Arc<ClientConfig>,
    pub blobs: Arc<dyn BlobStore>,
    // None until created or successfully probed
    schemas: Mutex<Option<Schemas>>,
}

impl TableCore {
    pub(crate) fn new(
        id: String,
        transport: Arc<dyn Transport>,
        config: Arc<ClientConfig>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            id,
            transport,
            config,
            blobs,
            schemas: Mutex::new(None),
        }
    }

    pub(crate) fn request(&self, endpoint: Endpoint) -> Request {
        Request::new(endpoint).param("table_id", self.id.as_str())
    }

    fn cached_schemas(&self) -> Result<Option<Schemas>> {
        self.schemas
            .lock()
            .map(|s| s.clone())
            .map_err(|_| KtableError::Execution("table schema lock poisoned".to_string()))
    }

    fn set_schemas(&self, schemas: Option<Schemas>) -> Result<()> {
        let mut slot = self
            .schemas
            .lock()
            .map_err(|_| KtableError::Execution("table schema lock poisoned".to_string()))?;
        *slot = schemas;
        Ok(())
    }

    pub(crate) fn schemas(&self) -> Result<Schemas> {
        self.cached_schemas()?.ok_or_else(|| {
            KtableError::NotFound(format!(
                "table {} does not exist, create() it first",
                self.id
            ))
        })
    }

    fn probe(&self) -> Result<Schemas> {
        let bytes = self.transport.call(&self.request(Endpoint::Schema))?;
        let inner = decode_frames(&bytes)?
            .into_iter()
            .find_map(|f| f.schema)
            .ok_or_else(|| {
                KtableError::Server(format!("schema response for {} carried no schema", self.id))
            })?;
        Ok(Schemas::from_inner(inner))
    }

    /// Inner response batch back to the outer layout.
    pub(crate) fn decode(
        &self,
        inner: &SchemaRef,
        batch: &RecordBatch,
        pending: Option<&BigBuffer>,
    ) -> Result<RecordBatch> {
        let batch = adopt_metadata(batch, inner)?;
        let batch = bigcol::decode_batch(&batch, self.blobs.as_ref(), pending)?;
        bsquare::decode(&batch, inner)
    }

    pub(crate) fn select_cursor(
        self: &Arc<Self>,
        query: Option<Op>,
        cols: &[&str],
        tx_id: Option<TxId>,
        pending: Option<Arc<BigBuffer>>,
    ) -> Result<Cursor> {
        let schemas = self.schemas()?;
        check_fields(&schemas.outer, cols)?;

        let inner = match &query {
            Some(q) => {
                // surfaces compile errors before any request is sent
                ExactFilter::new(q.clone(), &schemas.outer)?;
                Some(inner_query(&schemas.outer, &schemas.inner, q)?)
            }
            None => None,
        };

        let (inner_cols, project) = if cols.is_empty() {
            (None, None)
        } else {
            let mut wanted = cols.iter().map(|c| c.to_string()).collect::<Vec<_>>();
            let project = wanted.clone();
            // the exact filter needs every column the query mentions
            if let Some(q) = &query {
                for f in q.fields() {
                    if !wanted.contains(&f) {
                        wanted.push(f);
                    }
                }
            }
            (Some(wanted), Some(project))
        };

        let mut body = Map::new();
        body.insert(
            "query".to_string(),
            inner.as_ref().map(|q| Value::String(q.to_string())).unwrap_or(Value::Null),
        );
        body.insert("cols".to_string(), json!(inner_cols));
        info!(
            table_id = %self.id,
            query = %body.get("query").unwrap_or(&serde_json::Value::Null),
            cols = ?inner_cols,
            "select"
        );
        let request = ScanRequest {
            endpoint: Endpoint::Select,
            table_id: self.id.clone(),
            tx_id,
            body,
        };
        Ok(Cursor::new(
            self.clone(),
            schemas.inner,
            schemas.outer,
            request,
            query,
            project,
            pending,
        ))
    }
}

/// Handle to one remote table.
///
/// A handle starts unknown (no schema) and becomes bound once the table is
/// created or its schema is fetched.
#[derive(Clone)]
pub struct Table {
    core: Arc<TableCore>,
}

impl Table {
    /// Probes the schema; a missing table leaves the handle unbound.
    pub(crate) fn open(core: TableCore) -> Result<Self> {
        let table = Self {
            core: Arc::new(core),
        };
        match table.core.probe() {
            Ok(schemas) => table.core.set_schemas(Some(schemas))?,
            Err(e) if e.is_not_found() => {
                info!(table_id = %table.core.id, "table does not exist yet");
            }
            Err(e) => return Err(e),
        }
        Ok(table)
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// True once the schema is known.
    pub fn exists(&self) -> bool {
        matches!(self.core.cached_schemas(), Ok(Some(_)))
    }

    pub fn create(&self, schema: SchemaRef) -> Result<()> {
        let schemas = Schemas::from_outer(schema);
        let body = encode_frames(&[Frame::schema_only(schemas.inner.clone())])?;
        let resp = self
            .core
            .transport
            .call(&self.core.request(Endpoint::Create).bytes(body))?;
        json_response(Endpoint::Create, &resp)?;
        info!(
            table_id = %self.core.id,
            columns = schemas.inner.fields().len(),
            "created table"
        );
        self.core.set_schemas(Some(schemas))
    }

    /// User-facing schema.
    pub fn schema(&self) -> Result<SchemaRef> {
        Ok(self.core.schemas()?.outer)
    }

    /// Stored schema, with derived geometry columns.
    pub fn inner_schema(&self) -> Result<SchemaRef> {
        Ok(self.core.schemas()?.inner)
    }

    /// Drops the table; a table that does not exist is not an error.
    pub fn drop(&self) -> Result<()> {
        match self.core.transport.call(&self.core.request(Endpoint::Drop)) {
            Ok(resp) => {
                let res = json_response(Endpoint::Drop, &resp)?;
                info!(table_id = %self.core.id, response = %res, "dropped table");
            }
            Err(e) if e.is_not_found() => {
                info!(table_id = %self.core.id, "table does not exist");
            }
            Err(e) => return Err(e),
        }
        self.core.set_schemas(None)
    }

    pub fn delete_schema(&self, drop_data: bool) -> Result<()> {
        let req = self
            .core
            .request(Endpoint::DeleteSchema)
            .json(json!({ "drop_data": drop_data }));
        let resp = self.core.transport.call(&req)?;
        json_response(Endpoint::DeleteSchema, &resp)?;
        info!(table_id = %self.core.id, drop_data, "deleted schema");
        self.core.set_schemas(None)
    }

    /// Lazy, restartable selection of committed rows.
    ///
    /// `cols` projects the result; empty means every column.
    pub fn select(&self, query: impl IntoQuery, cols: &[&str]) -> Result<Cursor> {
        self.core.select_cursor(query.into_query()?, cols, None, None)
    }

    pub fn begin(&self) -> Result<Transaction> {
        Transaction::begin(self.core.clone())
    }

    /// Runs `body` inside a transaction.
    ///
    /// Commits when `body` returns `Ok`. On `Err` the transaction is rolled
    /// back and the original error returned; rollback failures are only logged.
    pub fn transaction<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        let mut tx = self.begin()?;
        match body(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                warn!(table_id = %self.core.id, tx_id = %tx.id(), error = %e, "aborting transaction");
                if let Err(rollback_err) = tx.rollback() {
                    error!(
                        table_id = %self.core.id,
                        error = %rollback_err,
                        "ignored: rollback failed"
                    );
                }
                Err(e)
            }
        }
    }
}
