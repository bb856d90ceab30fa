//! Query intake: surface syntaxes, pushdown rewriting and exact re-filtering.

use arrow::record_batch::RecordBatch;
use arrow_schema::{Schema, SchemaRef};
use ktable_codec::{bigcol, bsquare};
use ktable_common::{KtableError, Result};
use ktable_expr::{parse, parse_oqs, Op, Predicate, ScalarKind};
use serde_json::Value;
use tracing::debug;

/// Anything accepted where a query is expected.
///
/// `None` means "every row". Text is the infix language; JSON values are OQS
/// documents.
pub trait IntoQuery {
    fn into_query(self) -> Result<Option<Op>>;
}

fn parse_text(text: &str) -> Result<Option<Op>> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    parse(text).map(Some)
}

impl IntoQuery for &str {
    fn into_query(self) -> Result<Option<Op>> {
        parse_text(self)
    }
}

impl IntoQuery for String {
    fn into_query(self) -> Result<Option<Op>> {
        parse_text(&self)
    }
}

impl IntoQuery for &String {
    fn into_query(self) -> Result<Option<Op>> {
        parse_text(self)
    }
}

impl IntoQuery for Op {
    fn into_query(self) -> Result<Option<Op>> {
        Ok(Some(self))
    }
}

impl IntoQuery for &Op {
    fn into_query(self) -> Result<Option<Op>> {
        Ok(Some(self.clone()))
    }
}

impl IntoQuery for Option<Op> {
    fn into_query(self) -> Result<Option<Op>> {
        Ok(self)
    }
}

impl IntoQuery for &Value {
    fn into_query(self) -> Result<Option<Op>> {
        match self {
            Value::Null => Ok(None),
            Value::String(text) => parse_text(text),
            doc => parse_oqs(doc).map(Some),
        }
    }
}

impl IntoQuery for Value {
    fn into_query(self) -> Result<Option<Op>> {
        (&self).into_query()
    }
}

pub(crate) fn is_null_literal(op: &Op) -> bool {
    matches!(op, Op::Scalar(s) if s.kind == ScalarKind::Null)
}

/// Fails with `Compile` naming the first field missing from `schema`.
pub(crate) fn check_fields(schema: &Schema, names: impl IntoIterator<Item = impl AsRef<str>>) -> Result<()> {
    for name in names {
        let name = name.as_ref();
        if schema.index_of(name).is_err() {
            return Err(KtableError::Compile(format!("unknown column: {name}")));
        }
    }
    Ok(())
}

/// Rewrites an outer query into the pushdown query sent to the server.
pub(crate) fn inner_query(outer: &Schema, inner: &Schema, query: &Op) -> Result<Op> {
    check_fields(outer, query.fields())?;
    debug!(query = %query, "outer query");
    let rewritten = bsquare::convert_query(outer, query)?;
    debug!(query = %rewritten, "bsquare query");
    let rewritten = bigcol::inner_exp(inner, &rewritten)?;
    debug!(query = %rewritten, "bigcol query");
    Ok(rewritten)
}

/// Exact predicate, compiled on first use for each distinct batch schema.
///
/// Pushdown only prunes; every decoded batch goes through this filter.
pub(crate) struct ExactFilter {
    query: Op,
    compiled: Option<(SchemaRef, Predicate)>,
}

impl ExactFilter {
    pub(crate) fn new(query: Op, outer: &SchemaRef) -> Result<Self> {
        let predicate = Predicate::compile(&query, outer)?;
        Ok(Self {
            query,
            compiled: Some((outer.clone(), predicate)),
        })
    }

    fn predicate(&mut self, schema: &SchemaRef) -> Result<&Predicate> {
        let stale = match &self.compiled {
            Some((s, _)) => s != schema,
            None => true,
        };
        if stale {
            let predicate = Predicate::compile(&self.query, schema)?;
            self.compiled = Some((schema.clone(), predicate));
        }
        match &self.compiled {
            Some((_, p)) => Ok(p),
            None => Err(KtableError::Execution("exact filter not compiled".to_string())),
        }
    }

    pub(crate) fn filter(&mut self, batch: &RecordBatch) -> Result<RecordBatch> {
        let schema = batch.schema();
        self.predicate(&schema)?.filter(batch)
    }

    pub(crate) fn split(&mut self, batch: &RecordBatch) -> Result<(RecordBatch, RecordBatch)> {
        let schema = batch.schema();
        self.predicate(&schema)?.split(batch)
    }
}
