//! Batch-level big-column encode/decode.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, BinaryBuilder, StringBuilder};
use arrow::record_batch::RecordBatch;
use arrow_schema::DataType;
use ktable_common::{BlobId, KtableError, Result};
use tracing::debug;

use super::buffer::BigBuffer;
use super::reference::{bytes_prefix, is_short, long_token, short_token, str_prefix, BigRef};
use super::{is_big_field, BlobStore, SMALL_MAX};

/// Replaces long values in big columns with tokens, appending them to `buffer`.
///
/// String/binary columns not marked big reject values over `SMALL_MAX` bytes.
pub fn encode_batch(batch: &RecordBatch, buffer: &BigBuffer) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(batch.num_columns());
    for (field, values) in schema.fields().iter().zip(batch.columns()) {
        if is_big_field(field) {
            columns.push(encode_column(values, buffer)?);
            continue;
        }
        check_small(field.name(), values)?;
        columns.push(values.clone());
    }
    RecordBatch::try_new(schema.clone(), columns)
        .map_err(|e| KtableError::Execution(format!("big encode failed: {e}")))
}

fn check_small(name: &str, values: &ArrayRef) -> Result<()> {
    let too_long = |len: usize, row: usize| -> Result<()> {
        if len > SMALL_MAX {
            return Err(KtableError::InvalidArgument(format!(
                "field '{name}' row {row} is too long ({len} bytes > {SMALL_MAX}); mark it big"
            )));
        }
        Ok(())
    };
    match values.data_type() {
        DataType::Utf8 => {
            let arr = values.as_string::<i32>();
            for row in 0..arr.len() {
                if arr.is_valid(row) {
                    too_long(arr.value(row).len(), row)?;
                }
            }
        }
        DataType::Binary => {
            let arr = values.as_binary::<i32>();
            for row in 0..arr.len() {
                if arr.is_valid(row) {
                    too_long(arr.value(row).len(), row)?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn encode_column(values: &ArrayRef, buffer: &BigBuffer) -> Result<ArrayRef> {
    match values.data_type() {
        DataType::Utf8 => {
            let arr = values.as_string::<i32>();
            let mut out = StringBuilder::with_capacity(arr.len(), arr.len() * 16);
            for row in 0..arr.len() {
                if arr.is_null(row) {
                    out.append_null();
                    continue;
                }
                let v = arr.value(row);
                if is_short(v.len()) {
                    out.append_value(format!("{v}~"));
                } else {
                    let ptr = buffer.append(v.as_bytes())?;
                    out.append_value(format!("{}~{}", str_prefix(v), ptr.render()));
                }
            }
            Ok(Arc::new(out.finish()))
        }
        DataType::Binary => {
            let arr = values.as_binary::<i32>();
            let mut out = BinaryBuilder::with_capacity(arr.len(), arr.len() * 16);
            for row in 0..arr.len() {
                if arr.is_null(row) {
                    out.append_null();
                    continue;
                }
                let v = arr.value(row);
                if is_short(v.len()) {
                    out.append_value(short_token(v));
                } else {
                    let ptr = buffer.append(v)?;
                    out.append_value(long_token(bytes_prefix(v), &ptr));
                }
            }
            Ok(Arc::new(out.finish()))
        }
        other => Err(KtableError::Unsupported(format!(
            "big column of type {other:?}"
        ))),
    }
}

/// Resolves pointers for one decode call; each blob is fetched at most once.
struct Resolver<'a> {
    store: &'a dyn BlobStore,
    pending: Option<&'a BigBuffer>,
    memo: HashMap<BlobId, Arc<Vec<u8>>>,
}

impl Resolver<'_> {
    fn resolve(&mut self, r: &BigRef<'_>) -> Result<Vec<u8>> {
        let Some(ptr) = &r.pointer else {
            return Ok(r.prefix.to_vec());
        };
        if let Some(buf) = self.pending {
            if let Some(bytes) = buf.read_pending(ptr)? {
                return Ok(bytes);
            }
        }
        let blob = match self.memo.get(&ptr.blob_id) {
            Some(b) => b.clone(),
            None => {
                debug!(blob_id = %ptr.blob_id, "fetching big-column blob");
                let b = Arc::new(self.store.fetch(&ptr.blob_id)?);
                self.memo.insert(ptr.blob_id.clone(), b.clone());
                b
            }
        };
        let end = ptr.offset.saturating_add(ptr.size);
        blob.get(ptr.offset..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                KtableError::Execution(format!(
                    "pointer {} past end of blob ({} bytes)",
                    ptr.render(),
                    blob.len()
                ))
            })
    }
}

/// Replaces tokens in big columns with full values.
///
/// `pending` is consulted before `store` so values written earlier in the
/// same transaction resolve without an upload.
pub fn decode_batch(
    batch: &RecordBatch,
    store: &dyn BlobStore,
    pending: Option<&BigBuffer>,
) -> Result<RecordBatch> {
    let schema = batch.schema();
    if !schema.fields().iter().any(|f| is_big_field(f)) {
        return Ok(batch.clone());
    }
    let mut resolver = Resolver {
        store,
        pending,
        memo: HashMap::new(),
    };
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(batch.num_columns());
    for (field, values) in schema.fields().iter().zip(batch.columns()) {
        if !is_big_field(field) {
            columns.push(values.clone());
            continue;
        }
        columns.push(decode_column(field.name(), values, &mut resolver)?);
    }
    RecordBatch::try_new(schema.clone(), columns)
        .map_err(|e| KtableError::Execution(format!("big decode failed: {e}")))
}

fn decode_column(name: &str, values: &ArrayRef, resolver: &mut Resolver<'_>) -> Result<ArrayRef> {
    match values.data_type() {
        DataType::Utf8 => {
            let arr = values.as_string::<i32>();
            let mut out = StringBuilder::with_capacity(arr.len(), arr.len() * 16);
            for row in 0..arr.len() {
                if arr.is_null(row) {
                    out.append_null();
                    continue;
                }
                let bytes = resolver.resolve(&BigRef::parse(arr.value(row).as_bytes())?)?;
                let s = String::from_utf8(bytes).map_err(|_| {
                    KtableError::Execution(format!("column '{name}' row {row}: value is not utf-8"))
                })?;
                out.append_value(s);
            }
            Ok(Arc::new(out.finish()))
        }
        DataType::Binary => {
            let arr = values.as_binary::<i32>();
            let mut out = BinaryBuilder::with_capacity(arr.len(), arr.len() * 16);
            for row in 0..arr.len() {
                if arr.is_null(row) {
                    out.append_null();
                    continue;
                }
                out.append_value(resolver.resolve(&BigRef::parse(arr.value(row))?)?);
            }
            Ok(Arc::new(out.finish()))
        }
        other => Err(KtableError::Unsupported(format!(
            "big column '{name}' of type {other:?}"
        ))),
    }
}
