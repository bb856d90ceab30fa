//! Row and schema conversions at the API boundary.

use std::sync::Arc;

use arrow::array::{new_null_array, ArrayRef};
use arrow::compute::kernels::cast::cast;
use arrow::json::writer::JsonArray;
use arrow::json::{ReaderBuilder, WriterBuilder};
use arrow::record_batch::RecordBatch;
use arrow_schema::{FieldRef, Schema, SchemaRef};
use ktable_common::{KtableError, Result};
use serde_json::{Map, Value};

/// Rows of `batch` as JSON objects; nulls are kept as explicit `null`s.
pub fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<Map<String, Value>>> {
    if batch.num_rows() == 0 {
        return Ok(Vec::new());
    }
    let mut writer = WriterBuilder::new()
        .with_explicit_nulls(true)
        .build::<_, JsonArray>(Vec::new());
    writer
        .write(batch)
        .map_err(|e| KtableError::Execution(format!("json encode failed: {e}")))?;
    writer
        .finish()
        .map_err(|e| KtableError::Execution(format!("json encode failed: {e}")))?;
    let bytes = writer.into_inner();
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| KtableError::Execution(format!("json rows decode failed: {e}")))
}

/// Builds one batch of `schema` from JSON objects.
pub fn rows_to_batch(schema: &SchemaRef, rows: &[Value]) -> Result<RecordBatch> {
    let mut decoder = ReaderBuilder::new(schema.clone())
        .build_decoder()
        .map_err(|e| KtableError::Execution(format!("json decoder init failed: {e}")))?;
    decoder
        .serialize(rows)
        .map_err(|e| KtableError::InvalidArgument(format!("rows do not match schema: {e}")))?;
    let batch = decoder
        .flush()
        .map_err(|e| KtableError::InvalidArgument(format!("rows do not match schema: {e}")))?;
    Ok(batch.unwrap_or_else(|| RecordBatch::new_empty(schema.clone())))
}

/// Rebuilds `batch` with `target`'s layout, matching columns by name.
///
/// Missing nullable columns become all-null; mismatched types are cast.
pub(crate) fn align_to_schema(batch: &RecordBatch, target: &SchemaRef) -> Result<RecordBatch> {
    if batch.schema().as_ref() == target.as_ref() {
        return Ok(batch.clone());
    }
    let source = batch.schema();
    for f in source.fields() {
        if target.index_of(f.name()).is_err() {
            return Err(KtableError::InvalidArgument(format!(
                "unknown column: {}",
                f.name()
            )));
        }
    }
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(target.fields().len());
    for field in target.fields() {
        let column = match source.index_of(field.name()) {
            Ok(i) => {
                let values = batch.column(i);
                if values.data_type() == field.data_type() {
                    values.clone()
                } else {
                    cast(values, field.data_type()).map_err(|e| {
                        KtableError::InvalidArgument(format!(
                            "column '{}' cannot be stored as {:?}: {e}",
                            field.name(),
                            field.data_type()
                        ))
                    })?
                }
            }
            Err(_) if field.is_nullable() => new_null_array(field.data_type(), batch.num_rows()),
            Err(_) => {
                return Err(KtableError::InvalidArgument(format!(
                    "missing non-nullable column: {}",
                    field.name()
                )))
            }
        };
        columns.push(column);
    }
    RecordBatch::try_new(target.clone(), columns)
        .map_err(|e| KtableError::InvalidArgument(format!("batch does not fit schema: {e}")))
}

/// Re-attaches field metadata from `reference` to same-named, same-typed columns.
///
/// Decoding relies on field metadata (geometry and big markers), which a
/// server may not echo back.
pub(crate) fn adopt_metadata(batch: &RecordBatch, reference: &Schema) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut changed = false;
    let fields = schema
        .fields()
        .iter()
        .map(|f| match reference.field_with_name(f.name()) {
            Ok(r) if r.data_type() == f.data_type() && r.metadata() != f.metadata() => {
                changed = true;
                Arc::new(f.as_ref().clone().with_metadata(r.metadata().clone()))
            }
            _ => f.clone(),
        })
        .collect::<Vec<FieldRef>>();
    if !changed {
        return Ok(batch.clone());
    }
    let schema = Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone()));
    RecordBatch::try_new(schema, batch.columns().to_vec())
        .map_err(|e| KtableError::Execution(format!("schema metadata reattach failed: {e}")))
}

/// Columns `cols` of `batch`, in that order.
pub(crate) fn project(batch: &RecordBatch, cols: &[String]) -> Result<RecordBatch> {
    let schema = batch.schema();
    let indices = cols
        .iter()
        .map(|c| {
            schema
                .index_of(c)
                .map_err(|_| KtableError::Compile(format!("unknown column: {c}")))
        })
        .collect::<Result<Vec<_>>>()?;
    batch
        .project(&indices)
        .map_err(|e| KtableError::Execution(format!("projection failed: {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use arrow::array::{Array, Int32Array, Int64Array, StringArray};
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use serde_json::json;

    use super::{adopt_metadata, align_to_schema, batch_to_rows, project, rows_to_batch};

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true)
                .with_metadata(HashMap::from([("big".to_string(), "1".to_string())])),
        ]))
    }

    #[test]
    fn json_rows_round_trip_with_nulls() {
        let rows = vec![json!({"id": 1, "name": "a"}), json!({"id": 2})];
        let batch = rows_to_batch(&schema(), &rows).expect("batch");
        assert_eq!(batch.num_rows(), 2);
        let back = batch_to_rows(&batch).expect("rows");
        assert_eq!(back[0].get("name"), Some(&json!("a")));
        assert_eq!(back[1].get("name"), Some(&json!(null)));
        assert!(batch_to_rows(&RecordBatch::new_empty(schema()))
            .expect("empty")
            .is_empty());
    }

    #[test]
    fn align_fills_casts_and_rejects() {
        let loose = Arc::new(Schema::new(vec![Field::new("id", DataType::Int32, false)]));
        let batch = RecordBatch::try_new(loose, vec![Arc::new(Int32Array::from(vec![7, 8]))])
            .expect("batch");
        let aligned = align_to_schema(&batch, &schema()).expect("align");
        assert_eq!(aligned.schema(), schema());
        assert_eq!(aligned.column(1).null_count(), 2);

        let extra = Arc::new(Schema::new(vec![Field::new("zzz", DataType::Int64, true)]));
        let batch = RecordBatch::try_new(extra, vec![Arc::new(Int64Array::from(vec![1_i64]))])
            .expect("batch");
        assert!(align_to_schema(&batch, &schema()).is_err());
    }

    #[test]
    fn metadata_is_reattached_and_projection_orders() {
        let bare = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            bare,
            vec![
                Arc::new(Int64Array::from(vec![1_i64])),
                Arc::new(StringArray::from(vec!["x"])),
            ],
        )
        .expect("batch");
        let adopted = adopt_metadata(&batch, &schema()).expect("adopt");
        assert!(adopted
            .schema()
            .field_with_name("name")
            .expect("name")
            .metadata()
            .contains_key("big"));

        let p = project(&adopted, &["name".to_string(), "id".to_string()]).expect("project");
        assert_eq!(p.schema().field(0).name(), "name");
        assert!(project(&adopted, &["nope".to_string()]).is_err());
    }
}
