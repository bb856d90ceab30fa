//! Frame layout:
//!
//! | bytes | content                                   |
//! |-------|-------------------------------------------|
//! | 4     | magic `KTBS`                              |
//! | 4     | version, u32 LE                           |
//! | 4     | metadata length, u32 LE                   |
//! | 4     | payload length, u32 LE                    |
//! | n     | metadata: JSON object of string → string  |
//! | m     | payload: Arrow IPC stream, ≤ 1 batch      |
//!
//! An empty payload marks a control-only frame.

use std::collections::BTreeMap;
use std::io::Cursor;

use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use ktable_common::{KtableError, Result};

pub const FRAME_MAGIC: &[u8; 4] = b"KTBS";
pub const FRAME_VERSION: u32 = 1;
pub const FRAME_HEADER_LEN: usize = 16;

/// Metadata key asking the caller to re-issue the request with this cursor.
pub const CURSOR_KEY: &str = "cursor";
/// Metadata key carrying a server-side abort message.
pub const ERROR_KEY: &str = "error";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub metadata: BTreeMap<String, String>,
    pub schema: Option<SchemaRef>,
    pub batch: Option<RecordBatch>,
}

impl Frame {
    pub fn data(batch: RecordBatch) -> Self {
        Self {
            metadata: BTreeMap::new(),
            schema: Some(batch.schema()),
            batch: Some(batch),
        }
    }

    /// Schema with no rows, as used by `create` and `schema`.
    pub fn schema_only(schema: SchemaRef) -> Self {
        Self {
            metadata: BTreeMap::new(),
            schema: Some(schema),
            batch: None,
        }
    }

    pub fn cursor(token: impl Into<String>) -> Self {
        Self::default().with_meta(CURSOR_KEY, token)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::default().with_meta(ERROR_KEY, message)
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn cursor_token(&self) -> Option<&str> {
        self.metadata.get(CURSOR_KEY).map(String::as_str)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.metadata.get(ERROR_KEY).map(String::as_str)
    }

    pub fn num_rows(&self) -> usize {
        self.batch.as_ref().map(RecordBatch::num_rows).unwrap_or(0)
    }
}

pub(crate) fn encode_payload(frame: &Frame) -> Result<Vec<u8>> {
    let Some(schema) = frame.schema.as_ref() else {
        if frame.batch.is_some() {
            return Err(KtableError::InvalidArgument(
                "frame batch without schema".to_string(),
            ));
        }
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut out, schema.as_ref())
            .map_err(|e| KtableError::Execution(format!("ipc writer init failed: {e}")))?;
        if let Some(batch) = frame.batch.as_ref() {
            writer
                .write(batch)
                .map_err(|e| KtableError::Execution(format!("ipc write failed: {e}")))?;
        }
        writer
            .finish()
            .map_err(|e| KtableError::Execution(format!("ipc finish failed: {e}")))?;
    }
    Ok(out)
}

pub(crate) fn decode_payload(bytes: &[u8]) -> Result<(Option<SchemaRef>, Option<RecordBatch>)> {
    if bytes.is_empty() {
        return Ok((None, None));
    }
    let mut reader = StreamReader::try_new(Cursor::new(bytes), None)
        .map_err(|e| KtableError::Execution(format!("ipc reader init failed: {e}")))?;
    let schema = reader.schema();
    let batch = reader
        .next()
        .transpose()
        .map_err(|e| KtableError::Execution(format!("ipc read failed: {e}")))?;
    if reader.next().is_some() {
        return Err(KtableError::Execution(
            "frame payload holds more than one batch".to_string(),
        ));
    }
    Ok((Some(schema), batch))
}

pub(crate) fn encode_metadata(meta: &BTreeMap<String, String>) -> Result<Vec<u8>> {
    if meta.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::to_vec(meta)
        .map_err(|e| KtableError::Execution(format!("frame metadata encode failed: {e}")))
}

pub(crate) fn decode_metadata(bytes: &[u8]) -> Result<BTreeMap<String, String>> {
    if bytes.is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_slice(bytes)
        .map_err(|e| KtableError::Execution(format!("frame metadata decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::Frame;

    #[test]
    fn control_accessors() {
        let f = Frame::cursor("c1");
        assert_eq!(f.cursor_token(), Some("c1"));
        assert_eq!(f.error_message(), None);
        assert_eq!(f.num_rows(), 0);
        assert_eq!(Frame::error("boom").error_message(), Some("boom"));
    }
}
