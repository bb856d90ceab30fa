use ktable_common::{KtableError, Result};
use tracing::debug;

use crate::frame::{
    decode_metadata, decode_payload, Frame, FRAME_HEADER_LEN, FRAME_MAGIC, FRAME_VERSION,
};

/// Incremental frame decoder fed with arbitrary byte chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    pos: usize,
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(chunk);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let avail = &self.buf[self.pos..];
        if avail.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        if &avail[0..4] != FRAME_MAGIC {
            return Err(KtableError::Execution("invalid frame magic".to_string()));
        }
        let version = le_u32(avail, 4);
        if version != FRAME_VERSION {
            return Err(KtableError::Server(format!(
                "unsupported frame version {version}, expected {FRAME_VERSION}"
            )));
        }
        let meta_len = le_u32(avail, 8) as usize;
        let payload_len = le_u32(avail, 12) as usize;
        let total = FRAME_HEADER_LEN + meta_len + payload_len;
        if avail.len() < total {
            return Ok(None);
        }
        let meta_end = FRAME_HEADER_LEN + meta_len;
        let metadata = decode_metadata(&avail[FRAME_HEADER_LEN..meta_end])?;
        let (schema, batch) = decode_payload(&avail[meta_end..total])?;
        self.pos += total;
        Ok(Some(Frame {
            metadata,
            schema,
            batch,
        }))
    }

    /// Fails when the input stopped in the middle of a frame.
    pub fn finish(&self) -> Result<()> {
        match self.buffered() {
            0 => Ok(()),
            n => Err(KtableError::Execution(format!(
                "batch stream truncated: {n} trailing bytes"
            ))),
        }
    }
}

/// Frames pulled lazily from a chunk iterator.
///
/// Chunk errors are passed through unchanged so callers can still classify
/// them (for instance as transient transport failures).
pub struct FrameStream<I> {
    chunks: I,
    decoder: FrameDecoder,
    done: bool,
}

impl<I> FrameStream<I>
where
    I: Iterator<Item = Result<Vec<u8>>>,
{
    pub fn new(chunks: I) -> Self {
        Self {
            chunks,
            decoder: FrameDecoder::new(),
            done: false,
        }
    }
}

impl<I> Iterator for FrameStream<I>
where
    I: Iterator<Item = Result<Vec<u8>>>,
{
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => return Some(Ok(frame)),
                Ok(None) => {}
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
            match self.chunks.next() {
                Some(Ok(chunk)) => {
                    debug!(bytes = chunk.len(), "batch stream chunk");
                    self.decoder.push(&chunk);
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    return self.decoder.finish().err().map(Err);
                }
            }
        }
    }
}

/// Decodes a fully buffered batch stream.
pub fn decode_frames(bytes: &[u8]) -> Result<Vec<Frame>> {
    FrameStream::new(std::iter::once(Ok(bytes.to_vec()))).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use arrow::array::{Int64Array, StringArray};
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use ktable_common::KtableError;

    use super::{decode_frames, FrameDecoder, FrameStream};
    use crate::frame::Frame;
    use crate::writer::encode_frames;

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("loc", DataType::Utf8, true)
                .with_metadata(HashMap::from([("isGeometry".to_string(), "1".to_string())])),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1_i64, 2, 3])),
                Arc::new(StringArray::from(vec![
                    Some("POINT(0 0)"),
                    None,
                    Some("POINT(1 1)"),
                ])),
            ],
        )
        .expect("batch")
    }

    #[test]
    fn frames_survive_arbitrary_chunking() {
        let b = batch();
        let frames = vec![
            Frame::data(b.clone()),
            Frame::schema_only(b.schema()),
            Frame::cursor("next-page"),
        ];
        let bytes = encode_frames(&frames).expect("encode");

        for chunk_size in [1, 7, 64, bytes.len()] {
            let chunks = bytes
                .chunks(chunk_size)
                .map(|c| Ok::<_, KtableError>(c.to_vec()))
                .collect::<Vec<_>>();
            let out = FrameStream::new(chunks.into_iter())
                .collect::<ktable_common::Result<Vec<_>>>()
                .expect("decode");
            assert_eq!(out.len(), 3);
            assert_eq!(out[0].batch.as_ref(), Some(&b));
            // field metadata travels with the schema
            let schema = out[1].schema.as_ref().expect("schema");
            assert!(schema
                .field_with_name("loc")
                .expect("loc")
                .metadata()
                .contains_key("isGeometry"));
            assert!(out[1].batch.is_none());
            assert_eq!(out[2].cursor_token(), Some("next-page"));
            assert!(out[2].schema.is_none());
        }
    }

    #[test]
    fn empty_input_is_an_empty_stream() {
        assert!(decode_frames(&[]).expect("empty").is_empty());
    }

    #[test]
    fn truncated_and_corrupt_streams_fail() {
        let bytes = encode_frames(&[Frame::data(batch())]).expect("encode");
        let err = decode_frames(&bytes[..bytes.len() - 3]).expect_err("truncated");
        assert!(err.to_string().contains("truncated"));

        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(decode_frames(&bad).is_err());
    }

    #[test]
    fn unknown_frame_versions_are_rejected() {
        let mut bytes = encode_frames(&[Frame::cursor("c")]).expect("encode");
        bytes[4..8].copy_from_slice(&2u32.to_le_bytes());
        let err = decode_frames(&bytes).expect_err("version");
        assert!(matches!(err, KtableError::Server(_)), "{err}");
        assert!(err.to_string().contains("version 2"), "{err}");
    }

    #[test]
    fn chunk_errors_pass_through() {
        let bytes = encode_frames(&[Frame::error("x")]).expect("encode");
        let chunks = vec![
            Ok(bytes),
            Err(KtableError::Transport("connection reset".to_string())),
        ];
        let mut stream = FrameStream::new(chunks.into_iter());
        let first = stream.next().expect("frame").expect("ok");
        assert_eq!(first.error_message(), Some("x"));
        let err = stream.next().expect("err").expect_err("transport");
        assert!(err.is_transient());
        assert!(stream.next().is_none());
    }

    #[test]
    fn decoder_waits_for_full_frame() {
        let bytes = encode_frames(&[Frame::cursor("c")]).expect("encode");
        let mut dec = FrameDecoder::new();
        dec.push(&bytes[..10]);
        assert!(dec.next_frame().expect("partial").is_none());
        assert!(dec.finish().is_err());
        dec.push(&bytes[10..]);
        let f = dec.next_frame().expect("full").expect("frame");
        assert_eq!(f.cursor_token(), Some("c"));
        dec.finish().expect("clean boundary");
    }
}
