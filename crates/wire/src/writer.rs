use std::io::Write;

use ktable_common::{KtableError, Result};

use crate::frame::{encode_metadata, encode_payload, Frame, FRAME_MAGIC, FRAME_VERSION};

/// Writes frames back to back into any byte sink.
pub struct FrameWriter<W: Write> {
    inner: W,
    frames: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, frames: 0 }
    }

    pub fn write(&mut self, frame: &Frame) -> Result<()> {
        let meta = encode_metadata(&frame.metadata)?;
        let payload = encode_payload(frame)?;
        let meta_len = u32::try_from(meta.len())
            .map_err(|_| KtableError::InvalidArgument("frame metadata too large".to_string()))?;
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| KtableError::InvalidArgument("frame payload too large".to_string()))?;

        self.inner.write_all(FRAME_MAGIC)?;
        self.inner.write_all(&FRAME_VERSION.to_le_bytes())?;
        self.inner.write_all(&meta_len.to_le_bytes())?;
        self.inner.write_all(&payload_len.to_le_bytes())?;
        self.inner.write_all(&meta)?;
        self.inner.write_all(&payload)?;
        self.frames += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> usize {
        self.frames
    }

    pub fn finish(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

pub fn encode_frames<'a>(frames: impl IntoIterator<Item = &'a Frame>) -> Result<Vec<u8>> {
    let mut writer = FrameWriter::new(Vec::new());
    for f in frames {
        writer.write(f)?;
    }
    writer.finish()
}
