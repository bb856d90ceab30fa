use std::sync::{Arc, Mutex, MutexGuard};

use ktable_common::{human_bytes, BlobId, KtableError, Result};
use tracing::{debug, info};

use super::reference::Pointer;
use super::{BlobStore, MAX_BIGFILE_SIZE};

struct BufferState {
    blob_id: BlobId,
    data: Vec<u8>,
}

impl BufferState {
    fn fresh() -> Self {
        Self {
            blob_id: BlobId::generate(),
            data: Vec::new(),
        }
    }
}

/// Write-side accumulator for externalised values.
///
/// Values are appended to one in-memory blob; the blob is uploaded and a new
/// id started once it grows past the size ceiling, or on [`BigBuffer::flush`].
/// One mutex guards append, flush and reads of the pending blob.
pub struct BigBuffer {
    store: Arc<dyn BlobStore>,
    max_size: usize,
    state: Mutex<BufferState>,
}

impl BigBuffer {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self::with_max_size(store, MAX_BIGFILE_SIZE)
    }

    pub fn with_max_size(store: Arc<dyn BlobStore>, max_size: usize) -> Self {
        Self {
            store,
            max_size: max_size.max(1),
            state: Mutex::new(BufferState::fresh()),
        }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    fn lock(&self) -> Result<MutexGuard<'_, BufferState>> {
        self.state
            .lock()
            .map_err(|_| KtableError::Execution("big buffer lock poisoned".to_string()))
    }

    /// Appends `value`, returning where it will live once uploaded.
    pub fn append(&self, value: &[u8]) -> Result<Pointer> {
        let mut state = self.lock()?;
        let pointer = Pointer {
            blob_id: state.blob_id.clone(),
            offset: state.data.len(),
            size: value.len(),
        };
        state.data.extend_from_slice(value);
        if state.data.len() > self.max_size {
            self.upload(&mut state)?;
        }
        Ok(pointer)
    }

    /// Uploads the pending blob, if any.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.data.is_empty() {
            return Ok(());
        }
        self.upload(&mut state)
    }

    fn upload(&self, state: &mut BufferState) -> Result<()> {
        info!(
            blob_id = %state.blob_id,
            size = %human_bytes(state.data.len() as u64),
            "uploading big-column blob"
        );
        self.store.upload(&state.blob_id, &state.data)?;
        *state = BufferState::fresh();
        Ok(())
    }

    /// Bytes of a value still sitting in the un-uploaded blob.
    pub fn read_pending(&self, pointer: &Pointer) -> Result<Option<Vec<u8>>> {
        let state = self.lock()?;
        if state.blob_id != pointer.blob_id {
            return Ok(None);
        }
        let end = pointer.offset.saturating_add(pointer.size);
        match state.data.get(pointer.offset..end) {
            Some(bytes) => {
                debug!(blob_id = %pointer.blob_id, "big-column read from pending buffer");
                Ok(Some(bytes.to_vec()))
            }
            None => Err(KtableError::Execution(format!(
                "pointer {} past end of pending blob",
                pointer.render()
            ))),
        }
    }

    pub fn pending_bytes(&self) -> usize {
        self.lock().map(|s| s.data.len()).unwrap_or(0)
    }
}
