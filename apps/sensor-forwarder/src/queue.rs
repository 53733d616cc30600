use crate::format::Payload;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("spool state error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid spool state: {0}")]
    InvalidState(String),

    #[error("entry of {len} bytes exceeds the {max} byte frame limit")]
    TooLarge { len: usize, max: usize },
}

pub(crate) fn io_err(context: impl Into<String>) -> impl FnOnce(io::Error) -> StorageError {
    let context = context.into();
    move |source| StorageError::Io { context, source }
}

/// Ordered blob storage backing a [`DurableQueue`].
///
/// `append` must be durable when it returns. `read_oldest` must keep returning the same blob
/// until `delete_oldest` removes it, and `delete_oldest` on an empty store is a no-op.
pub trait QueueStorage {
    fn append(&mut self, blob: &[u8]) -> Result<(), StorageError>;
    fn read_oldest(&mut self) -> Result<Option<Vec<u8>>, StorageError>;
    fn delete_oldest(&mut self) -> Result<(), StorageError>;
    fn pending(&self) -> u64;
}

/// FIFO with two-phase removal: an entry leaves only through `delete_oldest` after delivery.
pub struct DurableQueue<S> {
    storage: S,
}

impl<S: QueueStorage> DurableQueue<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn push(&mut self, payload: &Payload) -> Result<(), StorageError> {
        debug_assert!(!payload.is_empty(), "formatter never yields empty payloads");
        self.storage.append(payload.as_bytes())?;
        tracing::debug!(bytes = payload.len(), pending = self.storage.pending(), "queued payload");
        Ok(())
    }

    pub fn peek_oldest(&mut self) -> Result<Option<Payload>, StorageError> {
        Ok(self.storage.read_oldest()?.map(Payload::new))
    }

    pub fn delete_oldest(&mut self) -> Result<(), StorageError> {
        self.storage.delete_oldest()?;
        tracing::debug!(pending = self.storage.pending(), "removed delivered payload");
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.storage.pending()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_inner(self) -> S {
        self.storage
    }
}
