//! Queue persistence.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use super::types::QueueJob;

/// Durable home of the queue. `save` receives every live job (claimed ones
/// included) in dequeue order and replaces the previous contents.
pub trait QueueStore: Send + Sync {
    fn load(&self) -> Result<Vec<QueueJob>, StoreError>;

    fn save(&self, jobs: &[QueueJob]) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("corrupt queue file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory queue store for tests/dev. Surviving the queue instance is
/// enough to exercise restart paths.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    jobs: Mutex<Vec<QueueJob>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn jobs(&self) -> Vec<QueueJob> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl QueueStore for InMemoryQueueStore {
    fn load(&self) -> Result<Vec<QueueJob>, StoreError> {
        Ok(self.jobs())
    }

    fn save(&self, jobs: &[QueueJob]) -> Result<(), StoreError> {
        *self.jobs.lock().unwrap_or_else(PoisonError::into_inner) = jobs.to_vec();
        Ok(())
    }
}

/// JSON array of jobs in a single file, replaced atomically (write to a
/// sibling temp file, then rename).
#[derive(Debug, Clone)]
pub struct JsonFileQueueStore {
    path: PathBuf,
}

impl JsonFileQueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl QueueStore for JsonFileQueueStore {
    fn load(&self) -> Result<Vec<QueueJob>, StoreError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(e)),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, jobs: &[QueueJob]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(jobs)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(|e| self.io_err(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))
    }
}

impl<T: QueueStore + ?Sized> QueueStore for Arc<T> {
    fn load(&self) -> Result<Vec<QueueJob>, StoreError> {
        (**self).load()
    }

    fn save(&self, jobs: &[QueueJob]) -> Result<(), StoreError> {
        (**self).save(jobs)
    }
}
