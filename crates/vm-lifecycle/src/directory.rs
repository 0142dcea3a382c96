use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

/// Serializes datastore directory creation.
///
/// Directory creation must not run concurrently against one endpoint.
/// Cloning shares the underlying mutex. `Default` is the no-op lock.
#[derive(Debug, Clone, Default)]
pub struct DirectoryLock {
    inner: Option<Arc<Mutex<()>>>,
}

impl DirectoryLock {
    pub fn new() -> Self {
        Self {
            inner: Some(Arc::new(Mutex::new(()))),
        }
    }

    /// A lock that never blocks.
    pub fn noop() -> Self {
        Self { inner: None }
    }

    pub async fn acquire(&self) -> Option<MutexGuard<'_, ()>> {
        match &self.inner {
            Some(mutex) => Some(mutex.lock().await),
            None => None,
        }
    }
}
