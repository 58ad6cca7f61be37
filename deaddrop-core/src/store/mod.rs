//! Blob store access.
//!
//! The tunnel only needs four operations from its storage backend: upload a
//! named blob into a folder, list a folder, download by id and delete by id.
//! Nothing about ordering, atomicity or exactly-once delivery is assumed
//! beyond "a listed blob downloads to exactly what was uploaded".

mod dir;
mod drive;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};

pub use dir::DirStore;
pub use drive::{DriveStore, DEFAULT_API as DRIVE_API};
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store returned HTTP {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blob {0} not found")]
    NotFound(String),
    #[error("invalid blob id or name {0:?}")]
    InvalidId(String),
    #[error("store misconfigured: {0}")]
    Config(String),
    #[error("store worker pool closed")]
    Closed,
}

/// One entry of a folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub id: String,
    pub name: String,
    pub created: DateTime<Utc>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `data` as `name` inside `folder` and returns the new blob id.
    async fn upload(&self, folder: &str, name: &str, data: Vec<u8>) -> Result<String, StoreError>;

    /// Lists a folder. Order is unspecified.
    async fn list(&self, folder: &str) -> Result<Vec<BlobMeta>, StoreError>;

    async fn download(&self, id: &str) -> Result<Vec<u8>, StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: BlobStore + ?Sized> BlobStore for Arc<S> {
    async fn upload(&self, folder: &str, name: &str, data: Vec<u8>) -> Result<String, StoreError> {
        (**self).upload(folder, name, data).await
    }

    async fn list(&self, folder: &str) -> Result<Vec<BlobMeta>, StoreError> {
        (**self).list(folder).await
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        (**self).download(id).await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        (**self).delete(id).await
    }
}

/// Caps the number of store operations in flight across all sessions.
///
/// Callers waiting for a permit only suspend their own task, so one slow
/// backend call never stalls another session's loop.
pub struct Bounded {
    inner: Arc<dyn BlobStore>,
    permits: Semaphore,
}

impl Bounded {
    pub fn new(inner: Arc<dyn BlobStore>, max_in_flight: usize) -> Self {
        Self {
            inner,
            permits: Semaphore::new(max_in_flight.max(1)),
        }
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>, StoreError> {
        self.permits.acquire().await.map_err(|_| StoreError::Closed)
    }
}

#[async_trait]
impl BlobStore for Bounded {
    async fn upload(&self, folder: &str, name: &str, data: Vec<u8>) -> Result<String, StoreError> {
        let _permit = self.permit().await?;
        self.inner.upload(folder, name, data).await
    }

    async fn list(&self, folder: &str) -> Result<Vec<BlobMeta>, StoreError> {
        let _permit = self.permit().await?;
        self.inner.list(folder).await
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let _permit = self.permit().await?;
        self.inner.download(id).await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let _permit = self.permit().await?;
        self.inner.delete(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bounded_passes_through() {
        let memory = Arc::new(MemoryStore::new());
        let store = Bounded::new(memory.clone(), 2);

        let id = store.upload("f", "a_1.request.enc", b"abc".to_vec()).await.unwrap();
        let listed = store.list("f").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(store.download(&id).await.unwrap(), b"abc");
        store.delete(&id).await.unwrap();
        assert!(memory.names("f").is_empty());
    }

    #[tokio::test]
    async fn test_bounded_limits_concurrency() {
        let store = Arc::new(Bounded::new(Arc::new(MemoryStore::new()), 1));
        let held = store.permit().await.unwrap();

        let waiting = {
            let store = store.clone();
            tokio::spawn(async move { store.list("f").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(held);
        assert!(waiting.await.unwrap().unwrap().is_empty());
    }
}
