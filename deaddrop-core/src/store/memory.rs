use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use super::{BlobMeta, BlobStore, StoreError};

struct StoredBlob {
    folder: String,
    name: String,
    created: DateTime<Utc>,
    data: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    blobs: HashMap<String, StoredBlob>,
    order: Vec<String>,
    next_id: u64,
    last_created: Option<DateTime<Utc>>,
    broken: HashSet<String>,
    fail_list: bool,
    fail_upload: bool,
}

/// In-process store. Both ends of a tunnel must share the same instance.
///
/// Listings come back newest first so consumers cannot lean on
/// insertion order.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names currently stored in `folder`, sorted.
    pub fn names(&self, folder: &str) -> Vec<String> {
        let inner = self.inner.lock();
        let mut names: Vec<String> = inner
            .blobs
            .values()
            .filter(|b| b.folder == folder)
            .map(|b| b.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Makes every later download of the blob called `name` fail.
    pub fn break_download(&self, name: &str) {
        self.inner.lock().broken.insert(name.to_string());
    }

    /// Makes `list` fail until reset.
    pub fn fail_list(&self, fail: bool) {
        self.inner.lock().fail_list = fail;
    }

    /// Makes `upload` fail until reset.
    pub fn fail_upload(&self, fail: bool) {
        self.inner.lock().fail_upload = fail;
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn upload(&self, folder: &str, name: &str, data: Vec<u8>) -> Result<String, StoreError> {
        let mut inner = self.inner.lock();
        if inner.fail_upload {
            return Err(StoreError::Io(std::io::Error::other("uploads disabled")));
        }

        // Strictly increasing timestamps keep creation order total.
        let mut created = Utc::now();
        if let Some(last) = inner.last_created {
            if created <= last {
                created = last + Duration::microseconds(1);
            }
        }
        inner.last_created = Some(created);

        inner.next_id += 1;
        let id = format!("mem-{}", inner.next_id);
        inner.blobs.insert(
            id.clone(),
            StoredBlob {
                folder: folder.to_string(),
                name: name.to_string(),
                created,
                data,
            },
        );
        inner.order.push(id.clone());
        Ok(id)
    }

    async fn list(&self, folder: &str) -> Result<Vec<BlobMeta>, StoreError> {
        let inner = self.inner.lock();
        if inner.fail_list {
            return Err(StoreError::Io(std::io::Error::other("listing disabled")));
        }

        Ok(inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.blobs.get(id).map(|b| (id, b)))
            .filter(|(_, b)| b.folder == folder)
            .map(|(id, b)| BlobMeta {
                id: id.clone(),
                name: b.name.clone(),
                created: b.created,
            })
            .collect())
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let inner = self.inner.lock();
        let blob = inner
            .blobs
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if inner.broken.contains(&blob.name) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(blob.data.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner
            .blobs
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        inner.order.retain(|other| other != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_is_newest_first_and_per_folder() {
        let store = MemoryStore::new();
        store.upload("a", "one", vec![1]).await.unwrap();
        store.upload("b", "other", vec![]).await.unwrap();
        store.upload("a", "two", vec![2]).await.unwrap();

        let listed = store.list("a").await.unwrap();
        let names: Vec<_> = listed.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["two", "one"]);
        assert!(listed[1].created < listed[0].created);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(store.delete("mem-9").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_break_download() {
        let store = MemoryStore::new();
        let id = store.upload("a", "x", vec![1]).await.unwrap();
        store.break_download("x");
        assert!(store.download(&id).await.is_err());
        assert_eq!(store.list("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fail_upload_stores_nothing() {
        let store = MemoryStore::new();
        store.fail_upload(true);
        assert!(matches!(store.upload("a", "x", vec![1]).await, Err(StoreError::Io(_))));
        assert!(store.names("a").is_empty());

        store.fail_upload(false);
        store.upload("a", "x", vec![1]).await.unwrap();
        assert_eq!(store.names("a"), ["x"]);
    }
}
