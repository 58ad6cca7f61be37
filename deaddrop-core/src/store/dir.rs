use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use uuid::Uuid;

use super::{BlobMeta, BlobStore, StoreError};

/// Blob store on a directory both ends can reach (network mount, synced
/// folder). Each folder is a sub-directory; a blob id is `folder/name`.
///
/// Uploads land under a dot-prefixed temporary name and are renamed into
/// place, so a listed blob is always complete.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, id: &str) -> Result<PathBuf, StoreError> {
        let (folder, name) = id
            .split_once('/')
            .ok_or_else(|| StoreError::InvalidId(id.to_string()))?;
        check_component(folder)?;
        check_component(name)?;
        Ok(self.root.join(folder).join(name))
    }
}

fn check_component(part: &str) -> Result<(), StoreError> {
    if part.is_empty() || part.starts_with('.') || part.contains(['/', '\\']) {
        return Err(StoreError::InvalidId(part.to_string()));
    }
    Ok(())
}

fn not_found(id: &str, err: std::io::Error) -> StoreError {
    if err.kind() == ErrorKind::NotFound {
        StoreError::NotFound(id.to_string())
    } else {
        StoreError::Io(err)
    }
}

#[async_trait]
impl BlobStore for DirStore {
    async fn upload(&self, folder: &str, name: &str, data: Vec<u8>) -> Result<String, StoreError> {
        check_component(folder)?;
        check_component(name)?;

        let dir = self.root.join(folder);
        fs::create_dir_all(&dir).await?;

        let staging = dir.join(format!(".{name}.{}.part", Uuid::new_v4().simple()));
        fs::write(&staging, &data).await?;
        if let Err(e) = fs::rename(&staging, dir.join(name)).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }

        Ok(format!("{folder}/{name}"))
    }

    async fn list(&self, folder: &str) -> Result<Vec<BlobMeta>, StoreError> {
        check_component(folder)?;

        let mut entries = match fs::read_dir(self.root.join(folder)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut blobs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }

            // The consumer on the other side may delete between readdir and stat.
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let created: DateTime<Utc> = meta.modified()?.into();

            blobs.push(BlobMeta {
                id: format!("{folder}/{name}"),
                name,
                created,
            });
        }

        Ok(blobs)
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(id)?;
        fs::read(&path).await.map_err(|e| not_found(id, e))
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.resolve(id)?;
        fs::remove_file(&path).await.map_err(|e| not_found(id, e))
    }
}
