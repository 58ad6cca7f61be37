//! Command-line groups shared by the client and the relay.
//!
//! Both binaries flatten these into their own `Args`; every option can also
//! come from a `DEADDROP_*` environment variable so the key and the store
//! token never have to appear on a command line.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, ValueEnum};

use crate::codec::{CodecError, SealedBoxCodec};
use crate::store::{BlobStore, Bounded, DirStore, DriveStore, StoreError, DRIVE_API};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    /// A directory on a filesystem both ends can reach
    Dir,
    /// Google Drive folders
    Drive,
}

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Blob store backend
    #[arg(long, value_enum, env = "DEADDROP_STORE", default_value_t = StoreKind::Dir)]
    pub store: StoreKind,

    /// Root directory for the `dir` backend
    #[arg(long, env = "DEADDROP_STORE_ROOT", default_value = "deaddrop-store")]
    pub store_root: PathBuf,

    /// OAuth access token for the `drive` backend
    #[arg(long, env = "DEADDROP_DRIVE_TOKEN", hide_env_values = true)]
    pub drive_token: Option<String>,

    /// Base URL of the Drive API
    #[arg(long, env = "DEADDROP_DRIVE_API", default_value = DRIVE_API)]
    pub drive_api: String,

    /// Maximum number of store operations in flight
    #[arg(long, env = "DEADDROP_STORE_CONCURRENCY", default_value_t = 8)]
    pub store_concurrency: usize,
}

impl StoreArgs {
    pub fn open(&self) -> Result<Arc<dyn BlobStore>, StoreError> {
        let backend: Arc<dyn BlobStore> = match self.store {
            StoreKind::Dir => Arc::new(DirStore::new(&self.store_root)),
            StoreKind::Drive => {
                let token = self
                    .drive_token
                    .clone()
                    .ok_or_else(|| StoreError::Config("--drive-token is required".to_string()))?;
                Arc::new(DriveStore::new(&self.drive_api, token)?)
            }
        };
        Ok(Arc::new(Bounded::new(backend, self.store_concurrency)))
    }
}

#[derive(Args, Debug, Clone)]
pub struct FolderArgs {
    /// Folder the client uploads requests into
    #[arg(long, env = "DEADDROP_REQUESTS_FOLDER", default_value = "_requests")]
    pub requests_folder: String,

    /// Folder the relay uploads responses into
    #[arg(long, env = "DEADDROP_RESPONSES_FOLDER", default_value = "_responses")]
    pub responses_folder: String,
}

#[derive(Args, Clone)]
pub struct KeyArgs {
    /// Pre-shared 32-byte key, base64
    #[arg(long, env = "DEADDROP_KEY", hide_env_values = true)]
    pub key: String,
}

impl KeyArgs {
    pub fn codec(&self) -> Result<SealedBoxCodec, CodecError> {
        SealedBoxCodec::from_base64(&self.key)
    }
}

impl std::fmt::Debug for KeyArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyArgs").finish_non_exhaustive()
    }
}
