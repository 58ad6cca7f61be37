//! Shared plumbing for the deaddrop tunnel.
//!
//! Both ends of the tunnel agree on three things: how blobs are named,
//! how a request chunk is framed before encryption, and how payloads are
//! sealed. The blob store itself sits behind [`store::BlobStore`].

pub mod codec;
pub mod config;
pub mod frame;
pub mod naming;
pub mod store;

pub use codec::{Codec, CodecError, SealedBoxCodec};
pub use frame::{FrameError, RequestFrame};
pub use naming::{BlobName, Direction, NameError, SessionId};
pub use store::{BlobMeta, BlobStore, MemoryStore, StoreError};

/// Default size of one tunneled chunk, both directions.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;
