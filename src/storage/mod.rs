//! Persistence substrate for scale records
//!
//! The store only needs a flat mapping from string keys to opaque blobs,
//! scoped to the object that owns the image. Two implementations ship with
//! the crate:
//!
//! - [`MemoryBlobStore`]: process-local map, used by tests and short-lived hosts
//! - [`SandboxedBlobStore`]: one file per key below a base directory

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::PersistenceResult;

pub mod memory;
pub mod sandboxed;

pub use memory::MemoryBlobStore;
pub use sandboxed::SandboxedBlobStore;

/// Key-value blob storage scoped to one owning object
///
/// Keys use `/` as a namespace separator. Implementations must make a
/// single `put` atomic: readers observe either the old or the new blob.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `blob` under `key`, replacing any previous value
    async fn put(&self, key: &str, blob: Bytes) -> PersistenceResult<()>;

    /// Fetch the blob under `key`, `None` if absent
    async fn get(&self, key: &str) -> PersistenceResult<Option<Bytes>>;

    /// Delete the blob under `key`; deleting an absent key succeeds
    async fn delete(&self, key: &str) -> PersistenceResult<()>;

    /// All keys currently stored, in lexicographic order
    async fn keys(&self) -> PersistenceResult<Vec<String>>;
}
