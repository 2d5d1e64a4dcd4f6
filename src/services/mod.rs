//! Service layer for scale caching
//!
//! - [`ScaleIndex`]: parameter fingerprint to identifier mapping
//! - [`GenerationLocks`]: at-most-one generation per parameter tuple
//! - [`ScaleStore`]: the public find-or-create entry point
//!
//! # Usage
//!
//! ```rust,no_run
//! use scale_store::models::ScaleRequest;
//! use scale_store::services::ScaleStore;
//! use scale_store::storage::MemoryBlobStore;
//! use std::sync::Arc;
//!
//! # async fn example(original: Vec<u8>) -> Result<(), Box<dyn std::error::Error>> {
//! let store = ScaleStore::builder()
//!     .field("image")
//!     .original(original)
//!     .substrate(Arc::new(MemoryBlobStore::new()))
//!     .open()
//!     .await?;
//!
//! let thumb = store.scale(&ScaleRequest::new(128, 128)).await?;
//! assert_eq!(store.get(thumb.id()).await?, Some(thumb));
//! # Ok(())
//! # }
//! ```

pub mod generation_locks;
pub mod scale_index;
pub mod scale_store;

pub use generation_locks::{GenerationGuard, GenerationLocks};
pub use scale_index::{IndexEntry, IndexState, ScaleIndex};
pub use scale_store::{DEFAULT_FIELD, ScaleStore, ScaleStoreBuilder, ScaleStoreStats};
