//! Scale store: find-or-create access to the cached scales of one image field
//!
//! The store owns the [`ScaleIndex`] and every record it references. Records
//! live in the persistence substrate under the field's namespace:
//!
//! - `<field>/index.json`: index entries, identifier sequence, source digest
//! - `<field>/<id>.json`: record metadata
//! - `<field>/<id>.bin`: encoded image bytes
//!
//! Locking: the index sits behind an async `RwLock`. Reads hold the read
//! side while loading blobs, every mutation holds the write side while it
//! persists, so removal and commit of the same identifier never interleave.
//! Generation additionally holds a per-fingerprint lock from the second
//! index check until commit, and a read lock on the original image.

use async_stream::try_stream;
use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use futures::Stream;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::generation_locks::GenerationLocks;
use super::scale_index::{IndexState, ScaleIndex};
use crate::errors::{PersistenceError, PersistenceResult, ScaleError, ScaleResult};
use crate::models::{
    ScaleDefaults, ScaleParameters, ScaleRecord, ScaleRecordMetadata, ScaleRequest, source_digest,
};
use crate::scaling::{ImageScaler, Scaler};
use crate::storage::BlobStore;

pub const DEFAULT_FIELD: &str = "image";

const INDEX_BLOB: &str = "index.json";
const METADATA_SUFFIX: &str = ".json";
const DATA_SUFFIX: &str = ".bin";

struct Original {
    bytes: Bytes,
    digest: String,
}

/// Summary of the stored scales
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScaleStoreStats {
    pub field: String,
    pub count: usize,
    pub total_bytes: u64,
}

/// Cached scales of one image field on one owning object
pub struct ScaleStore {
    field: String,
    substrate: Arc<dyn BlobStore>,
    scaler: Arc<dyn Scaler>,
    defaults: ScaleDefaults,
    original: RwLock<Original>,
    index: RwLock<ScaleIndex>,
    generation_locks: GenerationLocks,
}

/// Builder for [`ScaleStore`]
#[derive(Default)]
pub struct ScaleStoreBuilder {
    field: Option<String>,
    original: Option<Bytes>,
    substrate: Option<Arc<dyn BlobStore>>,
    scaler: Option<Arc<dyn Scaler>>,
    defaults: ScaleDefaults,
}

impl ScaleStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name of the image field; namespaces every substrate key
    pub fn field<S: Into<String>>(mut self, field: S) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Bytes of the original image the scales are derived from
    pub fn original<B: Into<Bytes>>(mut self, original: B) -> Self {
        self.original = Some(original.into());
        self
    }

    pub fn substrate(mut self, substrate: Arc<dyn BlobStore>) -> Self {
        self.substrate = Some(substrate);
        self
    }

    /// Scaling function; defaults to [`ImageScaler`]
    pub fn scaler(mut self, scaler: Arc<dyn Scaler>) -> Self {
        self.scaler = Some(scaler);
        self
    }

    pub fn defaults(mut self, defaults: ScaleDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Load the persisted index and invalidate it if the original changed
    pub async fn open(self) -> ScaleResult<ScaleStore> {
        let field = self.field.unwrap_or_else(|| DEFAULT_FIELD.to_string());
        validate_field(&field)?;

        let original = self
            .original
            .ok_or_else(|| ScaleError::configuration("original image bytes are required"))?;
        let substrate = self
            .substrate
            .ok_or_else(|| ScaleError::configuration("a persistence substrate is required"))?;
        let scaler = self
            .scaler
            .unwrap_or_else(|| Arc::new(ImageScaler::default()));

        let index = load_index(substrate.as_ref(), &format!("{field}/{INDEX_BLOB}")).await?;
        let digest = source_digest(&original);

        let store = ScaleStore {
            field,
            substrate,
            scaler,
            defaults: self.defaults,
            original: RwLock::new(Original {
                bytes: original,
                digest,
            }),
            index: RwLock::new(index),
            generation_locks: GenerationLocks::new(),
        };

        store.reconcile_source().await?;
        debug!(
            "Scale store for field '{}' opened with {} scales",
            store.field,
            store.count().await
        );
        Ok(store)
    }
}

impl ScaleStore {
    #[must_use]
    pub fn builder() -> ScaleStoreBuilder {
        ScaleStoreBuilder::new()
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn defaults(&self) -> &ScaleDefaults {
        &self.defaults
    }

    /// Direct lookup by identifier; `None` if unknown or its data is gone
    pub async fn get(&self, id: &str) -> ScaleResult<Option<ScaleRecord>> {
        let index = self.index.read().await;
        if !index.contains(id) {
            return Ok(None);
        }
        self.load_record(id).await
    }

    /// Find a scale by parameters, generating it on a miss when `create` is set
    pub async fn get_scale(
        &self,
        request: &ScaleRequest,
        create: bool,
    ) -> ScaleResult<Option<ScaleRecord>> {
        let parameters = self.normalize(request).await;
        if create {
            self.find_or_create(parameters).await.map(Some)
        } else {
            self.find(&parameters).await
        }
    }

    /// Find or create a scale by parameters
    pub async fn scale(&self, request: &ScaleRequest) -> ScaleResult<ScaleRecord> {
        let parameters = self.normalize(request).await;
        self.find_or_create(parameters).await
    }

    /// Delete a record and its index entry; returns whether it existed
    pub async fn remove(&self, id: &str) -> ScaleResult<bool> {
        let mut index = self.index.write().await;
        if !index.contains(id) {
            return Ok(false);
        }

        let mut staged = index.clone();
        staged.remove(id);
        self.put_index(&staged).await?;
        *index = staged;

        self.delete_record_blobs(id).await?;
        info!("Removed scale {} from field '{}'", id, self.field);
        Ok(true)
    }

    /// Stream every stored record in index order.
    ///
    /// Each call starts from the current index; records removed while the
    /// stream is being consumed are skipped.
    pub fn iter(&self) -> impl Stream<Item = ScaleResult<ScaleRecord>> + '_ {
        try_stream! {
            for id in self.keys().await {
                if let Some(record) = self.get(&id).await? {
                    yield record;
                }
            }
        }
    }

    /// Identifiers in insertion order
    pub async fn keys(&self) -> Vec<String> {
        self.index.read().await.keys()
    }

    pub async fn count(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.index.read().await.contains(id)
    }

    /// Remove every scale; identifiers are still never reused
    pub async fn clear(&self) -> ScaleResult<usize> {
        let mut index = self.index.write().await;
        let removed = self.invalidate_locked(&mut index, None).await?;
        info!("Cleared {} scales from field '{}'", removed, self.field);
        Ok(removed)
    }

    /// Replace the original image, invalidating all scales if it changed
    pub async fn set_original<B: Into<Bytes>>(&self, original: B) -> ScaleResult<bool> {
        let bytes = original.into();
        let digest = source_digest(&bytes);

        let mut current = self.original.write().await;
        if current.digest == digest {
            return Ok(false);
        }

        let mut index = self.index.write().await;
        let removed = self
            .invalidate_locked(&mut index, Some(digest.clone()))
            .await?;
        *current = Original { bytes, digest };

        info!(
            "Original image of field '{}' replaced, invalidated {} scales",
            self.field, removed
        );
        Ok(true)
    }

    /// Remove records created more than `max_age` ago, and records whose
    /// metadata is missing. Returns the number removed.
    pub async fn purge_older_than(&self, max_age: Duration) -> ScaleResult<usize> {
        let max_age = TimeDelta::from_std(max_age)
            .map_err(|e| ScaleError::configuration(format!("max age out of range: {e}")))?;
        let cutoff = Utc::now() - max_age;

        let mut index = self.index.write().await;
        let mut expired = Vec::new();
        for id in index.keys() {
            match self.load_metadata(&id).await? {
                Some(metadata) if metadata.created_at >= cutoff => {}
                _ => expired.push(id),
            }
        }

        if expired.is_empty() {
            return Ok(0);
        }

        let mut staged = index.clone();
        for id in &expired {
            staged.remove(id);
        }
        self.put_index(&staged).await?;
        *index = staged;

        for id in &expired {
            self.delete_record_blobs(id).await?;
        }

        info!(
            "Purged {} scales older than {} from field '{}'",
            expired.len(),
            cutoff,
            self.field
        );
        Ok(expired.len())
    }

    /// Delete blobs in the field namespace that no index entry references
    pub async fn vacuum(&self) -> ScaleResult<usize> {
        let index = self.index.write().await;
        let prefix = format!("{}/", self.field);
        let index_key = self.index_key();

        let mut deleted = 0;
        for key in self.substrate.keys().await? {
            let Some(name) = key.strip_prefix(&prefix) else {
                continue;
            };
            if key == index_key {
                continue;
            }

            let referenced = name
                .strip_suffix(METADATA_SUFFIX)
                .or_else(|| name.strip_suffix(DATA_SUFFIX))
                .is_some_and(|id| index.contains(id));
            if !referenced {
                debug!("Deleting orphaned blob {}", key);
                self.substrate.delete(&key).await?;
                deleted += 1;
            }
        }

        if deleted > 0 {
            info!(
                "Vacuumed {} orphaned blobs from field '{}'",
                deleted, self.field
            );
        }
        Ok(deleted)
    }

    pub async fn stats(&self) -> ScaleResult<ScaleStoreStats> {
        let index = self.index.read().await;
        let mut total_bytes = 0;
        for id in index.keys() {
            if let Some(metadata) = self.load_metadata(&id).await? {
                total_bytes += metadata.size;
            }
        }

        Ok(ScaleStoreStats {
            field: self.field.clone(),
            count: index.len(),
            total_bytes,
        })
    }

    /// Apply defaults, then let the scaler merge tuples that render identically
    async fn normalize(&self, request: &ScaleRequest) -> ScaleParameters {
        let parameters = request.normalize(&self.defaults);
        let original = self.original.read().await;
        self.scaler.canonical_parameters(&original.bytes, parameters)
    }

    async fn find(&self, parameters: &ScaleParameters) -> ScaleResult<Option<ScaleRecord>> {
        let index = self.index.read().await;
        let Some(id) = index.lookup(parameters) else {
            return Ok(None);
        };

        match self.load_record(id).await? {
            Some(record) => {
                debug!("Scale cache hit {} -> {}", parameters, id);
                Ok(Some(record))
            }
            None => {
                warn!(
                    "Index entry {} for {} has no stored record, treating as miss",
                    id, parameters
                );
                Ok(None)
            }
        }
    }

    async fn find_or_create(&self, parameters: ScaleParameters) -> ScaleResult<ScaleRecord> {
        if let Some(record) = self.find(&parameters).await? {
            return Ok(record);
        }

        let fingerprint = parameters.fingerprint();
        let _guard = self.generation_locks.acquire(&fingerprint).await;

        // Another request may have generated it while we waited
        if let Some(record) = self.find(&parameters).await? {
            return Ok(record);
        }

        self.generate(parameters, &fingerprint).await
    }

    async fn generate(
        &self,
        parameters: ScaleParameters,
        fingerprint: &str,
    ) -> ScaleResult<ScaleRecord> {
        let original = self.original.read().await;

        debug!(
            "Generating scale {} for field '{}' (fingerprint {})",
            parameters, self.field, fingerprint
        );
        let scaled = self
            .scaler
            .scale(original.bytes.clone(), &parameters)
            .await?;

        let mut index = self.index.write().await;
        let mut staged = index.clone();
        let id = staged.generate_id();

        let stale = match staged.insert(parameters.clone(), id.clone()) {
            Ok(()) => None,
            Err(duplicate) => {
                let existing = staged.lookup(&parameters).map(str::to_string);
                if let Some(existing) = &existing {
                    if let Some(winner) = self.load_record(existing).await? {
                        debug!("{}, returning existing scale {}", duplicate, existing);
                        return Ok(winner);
                    }
                    warn!("{}, replacing stale entry {}", duplicate, existing);
                    staged.remove(existing);
                }
                staged
                    .insert(parameters.clone(), id.clone())
                    .map_err(|e| PersistenceError::corrupt(self.index_key(), e.to_string()))?;
                existing
            }
        };

        let record = ScaleRecord::new(
            id,
            scaled.dimensions,
            scaled.mimetype,
            scaled.data,
            parameters,
            Utc::now(),
        );

        if let Err(e) = self.write_record(&record, &staged).await {
            warn!("Failed to persist scale {}: {}", record.id(), e);
            self.discard_record_blobs(record.id()).await;
            return Err(e);
        }
        *index = staged;
        drop(index);

        if let Some(stale) = stale
            && let Err(e) = self.delete_record_blobs(&stale).await
        {
            warn!("Failed to delete blobs of stale scale {}: {}", stale, e);
        }

        info!(
            "Stored scale {} for field '{}': {}x{} {} ({} bytes)",
            record.id(),
            self.field,
            record.dimensions().0,
            record.dimensions().1,
            record.mimetype(),
            record.size()
        );
        Ok(record)
    }

    /// Clear the index (optionally recording a new source digest) and delete
    /// the blobs of every removed record
    async fn invalidate_locked(
        &self,
        index: &mut ScaleIndex,
        digest: Option<String>,
    ) -> ScaleResult<usize> {
        let mut staged = index.clone();
        let removed = staged.clear();
        if let Some(digest) = digest {
            staged.set_source_digest(digest);
        }

        self.put_index(&staged).await?;
        *index = staged;

        for id in &removed {
            self.delete_record_blobs(id).await?;
        }
        Ok(removed.len())
    }

    async fn reconcile_source(&self) -> ScaleResult<()> {
        let original = self.original.read().await;
        let mut index = self.index.write().await;
        if index.source_digest() == Some(original.digest.as_str()) {
            return Ok(());
        }

        let removed = self
            .invalidate_locked(&mut index, Some(original.digest.clone()))
            .await?;
        if removed > 0 {
            info!(
                "Original image of field '{}' changed, invalidated {} scales",
                self.field, removed
            );
        }
        Ok(())
    }

    async fn load_record(&self, id: &str) -> ScaleResult<Option<ScaleRecord>> {
        let data_key = self.data_key(id);
        let (metadata, data) =
            tokio::try_join!(self.load_metadata(id), self.get_blob(&data_key))?;

        let (Some(metadata), Some(data)) = (metadata, data) else {
            return Ok(None);
        };

        match ScaleRecord::from_parts(metadata, data) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("Ignoring stored scale {}: {}", id, e);
                Ok(None)
            }
        }
    }

    async fn load_metadata(&self, id: &str) -> ScaleResult<Option<ScaleRecordMetadata>> {
        let key = self.metadata_key(id);
        let Some(blob) = self.substrate.get(&key).await? else {
            return Ok(None);
        };

        match serde_json::from_slice::<ScaleRecordMetadata>(&blob) {
            Ok(metadata) if metadata.id == id => Ok(Some(metadata)),
            Ok(metadata) => {
                warn!("Metadata blob {} names scale {}", key, metadata.id);
                Ok(None)
            }
            Err(e) => {
                warn!("Failed to parse metadata blob {}: {}", key, e);
                Ok(None)
            }
        }
    }

    async fn get_blob(&self, key: &str) -> ScaleResult<Option<Bytes>> {
        Ok(self.substrate.get(key).await?)
    }

    async fn write_record(&self, record: &ScaleRecord, staged: &ScaleIndex) -> ScaleResult<()> {
        let metadata_key = self.metadata_key(record.id());
        let metadata = serde_json::to_vec(&record.metadata())
            .map_err(|e| PersistenceError::corrupt(&metadata_key, e.to_string()))?;

        self.substrate
            .put(&self.data_key(record.id()), record.data().clone())
            .await?;
        self.substrate
            .put(&metadata_key, Bytes::from(metadata))
            .await?;
        self.put_index(staged).await
    }

    async fn put_index(&self, index: &ScaleIndex) -> ScaleResult<()> {
        let key = self.index_key();
        let blob = serde_json::to_vec(&index.to_state())
            .map_err(|e| PersistenceError::corrupt(&key, e.to_string()))?;
        self.substrate.put(&key, Bytes::from(blob)).await?;
        Ok(())
    }

    async fn delete_record_blobs(&self, id: &str) -> PersistenceResult<()> {
        self.substrate.delete(&self.metadata_key(id)).await?;
        self.substrate.delete(&self.data_key(id)).await
    }

    /// Best-effort rollback of a record that never made it into the index
    async fn discard_record_blobs(&self, id: &str) {
        if let Err(e) = self.delete_record_blobs(id).await {
            warn!("Failed to roll back blobs of scale {}: {}", id, e);
        }
    }

    fn index_key(&self) -> String {
        format!("{}/{}", self.field, INDEX_BLOB)
    }

    fn metadata_key(&self, id: &str) -> String {
        format!("{}/{}{}", self.field, id, METADATA_SUFFIX)
    }

    fn data_key(&self, id: &str) -> String {
        format!("{}/{}{}", self.field, id, DATA_SUFFIX)
    }
}

fn validate_field(field: &str) -> ScaleResult<()> {
    if field.is_empty() || field == "." || field == ".." {
        return Err(ScaleError::configuration(format!(
            "invalid field name {field:?}"
        )));
    }
    if field.contains(['/', '\\', '\0']) {
        return Err(ScaleError::configuration(format!(
            "field name {field:?} must not contain path separators"
        )));
    }
    Ok(())
}

async fn load_index(substrate: &dyn BlobStore, key: &str) -> ScaleResult<ScaleIndex> {
    let Some(blob) = substrate.get(key).await? else {
        return Ok(ScaleIndex::new());
    };

    let state: IndexState = serde_json::from_slice(&blob)
        .map_err(|e| PersistenceError::corrupt(key, e.to_string()))?;
    Ok(ScaleIndex::from_state(state))
}
