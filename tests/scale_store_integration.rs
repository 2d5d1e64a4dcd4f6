//! Integration tests for the find-or-create scale store
//!
//! A counting stub stands in for the image scaler so that these tests can
//! observe exactly how many generations happened.

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use scale_store::errors::{PersistenceError, PersistenceResult, ScaleError, ScaleGenerationError};
use scale_store::models::{Direction, ScaleParameters, ScaleRequest};
use scale_store::scaling::{ScaledImage, Scaler};
use scale_store::services::ScaleStore;
use scale_store::storage::{BlobStore, MemoryBlobStore};

const ORIGINAL: &[u8] = b"original image bytes";

/// Scaler that encodes the parameters as the output and counts its calls
#[derive(Default)]
struct CountingScaler {
    calls: AtomicUsize,
    fail: AtomicBool,
    delay: Option<Duration>,
}

impl CountingScaler {
    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scaler for CountingScaler {
    async fn scale(
        &self,
        original: Bytes,
        parameters: &ScaleParameters,
    ) -> Result<ScaledImage, ScaleGenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ScaleGenerationError::Decode("stub failure".to_string()));
        }

        let data = format!("{} of {} bytes", parameters, original.len());
        Ok(ScaledImage {
            data: Bytes::from(data),
            dimensions: (
                parameters.width.unwrap_or(1),
                parameters.height.unwrap_or(1),
            ),
            mimetype: "image/png".to_string(),
        })
    }
}

/// Blob store that can be told to fail writes to keys with a given suffix,
/// and every read or delete
#[derive(Default)]
struct FailingBlobStore {
    inner: MemoryBlobStore,
    fail_suffix: std::sync::Mutex<Option<String>>,
    fail_gets: AtomicBool,
    fail_deletes: AtomicBool,
}

impl FailingBlobStore {
    fn fail_puts_ending_with(&self, suffix: Option<&str>) {
        *self.fail_suffix.lock().unwrap() = suffix.map(str::to_string);
    }

    fn fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

fn injected(operation: &str, key: &str) -> PersistenceError {
    PersistenceError::Io(std::io::Error::other(format!(
        "injected {operation} failure for {key}"
    )))
}

#[async_trait]
impl BlobStore for FailingBlobStore {
    async fn put(&self, key: &str, blob: Bytes) -> PersistenceResult<()> {
        let failing = self
            .fail_suffix
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|suffix| key.ends_with(suffix));
        if failing {
            return Err(injected("write", key));
        }
        self.inner.put(key, blob).await
    }

    async fn get(&self, key: &str) -> PersistenceResult<Option<Bytes>> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(injected("read", key));
        }
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> PersistenceResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(injected("delete", key));
        }
        self.inner.delete(key).await
    }

    async fn keys(&self) -> PersistenceResult<Vec<String>> {
        self.inner.keys().await
    }
}

async fn open_store(
    substrate: Arc<dyn BlobStore>,
    scaler: Arc<dyn Scaler>,
    original: &'static [u8],
) -> ScaleStore {
    ScaleStore::builder()
        .field("image")
        .original(Bytes::from_static(original))
        .substrate(substrate)
        .scaler(scaler)
        .open()
        .await
        .unwrap()
}

async fn memory_store() -> (ScaleStore, Arc<CountingScaler>, MemoryBlobStore) {
    let substrate = MemoryBlobStore::new();
    let scaler = Arc::new(CountingScaler::default());
    let store = open_store(Arc::new(substrate.clone()), scaler.clone(), ORIGINAL).await;
    (store, scaler, substrate)
}

#[tokio::test]
async fn test_find_or_create_scenario() {
    let (store, scaler, _) = memory_store().await;
    assert_eq!(store.count().await, 0);

    let first = store.scale(&ScaleRequest::new(120, 80)).await.unwrap();
    assert_eq!(first.id(), "1");
    assert_eq!(first.dimensions(), (120, 80));
    assert_eq!(first.mimetype(), "image/png");
    assert_eq!(store.count().await, 1);

    let again = store.scale(&ScaleRequest::new(120, 80)).await.unwrap();
    assert_eq!(again, first);
    assert_eq!(scaler.calls(), 1);

    let thumb = store
        .scale(&ScaleRequest::new(64, 64).direction(Direction::Thumbnail))
        .await
        .unwrap();
    assert_eq!(thumb.id(), "2");
    assert_eq!(store.count().await, 2);
    assert_eq!(store.keys().await, vec!["1", "2"]);

    assert!(store.remove("1").await.unwrap());
    assert_eq!(store.get("1").await.unwrap(), None);
    assert_eq!(store.count().await, 1);
    assert!(!store.remove("1").await.unwrap());
}

#[tokio::test]
async fn test_omitted_values_match_explicit_defaults() {
    let (store, scaler, _) = memory_store().await;

    let implicit = store.scale(&ScaleRequest::new(100, 50)).await.unwrap();
    let explicit = store
        .scale(
            &ScaleRequest::new(100, 50)
                .direction(Direction::Down)
                .quality(88),
        )
        .await
        .unwrap();
    assert_eq!(implicit.id(), explicit.id());

    // A zero side means "not given"
    let width_only = store.scale(&ScaleRequest::new(100, 0)).await.unwrap();
    let width_only_again = store
        .scale(&ScaleRequest::default().width(100))
        .await
        .unwrap();
    assert_eq!(width_only.id(), width_only_again.id());
    assert_ne!(width_only.id(), implicit.id());

    assert_eq!(scaler.calls(), 2);
    assert_eq!(store.count().await, 2);
}

#[tokio::test]
async fn test_lookup_without_create_never_generates() {
    let (store, scaler, substrate) = memory_store().await;
    let blobs_before = substrate.len().await;

    let missing = store
        .get_scale(&ScaleRequest::new(10, 10), false)
        .await
        .unwrap();
    assert_eq!(missing, None);
    assert_eq!(store.count().await, 0);
    assert_eq!(scaler.calls(), 0);
    assert_eq!(substrate.len().await, blobs_before);

    let created = store
        .get_scale(&ScaleRequest::new(10, 10), true)
        .await
        .unwrap()
        .unwrap();
    let found = store
        .get_scale(&ScaleRequest::new(10, 10), false)
        .await
        .unwrap();
    assert_eq!(found, Some(created));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_generate_once() {
    let scaler = Arc::new(CountingScaler::slow(Duration::from_millis(20)));
    let store = Arc::new(
        open_store(Arc::new(MemoryBlobStore::new()), scaler.clone(), ORIGINAL).await,
    );

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.scale(&ScaleRequest::new(300, 200)).await
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().id().to_string());
    }

    assert_eq!(scaler.calls(), 1);
    assert!(ids.iter().all(|id| id == "1"));
    assert_eq!(store.count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_parameters_generate_in_parallel() {
    let scaler = Arc::new(CountingScaler::slow(Duration::from_millis(10)));
    let store = Arc::new(
        open_store(Arc::new(MemoryBlobStore::new()), scaler.clone(), ORIGINAL).await,
    );

    let mut handles = Vec::new();
    for width in 1..=8u32 {
        for _ in 0..3 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.scale(&ScaleRequest::new(width * 10, 10)).await
            }));
        }
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(scaler.calls(), 8);
    assert_eq!(store.count().await, 8);

    let mut ids = store.keys().await;
    ids.sort_by_key(|id| id.parse::<u64>().unwrap());
    assert_eq!(ids, (1..=8).map(|i| i.to_string()).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_scaler_failure_leaves_no_state() {
    let (store, scaler, substrate) = memory_store().await;
    let keys_before = substrate.keys().await.unwrap();

    scaler.fail.store(true, Ordering::SeqCst);
    let err = store.scale(&ScaleRequest::new(50, 50)).await.unwrap_err();
    assert!(err.is_generation());
    assert_eq!(store.count().await, 0);
    assert_eq!(substrate.keys().await.unwrap(), keys_before);

    scaler.fail.store(false, Ordering::SeqCst);
    let record = store.scale(&ScaleRequest::new(50, 50)).await.unwrap();
    assert_eq!(record.id(), "1");
}

#[tokio::test]
async fn test_failed_commit_rolls_back() {
    let substrate = Arc::new(FailingBlobStore::default());
    let scaler = Arc::new(CountingScaler::default());
    let store = open_store(substrate.clone(), scaler.clone(), ORIGINAL).await;
    let keys_before = substrate.keys().await.unwrap();

    for suffix in [".bin", ".json", "index.json"] {
        substrate.fail_puts_ending_with(Some(suffix));
        let err = store.scale(&ScaleRequest::new(40, 30)).await.unwrap_err();
        assert!(matches!(err, ScaleError::Persistence(_)), "{suffix}: {err}");

        assert_eq!(store.count().await, 0, "{suffix}");
        assert_eq!(substrate.keys().await.unwrap(), keys_before, "{suffix}");
        assert_eq!(
            store
                .get_scale(&ScaleRequest::new(40, 30), false)
                .await
                .unwrap(),
            None
        );
    }

    substrate.fail_puts_ending_with(None);
    let record = store.scale(&ScaleRequest::new(40, 30)).await.unwrap();
    assert_eq!(store.get(record.id()).await.unwrap(), Some(record));
    assert_eq!(scaler.calls(), 4);
}

#[tokio::test]
async fn test_stale_entry_is_regenerated() {
    let (store, scaler, substrate) = memory_store().await;
    let request = ScaleRequest::new(80, 60);

    let original = store.scale(&request).await.unwrap();
    substrate.delete("image/1.bin").await.unwrap();

    assert_eq!(store.get("1").await.unwrap(), None);
    assert_eq!(store.get_scale(&request, false).await.unwrap(), None);

    let healed = store.scale(&request).await.unwrap();
    assert_ne!(healed.id(), original.id());
    assert_eq!(healed.id(), "2");
    assert_eq!(healed.data(), original.data());
    assert_eq!(scaler.calls(), 2);

    assert_eq!(store.keys().await, vec!["2"]);
    assert!(!store.contains("1").await);
    assert_eq!(substrate.get("image/1.json").await.unwrap(), None);
}

#[tokio::test]
async fn test_corrupt_record_is_treated_as_missing() {
    let (store, _, substrate) = memory_store().await;
    let record = store.scale(&ScaleRequest::new(20, 20)).await.unwrap();

    substrate
        .put("image/1.json", Bytes::from_static(b"garbage"))
        .await
        .unwrap();
    assert_eq!(store.get(record.id()).await.unwrap(), None);

    let healed = store.scale(&ScaleRequest::new(20, 20)).await.unwrap();
    assert_eq!(healed.id(), "2");
}

#[tokio::test]
async fn test_identifiers_are_never_reused() {
    let (store, _, _) = memory_store().await;

    let first = store.scale(&ScaleRequest::new(10, 10)).await.unwrap();
    assert!(store.remove(first.id()).await.unwrap());

    let second = store.scale(&ScaleRequest::new(10, 10)).await.unwrap();
    assert_eq!(second.id(), "2");

    assert_eq!(store.clear().await.unwrap(), 1);
    let third = store.scale(&ScaleRequest::new(10, 10)).await.unwrap();
    assert_eq!(third.id(), "3");
}

#[tokio::test]
async fn test_iteration_is_ordered_and_restartable() {
    let (store, _, _) = memory_store().await;
    for width in [30, 10, 20] {
        store.scale(&ScaleRequest::new(width, 10)).await.unwrap();
    }

    let first_pass: Vec<_> = store.iter().try_collect().await.unwrap();
    let ids: Vec<_> = first_pass.iter().map(|r| r.id().to_string()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
    assert_eq!(first_pass[0].dimensions(), (30, 10));

    store.remove("2").await.unwrap();
    let second_pass: Vec<_> = store.iter().try_collect().await.unwrap();
    let ids: Vec<_> = second_pass.iter().map(|r| r.id().to_string()).collect();
    assert_eq!(ids, vec!["1", "3"]);
}

#[tokio::test]
async fn test_reopen_keeps_scales_for_same_original() {
    let substrate = MemoryBlobStore::new();
    let scaler = Arc::new(CountingScaler::default());

    let store = open_store(Arc::new(substrate.clone()), scaler.clone(), ORIGINAL).await;
    let record = store.scale(&ScaleRequest::new(64, 48)).await.unwrap();
    drop(store);

    let reopened = open_store(Arc::new(substrate.clone()), scaler.clone(), ORIGINAL).await;
    assert_eq!(reopened.count().await, 1);
    assert_eq!(reopened.get(record.id()).await.unwrap(), Some(record.clone()));

    let next = reopened.scale(&ScaleRequest::new(32, 24)).await.unwrap();
    assert_eq!(next.id(), "2");
    assert_eq!(scaler.calls(), 2);

    let replaced = open_store(Arc::new(substrate), scaler, b"a different original").await;
    assert_eq!(replaced.count().await, 0);
    assert_eq!(replaced.get(record.id()).await.unwrap(), None);
}

#[tokio::test]
async fn test_fields_do_not_share_scales() {
    let substrate = MemoryBlobStore::new();
    let scaler = Arc::new(CountingScaler::default());

    let lead = ScaleStore::builder()
        .field("lead")
        .original(Bytes::from_static(ORIGINAL))
        .substrate(Arc::new(substrate.clone()))
        .scaler(scaler.clone())
        .open()
        .await
        .unwrap();
    let teaser = ScaleStore::builder()
        .field("teaser")
        .original(Bytes::from_static(ORIGINAL))
        .substrate(Arc::new(substrate.clone()))
        .scaler(scaler.clone())
        .open()
        .await
        .unwrap();

    let a = lead.scale(&ScaleRequest::new(10, 10)).await.unwrap();
    let b = teaser.scale(&ScaleRequest::new(10, 10)).await.unwrap();
    assert_eq!(a.id(), "1");
    assert_eq!(b.id(), "1");
    assert_eq!(scaler.calls(), 2);

    lead.clear().await.unwrap();
    assert_eq!(teaser.count().await, 1);
    assert!(substrate.get("teaser/1.bin").await.unwrap().is_some());
}

#[tokio::test]
async fn test_set_original_invalidates_scales() {
    let (store, scaler, substrate) = memory_store().await;
    store.scale(&ScaleRequest::new(10, 10)).await.unwrap();
    store.scale(&ScaleRequest::new(20, 20)).await.unwrap();

    assert!(!store.set_original(Bytes::from_static(ORIGINAL)).await.unwrap());
    assert_eq!(store.count().await, 2);

    assert!(store.set_original(Bytes::from_static(b"new")).await.unwrap());
    assert_eq!(store.count().await, 0);
    assert_eq!(substrate.keys().await.unwrap(), vec!["image/index.json"]);

    let fresh = store.scale(&ScaleRequest::new(10, 10)).await.unwrap();
    assert_eq!(fresh.id(), "3");
    assert_eq!(fresh.data().as_ref(), b"10x10 down q88 of 3 bytes");
    assert_eq!(scaler.calls(), 3);
}

#[tokio::test]
async fn test_purge_removes_old_scales() {
    let (store, _, _) = memory_store().await;
    store.scale(&ScaleRequest::new(10, 10)).await.unwrap();
    store.scale(&ScaleRequest::new(20, 20)).await.unwrap();

    assert_eq!(store.purge_older_than(Duration::from_secs(3600)).await.unwrap(), 0);
    assert_eq!(store.count().await, 2);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(store.purge_older_than(Duration::ZERO).await.unwrap(), 2);
    assert_eq!(store.count().await, 0);
}

#[tokio::test]
async fn test_vacuum_deletes_unreferenced_blobs() {
    let (store, _, substrate) = memory_store().await;
    store.scale(&ScaleRequest::new(10, 10)).await.unwrap();

    substrate
        .put("image/99.bin", Bytes::from_static(b"orphan"))
        .await
        .unwrap();
    substrate
        .put("image/stray.tmp", Bytes::from_static(b"stray"))
        .await
        .unwrap();
    substrate
        .put("other/1.bin", Bytes::from_static(b"not ours"))
        .await
        .unwrap();

    assert_eq!(store.vacuum().await.unwrap(), 2);
    assert_eq!(
        substrate.keys().await.unwrap(),
        vec!["image/1.bin", "image/1.json", "image/index.json", "other/1.bin"]
    );
    assert_eq!(store.vacuum().await.unwrap(), 0);
}

#[tokio::test]
async fn test_stats_sum_record_sizes() {
    let (store, _, _) = memory_store().await;
    let a = store.scale(&ScaleRequest::new(10, 10)).await.unwrap();
    let b = store.scale(&ScaleRequest::new(200, 100)).await.unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.field, "image");
    assert_eq!(stats.count, 2);
    assert_eq!(stats.total_bytes, a.size() + b.size());
}

#[tokio::test]
async fn test_default_scaler_rejects_undecodable_original() {
    let substrate = MemoryBlobStore::new();
    let store = ScaleStore::builder()
        .original(Bytes::from_static(ORIGINAL))
        .substrate(Arc::new(substrate))
        .open()
        .await
        .unwrap();

    let err = store.scale(&ScaleRequest::default()).await.unwrap_err();
    assert!(err.is_generation());
    assert_eq!(store.count().await, 0);
}

fn is_persistence_error<T>(result: Result<T, ScaleError>) -> bool {
    matches!(result, Err(ScaleError::Persistence(PersistenceError::Io(_))))
}

#[tokio::test]
async fn test_read_failures_are_surfaced() {
    let substrate = Arc::new(FailingBlobStore::default());
    let scaler = Arc::new(CountingScaler::default());
    let store = open_store(substrate.clone(), scaler.clone(), ORIGINAL).await;
    let record = store.scale(&ScaleRequest::new(30, 30)).await.unwrap();

    substrate.fail_gets(true);
    assert!(is_persistence_error(store.get(record.id()).await));
    assert!(is_persistence_error(
        store.get_scale(&ScaleRequest::new(30, 30), false).await
    ));
    assert!(is_persistence_error(
        store.get_scale(&ScaleRequest::new(30, 30), true).await
    ));
    assert!(is_persistence_error(
        store.iter().try_collect::<Vec<_>>().await
    ));
    assert!(is_persistence_error(store.stats().await));

    // Nothing was regenerated or dropped from the index
    assert_eq!(scaler.calls(), 1);
    assert_eq!(store.keys().await, vec!["1"]);

    substrate.fail_gets(false);
    assert_eq!(store.get(record.id()).await.unwrap(), Some(record));
}

#[tokio::test]
async fn test_remove_with_failing_delete_keeps_index_consistent() {
    let substrate = Arc::new(FailingBlobStore::default());
    let store = open_store(
        substrate.clone(),
        Arc::new(CountingScaler::default()),
        ORIGINAL,
    )
    .await;
    store.scale(&ScaleRequest::new(10, 10)).await.unwrap();
    store.scale(&ScaleRequest::new(20, 20)).await.unwrap();

    substrate.fail_deletes(true);
    assert!(is_persistence_error(store.remove("1").await));

    assert!(!store.contains("1").await);
    assert_eq!(store.keys().await, vec!["2"]);
    assert_eq!(store.count().await, store.keys().await.len());
    assert_eq!(store.get("1").await.unwrap(), None);

    // The undeleted blobs are orphans, vacuum reports the failure too
    assert!(is_persistence_error(store.vacuum().await));

    substrate.fail_deletes(false);
    assert_eq!(store.vacuum().await.unwrap(), 2);
    assert_eq!(
        substrate.keys().await.unwrap(),
        vec!["image/2.bin", "image/2.json", "image/index.json"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remove_racing_generation_never_exposes_partial_records() {
    let store = Arc::new(
        open_store(
            Arc::new(MemoryBlobStore::new()),
            Arc::new(CountingScaler::slow(Duration::from_millis(1))),
            ORIGINAL,
        )
        .await,
    );
    let expected = Bytes::from(format!("64x64 down q88 of {} bytes", ORIGINAL.len()));

    for _ in 0..25 {
        let creator = {
            let store = store.clone();
            tokio::spawn(async move { store.scale(&ScaleRequest::new(64, 64)).await })
        };
        let remover = {
            let store = store.clone();
            tokio::spawn(async move {
                for id in store.keys().await {
                    store.remove(&id).await?;
                }
                Ok::<_, ScaleError>(())
            })
        };
        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                for id in store.keys().await {
                    if let Some(record) = store.get(&id).await? {
                        seen.push(record);
                    }
                }
                if let Some(record) = store
                    .get_scale(&ScaleRequest::new(64, 64), false)
                    .await?
                {
                    seen.push(record);
                }
                Ok::<_, ScaleError>(seen)
            })
        };

        let created = creator.await.unwrap().unwrap();
        remover.await.unwrap().unwrap();
        let seen = reader.await.unwrap().unwrap();

        for record in seen.iter().chain(std::iter::once(&created)) {
            assert_eq!(record.data(), &expected);
            assert_eq!(record.size(), record.data().len() as u64);
            assert_eq!(record.dimensions(), (64, 64));
        }

        let keys = store.keys().await;
        assert_eq!(store.count().await, keys.len());
        assert!(keys.len() <= 1);
        for id in keys {
            assert!(store.get(&id).await.unwrap().is_some());
        }
    }
}
