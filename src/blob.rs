//! Blob accessor for offloaded snapshot payloads.
//!
//! Snapshot payloads too large to inline in their record are parked in an
//! object store and referenced by key. The contract here is deliberately
//! small: whole-object `put` and `get` with exact byte round-trip. Backends
//! are expected to write atomically, so a failed `put` never corrupts a
//! previously stored object.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::error::{Result, StoreError};

/// Attempts made before a storage failure is surfaced.
const MAX_ATTEMPTS: u32 = 3;

/// Base backoff between attempts.
const BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Cap on the (doubling) backoff.
const BACKOFF_MAX: Duration = Duration::from_secs(3);

/// Whole-object byte storage keyed by string.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `key`, replacing any previous object atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] on backend failure.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Read the object at `key`, byte-for-byte as written.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if no object exists at `key`.
    /// - [`StoreError::Storage`] on backend failure.
    async fn get(&self, key: &str) -> Result<Bytes>;
}

/// In-memory [`BlobStore`] for tests and single-process deployments.
#[derive(Debug, Default, Clone)]
pub struct MemoryBlobStore {
    objects: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryBlobStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// `true` if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.objects.write().await.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                resource: "blob",
                id: key.to_string(),
            })
    }
}

/// Run `op`, retrying transient storage failures with exponential backoff
/// and jitter.
///
/// Only [`StoreError::Storage`] is considered transient; every other error
/// (not-found, validation) is returned on the first attempt. After
/// [`MAX_ATTEMPTS`] the last storage error is surfaced.
///
/// # Errors
///
/// The final error of the last attempt.
pub async fn with_retry<T, F, Fut>(label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = BACKOFF_BASE;
    for attempt in 1..=MAX_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err @ StoreError::Storage { .. }) if attempt < MAX_ATTEMPTS => {
                let jitter = Duration::from_millis(rand::random_range(0..50));
                let delay = backoff.min(BACKOFF_MAX) + jitter;
                tracing::warn!(
                    operation = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient storage failure, retrying"
                );
                tokio::time::sleep(delay).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(err) => {
                if matches!(err, StoreError::Storage { .. }) {
                    tracing::error!(operation = label, attempts = MAX_ATTEMPTS, error = %err, "retries exhausted");
                }
                return Err(err);
            }
        }
    }
    // The loop always returns by the final attempt.
    Err(StoreError::storage(format!("{label}: retry loop exhausted")))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Fails the first `failures` calls, then delegates to a memory store.
    #[derive(Clone)]
    struct FlakyBlobStore {
        inner: MemoryBlobStore,
        remaining_failures: Arc<AtomicU32>,
    }

    impl FlakyBlobStore {
        fn failing(failures: u32) -> Self {
            Self {
                inner: MemoryBlobStore::new(),
                remaining_failures: Arc::new(AtomicU32::new(failures)),
            }
        }

        fn trip(&self) -> Result<()> {
            let remaining = self.remaining_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::storage("simulated outage"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl BlobStore for FlakyBlobStore {
        async fn put(&self, key: &str, data: Bytes) -> Result<()> {
            self.trip()?;
            self.inner.put(key, data).await
        }

        async fn get(&self, key: &str) -> Result<Bytes> {
            self.trip()?;
            self.inner.get(key).await
        }
    }

    #[tokio::test]
    async fn put_get_round_trips_exact_bytes() {
        let store = MemoryBlobStore::new();
        let data = Bytes::from_static(&[0u8, 159, 146, 150, 255]);
        store.put("t/p/abc.bin", data.clone()).await.expect("put");
        let read = store.get("t/p/abc.bin").await.expect("get");
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn get_missing_key_is_not_found() {
        let store = MemoryBlobStore::new();
        let err = store.get("nope").await.expect_err("must be missing");
        assert!(matches!(err, StoreError::NotFound { resource: "blob", .. }));
    }

    #[tokio::test]
    async fn put_replaces_previous_object() {
        let store = MemoryBlobStore::new();
        store.put("k", Bytes::from_static(b"old")).await.expect("put");
        store.put("k", Bytes::from_static(b"new")).await.expect("put");
        assert_eq!(store.get("k").await.expect("get"), Bytes::from_static(b"new"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_recovers_from_transient_failures() {
        let store = FlakyBlobStore::failing(2);
        let data = Bytes::from_static(b"payload");
        with_retry("put snapshot", || store.put("k", data.clone()))
            .await
            .expect("third attempt should succeed");
        assert_eq!(store.inner.get("k").await.expect("get"), data);
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_gives_up_after_three_attempts() {
        let store = FlakyBlobStore::failing(10);
        let err = with_retry("get snapshot", || store.get("k"))
            .await
            .expect_err("persistent outage must surface");
        assert!(matches!(err, StoreError::Storage { .. }));
        // 3 attempts: the initial call plus two retries.
        assert_eq!(store.remaining_failures.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_does_not_retry_not_found() {
        let store = FlakyBlobStore::failing(0);
        let calls = Arc::new(AtomicU32::new(0));
        let counted = {
            let store = store.clone();
            let calls = Arc::clone(&calls);
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                let store = store.clone();
                async move { store.get("missing").await }
            }
        };
        let err = with_retry("get snapshot", counted)
            .await
            .expect_err("missing is missing");
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_put_leaves_previous_object_intact() {
        let store = FlakyBlobStore::failing(0);
        store.put("k", Bytes::from_static(b"v1")).await.expect("put");

        store.remaining_failures.store(5, Ordering::SeqCst);
        store
            .put("k", Bytes::from_static(b"v2"))
            .await
            .expect_err("outage");
        store.remaining_failures.store(0, Ordering::SeqCst);

        assert_eq!(store.get("k").await.expect("get"), Bytes::from_static(b"v1"));
    }
}
