//! Top-level entry point composing the event store, tag state cache,
//! multi-projections, and snapshot persistence into a single [`TagStore`].
//!
//! The store is assembled via [`TagStoreBuilder`], which wires a tenant,
//! an [`EventStore`] backend, a blob store and snapshot repository, the
//! safe-window and snapshot policies, and any registered
//! multi-projections. Everything defaults to the in-memory backends, so a
//! test or a single-process deployment needs no configuration at all.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::blob::{BlobStore, MemoryBlobStore};
use crate::cache::TagStateCache;
use crate::command::{self, CommandContext, CommandMetadata, CommandResponse};
use crate::error::{ExecuteError, Result, StoreError};
use crate::event::Event;
use crate::eventstore::{EventQuery, EventStore};
use crate::id::SortableId;
use crate::memory::ScopedEventStore;
use crate::multi::{
    DualProjection, MultiProjection, SafeWindowPolicy, SnapshotPolicy, TrailingOffsetPolicy,
};
use crate::snapshot::{
    DEFAULT_INLINE_LIMIT, JsonGzipSerializer, MemorySnapshotRepository,
    MultiProjectionStateRecord, SnapshotOffloader, SnapshotRepository, SnapshotSerializer,
};
use crate::tenant::TenantId;

/// Safe and unsafe states of one multi-projection, after catch-up.
#[derive(Debug, Clone)]
pub struct ProjectionStates<P> {
    /// The settled fold: only events at or below the safe-window threshold.
    pub safe: P,
    /// The up-to-the-moment fold: every event seen, including contested
    /// ones still inside the safe window.
    pub latest: P,
}

/// Type-erased interface over a [`DualProjection`], so the store can hold
/// heterogeneous multi-projections in one map.
///
/// Serialization works through `serde_json::Value` and state hand-off
/// through `Box<dyn Any>`; downcasting recovers the concrete type.
trait MultiProjectionRunner: Send + Sync {
    fn name(&self) -> String;
    fn version(&self) -> String;
    fn payload_type(&self) -> &'static str;
    fn ingest(&mut self, event: &Event);
    fn advance_threshold(&mut self, threshold: SortableId);
    fn last_applied(&self) -> Option<SortableId>;
    fn safe_last_applied(&self) -> Option<SortableId>;
    fn threshold(&self) -> Option<SortableId>;
    fn events_processed(&self) -> u64;
    fn safe_state_any(&self) -> Box<dyn Any + Send>;
    fn unsafe_state_any(&self) -> Box<dyn Any + Send>;
    fn safe_payload_json(&self) -> Result<serde_json::Value>;
    fn restore(
        &mut self,
        payload: serde_json::Value,
        cursor: Option<SortableId>,
        threshold: Option<SortableId>,
        events_processed: u64,
    ) -> Result<()>;
}

/// Concrete runner for a specific multi-projection type `P`.
struct TypedRunner<P: MultiProjection> {
    dual: DualProjection<P>,
}

impl<P> MultiProjectionRunner for TypedRunner<P>
where
    P: MultiProjection + Serialize + DeserializeOwned,
{
    fn name(&self) -> String {
        self.dual.unsafe_state().name().to_string()
    }

    fn version(&self) -> String {
        self.dual.unsafe_state().version().to_string()
    }

    fn payload_type(&self) -> &'static str {
        std::any::type_name::<P>()
    }

    fn ingest(&mut self, event: &Event) {
        self.dual.ingest(event);
    }

    fn advance_threshold(&mut self, threshold: SortableId) {
        self.dual.advance_threshold(threshold);
    }

    fn last_applied(&self) -> Option<SortableId> {
        self.dual.last_applied()
    }

    fn safe_last_applied(&self) -> Option<SortableId> {
        self.dual.safe_last_applied()
    }

    fn threshold(&self) -> Option<SortableId> {
        self.dual.threshold()
    }

    fn events_processed(&self) -> u64 {
        self.dual.events_processed()
    }

    fn safe_state_any(&self) -> Box<dyn Any + Send> {
        Box::new(self.dual.safe_state().clone())
    }

    fn unsafe_state_any(&self) -> Box<dyn Any + Send> {
        Box::new(self.dual.unsafe_state().clone())
    }

    fn safe_payload_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self.dual.safe_state()).map_err(StoreError::serialization)
    }

    fn restore(
        &mut self,
        payload: serde_json::Value,
        cursor: Option<SortableId>,
        threshold: Option<SortableId>,
        events_processed: u64,
    ) -> Result<()> {
        let state: P = serde_json::from_value(payload).map_err(StoreError::serialization)?;
        self.dual = DualProjection::restored(state, cursor, threshold, events_processed);
        Ok(())
    }
}

/// Snapshot cadence bookkeeping for one registered projection.
struct Cadence {
    last_snapshot: Instant,
    events_at_last: u64,
}

/// A registered multi-projection: its runner plus snapshot bookkeeping.
struct ProjectionEntry {
    runner: tokio::sync::Mutex<Box<dyn MultiProjectionRunner>>,
    cadence: tokio::sync::Mutex<Cadence>,
}

/// Factory producing a registered projection at build time.
type RunnerFactory = Box<dyn FnOnce() -> (String, TypeId, Box<dyn MultiProjectionRunner>)>;

/// The toolkit's front door: commands, per-tag state, multi-projections,
/// and snapshots for one tenant.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped, and clones
/// share the same caches and projections.
#[derive(Clone)]
pub struct TagStore {
    tenant: TenantId,
    store: Arc<dyn EventStore>,
    cache: TagStateCache,
    serializer: Arc<dyn SnapshotSerializer>,
    offloader: Arc<SnapshotOffloader>,
    repository: Arc<dyn SnapshotRepository>,
    safe_window: Arc<dyn SafeWindowPolicy>,
    snapshot_policy: SnapshotPolicy,
    projections: Arc<HashMap<String, ProjectionEntry>>,
    names: Arc<HashMap<TypeId, String>>,
}

impl std::fmt::Debug for TagStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagStore")
            .field("tenant", &self.tenant)
            .field("projections", &self.projections.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TagStore {
    /// The tenant this store is scoped to.
    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// The underlying event store.
    #[must_use]
    pub fn event_store(&self) -> Arc<dyn EventStore> {
        Arc::clone(&self.store)
    }

    /// The shared tag state cache.
    #[must_use]
    pub fn state_cache(&self) -> &TagStateCache {
        &self.cache
    }

    /// A fresh command context carrying `metadata`.
    #[must_use]
    pub fn context(&self, metadata: CommandMetadata) -> CommandContext {
        CommandContext::new(Arc::clone(&self.store), self.cache.clone(), metadata)
    }

    /// Run a command handler against a fresh context and commit.
    ///
    /// # Errors
    ///
    /// See [`command::execute`].
    pub async fn execute<E, F, Fut>(
        &self,
        metadata: CommandMetadata,
        handler: F,
    ) -> std::result::Result<CommandResponse, ExecuteError<E>>
    where
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce(CommandContext) -> Fut,
        Fut: Future<Output = std::result::Result<CommandContext, ExecuteError<E>>>,
    {
        command::execute(self.context(metadata), handler).await
    }

    /// Catch up a registered multi-projection and return clones of both
    /// folds.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if `P` was never registered.
    /// - Store read failures during catch-up.
    pub async fn projection<P>(&self) -> Result<ProjectionStates<P>>
    where
        P: MultiProjection + Serialize + DeserializeOwned,
    {
        let (name, entry) = self.entry_for::<P>()?;
        self.catch_up_entry(name, entry).await?;
        let runner = entry.runner.lock().await;
        Self::states_from(&**runner)
    }

    /// Catch up every registered multi-projection, snapshotting those whose
    /// cadence policy is due.
    ///
    /// # Errors
    ///
    /// Surfaces the first store read failure; snapshot failures are logged
    /// and skipped, never fatal.
    pub async fn catch_up_all(&self) -> Result<()> {
        for (name, entry) in self.projections.iter() {
            self.catch_up_entry(name, entry).await?;
        }
        Ok(())
    }

    /// Snapshot a registered multi-projection's safe state now.
    ///
    /// Serializes the safe fold, places the payload inline or in the blob
    /// store, and saves the record. Snapshot failures are never fatal:
    /// they are logged and `None` is returned, since the event log remains
    /// the source of truth.
    pub async fn snapshot<P>(&self) -> Option<MultiProjectionStateRecord>
    where
        P: MultiProjection + Serialize + DeserializeOwned,
    {
        let (name, entry) = match self.entry_for::<P>() {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(error = %err, "snapshot requested for unregistered projection");
                return None;
            }
        };
        match self.snapshot_entry(name, entry).await {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!(
                    tenant = self.tenant.as_str(),
                    projection = name,
                    error = %err,
                    "snapshot failed, continuing without one"
                );
                None
            }
        }
    }

    /// Restore a multi-projection from its latest snapshot, then replay
    /// only the events after the snapshot cursor.
    ///
    /// A missing, corrupt, or unreadable snapshot degrades to a full
    /// replay; it is never an error.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if `P` was never registered.
    /// - Store read failures during the delta replay.
    pub async fn load_projection<P>(&self) -> Result<ProjectionStates<P>>
    where
        P: MultiProjection + Serialize + DeserializeOwned,
    {
        let (name, entry) = self.entry_for::<P>()?;

        let record = {
            let runner = entry.runner.lock().await;
            self.repository
                .load(&self.tenant, name, &runner.version())
                .await
        };
        match record {
            Ok(Some(record)) => {
                if let Err(err) = self.restore_entry(entry, &record).await {
                    tracing::warn!(
                        tenant = self.tenant.as_str(),
                        projection = name,
                        error = %err,
                        "snapshot unusable, rebuilding from the event log"
                    );
                }
            }
            Ok(None) => {
                tracing::debug!(
                    tenant = self.tenant.as_str(),
                    projection = name,
                    "no snapshot, rebuilding from the event log"
                );
            }
            Err(err) => {
                tracing::warn!(
                    tenant = self.tenant.as_str(),
                    projection = name,
                    error = %err,
                    "snapshot repository unreadable, rebuilding from the event log"
                );
            }
        }

        self.catch_up_entry(name, entry).await?;
        let runner = entry.runner.lock().await;
        Self::states_from(&**runner)
    }

    fn entry_for<P: MultiProjection>(&self) -> Result<(&str, &ProjectionEntry)> {
        let name = self
            .names
            .get(&TypeId::of::<P>())
            .ok_or_else(|| StoreError::NotFound {
                resource: "multi-projection",
                id: std::any::type_name::<P>().to_string(),
            })?;
        let entry = self
            .projections
            .get(name)
            .ok_or_else(|| StoreError::NotFound {
                resource: "multi-projection",
                id: name.clone(),
            })?;
        Ok((name, entry))
    }

    fn states_from<P: MultiProjection>(
        runner: &dyn MultiProjectionRunner,
    ) -> Result<ProjectionStates<P>> {
        let safe = runner
            .safe_state_any()
            .downcast::<P>()
            .map(|boxed| *boxed)
            .map_err(|_| StoreError::Serialization {
                message: format!(
                    "projection '{}' does not hold a {}",
                    runner.name(),
                    std::any::type_name::<P>()
                ),
            })?;
        let latest = runner
            .unsafe_state_any()
            .downcast::<P>()
            .map(|boxed| *boxed)
            .map_err(|_| StoreError::Serialization {
                message: format!(
                    "projection '{}' does not hold a {}",
                    runner.name(),
                    std::any::type_name::<P>()
                ),
            })?;
        Ok(ProjectionStates { safe, latest })
    }

    async fn catch_up_entry(&self, name: &str, entry: &ProjectionEntry) -> Result<()> {
        let threshold = self.safe_window.threshold(Utc::now());
        {
            let mut runner = entry.runner.lock().await;
            let mut query = EventQuery::all();
            if let Some(cursor) = runner.last_applied() {
                query = query.after(cursor);
            }
            let newer = self.store.read(query).await?;
            let count = newer.len();
            for event in &newer {
                runner.ingest(event);
            }
            runner.advance_threshold(threshold);
            if count > 0 {
                tracing::debug!(
                    tenant = self.tenant.as_str(),
                    projection = name,
                    applied = count,
                    "projection caught up"
                );
            }
        }

        let due = {
            let runner = entry.runner.lock().await;
            let cadence = entry.cadence.lock().await;
            self.snapshot_policy.should_snapshot(
                runner.events_processed() - cadence.events_at_last,
                cadence.last_snapshot.elapsed(),
            )
        };
        if due && let Err(err) = self.snapshot_entry(name, entry).await {
            tracing::warn!(
                tenant = self.tenant.as_str(),
                projection = name,
                error = %err,
                "scheduled snapshot failed, continuing without one"
            );
        }
        Ok(())
    }

    async fn snapshot_entry(
        &self,
        name: &str,
        entry: &ProjectionEntry,
    ) -> Result<MultiProjectionStateRecord> {
        let (payload, version, payload_type, cursor, threshold, events_processed) = {
            let runner = entry.runner.lock().await;
            (
                runner.safe_payload_json()?,
                runner.version(),
                runner.payload_type(),
                runner.safe_last_applied(),
                runner.threshold(),
                runner.events_processed(),
            )
        };

        let serialized = self.serializer.serialize(&payload)?;
        let slot = self
            .offloader
            .place(&self.tenant, name, &serialized)
            .await?;
        let now = Utc::now();
        let record = MultiProjectionStateRecord {
            tenant: self.tenant.clone(),
            projector_name: name.to_string(),
            projector_version: version,
            payload_type: payload_type.to_string(),
            last_sortable_id: cursor,
            safe_window_threshold: threshold,
            events_processed,
            is_offloaded: slot.is_offloaded,
            inline_payload: slot.inline_payload,
            offload_key: slot.offload_key,
            offload_provider: slot.offload_provider,
            original_size: serialized.original_size as u64,
            compressed_size: serialized.compressed_size as u64,
            build_source: Some(
                concat!(env!("CARGO_PKG_NAME"), "@", env!("CARGO_PKG_VERSION")).to_string(),
            ),
            build_host: std::env::var("HOSTNAME").ok(),
            created_at: now,
            updated_at: now,
        };
        self.repository.save(record.clone()).await?;

        let mut cadence = entry.cadence.lock().await;
        cadence.last_snapshot = Instant::now();
        cadence.events_at_last = events_processed;
        tracing::info!(
            tenant = self.tenant.as_str(),
            projection = name,
            events_processed,
            offloaded = record.is_offloaded,
            compressed_size = record.compressed_size,
            "snapshot saved"
        );
        Ok(record)
    }

    async fn restore_entry(
        &self,
        entry: &ProjectionEntry,
        record: &MultiProjectionStateRecord,
    ) -> Result<()> {
        let bytes = self.offloader.retrieve(record).await?;
        let payload = self.serializer.deserialize(&bytes)?;
        let mut runner = entry.runner.lock().await;
        runner.restore(
            payload,
            record.last_sortable_id,
            record.safe_window_threshold,
            record.events_processed,
        )?;
        tracing::debug!(
            tenant = self.tenant.as_str(),
            projection = %record.projector_name,
            events_processed = record.events_processed,
            "projection restored from snapshot"
        );
        Ok(())
    }
}

/// Builder for configuring and assembling a [`TagStore`].
///
/// # Examples
///
/// ```
/// use tagfold::TagStoreBuilder;
///
/// let store = TagStoreBuilder::new().build().expect("default store");
/// assert_eq!(store.tenant().as_str(), "default");
/// ```
pub struct TagStoreBuilder {
    tenant: TenantId,
    event_store: Option<Arc<dyn EventStore>>,
    blob: Option<(Arc<dyn BlobStore>, String)>,
    repository: Option<Arc<dyn SnapshotRepository>>,
    serializer: Option<Arc<dyn SnapshotSerializer>>,
    inline_limit: usize,
    safe_window: Option<Arc<dyn SafeWindowPolicy>>,
    snapshot_policy: SnapshotPolicy,
    runner_factories: Vec<RunnerFactory>,
}

impl TagStoreBuilder {
    /// A builder with every component defaulted to its in-memory form.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tenant: TenantId::default_tenant(),
            event_store: None,
            blob: None,
            repository: None,
            serializer: None,
            inline_limit: DEFAULT_INLINE_LIMIT,
            safe_window: None,
            snapshot_policy: SnapshotPolicy::disabled(),
            runner_factories: Vec::new(),
        }
    }

    /// Scope the store to `tenant` instead of the default tenant.
    #[must_use]
    pub fn tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = tenant;
        self
    }

    /// Use a specific event store backend.
    ///
    /// The backend is used as-is: it must already be scoped to the same
    /// tenant this builder is configured with.
    #[must_use]
    pub fn event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.event_store = Some(store);
        self
    }

    /// Use a specific blob store, identified as `provider` in snapshot
    /// records.
    #[must_use]
    pub fn blob_store(mut self, blob: Arc<dyn BlobStore>, provider: impl Into<String>) -> Self {
        self.blob = Some((blob, provider.into()));
        self
    }

    /// Use a specific snapshot repository.
    #[must_use]
    pub fn snapshot_repository(mut self, repository: Arc<dyn SnapshotRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Use a custom snapshot payload codec.
    #[must_use]
    pub fn serializer(mut self, serializer: Arc<dyn SnapshotSerializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Snapshot payloads above this many compressed bytes are offloaded to
    /// the blob store.
    #[must_use]
    pub fn inline_limit(mut self, bytes: usize) -> Self {
        self.inline_limit = bytes;
        self
    }

    /// Use a custom safe-window policy. Defaults to
    /// [`TrailingOffsetPolicy::default`].
    #[must_use]
    pub fn safe_window(mut self, policy: impl SafeWindowPolicy + 'static) -> Self {
        self.safe_window = Some(Arc::new(policy));
        self
    }

    /// Set the automatic snapshot cadence. Defaults to disabled.
    #[must_use]
    pub fn snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.snapshot_policy = policy;
        self
    }

    /// Register a multi-projection, starting its folds from `initial`.
    #[must_use]
    pub fn multi_projection<P>(mut self, initial: P) -> Self
    where
        P: MultiProjection + Serialize + DeserializeOwned,
    {
        self.runner_factories.push(Box::new(move || {
            let name = initial.name().to_string();
            let runner = TypedRunner {
                dual: DualProjection::new(initial),
            };
            (
                name,
                TypeId::of::<P>(),
                Box::new(runner) as Box<dyn MultiProjectionRunner>,
            )
        }));
        self
    }

    /// Assemble the [`TagStore`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] if two registered
    /// multi-projections share a name.
    pub fn build(self) -> Result<TagStore> {
        let store = self
            .event_store
            .unwrap_or_else(|| Arc::new(ScopedEventStore::in_memory(self.tenant.clone())));
        let cache = TagStateCache::new(Arc::clone(&store));
        let (blob, provider) = self
            .blob
            .unwrap_or_else(|| (Arc::new(MemoryBlobStore::new()), "memory".to_string()));
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(MemorySnapshotRepository::new()));
        let serializer = self
            .serializer
            .unwrap_or_else(|| Arc::new(JsonGzipSerializer::new()));
        let safe_window = self
            .safe_window
            .unwrap_or_else(|| Arc::new(TrailingOffsetPolicy::default()));
        let offloader = Arc::new(SnapshotOffloader::new(blob, provider, self.inline_limit));

        let mut projections = HashMap::new();
        let mut names = HashMap::new();
        for factory in self.runner_factories {
            let (name, type_id, runner) = factory();
            if projections.contains_key(&name) {
                return Err(StoreError::validation(format!(
                    "multi-projection '{name}' registered twice"
                )));
            }
            names.insert(type_id, name.clone());
            projections.insert(
                name,
                ProjectionEntry {
                    runner: tokio::sync::Mutex::new(runner),
                    cadence: tokio::sync::Mutex::new(Cadence {
                        last_snapshot: Instant::now(),
                        events_at_last: 0,
                    }),
                },
            );
        }

        Ok(TagStore {
            tenant: self.tenant,
            store,
            cache,
            serializer,
            offloader,
            repository,
            safe_window,
            snapshot_policy: self.snapshot_policy,
            projections: Arc::new(projections),
            names: Arc::new(names),
        })
    }
}

impl Default for TagStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
