//! Tag state cache and rebuilder.
//!
//! Serves `get_state(tag)` cheaply: a type-erased map keyed by
//! `(projector TypeId, tag key)` holds the last-known [`TagState`] per tag.
//! On a hit, only events newer than the cached cursor are fetched and
//! folded on top (incremental rebuild); on a miss or projector-version
//! mismatch, the tag's full history is replayed. Because the fold is pure
//! and deterministic, concurrent rebuilds of the same tag converge to the
//! same result -- the cache takes no rebuild lock and lets the last writer
//! win.
//!
//! The cache never assumes any particular hosting model: it is an
//! in-process concurrent map with explicit invalidation, and the same
//! contract could be backed by a distributed cache or actor-held state.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::Result;
use crate::eventstore::{EventQuery, EventStore};
use crate::projector::{TagProjector, TagState};
use crate::tag::Tag;

/// Type-erased state cache keyed by `(TypeId, tag key)`.
///
/// `TypeId` identifies the projector at runtime; the `String` is the
/// canonical tag key. `Box<dyn Any + Send + Sync>` lets one map hold
/// `TagState<P::State>` for any concrete `P`; downcasting recovers the
/// typed state.
type StateMap = HashMap<(TypeId, String), Box<dyn Any + Send + Sync>>;

/// Cache of per-tag fold results with incremental rebuild.
#[derive(Clone)]
pub struct TagStateCache {
    store: Arc<dyn EventStore>,
    entries: Arc<RwLock<StateMap>>,
}

impl TagStateCache {
    /// Create a cache reading from `store`.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The current state of `tag` under projector `P`.
    ///
    /// Always consults the store for events newer than the cached cursor,
    /// so the returned state reflects every event visible at call time --
    /// a cached entry can be stale in the map but is never served stale.
    ///
    /// # Errors
    ///
    /// Propagates store read failures and payload/schema mismatches.
    pub async fn get_state<P: TagProjector>(&self, tag: &Tag) -> Result<TagState<P::State>> {
        let key = (TypeId::of::<P>(), tag.key());

        let cached: Option<TagState<P::State>> = {
            let entries = self.entries.read().await;
            entries
                .get(&key)
                .and_then(|boxed| boxed.downcast_ref::<TagState<P::State>>())
                .filter(|state| state.projector_version == P::VERSION)
                .cloned()
        };

        let base = match cached {
            Some(state) => {
                tracing::debug!(tag = %tag, projector = P::NAME, version = state.version, "cache hit");
                state
            }
            None => {
                tracing::debug!(tag = %tag, projector = P::NAME, "cache miss, full replay");
                TagState::initial::<P>()
            }
        };

        // Fetch only the delta past the cursor; on a miss the cursor is
        // None and this is the full history.
        let mut query = EventQuery::all().for_tag(tag.clone());
        if let Some(cursor) = base.last_sorted_id {
            query = query.after(cursor);
        }
        let newer = self.store.read(query).await?;

        let state = newer
            .iter()
            .fold(base, |state, event| state.apply::<P>(event));

        let mut entries = self.entries.write().await;
        entries.insert(key, Box::new(state.clone()));
        Ok(state)
    }

    /// Evict every projector's entry for `tag`.
    ///
    /// Called after every successful append touching the tag, so no reader
    /// can observe a cursor that predates an event it has already seen
    /// committed.
    pub async fn invalidate(&self, tag: &Tag) {
        let key = tag.key();
        let mut entries = self.entries.write().await;
        entries.retain(|(_, cached_key), _| cached_key != &key);
    }

    /// Drop every cached entry.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Number of cached entries, across all projectors.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// `true` if nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
