//! In-memory event store backend.
//!
//! [`MemoryEventStore`] holds one log per tenant; [`ScopedEventStore`] is
//! the tenant-scoped view that implements [`EventStore`]. The commit
//! section -- re-read every reserved tag's true latest id, compare, then
//! write event rows and tag-index rows -- runs under a single write lock,
//! which is the in-process equivalent of a per-tag row lock: two appends
//! racing on the same tag cannot both pass the check. Appends on disjoint
//! tag sets never conflict logically; they only briefly serialize on the
//! lock. Readers take the read lock and are never blocked by projection or
//! snapshot work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::event::{ConsistencyTagEntry, Event, EventDraft};
use crate::eventstore::{AppendOutcome, EventQuery, EventStore, TagWriteResult};
use crate::id::SortableId;
use crate::tag::Tag;
use crate::tenant::TenantId;

/// One tag-index row: tag key -> (sortable id, event id).
#[derive(Debug, Clone)]
struct TagRow {
    sortable_id: SortableId,
    #[allow(dead_code)] // Mirrors the persisted layout; read paths key off sortable_id.
    event_id: Uuid,
}

/// Per-tenant event log and tag index.
#[derive(Debug, Default)]
struct TenantLog {
    /// Events in commit order, which is ascending [`SortableId`] order.
    events: Vec<Event>,
    /// Tag key -> index rows, each ascending by [`SortableId`].
    tag_index: HashMap<String, Vec<TagRow>>,
    /// The last id this log assigned; the monotonicity fence.
    last_assigned: Option<SortableId>,
}

impl TenantLog {
    fn latest_for_key(&self, key: &str) -> Option<SortableId> {
        self.tag_index
            .get(key)
            .and_then(|rows| rows.last())
            .map(|row| row.sortable_id)
    }

    /// Assign the next id: fresh wall-clock id, bumped past the previous
    /// assignment when entropy ties within a millisecond.
    fn next_id(&mut self) -> SortableId {
        let candidate = SortableId::now();
        let id = match self.last_assigned {
            Some(last) if !candidate.is_later_than(&last) => last.successor(),
            _ => candidate,
        };
        self.last_assigned = Some(id);
        id
    }
}

/// Shared in-memory backend, partitioned by tenant.
///
/// Cheap to clone behind an [`Arc`]; scope it to a tenant with
/// [`MemoryEventStore::scope`] to obtain an [`EventStore`] handle.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    logs: RwLock<HashMap<String, TenantLog>>,
}

impl MemoryEventStore {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A tenant-scoped [`EventStore`] view over this backend.
    #[must_use]
    pub fn scope(self: &Arc<Self>, tenant: TenantId) -> ScopedEventStore {
        ScopedEventStore {
            inner: Arc::clone(self),
            tenant,
        }
    }
}

/// Tenant-scoped view implementing [`EventStore`].
///
/// Every key this view touches is prefixed by the tenant, so identical tag
/// strings under different tenants resolve to independent logs.
#[derive(Debug, Clone)]
pub struct ScopedEventStore {
    inner: Arc<MemoryEventStore>,
    tenant: TenantId,
}

impl ScopedEventStore {
    /// A scoped store over a fresh private backend. Convenient for tests
    /// and single-tenant embedding.
    #[must_use]
    pub fn in_memory(tenant: TenantId) -> Self {
        Arc::new(MemoryEventStore::new()).scope(tenant)
    }

    /// The tenant this view is scoped to.
    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    fn tenant_key(&self) -> &str {
        self.tenant.as_str()
    }
}

#[async_trait]
impl EventStore for ScopedEventStore {
    async fn append(
        &self,
        drafts: Vec<EventDraft>,
        entries: &[ConsistencyTagEntry],
    ) -> Result<AppendOutcome> {
        if drafts.is_empty() {
            return Err(StoreError::validation("append batch cannot be empty"));
        }
        for entry in entries {
            if !entry.tag.is_consistency_tag() {
                return Err(StoreError::validation(format!(
                    "tag '{}' is index-only and cannot carry a consistency reservation",
                    entry.tag
                )));
            }
        }

        let started = Instant::now();
        let mut logs = self.inner.logs.write().await;
        let log = logs.entry(self.tenant_key().to_string()).or_default();

        // Consistency check against the true latest id of every reserved
        // tag. Any stale reservation rejects the whole batch before a
        // single row is written.
        for entry in entries {
            let actual = log.latest_for_key(&entry.tag.key());
            let stale = match (actual, entry.last_seen) {
                (Some(actual), Some(observed)) => actual.is_later_than(&observed),
                (Some(_), None) => true,
                (None, _) => false,
            };
            if let Some(actual) = actual
                && stale
            {
                tracing::debug!(
                    tenant = %self.tenant,
                    tag = %entry.tag,
                    observed = ?entry.last_seen,
                    %actual,
                    "append rejected: stale consistency reservation"
                );
                return Err(StoreError::ConcurrencyConflict {
                    tag: entry.tag.key(),
                    observed: entry.last_seen,
                    actual,
                });
            }
        }

        // All checks passed: assign ids and write event + tag-index rows.
        let mut events = Vec::with_capacity(drafts.len());
        let mut tag_writes = Vec::new();
        for draft in drafts {
            let sortable_id = log.next_id();
            let event = Event {
                id: draft.id,
                sortable_id,
                event_type: draft.event_type,
                payload: draft.payload,
                tags: draft.tags,
                recorded_at: Utc::now(),
                causation_id: draft.causation_id,
                correlation_id: draft.correlation_id,
                executed_by: draft.executed_by,
            };
            for tag in &event.tags {
                log.tag_index.entry(tag.key()).or_default().push(TagRow {
                    sortable_id,
                    event_id: event.id,
                });
                tag_writes.push(TagWriteResult {
                    tag: tag.key(),
                    event_id: event.id,
                    sortable_id,
                });
            }
            log.events.push(event.clone());
            events.push(event);
        }
        drop(logs);

        let duration = started.elapsed();
        tracing::info!(
            tenant = %self.tenant,
            events = events.len(),
            tag_rows = tag_writes.len(),
            ?duration,
            "append committed"
        );
        Ok(AppendOutcome {
            events,
            tag_writes,
            duration,
        })
    }

    async fn read(&self, query: EventQuery) -> Result<Vec<Event>> {
        let logs = self.inner.logs.read().await;
        let Some(log) = logs.get(self.tenant_key()) else {
            return Ok(Vec::new());
        };
        // The log is already ascending by sortable id.
        let iter = log.events.iter().filter(|e| query.matches(e)).cloned();
        Ok(match query.limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        })
    }

    async fn latest_for_tag(&self, tag: &Tag) -> Result<Option<SortableId>> {
        let logs = self.inner.logs.read().await;
        Ok(logs
            .get(self.tenant_key())
            .and_then(|log| log.latest_for_key(&tag.key())))
    }

    async fn tag_exists(&self, tag: &Tag) -> Result<bool> {
        let logs = self.inner.logs.read().await;
        Ok(logs
            .get(self.tenant_key())
            .is_some_and(|log| log.tag_index.contains_key(&tag.key())))
    }
}
