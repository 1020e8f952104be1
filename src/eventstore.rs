//! The event store contract: append-with-consistency-check and ordered read.
//!
//! This is the seam a storage backend implements and everything else
//! consumes. The defining operation is [`EventStore::append`]: an atomic
//! batch commit that re-reads the true latest [`SortableId`] of every
//! reserved consistency tag, rejects the whole batch if any reservation is
//! stale, and otherwise persists the event rows plus one tag-index row per
//! tag -- all or nothing, regardless of cancellation timing.

use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::Stream;
use uuid::Uuid;

use crate::error::Result;
use crate::event::{ConsistencyTagEntry, Event, EventDraft};
use crate::id::SortableId;
use crate::tag::Tag;

/// Filters for an ordered read of the event log.
///
/// All filters are optional and conjunctive. Results are always ascending
/// by [`SortableId`]; the id range is exclusive at `after` and inclusive at
/// `up_to`, matching the delta-replay shape `(cursor, threshold]`.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Only events listing this tag (matched on the canonical tag key).
    pub tag: Option<Tag>,
    /// Only events with an id strictly later than this.
    pub after: Option<SortableId>,
    /// Only events with an id at or before this.
    pub up_to: Option<SortableId>,
    /// Only events whose type is one of these.
    pub event_types: Option<Vec<String>>,
    /// At most this many events, counted from the start of the range.
    pub limit: Option<usize>,
}

impl EventQuery {
    /// A query matching every event.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to events listing `tag`.
    #[must_use]
    pub fn for_tag(mut self, tag: Tag) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Restrict to ids strictly later than `id`.
    #[must_use]
    pub fn after(mut self, id: SortableId) -> Self {
        self.after = Some(id);
        self
    }

    /// Restrict to ids at or before `id`.
    #[must_use]
    pub fn up_to(mut self, id: SortableId) -> Self {
        self.up_to = Some(id);
        self
    }

    /// Restrict to the given event types.
    #[must_use]
    pub fn of_types(mut self, types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.event_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Cap the number of returned events.
    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// `true` if `event` passes every filter except `limit` (which is
    /// positional, applied by the backend after ordering).
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(tag) = &self.tag
            && !event.has_tag_key(&tag.key())
        {
            return false;
        }
        if let Some(after) = &self.after
            && !event.sortable_id.is_later_than(after)
        {
            return false;
        }
        if let Some(up_to) = &self.up_to
            && event.sortable_id.is_later_than(up_to)
        {
            return false;
        }
        if let Some(types) = &self.event_types
            && !types.iter().any(|t| t == &event.event_type)
        {
            return false;
        }
        true
    }
}

/// One tag-index row written by a successful append.
#[derive(Debug, Clone)]
pub struct TagWriteResult {
    /// Canonical tag key the row was written under.
    pub tag: String,
    /// The event the row links to.
    pub event_id: Uuid,
    /// The id shared by the event row and this index row.
    pub sortable_id: SortableId,
}

/// The success envelope of [`EventStore::append`].
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// The committed events, with store-assigned ids and timestamps.
    pub events: Vec<Event>,
    /// One entry per (event, tag) pair, in commit order.
    pub tag_writes: Vec<TagWriteResult>,
    /// Wall time the append took, for caller-side observability.
    pub duration: Duration,
}

impl AppendOutcome {
    /// The ids of the committed events, in commit order.
    #[must_use]
    pub fn sortable_ids(&self) -> Vec<SortableId> {
        self.events.iter().map(|e| e.sortable_id).collect()
    }
}

/// Append-with-consistency-check and ordered read over (event, tag-list)
/// tuples.
///
/// Implementations must serialize the "read true latest id, compare, write"
/// sequence per tag so two appends racing on the same tag cannot both
/// succeed, and must keep appends on disjoint tag sets free to run
/// concurrently. `ConcurrencyConflict` is a business outcome: never retried
/// inside the store.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically append a batch of events under the given consistency
    /// reservations.
    ///
    /// # Errors
    ///
    /// - [`StoreError::ConcurrencyConflict`](crate::StoreError::ConcurrencyConflict)
    ///   if any reserved tag's true latest id is strictly later than the
    ///   reservation's observed id. Nothing is persisted.
    /// - [`StoreError::Validation`](crate::StoreError::Validation) if the
    ///   batch is empty or an entry names a non-consistency tag.
    /// - [`StoreError::Storage`](crate::StoreError::Storage) on backend
    ///   failure after automatic retries.
    async fn append(
        &self,
        drafts: Vec<EventDraft>,
        entries: &[ConsistencyTagEntry],
    ) -> Result<AppendOutcome>;

    /// Read events matching `query`, ascending by [`SortableId`].
    async fn read(&self, query: EventQuery) -> Result<Vec<Event>>;

    /// The latest id recorded for `tag`, or `None` if the tag has no
    /// events.
    async fn latest_for_tag(&self, tag: &Tag) -> Result<Option<SortableId>>;

    /// `true` if at least one event lists `tag`.
    async fn tag_exists(&self, tag: &Tag) -> Result<bool>;
}

/// Read events matching `query` as an ordered stream.
///
/// Convenience adapter over [`EventStore::read`] for consumers that fold
/// incrementally.
///
/// # Errors
///
/// Propagates any error from the underlying read.
pub async fn read_stream(
    store: &dyn EventStore,
    query: EventQuery,
) -> Result<impl Stream<Item = Event> + Unpin + use<>> {
    let events = store.read(query).await?;
    Ok(tokio_stream::iter(events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projector::test_fixtures::{RoomEvent, room_event};

    #[test]
    fn empty_query_matches_everything() {
        let event = room_event("r-1", &RoomEvent::RoomCreated { capacity: 1 });
        assert!(EventQuery::all().matches(&event));
    }

    #[test]
    fn tag_filter_matches_on_canonical_key() {
        let event = room_event("r-1", &RoomEvent::RoomCreated { capacity: 1 });
        let same = Tag::consistency("Room", "r-1").expect("valid");
        let other = Tag::consistency("Room", "r-2").expect("valid");
        // Consistency flag does not affect matching, only the key does.
        let index_form = Tag::index("Room", "r-1").expect("valid");

        assert!(EventQuery::all().for_tag(same).matches(&event));
        assert!(EventQuery::all().for_tag(index_form).matches(&event));
        assert!(!EventQuery::all().for_tag(other).matches(&event));
    }

    #[test]
    fn id_range_is_exclusive_after_inclusive_up_to() {
        let event = room_event("r-1", &RoomEvent::RoomClosed);
        let id = event.sortable_id;

        assert!(!EventQuery::all().after(id).matches(&event), "after is exclusive");
        assert!(EventQuery::all().up_to(id).matches(&event), "up_to is inclusive");

        let earlier = SortableId::from_parts(0, 0);
        assert!(EventQuery::all().after(earlier).matches(&event));
        assert!(!EventQuery::all().up_to(earlier).matches(&event));
    }

    #[test]
    fn event_type_filter() {
        let event = room_event("r-1", &RoomEvent::RoomClosed);
        assert!(
            EventQuery::all()
                .of_types(["RoomClosed", "RoomCreated"])
                .matches(&event)
        );
        assert!(!EventQuery::all().of_types(["RoomCreated"]).matches(&event));
    }

    #[test]
    fn filters_are_conjunctive() {
        let event = room_event("r-1", &RoomEvent::RoomClosed);
        let tag = Tag::consistency("Room", "r-1").expect("valid");
        let query = EventQuery::all()
            .for_tag(tag)
            .of_types(["RoomCreated"]); // type does not match
        assert!(!query.matches(&event));
    }

    #[test]
    fn append_outcome_exposes_ids_in_order() {
        let a = room_event("r-1", &RoomEvent::RoomClosed);
        let b = room_event("r-1", &RoomEvent::RoomClosed);
        let outcome = AppendOutcome {
            tag_writes: vec![],
            duration: Duration::from_millis(1),
            events: vec![a.clone(), b.clone()],
        };
        assert_eq!(outcome.sortable_ids(), vec![a.sortable_id, b.sortable_id]);
    }
}
