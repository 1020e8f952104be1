//! Multi-projections: read models folded across many tags at once.
//!
//! A [`MultiProjection`] consumes the whole event stream rather than a
//! single tag's history. Because events near the present may still be
//! contested (a later conflict check could have admitted a racing writer
//! milliseconds earlier on another node), every multi-projection is kept in
//! two parallel folds by [`DualProjection`]: the **unsafe** state applies
//! every event immediately, while the **safe** state applies only events at
//! or below a monotonically advancing safe-window threshold. Events above
//! the threshold wait in an ordered buffer and are promoted, in id order,
//! as the threshold advances. The safe applied-set is always a prefix of
//! the unsafe applied-set.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::id::SortableId;
use crate::projector::{TagProjector, TagState};

/// A read model folded over the full, ordered event stream.
///
/// `apply` must be deterministic, and total over event types: unknown
/// events are ignored, never an error. Instances are cloned to serve
/// queries, so state should be cheap to clone.
pub trait MultiProjection: Clone + Send + Sync + 'static {
    /// Stable name, used as the snapshot key.
    fn name(&self) -> &str;

    /// Schema version; bumping it invalidates persisted snapshots.
    fn version(&self) -> &str;

    /// Fold one event into the state.
    fn apply(&mut self, event: &Event);
}

/// Parallel safe/unsafe folds of one [`MultiProjection`].
#[derive(Debug, Clone)]
pub struct DualProjection<P: MultiProjection> {
    unsafe_state: P,
    safe_state: P,
    /// Ids at or below this are settled; `None` means nothing is yet.
    threshold: Option<SortableId>,
    /// Events past the threshold, waiting in id order for promotion.
    pending: BTreeMap<SortableId, Event>,
    events_processed: u64,
    last_applied: Option<SortableId>,
    safe_last_applied: Option<SortableId>,
}

impl<P: MultiProjection> DualProjection<P> {
    /// Start both folds from `initial`.
    #[must_use]
    pub fn new(initial: P) -> Self {
        Self {
            safe_state: initial.clone(),
            unsafe_state: initial,
            threshold: None,
            pending: BTreeMap::new(),
            events_processed: 0,
            last_applied: None,
            safe_last_applied: None,
        }
    }

    /// Resume both folds from a persisted safe state.
    ///
    /// A snapshot stores the safe fold at its cursor; events after the
    /// cursor are replayed through [`ingest`](Self::ingest), and the
    /// threshold decides when they settle again.
    #[must_use]
    pub fn restored(
        state: P,
        cursor: Option<SortableId>,
        threshold: Option<SortableId>,
        events_processed: u64,
    ) -> Self {
        Self {
            safe_state: state.clone(),
            unsafe_state: state,
            threshold,
            pending: BTreeMap::new(),
            events_processed,
            last_applied: cursor,
            safe_last_applied: cursor,
        }
    }

    /// Fold `event` into the unsafe state, and into the safe state if its
    /// id is at or below the current threshold.
    ///
    /// Events at or before the last applied id are ignored, so re-feeding
    /// an overlapping catch-up batch cannot double-apply.
    pub fn ingest(&mut self, event: &Event) {
        let id = event.sortable_id;
        if let Some(last) = self.last_applied
            && !id.is_later_than(&last)
        {
            return;
        }

        self.unsafe_state.apply(event);
        self.last_applied = Some(id);
        self.events_processed += 1;

        let settled = self
            .threshold
            .is_some_and(|t| id.is_earlier_than_or_equal(&t));
        if settled {
            self.safe_state.apply(event);
            self.safe_last_applied = Some(id);
        } else {
            self.pending.insert(id, event.clone());
        }
    }

    /// Advance the safe-window threshold, promoting every buffered event at
    /// or below it into the safe fold, in id order.
    ///
    /// The threshold only moves forward; a `threshold` at or below the
    /// current one is ignored.
    pub fn advance_threshold(&mut self, threshold: SortableId) {
        if let Some(current) = self.threshold
            && !threshold.is_later_than(&current)
        {
            return;
        }
        self.threshold = Some(threshold);

        // Everything strictly above the threshold stays buffered.
        let still_pending = self.pending.split_off(&threshold.successor());
        let promoted = std::mem::replace(&mut self.pending, still_pending);
        let count = promoted.len();
        for (id, event) in promoted {
            self.safe_state.apply(&event);
            self.safe_last_applied = Some(id);
        }
        if count > 0 {
            tracing::debug!(
                projection = self.unsafe_state.name(),
                promoted = count,
                threshold = %threshold,
                "promoted buffered events into the safe fold"
            );
        }
    }

    /// The fold that has seen every ingested event.
    #[must_use]
    pub fn unsafe_state(&self) -> &P {
        &self.unsafe_state
    }

    /// The fold restricted to settled events.
    #[must_use]
    pub fn safe_state(&self) -> &P {
        &self.safe_state
    }

    /// Current safe-window threshold.
    #[must_use]
    pub fn threshold(&self) -> Option<SortableId> {
        self.threshold
    }

    /// Total events ingested (unsafe fold length).
    #[must_use]
    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    /// Cursor of the unsafe fold.
    #[must_use]
    pub fn last_applied(&self) -> Option<SortableId> {
        self.last_applied
    }

    /// Cursor of the safe fold.
    #[must_use]
    pub fn safe_last_applied(&self) -> Option<SortableId> {
        self.safe_last_applied
    }

    /// Number of events buffered above the threshold.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Folds a [`TagProjector`] across every tag instance of one group,
/// yielding `tag content -> TagState`.
///
/// This gives list-style queries ("all rooms and their states") without a
/// bespoke multi-projection per projector: the same pure per-tag fold is
/// reused, keyed by tag content.
#[derive(Serialize, Deserialize)]
#[serde(bound(
    serialize = "P::State: Serialize",
    deserialize = "P::State: DeserializeOwned"
))]
pub struct TagListProjection<P: TagProjector> {
    group: String,
    states: HashMap<String, TagState<P::State>>,
}

impl<P: TagProjector> TagListProjection<P> {
    /// Track every tag of `group` under projector `P`.
    #[must_use]
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            states: HashMap::new(),
        }
    }

    /// The state of one tag content, if any of its events have been seen.
    #[must_use]
    pub fn get(&self, content: &str) -> Option<&TagState<P::State>> {
        self.states.get(content)
    }

    /// Iterate `(content, state)` pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TagState<P::State>)> {
        self.states.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of distinct tag contents seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// `true` if no tag of the group has been seen.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl<P: TagProjector> Clone for TagListProjection<P> {
    fn clone(&self) -> Self {
        Self {
            group: self.group.clone(),
            states: self.states.clone(),
        }
    }
}

impl<P: TagProjector> MultiProjection for TagListProjection<P> {
    fn name(&self) -> &str {
        P::NAME
    }

    fn version(&self) -> &str {
        P::VERSION
    }

    fn apply(&mut self, event: &Event) {
        for tag in &event.tags {
            if tag.group() != self.group {
                continue;
            }
            let state = self
                .states
                .remove(tag.content())
                .unwrap_or_else(TagState::initial::<P>);
            self.states
                .insert(tag.content().to_string(), state.apply::<P>(event));
        }
    }
}

/// Decides where the safe-window threshold sits at a given instant.
pub trait SafeWindowPolicy: Send + Sync {
    /// The threshold id for time `now`.
    fn threshold(&self, now: DateTime<Utc>) -> SortableId;
}

/// Threshold trails the current time by a fixed offset: an event is
/// settled once it is older than the offset.
#[derive(Debug, Clone)]
pub struct TrailingOffsetPolicy {
    offset: chrono::Duration,
}

impl TrailingOffsetPolicy {
    /// Trail `now` by `offset`.
    #[must_use]
    pub fn new(offset: chrono::Duration) -> Self {
        Self { offset }
    }
}

impl Default for TrailingOffsetPolicy {
    /// A 20-second window, generous for clock skew between writers.
    fn default() -> Self {
        Self::new(chrono::Duration::seconds(20))
    }
}

impl SafeWindowPolicy for TrailingOffsetPolicy {
    fn threshold(&self, now: DateTime<Utc>) -> SortableId {
        SortableId::floor(now - self.offset)
    }
}

/// Cadence for persisting multi-projection snapshots.
///
/// Either criterion triggers; with neither set, snapshots never trigger.
#[derive(Debug, Clone, Default)]
pub struct SnapshotPolicy {
    event_interval: Option<u64>,
    time_interval: Option<Duration>,
}

impl SnapshotPolicy {
    /// Never snapshot.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Snapshot after every `n` events.
    #[must_use]
    pub fn with_event_interval(mut self, n: u64) -> Self {
        self.event_interval = Some(n);
        self
    }

    /// Snapshot once `interval` has elapsed since the last one.
    #[must_use]
    pub fn with_time_interval(mut self, interval: Duration) -> Self {
        self.time_interval = Some(interval);
        self
    }

    /// `true` if either cadence criterion is due.
    #[must_use]
    pub fn should_snapshot(&self, events_since_last: u64, elapsed: Duration) -> bool {
        if let Some(n) = self.event_interval
            && events_since_last >= n
        {
            return true;
        }
        if let Some(interval) = self.time_interval
            && elapsed >= interval
        {
            return true;
        }
        false
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use serde::{Deserialize, Serialize};

    use super::MultiProjection;
    use crate::event::Event;

    /// Counts events per type; the simplest useful multi-projection.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct EventTally {
        pub total: u64,
        pub enrolled: u64,
    }

    impl MultiProjection for EventTally {
        fn name(&self) -> &str {
            "EventTally"
        }

        fn version(&self) -> &str {
            "1"
        }

        fn apply(&mut self, event: &Event) {
            self.total += 1;
            if event.event_type == "StudentEnrolled" {
                self.enrolled += 1;
            }
        }
    }
}
