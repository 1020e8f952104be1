//! Event encoding and the shared data types the store, cache, and
//! projection modules all depend on.
//!
//! Nothing here performs I/O. An [`EventDraft`] is what callers hand to the
//! store; an [`Event`] is what the store hands back once a
//! [`SortableId`] and timestamp have been assigned at commit time. Events
//! are immutable records: created once at append, never mutated or deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::id::SortableId;
use crate::tag::Tag;

/// An event as committed to the store.
///
/// The `payload` is opaque to the store itself: a JSON value tagged by
/// `event_type`. Projectors interpret the pair; the store only orders,
/// indexes, and replays it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id, assigned by the caller at draft time.
    pub id: Uuid,
    /// The global ordering key, assigned by the store at commit time.
    pub sortable_id: SortableId,
    /// Event type tag (e.g. `"StudentEnrolled"`).
    pub event_type: String,
    /// Opaque, type-tagged payload.
    pub payload: serde_json::Value,
    /// Ordered list of tags this event is associated with.
    pub tags: Vec<Tag>,
    /// Server-side commit timestamp. Never used for ordering decisions;
    /// [`Event::sortable_id`] is the only ordering authority.
    pub recorded_at: DateTime<Utc>,
    /// Id of the message that caused this event, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// Correlation id threading a request across boundaries, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Principal that executed the originating command, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_by: Option<String>,
}

impl Event {
    /// `true` if this event lists a tag with the given index key.
    #[must_use]
    pub fn has_tag_key(&self, key: &str) -> bool {
        self.tags.iter().any(|t| t.key() == key)
    }
}

/// An event as submitted for append, before the store has assigned its
/// [`SortableId`] and commit timestamp.
#[derive(Debug, Clone)]
pub struct EventDraft {
    /// Freshly generated event id.
    pub id: Uuid,
    /// Event type tag.
    pub event_type: String,
    /// Opaque payload.
    pub payload: serde_json::Value,
    /// Tags to index this event under.
    pub tags: Vec<Tag>,
    /// Causation id to stamp on the committed event.
    pub causation_id: Option<String>,
    /// Correlation id to stamp on the committed event.
    pub correlation_id: Option<String>,
    /// Executing principal to stamp on the committed event.
    pub executed_by: Option<String>,
}

impl EventDraft {
    /// Create a draft from an already-split type/payload pair.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] if `event_type` is empty or no
    /// tags are given -- an untagged event would be unreachable by every
    /// fold in the system.
    pub fn new(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        tags: Vec<Tag>,
    ) -> Result<Self> {
        let event_type = event_type.into();
        if event_type.is_empty() {
            return Err(StoreError::validation("event type cannot be empty"));
        }
        if tags.is_empty() {
            return Err(StoreError::validation(
                "an event must list at least one tag",
            ));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            event_type,
            payload,
            tags,
            causation_id: None,
            correlation_id: None,
            executed_by: None,
        })
    }

    /// Encode an adjacently-tagged domain event enum into a draft.
    ///
    /// The domain event must use `#[serde(tag = "type", content = "data")]`.
    /// The `"type"` field becomes [`EventDraft::event_type`] and the `"data"`
    /// field (absent for unit variants, defaulting to `null`) becomes the
    /// payload.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the event cannot be
    /// serialized or does not follow the adjacently-tagged convention, and
    /// [`StoreError::Validation`] if `tags` is empty.
    pub fn from_domain<E: Serialize>(event: &E, tags: Vec<Tag>) -> Result<Self> {
        let value = serde_json::to_value(event).map_err(StoreError::serialization)?;
        let obj = value.as_object().ok_or_else(|| {
            StoreError::serialization("domain event must serialize to a JSON object")
        })?;
        let event_type = obj
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                StoreError::serialization(
                    "domain event must carry a string 'type' field (adjacently tagged serde)",
                )
            })?
            .to_string();
        let payload = obj.get("data").cloned().unwrap_or(serde_json::Value::Null);
        Self::new(event_type, payload, tags)
    }

    /// Attempt the inverse of [`from_domain`](EventDraft::from_domain) on a
    /// committed event: reconstruct the tagged JSON object and deserialize
    /// it as `E`. Returns `None` for unknown or malformed event types, so
    /// folds can skip them for forward compatibility.
    #[must_use]
    pub fn decode_domain<E: serde::de::DeserializeOwned>(event: &Event) -> Option<E> {
        let tagged = if event.payload.is_null() {
            serde_json::json!({ "type": event.event_type })
        } else {
            serde_json::json!({ "type": event.event_type, "data": event.payload })
        };
        serde_json::from_value(tagged).ok()
    }
}

/// A client-declared `(tag, last observed id)` pair submitted with an
/// append: the basis of optimistic concurrency.
///
/// `last_seen = None` asserts "I observed this tag with no events". If the
/// tag's true latest id at commit time is strictly later than `last_seen`
/// (any event at all, in the `None` case), the whole append is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyTagEntry {
    /// The consistency tag being reserved.
    pub tag: Tag,
    /// The latest id the caller observed for this tag, or `None` if the tag
    /// had no events when observed.
    pub last_seen: Option<SortableId>,
}

impl ConsistencyTagEntry {
    /// Build an entry for a tag observed at `last_seen`.
    #[must_use]
    pub fn new(tag: Tag, last_seen: Option<SortableId>) -> Self {
        Self { tag, last_seen }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Domain events in the adjacently-tagged convention used throughout
    /// this crate.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    enum RoomEvent {
        RoomCreated { capacity: u32 },
        StudentEnrolled { student_id: String },
        RoomClosed,
    }

    fn room_tag() -> Tag {
        Tag::consistency("Room", "r-1").expect("valid tag")
    }

    #[test]
    fn from_domain_extracts_type_and_data() {
        let draft = EventDraft::from_domain(
            &RoomEvent::StudentEnrolled {
                student_id: "s-1".to_string(),
            },
            vec![room_tag()],
        )
        .expect("encode should succeed");

        assert_eq!(draft.event_type, "StudentEnrolled");
        assert_eq!(draft.payload["student_id"], "s-1");
    }

    #[test]
    fn from_domain_unit_variant_has_null_payload() {
        let draft =
            EventDraft::from_domain(&RoomEvent::RoomClosed, vec![room_tag()]).expect("encode");
        assert_eq!(draft.event_type, "RoomClosed");
        assert!(draft.payload.is_null());
    }

    #[test]
    fn from_domain_rejects_empty_tag_list() {
        let err = EventDraft::from_domain(&RoomEvent::RoomClosed, vec![]).expect_err("must fail");
        assert!(matches!(err, StoreError::Validation { .. }));
    }

    #[test]
    fn new_rejects_empty_event_type() {
        let err = EventDraft::new("", serde_json::Value::Null, vec![room_tag()])
            .expect_err("must fail");
        assert!(matches!(err, StoreError::Validation { .. }));
    }

    #[test]
    fn drafts_get_fresh_v4_ids() {
        let a = EventDraft::new("X", serde_json::Value::Null, vec![room_tag()]).expect("draft");
        let b = EventDraft::new("X", serde_json::Value::Null, vec![room_tag()]).expect("draft");
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.get_version(), Some(uuid::Version::Random));
    }

    fn committed(draft: EventDraft) -> Event {
        Event {
            id: draft.id,
            sortable_id: SortableId::now(),
            event_type: draft.event_type,
            payload: draft.payload,
            tags: draft.tags,
            recorded_at: Utc::now(),
            causation_id: draft.causation_id,
            correlation_id: draft.correlation_id,
            executed_by: draft.executed_by,
        }
    }

    #[test]
    fn decode_domain_roundtrips_data_variant() {
        let original = RoomEvent::RoomCreated { capacity: 30 };
        let draft = EventDraft::from_domain(&original, vec![room_tag()]).expect("encode");
        let event = committed(draft);

        let decoded: RoomEvent = EventDraft::decode_domain(&event).expect("decode should succeed");
        assert_eq!(decoded, original);
    }

    #[test]
    fn decode_domain_roundtrips_unit_variant() {
        let draft = EventDraft::from_domain(&RoomEvent::RoomClosed, vec![room_tag()])
            .expect("encode");
        let event = committed(draft);
        let decoded: RoomEvent = EventDraft::decode_domain(&event).expect("decode");
        assert_eq!(decoded, RoomEvent::RoomClosed);
    }

    #[test]
    fn decode_domain_unknown_type_returns_none() {
        let draft = EventDraft::new("SomebodyElsesEvent", serde_json::json!({}), vec![room_tag()])
            .expect("draft");
        let event = committed(draft);
        let decoded: Option<RoomEvent> = EventDraft::decode_domain(&event);
        assert!(decoded.is_none(), "unknown event types must decode to None");
    }

    #[test]
    fn event_serde_omits_absent_metadata() {
        let draft = EventDraft::from_domain(&RoomEvent::RoomClosed, vec![room_tag()])
            .expect("encode");
        let event = committed(draft);
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(!json.contains("causation_id"));
        assert!(!json.contains("executed_by"));
    }

    #[test]
    fn has_tag_key_matches_canonical_form() {
        let draft = EventDraft::from_domain(&RoomEvent::RoomClosed, vec![room_tag()])
            .expect("encode");
        let event = committed(draft);
        assert!(event.has_tag_key("Room:r-1"));
        assert!(!event.has_tag_key("Room:r-2"));
    }
}
