//! The global ordering key for all events.
//!
//! Every committed event carries exactly one [`SortableId`]. It is the only
//! ordering authority in the system: consistency checks, tag-state folds,
//! safe-window thresholds, and snapshot cursors all compare these ids and
//! nothing else. A `SortableId` is a ULID under the hood -- a 48-bit
//! millisecond timestamp followed by 80 bits of entropy, rendered as a
//! fixed-width 26-character Crockford base32 string -- so lexicographic
//! string comparison, numeric comparison, and chronological comparison all
//! agree.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Result, StoreError};

/// A lexicographically sortable, globally unique event ordering key.
///
/// Two ids generated in causal order compare in that same order. The string
/// form is fixed-width, so `a < b` as strings exactly when `a < b` as ids.
///
/// # Examples
///
/// ```
/// use tagfold::SortableId;
///
/// let a = SortableId::now();
/// let b = SortableId::now();
/// assert!(a.is_earlier_than_or_equal(&b));
/// assert_eq!(a.to_string().len(), 26);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SortableId(Ulid);

impl SortableId {
    /// Generate a fresh id from the current wall clock plus random entropy.
    ///
    /// Ids from a single call site are almost always strictly increasing;
    /// the store additionally enforces strict monotonicity at assignment
    /// time via [`successor`](SortableId::successor), so same-millisecond
    /// entropy ties never produce a non-advancing id.
    #[must_use]
    pub fn now() -> Self {
        Self(Ulid::new())
    }

    /// Construct an id deterministically from a timestamp and entropy value.
    ///
    /// The entropy is truncated to the ULID's 80 random bits. Useful for
    /// tests and for deriving threshold ids.
    #[must_use]
    pub fn from_parts(timestamp_ms: u64, entropy: u128) -> Self {
        Self(Ulid::from_parts(timestamp_ms, entropy))
    }

    /// The smallest id carrying the given timestamp (zero entropy).
    ///
    /// Every id generated at or after `at` compares greater than or equal to
    /// the floor, which makes it the natural encoding for a safe-window
    /// threshold derived from a point in time.
    #[must_use]
    pub fn floor(at: DateTime<Utc>) -> Self {
        let ms = u64::try_from(at.timestamp_millis().max(0)).unwrap_or(0);
        Self(Ulid::from_parts(ms, 0))
    }

    /// Extract the timestamp embedded in the id.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        let ms = self.0.timestamp_ms();
        DateTime::from_timestamp_millis(ms as i64).unwrap_or_else(Utc::now)
    }

    /// `true` if `self` sorts at or before `other`.
    #[must_use]
    pub fn is_earlier_than_or_equal(&self, other: &Self) -> bool {
        self <= other
    }

    /// `true` if `self` sorts at or after `other`.
    #[must_use]
    pub fn is_later_than_or_equal(&self, other: &Self) -> bool {
        self >= other
    }

    /// `true` if `self` sorts strictly after `other`.
    #[must_use]
    pub fn is_later_than(&self, other: &Self) -> bool {
        self > other
    }

    /// The next id in total order.
    ///
    /// Used by the store to break same-millisecond entropy ties: when a
    /// freshly generated id does not sort after the last assigned one, the
    /// store assigns `last.successor()` instead.
    #[must_use]
    pub fn successor(&self) -> Self {
        Self(Ulid(self.0.0.saturating_add(1)))
    }
}

impl fmt::Display for SortableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SortableId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| StoreError::Validation {
                message: format!("malformed sortable id '{s}': {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ids_are_nondecreasing() {
        let a = SortableId::now();
        let b = SortableId::now();
        assert!(a.is_earlier_than_or_equal(&b), "later id must not sort earlier");
    }

    #[test]
    fn string_order_matches_id_order() {
        let mut ids: Vec<SortableId> = (0..50).map(|_| SortableId::now()).collect();
        ids.push(SortableId::from_parts(0, 0));
        ids.push(SortableId::from_parts(u64::MAX >> 16, 1));

        let mut by_id = ids.clone();
        by_id.sort();
        let mut by_string = ids;
        by_string.sort_by_key(|id| id.to_string());

        assert_eq!(by_id, by_string, "lexicographic and id order must agree");
    }

    #[test]
    fn from_parts_is_deterministic() {
        let a = SortableId::from_parts(1_700_000_000_000, 42);
        let b = SortableId::from_parts(1_700_000_000_000, 42);
        assert_eq!(a, b);
    }

    #[test]
    fn timestamp_roundtrips_through_id() {
        let id = SortableId::from_parts(1_700_000_000_000, 7);
        assert_eq!(id.timestamp().timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn floor_sorts_before_any_id_of_same_or_later_millisecond() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_000).expect("valid timestamp");
        let floor = SortableId::floor(at);
        let same_ms = SortableId::from_parts(1_700_000_000_000, 12345);
        let later_ms = SortableId::from_parts(1_700_000_000_001, 0);
        assert!(floor.is_earlier_than_or_equal(&same_ms));
        assert!(floor.is_earlier_than_or_equal(&later_ms));
    }

    #[test]
    fn successor_is_strictly_later() {
        let id = SortableId::from_parts(1_700_000_000_000, 99);
        assert!(id.successor().is_later_than(&id));
    }

    #[test]
    fn successor_of_same_millisecond_tie_stays_in_millisecond() {
        let id = SortableId::from_parts(1_700_000_000_000, 99);
        let next = id.successor();
        assert_eq!(next.timestamp().timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn display_parse_roundtrip() {
        let id = SortableId::now();
        let parsed: SortableId = id.to_string().parse().expect("parse should succeed");
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_garbage_is_a_validation_error() {
        let err = "not-a-ulid!!".parse::<SortableId>().expect_err("must fail");
        assert!(
            matches!(err, StoreError::Validation { .. }),
            "expected Validation, got: {err}"
        );
    }

    #[test]
    fn serde_uses_string_form() {
        let id = SortableId::from_parts(1_700_000_000_000, 3);
        let json = serde_json::to_string(&id).expect("serialize should succeed");
        assert_eq!(json, format!("\"{id}\""));
        let back: SortableId = serde_json::from_str(&json).expect("deserialize should succeed");
        assert_eq!(back, id);
    }

    #[test]
    fn comparison_helpers_agree_with_ord() {
        let early = SortableId::from_parts(1, 0);
        let late = SortableId::from_parts(2, 0);
        assert!(early.is_earlier_than_or_equal(&late));
        assert!(early.is_earlier_than_or_equal(&early));
        assert!(late.is_later_than_or_equal(&early));
        assert!(late.is_later_than(&early));
        assert!(!early.is_later_than(&early));
    }
}
