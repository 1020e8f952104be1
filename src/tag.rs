//! Tags: the consistency and query boundaries events attach to.
//!
//! A tag is a `(group, content)` pair -- `"Room"` + `"r-1"`,
//! `"RoomDailyActivity"` + `"r-1/2026-08-27"` -- identifying a boundary one
//! or more events can reference. Tags are never stored as entities; the
//! store keeps only index rows linking a tag string to an event id and its
//! [`SortableId`](crate::SortableId). Whether a tag participates in
//! consistency checks is the caller's choice per tag instance: two
//! otherwise-unrelated entities can be kept mutually consistent for one
//! transaction simply by sharing a consistency tag.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// A consistency/query boundary key.
///
/// # Examples
///
/// ```
/// use tagfold::Tag;
///
/// let room = Tag::consistency("Room", "r-1").unwrap();
/// assert!(room.is_consistency_tag());
/// assert_eq!(room.key(), "Room:r-1");
///
/// let activity = Tag::index("RoomDailyActivity", "r-1/2026-08-27").unwrap();
/// assert!(!activity.is_consistency_tag());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    group: String,
    content: String,
    is_consistency: bool,
}

impl Tag {
    /// Create a tag that participates in consistency checks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] if either part is empty or the
    /// group contains the `:` separator.
    pub fn consistency(group: impl Into<String>, content: impl Into<String>) -> Result<Self> {
        Self::build(group.into(), content.into(), true)
    }

    /// Create an index-only tag: it is written to the tag index like any
    /// other, but never checked during append.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] under the same rules as
    /// [`Tag::consistency`].
    pub fn index(group: impl Into<String>, content: impl Into<String>) -> Result<Self> {
        Self::build(group.into(), content.into(), false)
    }

    fn build(group: String, content: String, is_consistency: bool) -> Result<Self> {
        if group.is_empty() {
            return Err(StoreError::validation("tag group cannot be empty"));
        }
        if content.is_empty() {
            return Err(StoreError::validation("tag content cannot be empty"));
        }
        if group.contains(':') {
            return Err(StoreError::validation(format!(
                "tag group '{group}' must not contain ':'"
            )));
        }
        Ok(Self {
            group,
            content,
            is_consistency,
        })
    }

    /// The tag's group (e.g. `"Room"`).
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The tag's content (e.g. `"r-1"`).
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Whether this tag participates in consistency checks at append time.
    #[must_use]
    pub fn is_consistency_tag(&self) -> bool {
        self.is_consistency
    }

    /// Canonical string form, `group:content`. This is the tag-index key
    /// (tenant prefix excluded).
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.group, self.content)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.content)
    }
}
