//! Tag projectors: pure, deterministic per-tag state folds.
//!
//! A [`TagProjector`] turns the ordered event history of one tag into a
//! state payload. Projectors are invoked without an instance -- the trait
//! has only associated items -- and are additionally reachable through a
//! runtime [`ProjectorRegistry`] that maps `(name, version)` strings to a
//! type-erased fold over JSON payloads, for callers that only know the
//! projector by name (snapshot restore, generic tag-list projections).
//!
//! # Contract
//!
//! - [`project`](TagProjector::project) is pure and total: same
//!   `(state, event)` in, same state out, every time. No clocks, no
//!   randomness, no external reads.
//! - Event types the projector does not recognize must return the state
//!   unchanged -- never an error. Malformed events are rejected earlier, at
//!   append time.
//! - `VERSION` is bumped on any incompatible payload or logic change; a
//!   bump forces a full rebuild instead of incremental replay.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::event::Event;
use crate::id::SortableId;

/// A deterministic fold from a tag's event history to a state payload.
pub trait TagProjector: Send + Sync + 'static {
    /// Projector name, e.g. `"RoomProjector"`. Part of the cache and
    /// snapshot key.
    const NAME: &'static str;

    /// Projector version string. Bump on incompatible changes.
    const VERSION: &'static str;

    /// The state payload. `Default` is the well-defined "empty" variant the
    /// fold starts from.
    type State: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Apply one event to the current payload, returning the next payload.
    ///
    /// Must return the input unchanged for event types it does not
    /// recognize.
    fn project(state: Self::State, event: &Event) -> Self::State;
}

/// The materialized fold result for one tag.
///
/// `version` counts applied events; `last_sorted_id` is the cursor an
/// incremental rebuild resumes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "S: Serialize", deserialize = "S: DeserializeOwned"))]
pub struct TagState<S> {
    /// The folded state payload.
    pub payload: S,
    /// Number of events applied to produce `payload`.
    pub version: u64,
    /// The [`SortableId`] of the last applied event, or `None` if no events
    /// have been folded yet.
    pub last_sorted_id: Option<SortableId>,
    /// Name of the projector that produced this state.
    pub projector_name: String,
    /// Version of the projector that produced this state.
    pub projector_version: String,
}

impl<S> TagState<S> {
    /// The empty state a fold starts from: zero events applied, no cursor.
    #[must_use]
    pub fn initial<P: TagProjector<State = S>>() -> Self
    where
        S: Default,
    {
        Self {
            payload: S::default(),
            version: 0,
            last_sorted_id: None,
            projector_name: P::NAME.to_string(),
            projector_version: P::VERSION.to_string(),
        }
    }

    /// Fold one event on top of this state, advancing version and cursor.
    #[must_use]
    pub fn apply<P: TagProjector<State = S>>(self, event: &Event) -> Self {
        Self {
            payload: P::project(self.payload, event),
            version: self.version + 1,
            last_sorted_id: Some(event.sortable_id),
            projector_name: self.projector_name,
            projector_version: self.projector_version,
        }
    }
}

/// A type-erased projector resolved from the registry by name.
///
/// Folds over `serde_json::Value` payloads so callers that only know the
/// projector's name and version can still drive the fold.
#[derive(Clone)]
pub struct ErasedProjector {
    name: &'static str,
    version: &'static str,
    initial: Arc<dyn Fn() -> Result<serde_json::Value> + Send + Sync>,
    apply: Arc<dyn Fn(serde_json::Value, &Event) -> Result<serde_json::Value> + Send + Sync>,
}

impl ErasedProjector {
    fn of<P: TagProjector>() -> Self {
        Self {
            name: P::NAME,
            version: P::VERSION,
            initial: Arc::new(|| {
                serde_json::to_value(P::State::default()).map_err(StoreError::serialization)
            }),
            apply: Arc::new(|value, event| {
                let state: P::State = serde_json::from_value(value).map_err(|e| {
                    StoreError::Serialization {
                        message: format!(
                            "payload does not match projector {}@{}: {e}",
                            P::NAME,
                            P::VERSION
                        ),
                    }
                })?;
                serde_json::to_value(P::project(state, event)).map_err(StoreError::serialization)
            }),
        }
    }

    /// The projector's registered name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The projector's registered version.
    #[must_use]
    pub fn version(&self) -> &'static str {
        self.version
    }

    /// The projector's empty payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the default state cannot be
    /// represented as JSON (effectively unreachable for well-formed states).
    pub fn initial(&self) -> Result<serde_json::Value> {
        (self.initial)()
    }

    /// Apply one event to a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the payload does not match
    /// the projector's state schema.
    pub fn apply(&self, state: serde_json::Value, event: &Event) -> Result<serde_json::Value> {
        (self.apply)(state, event)
    }
}

/// Runtime lookup of projectors by `(name, version)`.
///
/// The Rust rendition of "invoke a projector type without an instance":
/// concrete types register themselves once, and string-keyed resolution
/// replaces static generic dispatch wherever the projector is only known
/// by name.
#[derive(Default, Clone)]
pub struct ProjectorRegistry {
    entries: HashMap<(&'static str, &'static str), ErasedProjector>,
}

impl ProjectorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `P`. Re-registering the same `(name, version)` replaces the
    /// previous entry.
    pub fn register<P: TagProjector>(&mut self) {
        self.entries
            .insert((P::NAME, P::VERSION), ErasedProjector::of::<P>());
    }

    /// Resolve a projector by name and version.
    #[must_use]
    pub fn resolve(&self, name: &str, version: &str) -> Option<&ErasedProjector> {
        self.entries
            .iter()
            .find_map(|(&(n, v), p)| (n == name && v == version).then_some(p))
    }

    /// Number of registered projectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
