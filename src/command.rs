//! Command execution context: read tag state, decide, append with a
//! consistency reservation.
//!
//! A [`CommandContext`] is created per command. Reads through
//! [`get_state`](CommandContext::get_state) and
//! [`latest_for_tag`](CommandContext::latest_for_tag) automatically record
//! a consistency reservation for every consistency tag they touch;
//! [`append`](CommandContext::append) buffers drafts; and
//! [`commit`](CommandContext::commit) submits the whole batch atomically
//! under those reservations. Handlers are pure decision functions of
//! `(command, context)`: the context hides all store wiring.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::cache::TagStateCache;
use crate::error::{ExecuteError, Result};
use crate::event::{ConsistencyTagEntry, Event, EventDraft};
use crate::eventstore::{EventStore, TagWriteResult};
use crate::id::SortableId;
use crate::projector::{TagProjector, TagState};
use crate::tag::Tag;

/// Cross-cutting metadata stamped onto every event a command appends.
///
/// # Examples
///
/// ```
/// use tagfold::CommandMetadata;
///
/// let meta = CommandMetadata::default()
///     .with_executed_by("user-42")
///     .with_correlation_id("req-abc-123");
/// assert_eq!(meta.executed_by.as_deref(), Some("user-42"));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandMetadata {
    /// Principal executing the command (e.g. a user id).
    pub executed_by: Option<String>,
    /// Correlation id for tracing a request across boundaries.
    pub correlation_id: Option<String>,
    /// Id of the message that caused this command, if any.
    pub causation_id: Option<String>,
}

impl CommandMetadata {
    /// Set the executing principal.
    #[must_use]
    pub fn with_executed_by(mut self, principal: impl Into<String>) -> Self {
        self.executed_by = Some(principal.into());
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the causation id.
    #[must_use]
    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }
}

/// The success envelope of a committed command.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    /// The committed events, with store-assigned ids.
    pub events: Vec<Event>,
    /// One entry per (event, tag) pair written.
    pub tag_writes: Vec<TagWriteResult>,
    /// Wall time of the append, zero when the command produced no events.
    pub duration: std::time::Duration,
}

impl CommandResponse {
    /// The assigned [`SortableId`]s, in commit order.
    #[must_use]
    pub fn sortable_ids(&self) -> Vec<SortableId> {
        self.events.iter().map(|e| e.sortable_id).collect()
    }

    /// `true` if the command committed no events (a valid no-op outcome).
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.events.is_empty()
    }
}

/// Per-command orchestration: reads record reservations, appends buffer
/// drafts, commit submits both atomically.
pub struct CommandContext {
    store: Arc<dyn EventStore>,
    cache: TagStateCache,
    metadata: CommandMetadata,
    reservations: Mutex<Vec<ConsistencyTagEntry>>,
    drafts: Mutex<Vec<EventDraft>>,
}

impl CommandContext {
    /// Create a context over `store`, reading states through `cache`.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, cache: TagStateCache, metadata: CommandMetadata) -> Self {
        Self {
            store,
            cache,
            metadata,
            reservations: Mutex::new(Vec::new()),
            drafts: Mutex::new(Vec::new()),
        }
    }

    /// Current state of `tag` under projector `P`.
    ///
    /// If `tag` is a consistency tag, the observed cursor is recorded as a
    /// reservation for the eventual commit. The first observation of a tag
    /// wins; re-reading the same tag does not move the reservation.
    ///
    /// # Errors
    ///
    /// Propagates store read failures.
    pub async fn get_state<P: TagProjector>(&self, tag: &Tag) -> Result<TagState<P::State>> {
        let state = self.cache.get_state::<P>(tag).await?;
        self.reserve(tag, state.last_sorted_id).await;
        Ok(state)
    }

    /// The latest [`SortableId`] recorded for `tag`, recording a
    /// reservation if `tag` is a consistency tag.
    ///
    /// # Errors
    ///
    /// Propagates store read failures.
    pub async fn latest_for_tag(&self, tag: &Tag) -> Result<Option<SortableId>> {
        let latest = self.store.latest_for_tag(tag).await?;
        self.reserve(tag, latest).await;
        Ok(latest)
    }

    /// `true` if at least one event lists `tag`. Does not reserve.
    ///
    /// # Errors
    ///
    /// Propagates store read failures.
    pub async fn tag_exists(&self, tag: &Tag) -> Result<bool> {
        self.store.tag_exists(tag).await
    }

    /// Buffer a domain event for the commit, stamped with this command's
    /// metadata.
    ///
    /// # Errors
    ///
    /// Returns the encoding errors of [`EventDraft::from_domain`].
    pub async fn append<E: Serialize>(&self, event: &E, tags: Vec<Tag>) -> Result<()> {
        let mut draft = EventDraft::from_domain(event, tags)?;
        draft.executed_by = self.metadata.executed_by.clone();
        draft.correlation_id = self.metadata.correlation_id.clone();
        draft.causation_id = self.metadata.causation_id.clone();
        self.drafts.lock().await.push(draft);
        Ok(())
    }

    /// Submit every buffered draft under every recorded reservation, in one
    /// atomic append.
    ///
    /// A command that buffered nothing commits as a no-op without touching
    /// the store. On success, cache entries for every touched tag are
    /// invalidated.
    ///
    /// # Errors
    ///
    /// Surfaces [`StoreError::ConcurrencyConflict`](crate::StoreError::ConcurrencyConflict)
    /// unchanged -- the store never retries it, and neither does the
    /// context.
    pub async fn commit(&self) -> Result<CommandResponse> {
        let drafts: Vec<EventDraft> = self.drafts.lock().await.drain(..).collect();
        let reservations: Vec<ConsistencyTagEntry> =
            self.reservations.lock().await.drain(..).collect();

        if drafts.is_empty() {
            return Ok(CommandResponse {
                events: Vec::new(),
                tag_writes: Vec::new(),
                duration: std::time::Duration::ZERO,
            });
        }

        let touched: Vec<Tag> = drafts.iter().flat_map(|d| d.tags.clone()).collect();
        let outcome = self.store.append(drafts, &reservations).await?;

        for tag in &touched {
            self.cache.invalidate(tag).await;
        }

        Ok(CommandResponse {
            events: outcome.events,
            tag_writes: outcome.tag_writes,
            duration: outcome.duration,
        })
    }

    async fn reserve(&self, tag: &Tag, observed: Option<SortableId>) {
        if !tag.is_consistency_tag() {
            return;
        }
        let mut reservations = self.reservations.lock().await;
        if reservations.iter().any(|r| r.tag.key() == tag.key()) {
            return;
        }
        reservations.push(ConsistencyTagEntry::new(tag.clone(), observed));
    }
}

/// Run a command handler against a fresh context, then commit.
///
/// The handler receives the context by value and returns it; domain
/// rejections (`ExecuteError::Domain`) abort before anything is appended,
/// keeping "the room is full" distinct from "someone got there first".
///
/// # Errors
///
/// - [`ExecuteError::Domain`] when the handler rejects the command.
/// - [`ExecuteError::Store`] for read failures, conflicts, or storage
///   errors during commit.
pub async fn execute<E, F, Fut>(
    ctx: CommandContext,
    handler: F,
) -> std::result::Result<CommandResponse, ExecuteError<E>>
where
    E: std::error::Error + Send + Sync + 'static,
    F: FnOnce(CommandContext) -> Fut,
    Fut: Future<Output = std::result::Result<CommandContext, ExecuteError<E>>>,
{
    let ctx = handler(ctx).await?;
    ctx.commit().await.map_err(ExecuteError::from)
}
