//! Crate-level error types for storage, projection, and command execution.
//!
//! The core is exclusively result-returning: no panic crosses the library
//! boundary, and callers branch on the error kind. [`StoreError`] is the
//! storage/projection taxonomy; [`ExecuteError`] wraps it at the command
//! layer together with domain-specific rejections so that "the room is full"
//! and "someone got there first" stay distinguishable failure layers.

use crate::id::SortableId;

/// The result type used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors produced by the event store, state cache, projection engine, and
/// snapshot machinery.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Malformed command, tag, tenant, or event payload. Caller-fixable,
    /// never retried.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of what made the input invalid.
        message: String,
    },

    /// A referenced tag, state, or snapshot does not exist.
    #[error("not found: {resource} '{id}'")]
    NotFound {
        /// The kind of resource that was looked up.
        resource: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A consistency-tagged reservation's observed id is stale.
    ///
    /// The whole append batch was rejected and nothing was persisted. The
    /// store never retries this itself: only the caller knows whether
    /// re-evaluating its business logic against fresh state is safe.
    #[error("concurrency conflict on tag '{tag}': observed {observed:?}, actual {actual}")]
    ConcurrencyConflict {
        /// The tag whose reservation failed.
        tag: String,
        /// The id the caller observed when it read the tag (`None` means the
        /// caller believed the tag had no events yet).
        observed: Option<SortableId>,
        /// The tag's true latest id at commit time.
        actual: SortableId,
    },

    /// A storage or blob backend failed after exhausting automatic retries.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Payload bytes do not match the registered schema or projector version.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },
}

impl StoreError {
    /// Build a [`StoreError::Validation`] from a message.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Build a [`StoreError::Storage`] with no underlying cause.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Build a [`StoreError::Storage`] wrapping an underlying cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Build a [`StoreError::Serialization`] from any serde error.
    #[must_use]
    pub fn serialization(err: impl std::fmt::Display) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }

    /// `true` for [`StoreError::ConcurrencyConflict`].
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Error returned when executing a command handler fails.
///
/// Generic over `E`, the domain-specific rejection type a handler may
/// produce (e.g. "room is full").
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by domain logic. Forwards the handler's own error.
    #[error(transparent)]
    Domain(E),

    /// Storage failure or stale consistency reservation. On a conflict the
    /// caller must re-read fresh tag state and decide whether to resubmit.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl<E: std::error::Error + Send + Sync + 'static> ExecuteError<E> {
    /// `true` if the failure was a concurrency conflict rather than a
    /// domain rejection or infrastructure error.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal domain error for testing `ExecuteError<E>`.
    #[derive(Debug, thiserror::Error)]
    #[error("room is full")]
    struct RoomFull;

    #[test]
    fn validation_display_includes_message() {
        let err = StoreError::validation("tag group cannot be empty");
        assert_eq!(
            err.to_string(),
            "validation failed: tag group cannot be empty"
        );
    }

    #[test]
    fn conflict_display_names_the_tag() {
        let actual = SortableId::from_parts(1_700_000_000_000, 1);
        let err = StoreError::ConcurrencyConflict {
            tag: "Room:r-1".to_string(),
            observed: None,
            actual,
        };
        assert!(err.to_string().contains("Room:r-1"));
        assert!(err.is_conflict());
    }

    #[test]
    fn storage_with_source_preserves_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = StoreError::storage_with_source("blob write failed", io);
        assert!(err.to_string().contains("blob write failed"));
        let source = std::error::Error::source(&err).expect("source should be set");
        assert!(source.to_string().contains("reset by peer"));
    }

    #[test]
    fn execute_error_domain_displays_inner() {
        let err: ExecuteError<RoomFull> = ExecuteError::Domain(RoomFull);
        assert_eq!(err.to_string(), "room is full");
        assert!(!err.is_conflict());
    }

    #[test]
    fn execute_error_conflict_is_detectable() {
        let err: ExecuteError<RoomFull> = ExecuteError::Store(StoreError::ConcurrencyConflict {
            tag: "Room:r-1".to_string(),
            observed: None,
            actual: SortableId::from_parts(1, 0),
        });
        assert!(err.is_conflict());
    }

    #[test]
    fn not_found_display() {
        let err = StoreError::NotFound {
            resource: "snapshot",
            id: "acme/RoomList/1".to_string(),
        };
        assert_eq!(err.to_string(), "not found: snapshot 'acme/RoomList/1'");
    }

    // Verify `Send + Sync` bounds are satisfied so errors can cross task
    // boundaries over `tokio` channels.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<StoreError>();
            assert_send_sync::<ExecuteError<RoomFull>>();
        }
    };
}
