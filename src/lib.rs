//! Event sourcing with dynamic consistency boundaries: events carry tags,
//! and each append declares which tags it must be consistent with.

mod blob;
pub use blob::{BlobStore, MemoryBlobStore, with_retry};
mod cache;
pub use cache::TagStateCache;
mod command;
pub use command::{CommandContext, CommandMetadata, CommandResponse, execute};
mod compress;
pub use compress::{BufferPool, Compressor};
mod error;
pub use error::{ExecuteError, Result, StoreError};
mod event;
pub use event::{ConsistencyTagEntry, Event, EventDraft};
mod eventstore;
pub use eventstore::{AppendOutcome, EventQuery, EventStore, TagWriteResult, read_stream};
mod id;
pub use id::SortableId;
mod memory;
pub use memory::{MemoryEventStore, ScopedEventStore};
mod multi;
pub use multi::{
    DualProjection, MultiProjection, SafeWindowPolicy, SnapshotPolicy, TagListProjection,
    TrailingOffsetPolicy,
};
mod projector;
pub use projector::{ErasedProjector, ProjectorRegistry, TagProjector, TagState};
mod snapshot;
pub use snapshot::{
    DEFAULT_INLINE_LIMIT, JsonGzipSerializer, MemorySnapshotRepository,
    MultiProjectionStateRecord, PayloadSlot, SerializedState, SnapshotOffloader,
    SnapshotRepository, SnapshotSerializer,
};
mod store;
pub use store::{ProjectionStates, TagStore, TagStoreBuilder};
mod tag;
pub use tag::Tag;
mod tenant;
pub use tenant::TenantId;
