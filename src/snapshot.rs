//! Snapshot persistence for multi-projection state.
//!
//! A multi-projection's safe state is periodically serialized (JSON +
//! gzip), placed either inline in its [`MultiProjectionStateRecord`] or --
//! above a size limit -- offloaded to a [`BlobStore`] with only a pointer
//! kept in the record, and saved to a [`SnapshotRepository`] keyed by
//! `(tenant, projector name, projector version)`. Later snapshots
//! supersede earlier ones; readers dereference offloaded payloads
//! transparently.
//!
//! Snapshots are an optimization, never the source of truth: a missing,
//! corrupt, or version-mismatched record degrades to replaying the event
//! log from the start.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::blob::{BlobStore, with_retry};
use crate::compress::Compressor;
use crate::error::{Result, StoreError};
use crate::id::SortableId;
use crate::tenant::TenantId;

/// Default cutover from inline to offloaded payloads, in bytes.
pub const DEFAULT_INLINE_LIMIT: usize = 64 * 1024;

/// Persisted snapshot of one multi-projection's safe state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiProjectionStateRecord {
    /// Tenant the state belongs to.
    pub tenant: TenantId,
    /// Multi-projection name; part of the repository key.
    pub projector_name: String,
    /// Multi-projection version; part of the repository key. A version
    /// bump strands old records, forcing a full rebuild.
    pub projector_version: String,
    /// Concrete payload type name, for diagnostics and schema checks.
    pub payload_type: String,
    /// Cursor of the safe fold at snapshot time; replay resumes after it.
    pub last_sortable_id: Option<SortableId>,
    /// Safe-window threshold at snapshot time.
    pub safe_window_threshold: Option<SortableId>,
    /// Events folded into the state.
    pub events_processed: u64,
    /// `true` when the payload lives in the blob store, not inline.
    pub is_offloaded: bool,
    /// Compressed payload bytes, present only when not offloaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_payload: Option<Vec<u8>>,
    /// Blob key of the offloaded payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offload_key: Option<String>,
    /// Name of the blob provider holding the offloaded payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offload_provider: Option<String>,
    /// Payload size before compression.
    pub original_size: u64,
    /// Payload size after compression.
    pub compressed_size: u64,
    /// Identifier of the process build that wrote the record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_source: Option<String>,
    /// Host that wrote the record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_host: Option<String>,
    /// When the first record for this key was written.
    pub created_at: DateTime<Utc>,
    /// When this record was written.
    pub updated_at: DateTime<Utc>,
}

/// A serialized payload with its size accounting.
#[derive(Debug, Clone)]
pub struct SerializedState {
    /// Compressed bytes.
    pub bytes: Vec<u8>,
    /// Size before compression.
    pub original_size: usize,
    /// Size after compression.
    pub compressed_size: usize,
}

/// Encodes a projection payload to bytes and back.
///
/// Projections with unusual payloads (huge maps, binary columns) can plug
/// in their own codec; [`JsonGzipSerializer`] is the default.
pub trait SnapshotSerializer: Send + Sync {
    /// Encode `payload` into compressed bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if encoding fails.
    fn serialize(&self, payload: &serde_json::Value) -> Result<SerializedState>;

    /// Inverse of [`serialize`](Self::serialize).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] for corrupt input.
    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value>;
}

/// JSON encoding, gzipped through a pooled [`Compressor`].
#[derive(Debug, Default)]
pub struct JsonGzipSerializer {
    compressor: Compressor,
}

impl JsonGzipSerializer {
    /// A serializer with a default-sized buffer pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotSerializer for JsonGzipSerializer {
    fn serialize(&self, payload: &serde_json::Value) -> Result<SerializedState> {
        let json = serde_json::to_vec(payload).map_err(StoreError::serialization)?;
        let bytes = self.compressor.compress(&json)?;
        Ok(SerializedState {
            original_size: json.len(),
            compressed_size: bytes.len(),
            bytes,
        })
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        let json = self.compressor.decompress(bytes)?;
        serde_json::from_slice(&json).map_err(StoreError::serialization)
    }
}

/// Where a snapshot payload ended up: inline or in the blob store.
#[derive(Debug, Clone)]
pub struct PayloadSlot {
    /// `true` if the payload was uploaded to the blob store.
    pub is_offloaded: bool,
    /// The compressed payload, when inline.
    pub inline_payload: Option<Vec<u8>>,
    /// Blob key, when offloaded.
    pub offload_key: Option<String>,
    /// Blob provider name, when offloaded.
    pub offload_provider: Option<String>,
}

/// Routes snapshot payloads between inline storage and the blob store.
pub struct SnapshotOffloader {
    blob: Arc<dyn BlobStore>,
    provider: String,
    inline_limit: usize,
}

impl SnapshotOffloader {
    /// Offload to `blob` (named `provider`) above `inline_limit` bytes.
    #[must_use]
    pub fn new(blob: Arc<dyn BlobStore>, provider: impl Into<String>, inline_limit: usize) -> Self {
        Self {
            blob,
            provider: provider.into(),
            inline_limit,
        }
    }

    /// Place `serialized` inline or upload it, returning the slot to record.
    ///
    /// Offloaded payloads are keyed
    /// `<tenant>/<projector name>/<fresh id>.bin`, so a newer snapshot
    /// never overwrites the object an older record still points at.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the upload fails after retries.
    pub async fn place(
        &self,
        tenant: &TenantId,
        projector_name: &str,
        serialized: &SerializedState,
    ) -> Result<PayloadSlot> {
        if serialized.bytes.len() <= self.inline_limit {
            return Ok(PayloadSlot {
                is_offloaded: false,
                inline_payload: Some(serialized.bytes.clone()),
                offload_key: None,
                offload_provider: None,
            });
        }

        let key = format!(
            "{}{}/{}.bin",
            tenant.storage_prefix(),
            projector_name,
            SortableId::now()
        );
        let data = Bytes::from(serialized.bytes.clone());
        with_retry("offload snapshot payload", || {
            self.blob.put(&key, data.clone())
        })
        .await?;
        tracing::info!(
            tenant = tenant.as_str(),
            projector = projector_name,
            key = %key,
            compressed_size = serialized.compressed_size,
            "snapshot payload offloaded"
        );
        Ok(PayloadSlot {
            is_offloaded: true,
            inline_payload: None,
            offload_key: Some(key),
            offload_provider: Some(self.provider.clone()),
        })
    }

    /// The compressed payload bytes of `record`, dereferencing an offload
    /// pointer if needed.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Serialization`] if the record carries neither an
    ///   inline payload nor an offload key.
    /// - [`StoreError::NotFound`] / [`StoreError::Storage`] from the blob
    ///   store for offloaded payloads.
    pub async fn retrieve(&self, record: &MultiProjectionStateRecord) -> Result<Vec<u8>> {
        if let Some(inline) = &record.inline_payload {
            return Ok(inline.clone());
        }
        let Some(key) = &record.offload_key else {
            return Err(StoreError::Serialization {
                message: format!(
                    "snapshot record for {}@{} has neither inline payload nor offload key",
                    record.projector_name, record.projector_version
                ),
            });
        };
        let data = with_retry("retrieve snapshot payload", || self.blob.get(key)).await?;
        Ok(data.to_vec())
    }
}

/// Persistence for [`MultiProjectionStateRecord`]s, keyed by
/// `(tenant, projector name, projector version)`.
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    /// Save `record`, superseding any record under the same key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] on backend failure.
    async fn save(&self, record: MultiProjectionStateRecord) -> Result<()>;

    /// The latest record under the key, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] on backend failure.
    async fn load(
        &self,
        tenant: &TenantId,
        projector_name: &str,
        projector_version: &str,
    ) -> Result<Option<MultiProjectionStateRecord>>;
}

/// In-memory [`SnapshotRepository`] for tests and single-process use.
#[derive(Debug, Default, Clone)]
pub struct MemorySnapshotRepository {
    records: Arc<RwLock<HashMap<(String, String, String), MultiProjectionStateRecord>>>,
}

impl MemorySnapshotRepository {
    /// An empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotRepository for MemorySnapshotRepository {
    async fn save(&self, mut record: MultiProjectionStateRecord) -> Result<()> {
        let key = (
            record.tenant.as_str().to_string(),
            record.projector_name.clone(),
            record.projector_version.clone(),
        );
        let mut records = self.records.write().await;
        // The first write's creation time survives supersession.
        if let Some(previous) = records.get(&key) {
            record.created_at = previous.created_at;
        }
        records.insert(key, record);
        Ok(())
    }

    async fn load(
        &self,
        tenant: &TenantId,
        projector_name: &str,
        projector_version: &str,
    ) -> Result<Option<MultiProjectionStateRecord>> {
        let key = (
            tenant.as_str().to_string(),
            projector_name.to_string(),
            projector_version.to_string(),
        );
        Ok(self.records.read().await.get(&key).cloned())
    }
}
