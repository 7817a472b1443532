//! Baseline persistence for the channel reward oracle.
//!
//! A baseline is the last metric snapshot that was matched by a confirmed mint. Every
//! backend offers the same operations: read the baseline, replace it atomically, append
//! an immutable audit record, and keep at most one submitted-but-unconfirmed mint per
//! entity so an interrupted cycle can be finished instead of minted again.

use std::fmt;

use serde::{Deserialize, Serialize};

mod access_token;
mod document_store;
mod error;
mod file_store;
mod memory_store;
#[cfg(test)]
mod test_http;

pub use access_token::{
    FirestoreCredentials, DEFAULT_METADATA_TOKEN_URL, DEFAULT_OAUTH_TOKEN_URL,
};
pub use document_store::{FirestoreBaselineStore, FirestoreConfig, DEFAULT_FIRESTORE_BASE_URL};
pub use error::StoreError;
pub use file_store::FileBaselineStore;
pub use memory_store::MemoryBaselineStore;

/// Cumulative counters observed for one entity at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub views: u64,
    pub subscribers: u64,
}

impl MetricSnapshot {
    pub const ZERO: MetricSnapshot = MetricSnapshot {
        views: 0,
        subscribers: 0,
    };

    pub fn new(views: u64, subscribers: u64) -> Self {
        Self { views, subscribers }
    }
}

impl fmt::Display for MetricSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} views / {} subscribers", self.views, self.subscribers)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(raw: impl Into<String>) -> Result<Self, StoreError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(StoreError::InvalidEntity { entity: raw });
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub(crate) fn path_component(&self) -> String {
        escape_path_component(self.0.as_str())
    }
}

/// Filesystem-safe rendering: `[A-Za-z0-9_-]` pass through, every other byte is
/// written as `%XX`.
pub(crate) fn escape_path_component(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            escaped.push(byte as char);
        } else {
            escaped.push_str(format!("%{byte:02X}").as_str());
        }
    }
    escaped
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

/// Audit entry written once per confirmed mint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintRecord {
    pub timestamp_unix_ms: i64,
    pub entity_id: String,
    pub recipient: String,
    pub reward_amount: u64,
    pub delta_views: i64,
    pub delta_subscribers: i64,
    pub previous: MetricSnapshot,
    pub current: MetricSnapshot,
    pub receipt_id: String,
    #[serde(default)]
    pub idempotency_key: String,
}

/// Mint whose confirmation has not been observed yet.
///
/// Written before the ledger sees the request and cleared once the ledger reports the
/// mint confirmed or rejected. While it exists the entity must not be minted again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMintRecord {
    pub entity_id: String,
    /// Ledger id of the submitted mint; `None` until the ledger has accepted it.
    pub mint_id: Option<String>,
    pub idempotency_key: String,
    pub recipient: String,
    pub reward_amount: u64,
    pub delta_views: i64,
    pub delta_subscribers: i64,
    pub previous: MetricSnapshot,
    pub current: MetricSnapshot,
    pub recorded_at_unix_ms: i64,
}

pub trait BaselineStore {
    /// Returns `Ok(None)` when the entity has never been reconciled.
    fn load_snapshot(&self, entity: &EntityKey) -> Result<Option<MetricSnapshot>, StoreError>;

    /// Replaces the stored baseline in a single durable write.
    fn save(&self, entity: &EntityKey, snapshot: &MetricSnapshot) -> Result<(), StoreError>;

    fn append_audit(&self, entity: &EntityKey, record: &MintRecord) -> Result<(), StoreError>;

    fn load_pending(&self, entity: &EntityKey) -> Result<Option<PendingMintRecord>, StoreError>;

    /// Replaces the pending mint for `entity` in a single durable write.
    fn save_pending(&self, entity: &EntityKey, pending: &PendingMintRecord)
        -> Result<(), StoreError>;

    /// Removing an absent record succeeds.
    fn clear_pending(&self, entity: &EntityKey) -> Result<(), StoreError>;

    /// Baseline for the next cycle; an entity without history starts from zero.
    fn load(&self, entity: &EntityKey) -> Result<MetricSnapshot, StoreError> {
        Ok(self.load_snapshot(entity)?.unwrap_or(MetricSnapshot::ZERO))
    }
}

impl<S: BaselineStore + ?Sized> BaselineStore for Box<S> {
    fn load_snapshot(&self, entity: &EntityKey) -> Result<Option<MetricSnapshot>, StoreError> {
        (**self).load_snapshot(entity)
    }

    fn save(&self, entity: &EntityKey, snapshot: &MetricSnapshot) -> Result<(), StoreError> {
        (**self).save(entity, snapshot)
    }

    fn append_audit(&self, entity: &EntityKey, record: &MintRecord) -> Result<(), StoreError> {
        (**self).append_audit(entity, record)
    }

    fn load_pending(&self, entity: &EntityKey) -> Result<Option<PendingMintRecord>, StoreError> {
        (**self).load_pending(entity)
    }

    fn save_pending(
        &self,
        entity: &EntityKey,
        pending: &PendingMintRecord,
    ) -> Result<(), StoreError> {
        (**self).save_pending(entity, pending)
    }

    fn clear_pending(&self, entity: &EntityKey) -> Result<(), StoreError> {
        (**self).clear_pending(entity)
    }
}
