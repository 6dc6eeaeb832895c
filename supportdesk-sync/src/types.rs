use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use supportdesk::{
    Category, Document, EntityId, EntityKind, MutationOp, PendingMutation, SupportTicket, Tag,
};

/// One pending mutation sent to the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Idempotency key; a retried push carries the same id.
    pub mutation_id: String,
    pub client_id: String,
    pub entity_kind: EntityKind,
    pub entity_id: EntityId,
    pub operation: MutationOp,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl PushRequest {
    pub fn from_mutation(mutation: &PendingMutation, client_id: &str) -> Self {
        Self {
            mutation_id: mutation.id.clone(),
            client_id: client_id.to_string(),
            entity_kind: mutation.entity_kind,
            entity_id: mutation.entity_id.clone(),
            operation: mutation.operation,
            payload: mutation.payload.clone(),
            created_at: mutation.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    pub mutation_id: String,
    /// False when the server had already applied this mutation id.
    #[serde(default = "default_true")]
    pub applied: bool,
}

fn default_true() -> bool {
    true
}

/// A full record as held by the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RemoteRecord {
    Document(Document),
    Ticket(SupportTicket),
    Tag(Tag),
    Category(Category),
}

impl RemoteRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            RemoteRecord::Document(_) => EntityKind::Document,
            RemoteRecord::Ticket(_) => EntityKind::Ticket,
            RemoteRecord::Tag(_) => EntityKind::Tag,
            RemoteRecord::Category(_) => EntityKind::Category,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum RemoteChange {
    Upsert {
        record: RemoteRecord,
    },
    Delete {
        entity_kind: EntityKind,
        entity_id: EntityId,
    },
}

/// Changes since the client's cursor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    #[serde(default)]
    pub changes: Vec<RemoteChange>,
    /// Opaque position to send as `since` next time.
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Syncing,
    /// The last pass hit failures; entries wait out their retry delay.
    Backoff,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub phase: SyncPhase,
    pub pending_count: usize,
    pub poisoned_count: usize,
    pub last_sync_time: Option<DateTime<Utc>>,
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub pushed: usize,
    pub failed: usize,
    pub poisoned: usize,
    pub pulled: usize,
    pub applied: usize,
    pub skipped: usize,
    /// Connectivity was lost or the remote was unreachable mid-pass.
    pub aborted: bool,
    pub error: Option<String>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.aborted && self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub pending_count: usize,
    pub poisoned_count: usize,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub passes: u64,
    pub pushed_total: u64,
    pub failed_total: u64,
    pub last_report: Option<SyncReport>,
}
