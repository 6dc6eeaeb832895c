use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Entity identifier. UUIDs for locally created records, opaque strings for
/// records that arrive from the remote authority.
pub type EntityId = String;

/// The four record collections held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Document,
    Ticket,
    Tag,
    Category,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Document => "document",
            EntityKind::Ticket => "ticket",
            EntityKind::Tag => "tag",
            EntityKind::Category => "category",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "document" => Some(EntityKind::Document),
            "ticket" => Some(EntityKind::Ticket),
            "tag" => Some(EntityKind::Tag),
            "category" => Some(EntityKind::Category),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Pdf,
    Manual,
    Guide,
    Datasheet,
    Installation,
    Other,
}

/// Opaque document payload. Binary blobs travel as base64 in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum DocumentContent {
    Text(String),
    Markup(String),
    Binary(#[serde(with = "base64_bytes")] Vec<u8>),
}

impl Default for DocumentContent {
    fn default() -> Self {
        DocumentContent::Text(String::new())
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: EntityId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub category_id: Option<EntityId>,
    #[serde(default)]
    pub views: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default)]
    pub content: DocumentContent,
}

impl Document {
    pub fn new(title: impl Into<String>, doc_type: DocumentType) -> Self {
        Document {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            description: None,
            doc_type,
            tags: BTreeSet::new(),
            category_id: None,
            views: 0,
            updated_at: Utc::now(),
            file_size: None,
            file_type: None,
            content: DocumentContent::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_category(mut self, category_id: impl Into<String>) -> Self {
        self.category_id = Some(category_id.into());
        self
    }

    pub fn with_content(mut self, content: DocumentContent) -> Self {
        self.content = content;
        self
    }

    pub fn with_file(mut self, size: u64, file_type: impl Into<String>) -> Self {
        self.file_size = Some(size);
        self.file_type = Some(file_type.into());
        self
    }

    pub fn metadata(&self) -> DocumentMetadata {
        DocumentMetadata {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            doc_type: self.doc_type,
            tags: self.tags.clone(),
            category_id: self.category_id.clone(),
            views: self.views,
            updated_at: self.updated_at,
            file_size: self.file_size,
            file_type: self.file_type.clone(),
        }
    }
}

/// Everything about a document except its content payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub id: EntityId,
    pub title: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    pub tags: BTreeSet<String>,
    pub category_id: Option<EntityId>,
    pub views: u64,
    pub updated_at: DateTime<Utc>,
    pub file_size: Option<u64>,
    pub file_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TicketStatus {
    New,
    Open,
    InProgress,
    Resolved,
    Closed,
}

impl TicketStatus {
    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// new -> open -> inProgress -> {resolved, closed}, resolved -> closed,
    /// and the single backward edge resolved -> open (reopen).
    pub fn can_transition_to(self, next: TicketStatus) -> bool {
        use TicketStatus::*;
        matches!(
            (self, next),
            (New, Open)
                | (Open, InProgress)
                | (InProgress, Resolved)
                | (InProgress, Closed)
                | (Resolved, Closed)
                | (Resolved, Open)
        )
    }

    /// Position along the forward lifecycle. Used to decide whether a pulled
    /// status would move a ticket backwards.
    pub fn stage(self) -> u8 {
        match self {
            TicketStatus::New => 0,
            TicketStatus::Open => 1,
            TicketStatus::InProgress => 2,
            TicketStatus::Resolved => 3,
            TicketStatus::Closed => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == TicketStatus::Closed
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::New => "new",
            TicketStatus::Open => "open",
            TicketStatus::InProgress => "inProgress",
            TicketStatus::Resolved => "resolved",
            TicketStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketPriority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: u64,
    /// Where the bytes live (remote URL or local blob key).
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportTicket {
    pub id: EntityId,
    pub title: String,
    pub description: String,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub views: u64,
}

/// Fields a user supplies when opening a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTicket {
    pub title: String,
    pub description: String,
    pub priority: TicketPriority,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub created_by: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl NewTicket {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        NewTicket {
            title: title.into(),
            description: description.into(),
            priority: TicketPriority::Medium,
            category: String::new(),
            tags: BTreeSet::new(),
            created_by: created_by.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: TicketPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn into_ticket(self, id: EntityId, now: DateTime<Utc>) -> SupportTicket {
        SupportTicket {
            id,
            title: self.title,
            description: self.description,
            status: TicketStatus::New,
            priority: self.priority,
            category: self.category,
            tags: self.tags,
            created_by: self.created_by,
            created_at: now,
            updated_at: now,
            attachments: self.attachments,
            views: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub name: String,
    pub count: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<EntityId>,
    pub updated_at: DateTime<Utc>,
}

impl Category {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Category {
            id: id.into(),
            name: name.into(),
            parent_id: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

/// What a pending mutation asks the remote authority to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationOp {
    Create,
    Update,
    Delete,
    IncrementView,
    IncrementTag,
    TransitionStatus,
}

impl MutationOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOp::Create => "create",
            MutationOp::Update => "update",
            MutationOp::Delete => "delete",
            MutationOp::IncrementView => "increment-view",
            MutationOp::IncrementTag => "increment-tag",
            MutationOp::TransitionStatus => "transition-status",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(MutationOp::Create),
            "update" => Some(MutationOp::Update),
            "delete" => Some(MutationOp::Delete),
            "increment-view" => Some(MutationOp::IncrementView),
            "increment-tag" => Some(MutationOp::IncrementTag),
            "transition-status" => Some(MutationOp::TransitionStatus),
            _ => None,
        }
    }

    /// Counter deltas commute, so they are exempt from last-write-wins.
    pub fn is_increment(&self) -> bool {
        matches!(self, MutationOp::IncrementView | MutationOp::IncrementTag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationState {
    Pending,
    InFlight,
    Poisoned,
}

impl MutationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationState::Pending => "pending",
            MutationState::InFlight => "in-flight",
            MutationState::Poisoned => "poisoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MutationState::Pending),
            "in-flight" => Some(MutationState::InFlight),
            "poisoned" => Some(MutationState::Poisoned),
            _ => None,
        }
    }
}

/// A durable intent to propagate one local write to the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    /// Stable identifier, also sent as the idempotency key.
    pub id: String,
    /// Creation order within this store.
    pub seq: i64,
    pub entity_kind: EntityKind,
    pub entity_id: EntityId,
    pub operation: MutationOp,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub state: MutationState,
    /// Claimed for a push at least once; the payload no longer changes.
    #[serde(default)]
    pub sent: bool,
}

impl PendingMutation {
    /// Delta carried by an increment mutation (`{"delta": n}`), zero otherwise.
    pub fn delta(&self) -> u64 {
        if !self.operation.is_increment() {
            return 0;
        }
        self.payload
            .get("delta")
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }
}

/// One page of results plus the size of the full match set.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: usize,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Page {
            items: Vec::new(),
            total_count: 0,
        }
    }
}

/// Offset/limit pagination for plain listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Pagination {
            limit: 50,
            offset: 0,
        }
    }
}
