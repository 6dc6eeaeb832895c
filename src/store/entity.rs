use crate::error::{Result, SupportDeskError};
use crate::search::tokenizer::normalize;
use crate::types::{Category, Document, EntityKind, SupportTicket, Tag};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::{BTreeSet, HashSet};

/// Where a write came from. Only local writes are queued for the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    Local,
    Remote,
}

/// Which text field a token was taken from. Title hits rank higher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenField {
    Title,
    Description,
}

impl TokenField {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenField::Title => "title",
            TokenField::Description => "description",
        }
    }
}

/// A record type held in one of the store's collections.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &str;

    fn updated_at(&self) -> DateTime<Utc>;

    fn set_updated_at(&mut self, at: DateTime<Utc>);

    fn tags(&self) -> Option<&BTreeSet<String>> {
        None
    }

    /// Text fields fed to the token index.
    fn indexed_text(&self) -> Vec<(TokenField, &str)> {
        Vec::new()
    }

    /// Projected usage count for the tags collection.
    fn usage_count(&self) -> Option<u64> {
        None
    }

    /// Carry store-owned fields over from the committed version before a
    /// local overwrite.
    fn absorb_local(&mut self, _previous: &Self) {}

    /// Checks that need only the record itself.
    fn validate(&self) -> Result<()> {
        if self.id().trim().is_empty() {
            return Err(SupportDeskError::InvariantViolation(format!(
                "{} id must not be empty",
                Self::KIND
            )));
        }
        Ok(())
    }

    /// Checks against the committed version and the rest of the store. Runs
    /// inside the write transaction, before anything is written.
    fn check_invariants(
        &self,
        _previous: Option<&Self>,
        _tx: &Transaction<'_>,
        _origin: WriteOrigin,
    ) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn table_for(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Document => "documents",
        EntityKind::Ticket => "tickets",
        EntityKind::Tag => "tags",
        EntityKind::Category => "categories",
    }
}

/// Fixed-width UTC timestamps sort lexicographically in SQLite.
pub(crate) fn encode_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SupportDeskError::Storage(format!("bad timestamp '{}': {}", s, e)))
}

/// Primary-key value for a record id. Tag ids are names, keyed by their
/// case-folded form so every spelling of one tag lands on the same row.
pub(crate) fn row_key(kind: EntityKind, id: &str) -> Cow<'_, str> {
    match kind {
        EntityKind::Tag => Cow::Owned(normalize(id)),
        _ => Cow::Borrowed(id),
    }
}

pub(crate) fn load<T: Entity>(tx: &rusqlite::Connection, id: &str) -> Result<Option<T>> {
    let sql = format!("SELECT payload FROM {} WHERE id = ?1", table_for(T::KIND));
    let payload: Option<String> = tx
        .query_row(&sql, params![row_key(T::KIND, id)], |row| row.get(0))
        .optional()?;
    match payload {
        Some(p) => Ok(Some(serde_json::from_str(&p)?)),
        None => Ok(None),
    }
}

impl Entity for Document {
    const KIND: EntityKind = EntityKind::Document;

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn tags(&self) -> Option<&BTreeSet<String>> {
        Some(&self.tags)
    }

    fn indexed_text(&self) -> Vec<(TokenField, &str)> {
        let mut fields = vec![(TokenField::Title, self.title.as_str())];
        if let Some(ref d) = self.description {
            fields.push((TokenField::Description, d.as_str()));
        }
        fields
    }

    fn absorb_local(&mut self, previous: &Self) {
        // views belong to the usage counters
        self.views = previous.views;
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() || self.title.trim().is_empty() {
            return Err(SupportDeskError::InvariantViolation(
                "document id and title must not be empty".to_string(),
            ));
        }
        validate_tag_names(&self.tags)
    }

    fn check_invariants(
        &self,
        previous: Option<&Self>,
        _tx: &Transaction<'_>,
        origin: WriteOrigin,
    ) -> Result<()> {
        let Some(prev) = previous else {
            return Ok(());
        };
        if origin == WriteOrigin::Local {
            if prev.file_size.is_some() && prev.file_size != self.file_size {
                return Err(SupportDeskError::InvariantViolation(format!(
                    "fileSize of document {} is immutable once set",
                    self.id
                )));
            }
            if prev.file_type.is_some() && prev.file_type != self.file_type {
                return Err(SupportDeskError::InvariantViolation(format!(
                    "fileType of document {} is immutable once set",
                    self.id
                )));
            }
        }
        if self.views < prev.views {
            return Err(SupportDeskError::InvariantViolation(format!(
                "views of document {} cannot decrease ({} -> {})",
                self.id, prev.views, self.views
            )));
        }
        Ok(())
    }
}

impl Entity for SupportTicket {
    const KIND: EntityKind = EntityKind::Ticket;

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn tags(&self) -> Option<&BTreeSet<String>> {
        Some(&self.tags)
    }

    fn indexed_text(&self) -> Vec<(TokenField, &str)> {
        vec![
            (TokenField::Title, self.title.as_str()),
            (TokenField::Description, self.description.as_str()),
        ]
    }

    fn absorb_local(&mut self, previous: &Self) {
        self.views = previous.views;
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() || self.title.trim().is_empty() {
            return Err(SupportDeskError::InvariantViolation(
                "ticket id and title must not be empty".to_string(),
            ));
        }
        validate_tag_names(&self.tags)
    }

    fn check_invariants(
        &self,
        previous: Option<&Self>,
        _tx: &Transaction<'_>,
        origin: WriteOrigin,
    ) -> Result<()> {
        if origin == WriteOrigin::Remote {
            return Ok(());
        }
        let Some(prev) = previous else {
            if self.status != crate::types::TicketStatus::New {
                return Err(SupportDeskError::InvariantViolation(format!(
                    "ticket {} must be created with status new",
                    self.id
                )));
            }
            return Ok(());
        };

        if prev.status != self.status && !prev.status.can_transition_to(self.status) {
            return Err(SupportDeskError::InvalidTransition {
                from: prev.status.to_string(),
                to: self.status.to_string(),
            });
        }

        if prev.status.is_terminal() {
            let mut reopened = self.clone();
            reopened.status = prev.status;
            reopened.updated_at = prev.updated_at;
            reopened.views = prev.views;
            if &reopened != prev {
                return Err(SupportDeskError::InvariantViolation(format!(
                    "ticket {} is closed and cannot be edited",
                    self.id
                )));
            }
        }

        if self.created_by != prev.created_by || self.created_at != prev.created_at {
            return Err(SupportDeskError::InvariantViolation(format!(
                "creator of ticket {} cannot change",
                self.id
            )));
        }

        let appended = self.attachments.len() >= prev.attachments.len()
            && self.attachments[..prev.attachments.len()] == prev.attachments[..];
        if !appended {
            return Err(SupportDeskError::InvariantViolation(format!(
                "attachments of ticket {} are append-only",
                self.id
            )));
        }
        Ok(())
    }
}

impl Entity for Tag {
    const KIND: EntityKind = EntityKind::Tag;

    fn id(&self) -> &str {
        &self.name
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn usage_count(&self) -> Option<u64> {
        Some(self.count)
    }

    fn absorb_local(&mut self, previous: &Self) {
        // keep the first-seen spelling as the display name
        self.name = previous.name.clone();
    }

    fn check_invariants(
        &self,
        previous: Option<&Self>,
        _tx: &Transaction<'_>,
        _origin: WriteOrigin,
    ) -> Result<()> {
        if let Some(prev) = previous {
            if self.count < prev.count {
                return Err(SupportDeskError::InvariantViolation(format!(
                    "tag '{}' count cannot decrease",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

impl Entity for Category {
    const KIND: EntityKind = EntityKind::Category;

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() || self.name.trim().is_empty() {
            return Err(SupportDeskError::InvariantViolation(
                "category id and name must not be empty".to_string(),
            ));
        }
        if self.parent_id.as_deref() == Some(self.id.as_str()) {
            return Err(SupportDeskError::InvariantViolation(format!(
                "category {} cannot be its own parent",
                self.id
            )));
        }
        Ok(())
    }

    fn check_invariants(
        &self,
        _previous: Option<&Self>,
        tx: &Transaction<'_>,
        origin: WriteOrigin,
    ) -> Result<()> {
        let Some(ref parent) = self.parent_id else {
            return Ok(());
        };

        // Pulled children may arrive before their parents.
        if origin == WriteOrigin::Local && load::<Category>(tx, parent)?.is_none() {
            return Err(SupportDeskError::InvariantViolation(format!(
                "parent category {} does not exist",
                parent
            )));
        }

        let mut seen = HashSet::new();
        seen.insert(self.id.clone());
        let mut cursor = Some(parent.clone());
        while let Some(current) = cursor {
            if !seen.insert(current.clone()) {
                return Err(SupportDeskError::InvariantViolation(format!(
                    "setting parent of category {} to {} would create a cycle",
                    self.id, parent
                )));
            }
            cursor = load::<Category>(tx, &current)?.and_then(|c| c.parent_id);
        }
        Ok(())
    }
}

fn validate_tag_names(tags: &BTreeSet<String>) -> Result<()> {
    if tags.iter().any(|t| t.trim().is_empty()) {
        return Err(SupportDeskError::InvariantViolation(
            "tag names must not be empty".to_string(),
        ));
    }
    let mut folded = HashSet::new();
    for t in tags {
        if !folded.insert(normalize(t)) {
            return Err(SupportDeskError::InvariantViolation(format!(
                "duplicate tag '{}'",
                t
            )));
        }
    }
    Ok(())
}
