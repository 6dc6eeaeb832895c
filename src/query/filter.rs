use super::SortBy;
use crate::error::{Result, SupportDeskError};
use crate::types::{DocumentType, EntityId, TicketPriority, TicketStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const DEFAULT_LIMIT: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocumentQuery {
    pub text_query: Option<String>,
    /// Every listed tag must be present (intersection).
    pub tags: Vec<String>,
    pub category_id: Option<EntityId>,
    /// Also match documents filed under descendants of `category_id`.
    pub include_descendants: bool,
    #[serde(rename = "type")]
    pub doc_type: Option<DocumentType>,
    pub sort_by: Option<SortBy>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl DocumentQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, q: impl Into<String>) -> Self {
        self.text_query = Some(q.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn category(mut self, id: impl Into<String>) -> Self {
        self.category_id = Some(id.into());
        self
    }

    pub fn with_descendants(mut self) -> Self {
        self.include_descendants = true;
        self
    }

    pub fn doc_type(mut self, t: DocumentType) -> Self {
        self.doc_type = Some(t);
        self
    }

    pub fn sort_by(mut self, sort: SortBy) -> Self {
        self.sort_by = Some(sort);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub(crate) fn validate(&self, max_page_size: usize) -> Result<()> {
        validate_window(self.limit, max_page_size)?;
        validate_tags(&self.tags)
    }

    pub(crate) fn text_filter(&self) -> Option<&str> {
        non_blank(self.text_query.as_deref())
    }

    pub(crate) fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TicketQuery {
    pub text_query: Option<String>,
    pub tags: Vec<String>,
    /// Match tickets in any of these statuses; empty matches every status.
    pub status: BTreeSet<TicketStatus>,
    pub priority: Option<TicketPriority>,
    /// Free-text ticket category, compared case-insensitively.
    pub category: Option<String>,
    pub created_by: Option<String>,
    pub sort_by: Option<SortBy>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl TicketQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, q: impl Into<String>) -> Self {
        self.text_query = Some(q.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn status(mut self, status: TicketStatus) -> Self {
        self.status.insert(status);
        self
    }

    pub fn statuses(mut self, statuses: impl IntoIterator<Item = TicketStatus>) -> Self {
        self.status.extend(statuses);
        self
    }

    pub fn priority(mut self, priority: TicketPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn created_by(mut self, user: impl Into<String>) -> Self {
        self.created_by = Some(user.into());
        self
    }

    pub fn sort_by(mut self, sort: SortBy) -> Self {
        self.sort_by = Some(sort);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub(crate) fn validate(&self, max_page_size: usize) -> Result<()> {
        validate_window(self.limit, max_page_size)?;
        validate_tags(&self.tags)
    }

    pub(crate) fn text_filter(&self) -> Option<&str> {
        non_blank(self.text_query.as_deref())
    }

    pub(crate) fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }
}

fn validate_window(limit: Option<usize>, max_page_size: usize) -> Result<()> {
    match limit {
        Some(0) => Err(SupportDeskError::InvalidQuery(
            "limit must be at least 1".to_string(),
        )),
        Some(n) if n > max_page_size => Err(SupportDeskError::InvalidQuery(format!(
            "limit {} exceeds maximum page size {}",
            n, max_page_size
        ))),
        _ => Ok(()),
    }
}

fn validate_tags(tags: &[String]) -> Result<()> {
    if tags.iter().any(|t| t.trim().is_empty()) {
        return Err(SupportDeskError::InvalidQuery(
            "tag filter contains an empty name".to_string(),
        ));
    }
    Ok(())
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}
