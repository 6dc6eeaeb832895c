//! Typed queries over the local store.
//!
//! Queries are validated once, then answered from the last committed state:
//! tag and token filters narrow the candidate set in SQL, the remaining
//! predicates and the ranking run over decoded records.

pub mod executor;
pub mod filter;

pub use filter::{DocumentQuery, TicketQuery};

use crate::store::Entity;
use crate::types::{Document, SupportTicket};
use serde::{Deserialize, Serialize};

/// Result ordering. Without an explicit choice, text queries sort by
/// relevance and everything else newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortBy {
    Relevance,
    Newest,
    Oldest,
    MostViewed,
    Title,
}

impl SortBy {
    pub(crate) fn resolve(requested: Option<SortBy>, has_text: bool) -> SortBy {
        match requested {
            Some(s) => s,
            None if has_text => SortBy::Relevance,
            None => SortBy::Newest,
        }
    }
}

/// Records that appear in ranked lists and carry a view counter.
pub trait Viewable: Entity {
    fn title(&self) -> &str;

    fn views(&self) -> u64;

    fn views_mut(&mut self) -> &mut u64;
}

impl Viewable for Document {
    fn title(&self) -> &str {
        &self.title
    }

    fn views(&self) -> u64 {
        self.views
    }

    fn views_mut(&mut self) -> &mut u64 {
        &mut self.views
    }
}

impl Viewable for SupportTicket {
    fn title(&self) -> &str {
        &self.title
    }

    fn views(&self) -> u64 {
        self.views
    }

    fn views_mut(&mut self) -> &mut u64 {
        &mut self.views
    }
}
