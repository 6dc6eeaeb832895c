//! # Supportdesk
//!
//! Local-first data layer for a support-center portal. Documents, support
//! tickets, tags and categories live in an embedded SQLite store that answers
//! filtered queries offline and records every local write in a durable
//! pending-mutation log. The companion `supportdesk-sync` crate drains that
//! log against the remote system of record.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use supportdesk::{Document, DocumentQuery, DocumentType, EntityKind, LocalStore};
//!
//! # async fn run() -> supportdesk::Result<()> {
//! let store = LocalStore::open_in_memory().await?;
//!
//! store
//!     .put(Document::new("Heat pump installation", DocumentType::Installation)
//!         .with_tags(["Installation"]))
//!     .await?;
//!
//! let page = store.find_documents(DocumentQuery::new().text("install")).await?;
//! assert_eq!(page.total_count, 1);
//!
//! store.record_view(EntityKind::Document, &page.items[0].id).await?;
//! assert_eq!(store.pending_count().await?, 2);
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`StoreConfig::from_env`] reads `SUPPORTDESK_DATA_DIR`,
//! `SUPPORTDESK_MAX_PAGE_SIZE`, `SUPPORTDESK_RELATED_TAGS` and
//! `SUPPORTDESK_SEED_TAGS`.

pub mod capture;
pub mod clock;
pub mod config;
pub mod error;
pub mod query;
pub mod search;
pub mod store;
pub mod types;
pub mod usage;

pub use capture::{CaptureGate, CaptureHandle, CapturePermission};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::StoreConfig;
pub use error::{Result, SupportDeskError};
pub use query::{DocumentQuery, SortBy, TicketQuery, Viewable};
pub use search::{RelatedTag, SearchOptions, SearchResults};
pub use store::{
    Entity, LocalState, LocalStore, MergeOutcome, QueueCounts, Resolution, WriteOrigin,
};
pub use types::*;
