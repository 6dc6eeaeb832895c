//! Synchronization between a supportdesk [`LocalStore`](supportdesk::LocalStore)
//! and its remote authority.
//!
//! [`SyncManager`] pushes the store's pending mutations in creation order,
//! pulls remote changes and merges them with the conflict policy in
//! [`merge`]. [`SupportPortal`] bundles the store, the manager and the
//! capture gate behind the calls the portal's screens make.

pub mod backoff;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod manager;
pub mod merge;
pub mod portal;
pub mod remote;
pub mod types;

pub use backoff::Backoff;
pub use config::SyncConfig;
pub use connectivity::Connectivity;
pub use error::{RemoteError, SyncError};
pub use events::{EventBus, SubscriptionId, SyncEvent};
pub use manager::SyncManager;
pub use portal::{open_http_portal, SupportPortal};
pub use remote::{HttpRemote, RemoteAuthority};
pub use types::{
    PullResponse, PushRequest, PushResponse, RemoteChange, RemoteRecord, SyncPhase, SyncReport,
    SyncStats, SyncStatus,
};
