use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::events::{SubscriptionId, SyncEvent};
use crate::manager::SyncManager;
use crate::remote::RemoteAuthority;
use crate::types::{SyncReport, SyncStats, SyncStatus};
use std::sync::Arc;
use std::time::Duration;
use supportdesk::search::DEFAULT_SUGGESTION_LIMIT;
use supportdesk::{
    Attachment, CaptureGate, CaptureHandle, Category, Document, DocumentContent,
    DocumentMetadata, DocumentQuery, EntityId, EntityKind, LocalStore, NewTicket, Page, Result,
    SearchOptions, SearchResults, StoreConfig, SupportDeskError, SupportTicket, TicketQuery,
    TicketStatus,
};

/// Everything the portal's screens call into: reads and writes against the
/// local store, sync control, and the capture device.
pub struct SupportPortal<R: RemoteAuthority> {
    store: Arc<LocalStore>,
    sync: Arc<SyncManager<R>>,
    connectivity: Arc<Connectivity>,
    capture: CaptureGate,
}

impl<R: RemoteAuthority> SupportPortal<R> {
    /// Open the store and wire up sync. Auto-sync is not started; call
    /// [`start_auto_sync`](Self::start_auto_sync) once the UI is ready.
    pub async fn open(
        store_config: StoreConfig,
        sync_config: SyncConfig,
        remote: R,
        connectivity: Arc<Connectivity>,
    ) -> Result<Self> {
        let store = LocalStore::open(store_config).await?;
        Ok(Self::with_store(store, sync_config, remote, connectivity))
    }

    pub fn with_store(
        store: Arc<LocalStore>,
        sync_config: SyncConfig,
        remote: R,
        connectivity: Arc<Connectivity>,
    ) -> Self {
        let sync = SyncManager::new(
            Arc::clone(&store),
            Arc::new(remote),
            sync_config,
            Arc::clone(&connectivity),
        );
        sync.watch_connectivity();
        Self {
            store,
            sync,
            connectivity,
            capture: CaptureGate::unrestricted(),
        }
    }

    pub fn with_capture_gate(mut self, gate: CaptureGate) -> Self {
        self.capture = gate;
        self
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn sync(&self) -> &Arc<SyncManager<R>> {
        &self.sync
    }

    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    // Documents

    pub async fn get_documents(&self, query: DocumentQuery) -> Result<Page<Document>> {
        self.store.find_documents(query).await
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        self.store.get::<Document>(id).await
    }

    pub async fn get_document_metadata(&self, id: &str) -> Result<DocumentMetadata> {
        Ok(self.store.require::<Document>(id).await?.metadata())
    }

    pub async fn get_document_content(&self, id: &str) -> Result<DocumentContent> {
        Ok(self.store.require::<Document>(id).await?.content)
    }

    /// Count a view and return the new total.
    pub async fn view_document(&self, id: &str) -> Result<u64> {
        self.store.record_view(EntityKind::Document, id).await
    }

    /// The category tree as a flat list, sorted by name.
    pub async fn get_categories(&self) -> Result<Vec<Category>> {
        let mut categories = self.store.all::<Category>().await?;
        categories.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(categories)
    }

    // Tickets

    pub async fn create_ticket(&self, fields: NewTicket) -> Result<EntityId> {
        Ok(self.store.create_ticket(fields).await?.id)
    }

    pub async fn get_tickets(&self, query: TicketQuery) -> Result<Page<SupportTicket>> {
        self.store.find_tickets(query).await
    }

    pub async fn transition_ticket(&self, id: &str, status: TicketStatus) -> Result<SupportTicket> {
        self.store.transition_ticket(id, status).await
    }

    pub async fn add_ticket_attachment(
        &self,
        id: &str,
        attachment: Attachment,
    ) -> Result<SupportTicket> {
        self.store.add_ticket_attachment(id, attachment).await
    }

    pub async fn view_ticket(&self, id: &str) -> Result<u64> {
        self.store.record_view(EntityKind::Ticket, id).await
    }

    // Search

    /// Tag names for an autocomplete list, most used first.
    pub async fn get_suggestions(&self, prefix: &str, limit: Option<usize>) -> Result<Vec<String>> {
        let tags = self
            .store
            .suggest(prefix, limit.unwrap_or(DEFAULT_SUGGESTION_LIMIT))
            .await?;
        Ok(tags.into_iter().map(|t| t.name).collect())
    }

    pub async fn search(&self, query: &str, options: SearchOptions) -> Result<SearchResults> {
        self.store.search(query, options).await
    }

    // Sync

    pub async fn status(&self) -> Result<SyncStatus> {
        self.sync.status().await
    }

    pub async fn sync_stats(&self) -> Result<SyncStats> {
        self.sync.sync_stats().await
    }

    pub async fn sync_all(&self) -> Option<SyncReport> {
        self.sync.sync_all().await
    }

    pub fn start_auto_sync(&self, interval: Duration) {
        self.sync.start_auto_sync(interval);
    }

    pub fn stop_auto_sync(&self) {
        self.sync.stop_auto_sync();
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.sync.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.sync.unsubscribe(id)
    }

    // Capture

    /// Take the capture device for a meter reading. Released when the handle
    /// is dropped.
    pub fn capture(&self) -> Result<CaptureHandle> {
        self.capture.acquire()
    }
}

impl<R: RemoteAuthority> Drop for SupportPortal<R> {
    fn drop(&mut self) {
        self.sync.stop_auto_sync();
    }
}

/// Build an HTTP-backed portal from configuration files in `data_dir`.
pub async fn open_http_portal(
    data_dir: &std::path::Path,
) -> Result<SupportPortal<crate::remote::HttpRemote>> {
    let store_config = StoreConfig::at(data_dir.join("supportdesk.db"));
    let sync_config = SyncConfig::load_or_default(data_dir);
    let remote = crate::remote::HttpRemote::from_config(&sync_config)
        .map_err(SupportDeskError::from)?;
    SupportPortal::open(store_config, sync_config, remote, Arc::new(Connectivity::new(true))).await
}
