use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::error::{RemoteError, SyncError};
use crate::events::{EventBus, SubscriptionId, SyncEvent};
use crate::merge;
use crate::remote::RemoteAuthority;
use crate::types::{
    PushRequest, RemoteChange, RemoteRecord, SyncPhase, SyncReport, SyncStats, SyncStatus,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use supportdesk::{
    Clock, EntityKind, LocalStore, MergeOutcome, MutationState, PendingMutation, SupportDeskError,
};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Default)]
struct Tracking {
    phase: Option<SyncPhase>,
    last_sync_time: Option<DateTime<Utc>>,
    last_report: Option<SyncReport>,
    passes: u64,
    pushed_total: u64,
    failed_total: u64,
}

/// Drains the pending-mutation log against the remote authority and merges
/// what the remote has changed since the last pass.
///
/// One pass at a time: a pass requested while another is running, or while
/// offline, is a no-op.
pub struct SyncManager<R: RemoteAuthority> {
    store: Arc<LocalStore>,
    remote: Arc<R>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    connectivity: Arc<Connectivity>,
    events: EventBus,
    is_syncing: AtomicBool,
    tracking: Mutex<Tracking>,
    auto_sync: Mutex<Option<watch::Sender<bool>>>,
    watcher: Mutex<Option<watch::Sender<bool>>>,
}

/// Clears the syncing flag however the pass ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum PushOutcome {
    Acked,
    Failed,
    Abort,
}

impl<R: RemoteAuthority> SyncManager<R> {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<R>,
        config: SyncConfig,
        connectivity: Arc<Connectivity>,
    ) -> Arc<Self> {
        let clock = store.clock();
        Arc::new(Self {
            store,
            remote,
            clock,
            config,
            connectivity,
            events: EventBus::new(),
            is_syncing: AtomicBool::new(false),
            tracking: Mutex::new(Tracking::default()),
            auto_sync: Mutex::new(None),
            watcher: Mutex::new(None),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::Acquire)
    }

    fn tracking(&self) -> std::sync::MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current status. Reads queue counts from the store; never touches the
    /// network.
    pub async fn status(&self) -> supportdesk::Result<SyncStatus> {
        let counts = self.store.queue_counts().await?;
        let syncing = self.is_syncing();
        let tracking = self.tracking();
        Ok(SyncStatus {
            is_online: self.connectivity.is_online(),
            is_syncing: syncing,
            phase: if syncing {
                SyncPhase::Syncing
            } else {
                tracking.phase.unwrap_or(SyncPhase::Idle)
            },
            pending_count: counts.pending,
            poisoned_count: counts.poisoned,
            last_sync_time: tracking.last_sync_time,
        })
    }

    pub async fn sync_stats(&self) -> supportdesk::Result<SyncStats> {
        let counts = self.store.queue_counts().await?;
        let tracking = self.tracking();
        Ok(SyncStats {
            pending_count: counts.pending,
            poisoned_count: counts.poisoned,
            last_sync_time: tracking.last_sync_time,
            passes: tracking.passes,
            pushed_total: tracking.pushed_total,
            failed_total: tracking.failed_total,
            last_report: tracking.last_report.clone(),
        })
    }

    /// Run one push/pull pass. Returns `None` when skipped because another
    /// pass is running or the client is offline.
    pub async fn sync_all(&self) -> Option<SyncReport> {
        if !self.connectivity.is_online() {
            tracing::debug!("[SYNC] offline, pass skipped");
            return None;
        }
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("[SYNC] pass already running, skipped");
            return None;
        }
        let _guard = PassGuard(&self.is_syncing);

        self.events.emit(SyncEvent::SyncStarted);
        let mut report = SyncReport::default();

        match self.push_due(&mut report).await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("[SYNC] push phase failed: {}", e);
                report.error = Some(e.to_string());
            }
        }

        if !report.aborted && report.error.is_none() {
            if let Err(e) = self.pull_changes(&mut report).await {
                tracing::warn!("[SYNC] pull stopped: {}", e);
                if e.is_transport() {
                    report.aborted = true;
                }
                report.error = Some(e.to_string());
            }
        }

        let finished_at = self.clock.now();
        {
            let mut tracking = self.tracking();
            tracking.passes += 1;
            tracking.pushed_total += report.pushed as u64;
            tracking.failed_total += report.failed as u64;
            tracking.phase = Some(if report.is_clean() {
                SyncPhase::Idle
            } else {
                SyncPhase::Backoff
            });
            if !report.aborted {
                tracking.last_sync_time = Some(finished_at);
            }
            tracking.last_report = Some(report.clone());
        }

        tracing::info!(
            "[SYNC {}] pass done: pushed={} failed={} poisoned={} pulled={} applied={} skipped={} aborted={}",
            self.config.client_id,
            report.pushed,
            report.failed,
            report.poisoned,
            report.pulled,
            report.applied,
            report.skipped,
            report.aborted
        );
        match report.error {
            Some(ref error) => self.events.emit(SyncEvent::SyncFailed {
                error: error.clone(),
                report: report.clone(),
            }),
            None => self.events.emit(SyncEvent::SyncCompleted {
                report: report.clone(),
            }),
        }
        Some(report)
    }

    /// Push the entries that were due when the pass started, oldest first.
    async fn push_due(&self, report: &mut SyncReport) -> supportdesk::Result<()> {
        let due = self.store.due_mutations().await?;
        if due.is_empty() {
            return Ok(());
        }
        tracing::debug!("[SYNC] pushing {} due mutations", due.len());

        // entities whose earlier entry failed this pass; later entries wait
        let mut held: HashSet<(EntityKind, String)> = HashSet::new();
        for mutation in due {
            if !self.connectivity.is_online() {
                tracing::info!("[SYNC] went offline mid-pass, stopping push");
                report.aborted = true;
                break;
            }
            let key = (mutation.entity_kind, mutation.entity_id.clone());
            if held.contains(&key) {
                continue;
            }
            if !self.store.claim_mutation(&mutation.id).await? {
                continue;
            }
            let outcome = match self.push_one(&mutation, report).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    if let Err(release_err) = self.store.release_mutation(&mutation.id).await {
                        tracing::error!(
                            "[SYNC] failed to release mutation {}: {}",
                            mutation.id,
                            release_err
                        );
                    }
                    return Err(e);
                }
            };
            match outcome {
                PushOutcome::Acked => {}
                PushOutcome::Failed => {
                    held.insert(key);
                }
                PushOutcome::Abort => {
                    report.aborted = true;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn push_one(
        &self,
        mutation: &PendingMutation,
        report: &mut SyncReport,
    ) -> supportdesk::Result<PushOutcome> {
        let request = PushRequest::from_mutation(mutation, &self.config.client_id);
        let result = match tokio::time::timeout(
            self.config.request_timeout(),
            self.remote.push(request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(self.config.request_timeout_ms)),
        };

        match result {
            Ok(resp) => {
                self.store.acknowledge_mutation(&mutation.id).await?;
                report.pushed += 1;
                tracing::debug!(
                    "[SYNC] {} {} {} acked (applied={})",
                    mutation.operation.as_str(),
                    mutation.entity_kind,
                    mutation.entity_id,
                    resp.applied
                );
                Ok(PushOutcome::Acked)
            }
            Err(e) => {
                let attempt = mutation.attempt_count + 1;
                let next_attempt_at = self.config.backoff().next_attempt_at(self.clock.now(), attempt);
                // permanent rejections are parked right away
                let max_attempts = if e.is_retryable() {
                    self.config.max_attempts
                } else {
                    attempt
                };
                let state = self
                    .store
                    .record_mutation_failure(&mutation.id, &e.to_string(), next_attempt_at, max_attempts)
                    .await?;
                report.failed += 1;
                if state == MutationState::Poisoned {
                    report.poisoned += 1;
                    tracing::error!(
                        "[SYNC] mutation {} ({} {}) poisoned after {} attempts: {}",
                        mutation.id,
                        mutation.entity_kind,
                        mutation.entity_id,
                        attempt,
                        e
                    );
                } else {
                    tracing::warn!(
                        "[SYNC] push of {} failed (attempt {}), retry at {}: {}",
                        mutation.id,
                        attempt,
                        next_attempt_at,
                        e
                    );
                }
                Ok(if e.is_transport() {
                    PushOutcome::Abort
                } else {
                    PushOutcome::Failed
                })
            }
        }
    }

    /// Merge the remote's changes since the stored cursor. A record the
    /// store rejects is skipped; any other failure stops the pull with the
    /// cursor unchanged, so the same changes are fetched again next pass.
    async fn pull_changes(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let cursor = self.store.sync_cursor().await?;

        let response = match tokio::time::timeout(
            self.config.request_timeout(),
            self.remote.pull(&self.config.client_id, cursor.as_deref()),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(RemoteError::Timeout(self.config.request_timeout_ms).into()),
        };

        report.pulled = response.changes.len();
        for change in response.changes {
            let label = describe(&change);
            match self.apply_change(change).await {
                Ok(MergeOutcome::Kept) => report.skipped += 1,
                Ok(_) => report.applied += 1,
                Err(SupportDeskError::InvariantViolation(reason)) => {
                    tracing::warn!("[SYNC] skipped pulled {}: {}", label, reason);
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::error!("[SYNC] failed to apply pulled {}, cursor kept: {}", label, e);
                    return Err(e.into());
                }
            }
        }

        if let Some(ref next) = response.cursor {
            self.store.set_sync_cursor(next).await?;
        }
        Ok(())
    }

    async fn apply_change(&self, change: RemoteChange) -> supportdesk::Result<MergeOutcome> {
        match change {
            RemoteChange::Upsert { record } => match record {
                RemoteRecord::Document(d) => self.store.merge_remote(d, merge::resolve_document).await,
                RemoteRecord::Ticket(t) => self.store.merge_remote(t, merge::resolve_ticket).await,
                RemoteRecord::Tag(t) => self.store.merge_remote(t, merge::resolve_tag).await,
                RemoteRecord::Category(c) => self.store.merge_remote(c, merge::resolve_category).await,
            },
            RemoteChange::Delete {
                entity_kind,
                entity_id,
            } => self.store.merge_remote_delete(entity_kind, &entity_id).await,
        }
    }

    /// Start a recurring pass every `interval`. Ticks that arrive while
    /// offline or mid-pass are dropped, never queued.
    pub fn start_auto_sync(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let (stop, mut stopped) = watch::channel(false);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if manager.connectivity.is_online() && !manager.is_syncing() {
                    manager.sync_all().await;
                }
            }
            tracing::debug!("[SYNC] auto-sync loop exited");
        });

        let previous = self
            .auto_sync
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(stop);
        if let Some(previous) = previous {
            let _ = previous.send(true);
        }
        tracing::info!("[SYNC] auto-sync every {:?}", interval);
    }

    /// Cancel the timer. The loop exits between passes; a pass already
    /// running finishes and settles its entries.
    pub fn stop_auto_sync(&self) {
        let stop = self
            .auto_sync
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(stop) = stop {
            let _ = stop.send(true);
            tracing::info!("[SYNC] auto-sync stopped");
        }
    }

    pub fn is_auto_syncing(&self) -> bool {
        self.auto_sync
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Follow connectivity changes: report each one and run a pass when the
    /// client comes back online.
    pub fn watch_connectivity(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut rx = self.connectivity.subscribe();
        let (stop, mut stopped) = watch::channel(false);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.changed() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let online = *rx.borrow_and_update();
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                match manager.status().await {
                    Ok(status) => manager.events.emit(SyncEvent::StatusChanged { status }),
                    Err(e) => tracing::warn!("[SYNC] status unavailable after connectivity change: {}", e),
                }
                if online {
                    manager.sync_all().await;
                }
            }
        });

        let previous = self
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(stop);
        if let Some(previous) = previous {
            let _ = previous.send(true);
        }
    }

    /// Give poisoned entries another round of attempts.
    pub async fn retry_poisoned(&self) -> supportdesk::Result<usize> {
        let n = self.store.retry_poisoned().await?;
        if n > 0 {
            tracing::info!("[SYNC] requeued {} poisoned mutations", n);
        }
        Ok(n)
    }
}

impl<R: RemoteAuthority> Drop for SyncManager<R> {
    fn drop(&mut self) {
        for slot in [&self.auto_sync, &self.watcher] {
            if let Some(stop) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = stop.send(true);
            }
        }
    }
}

fn describe(change: &RemoteChange) -> String {
    match change {
        RemoteChange::Upsert { record } => format!("upsert of {}", record.kind()),
        RemoteChange::Delete {
            entity_kind,
            entity_id,
        } => format!("delete of {} {}", entity_kind, entity_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PullResponse, PushResponse};
    use std::sync::atomic::AtomicUsize;
    use supportdesk::{Category, Document, DocumentType, MutationOp, StoreConfig};
    use tempfile::TempDir;

    /// Scripted remote: fails the first `fail_pushes` pushes, records the rest.
    #[derive(Default)]
    struct ScriptedRemote {
        fail_pushes: Mutex<usize>,
        failure: Option<RemoteError>,
        push_delay: Option<Duration>,
        pushed: Mutex<Vec<PushRequest>>,
        pull: Mutex<PullResponse>,
    }

    impl RemoteAuthority for ScriptedRemote {
        async fn push(&self, request: PushRequest) -> Result<PushResponse, RemoteError> {
            if let Some(delay) = self.push_delay {
                tokio::time::sleep(delay).await;
            }
            {
                let mut left = self.fail_pushes.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(self.failure.clone().unwrap_or(RemoteError::Status {
                        status: 503,
                        body: "busy".into(),
                    }));
                }
            }
            let id = request.mutation_id.clone();
            self.pushed.lock().unwrap().push(request);
            Ok(PushResponse {
                mutation_id: id,
                applied: true,
            })
        }

        async fn pull(
            &self,
            _client_id: &str,
            _since: Option<&str>,
        ) -> Result<PullResponse, RemoteError> {
            Ok(std::mem::take(&mut *self.pull.lock().unwrap()))
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            client_id: "test-client".into(),
            backoff_base_ms: 0,
            backoff_max_ms: 0,
            backoff_jitter: 0.0,
            max_attempts: 2,
            ..SyncConfig::default()
        }
    }

    async fn manager(remote: ScriptedRemote) -> (Arc<SyncManager<ScriptedRemote>>, Arc<LocalStore>) {
        let store = LocalStore::open_in_memory().await.unwrap();
        (manager_for(Arc::clone(&store), remote), store)
    }

    fn manager_for(store: Arc<LocalStore>, remote: ScriptedRemote) -> Arc<SyncManager<ScriptedRemote>> {
        SyncManager::new(store, Arc::new(remote), config(), Arc::new(Connectivity::new(true)))
    }

    fn slow_remote() -> ScriptedRemote {
        ScriptedRemote {
            push_delay: Some(Duration::from_millis(200)),
            ..ScriptedRemote::default()
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..400 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within 2s");
    }

    /// Counts terminal pass events by kind: (completed, failed).
    fn count_outcomes(manager: &SyncManager<ScriptedRemote>) -> Arc<(AtomicUsize, AtomicUsize)> {
        let counts = Arc::new((AtomicUsize::new(0), AtomicUsize::new(0)));
        let sink = Arc::clone(&counts);
        manager.subscribe(move |event| match event {
            SyncEvent::SyncCompleted { .. } => {
                sink.0.fetch_add(1, Ordering::SeqCst);
            }
            SyncEvent::SyncFailed { .. } => {
                sink.1.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        });
        counts
    }

    #[tokio::test]
    async fn test_push_acknowledges_in_order() {
        let (manager, store) = manager(ScriptedRemote::default()).await;
        store.put(Document::new("A", DocumentType::Guide).with_id("a")).await.unwrap();
        store.put(Document::new("B", DocumentType::Guide).with_id("b")).await.unwrap();

        let report = manager.sync_all().await.unwrap();
        assert_eq!(report.pushed, 2);
        assert_eq!(store.pending_count().await.unwrap(), 0);

        let pushed = manager.remote.pushed.lock().unwrap();
        let ids: Vec<_> = pushed.iter().map(|p| p.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(pushed.iter().all(|p| p.client_id == "test-client"));
    }

    #[tokio::test]
    async fn test_failure_keeps_entry_then_poisons() {
        let remote = ScriptedRemote {
            fail_pushes: Mutex::new(usize::MAX),
            ..ScriptedRemote::default()
        };
        let (manager, store) = manager(remote).await;
        store.put(Document::new("A", DocumentType::Guide).with_id("a")).await.unwrap();

        let first = manager.sync_all().await.unwrap();
        assert_eq!(first.failed, 1);
        let entry = &store.pending_mutations(None).await.unwrap()[0];
        assert_eq!(entry.attempt_count, 1);
        assert!(entry.last_error.as_deref().unwrap_or("").contains("503"));
        assert_eq!(manager.status().await.unwrap().phase, SyncPhase::Backoff);

        let second = manager.sync_all().await.unwrap();
        assert_eq!(second.poisoned, 1);
        assert_eq!(store.poisoned_count().await.unwrap(), 1);

        // parked, but never dropped
        assert_eq!(store.pending_count().await.unwrap(), 1);
        assert!(manager.sync_all().await.unwrap().pushed == 0);

        assert_eq!(manager.retry_poisoned().await.unwrap(), 1);
        assert_eq!(store.poisoned_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_entry_holds_back_later_entries_for_same_entity() {
        let remote = ScriptedRemote {
            fail_pushes: Mutex::new(1),
            ..ScriptedRemote::default()
        };
        let (manager, store) = manager(remote).await;
        store.put(Document::new("A", DocumentType::Guide).with_id("a")).await.unwrap();
        store.record_view(EntityKind::Document, "a").await.unwrap();
        store.put(Document::new("B", DocumentType::Guide).with_id("b")).await.unwrap();

        let report = manager.sync_all().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.pushed, 1);
        {
            let pushed = manager.remote.pushed.lock().unwrap();
            assert_eq!(pushed.len(), 1);
            assert_eq!(pushed[0].entity_id, "b");
        }

        let report = manager.sync_all().await.unwrap();
        assert_eq!(report.pushed, 2);
        let pushed = manager.remote.pushed.lock().unwrap();
        let ops: Vec<_> = pushed.iter().skip(1).map(|p| p.operation).collect();
        assert_eq!(ops, vec![MutationOp::Create, MutationOp::IncrementView]);
    }

    #[tokio::test]
    async fn test_permanent_rejection_poisons_immediately() {
        let remote = ScriptedRemote {
            fail_pushes: Mutex::new(1),
            failure: Some(RemoteError::Status {
                status: 422,
                body: "bad payload".into(),
            }),
            ..ScriptedRemote::default()
        };
        let (manager, store) = manager(remote).await;
        store.put(Document::new("A", DocumentType::Guide)).await.unwrap();

        let report = manager.sync_all().await.unwrap();
        assert_eq!(report.poisoned, 1);
        assert_eq!(store.poisoned_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_offline_pass_is_skipped() {
        let (manager, store) = manager(ScriptedRemote::default()).await;
        store.put(Document::new("A", DocumentType::Guide)).await.unwrap();
        manager.connectivity.set_online(false);

        assert!(manager.sync_all().await.is_none());
        assert_eq!(store.pending_count().await.unwrap(), 1);
        assert_eq!(manager.sync_stats().await.unwrap().passes, 0);
    }

    #[tokio::test]
    async fn test_pull_applies_and_persists_cursor() {
        let remote = ScriptedRemote::default();
        *remote.pull.lock().unwrap() = PullResponse {
            changes: vec![
                RemoteChange::Upsert {
                    record: RemoteRecord::Document(
                        Document::new("From server", DocumentType::Manual).with_id("srv-1"),
                    ),
                },
                RemoteChange::Delete {
                    entity_kind: EntityKind::Document,
                    entity_id: "gone".into(),
                },
            ],
            cursor: Some("c-17".into()),
        };
        let (manager, store) = manager(remote).await;

        let report = manager.sync_all().await.unwrap();
        assert_eq!(report.pulled, 2);
        assert_eq!(report.applied, 1);
        assert!(store.get::<Document>("srv-1").await.unwrap().is_some());
        assert_eq!(store.sync_cursor().await.unwrap().as_deref(), Some("c-17"));
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_increment_payload_carries_delta() {
        let (manager, store) = manager(ScriptedRemote::default()).await;
        store.put(Document::new("A", DocumentType::Guide).with_id("a")).await.unwrap();
        store.record_view(EntityKind::Document, "a").await.unwrap();
        store.record_view(EntityKind::Document, "a").await.unwrap();

        manager.sync_all().await.unwrap();
        let pushed = manager.remote.pushed.lock().unwrap();
        let inc = pushed
            .iter()
            .find(|p| p.operation == MutationOp::IncrementView)
            .unwrap();
        assert_eq!(inc.payload["delta"], 2);
    }

    #[tokio::test]
    async fn test_store_failure_during_pull_keeps_cursor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        let store = LocalStore::open(StoreConfig::at(&path)).await.unwrap();
        store.put(Document::new("Local", DocumentType::Guide).with_id("d1")).await.unwrap();
        store.set_sync_cursor("c-1").await.unwrap();

        let remote = ScriptedRemote::default();
        *remote.pull.lock().unwrap() = PullResponse {
            changes: vec![
                RemoteChange::Upsert {
                    record: RemoteRecord::Category(Category::new("x", "Loop").with_parent("x")),
                },
                RemoteChange::Upsert {
                    record: RemoteRecord::Document(
                        Document::new("Remote edit", DocumentType::Guide).with_id("d1"),
                    ),
                },
                RemoteChange::Upsert {
                    record: RemoteRecord::Document(
                        Document::new("Never reached", DocumentType::Guide).with_id("d2"),
                    ),
                },
            ],
            cursor: Some("c-2".into()),
        };
        let manager = manager_for(Arc::clone(&store), remote);
        let outcomes = count_outcomes(&manager);

        // the local row for d1 becomes unreadable
        let raw = rusqlite::Connection::open(&path).unwrap();
        raw.execute("UPDATE documents SET payload = 'garbage' WHERE id = 'd1'", [])
            .unwrap();

        let report = manager.sync_all().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.applied, 0);
        assert!(report.error.is_some());
        assert!(!report.aborted);
        assert_eq!(store.sync_cursor().await.unwrap().as_deref(), Some("c-1"));
        assert!(store.get::<Document>("d2").await.unwrap().is_none());
        assert_eq!(outcomes.0.load(Ordering::SeqCst), 0);
        assert_eq!(outcomes.1.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status().await.unwrap().phase, SyncPhase::Backoff);
    }

    #[tokio::test]
    async fn test_status_surfaces_unreadable_queue() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        let store = LocalStore::open(StoreConfig::at(&path)).await.unwrap();
        let manager = manager_for(store, ScriptedRemote::default());
        assert_eq!(manager.status().await.unwrap().pending_count, 0);

        let raw = rusqlite::Connection::open(&path).unwrap();
        raw.execute_batch("DROP TABLE pending_mutations").unwrap();

        assert_eq!(manager.status().await.unwrap_err().code(), "storage_error");
        assert!(manager.sync_stats().await.is_err());
    }

    #[tokio::test]
    async fn test_view_during_pass_is_pushed_once_next_pass() {
        let (manager, store) = manager(slow_remote()).await;
        store.put(Document::new("A", DocumentType::Guide).with_id("a")).await.unwrap();
        store.record_view(EntityKind::Document, "a").await.unwrap();

        let pass = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.sync_all().await })
        };
        for _ in 0..400 {
            let in_flight = store
                .pending_mutations(Some(MutationState::InFlight))
                .await
                .unwrap();
            if in_flight.iter().any(|m| m.operation == MutationOp::IncrementView) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.record_view(EntityKind::Document, "a").await.unwrap(), 2);

        let first = pass.await.unwrap().unwrap();
        assert_eq!(first.pushed, 2);
        assert_eq!(store.pending_count().await.unwrap(), 1);

        let second = manager.sync_all().await.unwrap();
        assert_eq!(second.pushed, 1);
        assert_eq!(store.pending_count().await.unwrap(), 0);

        let pushed = manager.remote.pushed.lock().unwrap();
        let increments: Vec<_> = pushed
            .iter()
            .filter(|p| p.operation == MutationOp::IncrementView)
            .collect();
        assert_eq!(increments.len(), 2);
        assert_ne!(increments[0].mutation_id, increments[1].mutation_id);
        let total: u64 = increments
            .iter()
            .map(|p| p.payload["delta"].as_u64().unwrap())
            .sum();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_disturb_a_pass() {
        let (manager, store) = manager(ScriptedRemote::default()).await;
        store.put(Document::new("A", DocumentType::Guide)).await.unwrap();

        manager.subscribe(|_| panic!("handler bug"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

        let report = manager.sync_all().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert!(report.is_clean());
        assert!(!manager.is_syncing());
        assert_eq!(store.pending_count().await.unwrap(), 0);

        {
            let events = seen.lock().unwrap();
            assert_eq!(events.len(), 2);
            assert_eq!(events[0], SyncEvent::SyncStarted);
            assert!(matches!(events[1], SyncEvent::SyncCompleted { ref report } if report.pushed == 1));
        }
        assert!(manager.sync_all().await.is_some());
    }

    #[tokio::test]
    async fn test_stop_lets_the_running_pass_finish() {
        let (manager, store) = manager(slow_remote()).await;
        let outcomes = count_outcomes(&manager);
        store.put(Document::new("A", DocumentType::Guide)).await.unwrap();

        manager.start_auto_sync(Duration::from_millis(20));
        wait_until(|| manager.is_syncing()).await;
        manager.stop_auto_sync();
        assert!(!manager.is_auto_syncing());

        wait_until(|| outcomes.0.load(Ordering::SeqCst) == 1).await;
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert!(store
            .pending_mutations(Some(MutationState::InFlight))
            .await
            .unwrap()
            .is_empty());

        // no further ticks after the stop
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(outcomes.0.load(Ordering::SeqCst), 1);
        assert_eq!(manager.remote.pushed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dropping_the_manager_mid_pass_still_acknowledges() {
        let (manager, store) = manager(slow_remote()).await;
        store.put(Document::new("A", DocumentType::Guide)).await.unwrap();

        manager.start_auto_sync(Duration::from_millis(20));
        wait_until(|| manager.is_syncing()).await;
        drop(manager);

        for _ in 0..400 {
            if store.pending_count().await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_auto_sync_is_idempotent() {
        let (manager, _store) = manager(ScriptedRemote::default()).await;
        manager.start_auto_sync(Duration::from_secs(30));
        assert!(manager.is_auto_syncing());

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;

        manager.stop_auto_sync();
        manager.stop_auto_sync();
        assert!(!manager.is_auto_syncing());
    }
}
