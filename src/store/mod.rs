//! Embedded local entity store.
//!
//! `LocalStore` holds Documents, SupportTickets, Tags and Categories in SQLite
//! along with the pending-mutation log. Every local write commits the entity,
//! its tag/token index rows and exactly one pending mutation in a single
//! transaction. Writes that come from a sync pull go through
//! [`LocalStore::merge_remote`] and never enqueue anything.
//!
//! SQLite work runs on the blocking pool behind one connection mutex, so
//! operations are serialized in the order they acquire the lock and readers
//! only ever see committed state.

mod entity;
mod index;
pub(crate) mod pending;
mod schema;

pub use entity::{Entity, TokenField, WriteOrigin};
pub use schema::STORE_VERSION;

pub(crate) use entity::{decode_ts, encode_ts, load, table_for};

use entity::row_key;

use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::error::{Result, SupportDeskError};
use crate::types::{
    Attachment, EntityKind, MutationOp, MutationState, NewTicket, Page, Pagination,
    PendingMutation, SupportTicket, Tag, TicketStatus,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::sync::{Arc, Mutex};

const META_SYNC_CURSOR: &str = "sync_cursor";

/// What the store already holds locally for an entity that a pull is about
/// to overwrite.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalState {
    /// Increment deltas not yet acknowledged by the remote.
    pub unsent_delta: u64,
    /// Status set by an unacknowledged local ticket write.
    pub pending_status: Option<TicketStatus>,
    /// Any unacknowledged mutation targets this entity.
    pub has_pending: bool,
}

/// Decision returned by a merge resolver.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    Keep,
    Write(T),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Replaced,
    Kept,
    Deleted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    /// Entries not yet acknowledged, poisoned ones included.
    pub pending: usize,
    pub poisoned: usize,
}

pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
}

impl LocalStore {
    pub async fn open(config: StoreConfig) -> Result<Arc<Self>> {
        Self::open_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Open (or create) the store, run pending migrations, and recover
    /// entries a previous process left in flight.
    pub async fn open_with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        let path = config.path.clone();
        let seed_tags = config.seed_tags.clone();
        let now = clock.now();

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let mut conn = match path {
                Some(ref p) => {
                    if let Some(parent) = p.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    Connection::open(p)?
                }
                None => Connection::open_in_memory()?,
            };
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

            let found = schema::migrate(&mut conn)?;
            let released = pending::release_all_in_flight(&conn)?;
            if released > 0 {
                tracing::warn!(
                    "[STORE] {} mutations were in flight at last shutdown, requeued",
                    released
                );
            }

            if found == 0 && !seed_tags.is_empty() {
                let tx = conn.transaction()?;
                for name in &seed_tags {
                    if load::<Tag>(&tx, name)?.is_none() {
                        let tag = Tag {
                            name: name.clone(),
                            count: 0,
                            updated_at: now,
                        };
                        write_entity(&tx, &tag)?;
                    }
                }
                tx.commit()?;
            }

            tracing::info!(
                "[STORE] opened {} (version {})",
                path.as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| ":memory:".to_string()),
                STORE_VERSION
            );
            Ok(conn)
        })
        .await??;

        Ok(Arc::new(LocalStore {
            conn: Arc::new(Mutex::new(conn)),
            clock,
            config,
        }))
    }

    pub async fn open_in_memory() -> Result<Arc<Self>> {
        Self::open(StoreConfig::in_memory()).await
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Run `f` against the connection on the blocking pool.
    pub(crate) async fn run<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| SupportDeskError::Storage("store connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await?
    }

    pub async fn get<T: Entity>(&self, id: &str) -> Result<Option<T>> {
        let id = id.to_string();
        self.run(move |conn| load::<T>(conn, &id)).await
    }

    /// Like [`get`](Self::get) but absence is an error.
    pub async fn require<T: Entity>(&self, id: &str) -> Result<T> {
        self.get::<T>(id)
            .await?
            .ok_or_else(|| SupportDeskError::not_found(T::KIND, id))
    }

    /// All records of one kind, newest first.
    pub async fn list<T: Entity>(&self, page: Pagination) -> Result<Page<T>> {
        self.run(move |conn| {
            let table = table_for(T::KIND);
            let total: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
            let mut stmt = conn.prepare(&format!(
                "SELECT payload FROM {} ORDER BY updated_at DESC, id LIMIT ?1 OFFSET ?2",
                table
            ))?;
            let payloads = stmt
                .query_map(params![page.limit as i64, page.offset as i64], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let items = payloads
                .iter()
                .map(|p| serde_json::from_str(p))
                .collect::<serde_json::Result<Vec<T>>>()?;
            Ok(Page {
                items,
                total_count: total as usize,
            })
        })
        .await
    }

    /// Every record of one kind, newest first. For small collections such as
    /// categories and tags.
    pub async fn all<T: Entity>(&self) -> Result<Vec<T>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT payload FROM {} ORDER BY updated_at DESC, id",
                table_for(T::KIND)
            ))?;
            let payloads = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            payloads
                .iter()
                .map(|p| serde_json::from_str(p).map_err(Into::into))
                .collect()
        })
        .await
    }

    /// Upsert a record from a local edit. Invariants are checked against the
    /// committed version first; on any failure nothing is written.
    pub async fn put<T: Entity>(&self, entity: T) -> Result<T> {
        let now = self.clock.now();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let committed = put_local(&tx, entity, now)?;
            tx.commit()?;
            Ok(committed)
        })
        .await
    }

    /// Delete a record from a local edit and queue the delete.
    pub async fn remove<T: Entity>(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        let now = self.clock.now();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            if load::<T>(&tx, &id)?.is_none() {
                return Err(SupportDeskError::not_found(T::KIND, id));
            }
            if T::KIND == EntityKind::Category {
                let children: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM categories WHERE json_extract(payload, '$.parentId') = ?1",
                    params![id],
                    |row| row.get(0),
                )?;
                if children > 0 {
                    return Err(SupportDeskError::InvariantViolation(format!(
                        "category {} still has {} child categories",
                        id, children
                    )));
                }
            }
            delete_entity(&tx, T::KIND, &id)?;
            pending::enqueue(&tx, T::KIND, &id, MutationOp::Delete, serde_json::json!({}), now)?;
            tx.commit()?;
            tracing::debug!("[STORE] removed {} {}", T::KIND, id);
            Ok(())
        })
        .await
    }

    /// Merge a record pulled from the remote authority.
    ///
    /// `resolve` sees the committed local version (if any), the incoming one
    /// and the local pending state, and decides what to keep. The decision
    /// and the write happen in one transaction. Nothing is enqueued.
    pub async fn merge_remote<T, F>(&self, remote: T, resolve: F) -> Result<MergeOutcome>
    where
        T: Entity,
        F: FnOnce(Option<&T>, T, &LocalState) -> Resolution<T> + Send + 'static,
    {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let previous = load::<T>(&tx, remote.id())?;
            // queue entries carry the local spelling of the id
            let id = previous
                .as_ref()
                .map_or_else(|| remote.id().to_string(), |p| p.id().to_string());
            let local = LocalState {
                unsent_delta: pending::unsent_delta(&tx, T::KIND, &id)?,
                pending_status: if T::KIND == EntityKind::Ticket {
                    pending::pending_status(&tx, &id)?
                } else {
                    None
                },
                has_pending: pending::has_pending(&tx, T::KIND, &id)?,
            };

            let merged = match resolve(previous.as_ref(), remote, &local) {
                Resolution::Keep => return Ok(MergeOutcome::Kept),
                Resolution::Write(merged) => merged,
            };
            if row_key(T::KIND, merged.id()) != row_key(T::KIND, &id) {
                return Err(SupportDeskError::InvariantViolation(format!(
                    "merge changed {} id {} -> {}",
                    T::KIND,
                    id,
                    merged.id()
                )));
            }

            merged.validate()?;
            merged.check_invariants(previous.as_ref(), &tx, WriteOrigin::Remote)?;

            let outcome = match previous {
                Some(ref prev) => {
                    if serde_json::to_value(prev)? == serde_json::to_value(&merged)? {
                        return Ok(MergeOutcome::Kept);
                    }
                    MergeOutcome::Replaced
                }
                None => MergeOutcome::Inserted,
            };
            write_entity(&tx, &merged)?;
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    /// Write a remote record as-is, without conflict resolution. Used for
    /// bootstrap imports into an empty store.
    pub async fn apply_remote<T: Entity>(&self, remote: T) -> Result<MergeOutcome> {
        self.merge_remote(remote, |_, remote, _| Resolution::Write(remote))
            .await
    }

    /// Apply a delete pulled from the remote. Entities with unacknowledged
    /// local mutations are kept; the local intent is pushed on the next pass.
    pub async fn merge_remote_delete(&self, kind: EntityKind, id: &str) -> Result<MergeOutcome> {
        let id = id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let local_id = match kind {
                EntityKind::Tag => load::<Tag>(&tx, &id)?.map_or_else(|| id.clone(), |t| t.name),
                _ => id.clone(),
            };
            if pending::has_pending(&tx, kind, &local_id)? {
                return Ok(MergeOutcome::Kept);
            }
            let removed = delete_entity(&tx, kind, &id)?;
            tx.commit()?;
            Ok(if removed {
                MergeOutcome::Deleted
            } else {
                MergeOutcome::Kept
            })
        })
        .await
    }

    /// Open a new ticket with status `new`. Returns the committed ticket.
    pub async fn create_ticket(&self, fields: NewTicket) -> Result<SupportTicket> {
        let now = self.clock.now();
        let ticket = fields.into_ticket(uuid::Uuid::new_v4().to_string(), now);
        self.put(ticket).await
    }

    /// Move a ticket along its lifecycle.
    pub async fn transition_ticket(&self, id: &str, status: TicketStatus) -> Result<SupportTicket> {
        let id = id.to_string();
        let now = self.clock.now();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let previous = load::<SupportTicket>(&tx, &id)?
                .ok_or_else(|| SupportDeskError::not_found(EntityKind::Ticket, &id))?;
            if !previous.status.can_transition_to(status) {
                return Err(SupportDeskError::InvalidTransition {
                    from: previous.status.to_string(),
                    to: status.to_string(),
                });
            }

            let mut ticket = previous.clone();
            ticket.status = status;
            ticket.updated_at = now;
            ticket.check_invariants(Some(&previous), &tx, WriteOrigin::Local)?;
            write_entity(&tx, &ticket)?;
            pending::enqueue(
                &tx,
                EntityKind::Ticket,
                &id,
                MutationOp::TransitionStatus,
                serde_json::json!({
                    "from": previous.status,
                    "status": status,
                    "updatedAt": ticket.updated_at,
                }),
                now,
            )?;
            tx.commit()?;
            tracing::info!("[STORE] ticket {} {} -> {}", id, previous.status, status);
            Ok(ticket)
        })
        .await
    }

    pub async fn add_ticket_attachment(
        &self,
        id: &str,
        attachment: Attachment,
    ) -> Result<SupportTicket> {
        let mut ticket = self.require::<SupportTicket>(id).await?;
        ticket.attachments.push(attachment);
        self.put(ticket).await
    }

    /// Entries a sync pass may push now, in creation order.
    pub async fn due_mutations(&self) -> Result<Vec<PendingMutation>> {
        let now = self.clock.now();
        self.run(move |conn| pending::due(conn, now)).await
    }

    pub async fn pending_mutations(
        &self,
        state: Option<MutationState>,
    ) -> Result<Vec<PendingMutation>> {
        self.run(move |conn| pending::list(conn, state)).await
    }

    pub async fn claim_mutation(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.run(move |conn| pending::claim(conn, &id)).await
    }

    pub async fn release_mutation(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| pending::release(conn, &id)).await
    }

    pub async fn acknowledge_mutation(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.run(move |conn| pending::acknowledge(conn, &id)).await
    }

    pub async fn record_mutation_failure(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<MutationState> {
        let id = id.to_string();
        let error = error.to_string();
        self.run(move |conn| pending::record_failure(conn, &id, &error, next_attempt_at, max_attempts))
            .await
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts> {
        self.run(|conn| {
            let (pending, poisoned) = pending::counts(conn)?;
            Ok(QueueCounts { pending, poisoned })
        })
        .await
    }

    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self.queue_counts().await?.pending)
    }

    pub async fn poisoned_count(&self) -> Result<usize> {
        Ok(self.queue_counts().await?.poisoned)
    }

    /// Give poisoned entries a fresh set of attempts.
    pub async fn retry_poisoned(&self) -> Result<usize> {
        self.run(|conn| pending::retry_poisoned(conn)).await
    }

    pub async fn sync_cursor(&self) -> Result<Option<String>> {
        self.run(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM store_meta WHERE key = ?1",
                    params![META_SYNC_CURSOR],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    pub async fn set_sync_cursor(&self, cursor: &str) -> Result<()> {
        let cursor = cursor.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO store_meta (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![META_SYNC_CURSOR, cursor],
            )?;
            Ok(())
        })
        .await
    }
}

/// Local upsert inside an open transaction: validate, stamp, write, enqueue.
pub(crate) fn put_local<T: Entity>(tx: &Transaction<'_>, mut entity: T, now: DateTime<Utc>) -> Result<T> {
    entity.validate()?;
    let previous = load::<T>(tx, entity.id())?;
    if let Some(ref prev) = previous {
        entity.absorb_local(prev);
    }
    entity.set_updated_at(now);
    entity.check_invariants(previous.as_ref(), tx, WriteOrigin::Local)?;

    let (op, payload) = match previous {
        None => (MutationOp::Create, serde_json::to_value(&entity)?),
        Some(ref prev) => {
            let diff = diff_fields(&serde_json::to_value(prev)?, &serde_json::to_value(&entity)?);
            (MutationOp::Update, diff)
        }
    };

    write_entity(tx, &entity)?;
    pending::enqueue(tx, T::KIND, entity.id(), op, payload, now)?;
    tracing::debug!("[STORE] {} {} {}", op.as_str(), T::KIND, entity.id());
    Ok(entity)
}

pub(crate) fn write_entity<T: Entity>(tx: &Transaction<'_>, entity: &T) -> Result<()> {
    let table = table_for(T::KIND);
    tx.execute(
        &format!(
            "INSERT INTO {} (id, updated_at, payload) VALUES (?1, ?2, ?3) \
             ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at, payload = excluded.payload",
            table
        ),
        params![
            row_key(T::KIND, entity.id()),
            encode_ts(entity.updated_at()),
            serde_json::to_string(entity)?
        ],
    )?;
    if let Some(count) = entity.usage_count() {
        tx.execute(
            "UPDATE tags SET count = ?1 WHERE id = ?2",
            params![count as i64, row_key(T::KIND, entity.id())],
        )?;
    }
    index::reindex(tx, entity)
}

fn delete_entity(tx: &Transaction<'_>, kind: EntityKind, id: &str) -> Result<bool> {
    let n = tx.execute(
        &format!("DELETE FROM {} WHERE id = ?1", table_for(kind)),
        params![row_key(kind, id)],
    )?;
    index::clear(tx, kind, id)?;
    Ok(n > 0)
}

/// Top-level fields that differ between two JSON objects. `views` is left
/// out; it only travels as increment deltas.
fn diff_fields(old: &serde_json::Value, new: &serde_json::Value) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    if let (Some(old), Some(new)) = (old.as_object(), new.as_object()) {
        for (key, value) in new {
            if key == "views" {
                continue;
            }
            if old.get(key) != Some(value) {
                out.insert(key.clone(), value.clone());
            }
        }
        for key in old.keys() {
            if !new.contains_key(key) {
                out.insert(key.clone(), serde_json::Value::Null);
            }
        }
    }
    serde_json::Value::Object(out)
}
