//! Persisted layout and migrations.
//!
//! The store version lives in `PRAGMA user_version`. Migrations are applied in
//! order on open, before the first query runs. Unlike a cache, this store holds
//! unsynced user writes, so an old layout is migrated forward, never rebuilt.

use crate::error::{Result, SupportDeskError};
use crate::search::tokenizer::normalize;
use crate::types::Tag;
use rusqlite::{params, Connection, Transaction};
use std::collections::BTreeMap;

/// Current store version identifier.
pub const STORE_VERSION: i64 = 3;

enum Migration {
    Sql(&'static str),
    Code(fn(&Transaction<'_>) -> Result<()>),
}

const MIGRATIONS: &[Migration] = &[
    // v1: entity collections, tag index and the pending-mutation log
    Migration::Sql(r#"
    CREATE TABLE documents (
        id TEXT PRIMARY KEY,
        updated_at TEXT NOT NULL,
        payload TEXT NOT NULL
    );
    CREATE TABLE tickets (
        id TEXT PRIMARY KEY,
        updated_at TEXT NOT NULL,
        payload TEXT NOT NULL
    );
    CREATE TABLE categories (
        id TEXT PRIMARY KEY,
        updated_at TEXT NOT NULL,
        payload TEXT NOT NULL
    );
    CREATE TABLE tags (
        id TEXT PRIMARY KEY COLLATE NOCASE,
        updated_at TEXT NOT NULL,
        payload TEXT NOT NULL,
        count INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE entity_tags (
        kind TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        tag TEXT NOT NULL,
        PRIMARY KEY (kind, entity_id, tag)
    );
    CREATE TABLE pending_mutations (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        kind TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        op TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at TEXT NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        next_attempt_at TEXT,
        state TEXT NOT NULL DEFAULT 'pending'
    );
    CREATE TABLE store_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    CREATE INDEX idx_documents_updated ON documents(updated_at);
    CREATE INDEX idx_tickets_updated ON tickets(updated_at);
    CREATE INDEX idx_tags_count ON tags(count);
    CREATE INDEX idx_entity_tags_tag ON entity_tags(kind, tag);
    CREATE INDEX idx_pending_entity ON pending_mutations(kind, entity_id);
    CREATE INDEX idx_pending_state ON pending_mutations(state);
    "#),
    // v2: token index for text queries
    Migration::Sql(r#"
    CREATE TABLE search_tokens (
        kind TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        field TEXT NOT NULL,
        token TEXT NOT NULL,
        PRIMARY KEY (kind, entity_id, field, token)
    );
    CREATE INDEX idx_search_tokens_token ON search_tokens(kind, token);
    "#),
    // v3: sent flag on queued entries, Unicode-folded tag keys
    Migration::Code(rekey_tags_and_mark_sent),
];

/// Tags were keyed with SQLite's ASCII-only NOCASE collation. Rebuild the
/// table keyed by the folded name, merging spellings that now collide, and
/// fold the tag column of the membership index the same way.
fn rekey_tags_and_mark_sent(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        "ALTER TABLE pending_mutations ADD COLUMN sent INTEGER NOT NULL DEFAULT 0;
         UPDATE pending_mutations SET sent = 1 WHERE attempt_count > 0 OR state != 'pending';",
    )?;

    let mut merged: BTreeMap<String, Tag> = BTreeMap::new();
    {
        let mut stmt = tx.prepare("SELECT payload FROM tags ORDER BY updated_at")?;
        let payloads = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for p in payloads {
            let tag: Tag = serde_json::from_str(&p)?;
            match merged.get_mut(&normalize(&tag.name)) {
                Some(existing) => {
                    existing.count += tag.count;
                    existing.updated_at = existing.updated_at.max(tag.updated_at);
                }
                None => {
                    merged.insert(normalize(&tag.name), tag);
                }
            }
        }
    }

    tx.execute_batch(
        "DROP INDEX idx_tags_count;
         DROP TABLE tags;
         CREATE TABLE tags (
             id TEXT PRIMARY KEY,
             updated_at TEXT NOT NULL,
             payload TEXT NOT NULL,
             count INTEGER NOT NULL DEFAULT 0
         );
         CREATE INDEX idx_tags_count ON tags(count);",
    )?;
    for (key, tag) in &merged {
        tx.execute(
            "INSERT INTO tags (id, updated_at, payload, count) VALUES (?1, ?2, ?3, ?4)",
            params![
                key,
                super::entity::encode_ts(tag.updated_at),
                serde_json::to_string(tag)?,
                tag.count as i64
            ],
        )?;
    }

    let rows = {
        let mut stmt = tx.prepare("SELECT kind, entity_id, tag FROM entity_tags")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };
    tx.execute("DELETE FROM entity_tags", [])?;
    for (kind, entity_id, tag) in rows {
        tx.execute(
            "INSERT OR IGNORE INTO entity_tags (kind, entity_id, tag) VALUES (?1, ?2, ?3)",
            params![kind, entity_id, normalize(&tag)],
        )?;
    }
    Ok(())
}

pub(crate) fn current_version(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Bring the store up to [`STORE_VERSION`]. Returns the version found on disk.
pub(crate) fn migrate(conn: &mut Connection) -> Result<i64> {
    let found = current_version(conn)?;

    if found > STORE_VERSION {
        return Err(SupportDeskError::Storage(format!(
            "store version {} is newer than supported version {}",
            found, STORE_VERSION
        )));
    }

    for (idx, step) in MIGRATIONS.iter().enumerate() {
        let version = idx as i64 + 1;
        if version <= found {
            continue;
        }
        let tx = conn.transaction()?;
        match step {
            Migration::Sql(sql) => tx.execute_batch(sql)?,
            Migration::Code(apply) => apply(&tx)?,
        }
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        tracing::info!("[STORE] migrated store to version {}", version);
    }

    Ok(found)
}
