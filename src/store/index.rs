//! Tag membership and token rows kept beside each entity.
//!
//! Both tables are rewritten in the entity's write transaction, so a reader
//! never sees an entity whose index rows disagree with its payload.

use super::entity::Entity;
use crate::error::Result;
use crate::search::tokenizer::{normalize, tokenize};
use crate::types::EntityKind;
use rusqlite::{params, Transaction};

pub(crate) fn reindex<T: Entity>(tx: &Transaction<'_>, entity: &T) -> Result<()> {
    let kind = T::KIND.as_str();
    let id = entity.id();
    clear(tx, T::KIND, id)?;

    if let Some(tags) = entity.tags() {
        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO entity_tags (kind, entity_id, tag) VALUES (?1, ?2, ?3)",
        )?;
        for tag in tags {
            stmt.execute(params![kind, id, normalize(tag)])?;
        }
    }

    let mut stmt = tx.prepare_cached(
        "INSERT OR IGNORE INTO search_tokens (kind, entity_id, field, token) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (field, text) in entity.indexed_text() {
        for token in tokenize(text) {
            stmt.execute(params![kind, id, field.as_str(), token])?;
        }
    }
    Ok(())
}

pub(crate) fn clear(tx: &Transaction<'_>, kind: EntityKind, id: &str) -> Result<()> {
    tx.execute(
        "DELETE FROM entity_tags WHERE kind = ?1 AND entity_id = ?2",
        params![kind.as_str(), id],
    )?;
    tx.execute(
        "DELETE FROM search_tokens WHERE kind = ?1 AND entity_id = ?2",
        params![kind.as_str(), id],
    )?;
    Ok(())
}
