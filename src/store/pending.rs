//! The durable pending-mutation log.
//!
//! Entries are appended in the same transaction as the entity write they
//! describe and removed only when the remote authority acknowledges them.
//! An entry moves pending -> in-flight while its push is outstanding and back
//! to pending on failure. After `max_attempts` failures it is parked as
//! poisoned; it is never deleted without an acknowledgment.

use super::entity::{decode_ts, encode_ts};
use crate::error::{Result, SupportDeskError};
use crate::types::{EntityKind, MutationOp, MutationState, PendingMutation, TicketStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;

const SELECT_COLUMNS: &str = "seq, id, kind, entity_id, op, payload, created_at, attempt_count, \
                              last_error, next_attempt_at, state, sent";

fn from_row(row: &Row<'_>) -> rusqlite::Result<RawMutation> {
    Ok(RawMutation {
        seq: row.get(0)?,
        id: row.get(1)?,
        kind: row.get(2)?,
        entity_id: row.get(3)?,
        op: row.get(4)?,
        payload: row.get(5)?,
        created_at: row.get(6)?,
        attempt_count: row.get(7)?,
        last_error: row.get(8)?,
        next_attempt_at: row.get(9)?,
        state: row.get(10)?,
        sent: row.get(11)?,
    })
}

struct RawMutation {
    seq: i64,
    id: String,
    kind: String,
    entity_id: String,
    op: String,
    payload: String,
    created_at: String,
    attempt_count: u32,
    last_error: Option<String>,
    next_attempt_at: Option<String>,
    state: String,
    sent: bool,
}

impl RawMutation {
    fn decode(self) -> Result<PendingMutation> {
        let corrupt = |what: &str, value: &str| {
            SupportDeskError::Storage(format!("corrupt pending mutation {}: {} '{}'", self.id, what, value))
        };
        Ok(PendingMutation {
            entity_kind: EntityKind::parse(&self.kind).ok_or_else(|| corrupt("kind", &self.kind))?,
            operation: MutationOp::parse(&self.op).ok_or_else(|| corrupt("op", &self.op))?,
            state: MutationState::parse(&self.state).ok_or_else(|| corrupt("state", &self.state))?,
            payload: serde_json::from_str(&self.payload)?,
            created_at: decode_ts(&self.created_at)?,
            next_attempt_at: self.next_attempt_at.as_deref().map(decode_ts).transpose()?,
            id: self.id,
            seq: self.seq,
            entity_id: self.entity_id,
            attempt_count: self.attempt_count,
            last_error: self.last_error,
            sent: self.sent,
        })
    }
}

/// Append one entry describing a local write. Increments coalesce into the
/// newest entry for the same entity when that entry is an increment of the
/// same kind that has never been claimed for a push. Once claimed, an entry's
/// payload is frozen, even after a release or a restart, so one idempotency
/// key never covers two different deltas.
pub(crate) fn enqueue(
    conn: &Connection,
    kind: EntityKind,
    entity_id: &str,
    op: MutationOp,
    payload: serde_json::Value,
    now: DateTime<Utc>,
) -> Result<String> {
    if op.is_increment() {
        let newest = conn
            .query_row(
                &format!(
                    "SELECT {} FROM pending_mutations WHERE kind = ?1 AND entity_id = ?2 \
                     ORDER BY seq DESC LIMIT 1",
                    SELECT_COLUMNS
                ),
                params![kind.as_str(), entity_id],
                from_row,
            )
            .optional()?;

        if let Some(raw) = newest {
            let existing = raw.decode()?;
            if existing.operation == op
                && existing.state == MutationState::Pending
                && !existing.sent
            {
                let delta = existing.delta() + payload.get("delta").and_then(|v| v.as_u64()).unwrap_or(1);
                conn.execute(
                    "UPDATE pending_mutations SET payload = ?1 WHERE seq = ?2",
                    params![serde_json::json!({ "delta": delta }).to_string(), existing.seq],
                )?;
                return Ok(existing.id);
            }
        }
    }

    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO pending_mutations (id, kind, entity_id, op, payload, created_at, state) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending')",
        params![
            id,
            kind.as_str(),
            entity_id,
            op.as_str(),
            payload.to_string(),
            encode_ts(now)
        ],
    )?;
    Ok(id)
}

/// Snapshot of entries a sync pass may push now, in creation order.
///
/// An entry that is still backing off also holds back every later entry for
/// the same entity, so one entity's writes reach the server in order.
pub(crate) fn due(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<PendingMutation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM pending_mutations WHERE state = 'pending' ORDER BY seq",
        SELECT_COLUMNS
    ))?;
    let raws = stmt
        .query_map([], from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut blocked: HashSet<(EntityKind, String)> = HashSet::new();
    let mut out = Vec::new();
    for raw in raws {
        let m = raw.decode()?;
        let key = (m.entity_kind, m.entity_id.clone());
        if blocked.contains(&key) {
            continue;
        }
        if m.next_attempt_at.map(|at| at > now).unwrap_or(false) {
            blocked.insert(key);
            continue;
        }
        out.push(m);
    }
    Ok(out)
}

pub(crate) fn list(conn: &Connection, state: Option<MutationState>) -> Result<Vec<PendingMutation>> {
    let raws = match state {
        Some(s) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM pending_mutations WHERE state = ?1 ORDER BY seq",
                SELECT_COLUMNS
            ))?;
            let rows = stmt.query_map(params![s.as_str()], from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM pending_mutations ORDER BY seq",
                SELECT_COLUMNS
            ))?;
            let rows = stmt.query_map([], from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        }
    };
    raws.into_iter().map(RawMutation::decode).collect()
}

/// Mark an entry as in flight and its payload as frozen. Returns false if it
/// is no longer pending.
pub(crate) fn claim(conn: &Connection, id: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE pending_mutations SET state = 'in-flight', sent = 1 WHERE id = ?1 AND state = 'pending'",
        params![id],
    )?;
    Ok(n == 1)
}

pub(crate) fn acknowledge(conn: &Connection, id: &str) -> Result<bool> {
    let n = conn.execute("DELETE FROM pending_mutations WHERE id = ?1", params![id])?;
    Ok(n == 1)
}

/// Record a failed attempt and schedule the next one. Returns the entry's
/// new state.
pub(crate) fn record_failure(
    conn: &Connection,
    id: &str,
    error: &str,
    next_attempt_at: DateTime<Utc>,
    max_attempts: u32,
) -> Result<MutationState> {
    let attempts: Option<u32> = conn
        .query_row(
            "SELECT attempt_count FROM pending_mutations WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(attempts) = attempts else {
        return Err(SupportDeskError::not_found("pending mutation", id));
    };

    let attempts = attempts + 1;
    let state = if attempts >= max_attempts {
        MutationState::Poisoned
    } else {
        MutationState::Pending
    };
    conn.execute(
        "UPDATE pending_mutations SET attempt_count = ?1, last_error = ?2, next_attempt_at = ?3, \
         state = ?4 WHERE id = ?5",
        params![attempts, error, encode_ts(next_attempt_at), state.as_str(), id],
    )?;
    Ok(state)
}

/// Put an in-flight entry back without counting an attempt. The request may
/// already have reached the remote, so the entry stays marked as sent.
pub(crate) fn release(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE pending_mutations SET state = 'pending' WHERE id = ?1 AND state = 'in-flight'",
        params![id],
    )?;
    Ok(())
}

/// Entries left in flight by a previous process go back to pending.
pub(crate) fn release_all_in_flight(conn: &Connection) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE pending_mutations SET state = 'pending' WHERE state = 'in-flight'",
        [],
    )?)
}

pub(crate) fn retry_poisoned(conn: &Connection) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE pending_mutations SET state = 'pending', attempt_count = 0, next_attempt_at = NULL \
         WHERE state = 'poisoned'",
        [],
    )?)
}

/// (entries awaiting acknowledgment, of which poisoned)
pub(crate) fn counts(conn: &Connection) -> Result<(usize, usize)> {
    Ok(conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN state = 'poisoned' THEN 1 ELSE 0 END), 0) \
         FROM pending_mutations",
        [],
        |row| Ok((row.get::<_, i64>(0)? as usize, row.get::<_, i64>(1)? as usize)),
    )?)
}

/// Sum of increment deltas not yet acknowledged for one entity.
pub(crate) fn unsent_delta(conn: &Connection, kind: EntityKind, entity_id: &str) -> Result<u64> {
    let mut stmt = conn.prepare(
        "SELECT payload FROM pending_mutations WHERE kind = ?1 AND entity_id = ?2 \
         AND op IN ('increment-view', 'increment-tag')",
    )?;
    let payloads = stmt
        .query_map(params![kind.as_str(), entity_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut total = 0u64;
    for p in payloads {
        let value: serde_json::Value = serde_json::from_str(&p)?;
        total += value.get("delta").and_then(|v| v.as_u64()).unwrap_or(0);
    }
    Ok(total)
}

pub(crate) fn has_pending(conn: &Connection, kind: EntityKind, entity_id: &str) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pending_mutations WHERE kind = ?1 AND entity_id = ?2",
        params![kind.as_str(), entity_id],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Latest status a ticket was moved to by a still-unacknowledged local write.
pub(crate) fn pending_status(conn: &Connection, ticket_id: &str) -> Result<Option<TicketStatus>> {
    let mut stmt = conn.prepare(
        "SELECT payload FROM pending_mutations WHERE kind = 'ticket' AND entity_id = ?1 \
         AND op IN ('create', 'update', 'transition-status') ORDER BY seq DESC",
    )?;
    let payloads = stmt
        .query_map(params![ticket_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for p in payloads {
        let value: serde_json::Value = serde_json::from_str(&p)?;
        if let Some(status) = value.get("status") {
            return Ok(Some(serde_json::from_value(status.clone())?));
        }
    }
    Ok(None)
}
