//! Conflict policy for pulled records.
//!
//! Last-write-wins on `updatedAt`: a remote record replaces the local one only
//! when it is strictly newer. Two fields are exempt. Usage counters merge as
//! the remote absolute value plus local deltas the remote has not seen yet,
//! never dropping below the local value. A ticket status that is behind a
//! still-unacknowledged local transition keeps the local status.

use supportdesk::{
    Category, Document, Entity, LocalState, Resolution, SupportTicket, Tag, TicketStatus,
};

fn remote_wins<T: Entity>(local: &T, remote: &T) -> bool {
    remote.updated_at() > local.updated_at()
}

fn merged_count(local: u64, remote: u64, state: &LocalState) -> u64 {
    local.max(remote.saturating_add(state.unsent_delta))
}

pub fn resolve_document(
    local: Option<&Document>,
    mut remote: Document,
    state: &LocalState,
) -> Resolution<Document> {
    let Some(local) = local else {
        remote.views = remote.views.saturating_add(state.unsent_delta);
        return Resolution::Write(remote);
    };

    let views = merged_count(local.views, remote.views, state);
    let mut winner = if remote_wins(local, &remote) {
        remote
    } else {
        local.clone()
    };
    winner.views = views;
    Resolution::Write(winner)
}

pub fn resolve_ticket(
    local: Option<&SupportTicket>,
    mut remote: SupportTicket,
    state: &LocalState,
) -> Resolution<SupportTicket> {
    let Some(local) = local else {
        remote.views = remote.views.saturating_add(state.unsent_delta);
        return Resolution::Write(remote);
    };

    let views = merged_count(local.views, remote.views, state);
    let mut winner = if remote_wins(local, &remote) {
        if status_is_behind(remote.status, state.pending_status) {
            tracing::debug!(
                "[SYNC] ticket {}: keeping local status {} over remote {}",
                local.id,
                local.status,
                remote.status
            );
            remote.status = local.status;
        }
        remote
    } else {
        local.clone()
    };
    winner.views = views;
    Resolution::Write(winner)
}

fn status_is_behind(remote: TicketStatus, pending: Option<TicketStatus>) -> bool {
    pending.map_or(false, |p| remote.stage() < p.stage())
}

pub fn resolve_tag(local: Option<&Tag>, mut remote: Tag, state: &LocalState) -> Resolution<Tag> {
    let Some(local) = local else {
        remote.count = remote.count.saturating_add(state.unsent_delta);
        return Resolution::Write(remote);
    };

    let mut merged = local.clone();
    merged.count = merged_count(local.count, remote.count, state);
    merged.updated_at = local.updated_at.max(remote.updated_at);
    Resolution::Write(merged)
}

pub fn resolve_category(
    local: Option<&Category>,
    remote: Category,
    _state: &LocalState,
) -> Resolution<Category> {
    match local {
        Some(local) if !remote_wins(local, &remote) => Resolution::Keep,
        _ => Resolution::Write(remote),
    }
}
