//! View counters.
//!
//! A view bumps the local counter and queues an `increment-view` delta in the
//! same transaction. Consecutive views of one entity fold into a single
//! queued delta until a sync pass picks it up.

use crate::error::{Result, SupportDeskError};
use crate::query::Viewable;
use crate::store::{load, pending, write_entity, LocalStore};
use crate::types::{Document, EntityKind, MutationOp, SupportTicket};

impl LocalStore {
    /// Count one view of a document or ticket. Returns the new local total.
    pub async fn record_view(&self, kind: EntityKind, id: &str) -> Result<u64> {
        match kind {
            EntityKind::Document => self.record_view_of::<Document>(id).await,
            EntityKind::Ticket => self.record_view_of::<SupportTicket>(id).await,
            other => Err(SupportDeskError::InvalidQuery(format!(
                "{} records do not count views",
                other
            ))),
        }
    }

    pub async fn record_view_of<T: Viewable>(&self, id: &str) -> Result<u64> {
        let id = id.to_string();
        let now = self.now();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let mut record = load::<T>(&tx, &id)?
                .ok_or_else(|| SupportDeskError::not_found(T::KIND, &id))?;
            *record.views_mut() += 1;
            let views = record.views();

            write_entity(&tx, &record)?;
            pending::enqueue(
                &tx,
                T::KIND,
                &id,
                MutationOp::IncrementView,
                serde_json::json!({ "delta": 1 }),
                now,
            )?;
            tx.commit()?;
            tracing::trace!("[USAGE] {} {} views={}", T::KIND, id, views);
            Ok(views)
        })
        .await
    }
}
