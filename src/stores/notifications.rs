//! Notifications and their read acknowledgements.
//!
//! Marking a notification read updates the row first and calls the server
//! second. A read the server did not get is kept in the `pending_reads`
//! queue until a drain delivers it or gives up.

use std::sync::Arc;

use anyhow::Result;
use redb::{TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use super::{EntityFamily, EventStore};
use crate::api::{ApiError, RemoteApi};
use crate::db::{self, LocalDb, RowTable, SeqTable};
use crate::events::{Notification, SyncEvent};
use crate::observe::{Observable, Subscription};
use crate::queue::{DrainReport, PendingQueue};

const NOTIFICATIONS: RowTable = TableDefinition::new("notifications");
const PENDING_READS: SeqTable = TableDefinition::new("pending_reads");

/// Payload of a queued read acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadAck {
    pub read_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkReadOutcome {
    /// Server confirmed the read.
    Confirmed,
    /// Local row updated; the acknowledgement waits in the queue.
    Queued,
    /// Local row updated; the server refused it for good, nothing queued.
    Rejected,
    AlreadyRead,
    UnknownNotification,
}

pub struct NotificationStore {
    db: Arc<LocalDb>,
    retention: usize,
    pending: PendingQueue<ReadAck>,
    view: Observable<Vec<Notification>>,
}

impl NotificationStore {
    pub fn new(db: Arc<LocalDb>, retention: usize) -> Result<Self> {
        let store = Self {
            pending: PendingQueue::new(db.clone(), PENDING_READS, "pending_reads"),
            db,
            retention,
            view: Observable::default(),
        };
        store.refresh()?;
        Ok(store)
    }

    /// Newest first.
    pub fn observe(&self) -> Subscription<Vec<Notification>> {
        self.view.subscribe()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.view.get()
    }

    pub fn get(&self, id: &str) -> Result<Option<Notification>> {
        self.db.get(NOTIFICATIONS, id)
    }

    pub fn unread_count(&self) -> usize {
        self.view.get().iter().filter(|n| !n.is_read()).count()
    }

    pub fn pending_reads(&self) -> Result<Vec<crate::queue::QueueEntry<ReadAck>>> {
        self.pending.entries()
    }

    /// Replace every notification with the server's list.
    ///
    /// A notification read locally whose acknowledgement is still queued
    /// keeps its local `read_at`, so a stale snapshot cannot flip it back
    /// to unread.
    pub fn replace_all(&self, notifications: Vec<Notification>) -> Result<()> {
        self.db.write(|txn| self.replace_all_in(txn, notifications))?;
        self.refresh()
    }

    pub fn replace_all_in(&self, txn: &WriteTransaction, notifications: Vec<Notification>) -> Result<()> {
        let pending = self.pending.keys_in(txn)?;
        let local: Vec<(String, Notification)> = db::fetch_all(txn, NOTIFICATIONS)?;

        db::clear(txn, NOTIFICATIONS)?;
        for mut n in notifications {
            if n.read_at.is_none() && pending.contains(&n.id) {
                n.read_at = local
                    .iter()
                    .find(|(id, _)| *id == n.id)
                    .and_then(|(_, row)| row.read_at);
            }
            db::put(txn, NOTIFICATIONS, &n.id, &n)?;
        }
        self.trim_in(txn)
    }

    /// Insert a notification the server announced. A known id is left
    /// untouched so a replayed event cannot undo a local read.
    pub fn apply_created(&self, txn: &WriteTransaction, notification: &Notification) -> Result<()> {
        if db::fetch::<Notification>(txn, NOTIFICATIONS, &notification.id)?.is_some() {
            return Ok(());
        }
        db::put(txn, NOTIFICATIONS, &notification.id, notification)?;
        self.trim_in(txn)
    }

    /// Record a read reported by the server. The first `read_at` wins.
    pub fn apply_read(&self, txn: &WriteTransaction, id: &str, read_at: i64) -> Result<()> {
        if let Some(mut n) = db::fetch::<Notification>(txn, NOTIFICATIONS, id)? {
            if n.read_at.is_none() {
                n.read_at = Some(read_at);
                db::put(txn, NOTIFICATIONS, id, &n)?;
            }
        }
        Ok(())
    }

    /// Mark a notification read locally, then tell the server.
    pub async fn mark_as_read(&self, id: &str, api: &dyn RemoteApi) -> Result<MarkReadOutcome> {
        let read_at = db::now_secs();
        let local = self.db.write(|txn| {
            let Some(mut n) = db::fetch::<Notification>(txn, NOTIFICATIONS, id)? else {
                return Ok(MarkReadOutcome::UnknownNotification);
            };
            if n.is_read() {
                return Ok(MarkReadOutcome::AlreadyRead);
            }
            n.read_at = Some(read_at);
            db::put(txn, NOTIFICATIONS, id, &n)?;
            Ok(MarkReadOutcome::Confirmed)
        })?;
        if local != MarkReadOutcome::Confirmed {
            return Ok(local);
        }
        self.refresh()?;

        match api.mark_notification_read(id).await {
            Ok(()) | Err(ApiError::NotFound) => Ok(MarkReadOutcome::Confirmed),
            Err(e) if e.is_transient() || e.is_auth() => {
                tracing::debug!("Queueing read acknowledgement for {}: {}", id, e);
                self.pending.enqueue_unique(id, ReadAck { read_at })?;
                Ok(MarkReadOutcome::Queued)
            }
            Err(e) => {
                tracing::warn!("Server rejected read acknowledgement for {}: {}", id, e);
                Ok(MarkReadOutcome::Rejected)
            }
        }
    }

    /// Retry queued read acknowledgements.
    pub async fn drain_pending_reads(&self, api: &dyn RemoteApi, max_retries: u32) -> Result<DrainReport> {
        self.pending
            .drain(max_retries, |entry| async move {
                match api.mark_notification_read(&entry.natural_key).await {
                    Err(ApiError::NotFound) => Ok(()),
                    other => other,
                }
            })
            .await
    }

    /// Drop the oldest notifications beyond the retention cap.
    fn trim_in(&self, txn: &WriteTransaction) -> Result<()> {
        let mut rows: Vec<(String, Notification)> = db::fetch_all(txn, NOTIFICATIONS)?;
        if rows.len() <= self.retention {
            return Ok(());
        }
        sort_newest_first(&mut rows);
        for (id, _) in rows.split_off(self.retention) {
            db::remove(txn, NOTIFICATIONS, &id)?;
        }
        Ok(())
    }
}

fn sort_newest_first(rows: &mut [(String, Notification)]) {
    rows.sort_by(|(a_id, a), (b_id, b)| b.created_at.cmp(&a.created_at).then_with(|| a_id.cmp(b_id)));
}

impl EventStore for NotificationStore {
    fn db(&self) -> &LocalDb {
        &self.db
    }

    fn family(&self) -> EntityFamily {
        EntityFamily::Notifications
    }

    fn apply_event_in(&self, txn: &WriteTransaction, event: &SyncEvent) -> Result<bool> {
        match event {
            SyncEvent::NotificationCreated { notification } => self.apply_created(txn, notification)?,
            SyncEvent::NotificationRead {
                notification_id,
                read_at,
            } => self.apply_read(txn, notification_id, *read_at)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn refresh(&self) -> Result<()> {
        let mut rows: Vec<(String, Notification)> = self.db.scan(NOTIFICATIONS)?;
        sort_newest_first(&mut rows);
        self.view.publish(rows.into_iter().map(|(_, n)| n).collect());
        Ok(())
    }
}
