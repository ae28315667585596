//! Listening history and impressions.
//!
//! Both are telemetry the server must eventually receive in full, so each
//! record goes into its own outbound queue in the same transaction that
//! writes the local log.

use std::sync::Arc;

use anyhow::Result;
use redb::TableDefinition;

use crate::api::{Impression, ListeningEvent, RemoteApi};
use crate::db::{self, LocalDb, SeqTable};
use crate::queue::{DrainReport, PendingQueue};

const LISTENING_LOG: SeqTable = TableDefinition::new("listening_log");
const IMPRESSION_LOG: SeqTable = TableDefinition::new("impression_log");
const LISTENING_QUEUE: SeqTable = TableDefinition::new("listening_queue");
const IMPRESSION_QUEUE: SeqTable = TableDefinition::new("impression_queue");

pub struct ActivityLogStore {
    db: Arc<LocalDb>,
    retention: usize,
    listening: PendingQueue<ListeningEvent>,
    impressions: PendingQueue<Impression>,
}

impl ActivityLogStore {
    pub fn new(db: Arc<LocalDb>, retention: usize) -> Self {
        Self {
            listening: PendingQueue::new(db.clone(), LISTENING_QUEUE, "listening_queue"),
            impressions: PendingQueue::new(db.clone(), IMPRESSION_QUEUE, "impression_queue"),
            db,
            retention,
        }
    }

    /// Log a finished listening session and queue it for upload.
    pub fn record_listening(&self, event: ListeningEvent) -> Result<()> {
        self.db.write(|txn| {
            db::append(txn, LISTENING_LOG, &event)?;
            db::trim_oldest(txn, LISTENING_LOG, self.retention)?;
            self.listening.enqueue_in(txn, &event.track_id, event.clone())?;
            Ok(())
        })
    }

    pub fn record_impression(&self, impression: Impression) -> Result<()> {
        let key = format!("{}:{}", impression.item_type, impression.item_id);
        self.db.write(|txn| {
            db::append(txn, IMPRESSION_LOG, &impression)?;
            db::trim_oldest(txn, IMPRESSION_LOG, self.retention)?;
            self.impressions.enqueue_in(txn, &key, impression.clone())?;
            Ok(())
        })
    }

    /// Most recent sessions first.
    pub fn recent_listening(&self, limit: usize) -> Result<Vec<ListeningEvent>> {
        let mut rows = self.db.scan_seq::<ListeningEvent>(LISTENING_LOG)?;
        rows.reverse();
        Ok(rows.into_iter().take(limit).map(|(_, e)| e).collect())
    }

    pub fn recent_impressions(&self, limit: usize) -> Result<Vec<Impression>> {
        let mut rows = self.db.scan_seq::<Impression>(IMPRESSION_LOG)?;
        rows.reverse();
        Ok(rows.into_iter().take(limit).map(|(_, i)| i).collect())
    }

    /// Outbound items not yet delivered: `(listening, impressions)`.
    pub fn pending_counts(&self) -> Result<(usize, usize)> {
        Ok((self.listening.len()?, self.impressions.len()?))
    }

    /// Upload both queues.
    pub async fn drain(&self, api: &dyn RemoteApi, max_retries: u32) -> Result<DrainReport> {
        let mut report = self
            .listening
            .drain(max_retries, |entry| async move { api.post_listening_event(&entry.payload).await })
            .await?;
        let impressions = self
            .impressions
            .drain(max_retries, |entry| async move { api.post_impression(&entry.payload).await })
            .await?;
        report.merge(impressions);
        Ok(report)
    }
}
