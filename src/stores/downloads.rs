//! Status of the user's download requests, driven purely by server events.

use std::sync::Arc;

use anyhow::Result;
use redb::{TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use super::{EntityFamily, EventStore};
use crate::db::{self, LocalDb, RowTable};
use crate::events::{DownloadContentType, DownloadProgress, DownloadQueueStatus, SyncEvent};
use crate::observe::{Observable, Subscription};

const DOWNLOADS: RowTable = TableDefinition::new("download_requests");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadStatus {
    pub request_id: String,
    pub content_id: String,
    #[serde(default)]
    pub content_type: Option<DownloadContentType>,
    #[serde(default)]
    pub content_name: Option<String>,
    #[serde(default)]
    pub artist_name: Option<String>,
    pub status: DownloadQueueStatus,
    #[serde(default)]
    pub queue_position: Option<i32>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub progress: Option<DownloadProgress>,
}

impl DownloadStatus {
    fn placeholder(request_id: &str, content_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            content_id: content_id.to_string(),
            content_type: None,
            content_name: None,
            artist_name: None,
            status: DownloadQueueStatus::Pending,
            queue_position: None,
            error_message: None,
            progress: None,
        }
    }
}

pub struct DownloadStatusStore {
    db: Arc<LocalDb>,
    view: Observable<Vec<DownloadStatus>>,
}

impl DownloadStatusStore {
    pub fn new(db: Arc<LocalDb>) -> Result<Self> {
        let store = Self {
            db,
            view: Observable::default(),
        };
        store.refresh()?;
        Ok(store)
    }

    pub fn observe(&self) -> Subscription<Vec<DownloadStatus>> {
        self.view.subscribe()
    }

    pub fn get(&self, request_id: &str) -> Result<Option<DownloadStatus>> {
        self.db.get(DOWNLOADS, request_id)
    }

    /// Requests that have not reached a terminal status.
    pub fn active(&self) -> Vec<DownloadStatus> {
        self.view
            .get()
            .into_iter()
            .filter(|d| !d.status.is_terminal())
            .collect()
    }

    pub fn replace_all(&self, rows: Vec<DownloadStatus>) -> Result<()> {
        self.db.write(|txn| self.replace_all_in(txn, rows))?;
        self.refresh()
    }

    pub fn replace_all_in(&self, txn: &WriteTransaction, rows: Vec<DownloadStatus>) -> Result<()> {
        db::clear(txn, DOWNLOADS)?;
        for row in rows {
            db::put(txn, DOWNLOADS, &row.request_id, &row)?;
        }
        Ok(())
    }

    /// Drop every request that has not settled. The user snapshot carries no
    /// download state, so after a gap these rows may describe a status the
    /// server has long moved past; later events recreate them.
    pub fn drop_unsettled_in(&self, txn: &WriteTransaction) -> Result<usize> {
        let rows: Vec<(String, DownloadStatus)> = db::fetch_all(txn, DOWNLOADS)?;
        let mut dropped = 0;
        for (id, row) in rows {
            if !row.status.is_terminal() {
                db::remove(txn, DOWNLOADS, &id)?;
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    fn modify(
        &self,
        txn: &WriteTransaction,
        request_id: &str,
        content_id: &str,
        f: impl FnOnce(&mut DownloadStatus),
    ) -> Result<()> {
        let mut row = db::fetch::<DownloadStatus>(txn, DOWNLOADS, request_id)?
            .unwrap_or_else(|| DownloadStatus::placeholder(request_id, content_id));
        f(&mut row);
        db::put(txn, DOWNLOADS, request_id, &row)
    }
}

impl EventStore for DownloadStatusStore {
    fn db(&self) -> &LocalDb {
        &self.db
    }

    fn family(&self) -> EntityFamily {
        EntityFamily::Downloads
    }

    fn apply_event_in(&self, txn: &WriteTransaction, event: &SyncEvent) -> Result<bool> {
        match event {
            SyncEvent::DownloadRequestCreated {
                request_id,
                content_id,
                content_type,
                content_name,
                artist_name,
                queue_position,
            } => {
                // A later status event may have arrived first on a replay.
                self.modify(txn, request_id, content_id, |row| {
                    row.content_type = Some(*content_type);
                    row.content_name = Some(content_name.clone());
                    row.artist_name = artist_name.clone();
                    if row.queue_position.is_none() {
                        row.queue_position = Some(*queue_position);
                    }
                })?;
            }
            SyncEvent::DownloadStatusChanged {
                request_id,
                content_id,
                status,
                queue_position,
                error_message,
            } => {
                self.modify(txn, request_id, content_id, |row| {
                    row.status = *status;
                    row.queue_position = *queue_position;
                    row.error_message = error_message.clone();
                })?;
            }
            SyncEvent::DownloadProgressUpdated {
                request_id,
                content_id,
                progress,
            } => {
                self.modify(txn, request_id, content_id, |row| row.progress = Some(progress.clone()))?;
            }
            SyncEvent::DownloadCompleted {
                request_id,
                content_id,
            } => {
                self.modify(txn, request_id, content_id, |row| {
                    row.status = DownloadQueueStatus::Completed;
                    row.queue_position = None;
                    row.error_message = None;
                })?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn refresh(&self) -> Result<()> {
        let rows = self
            .db
            .scan::<DownloadStatus>(DOWNLOADS)?
            .into_iter()
            .map(|(_, d)| d)
            .collect();
        self.view.publish(rows);
        Ok(())
    }
}
