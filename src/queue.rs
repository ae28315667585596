//! Offline mutation queues.
//!
//! Two shapes share one retry policy:
//!
//! - [`PendingQueue`]: an append-only log of outbound operations where every
//!   entry must reach the server (read acknowledgements, listening events,
//!   impressions). Entries are drained oldest first.
//! - [`SyncStatus`] + [`SyncMeta`]: a status tag carried by the entity row
//!   itself, for families where only the latest intent matters (playlists,
//!   likes).
//!
//! A transient failure bumps the entry's retry count; at `max_retries` the
//! entry is given up. Permanent failures give up immediately.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use redb::WriteTransaction;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::api::ApiResult;
use crate::db::{self, LocalDb, SeqTable};

// ── Flavor A ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry<P> {
    #[serde(skip)]
    pub id: u64,
    /// Identifier of the entity the operation is about.
    pub natural_key: String,
    pub payload: P,
    pub created_at: i64,
    pub retry_count: u32,
}

/// What one drain pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dropped: usize,
    /// Another drain of the same queue was already running.
    pub skipped: bool,
    /// Stopped at a refused session. Unattempted entries keep their retry
    /// budget.
    pub halted: bool,
}

impl DrainReport {
    pub fn merge(&mut self, other: DrainReport) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.dropped += other.dropped;
        self.skipped |= other.skipped;
        self.halted |= other.halted;
    }
}

/// Durable FIFO of outbound operations with bounded retries.
pub struct PendingQueue<P> {
    db: Arc<LocalDb>,
    table: SeqTable,
    name: &'static str,
    drain_lock: Mutex<()>,
    _payload: PhantomData<fn() -> P>,
}

impl<P> PendingQueue<P>
where
    P: Serialize + DeserializeOwned + Clone + Send,
{
    pub fn new(db: Arc<LocalDb>, table: SeqTable, name: &'static str) -> Self {
        Self {
            db,
            table,
            name,
            drain_lock: Mutex::new(()),
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn enqueue(&self, natural_key: &str, payload: P) -> Result<u64> {
        self.db.write(|txn| self.enqueue_in(txn, natural_key, payload))
    }

    /// Append inside a caller-owned transaction.
    pub fn enqueue_in(&self, txn: &WriteTransaction, natural_key: &str, payload: P) -> Result<u64> {
        let entry = QueueEntry {
            id: 0,
            natural_key: natural_key.to_string(),
            payload,
            created_at: db::now_secs(),
            retry_count: 0,
        };
        db::append(txn, self.table, &entry)
    }

    /// Append unless an entry for `natural_key` is already queued. Returns
    /// whether a new entry was written.
    pub fn enqueue_unique(&self, natural_key: &str, payload: P) -> Result<bool> {
        self.db.write(|txn| {
            if self.keys_in(txn)?.iter().any(|k| k == natural_key) {
                return Ok(false);
            }
            self.enqueue_in(txn, natural_key, payload)?;
            Ok(true)
        })
    }

    /// Queued entries, oldest first.
    pub fn entries(&self) -> Result<Vec<QueueEntry<P>>> {
        Ok(self
            .db
            .scan_seq::<QueueEntry<P>>(self.table)?
            .into_iter()
            .map(|(id, mut entry)| {
                entry.id = id;
                entry
            })
            .collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entries()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, natural_key: &str) -> Result<bool> {
        Ok(self.entries()?.iter().any(|e| e.natural_key == natural_key))
    }

    /// Natural keys currently queued, read inside a caller-owned transaction.
    pub fn keys_in(&self, txn: &WriteTransaction) -> Result<Vec<String>> {
        Ok(db::fetch_all_seq::<QueueEntry<P>>(txn, self.table)?
            .into_iter()
            .map(|(_, e)| e.natural_key)
            .collect())
    }

    /// Attempt every entry queued at the moment the drain starts.
    ///
    /// Entries appended while the drain runs wait for the next pass. Only one
    /// drain runs at a time; a concurrent call returns at once with
    /// `skipped` set.
    pub async fn drain<F, Fut>(&self, max_retries: u32, mut send: F) -> Result<DrainReport>
    where
        F: FnMut(QueueEntry<P>) -> Fut,
        Fut: Future<Output = ApiResult<()>>,
    {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            tracing::debug!("{} drain already running", self.name);
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        };

        let snapshot = self.entries()?;
        let mut report = DrainReport::default();

        for entry in snapshot {
            report.attempted += 1;
            let id = entry.id;
            let key = entry.natural_key.clone();

            match send(entry).await {
                Ok(()) => {
                    self.db.write(|txn| db::remove_seq(txn, self.table, id))?;
                    report.succeeded += 1;
                }
                Err(e) if e.is_auth() => {
                    tracing::warn!("{}: session refused, leaving {} queued", self.name, key);
                    report.attempted -= 1;
                    report.halted = true;
                    break;
                }
                Err(e) if e.is_transient() => {
                    let dropped = self.db.write(|txn| {
                        let Some(mut current) = db::fetch_seq::<QueueEntry<P>>(txn, self.table, id)? else {
                            return Ok(false);
                        };
                        current.retry_count += 1;
                        if current.retry_count >= max_retries {
                            db::remove_seq(txn, self.table, id)?;
                            Ok(true)
                        } else {
                            db::put_seq(txn, self.table, id, &current)?;
                            Ok(false)
                        }
                    })?;
                    if dropped {
                        tracing::warn!(
                            "{}: giving up on {} after {} attempts: {}",
                            self.name,
                            key,
                            max_retries,
                            e
                        );
                        report.dropped += 1;
                    } else {
                        report.retried += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!("{}: dropping {}: {}", self.name, key, e);
                    self.db.write(|txn| db::remove_seq(txn, self.table, id))?;
                    report.dropped += 1;
                }
            }
        }

        if report.attempted > 0 {
            tracing::debug!(
                "{} drain: {} sent, {} retrying, {} dropped",
                self.name,
                report.succeeded,
                report.retried,
                report.dropped
            );
        }
        Ok(report)
    }
}

// ── Flavor B ────────────────────────────────────────────────────────

/// Outbound intent recorded on an entity row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Synced,
    PendingCreate,
    PendingUpdate,
    PendingDelete,
}

impl SyncStatus {
    pub fn is_pending(self) -> bool {
        self != Self::Synced
    }

    /// Status after a local edit. Delete dominates; a row the server has
    /// never seen stays a create.
    pub fn after_local_update(self) -> Self {
        match self {
            Self::Synced => Self::PendingUpdate,
            other => other,
        }
    }

    /// Status after a local delete. `None` means the row never reached the
    /// server and can be removed outright.
    pub fn after_local_delete(self) -> Option<Self> {
        match self {
            Self::PendingCreate => None,
            _ => Some(Self::PendingDelete),
        }
    }
}

/// Sync bookkeeping embedded in every Flavor B row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncMeta {
    pub status: SyncStatus,
    /// Bumped on every local edit. A drain only confirms the revision it
    /// sent.
    pub revision: u64,
    pub retry_count: u32,
    pub needs_attention: bool,
}

impl SyncMeta {
    pub fn synced() -> Self {
        Self::default()
    }

    pub fn pending_create() -> Self {
        Self {
            status: SyncStatus::PendingCreate,
            revision: 1,
            ..Self::default()
        }
    }

    /// Record a local intent. Clears any earlier give-up since the user has
    /// acted again.
    pub fn touch(&mut self, status: SyncStatus) {
        self.status = status;
        self.revision += 1;
        self.retry_count = 0;
        self.needs_attention = false;
    }

    /// Waiting for a drain to pick it up.
    pub fn is_drainable(&self) -> bool {
        self.status.is_pending() && !self.needs_attention
    }

    /// Count one failed attempt. Returns true when the row has just been
    /// given up on.
    pub fn record_failure(&mut self, max_retries: u32, transient: bool) -> bool {
        self.retry_count += 1;
        if !transient || self.retry_count >= max_retries {
            self.needs_attention = true;
        }
        self.needs_attention
    }

    pub fn confirm(&mut self) {
        self.status = SyncStatus::Synced;
        self.retry_count = 0;
        self.needs_attention = false;
    }
}
