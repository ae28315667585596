//! Liked artists, albums and tracks.
//!
//! A row's status records the latest intent: `PendingCreate` is a like the
//! server has not confirmed, `PendingDelete` an unlike. Toggling back and
//! forth before a drain only changes which call the drain makes, and a like
//! that was never sent is simply forgotten on unlike.

use std::sync::Arc;

use anyhow::Result;
use redb::{TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{EntityFamily, EventStore};
use crate::api::{ApiError, RemoteApi};
use crate::db::{self, LocalDb, RowTable};
use crate::events::{LikedContentType, SyncEvent};
use crate::observe::{Observable, Subscription};
use crate::queue::{DrainReport, SyncMeta, SyncStatus};

const LIKES: RowTable = TableDefinition::new("likes");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikedItem {
    pub content_type: LikedContentType,
    pub content_id: String,
    #[serde(default)]
    pub sync: SyncMeta,
}

impl LikedItem {
    fn key(&self) -> String {
        like_key(self.content_type, &self.content_id)
    }

    /// Liked from the user's point of view.
    pub fn is_liked(&self) -> bool {
        self.sync.status != SyncStatus::PendingDelete
    }
}

fn like_key(content_type: LikedContentType, content_id: &str) -> String {
    format!("{}:{}", content_type, content_id)
}

pub struct LikedContentStore {
    db: Arc<LocalDb>,
    view: Observable<Vec<LikedItem>>,
    drain_lock: Mutex<()>,
}

impl LikedContentStore {
    pub fn new(db: Arc<LocalDb>) -> Result<Self> {
        let store = Self {
            db,
            view: Observable::default(),
            drain_lock: Mutex::new(()),
        };
        store.refresh()?;
        Ok(store)
    }

    /// Everything currently liked, including likes not yet confirmed.
    pub fn observe(&self) -> Subscription<Vec<LikedItem>> {
        self.view.subscribe()
    }

    pub fn is_liked(&self, content_type: LikedContentType, content_id: &str) -> Result<bool> {
        Ok(self
            .db
            .get::<LikedItem>(LIKES, &like_key(content_type, content_id))?
            .is_some_and(|item| item.is_liked()))
    }

    /// Liked ids of one type.
    pub fn liked(&self, content_type: LikedContentType) -> Vec<String> {
        self.view
            .get()
            .into_iter()
            .filter(|item| item.content_type == content_type)
            .map(|item| item.content_id)
            .collect()
    }

    pub fn like(&self, content_type: LikedContentType, content_id: &str) -> Result<()> {
        self.db.update(LIKES, &like_key(content_type, content_id), |current: Option<LikedItem>| {
            match current {
                None => Some(LikedItem {
                    content_type,
                    content_id: content_id.to_string(),
                    sync: SyncMeta::pending_create(),
                }),
                Some(mut item) if item.sync.status == SyncStatus::PendingDelete => {
                    item.sync.touch(SyncStatus::PendingCreate);
                    Some(item)
                }
                Some(item) => Some(item),
            }
        })?;
        self.refresh()
    }

    pub fn unlike(&self, content_type: LikedContentType, content_id: &str) -> Result<()> {
        // Held across the update so no drain can pick the like up meanwhile.
        let idle = self.drain_lock.try_lock().ok();
        self.db.update(LIKES, &like_key(content_type, content_id), |current: Option<LikedItem>| {
            let mut item = current?;
            // Revision 1 is a fresh like; a re-like of a pending unlike has
            // been bumped past it and may still exist on the server.
            let never_sent = item.sync.status == SyncStatus::PendingCreate
                && item.sync.revision == 1
                && item.sync.retry_count == 0;
            if never_sent && idle.is_some() {
                return None;
            }
            if item.sync.status != SyncStatus::PendingDelete {
                item.sync.touch(SyncStatus::PendingDelete);
            }
            Some(item)
        })?;
        self.refresh()
    }

    /// Replace confirmed likes with the server's set. Pending likes are kept;
    /// a pending unlike is kept only while the server still has the like.
    pub fn replace_all(&self, items: Vec<(LikedContentType, String)>) -> Result<()> {
        self.db.write(|txn| self.replace_all_in(txn, items))?;
        self.refresh()
    }

    pub fn replace_all_in(&self, txn: &WriteTransaction, items: Vec<(LikedContentType, String)>) -> Result<()> {
        let local: Vec<(String, LikedItem)> = db::fetch_all(txn, LIKES)?;
        db::clear(txn, LIKES)?;

        for (content_type, content_id) in items {
            let key = like_key(content_type, &content_id);
            let pending_unlike = local
                .iter()
                .find(|(k, item)| *k == key && item.sync.status == SyncStatus::PendingDelete)
                .map(|(_, item)| item.clone());
            let row = pending_unlike.unwrap_or(LikedItem {
                content_type,
                content_id,
                sync: SyncMeta::synced(),
            });
            db::put(txn, LIKES, &key, &row)?;
        }
        for (key, item) in local {
            if item.sync.status == SyncStatus::PendingCreate {
                db::put(txn, LIKES, &key, &item)?;
            }
        }
        Ok(())
    }

    pub async fn drain(&self, api: &dyn RemoteApi, max_retries: u32) -> Result<DrainReport> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            tracing::debug!("Likes drain already running");
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        };

        let pending: Vec<LikedItem> = self
            .db
            .scan::<LikedItem>(LIKES)?
            .into_iter()
            .map(|(_, item)| item)
            .filter(|item| item.sync.is_drainable())
            .collect();

        let mut report = DrainReport::default();
        for item in pending {
            report.attempted += 1;
            let sent = item.sync.revision;
            let result = match item.sync.status {
                SyncStatus::PendingDelete => match api.unlike(item.content_type, &item.content_id).await {
                    Err(ApiError::NotFound) => Ok(()),
                    other => other,
                },
                _ => api.like(item.content_type, &item.content_id).await,
            };

            let key = item.key();
            match result {
                Ok(()) => {
                    self.db.update(LIKES, &key, |current: Option<LikedItem>| {
                        let mut current = current?;
                        if current.sync.revision != sent {
                            return Some(current);
                        }
                        if current.sync.status == SyncStatus::PendingDelete {
                            return None;
                        }
                        current.sync.confirm();
                        Some(current)
                    })?;
                    report.succeeded += 1;
                }
                Err(e) if e.is_auth() => {
                    tracing::warn!("Session refused, leaving {} pending", key);
                    report.attempted -= 1;
                    report.halted = true;
                    break;
                }
                Err(e) => {
                    let mut gave_up = false;
                    self.db.update(LIKES, &key, |current: Option<LikedItem>| {
                        let mut current = current?;
                        if current.sync.revision == sent {
                            gave_up = current.sync.record_failure(max_retries, e.is_transient());
                        }
                        Some(current)
                    })?;
                    if gave_up {
                        tracing::warn!("Giving up on syncing {}: {}", key, e);
                        report.dropped += 1;
                    } else {
                        report.retried += 1;
                    }
                }
            }
        }

        if report.attempted > 0 {
            self.refresh()?;
        }
        Ok(report)
    }
}

impl EventStore for LikedContentStore {
    fn db(&self) -> &LocalDb {
        &self.db
    }

    fn family(&self) -> EntityFamily {
        EntityFamily::Likes
    }

    fn apply_event_in(&self, txn: &WriteTransaction, event: &SyncEvent) -> Result<bool> {
        match event {
            SyncEvent::ContentLiked {
                content_type,
                content_id,
            } => {
                let key = like_key(*content_type, content_id);
                if db::fetch::<LikedItem>(txn, LIKES, &key)?.is_none() {
                    let row = LikedItem {
                        content_type: *content_type,
                        content_id: content_id.clone(),
                        sync: SyncMeta::synced(),
                    };
                    db::put(txn, LIKES, &key, &row)?;
                }
            }
            SyncEvent::ContentUnliked {
                content_type,
                content_id,
            } => {
                let key = like_key(*content_type, content_id);
                if let Some(item) = db::fetch::<LikedItem>(txn, LIKES, &key)? {
                    if item.sync.status == SyncStatus::Synced {
                        db::remove(txn, LIKES, &key)?;
                    }
                }
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn refresh(&self) -> Result<()> {
        let liked = self
            .db
            .scan::<LikedItem>(LIKES)?
            .into_iter()
            .map(|(_, item)| item)
            .filter(LikedItem::is_liked)
            .collect();
        self.view.publish(liked);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockApi;
    use LikedContentType::{Album, Artist, Track};

    fn store() -> LikedContentStore {
        LikedContentStore::new(Arc::new(LocalDb::in_memory().unwrap())).unwrap()
    }

    #[tokio::test]
    async fn test_latest_intent_wins() {
        let store = store();
        store.like(Album, "A1").unwrap();
        store.unlike(Album, "A1").unwrap();
        store.like(Album, "A1").unwrap();
        assert!(store.is_liked(Album, "A1").unwrap());

        let api = MockApi::new();
        store.drain(&api, 5).await.unwrap();
        assert_eq!(api.calls(), vec!["like album A1"]);

        store.unlike(Album, "A1").unwrap();
        assert!(!store.is_liked(Album, "A1").unwrap());
        store.drain(&api, 5).await.unwrap();
        assert_eq!(api.calls().last().unwrap(), "unlike album A1");
        assert!(store.liked(Album).is_empty());
    }

    #[tokio::test]
    async fn test_unlike_before_first_send_makes_no_call() {
        let store = store();
        store.like(Track, "T1").unwrap();
        store.unlike(Track, "T1").unwrap();

        let api = MockApi::new();
        assert_eq!(store.drain(&api, 5).await.unwrap().attempted, 0);
        assert!(api.calls().is_empty());
        assert!(!store.is_liked(Track, "T1").unwrap());
    }

    #[tokio::test]
    async fn test_unlike_after_relike_of_server_row_is_sent() {
        let store = store();
        store.replace_all(vec![(Album, "A1".to_string())]).unwrap();
        store.unlike(Album, "A1").unwrap();
        store.like(Album, "A1").unwrap();
        store.unlike(Album, "A1").unwrap();

        let api = MockApi::new();
        store.drain(&api, 5).await.unwrap();
        assert_eq!(api.calls(), vec!["unlike album A1"]);
    }

    #[tokio::test]
    async fn test_unlike_while_like_in_flight_is_sent() {
        let store = Arc::new(store());
        store.like(Track, "T1").unwrap();
        let api = Arc::new(MockApi::new());
        let gate = api.gate_outbound("like");

        let (bg_store, bg_api) = (store.clone(), api.clone());
        let first = tokio::spawn(async move { bg_store.drain(bg_api.as_ref(), 5).await });
        while api.calls_to("like") == 0 {
            tokio::task::yield_now().await;
        }

        assert!(store.drain(api.as_ref(), 5).await.unwrap().skipped);
        store.unlike(Track, "T1").unwrap();
        assert!(!store.is_liked(Track, "T1").unwrap());

        gate.notify_one();
        first.await.unwrap().unwrap();
        store.drain(api.as_ref(), 5).await.unwrap();
        assert_eq!(api.calls(), vec!["like track T1", "unlike track T1"]);
        assert!(store.liked(Track).is_empty());
    }

    #[tokio::test]
    async fn test_refused_session_halts_drain() {
        let store = store();
        store.replace_all(vec![(Album, "A1".to_string())]).unwrap();
        store.unlike(Album, "A1").unwrap();
        let api = MockApi::new();
        api.fail_all(ApiError::Unauthorized);

        let report = store.drain(&api, 5).await.unwrap();
        assert!(report.halted);
        assert_eq!(report.dropped, 0);

        api.succeed();
        assert_eq!(store.drain(&api, 5).await.unwrap().succeeded, 1);
        assert_eq!(api.calls_to("unlike"), 2);
    }

    #[test]
    fn test_snapshot_keeps_pending_rows() {
        let store = store();
        store
            .replace_all(vec![(Artist, "R1".to_string()), (Track, "T1".to_string())])
            .unwrap();
        store.like(Album, "A1").unwrap();
        store.unlike(Track, "T1").unwrap();

        store
            .replace_all(vec![(Artist, "R1".to_string()), (Track, "T1".to_string())])
            .unwrap();

        assert!(store.is_liked(Album, "A1").unwrap());
        assert!(!store.is_liked(Track, "T1").unwrap());
        assert_eq!(store.liked(Artist), vec!["R1"]);
    }

    #[test]
    fn test_remote_events_do_not_override_pending() {
        let store = store();
        store.like(Track, "T1").unwrap();
        store
            .apply_event(&SyncEvent::ContentUnliked {
                content_type: Track,
                content_id: "T1".to_string(),
            })
            .unwrap();
        assert!(store.is_liked(Track, "T1").unwrap());

        let liked = SyncEvent::ContentLiked {
            content_type: Artist,
            content_id: "R1".to_string(),
        };
        store.apply_event(&liked).unwrap();
        store.apply_event(&liked).unwrap();
        assert_eq!(store.liked(Artist), vec!["R1"]);

        store
            .apply_event(&SyncEvent::ContentUnliked {
                content_type: Artist,
                content_id: "R1".to_string(),
            })
            .unwrap();
        assert!(store.liked(Artist).is_empty());
    }

    #[tokio::test]
    async fn test_edit_during_failed_drain_is_not_counted() {
        let store = store();
        store.like(Album, "A1").unwrap();
        let api = MockApi::new();
        api.fail_all(ApiError::Rejected { status: 400 });

        store.drain(&api, 5).await.unwrap();
        // Permanent failure parks the row until the user acts again.
        assert_eq!(store.drain(&api, 5).await.unwrap().attempted, 0);

        store.unlike(Album, "A1").unwrap();
        api.succeed();
        let report = store.drain(&api, 5).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert!(!store.is_liked(Album, "A1").unwrap());
    }
}
