//! Sync driver: runs sync passes against the remote API.
//!
//! A pass pulls the user stream, pulls the catalog skeleton, then drains
//! every outbound queue. Each step is isolated: a failing step is logged and
//! reported, and the rest of the pass still runs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::future::join4;
use rand::Rng;
use tokio::sync::{watch, Mutex};

use crate::api::{ApiError, RemoteApi};
use crate::config::Config;
use crate::db::LocalDb;
use crate::events::StoredEvent;
use crate::queue::DrainReport;
use crate::reconciler::{BatchReport, EventOutcome, FamilySnapshot, ReconcileError, Reconciler, StreamId};
use crate::stores::{EntityFamily, LocalStores};

/// What happened to the user stream during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserSync {
    Events(BatchReport),
    Snapshot { seq: u64 },
    Failed(String),
}

/// What happened to the catalog skeleton during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkeletonSync {
    UpToDate { version: u64 },
    Delta { from: u64, to: u64, changes: usize },
    Full { version: u64 },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPassReport {
    /// Another pass was already running; nothing was done.
    pub skipped: bool,
    pub user: Option<UserSync>,
    pub skeleton: Option<SkeletonSync>,
    pub notifications: DrainReport,
    pub likes: DrainReport,
    pub playlists: DrainReport,
    pub activity: DrainReport,
}

impl SyncPassReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            user: None,
            skeleton: None,
            notifications: DrainReport::default(),
            likes: DrainReport::default(),
            playlists: DrainReport::default(),
            activity: DrainReport::default(),
        }
    }

    /// True when no step failed.
    pub fn is_clean(&self) -> bool {
        !matches!(self.user, Some(UserSync::Failed(_))) && !matches!(self.skeleton, Some(SkeletonSync::Failed(_)))
    }

    /// Outbound items still waiting after the pass.
    pub fn retried(&self) -> usize {
        self.notifications.retried + self.likes.retried + self.playlists.retried + self.activity.retried
    }
}

impl std::fmt::Display for SyncPassReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.skipped {
            return f.write_str("skipped (pass already running)");
        }
        match self.user {
            Some(UserSync::Events(ref r)) => write!(
                f,
                "user: {} applied, {} skipped, {} duplicate",
                r.applied, r.skipped, r.duplicates
            )?,
            Some(UserSync::Snapshot { seq }) => write!(f, "user: snapshot at seq {}", seq)?,
            Some(UserSync::Failed(ref e)) => write!(f, "user: failed ({})", e)?,
            None => f.write_str("user: -")?,
        }
        match self.skeleton {
            Some(SkeletonSync::UpToDate { version }) => write!(f, "; skeleton: v{} up to date", version)?,
            Some(SkeletonSync::Delta { from, to, changes }) => {
                write!(f, "; skeleton: v{} -> v{} ({} changes)", from, to, changes)?
            }
            Some(SkeletonSync::Full { version }) => write!(f, "; skeleton: full v{}", version)?,
            Some(SkeletonSync::Failed(ref e)) => write!(f, "; skeleton: failed ({})", e)?,
            None => f.write_str("; skeleton: -")?,
        }
        let drains = [
            ("reads", &self.notifications),
            ("likes", &self.likes),
            ("playlists", &self.playlists),
            ("activity", &self.activity),
        ];
        for (name, r) in drains {
            write!(f, "; {}: {}/{} sent", name, r.succeeded, r.attempted)?;
            if r.dropped > 0 {
                write!(f, " ({} dropped)", r.dropped)?;
            }
            if r.halted {
                f.write_str(" (session refused)")?;
            }
        }
        Ok(())
    }
}

pub struct SyncDriver {
    api: Arc<dyn RemoteApi>,
    reconciler: Reconciler,
    stores: Arc<LocalStores>,
    max_retries: u32,
    pass_lock: Mutex<()>,
}

impl SyncDriver {
    pub fn new(api: Arc<dyn RemoteApi>, db: Arc<LocalDb>, stores: Arc<LocalStores>, max_retries: u32) -> Self {
        Self {
            api,
            reconciler: Reconciler::new(db, stores.clone()),
            stores,
            max_retries,
            pass_lock: Mutex::new(()),
        }
    }

    /// Build the stores over `db` and a driver on top of them.
    pub fn open(api: Arc<dyn RemoteApi>, db: Arc<LocalDb>, config: &Config) -> Result<Self> {
        let stores = Arc::new(LocalStores::new(db.clone(), config)?);
        Ok(Self::new(api, db, stores, config.sync.max_retries))
    }

    pub fn stores(&self) -> &Arc<LocalStores> {
        &self.stores
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Run one full pass. Never fails; step failures land in the report.
    pub async fn run_sync_pass(&self) -> SyncPassReport {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            tracing::debug!("Sync pass already running, skipping");
            return SyncPassReport::skipped();
        };

        let user = match self.sync_user_stream().await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("User stream sync failed: {:#}", e);
                UserSync::Failed(format!("{:#}", e))
            }
        };
        let skeleton = match self.sync_skeleton().await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Skeleton sync failed: {:#}", e);
                SkeletonSync::Failed(format!("{:#}", e))
            }
        };

        let api = self.api.as_ref();
        let max = self.max_retries;
        let (notifications, likes, playlists, activity) = join4(
            self.stores.notifications.drain_pending_reads(api, max),
            self.stores.likes.drain(api, max),
            self.stores.playlists.drain(api, max),
            self.stores.activity.drain(api, max),
        )
        .await;

        let report = SyncPassReport {
            skipped: false,
            user: Some(user),
            skeleton: Some(skeleton),
            notifications: drain_result("notification reads", notifications),
            likes: drain_result("likes", likes),
            playlists: drain_result("playlists", playlists),
            activity: drain_result("activity", activity),
        };
        tracing::info!("Sync pass: {}", report);
        report
    }

    /// Apply an event delivered in real time. Returns `None` when the event
    /// does not follow the watermark; the user stream is then flagged so the
    /// next pass takes a full snapshot.
    pub fn on_pushed_event(&self, event: &StoredEvent) -> Result<Option<EventOutcome>> {
        match self.reconciler.apply_stored_event(event) {
            Ok(outcome) => Ok(Some(outcome)),
            Err(ReconcileError::Gap { expected, received, .. }) => {
                tracing::warn!(
                    "Pushed event {} does not follow {}, scheduling full resync",
                    received,
                    expected.saturating_sub(1)
                );
                self.reconciler.mark_user_stream_resync()?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run passes every `interval` (plus up to 10% jitter) until `shutdown`
    /// becomes true or its sender is dropped.
    pub async fn run_periodic(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.run_sync_pass().await;

            let jitter_ms = (interval.as_millis() as u64 / 10).max(1);
            let delay = interval + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms));
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Periodic sync stopped");
    }

    // ── User stream ─────────────────────────────────────────────────

    async fn sync_user_stream(&self) -> Result<UserSync> {
        let mut since = self.reconciler.watermark(StreamId::User)?;
        if since == 0 {
            return self.user_snapshot("no local state").await;
        }
        if self.reconciler.user_stream_needs_resync()? {
            return self.user_snapshot("resync requested").await;
        }

        let mut total = BatchReport::default();
        loop {
            let page = match self.api.get_sync_events(since).await {
                Ok(page) => page,
                Err(ApiError::Gone) => return self.user_snapshot("event history pruned").await,
                Err(e) => return Err(e.into()),
            };
            let report = match self.reconciler.apply_batch(&page.events) {
                Ok(report) => report,
                Err(ReconcileError::Gap { expected, received, .. }) => {
                    tracing::warn!("User stream gap: expected {}, received {}", expected, received);
                    return self.user_snapshot("sequence gap").await;
                }
                Err(e) => return Err(e.into()),
            };
            total.applied += report.applied;
            total.skipped += report.skipped;
            total.duplicates += report.duplicates;

            let reached = self.reconciler.watermark(StreamId::User)?;
            // Stop on an empty page or once the server's head is reached.
            if page.events.is_empty() || reached >= page.current_seq || reached == since {
                break;
            }
            since = reached;
        }
        Ok(UserSync::Events(total))
    }

    async fn user_snapshot(&self, reason: &str) -> Result<UserSync> {
        tracing::info!("Fetching full user state ({})", reason);
        let snapshot = self.api.get_sync_state().await?;
        let seq = snapshot.seq;
        self.reconciler.apply_user_snapshot(snapshot)?;
        Ok(UserSync::Snapshot { seq })
    }

    // ── Skeleton stream ─────────────────────────────────────────────

    async fn sync_skeleton(&self) -> Result<SkeletonSync> {
        let remote = self.api.get_skeleton_version().await?;
        let local = self.reconciler.watermark(StreamId::Skeleton)?;
        let resync = self.reconciler.needs_full_resync(EntityFamily::Skeleton)?;

        if !resync && remote.version == local {
            let checksum = self.stores.skeleton.checksum()?;
            if checksum.as_deref() == Some(remote.checksum.as_str()) {
                return Ok(SkeletonSync::UpToDate { version: local });
            }
            tracing::warn!("Skeleton v{} checksum differs from server", local);
            return self.full_skeleton().await;
        }
        if local == 0 || resync || remote.version < local {
            return self.full_skeleton().await;
        }

        let delta = match self.api.get_skeleton_delta(local).await {
            Ok(delta) => delta,
            Err(ApiError::NotFound | ApiError::Gone) => return self.full_skeleton().await,
            Err(e) => return Err(e.into()),
        };
        match self.reconciler.apply_skeleton_delta(&delta) {
            Ok(changes) => Ok(SkeletonSync::Delta {
                from: local,
                to: delta.to_version,
                changes,
            }),
            Err(ReconcileError::Gap { .. } | ReconcileError::ChecksumMismatch { .. }) => self.full_skeleton().await,
            Err(e) => Err(e.into()),
        }
    }

    async fn full_skeleton(&self) -> Result<SkeletonSync> {
        let skeleton = self.api.get_full_skeleton().await?;
        let version = skeleton.version;
        let expected = skeleton.checksum.clone();
        self.reconciler.apply_full_snapshot(FamilySnapshot::Skeleton(skeleton))?;

        let actual = self.stores.skeleton.compute_checksum()?;
        if actual != expected {
            tracing::warn!(
                "Full skeleton v{} checksum mismatch: server {}, local {}",
                version,
                expected,
                actual
            );
        }
        Ok(SkeletonSync::Full { version })
    }
}

fn drain_result(name: &str, result: Result<DrainReport>) -> DrainReport {
    match result {
        Ok(report) => report,
        Err(e) => {
            tracing::warn!("Draining {} failed: {:#}", name, e);
            DrainReport::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockApi;
    use crate::api::{FullSkeleton, SkeletonAlbumEntry, SkeletonChange, SkeletonDelta, SkeletonTrackEntry, SyncStateSnapshot};
    use crate::events::{LikedContentType, Notification, SyncEvent};
    use crate::stores::skeleton::skeleton_checksum;

    fn notification(id: &str, created_at: i64) -> Notification {
        Notification {
            id: id.to_string(),
            title: format!("title {}", id),
            body: None,
            created_at,
            read_at: None,
        }
    }

    fn driver(api: Arc<MockApi>) -> SyncDriver {
        let db = Arc::new(LocalDb::in_memory().unwrap());
        SyncDriver::open(api, db, &Config::default()).unwrap()
    }

    fn liked(seq: u64, id: &str) -> StoredEvent {
        StoredEvent::new(
            seq,
            &SyncEvent::ContentLiked {
                content_type: LikedContentType::Album,
                content_id: id.to_string(),
            },
            1_700_000_000,
        )
    }

    fn skeleton(version: u64, artists: &[&str]) -> FullSkeleton {
        let albums = vec![SkeletonAlbumEntry {
            id: "AL1".to_string(),
            artist_ids: vec!["AR1".to_string()],
        }];
        let tracks = vec![SkeletonTrackEntry {
            id: "TR1".to_string(),
            album_id: "AL1".to_string(),
        }];
        FullSkeleton {
            version,
            checksum: skeleton_checksum(artists.iter().copied(), ["AL1"], ["TR1"]),
            artists: artists.iter().map(|a| a.to_string()).collect(),
            albums,
            tracks,
        }
    }

    fn user_state(seq: u64) -> SyncStateSnapshot {
        SyncStateSnapshot {
            seq,
            notifications: vec![notification("A", 1), notification("B", 2), notification("C", 3)],
            ..SyncStateSnapshot::default()
        }
    }

    #[tokio::test]
    async fn test_first_pass_takes_snapshots() {
        let api = Arc::new(MockApi::new());
        api.set_sync_state(user_state(10));
        api.set_skeleton(skeleton(3, &["AR1"]));
        let driver = driver(api.clone());

        let report = driver.run_sync_pass().await;
        assert!(!report.skipped);
        assert!(report.is_clean());
        assert_eq!(report.user, Some(UserSync::Snapshot { seq: 10 }));
        assert_eq!(report.skeleton, Some(SkeletonSync::Full { version: 3 }));
        assert_eq!(driver.stores().notifications.unread_count(), 3);
        assert_eq!(driver.reconciler().watermark(StreamId::User).unwrap(), 10);
        assert_eq!(api.calls_to("get_sync_events"), 0);
    }

    #[tokio::test]
    async fn test_second_pass_pulls_events_since_watermark() {
        let api = Arc::new(MockApi::new());
        api.set_sync_state(user_state(10));
        api.set_skeleton(skeleton(3, &["AR1"]));
        let driver = driver(api.clone());
        driver.run_sync_pass().await;

        api.push_events(vec![liked(11, "AL1"), liked(12, "AL2")]);
        let report = driver.run_sync_pass().await;
        assert_eq!(
            report.user,
            Some(UserSync::Events(BatchReport {
                applied: 2,
                skipped: 0,
                duplicates: 0
            }))
        );
        assert_eq!(report.skeleton, Some(SkeletonSync::UpToDate { version: 3 }));
        assert!(api.calls().contains(&"get_sync_events 10".to_string()));
        assert!(driver.stores().likes.is_liked(LikedContentType::Album, "AL2").unwrap());
        assert_eq!(driver.reconciler().watermark(StreamId::User).unwrap(), 12);
    }

    #[tokio::test]
    async fn test_gap_falls_back_to_snapshot() {
        let api = Arc::new(MockApi::new());
        api.set_sync_state(user_state(10));
        api.set_skeleton(skeleton(3, &["AR1"]));
        let driver = driver(api.clone());
        driver.run_sync_pass().await;

        api.push_events(vec![liked(12, "AL2")]);
        api.set_sync_state(user_state(12));
        let report = driver.run_sync_pass().await;
        assert_eq!(report.user, Some(UserSync::Snapshot { seq: 12 }));
        assert_eq!(api.calls_to("get_sync_state"), 2);
    }

    #[tokio::test]
    async fn test_pruned_history_falls_back_to_snapshot() {
        let api = Arc::new(MockApi::new());
        api.set_sync_state(user_state(10));
        api.set_skeleton(skeleton(3, &["AR1"]));
        let driver = driver(api.clone());
        driver.run_sync_pass().await;

        api.set_events_gone(true);
        api.set_sync_state(user_state(40));
        let report = driver.run_sync_pass().await;
        assert_eq!(report.user, Some(UserSync::Snapshot { seq: 40 }));
    }

    #[tokio::test]
    async fn test_skeleton_delta_and_mismatch_fallback() {
        let api = Arc::new(MockApi::new());
        api.set_sync_state(user_state(10));
        api.set_skeleton(skeleton(3, &["AR1"]));
        let driver = driver(api.clone());
        driver.run_sync_pass().await;

        let next = skeleton(4, &["AR1", "AR2"]);
        api.set_skeleton(next.clone());
        api.set_delta(Some(SkeletonDelta {
            from_version: 3,
            to_version: 4,
            checksum: next.checksum.clone(),
            changes: vec![SkeletonChange {
                event_type: "artist_added".to_string(),
                id: "AR2".to_string(),
                artist_ids: None,
                album_id: None,
            }],
        }));
        let report = driver.run_sync_pass().await;
        assert_eq!(report.skeleton, Some(SkeletonSync::Delta { from: 3, to: 4, changes: 1 }));
        assert_eq!(driver.stores().skeleton.artist_ids().unwrap(), vec!["AR1", "AR2"]);

        // A delta whose result does not match its checksum is discarded.
        let after = skeleton(5, &["AR1", "AR2", "AR3"]);
        api.set_skeleton(after.clone());
        api.set_delta(Some(SkeletonDelta {
            from_version: 4,
            to_version: 5,
            checksum: after.checksum.clone(),
            changes: vec![],
        }));
        let report = driver.run_sync_pass().await;
        assert_eq!(report.skeleton, Some(SkeletonSync::Full { version: 5 }));
        assert_eq!(driver.stores().skeleton.artist_ids().unwrap().len(), 3);
        assert!(!driver.reconciler().needs_full_resync(EntityFamily::Skeleton).unwrap());
    }

    #[tokio::test]
    async fn test_pass_drains_offline_mutations() {
        let api = Arc::new(MockApi::new());
        api.set_sync_state(user_state(10));
        api.set_skeleton(skeleton(3, &["AR1"]));
        let driver = driver(api.clone());
        driver.run_sync_pass().await;

        api.fail_all(ApiError::Network("offline".to_string()));
        driver.stores().likes.like(LikedContentType::Track, "T1").unwrap();
        let id = driver.stores().playlists.create("Road trip", vec!["T1".to_string()]).unwrap();
        assert!(id.starts_with("local-"));

        api.succeed();
        let report = driver.run_sync_pass().await;
        assert_eq!(report.likes.succeeded, 1);
        assert_eq!(report.playlists.succeeded, 1);
        assert!(api.calls().contains(&"like track T1".to_string()));
        assert!(api.calls().contains(&"create_playlist Road trip [T1]".to_string()));
        assert!(driver.stores().playlists.get("srv-1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_offline_pass_reports_failures() {
        let api = Arc::new(MockApi::new());
        api.fail_all(ApiError::Network("offline".to_string()));
        let driver = driver(api.clone());

        let report = driver.run_sync_pass().await;
        assert!(!report.is_clean());
        assert!(matches!(report.user, Some(UserSync::Failed(_))));
        assert!(matches!(report.skeleton, Some(SkeletonSync::Failed(_))));
    }

    #[tokio::test]
    async fn test_concurrent_pass_is_skipped() {
        let api = Arc::new(MockApi::new());
        let driver = driver(api.clone());
        let _running = driver.pass_lock.try_lock().unwrap();

        let report = driver.run_sync_pass().await;
        assert!(report.skipped);
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pushed_gap_schedules_resync() {
        let api = Arc::new(MockApi::new());
        api.set_sync_state(user_state(10));
        api.set_skeleton(skeleton(3, &["AR1"]));
        let driver = driver(api.clone());
        driver.run_sync_pass().await;

        assert_eq!(driver.on_pushed_event(&liked(11, "AL1")).unwrap(), Some(EventOutcome::Applied));
        assert_eq!(driver.on_pushed_event(&liked(11, "AL1")).unwrap(), Some(EventOutcome::Duplicate));
        assert_eq!(driver.on_pushed_event(&liked(15, "AL5")).unwrap(), None);
        assert!(driver.reconciler().user_stream_needs_resync().unwrap());

        api.set_sync_state(user_state(15));
        let report = driver.run_sync_pass().await;
        assert_eq!(report.user, Some(UserSync::Snapshot { seq: 15 }));
        assert!(!driver.reconciler().user_stream_needs_resync().unwrap());
    }

    #[tokio::test]
    async fn test_periodic_stops_on_shutdown() {
        let api = Arc::new(MockApi::new());
        let driver = Arc::new(driver(api.clone()));
        let (tx, rx) = watch::channel(false);

        let runner = driver.clone();
        let handle = tokio::spawn(async move { runner.run_periodic(Duration::from_secs(3600), rx).await });
        tokio::task::yield_now().await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(api.calls_to("get_sync_state") <= 1);
    }
}
