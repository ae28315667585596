//! Applies remote changes to the local stores.
//!
//! Two ordered streams feed the stores:
//!
//! - the user stream: per-user [`StoredEvent`]s, ordered by `seq`
//! - the skeleton stream: catalog deltas, ordered by catalog version
//!
//! Each stream has a watermark. An event is applied only when it is the
//! exact successor of the watermark, and the store write and the watermark
//! advance commit in one transaction. Anything older is a duplicate and is
//! ignored; anything newer is a gap the caller must close with a full
//! snapshot.

use std::sync::Arc;

use anyhow::Context;
use redb::{TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::{FullSkeleton, PlaylistState, SkeletonDelta, SyncStateSnapshot};
use crate::db::{self, LocalDb, RowTable};
use crate::events::{LikedContentType, Notification, Permission, StoredEvent, SyncEvent, UserSetting};
use crate::stores::{DownloadStatus, EntityFamily, LocalStores};

const SYNC_META: RowTable = TableDefinition::new("sync_meta");

const USER_WATERMARK_KEY: &str = "watermark:user";

/// Families replaced by a user-state snapshot.
const USER_FAMILIES: [EntityFamily; 6] = [
    EntityFamily::Notifications,
    EntityFamily::Playlists,
    EntityFamily::Likes,
    EntityFamily::Settings,
    EntityFamily::Permissions,
    EntityFamily::Downloads,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamId {
    User,
    Skeleton,
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Skeleton => f.write_str("skeleton"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{stream} stream gap: expected {expected}, received {received}")]
    Gap {
        stream: StreamId,
        expected: u64,
        received: u64,
    },
    #[error("{family} checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        family: EntityFamily,
        expected: String,
        actual: String,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type ReconcileResult<T> = std::result::Result<T, ReconcileError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    /// Unknown tag or malformed payload. The watermark still advances.
    Skipped,
    /// At or below the watermark; already applied.
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub applied: usize,
    pub skipped: usize,
    pub duplicates: usize,
}

/// Wholesale replacement data for one family.
#[derive(Debug, Clone)]
pub enum FamilySnapshot {
    Notifications(Vec<Notification>),
    Playlists(Vec<PlaylistState>),
    Likes(Vec<(LikedContentType, String)>),
    Settings(Vec<UserSetting>),
    Permissions(Vec<Permission>),
    Downloads(Vec<DownloadStatus>),
    Skeleton(FullSkeleton),
}

impl FamilySnapshot {
    pub fn family(&self) -> EntityFamily {
        match self {
            Self::Notifications(_) => EntityFamily::Notifications,
            Self::Playlists(_) => EntityFamily::Playlists,
            Self::Likes(_) => EntityFamily::Likes,
            Self::Settings(_) => EntityFamily::Settings,
            Self::Permissions(_) => EntityFamily::Permissions,
            Self::Downloads(_) => EntityFamily::Downloads,
            Self::Skeleton(_) => EntityFamily::Skeleton,
        }
    }
}

pub struct Reconciler {
    db: Arc<LocalDb>,
    stores: Arc<LocalStores>,
}

impl Reconciler {
    pub fn new(db: Arc<LocalDb>, stores: Arc<LocalStores>) -> Self {
        Self { db, stores }
    }

    pub fn stores(&self) -> &LocalStores {
        &self.stores
    }

    // ── Watermarks ──────────────────────────────────────────────────

    pub fn watermark(&self, stream: StreamId) -> anyhow::Result<u64> {
        match stream {
            StreamId::User => Ok(self.db.get(SYNC_META, USER_WATERMARK_KEY)?.unwrap_or(0)),
            StreamId::Skeleton => self.stores.skeleton.version(),
        }
    }

    fn set_user_watermark_in(&self, txn: &WriteTransaction, seq: u64) -> anyhow::Result<()> {
        db::put(txn, SYNC_META, USER_WATERMARK_KEY, &seq)
    }

    // ── Resync flags ────────────────────────────────────────────────

    pub fn needs_full_resync(&self, family: EntityFamily) -> anyhow::Result<bool> {
        Ok(self.db.get::<bool>(SYNC_META, &resync_key(family))?.unwrap_or(false))
    }

    /// Whether any family carried by the user stream awaits a snapshot.
    pub fn user_stream_needs_resync(&self) -> anyhow::Result<bool> {
        for family in USER_FAMILIES {
            if self.needs_full_resync(family)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn mark_resync(&self, family: EntityFamily) -> anyhow::Result<()> {
        self.db.upsert(SYNC_META, &resync_key(family), &true)
    }

    /// Flag every family of the user stream, after a gap.
    pub fn mark_user_stream_resync(&self) -> anyhow::Result<()> {
        self.db.write(|txn| {
            for family in USER_FAMILIES {
                db::put(txn, SYNC_META, &resync_key(family), &true)?;
            }
            Ok(())
        })
    }

    pub fn clear_resync(&self, family: EntityFamily) -> anyhow::Result<()> {
        self.db.delete(SYNC_META, &resync_key(family))?;
        Ok(())
    }

    // ── User stream ─────────────────────────────────────────────────

    /// Route a decoded event to its store, outside of any stream ordering.
    /// Returns whether some store owned it.
    pub fn apply_event(&self, event: &SyncEvent) -> anyhow::Result<bool> {
        for store in self.stores.event_stores() {
            if store.apply_event(event)? {
                tracing::debug!("{} applied {}", store.family(), event.event_type());
                return Ok(true);
            }
        }
        tracing::debug!("No store handles {}", event.event_type());
        Ok(false)
    }

    /// Apply one envelope from the user stream.
    ///
    /// The watermark check, the store write and the watermark advance
    /// happen in one write transaction, so concurrent callers cannot apply
    /// the same sequence twice.
    pub fn apply_stored_event(&self, event: &StoredEvent) -> ReconcileResult<EventOutcome> {
        enum Step {
            Duplicate,
            Gap(u64),
            Applied(Option<usize>),
        }

        let decoded = event.decode();
        let stores = self.stores.event_stores();
        let step = self
            .db
            .write(|txn| {
                let last: u64 = db::fetch(txn, SYNC_META, USER_WATERMARK_KEY)?.unwrap_or(0);
                if event.seq <= last {
                    return Ok(Step::Duplicate);
                }
                if event.seq != last + 1 {
                    return Ok(Step::Gap(last));
                }
                let mut owner = None;
                if let Some(ref ev) = decoded {
                    for (i, store) in stores.iter().enumerate() {
                        if store.apply_event_in(txn, ev)? {
                            owner = Some(i);
                            break;
                        }
                    }
                }
                self.set_user_watermark_in(txn, event.seq)?;
                Ok(Step::Applied(owner))
            })
            .with_context(|| format!("failed to apply event {}", event.seq))?;

        match step {
            Step::Duplicate => Ok(EventOutcome::Duplicate),
            Step::Gap(last) => {
                tracing::warn!("User stream gap: at {}, received {}", last, event.seq);
                Err(ReconcileError::Gap {
                    stream: StreamId::User,
                    expected: last + 1,
                    received: event.seq,
                })
            }
            Step::Applied(owner) => {
                if let Some(i) = owner {
                    tracing::debug!("Event {} applied to {}", event.seq, stores[i].family());
                    stores[i].refresh()?;
                }
                if decoded.is_some() {
                    Ok(EventOutcome::Applied)
                } else {
                    tracing::warn!("Skipping undecodable event {} ({})", event.seq, event.type_tag);
                    Ok(EventOutcome::Skipped)
                }
            }
        }
    }

    /// Apply envelopes in order, stopping at the first gap. Events applied
    /// before the gap stay applied.
    pub fn apply_batch(&self, events: &[StoredEvent]) -> ReconcileResult<BatchReport> {
        let mut report = BatchReport::default();
        for event in events {
            match self.apply_stored_event(event)? {
                EventOutcome::Applied => report.applied += 1,
                EventOutcome::Skipped => report.skipped += 1,
                EventOutcome::Duplicate => report.duplicates += 1,
            }
        }
        Ok(report)
    }

    /// Replace one family's rows. All or nothing.
    pub fn apply_full_snapshot(&self, snapshot: FamilySnapshot) -> ReconcileResult<()> {
        let family = snapshot.family();
        let stores = &self.stores;
        match snapshot {
            FamilySnapshot::Skeleton(skeleton) => stores.skeleton.replace_all(skeleton)?,
            FamilySnapshot::Notifications(rows) => stores.notifications.replace_all(rows)?,
            FamilySnapshot::Playlists(rows) => stores.playlists.replace_all(rows)?,
            FamilySnapshot::Likes(rows) => stores.likes.replace_all(rows)?,
            FamilySnapshot::Settings(rows) => stores.settings.replace_settings(&rows)?,
            FamilySnapshot::Permissions(rows) => stores.settings.replace_permissions(&rows)?,
            FamilySnapshot::Downloads(rows) => stores.downloads.replace_all(rows)?,
        }
        self.clear_resync(family)?;
        tracing::info!("Applied full {} snapshot", family);
        Ok(())
    }

    /// Replace every user family from the server's state and move the user
    /// watermark to the snapshot's sequence, in one transaction.
    pub fn apply_user_snapshot(&self, snapshot: SyncStateSnapshot) -> ReconcileResult<()> {
        let stores = &self.stores;
        let settings = snapshot.typed_settings();
        let permissions = snapshot.typed_permissions();
        let likes = snapshot.likes.items();
        let seq = snapshot.seq;

        self.db
            .write(|txn| {
                stores.notifications.replace_all_in(txn, snapshot.notifications)?;
                stores.playlists.replace_all_in(txn, snapshot.playlists)?;
                stores.likes.replace_all_in(txn, likes)?;
                stores.settings.replace_settings_in(txn, &settings)?;
                stores.settings.replace_permissions_in(txn, &permissions)?;
                let dropped = stores.downloads.drop_unsettled_in(txn)?;
                if dropped > 0 {
                    tracing::debug!("Dropped {} unsettled download requests", dropped);
                }
                for family in USER_FAMILIES {
                    db::remove(txn, SYNC_META, &resync_key(family))?;
                }
                self.set_user_watermark_in(txn, seq)
            })
            .context("failed to apply user snapshot")?;

        for store in stores.event_stores() {
            store.refresh()?;
        }
        tracing::info!("Applied full user snapshot at seq {}", seq);
        Ok(())
    }

    // ── Skeleton stream ─────────────────────────────────────────────

    /// Apply a catalog delta on top of the local skeleton.
    ///
    /// The delta must start at the local version. After applying, the
    /// recomputed checksum must equal the server's; otherwise nothing is
    /// committed and the skeleton is flagged for a full resync.
    pub fn apply_skeleton_delta(&self, delta: &SkeletonDelta) -> ReconcileResult<usize> {
        let local = self.watermark(StreamId::Skeleton)?;
        if delta.to_version <= local {
            return Ok(0);
        }
        if delta.from_version != local {
            tracing::warn!(
                "Skeleton delta starts at {}, local version is {}",
                delta.from_version,
                local
            );
            return Err(ReconcileError::Gap {
                stream: StreamId::Skeleton,
                expected: local,
                received: delta.from_version,
            });
        }

        let skeleton = &self.stores.skeleton;
        let result = self.db.write(|txn| {
            for change in &delta.changes {
                skeleton.apply_change_in(txn, change)?;
            }
            let actual = skeleton.compute_checksum_in(txn)?;
            if actual != delta.checksum {
                return Err(anyhow::Error::new(ReconcileError::ChecksumMismatch {
                    family: EntityFamily::Skeleton,
                    expected: delta.checksum.clone(),
                    actual,
                }));
            }
            skeleton.set_version_in(txn, delta.to_version, &delta.checksum)
        });

        match result {
            Ok(()) => {
                skeleton.refresh()?;
                tracing::debug!(
                    "Skeleton {} -> {} ({} changes)",
                    delta.from_version,
                    delta.to_version,
                    delta.changes.len()
                );
                Ok(delta.changes.len())
            }
            Err(e) => match e.downcast::<ReconcileError>() {
                Ok(mismatch) => {
                    tracing::warn!("{}", mismatch);
                    self.mark_resync(EntityFamily::Skeleton)?;
                    Err(mismatch)
                }
                Err(e) => Err(ReconcileError::Storage(e)),
            },
        }
    }
}

fn resync_key(family: EntityFamily) -> String {
    format!("resync:{}", family)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{LikesSnapshot, SkeletonChange};
    use crate::config::Config;
    use crate::events::{DownloadContentType, DownloadQueueStatus};
    use crate::stores::skeleton::skeleton_checksum;

    fn reconciler() -> Reconciler {
        let db = Arc::new(LocalDb::in_memory().unwrap());
        let stores = Arc::new(LocalStores::new(db.clone(), &Config::default()).unwrap());
        Reconciler::new(db, stores)
    }

    fn liked(seq: u64, id: &str) -> StoredEvent {
        StoredEvent::new(
            seq,
            &SyncEvent::ContentLiked {
                content_type: LikedContentType::Album,
                content_id: id.to_string(),
            },
            1_700_000_000 + seq,
        )
    }

    fn notification(id: &str, created_at: i64) -> Notification {
        Notification {
            id: id.to_string(),
            title: id.to_string(),
            body: None,
            created_at,
            read_at: None,
        }
    }

    #[test]
    fn test_in_order_events_advance_watermark() {
        let r = reconciler();
        let report = r.apply_batch(&[liked(1, "A1"), liked(2, "A2")]).unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(r.watermark(StreamId::User).unwrap(), 2);
        assert_eq!(r.stores().likes.liked(LikedContentType::Album), vec!["A1", "A2"]);
    }

    #[test]
    fn test_duplicate_delivery_is_idempotent() {
        let r = reconciler();
        let batch = vec![liked(1, "A1"), liked(2, "A2")];
        r.apply_batch(&batch).unwrap();
        let before = r.stores().likes.liked(LikedContentType::Album);

        let report = r.apply_batch(&batch).unwrap();
        assert_eq!(report.duplicates, 2);
        assert_eq!(r.stores().likes.liked(LikedContentType::Album), before);
        assert_eq!(r.watermark(StreamId::User).unwrap(), 2);
    }

    #[test]
    fn test_gap_stops_batch() {
        let r = reconciler();
        let err = r
            .apply_batch(&[liked(1, "A1"), liked(3, "A3"), liked(4, "A4")])
            .unwrap_err();
        match err {
            ReconcileError::Gap {
                stream,
                expected,
                received,
            } => {
                assert_eq!(stream, StreamId::User);
                assert_eq!(expected, 2);
                assert_eq!(received, 3);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(r.watermark(StreamId::User).unwrap(), 1);
        assert_eq!(r.stores().likes.liked(LikedContentType::Album), vec!["A1"]);
    }

    #[test]
    fn test_undecodable_event_is_skipped_and_advances() {
        let r = reconciler();
        let unknown = StoredEvent {
            seq: 1,
            type_tag: "hologram_projected".to_string(),
            payload: serde_json::json!({"x": 1}),
            server_timestamp: 0,
        };
        let missing_field = StoredEvent {
            seq: 2,
            type_tag: "content_liked".to_string(),
            payload: serde_json::json!({"content_type": "album"}),
            server_timestamp: 0,
        };
        let report = r.apply_batch(&[unknown, missing_field, liked(3, "A3")]).unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(report.applied, 1);
        assert_eq!(r.watermark(StreamId::User).unwrap(), 3);
    }

    #[test]
    fn test_user_snapshot_sets_watermark_and_clears_flags() {
        let r = reconciler();
        r.mark_user_stream_resync().unwrap();
        assert!(r.user_stream_needs_resync().unwrap());

        r.apply_user_snapshot(SyncStateSnapshot {
            seq: 40,
            likes: LikesSnapshot {
                albums: vec!["A1".to_string()],
                ..LikesSnapshot::default()
            },
            notifications: vec![notification("B", 2), notification("A", 3), notification("C", 1)],
            permissions: vec!["AccessCatalog".to_string()],
            ..SyncStateSnapshot::default()
        })
        .unwrap();

        assert_eq!(r.watermark(StreamId::User).unwrap(), 40);
        assert!(!r.user_stream_needs_resync().unwrap());
        let ids: Vec<String> = r
            .stores()
            .notifications
            .notifications()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
        assert_eq!(r.stores().notifications.unread_count(), 3);
        assert!(r.stores().settings.has_permission(Permission::AccessCatalog));

        assert_eq!(r.apply_stored_event(&liked(40, "A9")).unwrap(), EventOutcome::Duplicate);
        assert_eq!(r.apply_stored_event(&liked(41, "A9")).unwrap(), EventOutcome::Applied);
    }

    fn download_created(seq: u64, request_id: &str) -> StoredEvent {
        StoredEvent::new(
            seq,
            &SyncEvent::DownloadRequestCreated {
                request_id: request_id.to_string(),
                content_id: format!("album-{}", request_id),
                content_type: DownloadContentType::Album,
                content_name: "Album".to_string(),
                artist_name: None,
                queue_position: 1,
            },
            1_700_000_000 + seq,
        )
    }

    #[test]
    fn test_user_snapshot_after_gap_drops_stale_downloads() {
        let r = reconciler();
        let completed = StoredEvent::new(
            3,
            &SyncEvent::DownloadCompleted {
                request_id: "req-2".to_string(),
                content_id: "album-req-2".to_string(),
            },
            1_700_000_003,
        );
        r.apply_batch(&[download_created(1, "req-1"), download_created(2, "req-2"), completed])
            .unwrap();
        assert_eq!(r.stores().downloads.active().len(), 1);

        // Anything may have happened to req-1 in the missing range.
        assert!(r.apply_batch(&[download_created(9, "req-3")]).is_err());
        r.mark_user_stream_resync().unwrap();
        r.apply_user_snapshot(SyncStateSnapshot {
            seq: 12,
            ..SyncStateSnapshot::default()
        })
        .unwrap();

        assert!(!r.needs_full_resync(EntityFamily::Downloads).unwrap());
        assert!(r.stores().downloads.get("req-1").unwrap().is_none());
        assert!(r.stores().downloads.active().is_empty());
        let done = r.stores().downloads.get("req-2").unwrap().unwrap();
        assert_eq!(done.status, DownloadQueueStatus::Completed);
    }

    #[test]
    fn test_family_snapshot_clears_its_flag() {
        let r = reconciler();
        r.mark_resync(EntityFamily::Likes).unwrap();
        r.apply_full_snapshot(FamilySnapshot::Likes(vec![(LikedContentType::Track, "T1".to_string())]))
            .unwrap();
        assert!(!r.needs_full_resync(EntityFamily::Likes).unwrap());
        assert!(r.stores().likes.is_liked(LikedContentType::Track, "T1").unwrap());
    }

    fn base_skeleton() -> FullSkeleton {
        FullSkeleton {
            version: 5,
            checksum: skeleton_checksum(["R1"], [], []),
            artists: vec!["R1".to_string()],
            albums: vec![],
            tracks: vec![],
        }
    }

    fn artist_added(id: &str) -> SkeletonChange {
        SkeletonChange {
            event_type: "artist_added".to_string(),
            id: id.to_string(),
            artist_ids: None,
            album_id: None,
        }
    }

    #[test]
    fn test_skeleton_delta_applies_and_verifies() {
        let r = reconciler();
        r.apply_full_snapshot(FamilySnapshot::Skeleton(base_skeleton())).unwrap();

        let delta = SkeletonDelta {
            from_version: 5,
            to_version: 6,
            checksum: skeleton_checksum(["R1", "R2"], [], []),
            changes: vec![artist_added("R2")],
        };
        assert_eq!(r.apply_skeleton_delta(&delta).unwrap(), 1);
        assert_eq!(r.watermark(StreamId::Skeleton).unwrap(), 6);
        // Replaying an old delta is a no-op.
        assert_eq!(r.apply_skeleton_delta(&delta).unwrap(), 0);
    }

    #[test]
    fn test_skeleton_checksum_mismatch_rolls_back() {
        let r = reconciler();
        r.apply_full_snapshot(FamilySnapshot::Skeleton(base_skeleton())).unwrap();

        let delta = SkeletonDelta {
            from_version: 5,
            to_version: 6,
            checksum: "sha256:deadbeef".to_string(),
            changes: vec![artist_added("R2")],
        };
        let err = r.apply_skeleton_delta(&delta).unwrap_err();
        assert!(matches!(err, ReconcileError::ChecksumMismatch { .. }));
        assert!(r.needs_full_resync(EntityFamily::Skeleton).unwrap());
        assert_eq!(r.watermark(StreamId::Skeleton).unwrap(), 5);
        assert_eq!(r.stores().skeleton.artist_ids().unwrap(), vec!["R1"]);
    }

    #[test]
    fn test_skeleton_delta_gap() {
        let r = reconciler();
        r.apply_full_snapshot(FamilySnapshot::Skeleton(base_skeleton())).unwrap();
        let delta = SkeletonDelta {
            from_version: 3,
            to_version: 9,
            checksum: String::new(),
            changes: vec![],
        };
        assert!(matches!(
            r.apply_skeleton_delta(&delta),
            Err(ReconcileError::Gap {
                stream: StreamId::Skeleton,
                ..
            })
        ));
    }
}
