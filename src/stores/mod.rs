//! Local stores, one per entity family.
//!
//! Each store exclusively owns its tables. The reconciler and the drains
//! only go through a store's methods. Stores that receive user-stream
//! events implement [`EventStore`] so the reconciler can route an event and
//! advance the watermark inside one write transaction.

pub mod activity;
pub mod downloads;
pub mod likes;
pub mod notifications;
pub mod playlists;
pub mod settings;
pub mod skeleton;

use std::sync::Arc;

use anyhow::Result;
use redb::WriteTransaction;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::db::LocalDb;
use crate::events::SyncEvent;

pub use activity::ActivityLogStore;
pub use downloads::{DownloadStatus, DownloadStatusStore};
pub use likes::{LikedContentStore, LikedItem};
pub use notifications::{MarkReadOutcome, NotificationStore, ReadAck};
pub use playlists::{PlaylistStore, UserPlaylist};
pub use settings::SettingsStore;
pub use skeleton::{AlbumArtistRelationship, CatalogSkeletonStore};

/// Entity families that can be replaced wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityFamily {
    Notifications,
    Playlists,
    Likes,
    Settings,
    Permissions,
    Downloads,
    Skeleton,
}

impl EntityFamily {
    pub const ALL: [EntityFamily; 7] = [
        Self::Notifications,
        Self::Playlists,
        Self::Likes,
        Self::Settings,
        Self::Permissions,
        Self::Downloads,
        Self::Skeleton,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Notifications => "notifications",
            Self::Playlists => "playlists",
            Self::Likes => "likes",
            Self::Settings => "settings",
            Self::Permissions => "permissions",
            Self::Downloads => "downloads",
            Self::Skeleton => "skeleton",
        }
    }
}

impl std::fmt::Display for EntityFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A store fed by the user event stream.
pub trait EventStore: Send + Sync {
    fn db(&self) -> &LocalDb;

    fn family(&self) -> EntityFamily;

    /// Apply `event` inside a caller-owned transaction. Returns false when
    /// the event belongs to another store. Must be idempotent.
    fn apply_event_in(&self, txn: &WriteTransaction, event: &SyncEvent) -> Result<bool>;

    /// Re-read committed rows and publish them to observers.
    fn refresh(&self) -> Result<()>;

    /// Apply one event in its own transaction and publish.
    fn apply_event(&self, event: &SyncEvent) -> Result<bool> {
        let handled = self.db().write(|txn| self.apply_event_in(txn, event))?;
        if handled {
            self.refresh()?;
        }
        Ok(handled)
    }
}

/// Every local store over one database.
pub struct LocalStores {
    pub notifications: NotificationStore,
    pub playlists: PlaylistStore,
    pub likes: LikedContentStore,
    pub settings: SettingsStore,
    pub downloads: DownloadStatusStore,
    pub skeleton: CatalogSkeletonStore,
    pub activity: ActivityLogStore,
}

impl LocalStores {
    pub fn new(db: Arc<LocalDb>, config: &Config) -> Result<Self> {
        Ok(Self {
            notifications: NotificationStore::new(db.clone(), config.notifications.retention)?,
            playlists: PlaylistStore::new(db.clone())?,
            likes: LikedContentStore::new(db.clone())?,
            settings: SettingsStore::new(db.clone())?,
            downloads: DownloadStatusStore::new(db.clone())?,
            skeleton: CatalogSkeletonStore::new(db.clone())?,
            activity: ActivityLogStore::new(db, config.activity.retention),
        })
    }

    /// Stores fed by the user event stream, in routing order.
    pub fn event_stores(&self) -> [&dyn EventStore; 5] {
        [
            &self.notifications,
            &self.playlists,
            &self.likes,
            &self.settings,
            &self.downloads,
        ]
    }
}
