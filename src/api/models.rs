//! Request and response bodies exchanged with the catalog server.

use serde::{Deserialize, Serialize};

use crate::events::{LikedContentType, Notification, Permission, SettingPayload, StoredEvent, UserSetting};

// ── User sync ───────────────────────────────────────────────────────

/// Response of `GET /v1/sync/state`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncStateSnapshot {
    pub seq: u64,
    pub likes: LikesSnapshot,
    pub settings: Vec<SettingPayload>,
    pub playlists: Vec<PlaylistState>,
    pub permissions: Vec<String>,
    pub notifications: Vec<Notification>,
}

impl SyncStateSnapshot {
    /// Settings with recognised keys; unknown ones are dropped.
    pub fn typed_settings(&self) -> Vec<UserSetting> {
        self.settings.iter().filter_map(SettingPayload::to_setting).collect()
    }

    /// Permissions this client knows about.
    pub fn typed_permissions(&self) -> Vec<Permission> {
        self.permissions.iter().filter_map(|p| Permission::parse(p)).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LikesSnapshot {
    pub albums: Vec<String>,
    pub artists: Vec<String>,
    pub tracks: Vec<String>,
}

impl LikesSnapshot {
    /// Flatten into `(type, id)` pairs.
    pub fn items(&self) -> Vec<(LikedContentType, String)> {
        let mut items = Vec::with_capacity(self.albums.len() + self.artists.len() + self.tracks.len());
        items.extend(self.artists.iter().map(|id| (LikedContentType::Artist, id.clone())));
        items.extend(self.albums.iter().map(|id| (LikedContentType::Album, id.clone())));
        items.extend(self.tracks.iter().map(|id| (LikedContentType::Track, id.clone())));
        items
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistState {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tracks: Vec<String>,
}

/// Response of `GET /v1/sync/events?since=N`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncEventsPage {
    pub events: Vec<StoredEvent>,
    pub current_seq: u64,
}

// ── Catalog skeleton ────────────────────────────────────────────────

/// Response of `GET /v1/catalog/skeleton/version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkeletonVersion {
    pub version: u64,
    pub checksum: String,
}

/// Response of `GET /v1/catalog/skeleton`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullSkeleton {
    pub version: u64,
    pub checksum: String,
    pub artists: Vec<String>,
    pub albums: Vec<SkeletonAlbumEntry>,
    pub tracks: Vec<SkeletonTrackEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkeletonAlbumEntry {
    pub id: String,
    pub artist_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkeletonTrackEntry {
    pub id: String,
    pub album_id: String,
}

/// Response of `GET /v1/catalog/skeleton/delta?since=N`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkeletonDelta {
    pub from_version: u64,
    pub to_version: u64,
    pub checksum: String,
    pub changes: Vec<SkeletonChange>,
}

/// One catalog change. `event_type` is one of `artist_added`,
/// `artist_removed`, `album_added`, `album_removed`, `track_added`,
/// `track_removed`; other values are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkeletonChange {
    #[serde(rename = "type")]
    pub event_type: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album_id: Option<String>,
}

// ── Discography ─────────────────────────────────────────────────────

/// One page of an artist's discography, in the server's order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscographyPage {
    pub total: u32,
    pub albums: Vec<String>,
}

// ── Activity ────────────────────────────────────────────────────────

/// Body of `POST /v1/user/listening`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListeningEvent {
    pub track_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    pub duration_seconds: u32,
    pub track_duration_seconds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seek_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,
}

/// Body of `POST /v1/user/impression`: an item the user looked at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Impression {
    pub item_type: String,
    pub item_id: String,
    pub viewed_at: i64,
}
