//! Sync event vocabulary.
//!
//! The server keeps an append-only, per-user event log. Each entry reaches
//! the client as a [`StoredEvent`] envelope:
//!
//! ```text
//! {"seq": 42, "type": "content_liked", "payload": {...}, "server_timestamp": 1701700000}
//! ```
//!
//! The payload is one flat record ([`EventPayload`]) holding the optional
//! fields of every variant. [`SyncEvent::decode`] picks out the fields a tag
//! needs and returns `None` when they are missing or the tag is unknown, so
//! the envelope can grow additively without breaking older clients.

use serde::{Deserialize, Serialize};

// ── Value types ─────────────────────────────────────────────────────

/// Kind of content a like refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LikedContentType {
    Artist,
    Album,
    Track,
}

impl LikedContentType {
    pub const ALL: [LikedContentType; 3] = [Self::Artist, Self::Album, Self::Track];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Artist => "artist",
            Self::Album => "album",
            Self::Track => "track",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "artist" => Some(Self::Artist),
            "album" => Some(Self::Album),
            "track" => Some(Self::Track),
            _ => None,
        }
    }
}

impl std::fmt::Display for LikedContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed user setting. Serialized key-tagged: `{"key": "...", "value": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "key", content = "value")]
pub enum UserSetting {
    /// Searches also query external providers for requestable content.
    #[serde(rename = "enable_external_search")]
    ExternalSearchEnabled(bool),
}

impl UserSetting {
    pub fn key(&self) -> &'static str {
        match self {
            Self::ExternalSearchEnabled(_) => "enable_external_search",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    AccessCatalog,
    LikeContent,
    OwnPlaylists,
    EditCatalog,
    ManagePermissions,
    ServerAdmin,
    ViewAnalytics,
    RequestContent,
    DownloadManagerAdmin,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessCatalog => "AccessCatalog",
            Self::LikeContent => "LikeContent",
            Self::OwnPlaylists => "OwnPlaylists",
            Self::EditCatalog => "EditCatalog",
            Self::ManagePermissions => "ManagePermissions",
            Self::ServerAdmin => "ServerAdmin",
            Self::ViewAnalytics => "ViewAnalytics",
            Self::RequestContent => "RequestContent",
            Self::DownloadManagerAdmin => "DownloadManagerAdmin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AccessCatalog" => Some(Self::AccessCatalog),
            "LikeContent" => Some(Self::LikeContent),
            "OwnPlaylists" => Some(Self::OwnPlaylists),
            "EditCatalog" => Some(Self::EditCatalog),
            "ManagePermissions" => Some(Self::ManagePermissions),
            "ServerAdmin" => Some(Self::ServerAdmin),
            "ViewAnalytics" => Some(Self::ViewAnalytics),
            "RequestContent" => Some(Self::RequestContent),
            "DownloadManagerAdmin" => Some(Self::DownloadManagerAdmin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadContentType {
    Album,
}

impl DownloadContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Album => "album",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "album" => Some(Self::Album),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadQueueStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    RetryWaiting,
}

impl DownloadQueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::RetryWaiting => "RETRY_WAITING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "RETRY_WAITING" => Some(Self::RetryWaiting),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub total_children: i32,
    pub completed: i32,
    pub failed: i32,
    pub pending: i32,
    pub in_progress: i32,
}

/// A user notification as the server sends it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub created_at: i64,
    #[serde(default)]
    pub read_at: Option<i64>,
}

impl Notification {
    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }
}

// ── Domain events ───────────────────────────────────────────────────

/// A decoded remote change. Each variant carries only its own fields.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ContentLiked {
        content_type: LikedContentType,
        content_id: String,
    },
    ContentUnliked {
        content_type: LikedContentType,
        content_id: String,
    },
    SettingChanged {
        setting: UserSetting,
    },
    PlaylistCreated {
        playlist_id: String,
        name: String,
    },
    PlaylistRenamed {
        playlist_id: String,
        name: String,
    },
    PlaylistDeleted {
        playlist_id: String,
    },
    PlaylistTracksUpdated {
        playlist_id: String,
        track_ids: Vec<String>,
    },
    PermissionGranted {
        permission: Permission,
    },
    PermissionRevoked {
        permission: Permission,
    },
    PermissionsReset {
        permissions: Vec<Permission>,
    },
    DownloadRequestCreated {
        request_id: String,
        content_id: String,
        content_type: DownloadContentType,
        content_name: String,
        artist_name: Option<String>,
        queue_position: i32,
    },
    DownloadStatusChanged {
        request_id: String,
        content_id: String,
        status: DownloadQueueStatus,
        queue_position: Option<i32>,
        error_message: Option<String>,
    },
    DownloadProgressUpdated {
        request_id: String,
        content_id: String,
        progress: DownloadProgress,
    },
    DownloadCompleted {
        request_id: String,
        content_id: String,
    },
    NotificationCreated {
        notification: Notification,
    },
    NotificationRead {
        notification_id: String,
        read_at: i64,
    },
}

/// Setting as carried in the flat payload. The value stays untyped until
/// the key is recognised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingPayload {
    pub key: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Flat wire payload: the union of every variant's fields, all optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setting: Option<SettingPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playlist_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<DownloadProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<Notification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<i64>,
}

pub mod tags {
    pub const CONTENT_LIKED: &str = "content_liked";
    pub const CONTENT_UNLIKED: &str = "content_unliked";
    pub const SETTING_CHANGED: &str = "setting_changed";
    pub const PLAYLIST_CREATED: &str = "playlist_created";
    pub const PLAYLIST_RENAMED: &str = "playlist_renamed";
    pub const PLAYLIST_DELETED: &str = "playlist_deleted";
    pub const PLAYLIST_TRACKS_UPDATED: &str = "playlist_tracks_updated";
    pub const PERMISSION_GRANTED: &str = "permission_granted";
    pub const PERMISSION_REVOKED: &str = "permission_revoked";
    pub const PERMISSIONS_RESET: &str = "permissions_reset";
    pub const DOWNLOAD_REQUEST_CREATED: &str = "download_request_created";
    pub const DOWNLOAD_STATUS_CHANGED: &str = "download_status_changed";
    pub const DOWNLOAD_PROGRESS_UPDATED: &str = "download_progress_updated";
    pub const DOWNLOAD_COMPLETED: &str = "download_completed";
    pub const NOTIFICATION_CREATED: &str = "notification_created";
    pub const NOTIFICATION_READ: &str = "notification_read";
}

impl SettingPayload {
    /// Typed setting, or `None` for unknown keys and mistyped values.
    pub fn to_setting(&self) -> Option<UserSetting> {
        match self.key.as_str() {
            "enable_external_search" => self.value.as_bool().map(UserSetting::ExternalSearchEnabled),
            _ => None,
        }
    }
}

impl From<&UserSetting> for SettingPayload {
    fn from(setting: &UserSetting) -> Self {
        let value = match setting {
            UserSetting::ExternalSearchEnabled(enabled) => serde_json::Value::Bool(*enabled),
        };
        Self {
            key: setting.key().to_string(),
            value,
        }
    }
}

impl SyncEvent {
    /// Wire tag for this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ContentLiked { .. } => tags::CONTENT_LIKED,
            Self::ContentUnliked { .. } => tags::CONTENT_UNLIKED,
            Self::SettingChanged { .. } => tags::SETTING_CHANGED,
            Self::PlaylistCreated { .. } => tags::PLAYLIST_CREATED,
            Self::PlaylistRenamed { .. } => tags::PLAYLIST_RENAMED,
            Self::PlaylistDeleted { .. } => tags::PLAYLIST_DELETED,
            Self::PlaylistTracksUpdated { .. } => tags::PLAYLIST_TRACKS_UPDATED,
            Self::PermissionGranted { .. } => tags::PERMISSION_GRANTED,
            Self::PermissionRevoked { .. } => tags::PERMISSION_REVOKED,
            Self::PermissionsReset { .. } => tags::PERMISSIONS_RESET,
            Self::DownloadRequestCreated { .. } => tags::DOWNLOAD_REQUEST_CREATED,
            Self::DownloadStatusChanged { .. } => tags::DOWNLOAD_STATUS_CHANGED,
            Self::DownloadProgressUpdated { .. } => tags::DOWNLOAD_PROGRESS_UPDATED,
            Self::DownloadCompleted { .. } => tags::DOWNLOAD_COMPLETED,
            Self::NotificationCreated { .. } => tags::NOTIFICATION_CREATED,
            Self::NotificationRead { .. } => tags::NOTIFICATION_READ,
        }
    }

    /// Map a tag and its flat payload to a typed event.
    ///
    /// Total: unknown tags, missing required fields and unparseable enum
    /// values all yield `None`.
    pub fn decode(type_tag: &str, p: &EventPayload) -> Option<SyncEvent> {
        let event = match type_tag {
            tags::CONTENT_LIKED => Self::ContentLiked {
                content_type: LikedContentType::parse(p.content_type.as_deref()?)?,
                content_id: p.content_id.clone()?,
            },
            tags::CONTENT_UNLIKED => Self::ContentUnliked {
                content_type: LikedContentType::parse(p.content_type.as_deref()?)?,
                content_id: p.content_id.clone()?,
            },
            tags::SETTING_CHANGED => Self::SettingChanged {
                setting: p.setting.as_ref()?.to_setting()?,
            },
            tags::PLAYLIST_CREATED => Self::PlaylistCreated {
                playlist_id: p.playlist_id.clone()?,
                name: p.name.clone()?,
            },
            tags::PLAYLIST_RENAMED => Self::PlaylistRenamed {
                playlist_id: p.playlist_id.clone()?,
                name: p.name.clone()?,
            },
            tags::PLAYLIST_DELETED => Self::PlaylistDeleted {
                playlist_id: p.playlist_id.clone()?,
            },
            tags::PLAYLIST_TRACKS_UPDATED => Self::PlaylistTracksUpdated {
                playlist_id: p.playlist_id.clone()?,
                track_ids: p.track_ids.clone()?,
            },
            tags::PERMISSION_GRANTED => Self::PermissionGranted {
                permission: Permission::parse(p.permission.as_deref()?)?,
            },
            tags::PERMISSION_REVOKED => Self::PermissionRevoked {
                permission: Permission::parse(p.permission.as_deref()?)?,
            },
            tags::PERMISSIONS_RESET => Self::PermissionsReset {
                permissions: p
                    .permissions
                    .as_ref()?
                    .iter()
                    .map(|s| Permission::parse(s))
                    .collect::<Option<Vec<_>>>()?,
            },
            tags::DOWNLOAD_REQUEST_CREATED => Self::DownloadRequestCreated {
                request_id: p.request_id.clone()?,
                content_id: p.content_id.clone()?,
                content_type: DownloadContentType::parse(p.content_type.as_deref()?)?,
                content_name: p.content_name.clone()?,
                artist_name: p.artist_name.clone(),
                queue_position: p.queue_position?,
            },
            tags::DOWNLOAD_STATUS_CHANGED => Self::DownloadStatusChanged {
                request_id: p.request_id.clone()?,
                content_id: p.content_id.clone()?,
                status: DownloadQueueStatus::parse(p.status.as_deref()?)?,
                queue_position: p.queue_position,
                error_message: p.error_message.clone(),
            },
            tags::DOWNLOAD_PROGRESS_UPDATED => Self::DownloadProgressUpdated {
                request_id: p.request_id.clone()?,
                content_id: p.content_id.clone()?,
                progress: p.progress.clone()?,
            },
            tags::DOWNLOAD_COMPLETED => Self::DownloadCompleted {
                request_id: p.request_id.clone()?,
                content_id: p.content_id.clone()?,
            },
            tags::NOTIFICATION_CREATED => Self::NotificationCreated {
                notification: p.notification.clone()?,
            },
            tags::NOTIFICATION_READ => Self::NotificationRead {
                notification_id: p.notification_id.clone()?,
                read_at: p.read_at?,
            },
            _ => return None,
        };
        Some(event)
    }

    /// Inverse of [`SyncEvent::decode`].
    pub fn encode(&self) -> (&'static str, EventPayload) {
        let mut p = EventPayload::default();
        match self {
            Self::ContentLiked {
                content_type,
                content_id,
            }
            | Self::ContentUnliked {
                content_type,
                content_id,
            } => {
                p.content_type = Some(content_type.as_str().to_string());
                p.content_id = Some(content_id.clone());
            }
            Self::SettingChanged { setting } => {
                p.setting = Some(SettingPayload::from(setting));
            }
            Self::PlaylistCreated { playlist_id, name }
            | Self::PlaylistRenamed { playlist_id, name } => {
                p.playlist_id = Some(playlist_id.clone());
                p.name = Some(name.clone());
            }
            Self::PlaylistDeleted { playlist_id } => {
                p.playlist_id = Some(playlist_id.clone());
            }
            Self::PlaylistTracksUpdated {
                playlist_id,
                track_ids,
            } => {
                p.playlist_id = Some(playlist_id.clone());
                p.track_ids = Some(track_ids.clone());
            }
            Self::PermissionGranted { permission } | Self::PermissionRevoked { permission } => {
                p.permission = Some(permission.as_str().to_string());
            }
            Self::PermissionsReset { permissions } => {
                p.permissions = Some(permissions.iter().map(|x| x.as_str().to_string()).collect());
            }
            Self::DownloadRequestCreated {
                request_id,
                content_id,
                content_type,
                content_name,
                artist_name,
                queue_position,
            } => {
                p.request_id = Some(request_id.clone());
                p.content_id = Some(content_id.clone());
                p.content_type = Some(content_type.as_str().to_string());
                p.content_name = Some(content_name.clone());
                p.artist_name = artist_name.clone();
                p.queue_position = Some(*queue_position);
            }
            Self::DownloadStatusChanged {
                request_id,
                content_id,
                status,
                queue_position,
                error_message,
            } => {
                p.request_id = Some(request_id.clone());
                p.content_id = Some(content_id.clone());
                p.status = Some(status.as_str().to_string());
                p.queue_position = *queue_position;
                p.error_message = error_message.clone();
            }
            Self::DownloadProgressUpdated {
                request_id,
                content_id,
                progress,
            } => {
                p.request_id = Some(request_id.clone());
                p.content_id = Some(content_id.clone());
                p.progress = Some(progress.clone());
            }
            Self::DownloadCompleted {
                request_id,
                content_id,
            } => {
                p.request_id = Some(request_id.clone());
                p.content_id = Some(content_id.clone());
            }
            Self::NotificationCreated { notification } => {
                p.notification = Some(notification.clone());
            }
            Self::NotificationRead {
                notification_id,
                read_at,
            } => {
                p.notification_id = Some(notification_id.clone());
                p.read_at = Some(*read_at);
            }
        }
        (self.event_type(), p)
    }
}

// ── Envelope ────────────────────────────────────────────────────────

/// One entry of the server's event log as delivered to the client.
///
/// The payload is kept as raw JSON so one malformed entry cannot fail the
/// deserialization of a whole batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub seq: u64,
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub server_timestamp: u64,
}

impl StoredEvent {
    /// Wrap a typed event in an envelope.
    pub fn new(seq: u64, event: &SyncEvent, server_timestamp: u64) -> Self {
        let (tag, payload) = event.encode();
        Self {
            seq,
            type_tag: tag.to_string(),
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            server_timestamp,
        }
    }

    /// Decode the payload. `None` for unknown tags or malformed payloads.
    pub fn decode(&self) -> Option<SyncEvent> {
        let payload: EventPayload = match &self.payload {
            serde_json::Value::Null => EventPayload::default(),
            value => serde_json::from_value(value.clone()).ok()?,
        };
        SyncEvent::decode(&self.type_tag, &payload)
    }
}
