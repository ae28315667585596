//! Remote API abstraction.
//!
//! - [`RemoteApi`]: typed async operations the sync engine needs from the server
//! - [`HttpApi`]: reqwest implementation against the catalog server's REST routes
//!
//! Everything above this module only sees `RemoteApi`, so tests swap in an
//! in-process fake.

pub mod http;
pub mod models;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use thiserror::Error;

use crate::events::LikedContentType;

pub use http::HttpApi;
pub use models::*;

/// Failure of one outbound call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server error (HTTP {status})")]
    Server { status: u16 },
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    /// The requested history is no longer available (HTTP 410).
    #[error("requested history is gone")]
    Gone,
    #[error("request rejected (HTTP {status})")]
    Rejected { status: u16 },
    #[error("malformed response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Worth retrying later. Permanent failures will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Server { .. })
    }

    /// The session was refused. Every later call fails the same way until
    /// the user signs in again, so drains stop without spending retries.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }

    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Unauthorized,
            404 => Self::NotFound,
            410 => Self::Gone,
            500..=599 => Self::Server { status },
            _ => Self::Rejected { status },
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Operations the sync engine consumes from the server.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    // ── Inbound ─────────────────────────────────────────────────────

    /// Full user state, used for first sync and after a gap.
    async fn get_sync_state(&self) -> ApiResult<SyncStateSnapshot>;

    /// Events with `seq > since`. `Gone` when the log was pruned past `since`.
    async fn get_sync_events(&self, since: u64) -> ApiResult<SyncEventsPage>;

    async fn get_skeleton_version(&self) -> ApiResult<SkeletonVersion>;

    async fn get_full_skeleton(&self) -> ApiResult<FullSkeleton>;

    async fn get_skeleton_delta(&self, since: u64) -> ApiResult<SkeletonDelta>;

    async fn get_artist_discography(
        &self,
        artist_id: &str,
        offset: u32,
        limit: u32,
        appears_on: bool,
    ) -> ApiResult<DiscographyPage>;

    // ── Outbound ────────────────────────────────────────────────────

    async fn mark_notification_read(&self, notification_id: &str) -> ApiResult<()>;

    /// Create a playlist; returns the server-assigned id.
    async fn create_playlist(&self, name: &str, track_ids: &[String]) -> ApiResult<String>;

    /// Replace name and tracks in one request, so an edit never lands half
    /// applied.
    async fn update_playlist(&self, playlist_id: &str, name: &str, track_ids: &[String]) -> ApiResult<()>;

    async fn delete_playlist(&self, playlist_id: &str) -> ApiResult<()>;

    async fn like(&self, content_type: LikedContentType, content_id: &str) -> ApiResult<()>;

    async fn unlike(&self, content_type: LikedContentType, content_id: &str) -> ApiResult<()>;

    async fn post_listening_event(&self, event: &ListeningEvent) -> ApiResult<()>;

    async fn post_impression(&self, impression: &Impression) -> ApiResult<()>;
}
