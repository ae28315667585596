//! reqwest-backed [`RemoteApi`] talking to the catalog server's REST routes.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client as HttpClient, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::json;

use super::{
    ApiError, ApiResult, DiscographyPage, FullSkeleton, Impression, ListeningEvent, RemoteApi,
    SkeletonDelta, SkeletonVersion, SyncEventsPage, SyncStateSnapshot,
};
use crate::config::ServerConfig;
use crate::events::LikedContentType;

pub struct HttpApi {
    base_url: String,
    auth_token: Option<String>,
    http_client: HttpClient,
}

impl HttpApi {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http_client.request(method, self.url(path));
        match self.auth_token {
            Some(ref token) => builder.header(header::AUTHORIZATION, format!("Bearer {}", token)),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> ApiResult<Response> {
        let resp = builder
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            tracing::debug!("{} returned {}", resp.url(), status);
            Err(ApiError::from_status(status.as_u16()))
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> ApiResult<T> {
        let resp = self.send(builder).await?;
        resp.json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn send_empty(&self, builder: RequestBuilder) -> ApiResult<()> {
        self.send(builder).await.map(|_| ())
    }
}

fn segment(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

fn playlist_body(name: &str, track_ids: &[String]) -> serde_json::Value {
    json!({ "name": name, "track_ids": track_ids })
}

#[async_trait]
impl RemoteApi for HttpApi {
    async fn get_sync_state(&self) -> ApiResult<SyncStateSnapshot> {
        self.get_json(self.request(Method::GET, "/v1/sync/state")).await
    }

    async fn get_sync_events(&self, since: u64) -> ApiResult<SyncEventsPage> {
        let req = self
            .request(Method::GET, "/v1/sync/events")
            .query(&[("since", since)]);
        self.get_json(req).await
    }

    async fn get_skeleton_version(&self) -> ApiResult<SkeletonVersion> {
        self.get_json(self.request(Method::GET, "/v1/catalog/skeleton/version"))
            .await
    }

    async fn get_full_skeleton(&self) -> ApiResult<FullSkeleton> {
        self.get_json(self.request(Method::GET, "/v1/catalog/skeleton")).await
    }

    async fn get_skeleton_delta(&self, since: u64) -> ApiResult<SkeletonDelta> {
        let req = self
            .request(Method::GET, "/v1/catalog/skeleton/delta")
            .query(&[("since", since)]);
        self.get_json(req).await
    }

    async fn get_artist_discography(
        &self,
        artist_id: &str,
        offset: u32,
        limit: u32,
        appears_on: bool,
    ) -> ApiResult<DiscographyPage> {
        let path = format!("/v1/content/artist/{}/discography", segment(artist_id));
        let req = self.request(Method::GET, &path).query(&[
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
            ("appears_on", appears_on.to_string()),
        ]);
        self.get_json(req).await
    }

    async fn mark_notification_read(&self, notification_id: &str) -> ApiResult<()> {
        let path = format!("/v1/user/notifications/{}/read", segment(notification_id));
        self.send_empty(self.request(Method::POST, &path)).await
    }

    async fn create_playlist(&self, name: &str, track_ids: &[String]) -> ApiResult<String> {
        let req = self
            .request(Method::POST, "/v1/user/playlist")
            .json(&playlist_body(name, track_ids));
        self.get_json(req).await
    }

    async fn update_playlist(&self, playlist_id: &str, name: &str, track_ids: &[String]) -> ApiResult<()> {
        let path = format!("/v1/user/playlist/{}", segment(playlist_id));
        let req = self
            .request(Method::PUT, &path)
            .json(&playlist_body(name, track_ids));
        self.send_empty(req).await
    }

    async fn delete_playlist(&self, playlist_id: &str) -> ApiResult<()> {
        let path = format!("/v1/user/playlist/{}", segment(playlist_id));
        self.send_empty(self.request(Method::DELETE, &path)).await
    }

    async fn like(&self, content_type: LikedContentType, content_id: &str) -> ApiResult<()> {
        let path = format!("/v1/user/liked/{}/{}", content_type, segment(content_id));
        self.send_empty(self.request(Method::POST, &path)).await
    }

    async fn unlike(&self, content_type: LikedContentType, content_id: &str) -> ApiResult<()> {
        let path = format!("/v1/user/liked/{}/{}", content_type, segment(content_id));
        self.send_empty(self.request(Method::DELETE, &path)).await
    }

    async fn post_listening_event(&self, event: &ListeningEvent) -> ApiResult<()> {
        let req = self.request(Method::POST, "/v1/user/listening").json(event);
        self.send_empty(req).await
    }

    async fn post_impression(&self, impression: &Impression) -> ApiResult<()> {
        let req = self.request(Method::POST, "/v1/user/impression").json(impression);
        self.send_empty(req).await
    }
}
