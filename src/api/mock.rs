//! Scriptable in-process [`RemoteApi`] for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{
    ApiError, ApiResult, DiscographyPage, FullSkeleton, Impression, ListeningEvent, RemoteApi,
    SkeletonDelta, SkeletonVersion, SyncEventsPage, SyncStateSnapshot,
};
use crate::events::{LikedContentType, StoredEvent};

#[derive(Default)]
struct MockState {
    calls: Vec<String>,
    fail_all: Option<ApiError>,
    fail_next: VecDeque<ApiError>,
    sync_state: SyncStateSnapshot,
    events: Vec<StoredEvent>,
    events_gone: bool,
    skeleton: FullSkeleton,
    delta: Option<SkeletonDelta>,
    /// Full album list per `(artist, appears_on)`; pages are cut from it.
    discography: HashMap<(String, bool), Vec<String>>,
    discography_gate: Option<Arc<Notify>>,
    /// Outbound calls held after being recorded, by method name.
    outbound_gates: HashMap<&'static str, Arc<Notify>>,
    next_playlist: u32,
}

#[derive(Default)]
pub(crate) struct MockApi {
    state: Mutex<MockState>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn calls_to(&self, prefix: &str) -> usize {
        self.state().calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Every call fails with `err` until [`Self::succeed`].
    pub fn fail_all(&self, err: ApiError) {
        self.state().fail_all = Some(err);
    }

    pub fn fail_next(&self, err: ApiError) {
        self.state().fail_next.push_back(err);
    }

    pub fn succeed(&self) {
        let mut s = self.state();
        s.fail_all = None;
        s.fail_next.clear();
    }

    pub fn set_sync_state(&self, state: SyncStateSnapshot) {
        self.state().sync_state = state;
    }

    pub fn push_events(&self, events: Vec<StoredEvent>) {
        self.state().events.extend(events);
    }

    pub fn set_events_gone(&self, gone: bool) {
        self.state().events_gone = gone;
    }

    pub fn set_skeleton(&self, skeleton: FullSkeleton) {
        self.state().skeleton = skeleton;
    }

    pub fn set_delta(&self, delta: Option<SkeletonDelta>) {
        self.state().delta = delta;
    }

    pub fn set_discography(&self, artist_id: &str, appears_on: bool, albums: Vec<String>) {
        self.state()
            .discography
            .insert((artist_id.to_string(), appears_on), albums);
    }

    /// Hold discography responses until the returned handle is notified.
    pub fn gate_discography(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state().discography_gate = Some(gate.clone());
        gate
    }

    /// Hold calls to `method` after they are recorded until the returned
    /// handle is notified.
    pub fn gate_outbound(&self, method: &'static str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state().outbound_gates.insert(method, gate.clone());
        gate
    }

    async fn pass_gate(&self, method: &str) {
        let gate = self.state().outbound_gates.get(method).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    fn record(&self, call: String) -> ApiResult<()> {
        let mut s = self.state();
        s.calls.push(call);
        if let Some(ref err) = s.fail_all {
            return Err(err.clone());
        }
        match s.fail_next.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteApi for MockApi {
    async fn get_sync_state(&self) -> ApiResult<SyncStateSnapshot> {
        self.record("get_sync_state".to_string())?;
        Ok(self.state().sync_state.clone())
    }

    async fn get_sync_events(&self, since: u64) -> ApiResult<SyncEventsPage> {
        self.record(format!("get_sync_events {}", since))?;
        let s = self.state();
        if s.events_gone {
            return Err(ApiError::Gone);
        }
        let events: Vec<StoredEvent> = s.events.iter().filter(|e| e.seq > since).cloned().collect();
        let current_seq = s.events.iter().map(|e| e.seq).max().unwrap_or(since).max(since);
        Ok(SyncEventsPage { events, current_seq })
    }

    async fn get_skeleton_version(&self) -> ApiResult<SkeletonVersion> {
        self.record("get_skeleton_version".to_string())?;
        let s = self.state();
        Ok(SkeletonVersion {
            version: s.skeleton.version,
            checksum: s.skeleton.checksum.clone(),
        })
    }

    async fn get_full_skeleton(&self) -> ApiResult<FullSkeleton> {
        self.record("get_full_skeleton".to_string())?;
        Ok(self.state().skeleton.clone())
    }

    async fn get_skeleton_delta(&self, since: u64) -> ApiResult<SkeletonDelta> {
        self.record(format!("get_skeleton_delta {}", since))?;
        self.state().delta.clone().ok_or(ApiError::NotFound)
    }

    async fn get_artist_discography(
        &self,
        artist_id: &str,
        offset: u32,
        limit: u32,
        appears_on: bool,
    ) -> ApiResult<DiscographyPage> {
        let gate = self.state().discography_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.record(format!(
            "get_artist_discography {} {} {} {}",
            artist_id, offset, limit, appears_on
        ))?;
        let s = self.state();
        let all = s
            .discography
            .get(&(artist_id.to_string(), appears_on))
            .cloned()
            .unwrap_or_default();
        let albums = all
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(DiscographyPage {
            total: all.len() as u32,
            albums,
        })
    }

    async fn mark_notification_read(&self, notification_id: &str) -> ApiResult<()> {
        self.record(format!("mark_notification_read {}", notification_id))
    }

    async fn create_playlist(&self, name: &str, track_ids: &[String]) -> ApiResult<String> {
        self.record(format!("create_playlist {} [{}]", name, track_ids.join(",")))?;
        self.pass_gate("create_playlist").await;
        let mut s = self.state();
        s.next_playlist += 1;
        Ok(format!("srv-{}", s.next_playlist))
    }

    async fn update_playlist(&self, playlist_id: &str, name: &str, track_ids: &[String]) -> ApiResult<()> {
        self.record(format!(
            "update_playlist {} {} [{}]",
            playlist_id,
            name,
            track_ids.join(",")
        ))
    }

    async fn delete_playlist(&self, playlist_id: &str) -> ApiResult<()> {
        self.record(format!("delete_playlist {}", playlist_id))
    }

    async fn like(&self, content_type: LikedContentType, content_id: &str) -> ApiResult<()> {
        self.record(format!("like {} {}", content_type, content_id))?;
        self.pass_gate("like").await;
        Ok(())
    }

    async fn unlike(&self, content_type: LikedContentType, content_id: &str) -> ApiResult<()> {
        self.record(format!("unlike {} {}", content_type, content_id))
    }

    async fn post_listening_event(&self, event: &ListeningEvent) -> ApiResult<()> {
        self.record(format!("post_listening_event {}", event.track_id))
    }

    async fn post_impression(&self, impression: &Impression) -> ApiResult<()> {
        self.record(format!("post_impression {} {}", impression.item_type, impression.item_id))
    }
}
