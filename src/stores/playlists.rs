//! User playlists.
//!
//! Every edit lands in the local row at once and tags it with the strongest
//! pending intent. A drain sends the row's latest state, not each edit.

use std::sync::Arc;

use anyhow::Result;
use rand::Rng;
use redb::{TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{EntityFamily, EventStore};
use crate::api::{ApiError, ApiResult, PlaylistState, RemoteApi};
use crate::db::{self, LocalDb, RowTable};
use crate::events::SyncEvent;
use crate::observe::{Observable, Subscription};
use crate::queue::{DrainReport, SyncMeta, SyncStatus};

const PLAYLISTS: RowTable = TableDefinition::new("playlists");

const LOCAL_ID_PREFIX: &str = "local-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPlaylist {
    pub id: String,
    pub name: String,
    pub track_ids: Vec<String>,
    #[serde(default)]
    pub sync: SyncMeta,
}

impl UserPlaylist {
    pub fn status(&self) -> SyncStatus {
        self.sync.status
    }

    /// Created offline and not yet given a server id.
    pub fn is_local(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }

    fn from_server(state: PlaylistState) -> Self {
        Self {
            id: state.id,
            name: state.name,
            track_ids: state.tracks,
            sync: SyncMeta::synced(),
        }
    }
}

pub struct PlaylistStore {
    db: Arc<LocalDb>,
    view: Observable<Vec<UserPlaylist>>,
    drain_lock: Mutex<()>,
}

impl PlaylistStore {
    pub fn new(db: Arc<LocalDb>) -> Result<Self> {
        let store = Self {
            db,
            view: Observable::default(),
            drain_lock: Mutex::new(()),
        };
        store.refresh()?;
        Ok(store)
    }

    /// Playlists the user should see: everything not waiting to be deleted.
    pub fn observe(&self) -> Subscription<Vec<UserPlaylist>> {
        self.view.subscribe()
    }

    pub fn playlists(&self) -> Vec<UserPlaylist> {
        self.view.get()
    }

    /// Any row, including ones pending deletion.
    pub fn get(&self, id: &str) -> Result<Option<UserPlaylist>> {
        self.db.get(PLAYLISTS, id)
    }

    /// Rows whose sync was given up on and wait for [`Self::retry`] or
    /// [`Self::force_delete`].
    pub fn needs_attention(&self) -> Result<Vec<UserPlaylist>> {
        Ok(self
            .db
            .scan::<UserPlaylist>(PLAYLISTS)?
            .into_iter()
            .map(|(_, p)| p)
            .filter(|p| p.sync.needs_attention)
            .collect())
    }

    // ── Local mutators ──────────────────────────────────────────────

    /// Create a playlist offline. Returns its temporary local id.
    pub fn create(&self, name: &str, track_ids: Vec<String>) -> Result<String> {
        let id = format!("{}{:016x}", LOCAL_ID_PREFIX, rand::thread_rng().gen::<u64>());
        let playlist = UserPlaylist {
            id: id.clone(),
            name: name.to_string(),
            track_ids,
            sync: SyncMeta::pending_create(),
        };
        self.db.upsert(PLAYLISTS, &id, &playlist)?;
        self.refresh()?;
        Ok(id)
    }

    pub fn rename(&self, id: &str, name: &str) -> Result<bool> {
        self.edit(id, |p| p.name = name.to_string())
    }

    pub fn set_tracks(&self, id: &str, track_ids: Vec<String>) -> Result<bool> {
        self.edit(id, |p| p.track_ids = track_ids)
    }

    pub fn add_tracks(&self, id: &str, track_ids: &[String]) -> Result<bool> {
        self.edit(id, |p| p.track_ids.extend_from_slice(track_ids))
    }

    /// Remove tracks by position. Out-of-range positions are ignored.
    pub fn remove_tracks(&self, id: &str, positions: &[usize]) -> Result<bool> {
        self.edit(id, |p| {
            let mut i = 0;
            p.track_ids.retain(|_| {
                let keep = !positions.contains(&i);
                i += 1;
                keep
            });
        })
    }

    /// Delete locally. A playlist the server never saw disappears at once;
    /// any other waits for the drain to confirm.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut found = false;
        self.db.update(PLAYLISTS, id, |current: Option<UserPlaylist>| {
            let mut p = current?;
            found = true;
            let next = p.status().after_local_delete()?;
            p.sync.touch(next);
            Some(p)
        })?;
        self.refresh()?;
        Ok(found)
    }

    /// Forget a playlist locally without telling the server.
    pub fn force_delete(&self, id: &str) -> Result<bool> {
        let existed = self.db.delete(PLAYLISTS, id)?;
        self.refresh()?;
        Ok(existed)
    }

    /// Put a given-up row back in line for the next drain.
    pub fn retry(&self, id: &str) -> Result<bool> {
        let updated = self.db.update(PLAYLISTS, id, |current: Option<UserPlaylist>| {
            let mut p = current?;
            p.sync.retry_count = 0;
            p.sync.needs_attention = false;
            Some(p)
        })?;
        self.refresh()?;
        Ok(updated.is_some())
    }

    /// Apply a local edit. Rows pending deletion are not edited.
    fn edit(&self, id: &str, f: impl FnOnce(&mut UserPlaylist)) -> Result<bool> {
        let mut edited = false;
        self.db.update(PLAYLISTS, id, |current: Option<UserPlaylist>| {
            let mut p = current?;
            if p.status() == SyncStatus::PendingDelete {
                return Some(p);
            }
            f(&mut p);
            let next = p.status().after_local_update();
            p.sync.touch(next);
            edited = true;
            Some(p)
        })?;
        self.refresh()?;
        Ok(edited)
    }

    // ── Snapshot ────────────────────────────────────────────────────

    /// Replace synced rows with the server's list.
    ///
    /// Local creates survive. Local edits and deletes survive only while the
    /// server still has the playlist.
    pub fn replace_all(&self, playlists: Vec<PlaylistState>) -> Result<()> {
        self.db.write(|txn| self.replace_all_in(txn, playlists))?;
        self.refresh()
    }

    pub fn replace_all_in(&self, txn: &WriteTransaction, playlists: Vec<PlaylistState>) -> Result<()> {
        let local: Vec<(String, UserPlaylist)> = db::fetch_all(txn, PLAYLISTS)?;
        db::clear(txn, PLAYLISTS)?;

        for state in playlists {
            let pending = local
                .iter()
                .find(|(id, p)| *id == state.id && p.status().is_pending())
                .map(|(_, p)| p.clone());
            let row = pending.unwrap_or_else(|| UserPlaylist::from_server(state));
            db::put(txn, PLAYLISTS, &row.id, &row)?;
        }
        for (id, p) in local {
            if p.status() == SyncStatus::PendingCreate {
                db::put(txn, PLAYLISTS, &id, &p)?;
            }
        }
        Ok(())
    }

    // ── Drain ───────────────────────────────────────────────────────

    /// Push every pending row's latest state to the server. A concurrent
    /// call returns at once with `skipped` set.
    pub async fn drain(&self, api: &dyn RemoteApi, max_retries: u32) -> Result<DrainReport> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            tracing::debug!("Playlist drain already running");
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        };

        let pending: Vec<UserPlaylist> = self
            .db
            .scan::<UserPlaylist>(PLAYLISTS)?
            .into_iter()
            .map(|(_, p)| p)
            .filter(|p| p.sync.is_drainable())
            .collect();

        let mut report = DrainReport::default();
        for playlist in pending {
            report.attempted += 1;
            let sent = playlist.sync.revision;
            let result = send(api, &playlist).await;

            match result {
                Ok(server_id) => {
                    self.db.write(|txn| self.confirm_in(txn, &playlist, sent, server_id))?;
                    report.succeeded += 1;
                }
                Err(e) if e.is_auth() => {
                    tracing::warn!("Session refused, leaving playlist {} pending", playlist.id);
                    report.attempted -= 1;
                    report.halted = true;
                    break;
                }
                Err(e) => {
                    let transient = e.is_transient();
                    let gave_up = self.db.write(|txn| {
                        let Some(mut current) = db::fetch::<UserPlaylist>(txn, PLAYLISTS, &playlist.id)? else {
                            return Ok(false);
                        };
                        if current.sync.revision != sent {
                            return Ok(false);
                        }
                        let gave_up = current.sync.record_failure(max_retries, transient);
                        db::put(txn, PLAYLISTS, &current.id, &current)?;
                        Ok(gave_up)
                    })?;
                    if gave_up {
                        tracing::warn!("Playlist {} needs attention: {}", playlist.id, e);
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

    /// Record a successful send. Edits made after `sent` stay pending.
    ///
    /// A create whose local row was deleted while the request was in flight
    /// comes back as a pending delete under the server id.
    fn confirm_in(
        &self,
        txn: &WriteTransaction,
        sent_row: &UserPlaylist,
        sent: u64,
        server_id: Option<String>,
    ) -> Result<()> {
        let Some(mut current) = db::fetch::<UserPlaylist>(txn, PLAYLISTS, &sent_row.id)? else {
            if let Some(server_id) = server_id {
                tracing::debug!(
                    "Playlist {} was created as {} but deleted locally meanwhile",
                    sent_row.id,
                    server_id
                );
                let mut orphan = sent_row.clone();
                orphan.id = server_id;
                orphan.sync = SyncMeta::synced();
                orphan.sync.touch(SyncStatus::PendingDelete);
                db::put(txn, PLAYLISTS, &orphan.id, &orphan)?;
            }
            return Ok(());
        };

        match sent_row.status() {
            SyncStatus::PendingDelete => {
                db::remove(txn, PLAYLISTS, &current.id)?;
            }
            SyncStatus::PendingCreate => {
                db::remove(txn, PLAYLISTS, &current.id)?;
                if let Some(server_id) = server_id {
                    current.id = server_id;
                }
                if current.sync.revision == sent {
                    current.sync.confirm();
                } else if current.status() == SyncStatus::PendingCreate {
                    current.sync.status = SyncStatus::PendingUpdate;
                }
                db::put(txn, PLAYLISTS, &current.id, &current)?;
            }
            SyncStatus::PendingUpdate | SyncStatus::Synced => {
                if current.sync.revision == sent {
                    current.sync.confirm();
                    db::put(txn, PLAYLISTS, &current.id, &current)?;
                }
            }
        }
        Ok(())
    }
}

/// Issue the remote call for one pending row. Returns the server id for a
/// create.
async fn send(api: &dyn RemoteApi, p: &UserPlaylist) -> ApiResult<Option<String>> {
    match p.status() {
        SyncStatus::PendingCreate => api.create_playlist(&p.name, &p.track_ids).await.map(Some),
        SyncStatus::PendingUpdate => api.update_playlist(&p.id, &p.name, &p.track_ids).await.map(|()| None),
        SyncStatus::PendingDelete => match api.delete_playlist(&p.id).await {
            Ok(()) | Err(ApiError::NotFound) => Ok(None),
            Err(e) => Err(e),
        },
        SyncStatus::Synced => Ok(None),
    }
}

impl EventStore for PlaylistStore {
    fn db(&self) -> &LocalDb {
        &self.db
    }

    fn family(&self) -> EntityFamily {
        EntityFamily::Playlists
    }

    /// Remote changes never overwrite a row with local intent pending,
    /// except a remote delete, which removes it outright.
    fn apply_event_in(&self, txn: &WriteTransaction, event: &SyncEvent) -> Result<bool> {
        match event {
            SyncEvent::PlaylistCreated { playlist_id, name } => {
                if db::fetch::<UserPlaylist>(txn, PLAYLISTS, playlist_id)?.is_none() {
                    let row = UserPlaylist {
                        id: playlist_id.clone(),
                        name: name.clone(),
                        track_ids: Vec::new(),
                        sync: SyncMeta::synced(),
                    };
                    db::put(txn, PLAYLISTS, playlist_id, &row)?;
                }
            }
            SyncEvent::PlaylistRenamed { playlist_id, name } => {
                self.apply_remote_edit(txn, playlist_id, |p| p.name = name.clone())?;
            }
            SyncEvent::PlaylistTracksUpdated {
                playlist_id,
                track_ids,
            } => {
                self.apply_remote_edit(txn, playlist_id, |p| p.track_ids = track_ids.clone())?;
            }
            SyncEvent::PlaylistDeleted { playlist_id } => {
                db::remove(txn, PLAYLISTS, playlist_id)?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn refresh(&self) -> Result<()> {
        let visible = self
            .db
            .scan::<UserPlaylist>(PLAYLISTS)?
            .into_iter()
            .map(|(_, p)| p)
            .filter(|p| p.status() != SyncStatus::PendingDelete)
            .collect();
        self.view.publish(visible);
        Ok(())
    }
}

impl PlaylistStore {
    fn apply_remote_edit(
        &self,
        txn: &WriteTransaction,
        id: &str,
        f: impl FnOnce(&mut UserPlaylist),
    ) -> Result<()> {
        if let Some(mut p) = db::fetch::<UserPlaylist>(txn, PLAYLISTS, id)? {
            if p.status() == SyncStatus::Synced {
                f(&mut p);
                db::put(txn, PLAYLISTS, id, &p)?;
            }
        }
        Ok(())
    }
}
