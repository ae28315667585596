//! Id-only catalog skeleton and the artist discography cache.
//!
//! The skeleton mirrors the server's artist → album → track relationships
//! without any metadata. It carries the catalog version it was built from
//! and can recompute the server's checksum to prove it has not drifted.
//!
//! The discography cache holds one ordered slice per `(artist, appears_on)`
//! key, filled page by page by the discography fetcher:
//!
//! ```text
//! "{artist_id}\x1f{0|1}\x1f{order_index:010}" → AlbumArtistRelationship
//! ```

use std::sync::Arc;

use anyhow::Result;
use redb::{TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::api::{FullSkeleton, SkeletonChange};
use crate::db::{self, LocalDb, RowTable};
use crate::observe::{Observable, Subscription};

const ARTISTS: RowTable = TableDefinition::new("skeleton_artists");
const ALBUMS: RowTable = TableDefinition::new("skeleton_albums");
const TRACKS: RowTable = TableDefinition::new("skeleton_tracks");
const META: RowTable = TableDefinition::new("skeleton_meta");
const DISCOGRAPHY: RowTable = TableDefinition::new("discography");

const VERSION_KEY: &str = "version";
const CHECKSUM_KEY: &str = "checksum";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumArtistRelationship {
    pub artist_id: String,
    pub album_id: String,
    /// Position in the server's ordering.
    pub order_index: u32,
    pub is_appears_on: bool,
}

/// Summary published after every skeleton write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkeletonInfo {
    pub version: u64,
    pub checksum: Option<String>,
    pub artists: usize,
    pub albums: usize,
    pub tracks: usize,
}

fn slice_prefix(artist_id: &str, appears_on: bool) -> String {
    format!("{}\u{1f}{}\u{1f}", artist_id, u8::from(appears_on))
}

fn slice_key(artist_id: &str, appears_on: bool, order_index: u32) -> String {
    format!("{}{:010}", slice_prefix(artist_id, appears_on), order_index)
}

/// `sha256:<hex>` over the sorted artist, album and track ids, each
/// newline-terminated, in that order.
pub fn skeleton_checksum<'a>(
    artists: impl IntoIterator<Item = &'a str>,
    albums: impl IntoIterator<Item = &'a str>,
    tracks: impl IntoIterator<Item = &'a str>,
) -> String {
    let mut hasher = Sha256::new();
    for ids in [
        sorted(artists),
        sorted(albums),
        sorted(tracks),
    ] {
        for id in ids {
            hasher.update(id.as_bytes());
            hasher.update(b"\n");
        }
    }
    format!("sha256:{:x}", hasher.finalize())
}

fn sorted<'a>(ids: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
    let mut v: Vec<&str> = ids.into_iter().collect();
    v.sort_unstable();
    v
}

pub struct CatalogSkeletonStore {
    db: Arc<LocalDb>,
    info: Observable<SkeletonInfo>,
}

impl CatalogSkeletonStore {
    pub fn new(db: Arc<LocalDb>) -> Result<Self> {
        let store = Self {
            db,
            info: Observable::default(),
        };
        store.refresh()?;
        Ok(store)
    }

    pub fn observe(&self) -> Subscription<SkeletonInfo> {
        self.info.subscribe()
    }

    pub fn info(&self) -> SkeletonInfo {
        self.info.get()
    }

    /// Catalog version the skeleton reflects; 0 before the first sync.
    pub fn version(&self) -> Result<u64> {
        Ok(self.db.get(META, VERSION_KEY)?.unwrap_or(0))
    }

    /// Checksum last reported by the server.
    pub fn checksum(&self) -> Result<Option<String>> {
        self.db.get(META, CHECKSUM_KEY)
    }

    pub fn artist_ids(&self) -> Result<Vec<String>> {
        Ok(self.db.scan::<()>(ARTISTS)?.into_iter().map(|(id, _)| id).collect())
    }

    /// Albums listing `artist_id` among their artists.
    pub fn albums_for_artist(&self, artist_id: &str) -> Result<Vec<String>> {
        Ok(self
            .db
            .scan::<Vec<String>>(ALBUMS)?
            .into_iter()
            .filter(|(_, artists)| artists.iter().any(|a| a == artist_id))
            .map(|(id, _)| id)
            .collect())
    }

    pub fn tracks_for_album(&self, album_id: &str) -> Result<Vec<String>> {
        Ok(self
            .db
            .scan::<String>(TRACKS)?
            .into_iter()
            .filter(|(_, album)| album == album_id)
            .map(|(id, _)| id)
            .collect())
    }

    /// Replace the whole skeleton with the server's copy.
    pub fn replace_all(&self, skeleton: FullSkeleton) -> Result<()> {
        self.db.write(|txn| {
            db::clear(txn, ARTISTS)?;
            db::clear(txn, ALBUMS)?;
            db::clear(txn, TRACKS)?;
            for id in &skeleton.artists {
                db::put(txn, ARTISTS, id, &())?;
            }
            for album in &skeleton.albums {
                db::put(txn, ALBUMS, &album.id, &album.artist_ids)?;
            }
            for track in &skeleton.tracks {
                db::put(txn, TRACKS, &track.id, &track.album_id)?;
            }
            self.set_version_in(txn, skeleton.version, &skeleton.checksum)
        })?;
        self.refresh()
    }

    /// Apply one catalog change. Adding a present id or removing an absent
    /// one changes nothing.
    pub fn apply_change_in(&self, txn: &WriteTransaction, change: &SkeletonChange) -> Result<()> {
        match change.event_type.as_str() {
            "artist_added" => db::put(txn, ARTISTS, &change.id, &())?,
            "artist_removed" => {
                db::remove(txn, ARTISTS, &change.id)?;
            }
            "album_added" => {
                let artists = change.artist_ids.clone().unwrap_or_default();
                db::put(txn, ALBUMS, &change.id, &artists)?;
            }
            "album_removed" => {
                db::remove(txn, ALBUMS, &change.id)?;
            }
            "track_added" => match change.album_id {
                Some(ref album_id) => db::put(txn, TRACKS, &change.id, album_id)?,
                None => tracing::debug!("track_added {} without album id, skipped", change.id),
            },
            "track_removed" => {
                db::remove(txn, TRACKS, &change.id)?;
            }
            other => tracing::debug!("Ignoring unknown skeleton change type {}", other),
        }
        Ok(())
    }

    pub fn set_version_in(&self, txn: &WriteTransaction, version: u64, checksum: &str) -> Result<()> {
        db::put(txn, META, VERSION_KEY, &version)?;
        db::put(txn, META, CHECKSUM_KEY, &checksum.to_string())
    }

    /// Checksum of the rows as they stand inside `txn`.
    pub fn compute_checksum_in(&self, txn: &WriteTransaction) -> Result<String> {
        let artists: Vec<(String, ())> = db::fetch_all(txn, ARTISTS)?;
        let albums: Vec<(String, Vec<String>)> = db::fetch_all(txn, ALBUMS)?;
        let tracks: Vec<(String, String)> = db::fetch_all(txn, TRACKS)?;
        Ok(skeleton_checksum(
            artists.iter().map(|(id, _)| id.as_str()),
            albums.iter().map(|(id, _)| id.as_str()),
            tracks.iter().map(|(id, _)| id.as_str()),
        ))
    }

    pub fn compute_checksum(&self) -> Result<String> {
        let artists = self.db.scan::<()>(ARTISTS)?;
        let albums = self.db.scan::<Vec<String>>(ALBUMS)?;
        let tracks = self.db.scan::<String>(TRACKS)?;
        Ok(skeleton_checksum(
            artists.iter().map(|(id, _)| id.as_str()),
            albums.iter().map(|(id, _)| id.as_str()),
            tracks.iter().map(|(id, _)| id.as_str()),
        ))
    }

    pub fn refresh(&self) -> Result<()> {
        let info = SkeletonInfo {
            version: self.version()?,
            checksum: self.checksum()?,
            artists: self.db.scan::<()>(ARTISTS)?.len(),
            albums: self.db.scan::<Vec<String>>(ALBUMS)?.len(),
            tracks: self.db.scan::<String>(TRACKS)?.len(),
        };
        self.info.publish(info);
        Ok(())
    }

    // ── Discography cache ───────────────────────────────────────────

    /// Cached slice for one key, in server order.
    pub fn discography(&self, artist_id: &str, appears_on: bool) -> Result<Vec<AlbumArtistRelationship>> {
        Ok(self
            .db
            .scan_prefix::<AlbumArtistRelationship>(DISCOGRAPHY, &slice_prefix(artist_id, appears_on))?
            .into_iter()
            .map(|(_, rel)| rel)
            .collect())
    }

    /// Replace the slice for one key with the first page.
    pub fn replace_discography(&self, artist_id: &str, appears_on: bool, album_ids: &[String]) -> Result<()> {
        self.db.write(|txn| {
            db::clear_prefix(txn, DISCOGRAPHY, &slice_prefix(artist_id, appears_on))?;
            self.insert_slice_in(txn, artist_id, appears_on, 0, album_ids, &[])?;
            Ok(())
        })
    }

    /// Append a later page at `offset`. Albums already in the slice are
    /// skipped so a shifting server list cannot show one album twice.
    pub fn append_discography(
        &self,
        artist_id: &str,
        appears_on: bool,
        offset: u32,
        album_ids: &[String],
    ) -> Result<usize> {
        self.db.write(|txn| {
            let present: Vec<String> =
                db::fetch_prefix::<AlbumArtistRelationship>(txn, DISCOGRAPHY, &slice_prefix(artist_id, appears_on))?
                    .into_iter()
                    .map(|(_, rel)| rel.album_id)
                    .collect();
            self.insert_slice_in(txn, artist_id, appears_on, offset, album_ids, &present)
        })
    }

    fn insert_slice_in(
        &self,
        txn: &WriteTransaction,
        artist_id: &str,
        appears_on: bool,
        offset: u32,
        album_ids: &[String],
        present: &[String],
    ) -> Result<usize> {
        let mut inserted = 0;
        for (i, album_id) in album_ids.iter().enumerate() {
            if present.contains(album_id) {
                continue;
            }
            let order_index = offset + i as u32;
            let rel = AlbumArtistRelationship {
                artist_id: artist_id.to_string(),
                album_id: album_id.clone(),
                order_index,
                is_appears_on: appears_on,
            };
            db::put(txn, DISCOGRAPHY, &slice_key(artist_id, appears_on, order_index), &rel)?;
            inserted += 1;
        }
        Ok(inserted)
    }
}
