//! On-demand, paginated artist discography cache.
//!
//! Each `(artist, appears_on)` key is filled page by page into the skeleton
//! store's discography slice. A key has its own lock; a fetch that finds
//! the lock taken returns [`FetchOutcome::InProgress`] at once instead of
//! queueing behind it, so rapid re-entry from a scrolling list cannot stack
//! up requests.
//!
//! Fetch progress (server total, next offset, loading flag, last error)
//! lives only in memory, in a registry owned by the fetcher. It starts
//! empty on every process start.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::api::{ApiError, RemoteApi};
use crate::observe::{Observable, Subscription};
use crate::stores::{AlbumArtistRelationship, LocalStores};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched { count: usize, has_more: bool },
    /// Everything the server has is already cached.
    AlreadyComplete,
    /// Another fetch for the same key is running. More may exist.
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchKey {
    pub artist_id: String,
    pub appears_on: bool,
}

impl FetchKey {
    pub fn new(artist_id: &str, appears_on: bool) -> Self {
        Self {
            artist_id: artist_id.to_string(),
            appears_on,
        }
    }
}

/// Ephemeral progress of one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchState {
    pub server_total: Option<u32>,
    pub fetched_offset: u32,
    pub is_loading: bool,
    pub last_error: Option<String>,
}

impl FetchState {
    /// Unknown totals count as "maybe more".
    pub fn has_more(&self) -> bool {
        self.server_total.map_or(true, |total| self.fetched_offset < total)
    }
}

/// What a discography screen renders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscographyView {
    pub albums: Vec<AlbumArtistRelationship>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub has_more: bool,
}

/// One async lock per key, created on first use.
///
/// Entries are never removed. This grows with the number of distinct keys
/// touched, which is bounded by the catalog's artist count.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Take the key's lock if it is free.
    pub fn try_acquire(&self, key: &K) -> anyhow::Result<Option<OwnedMutexGuard<()>>> {
        let lock = {
            let mut locks = self.locks.lock().map_err(|e| anyhow!("lock poisoned: {e}"))?;
            locks.entry(key.clone()).or_default().clone()
        };
        Ok(lock.try_lock_owned().ok())
    }

    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

struct KeyEntry {
    state: FetchState,
    view: Observable<DiscographyView>,
}

/// Fetches for one key run on their own task. A caller that stops waiting
/// does not stop the page from being stored or the loading flag from being
/// cleared.
#[derive(Clone)]
pub struct DiscographyFetcher {
    inner: Arc<FetcherInner>,
}

struct FetcherInner {
    api: Arc<dyn RemoteApi>,
    stores: Arc<LocalStores>,
    page_size: u32,
    locks: KeyedLocks<FetchKey>,
    registry: Mutex<HashMap<FetchKey, KeyEntry>>,
}

#[derive(Debug, Clone, Copy)]
enum PageRequest {
    First,
    Next,
}

impl DiscographyFetcher {
    pub fn new(api: Arc<dyn RemoteApi>, stores: Arc<LocalStores>, page_size: u32) -> Self {
        Self {
            inner: Arc::new(FetcherInner {
                api,
                stores,
                page_size: page_size.max(1),
                locks: KeyedLocks::new(),
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Cached albums plus fetch progress for one key.
    pub fn observe(&self, artist_id: &str, appears_on: bool) -> anyhow::Result<Subscription<DiscographyView>> {
        let key = FetchKey::new(artist_id, appears_on);
        self.inner.update(&key, |_| {})?;
        self.inner.with_entry(&key, |entry| entry.view.subscribe())
    }

    pub fn state(&self, artist_id: &str, appears_on: bool) -> anyhow::Result<FetchState> {
        self.inner
            .with_entry(&FetchKey::new(artist_id, appears_on), |entry| entry.state.clone())
    }

    /// Fetch the first page and replace whatever the key had cached.
    pub async fn fetch_first_page(&self, artist_id: &str, appears_on: bool) -> Result<FetchOutcome, FetchError> {
        self.run(FetchKey::new(artist_id, appears_on), PageRequest::First).await
    }

    /// Fetch the page after the last one fetched and append it.
    pub async fn fetch_more(&self, artist_id: &str, appears_on: bool) -> Result<FetchOutcome, FetchError> {
        self.run(FetchKey::new(artist_id, appears_on), PageRequest::Next).await
    }

    async fn run(&self, key: FetchKey, request: PageRequest) -> Result<FetchOutcome, FetchError> {
        let Some(guard) = self.inner.locks.try_acquire(&key)? else {
            return Ok(FetchOutcome::InProgress);
        };

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            match request {
                PageRequest::First => inner.first_page_locked(&key).await,
                PageRequest::Next => inner.next_page_locked(&key).await,
            }
        });
        task.await
            .map_err(|e| FetchError::Storage(anyhow!("discography fetch task failed: {e}")))?
    }
}

impl FetcherInner {
    async fn next_page_locked(&self, key: &FetchKey) -> Result<FetchOutcome, FetchError> {
        let state = self.with_entry(key, |entry| entry.state.clone())?;
        if state.server_total.is_none() {
            return self.first_page_locked(key).await;
        }
        if !state.has_more() {
            return Ok(FetchOutcome::AlreadyComplete);
        }

        let offset = state.fetched_offset;
        self.update(key, start_loading)?;
        let page = match self
            .api
            .get_artist_discography(&key.artist_id, offset, self.page_size, key.appears_on)
            .await
        {
            Ok(page) => page,
            Err(e) => return Err(self.record_failure(key, e)),
        };

        let count = page.albums.len();
        if let Err(e) = self
            .stores
            .skeleton
            .append_discography(&key.artist_id, key.appears_on, offset, &page.albums)
        {
            self.update(key, |s| fail_loading(s, e.to_string()))?;
            return Err(FetchError::Storage(e));
        }

        let state = self.update(key, |s| finish_page(s, offset, count, page.total))?;
        Ok(FetchOutcome::Fetched {
            count,
            has_more: state.has_more(),
        })
    }

    async fn first_page_locked(&self, key: &FetchKey) -> Result<FetchOutcome, FetchError> {
        self.update(key, start_loading)?;
        let page = match self
            .api
            .get_artist_discography(&key.artist_id, 0, self.page_size, key.appears_on)
            .await
        {
            Ok(page) => page,
            Err(e) => return Err(self.record_failure(key, e)),
        };

        let count = page.albums.len();
        if let Err(e) = self
            .stores
            .skeleton
            .replace_discography(&key.artist_id, key.appears_on, &page.albums)
        {
            self.update(key, |s| fail_loading(s, e.to_string()))?;
            return Err(FetchError::Storage(e));
        }

        let state = self.update(key, |s| finish_page(s, 0, count, page.total))?;
        Ok(FetchOutcome::Fetched {
            count,
            has_more: state.has_more(),
        })
    }

    fn record_failure(&self, key: &FetchKey, err: ApiError) -> FetchError {
        tracing::warn!(
            "Discography fetch for {} (appears_on={}) failed: {}",
            key.artist_id,
            key.appears_on,
            err
        );
        if let Err(e) = self.update(key, |s| fail_loading(s, err.to_string())) {
            return FetchError::Storage(e);
        }
        FetchError::Api(err)
    }

    fn with_entry<R>(&self, key: &FetchKey, f: impl FnOnce(&mut KeyEntry) -> R) -> anyhow::Result<R> {
        let mut registry = self.registry.lock().map_err(|e| anyhow!("lock poisoned: {e}"))?;
        let entry = registry.entry(key.clone()).or_insert_with(|| KeyEntry {
            state: FetchState::default(),
            view: Observable::new(DiscographyView {
                has_more: true,
                ..DiscographyView::default()
            }),
        });
        Ok(f(entry))
    }

    /// Mutate a key's state and republish its view with the cached rows.
    fn update(&self, key: &FetchKey, f: impl FnOnce(&mut FetchState)) -> anyhow::Result<FetchState> {
        let albums = self.stores.skeleton.discography(&key.artist_id, key.appears_on)?;
        self.with_entry(key, |entry| {
            f(&mut entry.state);
            entry.view.publish(DiscographyView {
                albums,
                is_loading: entry.state.is_loading,
                error: entry.state.last_error.clone(),
                has_more: entry.state.has_more(),
            });
            entry.state.clone()
        })
    }
}

fn start_loading(s: &mut FetchState) {
    s.is_loading = true;
    s.last_error = None;
}

fn fail_loading(s: &mut FetchState, error: String) {
    s.is_loading = false;
    s.last_error = Some(error);
}

fn finish_page(s: &mut FetchState, offset: u32, count: usize, total: u32) {
    s.is_loading = false;
    s.last_error = None;
    s.fetched_offset = offset + count as u32;
    // An empty page ends the listing even if the total promised more.
    s.server_total = Some(if count == 0 { s.fetched_offset } else { total });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockApi;
    use crate::config::Config;
    use crate::db::LocalDb;
    use std::time::Duration;

    fn albums(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("album-{:02}", i)).collect()
    }

    fn fetcher(api: Arc<MockApi>) -> DiscographyFetcher {
        let db = Arc::new(LocalDb::in_memory().unwrap());
        let stores = Arc::new(LocalStores::new(db, &Config::default()).unwrap());
        DiscographyFetcher::new(api, stores, 20)
    }

    fn order(view: &DiscographyView) -> Vec<u32> {
        view.albums.iter().map(|r| r.order_index).collect()
    }

    #[tokio::test]
    async fn test_pages_through_45_albums() {
        let api = Arc::new(MockApi::new());
        api.set_discography("artist-1", false, albums(45));
        let fetcher = fetcher(api.clone());
        let view = fetcher.observe("artist-1", false).unwrap();

        let first = fetcher.fetch_first_page("artist-1", false).await.unwrap();
        assert_eq!(first, FetchOutcome::Fetched { count: 20, has_more: true });
        assert_eq!(order(&view.borrow()), (0..20).collect::<Vec<_>>());

        let second = fetcher.fetch_more("artist-1", false).await.unwrap();
        assert_eq!(second, FetchOutcome::Fetched { count: 20, has_more: true });
        assert_eq!(order(&view.borrow()), (0..40).collect::<Vec<_>>());

        let third = fetcher.fetch_more("artist-1", false).await.unwrap();
        assert_eq!(third, FetchOutcome::Fetched { count: 5, has_more: false });
        assert!(!view.borrow().has_more);
        assert_eq!(view.borrow().albums.len(), 45);
        assert_eq!(view.borrow().albums[44].album_id, "album-44");

        assert_eq!(
            fetcher.fetch_more("artist-1", false).await.unwrap(),
            FetchOutcome::AlreadyComplete
        );
        assert_eq!(
            api.calls(),
            vec![
                "get_artist_discography artist-1 0 20 false",
                "get_artist_discography artist-1 20 20 false",
                "get_artist_discography artist-1 40 20 false",
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_more_while_first_page_in_flight() {
        let api = Arc::new(MockApi::new());
        api.set_discography("artist-1", false, albums(45));
        let gate = api.gate_discography();
        let fetcher = Arc::new(fetcher(api.clone()));
        let mut view = fetcher.observe("artist-1", false).unwrap();

        let background = fetcher.clone();
        let first = tokio::spawn(async move { background.fetch_first_page("artist-1", false).await });
        view.wait_for(|v| v.is_loading).await.unwrap();

        let more = fetcher.fetch_more("artist-1", false).await.unwrap();
        assert_eq!(more, FetchOutcome::InProgress);
        assert_eq!(api.calls_to("get_artist_discography"), 0);

        gate.notify_one();
        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome, FetchOutcome::Fetched { count: 20, has_more: true });
        assert_eq!(api.calls_to("get_artist_discography"), 1);
    }

    #[tokio::test]
    async fn test_fetch_completes_after_caller_gives_up() {
        let api = Arc::new(MockApi::new());
        api.set_discography("artist-1", false, albums(25));
        let gate = api.gate_discography();
        let fetcher = fetcher(api.clone());
        let mut view = fetcher.observe("artist-1", false).unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), fetcher.fetch_first_page("artist-1", false)).await;
        assert!(abandoned.is_err());
        assert!(fetcher.state("artist-1", false).unwrap().is_loading);
        assert_eq!(
            fetcher.fetch_more("artist-1", false).await.unwrap(),
            FetchOutcome::InProgress
        );

        gate.notify_one();
        view.wait_for(|v| !v.is_loading).await.unwrap();
        assert_eq!(view.borrow().albums.len(), 20);
        assert!(view.borrow().has_more);
        assert_eq!(fetcher.state("artist-1", false).unwrap().fetched_offset, 20);
        assert_eq!(api.calls_to("get_artist_discography"), 1);

        gate.notify_one();
        let more = fetcher.fetch_more("artist-1", false).await.unwrap();
        assert_eq!(more, FetchOutcome::Fetched { count: 5, has_more: false });
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let api = Arc::new(MockApi::new());
        api.set_discography("artist-1", false, albums(3));
        api.set_discography("artist-1", true, albums(2));
        let fetcher = fetcher(api.clone());

        fetcher.fetch_first_page("artist-1", false).await.unwrap();
        fetcher.fetch_first_page("artist-1", true).await.unwrap();
        assert_eq!(fetcher.observe("artist-1", false).unwrap().borrow().albums.len(), 3);
        assert_eq!(fetcher.observe("artist-1", true).unwrap().borrow().albums.len(), 2);
        assert_eq!(fetcher.inner.locks.len(), 2);
    }

    #[tokio::test]
    async fn test_error_is_recorded_not_retried() {
        let api = Arc::new(MockApi::new());
        api.set_discography("artist-1", false, albums(5));
        api.fail_next(ApiError::Server { status: 502 });
        let fetcher = fetcher(api.clone());
        let view = fetcher.observe("artist-1", false).unwrap();

        let err = fetcher.fetch_first_page("artist-1", false).await.unwrap_err();
        assert!(matches!(err, FetchError::Api(ApiError::Server { status: 502 })));
        assert!(view.borrow().error.is_some());
        assert!(!view.borrow().is_loading);
        assert_eq!(api.calls_to("get_artist_discography"), 1);

        // Explicit retry clears the error.
        fetcher.fetch_first_page("artist-1", false).await.unwrap();
        assert!(view.borrow().error.is_none());
        assert_eq!(view.borrow().albums.len(), 5);
    }

    #[tokio::test]
    async fn test_first_page_always_refetches_and_replaces() {
        let api = Arc::new(MockApi::new());
        api.set_discography("artist-1", false, albums(3));
        let fetcher = fetcher(api.clone());
        fetcher.fetch_first_page("artist-1", false).await.unwrap();

        api.set_discography("artist-1", false, vec!["new-release".to_string(), "album-00".to_string()]);
        fetcher.fetch_first_page("artist-1", false).await.unwrap();

        let view = fetcher.observe("artist-1", false).unwrap();
        let ids: Vec<String> = view.borrow().albums.iter().map(|r| r.album_id.clone()).collect();
        assert_eq!(ids, vec!["new-release", "album-00"]);
        assert_eq!(api.calls_to("get_artist_discography"), 2);
    }

    #[tokio::test]
    async fn test_fetch_more_without_first_page_starts_at_zero() {
        let api = Arc::new(MockApi::new());
        api.set_discography("artist-1", false, albums(4));
        let fetcher = fetcher(api.clone());

        let outcome = fetcher.fetch_more("artist-1", false).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Fetched { count: 4, has_more: false });
        assert_eq!(api.calls(), vec!["get_artist_discography artist-1 0 20 false"]);
    }
}
