//! Snapshot refresh cache
//!
//! One slot per resource (catalog, guide). Snapshots are immutable once
//! published and replaced atomically; readers either get the current
//! snapshot immediately or, while a refresh is in flight, the previous
//! one. At most one refresh per slot runs at a time; only the very first
//! read of a never-fetched resource waits for the network.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};

use crate::config::{self, CoreConfig};
use crate::epg::{self, GuideIndex, ProgrammeEntry};
use crate::error::CatalogError;
use crate::m3u::{self, CatalogFetch};
use crate::models::{CacheStatus, CatalogSnapshot, GuideSnapshot};
use crate::url_norm;

/// Seam between the cache and the network, so tests can refresh without
/// sockets.
pub trait SourceFetcher: Send + Sync + 'static {
    fn fetch_catalog(&self, urls: &[String]) -> Result<CatalogFetch, CatalogError>;
    fn fetch_guide(&self, url: &str) -> Option<GuideIndex>;
}

/// Production fetcher delegating to the playlist and guide parsers.
pub struct HttpFetcher {
    config: CoreConfig,
}

impl HttpFetcher {
    pub fn new(config: CoreConfig) -> Self {
        Self { config }
    }
}

impl SourceFetcher for HttpFetcher {
    fn fetch_catalog(&self, urls: &[String]) -> Result<CatalogFetch, CatalogError> {
        m3u::fetch_catalog(urls, &self.config)
    }

    fn fetch_guide(&self, url: &str) -> Option<GuideIndex> {
        epg::parser::fetch_guide(url, &self.config)
    }
}

/// One keyed snapshot slot. `refreshing` is the coalescing gate: it is
/// set under the lock before any fetch starts and cleared when the fetch
/// finishes, so a second refresh can never start while one is in flight.
struct Slot<T> {
    key: String,
    value: Option<Arc<T>>,
    refreshing: bool,
    /// The most recent finished fetch for the current key failed. Lets a
    /// waiter tell a failure for its own key apart from a discarded fetch
    /// for a superseded one.
    failed: bool,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            key: String::new(),
            value: None,
            refreshing: false,
            failed: false,
        }
    }

    /// A key change evicts the snapshot: the cache has exactly one slot
    /// per resource. An in-flight refresh for the old key publishes
    /// nothing (its key no longer matches).
    fn ensure_key(&mut self, key: &str, what: &str) {
        if self.key != key {
            if !self.key.is_empty() {
                debug!("{} key changed, evicting cached snapshot", what);
            }
            self.key = key.to_string();
            self.value = None;
            self.failed = false;
        }
    }
}

struct CacheState {
    catalog: Slot<CatalogSnapshot>,
    guide: Slot<GuideSnapshot>,
}

/// Keyed, versioned snapshot cache over a [`SourceFetcher`].
pub struct CatalogCache<F: SourceFetcher = HttpFetcher> {
    fetcher: Arc<F>,
    guide_interval: Duration,
    shared: Arc<(Mutex<CacheState>, Condvar)>,
}

impl CatalogCache<HttpFetcher> {
    pub fn new(config: CoreConfig) -> Self {
        let guide_interval = Duration::from_secs(config.guide_interval_secs);
        Self::with_fetcher(HttpFetcher::new(config), guide_interval)
    }
}

impl<F: SourceFetcher> CatalogCache<F> {
    pub fn with_fetcher(fetcher: F, guide_interval: Duration) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            guide_interval,
            shared: Arc::new((
                Mutex::new(CacheState {
                    catalog: Slot::new(),
                    guide: Slot::new(),
                }),
                Condvar::new(),
            )),
        }
    }

    /// Get the channel catalog for a raw playlist URL list, refreshing it
    /// when older than the `"HH:MM"` interval spec. Never fails: the worst
    /// case is an empty snapshot when no fetch ever succeeded.
    pub fn catalog(&self, raw_urls: &str, interval_spec: &str) -> Arc<CatalogSnapshot> {
        let urls = url_norm::normalize_source_urls(raw_urls);
        let key = urls.join(",");
        let interval = config::parse_update_interval(interval_spec);

        let (lock, cvar) = &*self.shared;
        let mut state = lock.lock().unwrap();
        state.catalog.ensure_key(&key, "catalog");

        loop {
            if let Some(snapshot) = state.catalog.value.clone() {
                let stale = snapshot.fetched_at.elapsed() >= interval;
                if !stale || state.catalog.refreshing {
                    return snapshot;
                }
                state.catalog.refreshing = true;
                drop(state);
                self.spawn_catalog_refresh(urls, key);
                // serve the stale snapshot while the refresh runs
                return snapshot;
            }

            if state.catalog.refreshing {
                // another caller's fetch for this slot is in flight
                state = cvar.wait(state).unwrap();
                if state.catalog.refreshing || state.catalog.value.is_some() {
                    continue;
                }
                if state.catalog.failed && state.catalog.key == key {
                    // the shared fetch for this key failed: same fallback
                    // for everyone
                    return Arc::new(CatalogSnapshot::empty(&key));
                }
                // the finished fetch was for a superseded key; fetch ours
                continue;
            }

            // first read of a never-fetched key pays the latency
            state.catalog.refreshing = true;
            drop(state);
            let result = self.fetcher.fetch_catalog(&urls);

            let mut state = lock.lock().unwrap();
            state.catalog.refreshing = false;
            let out = match result {
                Ok(fetch) => {
                    let snapshot = Arc::new(snapshot_from(fetch, &key));
                    info!("catalog refreshed: {} channels", snapshot.channels.len());
                    if state.catalog.key == key {
                        state.catalog.value = Some(snapshot.clone());
                        state.catalog.failed = false;
                    }
                    snapshot
                }
                Err(e) => {
                    warn!("catalog refresh failed: {}", e);
                    if state.catalog.key == key {
                        state.catalog.failed = true;
                    }
                    Arc::new(CatalogSnapshot::empty(&key))
                }
            };
            cvar.notify_all();
            return out;
        }
    }

    fn spawn_catalog_refresh(&self, urls: Vec<String>, key: String) {
        let fetcher = self.fetcher.clone();
        let shared = self.shared.clone();
        thread::spawn(move || {
            let result = fetcher.fetch_catalog(&urls);
            let (lock, cvar) = &*shared;
            let mut state = lock.lock().unwrap();
            state.catalog.refreshing = false;
            match result {
                Ok(fetch) if state.catalog.key == key => {
                    info!("catalog refreshed in background: {} channels", fetch.channels.len());
                    state.catalog.value = Some(Arc::new(snapshot_from(fetch, &key)));
                    state.catalog.failed = false;
                }
                Ok(_) => debug!("discarding catalog refresh for a superseded key"),
                // old snapshot stays; its age keeps it stale, so the next
                // read retries instead of failing forever
                Err(e) => {
                    if state.catalog.key == key {
                        state.catalog.failed = true;
                    }
                    warn!("catalog refresh failed, keeping previous snapshot: {}", e);
                }
            }
            cvar.notify_all();
        });
    }

    /// Get the guide snapshot for a guide URL, refreshed on the fixed
    /// guide interval. `None` when no URL is configured or no fetch ever
    /// succeeded.
    pub fn guide(&self, url: Option<&str>) -> Option<Arc<GuideSnapshot>> {
        let key = url?.trim().to_string();
        if key.is_empty() {
            return None;
        }

        let (lock, cvar) = &*self.shared;
        let mut state = lock.lock().unwrap();
        state.guide.ensure_key(&key, "guide");

        loop {
            if let Some(snapshot) = state.guide.value.clone() {
                let stale = snapshot.fetched_at.elapsed() >= self.guide_interval;
                if !stale || state.guide.refreshing {
                    return Some(snapshot);
                }
                state.guide.refreshing = true;
                drop(state);
                self.spawn_guide_refresh(key);
                return Some(snapshot);
            }

            if state.guide.refreshing {
                state = cvar.wait(state).unwrap();
                if state.guide.refreshing || state.guide.value.is_some() {
                    continue;
                }
                if state.guide.failed && state.guide.key == key {
                    return None;
                }
                // the finished fetch was for a superseded url; fetch ours
                continue;
            }

            state.guide.refreshing = true;
            drop(state);
            let result = self.fetcher.fetch_guide(&key);

            let mut state = lock.lock().unwrap();
            state.guide.refreshing = false;
            let out = match result {
                Some(index) => {
                    info!("guide refreshed: {} programmes", index.programme_count());
                    let snapshot = Arc::new(GuideSnapshot::new(index));
                    if state.guide.key == key {
                        state.guide.value = Some(snapshot.clone());
                        state.guide.failed = false;
                    }
                    Some(snapshot)
                }
                None => {
                    warn!("guide refresh failed");
                    if state.guide.key == key {
                        state.guide.failed = true;
                    }
                    None
                }
            };
            cvar.notify_all();
            return out;
        }
    }

    fn spawn_guide_refresh(&self, key: String) {
        let fetcher = self.fetcher.clone();
        let shared = self.shared.clone();
        thread::spawn(move || {
            let result = fetcher.fetch_guide(&key);
            let (lock, cvar) = &*shared;
            let mut state = lock.lock().unwrap();
            state.guide.refreshing = false;
            match result {
                Some(index) if state.guide.key == key => {
                    info!("guide refreshed in background: {} programmes", index.programme_count());
                    state.guide.value = Some(Arc::new(GuideSnapshot::new(index)));
                    state.guide.failed = false;
                }
                Some(_) => debug!("discarding guide refresh for a superseded key"),
                None => {
                    if state.guide.key == key {
                        state.guide.failed = true;
                    }
                    warn!("guide refresh failed, keeping previous snapshot");
                }
            }
            cvar.notify_all();
        });
    }

    /// Live programme for a channel's tvg-id, evaluated against "now".
    pub fn now_playing(&self, tvg_id: &str, guide: &GuideSnapshot) -> Option<ProgrammeEntry> {
        guide.index.now_playing(tvg_id, Utc::now().timestamp()).cloned()
    }

    /// Snapshot ages and counts for a health endpoint. Never blocks on a
    /// refresh.
    pub fn status(&self) -> CacheStatus {
        let (lock, _) = &*self.shared;
        let state = lock.lock().unwrap();
        let catalog = state.catalog.value.as_deref();
        let guide = state.guide.value.as_deref();
        CacheStatus {
            channel_count: catalog.map_or(0, |s| s.channels.len()),
            genre_count: catalog.map_or(0, |s| s.genres.len()),
            truncated: catalog.is_some_and(|s| s.truncated),
            catalog_age_secs: catalog.map(|s| s.fetched_at.elapsed().as_secs()),
            programme_count: guide.map_or(0, |s| s.index.programme_count()),
            guide_age_secs: guide.map(|s| s.fetched_at.elapsed().as_secs()),
        }
    }
}

fn snapshot_from(fetch: CatalogFetch, key: &str) -> CatalogSnapshot {
    CatalogSnapshot {
        channels: fetch.channels,
        genres: fetch.genres,
        source_key: key.to_string(),
        truncated: fetch.truncated,
        fetched_at: std::time::Instant::now(),
        fetched_unix: Utc::now().timestamp(),
    }
}
