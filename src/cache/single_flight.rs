//! Single-flight cache for the remote document
//!
//! `SingleFlightCache` keeps the last fetched document in memory, serves it
//! while it is younger than the TTL, and refreshes it when it is not. At most
//! one refresh runs at a time: concurrent callers share the outcome of the
//! refresh that is already in flight. When a refresh fails, any previous
//! content (in memory or on disk, regardless of age) is served instead.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::store::PersistentStore;
use crate::fetch::{NetworkError, RemoteFetcher};

/// Error returned to callers when no document can be produced at all
///
/// Cloneable because one refresh outcome is handed to every waiter.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The fetch failed and there is no earlier content to fall back to
    #[error("Document unavailable: {cause}")]
    Unavailable {
        /// The network failure that caused the miss
        #[source]
        cause: Arc<NetworkError>,
    },

    /// The refresh stopped before producing an outcome (the fetch panicked
    /// or the runtime shut down) and there is no earlier content
    #[error("Refresh did not complete: {0}")]
    Interrupted(String),
}

/// Source of the current time
///
/// Freshness is computed against this clock so tests can move time forward.
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A document together with the time it was obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Document body
    pub content: String,
    /// When the body was fetched (or the persisted file's mtime after a restart)
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether the entry is still within `ttl` at `now`
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.fetched_at < ttl,
            // A TTL too large for chrono never expires
            Err(_) => true,
        }
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<String, FetchError>>>;

/// The refresh currently running, tagged with the generation that started it
struct InFlight {
    generation: u64,
    refresh: SharedRefresh,
}

/// Mutable cache state, guarded by a single mutex
#[derive(Default)]
struct RefreshState {
    entry: Option<CacheEntry>,
    in_flight: Option<InFlight>,
    next_generation: u64,
}

/// Snapshot of the cache for reporting
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    /// URL the document is fetched from
    pub source_url: String,
    /// Where the document is persisted
    pub cache_path: PathBuf,
    /// When the current document was obtained
    pub fetched_at: Option<DateTime<Utc>>,
    /// Age of the current document in seconds
    pub age_seconds: Option<i64>,
    /// Freshness window in seconds
    pub ttl_seconds: u64,
    /// Whether a `get` right now would be served without a fetch
    pub is_fresh: bool,
    /// Whether a refresh is currently in flight
    pub refreshing: bool,
}

struct Inner {
    source_url: String,
    ttl: Duration,
    fetcher: Arc<dyn RemoteFetcher>,
    store: PersistentStore,
    clock: Arc<dyn Clock>,
    state: Mutex<RefreshState>,
    recovered: OnceCell<()>,
    scheduler_claimed: AtomicBool,
}

/// Caches one remote document with single-flight refreshes
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct SingleFlightCache {
    inner: Arc<Inner>,
}

impl fmt::Debug for SingleFlightCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlightCache")
            .field("source_url", &self.inner.source_url)
            .field("ttl", &self.inner.ttl)
            .field("store", &self.inner.store)
            .finish_non_exhaustive()
    }
}

impl SingleFlightCache {
    /// Creates a cache for `source_url` using the system clock
    ///
    /// # Arguments
    /// * `source_url` - The document to cache
    /// * `ttl` - How long a fetched document is served without refreshing
    /// * `fetcher` - Performs the network retrieval
    /// * `store` - Persists the document across restarts
    pub fn new(
        source_url: impl Into<String>,
        ttl: Duration,
        fetcher: Arc<dyn RemoteFetcher>,
        store: PersistentStore,
    ) -> Self {
        Self::with_clock(source_url, ttl, fetcher, store, Arc::new(SystemClock))
    }

    /// Creates a cache that reads the time from `clock`
    pub fn with_clock(
        source_url: impl Into<String>,
        ttl: Duration,
        fetcher: Arc<dyn RemoteFetcher>,
        store: PersistentStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source_url: source_url.into(),
                ttl,
                fetcher,
                store,
                clock,
                state: Mutex::new(RefreshState::default()),
                recovered: OnceCell::new(),
                scheduler_claimed: AtomicBool::new(false),
            }),
        }
    }

    /// URL of the cached document
    pub fn source_url(&self) -> &str {
        &self.inner.source_url
    }

    /// Freshness window
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Backing store
    pub fn store(&self) -> &PersistentStore {
        &self.inner.store
    }

    /// Records that a background scheduler is refreshing this cache
    ///
    /// Returns `false` if another scheduler already holds the claim.
    pub(crate) fn claim_scheduler(&self) -> bool {
        self.inner
            .scheduler_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Gives up the claim taken by [`claim_scheduler`](Self::claim_scheduler)
    pub(crate) fn release_scheduler(&self) {
        self.inner.scheduler_claimed.store(false, Ordering::Release);
    }

    /// Returns the current document
    ///
    /// # Behavior
    /// - On first use, adopts the persisted document and its mtime
    /// - If a refresh is running, waits for it and returns its outcome
    /// - If the cached document is fresh, returns it without network access
    /// - Otherwise starts a refresh; on failure falls back to any earlier content
    ///
    /// # Returns
    /// * `Ok(String)` - Fresh, cached, or stale fallback content
    /// * `Err(FetchError)` - The fetch failed and no earlier content exists
    pub async fn get(&self) -> Result<String, FetchError> {
        self.recover().await;

        let refresh = {
            let mut state = self.inner.lock_state();
            if let Some(in_flight) = &state.in_flight {
                debug!(generation = in_flight.generation, "Joining in-flight refresh");
                in_flight.refresh.clone()
            } else {
                let now = self.inner.clock.now();
                if let Some(entry) = state
                    .entry
                    .as_ref()
                    .filter(|entry| entry.is_fresh(now, self.inner.ttl))
                {
                    debug!(fetched_at = %entry.fetched_at, "Serving cached document");
                    return Ok(entry.content.clone());
                }
                self.begin_refresh(&mut state)
            }
        };

        refresh.await
    }

    /// Reports the cache state without touching the network
    pub async fn status(&self) -> CacheStatus {
        self.recover().await;

        let now = self.inner.clock.now();
        let state = self.inner.lock_state();
        let fetched_at = state.entry.as_ref().map(|entry| entry.fetched_at);

        CacheStatus {
            source_url: self.inner.source_url.clone(),
            cache_path: self.inner.store.path().to_path_buf(),
            fetched_at,
            age_seconds: fetched_at.map(|at| (now - at).num_seconds()),
            ttl_seconds: self.inner.ttl.as_secs(),
            is_fresh: state
                .entry
                .as_ref()
                .is_some_and(|entry| entry.is_fresh(now, self.inner.ttl)),
            refreshing: state.in_flight.is_some(),
        }
    }

    /// Seeds the in-memory entry from disk, once per instance
    async fn recover(&self) {
        self.inner
            .recovered
            .get_or_init(|| self.inner.load_persisted())
            .await;
    }

    /// Spawns a refresh and records it as in flight
    ///
    /// Must be called with the state lock held and no refresh in flight.
    fn begin_refresh(&self, state: &mut RefreshState) -> SharedRefresh {
        state.next_generation += 1;
        let generation = state.next_generation;

        // Detached from callers: runs to completion even if all of them are dropped.
        let task = tokio::spawn(run_refresh(Arc::clone(&self.inner), generation));
        let inner = Arc::clone(&self.inner);
        let refresh = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    inner.finish(generation);
                    inner
                        .fall_back(FetchError::Interrupted(join_error.to_string()))
                        .await
                }
            }
        }
        .boxed()
        .shared();

        state.in_flight = Some(InFlight {
            generation,
            refresh: refresh.clone(),
        });
        refresh
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn load_persisted(&self) {
        let has_entry = self.lock_state().entry.is_some();
        if has_entry {
            return;
        }

        let Some(content) = self.store.read().await else {
            debug!(path = %self.store.path().display(), "No persisted document");
            return;
        };
        let fetched_at = self
            .store
            .last_modified()
            .await
            .unwrap_or_else(|| DateTime::<Utc>::from(UNIX_EPOCH));

        let mut state = self.lock_state();
        if state.entry.is_none() {
            info!(
                path = %self.store.path().display(),
                %fetched_at,
                "Recovered persisted document"
            );
            state.entry = Some(CacheEntry {
                content,
                fetched_at,
            });
        }
    }

    /// Replaces the entry with freshly fetched content
    fn install(&self, content: String) {
        let now = self.clock.now();
        let mut state = self.lock_state();
        let fetched_at = match &state.entry {
            Some(previous) if previous.fetched_at > now => previous.fetched_at,
            _ => now,
        };
        state.entry = Some(CacheEntry {
            content,
            fetched_at,
        });
    }

    /// Earlier content of any age: memory first, then disk
    async fn fallback(&self) -> Option<String> {
        let cached = self
            .lock_state()
            .entry
            .as_ref()
            .map(|entry| entry.content.clone());
        match cached {
            Some(content) => Some(content),
            None => self.store.read().await,
        }
    }

    /// Earlier content if there is any, otherwise `error`
    async fn fall_back(&self, error: FetchError) -> Result<String, FetchError> {
        match self.fallback().await {
            Some(content) => {
                warn!(error = %error, "Serving stale document");
                Ok(content)
            }
            None => Err(error),
        }
    }

    /// Clears the in-flight handle if it still belongs to `generation`
    fn finish(&self, generation: u64) {
        let mut state = self.lock_state();
        if state
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.generation == generation)
        {
            state.in_flight = None;
        }
    }
}

async fn run_refresh(inner: Arc<Inner>, generation: u64) -> Result<String, FetchError> {
    info!(url = %inner.source_url, generation, "Refreshing document");

    let fetched = AssertUnwindSafe(inner.fetcher.fetch(&inner.source_url))
        .catch_unwind()
        .await;

    let outcome = match fetched {
        Ok(Ok(content)) => {
            inner.install(content.clone());
            match inner.store.write(&content).await {
                Ok(()) => info!(bytes = content.len(), "Document refreshed"),
                Err(e) => warn!(error = %e, "Document refreshed but not persisted"),
            }
            Ok(content)
        }
        Ok(Err(e)) => {
            warn!(url = %inner.source_url, error = %e, "Fetch failed");
            inner
                .fall_back(FetchError::Unavailable { cause: Arc::new(e) })
                .await
        }
        Err(payload) => {
            let reason = panic_reason(payload.as_ref());
            warn!(url = %inner.source_url, %reason, "Fetch panicked");
            inner
                .fall_back(FetchError::Interrupted(format!("fetch panicked: {}", reason)))
                .await
        }
    };

    inner.finish(generation);
    outcome
}

/// Text of a panic payload, if it carried one
fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
