//! Background refresh of the cached document
//!
//! Keeps the cache warm without reader traffic by calling `get` on a fixed
//! interval. Failures are logged and the schedule carries on.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::SingleFlightCache;

/// Shortest interval the scheduler will tick at
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// A running periodic task and the channel that stops it
struct RunningTask {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Periodically refreshes a [`SingleFlightCache`]
///
/// Ticks go through the same `get` path as readers, so they share the
/// single-flight state: a tick that lands during a reader's refresh joins it.
pub struct RefreshScheduler {
    cache: SingleFlightCache,
    interval: Duration,
    running: Mutex<Option<RunningTask>>,
}

impl RefreshScheduler {
    /// Creates a stopped scheduler
    ///
    /// # Arguments
    /// * `cache` - The cache to keep warm
    /// * `interval` - Time between refreshes
    pub fn new(cache: SingleFlightCache, interval: Duration) -> Self {
        Self {
            cache,
            interval: interval.max(MIN_INTERVAL),
            running: Mutex::new(None),
        }
    }

    /// Time between refreshes
    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<RunningTask>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the periodic refresh task
    ///
    /// The first refresh happens one interval after starting. Calling this
    /// while the task is already running has no effect, and neither does
    /// starting a second scheduler on a clone of the same cache.
    ///
    /// # Returns
    /// * `true` if this call started the task
    /// * `false` if this or another scheduler is already running
    pub fn start(&self) -> bool {
        let mut running = self.lock_running();
        match running.as_ref() {
            Some(task) if !task.handle.is_finished() => {
                debug!("Refresh scheduler already running");
                return false;
            }
            // A finished task still holds the cache's claim
            Some(_) => {}
            None => {
                if !self.cache.claim_scheduler() {
                    warn!(url = %self.cache.source_url(), "Another refresh scheduler is already running for this cache");
                    return false;
                }
            }
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let cache = self.cache.clone();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the first tick (immediate)
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        refresh_once(&cache).await;
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        info!(interval_secs = period.as_secs_f64(), url = %self.cache.source_url(), "Refresh scheduler started");
        *running = Some(RunningTask {
            shutdown_tx,
            handle,
        });
        true
    }

    /// Runs a single scheduled refresh now
    ///
    /// # Returns
    /// * `true` if the cache produced content
    /// * `false` if the refresh failed (already logged)
    pub async fn tick(&self) -> bool {
        refresh_once(&self.cache).await
    }

    /// Whether the periodic task is active
    pub fn is_running(&self) -> bool {
        self.lock_running()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Stops the periodic task and waits for it to exit
    ///
    /// A refresh that is in progress finishes first. The scheduler can be
    /// started again afterwards.
    pub async fn stop(&self) {
        let task = self.lock_running().take();
        if let Some(task) = task {
            let _ = task.shutdown_tx.send(()).await;
            let _ = task.handle.await;
            self.cache.release_scheduler();
            info!("Refresh scheduler stopped");
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = running.take() {
            task.handle.abort();
            self.cache.release_scheduler();
        }
    }
}

/// One scheduled `get`; the result is only logged
async fn refresh_once(cache: &SingleFlightCache) -> bool {
    info!("Updating cache");
    match cache.get().await {
        Ok(content) => {
            debug!(bytes = content.len(), "Scheduled refresh done");
            true
        }
        Err(e) => {
            error!(error = %e, "Cache refresh failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PersistentStore;
    use crate::fetch::{NetworkError, RemoteFetcher};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct CountingFetcher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingFetcher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteFetcher for CountingFetcher {
        async fn fetch(&self, url: &str) -> Result<String, NetworkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(NetworkError::Status {
                    url: url.to_string(),
                    status: 500,
                })
            } else {
                Ok("<p>roster</p>".to_string())
            }
        }
    }

    /// Cache with a zero TTL so every tick reaches the fetcher
    fn create_cache(fetcher: Arc<CountingFetcher>) -> (SingleFlightCache, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = PersistentStore::with_path(temp_dir.path().join("cached.html"));
        let cache = SingleFlightCache::new("http://roster.example/", Duration::ZERO, fetcher, store);
        (cache, temp_dir)
    }

    fn create_scheduler(
        fetcher: Arc<CountingFetcher>,
        interval: Duration,
    ) -> (RefreshScheduler, TempDir) {
        let (cache, temp_dir) = create_cache(fetcher);
        (RefreshScheduler::new(cache, interval), temp_dir)
    }

    const INTERVAL: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let fetcher = CountingFetcher::new(false);
        let (scheduler, _temp_dir) = create_scheduler(fetcher, INTERVAL);

        assert!(scheduler.start());
        assert!(!scheduler.start());
        assert!(scheduler.is_running());

        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_can_restart_after_stop() {
        let fetcher = CountingFetcher::new(false);
        let (scheduler, _temp_dir) = create_scheduler(fetcher, INTERVAL);

        assert!(scheduler.start());
        scheduler.stop().await;
        assert!(scheduler.start());
        assert!(scheduler.is_running());
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_scheduler_on_same_cache_does_not_start() {
        let fetcher = CountingFetcher::new(false);
        let (cache, _temp_dir) = create_cache(fetcher.clone());
        let first = RefreshScheduler::new(cache.clone(), INTERVAL);
        let second = RefreshScheduler::new(cache, INTERVAL);

        assert!(first.start());
        assert!(!second.start());
        assert!(!second.is_running());

        tokio::time::sleep(INTERVAL * 3 + INTERVAL / 2).await;
        assert_eq!(fetcher.calls(), 3);

        first.stop().await;
        assert!(second.start());
        assert!(!first.start());
        second.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_scheduler_releases_cache() {
        let fetcher = CountingFetcher::new(false);
        let (cache, _temp_dir) = create_cache(fetcher);

        let first = RefreshScheduler::new(cache.clone(), INTERVAL);
        assert!(first.start());
        drop(first);

        let second = RefreshScheduler::new(cache, INTERVAL);
        assert!(second.start());
        second.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_refresh_waits_one_interval() {
        let fetcher = CountingFetcher::new(false);
        let (scheduler, _temp_dir) = create_scheduler(fetcher.clone(), INTERVAL);

        scheduler.start();
        tokio::time::sleep(INTERVAL - Duration::from_secs(1)).await;
        assert_eq!(fetcher.calls(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fetcher.calls(), 1);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_refresh_once_per_interval() {
        let fetcher = CountingFetcher::new(false);
        let (scheduler, _temp_dir) = create_scheduler(fetcher.clone(), INTERVAL);

        scheduler.start();
        tokio::time::sleep(INTERVAL * 3 + INTERVAL / 2).await;
        scheduler.stop().await;

        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_the_schedule() {
        let fetcher = CountingFetcher::new(true);
        let (scheduler, _temp_dir) = create_scheduler(fetcher.clone(), INTERVAL);

        scheduler.start();
        tokio::time::sleep(INTERVAL * 2 + INTERVAL / 2).await;

        assert!(scheduler.is_running());
        assert_eq!(fetcher.calls(), 2);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_refreshes() {
        let fetcher = CountingFetcher::new(false);
        let (scheduler, _temp_dir) = create_scheduler(fetcher.clone(), INTERVAL);

        scheduler.start();
        tokio::time::sleep(INTERVAL + INTERVAL / 2).await;
        scheduler.stop().await;
        assert_eq!(fetcher.calls(), 1);

        tokio::time::sleep(INTERVAL * 5).await;
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_tick_reports_outcome() {
        let ok_fetcher = CountingFetcher::new(false);
        let (ok_scheduler, _ok_dir) = create_scheduler(ok_fetcher.clone(), INTERVAL);
        assert!(ok_scheduler.tick().await);
        assert_eq!(ok_fetcher.calls(), 1);

        let failing_fetcher = CountingFetcher::new(true);
        let (failing_scheduler, _failing_dir) = create_scheduler(failing_fetcher.clone(), INTERVAL);
        assert!(!failing_scheduler.tick().await);
        assert!(!failing_scheduler.is_running());
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let fetcher = CountingFetcher::new(false);
        let (scheduler, _temp_dir) = create_scheduler(fetcher, Duration::ZERO);
        assert_eq!(scheduler.interval(), MIN_INTERVAL);
    }
}
