//! Periodic, rate-limited, overlap-free dispatch of per-repository work.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::remote::{Installation, InstallationSource, RepositoryRef};

/// Repositories to check, grouped by the installation that grants access.
pub type RepositoryMap = Vec<(Installation, Vec<RepositoryRef>)>;

#[async_trait]
pub trait RepositorySource: Send + Sync {
    async fn repositories(&self) -> Result<RepositoryMap>;
}

/// Processes one repository. Errors are logged by the scheduler.
#[async_trait]
pub trait RepositoryHandler: Send + Sync {
    async fn process(&self, installation: Installation, repository: RepositoryRef) -> Result<()>;
}

/// Every repository of every installation of the app, fetched fresh for
/// each tick.
pub struct InstallationRepositories {
    source: Arc<dyn InstallationSource>,
}

impl InstallationRepositories {
    pub fn new(source: Arc<dyn InstallationSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl RepositorySource for InstallationRepositories {
    async fn repositories(&self) -> Result<RepositoryMap> {
        let mut map = Vec::new();
        for installation in self.source.list_installations().await? {
            let repos = self
                .source
                .list_installation_repositories(installation.id)
                .await?;
            map.push((installation, repos.iter().map(RepositoryRef::from).collect()));
        }
        Ok(map)
    }
}

/// Token bucket that starts empty and is refilled to `capacity` once per
/// `period`.
pub struct RateLimiter {
    capacity: u32,
    period: Duration,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(capacity: u32, period: Duration) -> Self {
        Self {
            capacity,
            period,
            state: Mutex::new(BucketState {
                tokens: 0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait for and take one token. Waiters are served in FIFO order.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        loop {
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.period {
                let periods = (elapsed.as_nanos() / self.period.as_nanos()) as u32;
                state.tokens = self.capacity;
                state.last_refill += self.period * periods;
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let next_refill = state.last_refill + self.period;
            tokio::time::sleep_until(next_refill).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Time between ticks. Zero runs only the initial tick.
    pub interval: Duration,
    /// `(requests, per)`: at most `requests` units of work start per `per`.
    pub rate: Option<(u32, Duration)>,
}

impl SchedulerConfig {
    pub fn new(interval: Duration, requests_per_interval: u32, rate_interval: Duration) -> Self {
        let rate = (requests_per_interval > 0 && !rate_interval.is_zero())
            .then_some((requests_per_interval, rate_interval));
        Self { interval, rate }
    }
}

pub struct Scheduler {
    inner: Arc<Inner>,
    started: AtomicBool,
    timer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    config: SchedulerConfig,
    source: Arc<dyn RepositorySource>,
    handler: Arc<dyn RepositoryHandler>,
    limiter: Option<Arc<RateLimiter>>,
    in_progress: AtomicBool,
    started_ticks: AtomicU64,
    completed_ticks: AtomicU64,
    completed_tx: watch::Sender<Option<u64>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        source: Arc<dyn RepositorySource>,
        handler: Arc<dyn RepositoryHandler>,
    ) -> Self {
        let limiter = config
            .rate
            .map(|(requests, per)| Arc::new(RateLimiter::new(requests, per)));
        let (completed_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                handler,
                limiter,
                in_progress: AtomicBool::new(false),
                started_ticks: AtomicU64::new(0),
                completed_ticks: AtomicU64::new(0),
                completed_tx,
            }),
            started: AtomicBool::new(false),
            timer: std::sync::Mutex::new(None),
        }
    }

    /// Fire tick 0 now and, with a non-zero interval, arm the repeating
    /// timer. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("scheduler already started");
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.tick().await;
        });

        let interval = self.inner.config.interval;
        if interval.is_zero() {
            info!("No check interval configured, running a single check");
            return Ok(());
        }

        info!("Checking repositories every {:?}", interval);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let inner = inner.clone();
                tokio::spawn(async move {
                    inner.tick().await;
                });
            }
        });
        if let Ok(mut timer) = self.timer.lock() {
            *timer = Some(handle);
        }
        Ok(())
    }

    /// Cancel the timer. Work already started runs to completion.
    pub fn stop(&self) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
                info!("Scheduler stopped");
            }
        }
    }

    /// Run one tick now unless one is in progress. Returns the tick id, or
    /// `None` if it was skipped.
    pub async fn tick(&self) -> Option<u64> {
        self.inner.tick().await
    }

    /// Receives the id of each completed tick.
    pub fn subscribe(&self) -> watch::Receiver<Option<u64>> {
        self.inner.completed_tx.subscribe()
    }

    pub fn completed_ticks(&self) -> u64 {
        self.inner.completed_ticks.load(Ordering::SeqCst)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    async fn tick(&self) -> Option<u64> {
        if self.started_ticks.load(Ordering::SeqCst) != self.completed_ticks.load(Ordering::SeqCst)
            || self
                .in_progress
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            debug!("Previous tick still running, skipping");
            return None;
        }

        let id = self.started_ticks.fetch_add(1, Ordering::SeqCst);
        info!("Starting tick {}", id);
        self.run(id).await;

        self.completed_ticks.store(id + 1, Ordering::SeqCst);
        self.in_progress.store(false, Ordering::SeqCst);
        self.completed_tx.send_replace(Some(id));
        info!("Completed tick {}", id);
        Some(id)
    }

    async fn run(&self, id: u64) {
        let map = match self.source.repositories().await {
            Ok(map) => map,
            Err(e) => {
                error!("Tick {}: failed to list repositories: {:#}", id, e);
                return;
            }
        };

        let mut units = JoinSet::new();
        for (installation, repositories) in map {
            for repository in repositories {
                if let Some(limiter) = &self.limiter {
                    limiter.acquire().await;
                }
                let handler = self.handler.clone();
                let installation = installation.clone();
                units.spawn(async move {
                    let name = repository.full_name();
                    let result = handler.process(installation, repository).await;
                    (name, result)
                });
            }
        }

        while let Some(joined) = units.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => warn!("Tick {}: processing {} failed: {:#}", id, name, e),
                Err(e) => error!("Tick {}: repository task panicked: {}", id, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct StaticSource(RepositoryMap);

    #[async_trait]
    impl RepositorySource for StaticSource {
        async fn repositories(&self) -> Result<RepositoryMap> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        calls: StdMutex<Vec<(String, Instant)>>,
        work: Duration,
        running: AtomicU64,
        max_running: AtomicU64,
    }

    #[async_trait]
    impl RepositoryHandler for RecordingHandler {
        async fn process(&self, _installation: Installation, repository: RepositoryRef) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((repository.full_name(), Instant::now()));
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if repository.name == "broken" {
                bail!("broken repository");
            }
            Ok(())
        }
    }

    fn installation(id: u64) -> Installation {
        Installation {
            id,
            account: crate::remote::Account {
                login: format!("owner{}", id),
            },
        }
    }

    fn repos(owner: &str, names: &[&str]) -> Vec<RepositoryRef> {
        names
            .iter()
            .map(|name| RepositoryRef {
                owner: owner.to_string(),
                name: name.to_string(),
                clone_url: format!("https://example.org/{}/{}.git", owner, name),
            })
            .collect()
    }

    fn scheduler(config: SchedulerConfig, map: RepositoryMap, handler: Arc<RecordingHandler>) -> Scheduler {
        Scheduler::new(config, Arc::new(StaticSource(map)), handler)
    }

    async fn wait_for_tick(rx: &mut watch::Receiver<Option<u64>>, id: u64) {
        loop {
            let done = *rx.borrow_and_update();
            if done.is_some_and(|done| done >= id) {
                return;
            }
            rx.changed().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_tick_processes_every_repository_once() {
        let handler = Arc::new(RecordingHandler::default());
        let map = vec![
            (installation(1), repos("a", &["one", "two"])),
            (installation(2), repos("b", &["three", "broken"])),
        ];
        let s = scheduler(SchedulerConfig::new(Duration::ZERO, 0, Duration::from_secs(1)), map, handler.clone());
        let mut rx = s.subscribe();

        s.start().unwrap();
        wait_for_tick(&mut rx, 0).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        let mut names: Vec<String> = handler.calls.lock().unwrap().iter().map(|(n, _)| n.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["a/one", "a/two", "b/broken", "b/three"]);
        assert_eq!(s.completed_ticks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_spreads_work() {
        let handler = Arc::new(RecordingHandler::default());
        let map = vec![(installation(1), repos("a", &["r1", "r2", "r3", "r4"]))];
        let config = SchedulerConfig::new(Duration::ZERO, 1, Duration::from_secs(1));
        let s = scheduler(config, map, handler.clone());

        let start = Instant::now();
        assert_eq!(s.tick().await, Some(0));

        assert!(start.elapsed() >= Duration::from_secs(4));
        let calls = handler.calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        for pair in calls.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_allows_bursts_per_interval() {
        let handler = Arc::new(RecordingHandler::default());
        let map = vec![(installation(1), repos("a", &["r1", "r2", "r3", "r4"]))];
        let config = SchedulerConfig::new(Duration::ZERO, 2, Duration::from_secs(10));
        let s = scheduler(config, map, handler.clone());

        let start = Instant::now();
        s.tick().await;

        // 4 repositories at 2 per 10s take at least (4 / 2) * 10s.
        assert!(start.elapsed() >= Duration::from_secs(20));
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_ticks_do_not_overlap() {
        let handler = Arc::new(RecordingHandler {
            work: Duration::from_secs(25),
            ..Default::default()
        });
        let map = vec![(installation(1), repos("a", &["slow"]))];
        let s = scheduler(SchedulerConfig::new(Duration::from_secs(10), 0, Duration::from_secs(1)), map, handler.clone());

        s.start().unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        s.stop();

        let calls = handler.calls.lock().unwrap().len();
        // Tick 0 runs 0..25, the next one starts at 30, the one after at 60.
        assert_eq!(calls, 3);
        assert_eq!(handler.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timer() {
        let handler = Arc::new(RecordingHandler::default());
        let map = vec![(installation(1), repos("a", &["r"]))];
        let s = scheduler(SchedulerConfig::new(Duration::from_secs(5), 0, Duration::from_secs(1)), map, handler.clone());

        s.start().unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        s.stop();
        let before = handler.calls.lock().unwrap().len();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(before, 3);
        assert_eq!(handler.calls.lock().unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let handler = Arc::new(RecordingHandler::default());
        let s = scheduler(SchedulerConfig::new(Duration::ZERO, 0, Duration::from_secs(1)), Vec::new(), handler);
        s.start().unwrap();
        assert!(s.start().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_starts_empty() {
        let limiter = RateLimiter::new(3, Duration::from_secs(2));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }
}
