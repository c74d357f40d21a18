//! Bulk scheduling of many extractions under global and per-domain limits.
//!
//! A single dispatcher decides which URL starts next. It walks the pending
//! work in input order and starts the first URL whose domain has a free slot
//! and whose spacing delay has elapsed, provided the global concurrency limit
//! and the per-minute token bucket allow it. A busy domain therefore never
//! holds back URLs for other domains.

use crate::options::ExtractOptions;
use crate::utils::registrable_domain;
use crate::OgieError;
use futures::FutureExt;
use governor::clock::Clock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::num::NonZeroU32;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{Id as TaskId, JoinSet};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_CONCURRENCY_PER_DOMAIN: usize = 2;
pub const DEFAULT_MIN_DELAY_PER_DOMAIN: Duration = Duration::from_millis(100);
pub const DEFAULT_REQUESTS_PER_MINUTE: usize = 600;

pub type ProgressCallback = Arc<dyn Fn(BulkProgress) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkProgress {
    pub completed: usize,
    pub total: usize,
}

/// Options for [`crate::extract_bulk`] and [`BulkScheduler`].
#[derive(Clone)]
pub struct BulkOptions {
    pub concurrency: usize,
    pub concurrency_per_domain: usize,
    pub min_delay_per_domain: Duration,
    /// Starts allowed per minute, refilled evenly, with a burst of the same
    /// size; 0 disables the limit.
    pub requests_per_minute: usize,
    pub continue_on_error: bool,
    pub on_progress: Option<ProgressCallback>,
    /// Stops admission of new work when cancelled.
    pub cancellation: Option<CancellationToken>,
    /// Options applied to every extraction in the batch.
    pub extract: ExtractOptions,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            concurrency_per_domain: DEFAULT_CONCURRENCY_PER_DOMAIN,
            min_delay_per_domain: DEFAULT_MIN_DELAY_PER_DOMAIN,
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            continue_on_error: true,
            on_progress: None,
            cancellation: None,
            extract: ExtractOptions::default(),
        }
    }
}

impl fmt::Debug for BulkOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkOptions")
            .field("concurrency", &self.concurrency)
            .field("concurrency_per_domain", &self.concurrency_per_domain)
            .field("min_delay_per_domain", &self.min_delay_per_domain)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("continue_on_error", &self.continue_on_error)
            .field("on_progress", &self.on_progress.is_some())
            .field("extract", &self.extract)
            .finish()
    }
}

impl BulkOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_concurrency_per_domain(mut self, concurrency: usize) -> Self {
        self.concurrency_per_domain = concurrency;
        self
    }

    pub fn with_min_delay_per_domain(mut self, delay: Duration) -> Self {
        self.min_delay_per_domain = delay;
        self
    }

    pub fn with_requests_per_minute(mut self, requests: usize) -> Self {
        self.requests_per_minute = requests;
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_on_progress(mut self, callback: impl Fn(BulkProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_extract_options(mut self, extract: ExtractOptions) -> Self {
        self.extract = extract;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BulkOutcome<T> {
    Succeeded(T),
    Failed(OgieError),
    /// Never started: the batch was cancelled or halted by an earlier failure.
    Skipped,
}

impl<T> BulkOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, BulkOutcome::Succeeded(_))
    }

    pub fn ok(&self) -> Option<&T> {
        match self {
            BulkOutcome::Succeeded(value) => Some(value),
            _ => None,
        }
    }

    pub fn err(&self) -> Option<&OgieError> {
        match self {
            BulkOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BulkItem<T> {
    pub url: String,
    pub domain: String,
    pub outcome: BulkOutcome<T>,
    /// Time spent running the job; zero for skipped work.
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct BulkResult<T> {
    /// One entry per input URL, in input order.
    pub results: Vec<BulkItem<T>>,
    pub stats: BulkStats,
}

/// Live view of the scheduler's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub pending: usize,
    pub running: usize,
    pub done: usize,
}

#[derive(Default)]
struct Counters {
    pending: AtomicUsize,
    running: AtomicUsize,
    done: AtomicUsize,
}

struct PendingTask {
    index: usize,
    url: String,
}

#[derive(Default)]
struct DomainQueue {
    tasks: VecDeque<PendingTask>,
    in_flight: usize,
    next_start: Option<Instant>,
}

/// Governor clock backed by tokio time, which follows a paused test clock.
#[derive(Debug, Clone, Copy, Default)]
struct TokioClock;

impl Clock for TokioClock {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        Instant::now().into_std()
    }
}

type StartLimiter = RateLimiter<
    NotKeyed,
    InMemoryState,
    TokioClock,
    governor::middleware::NoOpMiddleware<std::time::Instant>,
>;

/// Token bucket over task starts, or `None` when `requests_per_minute` is 0.
fn start_limiter(requests_per_minute: usize) -> Option<StartLimiter> {
    let per_minute = NonZeroU32::new(u32::try_from(requests_per_minute).unwrap_or(u32::MAX))?;
    let quota = Quota::per_minute(per_minute).allow_burst(per_minute);
    Some(RateLimiter::direct_with_clock(quota, &TokioClock))
}

/// `None` when a start may happen now, which also consumes a token.
/// Otherwise the instant the next token becomes available.
fn take_start(limiter: Option<&StartLimiter>, now: Instant) -> Option<Instant> {
    let limiter = limiter?;
    match limiter.check() {
        Ok(()) => None,
        Err(not_until) => Some(now + not_until.wait_time_from(TokioClock.now())),
    }
}

type Finished<T> = (usize, Result<T, OgieError>, Duration);

/// Runs jobs for many URLs under global and per-domain limits.
pub struct BulkScheduler {
    options: BulkOptions,
    counters: Arc<Counters>,
}

impl BulkScheduler {
    pub fn new(options: BulkOptions) -> Self {
        Self {
            options,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            pending: self.counters.pending.load(Ordering::SeqCst),
            running: self.counters.running.load(Ordering::SeqCst),
            done: self.counters.done.load(Ordering::SeqCst),
        }
    }

    /// Runs `job` once per URL and collects every outcome in input order.
    ///
    /// A failing job never cancels others. With `continue_on_error` disabled,
    /// the first failure stops admission; jobs already running still finish.
    #[instrument(level = "debug", skip_all, fields(total = urls.len()))]
    pub async fn run<T, F, Fut>(&self, urls: Vec<String>, job: F) -> BulkResult<T>
    where
        T: Send + 'static,
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, OgieError>> + Send + 'static,
    {
        let started = Instant::now();
        let total = urls.len();
        let concurrency = self.options.concurrency.max(1);
        let per_domain = self.options.concurrency_per_domain.max(1);

        let mut results: Vec<BulkItem<T>> = Vec::with_capacity(total);
        let mut domains: HashMap<String, DomainQueue> = HashMap::new();
        for (index, url) in urls.into_iter().enumerate() {
            let domain = registrable_domain(&url);
            domains.entry(domain.clone()).or_default().tasks.push_back(PendingTask {
                index,
                url: url.clone(),
            });
            results.push(BulkItem {
                url,
                domain,
                outcome: BulkOutcome::Skipped,
                duration: Duration::ZERO,
            });
        }

        self.counters.pending.store(total, Ordering::SeqCst);
        self.counters.running.store(0, Ordering::SeqCst);
        self.counters.done.store(0, Ordering::SeqCst);

        let limiter = start_limiter(self.options.requests_per_minute);
        let mut running: JoinSet<Finished<T>> = JoinSet::new();
        let mut launched: HashMap<TaskId, (usize, Instant)> = HashMap::new();
        let mut completed = 0;
        let mut halted = false;
        let token = self.options.cancellation.clone();

        loop {
            if !halted && token.as_ref().is_some_and(CancellationToken::is_cancelled) {
                info!("Bulk run cancelled, no new work will start");
                halted = true;
            }
            if halted {
                self.drop_pending(&mut domains);
            }

            let pending_left = domains.values().any(|d| !d.tasks.is_empty());
            if !pending_left && running.is_empty() {
                break;
            }

            let now = Instant::now();
            let mut wake_at: Option<Instant> = None;

            if pending_left && running.len() < concurrency {
                let (next, earliest) = next_eligible(&domains, per_domain, now);
                wake_at = earliest;
                if let Some(domain) = next {
                    match take_start(limiter.as_ref(), now) {
                        Some(until) => wake_at = Some(until),
                        None => {
                            if let Some(queue) = domains.get_mut(&domain) {
                                if let Some(task) = queue.tasks.pop_front() {
                                    queue.in_flight += 1;
                                    queue.next_start = Some(now + self.options.min_delay_per_domain);
                                    let index = task.index;
                                    let id = self.launch(&mut running, &job, task, &domain);
                                    launched.insert(id, (index, now));
                                    continue;
                                }
                            }
                        }
                    }
                }
            }

            tokio::select! {
                joined = running.join_next_with_id(), if !running.is_empty() => {
                    let Some(joined) = joined else { continue };
                    let (index, outcome, duration) = match joined {
                        Ok((id, finished)) => {
                            launched.remove(&id);
                            finished
                        }
                        Err(e) => {
                            let Some((index, started_at)) = launched.remove(&e.id()) else {
                                warn!(error = %e, "Unknown bulk task ended");
                                continue;
                            };
                            let url = results[index].url.clone();
                            warn!(url = %url, error = %e, "Bulk task ended abnormally");
                            let reason = if e.is_panic() {
                                "extraction task panicked"
                            } else {
                                "extraction task aborted"
                            };
                            (index, Err(OgieError::fetch(url, reason)), started_at.elapsed())
                        }
                    };

                    let item = &mut results[index];
                    if let Some(queue) = domains.get_mut(&item.domain) {
                        queue.in_flight = queue.in_flight.saturating_sub(1);
                    }
                    self.counters.running.fetch_sub(1, Ordering::SeqCst);
                    self.counters.done.fetch_add(1, Ordering::SeqCst);

                    item.duration = duration;
                    item.outcome = match outcome {
                        Ok(value) => BulkOutcome::Succeeded(value),
                        Err(e) => {
                            e.log();
                            if !self.options.continue_on_error && !halted {
                                warn!(url = %item.url, "Stopping bulk run after first failure");
                                halted = true;
                            }
                            BulkOutcome::Failed(e)
                        }
                    };

                    completed += 1;
                    if let Some(callback) = &self.options.on_progress {
                        let progress = BulkProgress { completed, total };
                        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(progress))).is_err() {
                            warn!(completed, total, "Progress callback panicked");
                        }
                    }
                }
                _ = sleep_until(wake_at.unwrap_or(now)), if wake_at.is_some() => {}
                _ = cancelled(token.as_ref()), if !halted => {}
                else => break,
            }
        }

        let stats = BulkStats {
            total,
            succeeded: results.iter().filter(|r| r.outcome.is_success()).count(),
            failed: results.iter().filter(|r| r.outcome.err().is_some()).count(),
            skipped: results
                .iter()
                .filter(|r| matches!(r.outcome, BulkOutcome::Skipped))
                .count(),
            duration: started.elapsed(),
        };
        debug!(?stats, "Bulk run finished");

        BulkResult { results, stats }
    }

    fn launch<T, F, Fut>(
        &self,
        running: &mut JoinSet<Finished<T>>,
        job: &F,
        task: PendingTask,
        domain: &str,
    ) -> TaskId
    where
        T: Send + 'static,
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, OgieError>> + Send + 'static,
    {
        debug!(url = %task.url, domain = %domain, "Starting bulk task");
        self.counters.pending.fetch_sub(1, Ordering::SeqCst);
        self.counters.running.fetch_add(1, Ordering::SeqCst);

        let url = task.url.clone();
        let future = job(task.url);
        let index = task.index;
        running
            .spawn(async move {
                let started = Instant::now();
                let outcome = AssertUnwindSafe(future)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(OgieError::fetch(url, "extraction task panicked")));
                (index, outcome, started.elapsed())
            })
            .id()
    }

    fn drop_pending(&self, domains: &mut HashMap<String, DomainQueue>) {
        let dropped: usize = domains.values_mut().map(|d| std::mem::take(&mut d.tasks).len()).sum();
        if dropped > 0 {
            debug!(skipped = dropped, "Skipping work that has not started");
            self.counters.pending.fetch_sub(dropped, Ordering::SeqCst);
        }
    }
}

/// Picks the domain whose head task comes first in input order among those
/// that may start now. Also returns the earliest time a delayed domain opens.
fn next_eligible(
    domains: &HashMap<String, DomainQueue>,
    per_domain: usize,
    now: Instant,
) -> (Option<String>, Option<Instant>) {
    let mut best: Option<(usize, &String)> = None;
    let mut earliest: Option<Instant> = None;

    for (domain, queue) in domains {
        let Some(head) = queue.tasks.front() else {
            continue;
        };
        if queue.in_flight >= per_domain {
            continue;
        }
        if let Some(at) = queue.next_start.filter(|at| *at > now) {
            earliest = Some(earliest.map_or(at, |e| e.min(at)));
            continue;
        }
        if best.map_or(true, |(index, _)| head.index < index) {
            best = Some((head.index, domain));
        }
    }

    (best.map(|(_, domain)| domain.clone()), earliest)
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
