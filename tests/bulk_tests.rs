use ogie::{
    extract_bulk, BulkOptions, BulkOutcome, BulkScheduler, ExtractOptions, OgieError,
    SchedulerSnapshot,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Scheduling limits loose enough that only the setting under test matters.
fn unthrottled() -> BulkOptions {
    BulkOptions::default()
        .with_concurrency(100)
        .with_concurrency_per_domain(100)
        .with_min_delay_per_domain(Duration::ZERO)
        .with_requests_per_minute(0)
}

fn urls(hosts: &[&str]) -> Vec<String> {
    hosts.iter().map(|s| format!("https://{s}")).collect()
}

/// Records in-flight counts (overall and per domain) and start times.
#[derive(Clone, Default)]
struct Probe {
    state: Arc<Mutex<ProbeState>>,
}

#[derive(Default)]
struct ProbeState {
    running: usize,
    max_running: usize,
    per_domain: HashMap<String, usize>,
    max_per_domain: HashMap<String, usize>,
    starts: Vec<(String, Duration)>,
}

impl Probe {
    async fn run(&self, url: String, origin: Instant, work: Duration) -> Result<String, OgieError> {
        let domain = ogie::registrable_domain(&url);
        {
            let mut state = self.state.lock().unwrap();
            state.running += 1;
            state.max_running = state.max_running.max(state.running);
            let count = state.per_domain.entry(domain.clone()).or_default();
            *count += 1;
            let current = *count;
            let max = state.max_per_domain.entry(domain.clone()).or_default();
            *max = (*max).max(current);
            state.starts.push((url.clone(), origin.elapsed()));
        }

        sleep(work).await;

        let mut state = self.state.lock().unwrap();
        state.running -= 1;
        *state.per_domain.entry(domain).or_default() -= 1;
        Ok(url)
    }

    fn start_of(&self, url: &str) -> Duration {
        let state = self.state.lock().unwrap();
        state
            .starts
            .iter()
            .find(|(u, _)| u == url)
            .map(|(_, at)| *at)
            .unwrap()
    }
}

#[tokio::test(start_paused = true)]
async fn test_results_keep_input_order() {
    let scheduler = BulkScheduler::new(unthrottled());
    let input = urls(&["a.com/1", "b.com/bad", "c.com/3", "a.com/4"]);

    let result = scheduler
        .run(input.clone(), |url| async move {
            if url.contains("bad") {
                Err(OgieError::http_status(url, 500))
            } else {
                sleep(Duration::from_millis(10)).await;
                Ok(url.len())
            }
        })
        .await;

    let returned: Vec<&str> = result.results.iter().map(|r| r.url.as_str()).collect();
    assert_eq!(returned, input.iter().map(String::as_str).collect::<Vec<_>>());
    assert!(result.results[0].outcome.is_success());
    assert_eq!(result.results[1].outcome.err().and_then(OgieError::status_code), Some(500));
    assert!(result.results[2].outcome.is_success());
    assert_eq!(result.results[3].domain, "a.com");

    assert_eq!(result.stats.total, 4);
    assert_eq!(result.stats.succeeded, 3);
    assert_eq!(result.stats.failed, 1);
    assert_eq!(result.stats.skipped, 0);
}

#[tokio::test(start_paused = true)]
async fn test_global_concurrency_limit() {
    let probe = Probe::default();
    let origin = Instant::now();
    let scheduler = BulkScheduler::new(unthrottled().with_concurrency(3));
    let input: Vec<String> = (0..10).map(|i| format!("https://site{i}.com/")).collect();

    let job_probe = probe.clone();
    let result = scheduler
        .run(input, move |url| {
            let probe = job_probe.clone();
            async move { probe.run(url, origin, Duration::from_millis(100)).await }
        })
        .await;

    assert_eq!(result.stats.succeeded, 10);
    assert_eq!(probe.state.lock().unwrap().max_running, 3);
}

#[tokio::test(start_paused = true)]
async fn test_per_domain_concurrency_limit() {
    let probe = Probe::default();
    let origin = Instant::now();
    let scheduler = BulkScheduler::new(unthrottled().with_concurrency(10).with_concurrency_per_domain(2));
    let mut input = Vec::new();
    for i in 0..6 {
        input.push(format!("https://www.a.com/{i}"));
        input.push(format!("https://cdn.b.com/{i}"));
    }

    let job_probe = probe.clone();
    let result = scheduler
        .run(input, move |url| {
            let probe = job_probe.clone();
            async move { probe.run(url, origin, Duration::from_millis(100)).await }
        })
        .await;

    assert_eq!(result.stats.succeeded, 12);
    let state = probe.state.lock().unwrap();
    assert_eq!(state.max_per_domain["a.com"], 2);
    assert_eq!(state.max_per_domain["b.com"], 2);
    assert_eq!(state.max_running, 4);
}

#[tokio::test(start_paused = true)]
async fn test_busy_domain_does_not_block_others() {
    let probe = Probe::default();
    let origin = Instant::now();
    let scheduler = BulkScheduler::new(unthrottled().with_concurrency(4).with_concurrency_per_domain(1));
    let input = urls(&["a.com/1", "a.com/2", "a.com/3", "a.com/4", "b.com/1"]);

    let job_probe = probe.clone();
    scheduler
        .run(input, move |url| {
            let probe = job_probe.clone();
            async move { probe.run(url, origin, Duration::from_secs(1)).await }
        })
        .await;

    assert_eq!(probe.start_of("https://b.com/1"), Duration::ZERO);
    assert!(probe.start_of("https://a.com/2") >= Duration::from_secs(1));
    assert!(probe.start_of("https://a.com/4") >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_min_delay_per_domain() {
    let probe = Probe::default();
    let origin = Instant::now();
    let scheduler = BulkScheduler::new(
        unthrottled().with_min_delay_per_domain(Duration::from_millis(500)),
    );
    let input = urls(&["a.com/1", "a.com/2", "a.com/3", "b.com/1"]);

    let job_probe = probe.clone();
    scheduler
        .run(input, move |url| {
            let probe = job_probe.clone();
            async move { probe.run(url, origin, Duration::ZERO).await }
        })
        .await;

    let first = probe.start_of("https://a.com/1");
    let second = probe.start_of("https://a.com/2");
    let third = probe.start_of("https://a.com/3");
    assert!(second - first >= Duration::from_millis(500));
    assert!(third - second >= Duration::from_millis(500));
    assert!(probe.start_of("https://b.com/1") < Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn test_requests_per_minute() {
    let probe = Probe::default();
    let origin = Instant::now();
    let scheduler = BulkScheduler::new(unthrottled().with_requests_per_minute(2));
    let input = urls(&["a.com", "b.com", "c.com", "d.com", "e.com"]);

    let job_probe = probe.clone();
    let result = scheduler
        .run(input, move |url| {
            let probe = job_probe.clone();
            async move { probe.run(url, origin, Duration::ZERO).await }
        })
        .await;

    // Two starts as a burst, then one every 30 seconds.
    assert_eq!(result.stats.succeeded, 5);
    assert_eq!(probe.start_of("https://a.com"), Duration::ZERO);
    assert!(probe.start_of("https://b.com") < Duration::from_secs(30));
    assert!(probe.start_of("https://c.com") >= Duration::from_secs(30));
    assert!(probe.start_of("https://d.com") >= Duration::from_secs(60));
    assert!(probe.start_of("https://e.com") >= Duration::from_secs(90));
    assert!(probe.start_of("https://e.com") < Duration::from_secs(120));
}

#[tokio::test(start_paused = true)]
async fn test_stop_on_first_error() {
    let scheduler = BulkScheduler::new(
        unthrottled()
            .with_concurrency(1)
            .with_continue_on_error(false),
    );
    let input = urls(&["a.com", "b.com/bad", "c.com", "d.com"]);

    let result = scheduler
        .run(input, |url| async move {
            sleep(Duration::from_millis(10)).await;
            if url.contains("bad") {
                Err(OgieError::fetch(url, "boom"))
            } else {
                Ok(())
            }
        })
        .await;

    assert!(result.results[0].outcome.is_success());
    assert!(result.results[1].outcome.err().is_some());
    assert_eq!(result.results[2].outcome, BulkOutcome::Skipped);
    assert_eq!(result.results[3].outcome, BulkOutcome::Skipped);
    assert_eq!(result.results[3].duration, Duration::ZERO);
    assert_eq!(result.stats.skipped, 2);
    assert_eq!(
        scheduler.snapshot(),
        SchedulerSnapshot {
            pending: 0,
            running: 0,
            done: 2
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_on_error_drains_running_work() {
    let scheduler = BulkScheduler::new(
        unthrottled()
            .with_concurrency(2)
            .with_continue_on_error(false),
    );
    let input = urls(&["slow.com", "bad.com", "late.com"]);

    let result = scheduler
        .run(input, |url| async move {
            if url.contains("bad") {
                return Err(OgieError::fetch(url, "boom"));
            }
            sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;

    assert!(result.results[0].outcome.is_success());
    assert!(result.results[1].outcome.err().is_some());
    assert_eq!(result.results[2].outcome, BulkOutcome::Skipped);
}

#[tokio::test(start_paused = true)]
async fn test_progress_is_monotonic() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let scheduler = BulkScheduler::new(unthrottled().with_concurrency(3).with_on_progress(move |p| {
        sink.lock().unwrap().push((p.completed, p.total));
    }));
    let input: Vec<String> = (0..7).map(|i| format!("https://site{i}.com/")).collect();

    scheduler
        .run(input, |url| async move {
            let delay = 10 * (url.len() as u64 % 3 + 1);
            sleep(Duration::from_millis(delay)).await;
            Ok(())
        })
        .await;

    let seen = seen.lock().unwrap();
    let expected: Vec<(usize, usize)> = (1..=7).map(|n| (n, 7)).collect();
    assert_eq!(*seen, expected);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_admission() {
    let token = CancellationToken::new();
    let scheduler = BulkScheduler::new(
        unthrottled()
            .with_concurrency(1)
            .with_cancellation(token.clone()),
    );
    let input = urls(&["a.com", "b.com", "c.com", "d.com", "e.com"]);

    let canceller = token.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(1500)).await;
        canceller.cancel();
    });

    let result = scheduler
        .run(input, |_url| async move {
            sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;

    assert!(result.results[0].outcome.is_success());
    assert!(result.results[1].outcome.is_success());
    for item in &result.results[2..] {
        assert_eq!(item.outcome, BulkOutcome::Skipped);
    }
    assert_eq!(result.stats.succeeded, 2);
    assert_eq!(result.stats.skipped, 3);
    assert_eq!(scheduler.snapshot().pending, 0);
    assert_eq!(scheduler.snapshot().running, 0);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_job_is_reported_as_failure() {
    let scheduler = BulkScheduler::new(unthrottled());
    let input = urls(&["a.com", "b.com"]);

    let result = scheduler
        .run(input, |url| async move {
            if url.contains("a.com") {
                panic!("job exploded");
            }
            Ok(())
        })
        .await;

    assert_eq!(result.results[0].outcome.err().map(OgieError::code), Some("FETCH_ERROR"));
    assert!(result.results[1].outcome.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_panicking_progress_callback_does_not_stop_run() {
    let calls = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&calls);
    let scheduler = BulkScheduler::new(unthrottled().with_concurrency(2).with_on_progress(move |_| {
        *counter.lock().unwrap() += 1;
        panic!("progress sink failed");
    }));
    let input = urls(&["a.com", "b.com", "c.com", "d.com"]);

    let result = scheduler
        .run(input, |_url| async {
            sleep(Duration::from_millis(5)).await;
            Ok(())
        })
        .await;

    assert_eq!(result.stats.succeeded, 4);
    assert_eq!(*calls.lock().unwrap(), 4);
    assert_eq!(
        scheduler.snapshot(),
        SchedulerSnapshot {
            pending: 0,
            running: 0,
            done: 4
        }
    );
}

/// A job future that panics when dropped after finishing, if asked to.
struct ExplodingJob {
    work: Pin<Box<dyn Future<Output = Result<(), OgieError>> + Send>>,
    explode: bool,
}

impl Future for ExplodingJob {
    type Output = Result<(), OgieError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.work.as_mut().poll(cx)
    }
}

impl Drop for ExplodingJob {
    fn drop(&mut self) {
        if self.explode {
            panic!("job future dropped");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_abnormally_ended_task_frees_its_domain_slot() {
    let scheduler = BulkScheduler::new(unthrottled().with_concurrency_per_domain(1));
    let input = urls(&["a.com/first", "a.com/second"]);

    let result = scheduler
        .run(input, |url| ExplodingJob {
            work: Box::pin(async { Ok::<_, OgieError>(()) }),
            explode: url.ends_with("first"),
        })
        .await;

    let first = &result.results[0];
    assert_eq!(first.outcome.err().map(OgieError::code), Some("FETCH_ERROR"));
    assert!(result.results[1].outcome.is_success());
    assert_eq!(result.stats.skipped, 0);
    assert_eq!(
        scheduler.snapshot(),
        SchedulerSnapshot {
            pending: 0,
            running: 0,
            done: 2
        }
    );
}

#[tokio::test]
async fn test_extract_bulk_against_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            b"<html><head><meta property=\"og:title\" content=\"Fine\"></head></html>".to_vec(),
            "text/html",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let options = BulkOptions::default()
        .with_min_delay_per_domain(Duration::from_millis(10))
        .with_extract_options(ExtractOptions::default().with_allow_private_urls(true));
    let input = vec![
        format!("{}/ok", server.uri()),
        format!("{}/missing", server.uri()),
        "ftp://example.com/file".to_string(),
    ];

    let result = extract_bulk(input, &options).await;

    let title = result.results[0]
        .outcome
        .ok()
        .and_then(|m| m.open_graph.title.clone());
    assert_eq!(title.as_deref(), Some("Fine"));
    assert_eq!(result.results[1].outcome.err().and_then(OgieError::status_code), Some(404));
    assert_eq!(result.results[2].outcome.err().map(OgieError::code), Some("INVALID_URL"));
    assert_eq!(result.stats.succeeded, 1);
    assert_eq!(result.stats.failed, 2);
}
