use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// Counts calls and the peak number of overlapping fetches.
#[derive(Clone, Default)]
struct RecordingFetcher {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
    delay: Duration,
    fail_marker: Option<&'static str>,
    panic_marker: Option<&'static str>,
    enqueue_during_fetch: Option<(Arc<RequestStore>, DownloadRequest)>,
}

impl Fetcher for RecordingFetcher {
    async fn fetch(
        &self,
        request: DownloadRequest,
        cancel: CancellationToken,
    ) -> Result<(), FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if let Some((store, extra)) = &self.enqueue_during_fetch {
            store.append_unique(extra.clone()).await.unwrap();
        }
        if self
            .panic_marker
            .is_some_and(|marker| request.source_url.contains(marker))
        {
            panic!("fetcher blew up");
        }
        if self
            .fail_marker
            .is_some_and(|marker| request.source_url.contains(marker))
        {
            return Err(FetchError::RangesUnsupported {
                url: request.source_url,
            });
        }
        Ok(())
    }
}

fn request(n: usize) -> DownloadRequest {
    DownloadRequest::new(
        format!("https://files.example/{n}"),
        format!("/mirror/file-{n}.bin"),
    )
}

fn make_store(dir: &TempDir) -> Arc<RequestStore> {
    Arc::new(RequestStore::new(dir.path().join(".requests")))
}

async fn seed(store: &RequestStore, count: usize) {
    for n in 0..count {
        store.append(request(n)).await.unwrap();
    }
}

#[tokio::test]
async fn enqueue_rejects_empty_source() {
    let dir = tempdir().unwrap();
    let engine = DownloadEngine::with_fetcher(make_store(&dir), RecordingFetcher::default(), 3);

    let err = engine.enqueue("   ", "/mirror/a").await.unwrap_err();

    assert!(matches!(err, EngineError::EmptySource));
    assert!(engine.pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn enqueue_rejects_empty_destination() {
    let dir = tempdir().unwrap();
    let engine = DownloadEngine::with_fetcher(make_store(&dir), RecordingFetcher::default(), 3);

    let err = engine
        .enqueue("https://files.example/a", "")
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::EmptyDestination));
}

#[tokio::test]
async fn enqueue_is_idempotent_per_request() {
    let dir = tempdir().unwrap();
    let engine = DownloadEngine::with_fetcher(make_store(&dir), RecordingFetcher::default(), 3);

    assert!(engine.enqueue("https://files.example/a", "/mirror/a").await.unwrap());
    assert!(!engine.enqueue("https://files.example/a", "/mirror/a").await.unwrap());
    assert!(engine.enqueue("https://files.example/a", "/mirror/b").await.unwrap());

    assert_eq!(engine.pending().await.unwrap().len(), 2);
}

#[tokio::test]
async fn enqueue_surfaces_store_errors() {
    let dir = tempdir().unwrap();
    let store = make_store(&dir);
    std::fs::write(store.path(), b"not json").unwrap();
    let engine = DownloadEngine::with_fetcher(store, RecordingFetcher::default(), 3);

    let err = engine
        .enqueue("https://files.example/a", "/mirror/a")
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Store(ref e) if e.is_persistence()));
}

#[tokio::test]
async fn empty_store_is_a_no_op_cycle() {
    let dir = tempdir().unwrap();
    let fetcher = RecordingFetcher::default();
    let engine = DownloadEngine::with_fetcher(make_store(&dir), fetcher.clone(), 3);

    let report = engine.run_cycle().await.unwrap();

    assert_eq!(report, CycleReport::default());
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn never_runs_more_than_max_concurrent_fetches() {
    let dir = tempdir().unwrap();
    let store = make_store(&dir);
    seed(&store, 10).await;
    let fetcher = RecordingFetcher {
        delay: Duration::from_millis(30),
        ..Default::default()
    };
    let engine = DownloadEngine::with_fetcher(Arc::clone(&store), fetcher.clone(), 3);

    let report = engine.run_cycle().await.unwrap();

    assert_eq!(
        report,
        CycleReport {
            attempted: 10,
            completed: 10
        }
    );
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 10);
    let peak = fetcher.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency was {peak}");
    assert!(peak >= 2, "fetches never overlapped");
    assert!(store.snapshot().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_request_stays_queued_while_others_complete() {
    let dir = tempdir().unwrap();
    let store = make_store(&dir);
    seed(&store, 3).await;
    let fetcher = RecordingFetcher {
        fail_marker: Some("/1"),
        ..Default::default()
    };
    let engine = DownloadEngine::with_fetcher(Arc::clone(&store), fetcher.clone(), 3);

    let err = engine.run_cycle().await.unwrap_err();

    let EngineError::Cycle {
        attempted,
        failures,
    } = err
    else {
        panic!("expected cycle error");
    };
    assert_eq!(attempted, 3);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].request, request(1));
    assert!(matches!(
        failures[0].error,
        EngineError::Fetch(ref e) if e.is_capability()
    ));
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    assert_eq!(store.snapshot().await.unwrap(), vec![request(1)]);
}

#[tokio::test]
async fn failed_request_is_retried_on_next_cycle() {
    let dir = tempdir().unwrap();
    let store = make_store(&dir);
    seed(&store, 2).await;
    let failing = RecordingFetcher {
        fail_marker: Some("/0"),
        ..Default::default()
    };
    let engine = DownloadEngine::with_fetcher(Arc::clone(&store), failing, 2);
    assert!(engine.run_cycle().await.is_err());
    assert_eq!(store.snapshot().await.unwrap(), vec![request(0)]);

    let healthy = RecordingFetcher::default();
    let engine = DownloadEngine::with_fetcher(Arc::clone(&store), healthy.clone(), 2);
    let report = engine.run_cycle().await.unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
    assert!(store.snapshot().await.unwrap().is_empty());
}

#[tokio::test]
async fn panicking_transfer_is_reported_and_isolated() {
    let dir = tempdir().unwrap();
    let store = make_store(&dir);
    seed(&store, 3).await;
    let fetcher = RecordingFetcher {
        panic_marker: Some("/2"),
        ..Default::default()
    };
    let engine = DownloadEngine::with_fetcher(Arc::clone(&store), fetcher, 3);

    let err = engine.run_cycle().await.unwrap_err();

    let EngineError::Cycle { failures, .. } = err else {
        panic!("expected cycle error");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].request, request(2));
    assert!(matches!(failures[0].error, EngineError::Task(_)));
    assert_eq!(store.snapshot().await.unwrap(), vec![request(2)]);
}

#[tokio::test]
async fn enqueue_during_cycle_is_preserved() {
    let dir = tempdir().unwrap();
    let store = make_store(&dir);
    seed(&store, 2).await;
    let fetcher = RecordingFetcher {
        enqueue_during_fetch: Some((Arc::clone(&store), request(50))),
        ..Default::default()
    };
    let engine = DownloadEngine::with_fetcher(Arc::clone(&store), fetcher.clone(), 2);

    let report = engine.run_cycle().await.unwrap();

    assert_eq!(report.attempted, 2);
    assert_eq!(store.snapshot().await.unwrap(), vec![request(50)]);
}

#[tokio::test]
async fn overlapping_cycles_do_not_repeat_transfers() {
    let dir = tempdir().unwrap();
    let store = make_store(&dir);
    seed(&store, 3).await;
    let fetcher = RecordingFetcher {
        delay: Duration::from_millis(20),
        ..Default::default()
    };
    let engine = DownloadEngine::with_fetcher(Arc::clone(&store), fetcher.clone(), 3);

    let (first, second) = tokio::join!(engine.run_cycle(), engine.run_cycle());

    let total = first.unwrap().attempted + second.unwrap().attempted;
    assert_eq!(total, 3);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn cancelled_transfers_stay_queued() {
    let dir = tempdir().unwrap();
    let store = make_store(&dir);
    seed(&store, 2).await;
    let fetcher = RecordingFetcher::default();
    let engine = DownloadEngine::with_fetcher(Arc::clone(&store), fetcher.clone(), 2);
    engine.cancel_all_transfers();

    let err = engine.run_cycle().await.unwrap_err();

    let EngineError::Cycle { failures, .. } = err else {
        panic!("expected cycle error");
    };
    assert!(
        failures
            .iter()
            .all(|f| matches!(f.error, EngineError::Fetch(FetchError::Cancelled)))
    );
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.snapshot().await.unwrap().len(), 2);
}

#[tokio::test]
async fn chunked_cycle_downloads_and_isolates_range_less_source() {
    let server = MockServer::start().await;
    for (route, body) in [("/one.bin", &b"first file"[..]), ("/three.bin", &b"third"[..])] {
        Mock::given(method("HEAD"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("accept-ranges", "bytes")
                    .insert_header("content-length", body.len().to_string().as_str())
                    .set_body_bytes(body.to_vec()),
            )
            .mount(&server)
            .await;
        let served = body.to_vec();
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(move |req: &Request| {
                let range = req.headers.get("range").unwrap().to_str().unwrap();
                let (start, end) = range
                    .trim_start_matches("bytes=")
                    .split_once('-')
                    .unwrap();
                let (start, end): (usize, usize) = (start.parse().unwrap(), end.parse().unwrap());
                ResponseTemplate::new(206).set_body_bytes(served[start..=end].to_vec())
            })
            .mount(&server)
            .await;
    }
    Mock::given(method("HEAD"))
        .and(path("/two.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-length", "3")
                .set_body_bytes(b"two".to_vec()),
        )
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let store = make_store(&dir);
    let engine = DownloadEngine::new(
        Arc::clone(&store),
        DEFAULT_MAX_CONCURRENT,
        NonZeroU64::new(4).unwrap(),
    );
    let out = dir.path().join("mirror");
    for name in ["one.bin", "two.bin", "three.bin"] {
        engine
            .enqueue(&format!("{}/{name}", server.uri()), out.join(name))
            .await
            .unwrap();
    }

    let err = engine.run_cycle().await.unwrap_err();

    let EngineError::Cycle { failures, .. } = err else {
        panic!("expected cycle error");
    };
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0].error,
        EngineError::Fetch(FetchError::RangesUnsupported { .. })
    ));
    assert_eq!(std::fs::read(out.join("one.bin")).unwrap(), b"first file");
    assert_eq!(std::fs::read(out.join("three.bin")).unwrap(), b"third");
    assert!(!out.join("two.bin").exists());

    let remaining = store.snapshot().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].destination, out.join("two.bin"));

    let gets_for_two = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "GET" && r.url.path() == "/two.bin")
        .count();
    assert_eq!(gets_for_two, 0);
}
