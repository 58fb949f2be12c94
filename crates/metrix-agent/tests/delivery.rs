//! End-to-end delivery tests: agent components against a real collector
//! bound on a loopback port.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::post;
use async_trait::async_trait;
use metrix_agent::{MetricsClient, Reporter, SnapshotReporter, SnapshotSource, WorkerPool};
use metrix_core::{
    Envelope, EnvelopeConfig, MemoryStorage, Metric, MetricPayload, MetrixError, Repository,
    Retrier,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const CRYPTO_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

struct Collector {
    addr: String,
    repository: Repository,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<metrix_core::Result<()>>,
}

impl Collector {
    async fn start(envelope: Envelope) -> Self {
        let repository = Repository::new(Arc::new(MemoryStorage::new()), Duration::ZERO);
        let (listener, addr) = metrix_server::bind("127.0.0.1:0").await.unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(metrix_server::serve(
            listener,
            repository.clone(),
            envelope,
            shutdown.clone(),
        ));
        Self {
            addr: addr.to_string(),
            repository,
            shutdown,
            task,
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.task.await.unwrap().unwrap();
    }
}

fn fast_retrier() -> Retrier {
    Retrier::new(vec![Duration::from_millis(5); 3])
}

#[tokio::test]
async fn three_polls_deliver_poll_count_three() {
    let collector = Collector::start(Envelope::plain()).await;

    let source = Arc::new(SnapshotSource::new(Duration::from_secs(2)));
    for _ in 0..3 {
        source.poll_once();
    }
    let client = MetricsClient::new(&collector.addr, Envelope::plain(), fast_retrier()).unwrap();
    let reporter = SnapshotReporter::new(Arc::clone(&source), client);
    reporter.report().await.unwrap();

    assert_eq!(collector.repository.get_counter("PollCount").await.unwrap(), 3);
    let random = collector.repository.get_gauge("RandomValue").await.unwrap();
    assert!((0.0..1.0).contains(&random));

    collector.stop().await;
}

/// Records the `PollCount` of every snapshot it is asked to report.
struct PollCountRecorder {
    source: Arc<SnapshotSource>,
    seen: Mutex<Vec<i64>>,
}

#[async_trait]
impl Reporter for PollCountRecorder {
    async fn report(&self) -> metrix_core::Result<()> {
        let count = self
            .source
            .get_snapshot()
            .iter()
            .find(|m| m.id == "PollCount")
            .and_then(Metric::counter_value)
            .unwrap_or(0);
        self.seen.lock().unwrap().push(count);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_scheduled_report_carries_three_samples() {
    let source = Arc::new(SnapshotSource::new(Duration::from_millis(10)));
    let recorder = Arc::new(PollCountRecorder {
        source: Arc::clone(&source),
        seen: Mutex::new(Vec::new()),
    });
    let pool = WorkerPool::new(1, Duration::from_millis(35), 0, recorder.clone());

    let shutdown = CancellationToken::new();
    let mut tasks = source.spawn(shutdown.clone());
    tasks.extend(pool.spawn(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();
    for t in tasks {
        t.await.unwrap();
    }

    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(seen.first(), Some(&3), "reports saw {seen:?}");
}

#[tokio::test]
async fn signed_and_encrypted_delivery_reaches_the_store() {
    let config = EnvelopeConfig {
        sign_key: Some("shared-secret".into()),
        crypto_key: Some(CRYPTO_KEY.into()),
    };
    let collector = Collector::start(Envelope::new(&config).unwrap()).await;
    let client =
        MetricsClient::new(&collector.addr, Envelope::new(&config).unwrap(), fast_retrier())
            .unwrap();

    let batch = [
        MetricPayload::from(&Metric::gauge("Alloc", 123.45)),
        MetricPayload::from(&Metric::counter("PollCount", 7)),
    ];
    client.send_batch(&batch).await.unwrap();
    client.send_batch(&batch[1..]).await.unwrap();

    assert_eq!(collector.repository.get_gauge("Alloc").await.unwrap(), 123.45);
    assert_eq!(collector.repository.get_counter("PollCount").await.unwrap(), 14);
    collector.stop().await;
}

#[tokio::test]
async fn wrong_key_is_rejected_without_retry() {
    let collector = Collector::start(
        Envelope::new(&EnvelopeConfig {
            sign_key: Some("server".into()),
            crypto_key: None,
        })
        .unwrap(),
    )
    .await;
    let client = MetricsClient::new(
        &collector.addr,
        Envelope::new(&EnvelopeConfig {
            sign_key: Some("agent".into()),
            crypto_key: None,
        })
        .unwrap(),
        fast_retrier(),
    )
    .unwrap();

    let err = client
        .send_batch(&[MetricPayload::from(&Metric::gauge("Alloc", 1.0))])
        .await
        .unwrap_err();
    assert!(matches!(err, MetrixError::Rejected { status: 400, .. }), "{err}");
    assert!(collector.repository.list_all().await.unwrap().is_empty());
    collector.stop().await;
}

/// Router that answers 500 for the first `failures` calls, then 200.
async fn flaky_endpoint(failures: usize, status: StatusCode) -> (String, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let app = Router::new().route(
        "/updates/",
        post(move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < failures {
                    status
                } else {
                    StatusCode::OK
                }
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move { axum::serve(listener, app).await });
    (addr, calls)
}

#[tokio::test]
async fn server_errors_are_retried_on_the_ladder() {
    let (addr, calls) = flaky_endpoint(2, StatusCode::INTERNAL_SERVER_ERROR).await;
    let client = MetricsClient::new(&addr, Envelope::plain(), fast_retrier()).unwrap();

    client
        .send_batch(&[MetricPayload::from(&Metric::counter("PollCount", 1))])
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn ladder_exhaustion_returns_last_error() {
    let (addr, calls) = flaky_endpoint(usize::MAX, StatusCode::SERVICE_UNAVAILABLE).await;
    let client = MetricsClient::new(&addr, Envelope::plain(), fast_retrier()).unwrap();

    let err = client
        .send_batch(&[MetricPayload::from(&Metric::counter("PollCount", 1))])
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let (addr, calls) = flaky_endpoint(usize::MAX, StatusCode::BAD_REQUEST).await;
    let client = MetricsClient::new(&addr, Envelope::plain(), fast_retrier()).unwrap();

    let err = client
        .send_batch(&[MetricPayload::from(&Metric::counter("PollCount", 1))])
        .await
        .unwrap_err();
    assert!(matches!(err, MetrixError::Rejected { status: 400, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn agent_runs_and_stops_on_shutdown() {
    let collector = Collector::start(Envelope::plain()).await;
    let config = metrix_core::AgentConfig {
        server_addr: collector.addr.clone(),
        poll_interval: Duration::from_millis(10),
        report_interval: Duration::from_millis(30),
        rate_limit: 1,
        workers: 2,
        retry_ladder: vec![Duration::from_millis(5)],
        ..Default::default()
    };
    let agent = metrix_agent::Agent::new(config).unwrap();
    let shutdown = CancellationToken::new();
    let running = tokio::spawn(agent.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();

    assert!(collector.repository.get_counter("PollCount").await.unwrap() > 0);
    collector.stop().await;
}
