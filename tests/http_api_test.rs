use crawlhub::client::{CoordinatorApi, HttpCoordinatorClient};
use crawlhub::config::CrawlConfig;
use crawlhub::coordinator::Coordinator;
use crawlhub::executor::{Executor, ExecutorFailure};
use crawlhub::job::{CatalogEntry, JobDescriptor};
use crawlhub::protocol::{HeartbeatResponse, LeaseResponse, SubmitRequest, SubmitResponse};
use crawlhub::server::serve;
use crawlhub::shutdown::Shutdown;
use crawlhub::worker::{WorkerSettings, run_pool};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

struct TestServer {
    client: HttpCoordinatorClient,
    coordinator: Coordinator,
    shutdown: Arc<Shutdown>,
    handle: JoinHandle<Result<(), crawlhub::CrawlError>>,
    _state_dir: TempDir,
}

impl TestServer {
    async fn start(catalog: Vec<CatalogEntry>) -> Self {
        let state_dir = TempDir::new().unwrap();
        let config = CrawlConfig {
            state_dir: state_dir.path().to_path_buf(),
            max_attempts: 2,
            ..CrawlConfig::default()
        };
        let coordinator = Coordinator::start(config, catalog).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Shutdown::new());
        let handle = tokio::spawn(serve(listener, coordinator.clone(), shutdown.clone()));
        let client = HttpCoordinatorClient::new(&format!("http://{}", addr), Duration::from_secs(5)).unwrap();
        Self {
            client,
            coordinator,
            shutdown,
            handle,
            _state_dir: state_dir,
        }
    }

    async fn stop(self) {
        self.shutdown.trigger();
        self.handle.await.unwrap().unwrap();
    }
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

struct UppercaseExecutor;

impl Executor for UppercaseExecutor {
    async fn execute(&self, job: &JobDescriptor) -> Result<Map<String, Value>, ExecutorFailure> {
        Ok(fields(json!({"name": job.entity_key.to_uppercase(), "keyword": job.keyword})))
    }
}

#[tokio::test]
async fn test_lease_heartbeat_submit_over_http() {
    let server = TestServer::start(vec![CatalogEntry::new("acme").with_keyword("dentist")]).await;
    let client = &server.client;

    assert_eq!(client.health().await.unwrap().status, "ok");

    let LeaseResponse::Granted { job } = client.request_lease("w1").await.unwrap() else {
        panic!("expected a lease");
    };
    assert_eq!(job.job.job_id, "acme::dentist");
    assert_eq!(job.job.keyword.as_deref(), Some("dentist"));
    assert_eq!(client.request_lease("w2").await.unwrap(), LeaseResponse::NoWork);

    let beat = client.heartbeat(&job.job.job_id, "w1").await.unwrap();
    assert!(matches!(beat, HeartbeatResponse::Extended { lease_expires_at } if lease_expires_at >= job.lease_expires_at));
    let stolen = client.heartbeat(&job.job.job_id, "w2").await.unwrap();
    assert!(matches!(stolen, HeartbeatResponse::Rejected { .. }));

    let wrong_worker = client
        .submit_result(SubmitRequest::success(&job.job.job_id, "w2", fields(json!({"name": "x"}))))
        .await
        .unwrap();
    assert!(matches!(wrong_worker, SubmitResponse::Rejected { .. }));

    let accepted = client
        .submit_result(SubmitRequest::success(&job.job.job_id, "w1", fields(json!({"name": "Acme"}))))
        .await
        .unwrap();
    assert_eq!(accepted, SubmitResponse::Accepted);
    assert_eq!(client.request_lease("w2").await.unwrap(), LeaseResponse::Complete);

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.done, 1);
    assert_eq!(stats.total, 1);
    assert!((stats.completion_rate - 1.0).abs() < f64::EPSILON);

    let rows = client.export().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["entity_key"], json!("acme"));
    assert_eq!(rows[0]["fields"]["name"], json!("Acme"));

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_requests_get_400() {
    let server = TestServer::start(vec![CatalogEntry::new("acme")]).await;
    let http = reqwest::Client::new();
    let base = server.client.base_url().to_string();

    let response = http
        .post(format!("{}/lease", base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error_code"], json!("INVALID_REQUEST_BODY"));
    assert!(body["error_message"].is_string());

    let response = http
        .post(format!("{}/lease", base))
        .json(&json!({"worker_id": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let response = http
        .post(format!("{}/result", base))
        .json(&json!({"job_id": "acme", "worker_id": "w1", "status": "maybe"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    // nothing was leased by the bad requests
    assert_eq!(server.coordinator.get_stats().leased, 0);
    server.stop().await;
}

#[tokio::test]
async fn test_worker_pool_over_http() {
    let catalog: Vec<CatalogEntry> = (0..12)
        .map(|i| CatalogEntry::new(format!("e{}", i % 6)).with_keyword(format!("k{}", i / 6)))
        .collect();
    let server = TestServer::start(catalog).await;

    let settings = WorkerSettings {
        executor_timeout: Duration::from_secs(5),
        poll_backoff_min: Duration::from_millis(5),
        poll_backoff_max: Duration::from_millis(50),
    };
    let summaries = run_pool(
        Arc::new(server.client.clone()),
        Arc::new(UppercaseExecutor),
        settings,
        3,
        "http-test",
        Arc::new(Shutdown::new()),
    )
    .await;

    assert_eq!(summaries.len(), 3);
    assert_eq!(summaries.iter().map(|s| s.completed).sum::<usize>(), 12);
    assert_eq!(summaries.iter().map(|s| s.rejected).sum::<usize>(), 0);

    let stats = server.client.stats().await.unwrap();
    assert_eq!(stats.done, 12);
    assert_eq!(stats.entities, 6);
    for entity in server.coordinator.export().await {
        assert_eq!(entity.source_job_ids.len(), 2);
    }
    server.stop().await;
}
