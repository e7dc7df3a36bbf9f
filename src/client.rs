use crate::coordinator::Coordinator;
use crate::protocol::{
    HealthResponse, HeartbeatRequest, HeartbeatResponse, LeaseRequest, LeaseResponse, SubmitRequest, SubmitResponse,
};
use crate::state::Stats;
use crate::CrawlError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::future::Future;
use std::time::Duration;

/// The three calls a worker makes against the coordinator.
///
/// `Err` means the call did not get an answer (transport failure or timeout);
/// rejections come back as `Ok` responses.
pub trait CoordinatorApi: Send + Sync {
    fn request_lease(&self, worker_id: &str) -> impl Future<Output = Result<LeaseResponse, CrawlError>> + Send;

    fn submit_result(&self, request: SubmitRequest) -> impl Future<Output = Result<SubmitResponse, CrawlError>> + Send;

    fn heartbeat(&self, job_id: &str, worker_id: &str)
    -> impl Future<Output = Result<HeartbeatResponse, CrawlError>> + Send;
}

/// In-process calls, used when worker slots share a process with the coordinator.
impl CoordinatorApi for Coordinator {
    async fn request_lease(&self, worker_id: &str) -> Result<LeaseResponse, CrawlError> {
        Ok(Coordinator::request_lease(self, worker_id).await)
    }

    async fn submit_result(&self, request: SubmitRequest) -> Result<SubmitResponse, CrawlError> {
        Ok(Coordinator::submit_result(self, request).await)
    }

    async fn heartbeat(&self, job_id: &str, worker_id: &str) -> Result<HeartbeatResponse, CrawlError> {
        Ok(Coordinator::heartbeat(self, job_id, worker_id).await)
    }
}

/// Talks to a coordinator over HTTP. Every request carries the configured timeout.
#[derive(Debug, Clone)]
pub struct HttpCoordinatorClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpCoordinatorClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, CrawlError> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<HealthResponse, CrawlError> {
        self.get_json("/health").await
    }

    pub async fn stats(&self) -> Result<Stats, CrawlError> {
        self.get_json("/stats").await
    }

    /// Export rows as served by `GET /export`.
    pub async fn export(&self) -> Result<Vec<Map<String, Value>>, CrawlError> {
        self.get_json("/export").await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, CrawlError> {
        let response = self.http.get(format!("{}{}", self.base_url, path)).send().await?;
        decode(response).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, CrawlError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, CrawlError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(CrawlError::Transport(format!("coordinator returned {}: {}", status, body)));
    }
    Ok(response.json::<T>().await?)
}

impl CoordinatorApi for HttpCoordinatorClient {
    async fn request_lease(&self, worker_id: &str) -> Result<LeaseResponse, CrawlError> {
        self.post_json(
            "/lease",
            &LeaseRequest {
                worker_id: worker_id.to_string(),
            },
        )
        .await
    }

    async fn submit_result(&self, request: SubmitRequest) -> Result<SubmitResponse, CrawlError> {
        self.post_json("/result", &request).await
    }

    async fn heartbeat(&self, job_id: &str, worker_id: &str) -> Result<HeartbeatResponse, CrawlError> {
        self.post_json(
            "/heartbeat",
            &HeartbeatRequest {
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            },
        )
        .await
    }
}
