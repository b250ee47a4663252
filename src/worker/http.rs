use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;

use crate::error::ScanError;
use crate::registry::WorkerVitals;
use crate::worker::{BuildRequest, WorkerClient, WorkerClientFactory, WorkerStatusReport};

#[derive(Deserialize)]
struct CleanResponse {
    done: bool,
}

/// HTTP+JSON client for one worker.
///
/// Endpoints, relative to the worker URL: `GET /status`, `POST /abort`,
/// `POST /build`, `POST /clean`, `GET /files/{identity}`.
#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    worker: String,
    base_url: String,
    http: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new(
        worker: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ScanError> {
        let worker = worker.into();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ScanError::WorkerProtocol {
                worker: worker.clone(),
                reason: format!("cannot build HTTP client: {}", e),
            })?;
        Ok(Self {
            worker,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// URL of a worker file, with the identity percent-encoded as a single
    /// path segment.
    fn file_url(&self, identity: &str) -> Result<Url, ScanError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| self.protocol(format!("bad worker url {}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| self.protocol(format!("worker url {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .push("files")
            .push(identity);
        Ok(url)
    }

    fn unreachable(&self, e: reqwest::Error) -> ScanError {
        ScanError::WorkerUnreachable {
            worker: self.worker.clone(),
            reason: e.to_string(),
        }
    }

    fn protocol(&self, reason: impl Into<String>) -> ScanError {
        ScanError::WorkerProtocol {
            worker: self.worker.clone(),
            reason: reason.into(),
        }
    }

    fn expect_success(&self, op: &str, status: StatusCode) -> Result<(), ScanError> {
        if status.is_success() {
            Ok(())
        } else {
            Err(self.protocol(format!("{} returned {}", op, status)))
        }
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn status(&self) -> Result<WorkerStatusReport, ScanError> {
        let response = self
            .http
            .get(self.url("status"))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        self.expect_success("status", response.status())?;
        response
            .json::<WorkerStatusReport>()
            .await
            .map_err(|e| self.protocol(format!("undecodable status: {}", e)))
    }

    async fn abort(&self) -> Result<(), ScanError> {
        let response = self
            .http
            .post(self.url("abort"))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        // A worker that is already aborting or idle answers 409; that is fine.
        if response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        self.expect_success("abort", response.status())
    }

    async fn start_build(&self, request: &BuildRequest) -> Result<(), ScanError> {
        let response = self
            .http
            .post(self.url("build"))
            .json(request)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScanError::CannotBuild {
                worker: self.worker.clone(),
                reason: format!("{}: {}", status, body.trim()),
            });
        }
        self.expect_success("build", status)
    }

    async fn clean(&self) -> Result<bool, ScanError> {
        let response = self
            .http
            .post(self.url("clean"))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        self.expect_success("clean", response.status())?;
        let body: CleanResponse = response
            .json()
            .await
            .map_err(|e| self.protocol(format!("undecodable clean reply: {}", e)))?;
        Ok(body.done)
    }

    async fn fetch_file(&self, identity: &str) -> Result<Vec<u8>, ScanError> {
        let response = self
            .http
            .get(self.file_url(identity)?)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        self.expect_success("fetch", response.status())?;
        let bytes = response.bytes().await.map_err(|e| self.unreachable(e))?;
        Ok(bytes.to_vec())
    }
}

/// Creates an [`HttpWorkerClient`] from a worker's registered URL.
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl WorkerClientFactory for HttpClientFactory {
    fn client_for(&self, vitals: &WorkerVitals) -> Result<Arc<dyn WorkerClient>, ScanError> {
        let client = HttpWorkerClient::new(&vitals.name, &vitals.url, self.timeout)?;
        Ok(Arc::new(client))
    }
}
