//! HTTP implementation of [`RemoteBackend`].
//!
//! Endpoints, relative to the configured base URL:
//!
//! | Operation      | Request                          |
//! |----------------|----------------------------------|
//! | list jobs      | `GET  /jobs?principal=<id>`      |
//! | create job     | `POST /jobs` (body carries `principal`) |
//! | update job     | `PATCH /jobs/<id>`               |
//!
//! Every response body is a job row (or a list of rows) in the camelCase
//! wire format of [`RemoteJob`].

use crate::config::SyncConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::sync::{RemoteBackend, RemoteJob, RemotePatch};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// reqwest-backed remote job store.
#[derive(Debug, Clone)]
pub struct HttpRemoteBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct CreateBody<'a> {
    principal: &'a str,
    #[serde(flatten)]
    job: &'a RemoteJob,
}

impl HttpRemoteBackend {
    /// Build a backend for `base_url` with a per-request timeout.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        if base_url.is_empty() {
            return Err(SchedulerError::Config("sync base_url is empty".to_owned()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SchedulerError::Remote(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    /// Build from the `[sync]` config section.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| SchedulerError::Config("sync.base_url is not set".to_owned()))?;
        Self::new(
            base_url,
            config.api_key.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {key}")),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| SchedulerError::Remote(format!("{what} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_http_error(what, status, &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| SchedulerError::Remote(format!("{what} returned malformed body: {e}")))
    }
}

/// Map a non-success HTTP status to a readable remote error.
fn map_http_error(what: &str, status: StatusCode, body: &str) -> SchedulerError {
    let message = extract_error_message(body);
    match status.as_u16() {
        401 | 403 => SchedulerError::Remote(format!("{what} unauthorized: {message}")),
        404 => SchedulerError::Remote(format!("{what} not found: {message}")),
        429 => SchedulerError::Remote(format!("{what} rate limited: {message}")),
        code => SchedulerError::Remote(format!("{what} HTTP {code}: {message}")),
    }
}

/// Pull `error` or `message` out of a JSON error body, else the raw text.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_string())
}

#[async_trait]
impl RemoteBackend for HttpRemoteBackend {
    async fn list_jobs(&self, principal: &str) -> Result<Vec<RemoteJob>> {
        let url = format!(
            "{}/jobs?principal={}",
            self.base_url,
            urlencoding::encode(principal)
        );
        self.send(self.client.get(&url), "list jobs").await
    }

    async fn create_job(&self, principal: &str, job: &RemoteJob) -> Result<RemoteJob> {
        let url = format!("{}/jobs", self.base_url);
        let body = CreateBody { principal, job };
        self.send(self.client.post(&url).json(&body), "create job")
            .await
    }

    async fn update_job(&self, id: &str, patch: &RemotePatch) -> Result<RemoteJob> {
        let url = format!("{}/jobs/{}", self.base_url, urlencoding::encode(id));
        self.send(self.client.patch(&url).json(patch), "update job")
            .await
    }
}
