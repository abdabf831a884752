//! Thin HTTP client for a running `genforge serve`.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use genforge_common::{EnqueueResponse, JobId, JobRecord, JobRequest, KnowledgeEntry};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::server::api::HealingHistory;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn enqueue(&self, request: &JobRequest) -> Result<JobId> {
        let url = self.url("/api/jobs");
        let resp = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;
        let body: EnqueueResponse = decode(resp).await?;
        Ok(body.job_id)
    }

    /// `Ok(None)` when the server has no such job.
    pub async fn job(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let url = self.url(&format!("/api/jobs/{}", id));
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(resp).await.map(Some)
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let url = self.url(&format!("/api/jobs?limit={}", limit));
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        decode(resp).await
    }

    pub async fn cancel(&self, id: &JobId) -> Result<JobRecord> {
        let url = self.url(&format!("/api/jobs/{}/cancel", id));
        let resp = self
            .http
            .post(&url)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;
        decode(resp).await
    }

    pub async fn healing(&self, id: &JobId) -> Result<HealingHistory> {
        let url = self.url(&format!("/api/jobs/{}/healing", id));
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        decode(resp).await
    }

    pub async fn knowledge(&self) -> Result<Vec<KnowledgeEntry>> {
        let url = self.url("/api/knowledge");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        decode(resp).await
    }
}

/// Decode a success body, or turn the server's `{"error": ...}` into an error.
async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let message = resp
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|body| body.get("error").and_then(|e| e.as_str()).map(String::from))
            .unwrap_or_else(|| status.to_string());
        bail!("Server returned {}: {}", status.as_u16(), message);
    }
    resp.json::<T>()
        .await
        .context("Failed to decode server response")
}
