//! Where an observer reads from: a pollable job source and a push source.
//!
//! Both come in a local flavour (the in-process store and channel) and a
//! remote one (the HTTP API and its websocket).

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use genforge_common::{JobId, JobRecord, ProgressEvent};
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::channel::ProgressChannel;
use crate::client::ApiClient;
use crate::jobs::JobStore;

/// Authoritative job state, fetched on demand.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// `Ok(None)` means the job does not exist. `Err` is a transport failure.
    async fn fetch(&self, id: &JobId) -> Result<Option<JobRecord>>;
}

/// Best-effort stream of progress events for a topic.
///
/// Dropping the stream unsubscribes.
#[async_trait]
pub trait PushSource: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, ProgressEvent>>;
}

#[async_trait]
impl JobSource for JobStore {
    async fn fetch(&self, id: &JobId) -> Result<Option<JobRecord>> {
        Ok(self.get(id).await?)
    }
}

#[async_trait]
impl PushSource for ProgressChannel {
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, ProgressEvent>> {
        Ok(broadcast_stream(ProgressChannel::subscribe(self, topic)))
    }
}

/// Turn a broadcast receiver into a stream.
///
/// Lag ends the stream like a closed channel does: events were lost, so the
/// consumer has to reconcile from its job source.
pub fn broadcast_stream(rx: broadcast::Receiver<ProgressEvent>) -> BoxStream<'static, ProgressEvent> {
    futures::stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(event) => Some((event, rx)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "push subscriber lagged; ending stream");
                None
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    })
    .boxed()
}

/// Polls `GET {base}/api/jobs/{id}`.
pub struct HttpJobSource {
    client: ApiClient,
}

impl HttpJobSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: ApiClient::new(base_url)?,
        })
    }
}

impl From<ApiClient> for HttpJobSource {
    fn from(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobSource for HttpJobSource {
    async fn fetch(&self, id: &JobId) -> Result<Option<JobRecord>> {
        self.client.job(id).await
    }
}

/// Subscribes to `{base}/ws/{topic}` over a websocket.
pub struct WsPushSource {
    ws_base: String,
}

impl WsPushSource {
    /// Accepts an `http(s)://` or `ws(s)://` base URL.
    pub fn new(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        Self { ws_base }
    }

    pub fn topic_url(&self, topic: &str) -> String {
        format!("{}/ws/{}", self.ws_base, topic)
    }
}

#[async_trait]
impl PushSource for WsPushSource {
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, ProgressEvent>> {
        let url = self.topic_url(topic);
        let (ws, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        debug!(%url, "push subscription open");

        let events = ws.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => serde_json::from_str::<ProgressEvent>(&text).ok(),
                _ => None,
            }
        });
        Ok(events.boxed())
    }
}
