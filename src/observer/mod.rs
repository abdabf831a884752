//! Reliable status observer.
//!
//! Subscribes to the progress channel for one job and arms a fallback
//! timer. If push delivers first, push is the only path from then on. If the
//! timer fires first, the observer polls the job source on an interval
//! until either the job settles or a push message arrives, at which point
//! polling stops for good. Completion is reported exactly once.
//!
//! Dropping the [`ObserverHandle`] (or calling `unsubscribe`) tears the
//! observer down on any path.

pub mod source;
pub mod state;

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use genforge_common::{JobId, JobRecord, JobStatus, ProgressEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::ObserverError;
pub use source::{HttpJobSource, JobSource, PushSource, WsPushSource};
pub use state::{DeliveryPath, PathState};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObserverSettings {
    /// Silence on the push path before polling starts.
    pub fallback_after: Duration,
    pub poll_interval: Duration,
    /// Consecutive fetch failures before an outage is reported.
    pub transport_retry_budget: u32,
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            fallback_after: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            transport_retry_budget: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObserverEvent {
    /// The job record changed.
    Progress(JobRecord),
    /// Polling has failed past the retry budget. Sent once per outage; polling continues.
    TransportError(ObserverError),
    /// Terminal. Always the last event.
    Completed(Result<JobRecord, ObserverError>),
}

/// Owner side of a running observer.
pub struct ObserverHandle {
    events: mpsc::UnboundedReceiver<ObserverEvent>,
    path: PathState,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ObserverHandle {
    pub async fn recv(&mut self) -> Option<ObserverEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ObserverEvent> {
        self.events.try_recv().ok()
    }

    pub fn path(&self) -> DeliveryPath {
        self.path.current()
    }

    /// Stop observing. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    /// Wait for the terminal result, passing progress to `on_progress`.
    ///
    /// `None` if the observer was torn down before the job settled.
    pub async fn wait<F>(mut self, mut on_progress: F) -> Option<Result<JobRecord, ObserverError>>
    where
        F: FnMut(&ObserverEvent),
    {
        while let Some(event) = self.recv().await {
            if let ObserverEvent::Completed(result) = event {
                return Some(result);
            }
            on_progress(&event);
        }
        None
    }

    /// Unsubscribe and wait for the observer task to exit.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start observing `job_id`. Push subscription happens on the job id topic.
pub fn observe(
    job_id: JobId,
    jobs: Arc<dyn JobSource>,
    push: Arc<dyn PushSource>,
    settings: ObserverSettings,
) -> ObserverHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let path = PathState::default();
    let cancel = CancellationToken::new();

    let observer = Observer {
        job_id,
        jobs,
        settings,
        path: path.clone(),
        events: tx,
        last_seen: None,
        consecutive_failures: 0,
        outage_reported: false,
    };
    let task = tokio::spawn(observer.run(push, cancel.clone()));

    ObserverHandle {
        events: rx,
        path,
        cancel,
        task: Some(task),
    }
}

struct Observer {
    job_id: JobId,
    jobs: Arc<dyn JobSource>,
    settings: ObserverSettings,
    path: PathState,
    events: mpsc::UnboundedSender<ObserverEvent>,
    last_seen: Option<JobRecord>,
    consecutive_failures: u32,
    outage_reported: bool,
}

enum Step {
    Continue,
    Done,
}

impl Observer {
    async fn run(mut self, push: Arc<dyn PushSource>, cancel: CancellationToken) {
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => {
                self.path.finish();
                return;
            }
            subscribed = push.subscribe(self.job_id.as_str()) => match subscribed {
                Ok(stream) => Some(stream),
                Err(e) => {
                    warn!(job_id = %self.job_id, error = %format!("{:#}", e), "push subscribe failed");
                    None
                }
            },
        };

        let mut fallback = pin!(tokio::time::sleep(self.settings.fallback_after));
        let mut poll: Option<Interval> = None;
        if stream.is_none() && self.path.on_push_closed() {
            poll = Some(self.poll_interval());
        }

        loop {
            let waiting_for_push = self.path.current() == DeliveryPath::PushPending;
            let step = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(job_id = %self.job_id, "observer cancelled");
                    Step::Done
                }
                event = next_push(&mut stream) => match event {
                    Some(event) => self.on_push(event),
                    None => {
                        stream = None;
                        if self.path.on_push_closed() {
                            warn!(job_id = %self.job_id, "push channel closed; polling");
                            poll = Some(self.poll_interval());
                        }
                        Step::Continue
                    }
                },
                _ = &mut fallback, if waiting_for_push => {
                    if self.path.on_fallback() {
                        info!(
                            job_id = %self.job_id,
                            after = ?self.settings.fallback_after,
                            "no push received; polling"
                        );
                        poll = Some(self.poll_interval());
                    }
                    Step::Continue
                }
                _ = next_tick(&mut poll) => self.poll_once().await,
            };

            if self.path.current() != DeliveryPath::PollingActive {
                poll = None;
            }
            if matches!(step, Step::Done) {
                break;
            }
        }

        // Drops the push stream, which unsubscribes.
        self.path.finish();
        drop(stream);
    }

    fn poll_interval(&self) -> Interval {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    fn on_push(&mut self, event: ProgressEvent) -> Step {
        if event.job_id().as_ref() != Some(&self.job_id) {
            return Step::Continue;
        }
        if self.path.on_push() {
            info!(job_id = %self.job_id, "push active");
        }
        match event.job_record() {
            Some(record) => self.on_record(record),
            None => Step::Continue,
        }
    }

    async fn poll_once(&mut self) -> Step {
        match self.jobs.fetch(&self.job_id).await {
            Ok(Some(record)) => {
                if self.outage_reported {
                    info!(job_id = %self.job_id, "job source reachable again");
                }
                self.consecutive_failures = 0;
                self.outage_reported = false;
                self.on_record(record)
            }
            Ok(None) => self.complete(Err(ObserverError::NotFound(self.job_id.clone()))),
            Err(e) => {
                self.consecutive_failures += 1;
                debug!(
                    job_id = %self.job_id,
                    failures = self.consecutive_failures,
                    error = %e,
                    "poll failed"
                );
                if self.consecutive_failures >= self.settings.transport_retry_budget
                    && !self.outage_reported
                {
                    self.outage_reported = true;
                    let err = ObserverError::Transport {
                        consecutive_failures: self.consecutive_failures,
                        message: format!("{:#}", e),
                    };
                    warn!(job_id = %self.job_id, error = %err, "job source unreachable");
                    let _ = self.events.send(ObserverEvent::TransportError(err));
                }
                Step::Continue
            }
        }
    }

    fn on_record(&mut self, record: JobRecord) -> Step {
        // The channel is unordered; never go back to an older record.
        if let Some(ref last) = self.last_seen {
            if record.updated_at < last.updated_at {
                return Step::Continue;
            }
        }
        if self.last_seen.as_ref() != Some(&record) {
            self.last_seen = Some(record.clone());
            let _ = self.events.send(ObserverEvent::Progress(record.clone()));
        }

        if !record.is_settled() {
            return Step::Continue;
        }
        let result = match record.status {
            JobStatus::Completed => Ok(record),
            JobStatus::Cancelled => Err(ObserverError::JobCancelled),
            _ => Err(ObserverError::JobFailed(
                record.error_message.clone().unwrap_or_default(),
            )),
        };
        self.complete(result)
    }

    fn complete(&mut self, result: Result<JobRecord, ObserverError>) -> Step {
        if self.path.finish() {
            let _ = self.events.send(ObserverEvent::Completed(result));
        }
        Step::Done
    }
}

async fn next_push(stream: &mut Option<BoxStream<'static, ProgressEvent>>) -> Option<ProgressEvent> {
    match stream {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
