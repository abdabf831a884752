//! Best-effort progress channel.
//!
//! One `tokio::sync::broadcast` sender per topic, where a topic is a job id
//! or a session id. Publishing never blocks and never fails from the
//! caller's point of view: a topic with no subscribers just drops the event,
//! and slow subscribers lag instead of applying back-pressure.

use dashmap::DashMap;
use genforge_common::{JobRecord, ProgressEvent};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default number of buffered events per topic.
pub const DEFAULT_CAPACITY: usize = 256;

pub struct ProgressChannel {
    topics: DashMap<String, broadcast::Sender<ProgressEvent>>,
    capacity: usize,
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ProgressChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<ProgressEvent> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<ProgressEvent> {
        self.sender(topic).subscribe()
    }

    /// Publish to one topic. Returns the number of subscribers reached.
    pub fn publish(&self, topic: &str, event: ProgressEvent) -> usize {
        let Some(sender) = self.topics.get(topic).map(|s| s.clone()) else {
            trace!(topic, event_type = %event.event_type, "no subscribers; event dropped");
            return 0;
        };
        match sender.send(event) {
            Ok(n) => n,
            Err(err) => {
                debug!(topic, event_type = %err.0.event_type, "publish dropped: no receivers");
                0
            }
        }
    }

    /// Publish to every topic a job is reachable under.
    pub fn publish_for(&self, record: &JobRecord, event: ProgressEvent) -> usize {
        record
            .topics()
            .iter()
            .map(|topic| self.publish(topic, event.clone()))
            .sum()
    }

    pub fn publish_status(&self, record: &JobRecord) -> usize {
        self.publish_for(record, ProgressEvent::status_update(record))
    }

    /// Drop `topic` once its last subscriber is gone.
    pub fn release(&self, topic: &str) -> bool {
        self.topics
            .remove_if(topic, |_, sender| sender.receiver_count() == 0)
            .is_some()
    }

    /// Drop topics nobody is listening to.
    pub fn prune(&self) -> usize {
        let before = self.topics.len();
        self.topics.retain(|_, sender| sender.receiver_count() > 0);
        before - self.topics.len()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}
