//! Delivery-path state machine.
//!
//! ```text
//! push-pending ──push──▶ push-active
//!      │                    ▲   │
//!   timeout               push  push closed
//!      ▼                    │   ▼
//! polling-active ───────────┘ polling-active
//! ```
//!
//! Any state moves to `finished` once, on a terminal record or teardown.

use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    PushPending,
    PushActive,
    PollingActive,
    Finished,
}

/// The one authoritative-source field, shared between the observer task and its handle.
#[derive(Debug, Clone)]
pub struct PathState {
    inner: Arc<Mutex<DeliveryPath>>,
}

impl Default for PathState {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(DeliveryPath::PushPending)),
        }
    }
}

impl PathState {
    pub fn current(&self) -> DeliveryPath {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, f: impl FnOnce(DeliveryPath) -> Option<DeliveryPath>) -> bool {
        let mut path = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match f(*path) {
            Some(next) => {
                *path = next;
                true
            }
            None => false,
        }
    }

    /// A push message arrived. True if push just became authoritative.
    pub fn on_push(&self) -> bool {
        self.transition(|p| match p {
            DeliveryPath::PushPending | DeliveryPath::PollingActive => Some(DeliveryPath::PushActive),
            _ => None,
        })
    }

    /// The fallback timer fired. True if polling just started.
    pub fn on_fallback(&self) -> bool {
        self.transition(|p| match p {
            DeliveryPath::PushPending => Some(DeliveryPath::PollingActive),
            _ => None,
        })
    }

    /// The push stream ended. True if polling took over.
    pub fn on_push_closed(&self) -> bool {
        self.transition(|p| match p {
            DeliveryPath::PushPending | DeliveryPath::PushActive => Some(DeliveryPath::PollingActive),
            _ => None,
        })
    }

    /// True exactly once.
    pub fn finish(&self) -> bool {
        self.transition(|p| match p {
            DeliveryPath::Finished => None,
            _ => Some(DeliveryPath::Finished),
        })
    }
}
