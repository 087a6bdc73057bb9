//! Reply relay - carries agent replies back to a host that can only poll
//!
//! Many agent tasks push concurrently; the host drains everything that is
//! pending in one call, or registers a callback and gets each record as it
//! is produced.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::ReplyRecord;

/// Push-mode delivery hook, invoked inline on the producer's task
pub type ReplyCallback = Arc<dyn Fn(ReplyRecord) + Send + Sync>;

/// Capability injected into every agent at construction.
/// The agent calls `deliver` once per reply it wants the room to see.
pub trait ReplySink: Send + Sync {
    fn deliver(&self, content: String);
}

/// Unbounded FIFO of reply records in completion order
#[derive(Default)]
pub struct RelayQueue {
    buffer: Mutex<VecDeque<ReplyRecord>>,
    callback: RwLock<Option<ReplyCallback>>,
}

impl std::fmt::Debug for RelayQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayQueue")
            .field("pending", &self.len())
            .field("callback", &self.has_callback())
            .finish()
    }
}

impl RelayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record, or hand it to the callback if one is registered.
    /// The delivery mode is decided once here, so a record never reaches both.
    pub fn push(&self, record: ReplyRecord) {
        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match callback {
            Some(callback) => {
                debug!("Delivering reply from {} via callback", record.agent_id);
                callback(record);
            }
            None => {
                debug!("Queueing reply from {}", record.agent_id);
                self.buffer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back(record);
            }
        }
    }

    /// Remove and return everything currently queued, oldest first.
    /// Never waits for new records.
    pub fn drain_all(&self) -> Vec<ReplyRecord> {
        let drained = std::mem::take(
            &mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner),
        );
        drained.into()
    }

    /// Number of records waiting to be drained
    pub fn len(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Switch to push mode. Records already buffered stay buffered.
    pub fn set_callback(&self, callback: ReplyCallback) {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Return to poll mode
    pub fn clear_callback(&self) {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn has_callback(&self) -> bool {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Where the records of one pipeline run end up
#[derive(Clone)]
pub enum ReplyRoute {
    /// The shared relay queue (fire-and-forget submits)
    Relay(Arc<RelayQueue>),
    /// A per-request collector (blocking submits)
    Collect(mpsc::UnboundedSender<ReplyRecord>),
}

impl ReplyRoute {
    pub fn send(&self, record: ReplyRecord) {
        match self {
            Self::Relay(relay) => relay.push(record),
            Self::Collect(tx) => {
                if let Err(e) = tx.send(record) {
                    warn!(
                        "Reply from {} arrived after its request finished, dropping",
                        e.0.agent_id
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for ReplyRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Relay(_) => write!(f, "ReplyRoute::Relay"),
            Self::Collect(_) => write!(f, "ReplyRoute::Collect"),
        }
    }
}
