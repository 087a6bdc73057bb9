//! Bridge facade - the one object a host talks to
//!
//! Owns the relay queue and, once initialized, the agent pool. The
//! initialization gate only guards the state transition; submits and drains
//! never touch it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::agent::AgentFactory;
use crate::error::BridgeError;
use crate::options::InitOptions;
use crate::persona::{Persona, default_personas};
use crate::pool::AgentPool;
use crate::relay::{RelayQueue, ReplyCallback};
use crate::types::{AgentIdentity, ReplyRecord};

/// Lifecycle of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

enum Slot {
    Uninitialized,
    Initializing,
    Ready(Arc<AgentPool>),
    Failed(BridgeError),
}

impl Slot {
    fn state(&self) -> BridgeState {
        match self {
            Self::Uninitialized => BridgeState::Uninitialized,
            Self::Initializing => BridgeState::Initializing,
            Self::Ready(_) => BridgeState::Ready,
            Self::Failed(_) => BridgeState::Failed,
        }
    }
}

/// Identity stamped on records the bridge synthesizes itself
pub fn bridge_identity() -> AgentIdentity {
    AgentIdentity {
        id: "bridge".to_string(),
        name: "Bridge".to_string(),
        color: "#9E9E9E".to_string(),
    }
}

pub struct Bridge {
    factory: Arc<dyn AgentFactory>,
    personas: Vec<Persona>,
    relay: Arc<RelayQueue>,
    slot: RwLock<Slot>,
    gate: Mutex<()>,
    /// Finished initialization attempts; lets a waiter tell whether the
    /// attempt it queued behind has already resolved
    attempts: AtomicU64,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("state", &self.state())
            .field("personas", &self.personas.len())
            .field("relay", &self.relay)
            .finish()
    }
}

impl Bridge {
    /// A bridge that seats the predefined personas
    pub fn new(factory: Arc<dyn AgentFactory>) -> Self {
        Self::with_personas(factory, default_personas())
    }

    pub fn with_personas(factory: Arc<dyn AgentFactory>, personas: Vec<Persona>) -> Self {
        Self {
            factory,
            personas,
            relay: Arc::new(RelayQueue::new()),
            slot: RwLock::new(Slot::Uninitialized),
            gate: Mutex::new(()),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> BridgeState {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state()
    }

    pub fn relay(&self) -> &Arc<RelayQueue> {
        &self.relay
    }

    fn pool(&self) -> Option<Arc<AgentPool>> {
        match &*self.slot.read().unwrap_or_else(PoisonError::into_inner) {
            Slot::Ready(pool) => Some(pool.clone()),
            _ => None,
        }
    }

    fn set_slot(&self, slot: Slot) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = slot;
    }

    /// Build the pool. Returns the number of agents that came up.
    ///
    /// Concurrent callers collapse into a single attempt and all see its
    /// outcome. Once ready, later calls succeed immediately without
    /// rebuilding; after a failure, the next call retries from scratch.
    pub async fn initialize(&self, options: InitOptions) -> Result<usize, BridgeError> {
        let seen = self.attempts.load(Ordering::SeqCst);
        if let Some(pool) = self.pool() {
            return Ok(pool.len());
        }

        let _gate = self.gate.lock().await;

        {
            let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
            match &*slot {
                Slot::Ready(pool) => return Ok(pool.len()),
                Slot::Failed(err) if self.attempts.load(Ordering::SeqCst) != seen => {
                    debug!("Observed concurrent initialization failure");
                    return Err(err.clone());
                }
                _ => {}
            }
        }

        info!("Initializing bridge: {:?}", options);
        self.set_slot(Slot::Initializing);

        let result = match options.validate() {
            Ok(()) => {
                AgentPool::build(
                    self.factory.as_ref(),
                    &self.personas,
                    &options,
                    self.relay.clone(),
                )
                .await
            }
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(pool) => {
                let size = pool.len();
                self.set_slot(Slot::Ready(Arc::new(pool)));
                info!("Bridge ready with {} agents", size);
                Ok(size)
            }
            Err(e) => {
                warn!("Bridge initialization failed: {}", e);
                self.set_slot(Slot::Failed(e.clone()));
                Err(e)
            }
        };
        self.attempts.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    /// Who is in the room; empty until the bridge is ready
    pub fn list_agents(&self) -> Vec<AgentIdentity> {
        self.pool()
            .map(|pool| pool.list_identities())
            .unwrap_or_default()
    }

    /// Record the bridge pushes when asked to work before it is ready
    pub fn not_ready_record(&self) -> ReplyRecord {
        ReplyRecord::failure(
            &bridge_identity(),
            format!("bridge is {}, message not delivered", self.state()),
        )
    }

    /// Fire-and-forget: dispatch to every agent and return immediately.
    /// Outside `Ready` nothing is dispatched and a single failure record is
    /// queued so the host is not left waiting.
    pub fn submit(&self, message: &str, sender_name: &str) -> Result<usize, BridgeError> {
        match self.pool() {
            Some(pool) => Ok(pool.fan_out(message, sender_name)),
            None => {
                warn!("Submit while bridge is {}", self.state());
                self.relay.push(self.not_ready_record());
                Err(BridgeError::NotReady)
            }
        }
    }

    /// Blocking-compatibility variant: dispatch and wait until every agent
    /// has resolved, returning this message's records directly
    pub async fn submit_and_wait(
        &self,
        message: &str,
        sender_name: &str,
    ) -> Result<Vec<ReplyRecord>, BridgeError> {
        let pool = self.pool().ok_or(BridgeError::NotReady)?;
        Ok(pool.fan_out_and_collect(message, sender_name).await)
    }

    /// Everything the relay holds right now; never waits
    pub fn drain_replies(&self) -> Vec<ReplyRecord> {
        self.relay.drain_all()
    }

    pub fn pending_count(&self) -> usize {
        self.relay.len()
    }

    /// Deliver records to `callback` as they are produced instead of queueing
    pub fn set_reply_callback(&self, callback: ReplyCallback) {
        self.relay.set_callback(callback);
    }

    pub fn clear_reply_callback(&self) {
        self.relay.clear_callback();
    }

    /// Clear every agent's conversation history
    pub async fn reset(&self) -> Result<usize, BridgeError> {
        let pool = self.pool().ok_or(BridgeError::NotReady)?;
        Ok(pool.reset_all().await)
    }

    /// Tear the pool down, joining its outstanding tasks. The bridge returns
    /// to `Uninitialized` and may be initialized again.
    pub async fn shutdown(&self) {
        let _gate = self.gate.lock().await;
        let previous = std::mem::replace(
            &mut *self.slot.write().unwrap_or_else(PoisonError::into_inner),
            Slot::Uninitialized,
        );
        if let Slot::Ready(pool) = previous {
            pool.shutdown().await;
        }
        info!("Bridge shut down");
    }
}
