//! Agent pool - builds the room once and fans messages out to it

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::agent::AgentFactory;
use crate::error::BridgeError;
use crate::handle::{AgentHandle, Dispatch};
use crate::options::InitOptions;
use crate::persona::Persona;
use crate::relay::{RelayQueue, ReplyRoute};
use crate::types::{AgentIdentity, MessageEnvelope, ReplyRecord};

/// Fixed set of initialized agents plus the task group their work runs in
pub struct AgentPool {
    handles: Vec<Arc<AgentHandle>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl std::fmt::Debug for AgentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPool")
            .field("agents", &self.handles.len())
            .field("tasks", &self.tracker.len())
            .finish()
    }
}

impl AgentPool {
    /// Build up to `options.agent_count` agents (capped at the number of
    /// personas) and initialize them concurrently. Agents that fail are
    /// dropped; the build only fails if shared setup fails or nobody survives.
    pub async fn build(
        factory: &dyn AgentFactory,
        personas: &[Persona],
        options: &InitOptions,
        relay: Arc<RelayQueue>,
    ) -> Result<Self, BridgeError> {
        let count = options.agent_count.min(personas.len());
        if options.agent_count > personas.len() {
            info!(
                "Requested {} agents but only {} personas exist, building {}",
                options.agent_count,
                personas.len(),
                count
            );
        }

        factory
            .prepare(options)
            .await
            .map_err(|e| BridgeError::Initialization(format!("{:#}", e)))?;

        let mut candidates = Vec::with_capacity(count);
        for (index, persona) in personas.iter().take(count).enumerate() {
            match AgentHandle::create(index, persona, factory, options, relay.clone()) {
                Ok(handle) => candidates.push(Arc::new(handle)),
                Err(e) => warn!("{}", e),
            }
        }

        let mut join_set = JoinSet::new();
        for (slot, handle) in candidates.iter().enumerate() {
            let handle = handle.clone();
            join_set.spawn(async move { (slot, handle.initialize().await) });
        }

        let mut survived = vec![false; candidates.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((slot, Ok(()))) => survived[slot] = true,
                Ok((_, Err(e))) => warn!("{}", e),
                Err(e) => warn!("Agent initialization task panicked: {}", e),
            }
        }

        let handles: Vec<Arc<AgentHandle>> = candidates
            .into_iter()
            .zip(survived)
            .filter_map(|(handle, ok)| ok.then_some(handle))
            .collect();

        if count > 0 && handles.is_empty() {
            return Err(BridgeError::initialization(
                "no agent could be initialized",
            ));
        }

        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        for handle in &handles {
            handle.start(&tracker, cancel.child_token());
        }

        info!("Agent pool ready with {}/{} agents", handles.len(), count);

        Ok(Self {
            handles,
            tracker,
            cancel,
        })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handles(&self) -> &[Arc<AgentHandle>] {
        &self.handles
    }

    /// Snapshot of who is in the room, in pool order
    pub fn list_identities(&self) -> Vec<AgentIdentity> {
        self.handles.iter().map(|h| h.identity().clone()).collect()
    }

    /// Start every agent on `message` and return without waiting for any
    /// of them. Returns how many agents were dispatched to.
    pub fn fan_out(&self, message: &str, sender_name: &str) -> usize {
        let envelope = MessageEnvelope::from_user(message, sender_name);
        debug!(
            "Fanning out {} to {} agents",
            envelope.message_id,
            self.handles.len()
        );
        for handle in &self.handles {
            handle.dispatch(Dispatch {
                envelope: envelope.clone(),
                route: handle.relay_route(),
                done: None,
            });
        }
        self.handles.len()
    }

    /// Fan out and wait until every agent has resolved, returning the
    /// records this message produced (failures included) in completion order
    pub async fn fan_out_and_collect(&self, message: &str, sender_name: &str) -> Vec<ReplyRecord> {
        let envelope = MessageEnvelope::from_user(message, sender_name);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pending = Vec::with_capacity(self.handles.len());

        for handle in &self.handles {
            let (done_tx, done_rx) = oneshot::channel();
            handle.dispatch(Dispatch {
                envelope: envelope.clone(),
                route: ReplyRoute::Collect(tx.clone()),
                done: Some(done_tx),
            });
            pending.push(done_rx);
        }
        drop(tx);

        for done in pending {
            // a dropped signal means the run was abandoned on shutdown
            let _ = done.await;
        }

        let mut records = Vec::new();
        while let Ok(record) = rx.try_recv() {
            records.push(record);
        }
        debug!("Collected {} replies for {}", records.len(), envelope.message_id);
        records
    }

    /// Reset every agent's history. Resets are queued behind in-flight work,
    /// so this never waits on a running pipeline. Per-agent failures are
    /// logged and skipped. Returns how many agents accepted the reset.
    pub async fn reset_all(&self) -> usize {
        let mut join_set = JoinSet::new();
        for handle in &self.handles {
            let handle = handle.clone();
            join_set.spawn(async move {
                let id = handle.identity().id.clone();
                (id, handle.reset().await)
            });
        }

        let mut cleared = 0;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => cleared += 1,
                Ok((id, Err(e))) => warn!("Failed to reset agent {}: {:#}", id, e),
                Err(e) => warn!("Agent reset task panicked: {}", e),
            }
        }
        info!("Reset {}/{} agents", cleared, self.handles.len());
        cleared
    }

    /// Cancel in-flight work and wait for every agent task to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Agent pool shut down");
    }
}

impl Drop for AgentPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
