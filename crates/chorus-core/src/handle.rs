//! Agent handle - identity, readiness and a private mailbox around one agent
//!
//! Each handle owns a worker task that runs its agent's pipeline one message
//! at a time, so two pipelines never interleave on the same agent and replies
//! to sequential submits come back in submission order. Each pipeline run is
//! its own supervised task: errors, timeouts and panics all become exactly
//! one failure record on the run's reply route.
//!
//! A run's route is bound to the run's own task. Replies an agent delivers
//! from anywhere else (a task it detached, or after the run resolved) go to
//! the shared relay, never to some other run's route.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::agent::{AgentFactory, ChatAgent};
use crate::error::BridgeError;
use crate::options::InitOptions;
use crate::persona::Persona;
use crate::relay::{RelayQueue, ReplyRoute, ReplySink};
use crate::types::{AgentIdentity, MessageEnvelope, ReplyRecord};

/// One queued pipeline run
pub(crate) struct Dispatch {
    pub envelope: MessageEnvelope,
    pub route: ReplyRoute,
    /// Signalled once the run has resolved, whatever the outcome
    pub done: Option<oneshot::Sender<()>>,
}

/// Work queued on a handle's mailbox
pub(crate) enum Job {
    Run(Dispatch),
    Reset,
}

tokio::task_local! {
    /// Route of the pipeline run executing on the current task
    static RUN_ROUTE: ReplyRoute;
}

impl Dispatch {
    fn finish(self) {
        if let Some(done) = self.done {
            let _ = done.send(());
        }
    }
}

/// Sink handed to the agent; stamps every reply with the agent's identity.
/// Inside a run it follows the run's route, elsewhere it feeds the relay.
struct HandleSink {
    identity: AgentIdentity,
    relay: Arc<RelayQueue>,
}

impl ReplySink for HandleSink {
    fn deliver(&self, content: String) {
        if content.trim().is_empty() {
            debug!("{} delivered an empty reply, ignoring", self.identity.id);
            return;
        }
        let record = ReplyRecord::new(&self.identity, content);
        match RUN_ROUTE.try_with(|route| route.clone()) {
            Ok(route) => route.send(record),
            Err(_) => {
                debug!("{} replied outside a run, relaying", self.identity.id);
                self.relay.push(record);
            }
        }
    }
}

/// Wrapper around one opaque agent instance
pub struct AgentHandle {
    identity: AgentIdentity,
    agent: Arc<Mutex<Box<dyn ChatAgent>>>,
    relay: Arc<RelayQueue>,
    attempted: AtomicBool,
    ready: AtomicBool,
    mailbox: OnceLock<mpsc::UnboundedSender<Job>>,
    pipeline_timeout: Option<Duration>,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("identity", &self.identity)
            .field("ready", &self.is_ready())
            .field("pipeline_timeout", &self.pipeline_timeout)
            .finish()
    }
}

impl AgentHandle {
    /// Create the handle for `persona` at pool position `index`.
    /// The agent is built by `factory` with this handle's reply sink.
    pub fn create(
        index: usize,
        persona: &Persona,
        factory: &dyn AgentFactory,
        options: &InitOptions,
        relay: Arc<RelayQueue>,
    ) -> Result<Self, BridgeError> {
        let identity = persona.identity(index);
        let sink = Arc::new(HandleSink {
            identity: identity.clone(),
            relay: relay.clone(),
        });

        let agent = factory
            .create(persona, options, sink)
            .map_err(|e| BridgeError::AgentInit {
                agent_id: identity.id.clone(),
                reason: format!("{:#}", e),
            })?;

        Ok(Self {
            identity,
            agent: Arc::new(Mutex::new(agent)),
            relay,
            attempted: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            mailbox: OnceLock::new(),
            pipeline_timeout: options.pipeline_timeout(),
        })
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Run the agent's setup. Only the first call does any work; a failed
    /// handle stays failed.
    pub async fn initialize(&self) -> Result<(), BridgeError> {
        if self.attempted.swap(true, Ordering::SeqCst) {
            return if self.is_ready() {
                Ok(())
            } else {
                Err(self.init_error("initialization already failed"))
            };
        }

        let mut agent = self.agent.lock().await;
        let result = match self.pipeline_timeout {
            Some(limit) => tokio::time::timeout(limit, agent.initialize())
                .await
                .unwrap_or_else(|_| Err(anyhow!("timed out after {}s", limit.as_secs()))),
            None => agent.initialize().await,
        };

        match result {
            Ok(()) => {
                self.ready.store(true, Ordering::SeqCst);
                info!("Agent {} ({}) initialized", self.identity.id, self.identity.name);
                Ok(())
            }
            Err(e) => {
                warn!("Agent {} failed to initialize: {:#}", self.identity.id, e);
                Err(self.init_error(format!("{:#}", e)))
            }
        }
    }

    fn init_error(&self, reason: impl Into<String>) -> BridgeError {
        BridgeError::AgentInit {
            agent_id: self.identity.id.clone(),
            reason: reason.into(),
        }
    }

    /// Spawn the worker that drains this handle's mailbox. Runs on `tracker`
    /// until `cancel` fires.
    pub(crate) fn start(self: &Arc<Self>, tracker: &TaskTracker, cancel: CancellationToken) {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.mailbox.set(tx).is_err() {
            warn!("Agent {} worker already started", self.identity.id);
            return;
        }
        let handle = self.clone();
        let worker_tracker = tracker.clone();
        tracker.spawn(async move {
            handle.run_worker(rx, worker_tracker, cancel).await;
        });
    }

    /// Route that sends this handle's records to the shared relay
    pub(crate) fn relay_route(&self) -> ReplyRoute {
        ReplyRoute::Relay(self.relay.clone())
    }

    /// Hand one message to the agent and return immediately.
    /// The reply, or a failure record, shows up on the relay later.
    pub fn process(&self, message: &str, sender_name: &str) {
        let envelope = MessageEnvelope::from_user(message, sender_name);
        self.dispatch(Dispatch {
            envelope,
            route: self.relay_route(),
            done: None,
        });
    }

    pub(crate) fn dispatch(&self, dispatch: Dispatch) {
        if !self.is_ready() {
            dispatch
                .route
                .send(ReplyRecord::failure(&self.identity, "agent not initialized"));
            dispatch.finish();
            return;
        }

        let Some(mailbox) = self.mailbox.get() else {
            dispatch
                .route
                .send(ReplyRecord::failure(&self.identity, "agent worker not running"));
            dispatch.finish();
            return;
        };

        if let Err(mpsc::error::SendError(Job::Run(dispatch))) = mailbox.send(Job::Run(dispatch)) {
            dispatch
                .route
                .send(ReplyRecord::failure(&self.identity, "agent worker stopped"));
            dispatch.finish();
        }
    }

    /// Clear the agent's conversation history, if it has a reset hook.
    ///
    /// With a running worker the reset is queued behind the messages already
    /// submitted and this returns without waiting for an in-flight pipeline.
    /// Without a worker the reset runs directly.
    pub async fn reset(&self) -> anyhow::Result<()> {
        if let Some(mailbox) = self.mailbox.get() {
            return mailbox
                .send(Job::Reset)
                .map_err(|_| anyhow!("agent worker stopped"));
        }
        reset_agent(&self.agent, &self.identity).await
    }

    async fn run_worker(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Job>,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) {
        debug!("Agent {} worker started", self.identity.id);
        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(job) => job,
                    None => break,
                },
            };
            match job {
                Job::Run(dispatch) => self.run_pipeline(dispatch, &tracker, &cancel).await,
                Job::Reset => self.run_reset(&tracker, &cancel).await,
            }
        }
        debug!("Agent {} worker stopped", self.identity.id);
    }

    async fn run_pipeline(
        &self,
        dispatch: Dispatch,
        tracker: &TaskTracker,
        cancel: &CancellationToken,
    ) {
        let Dispatch { envelope, route, done } = dispatch;
        let message_id = envelope.message_id.clone();

        let agent = self.agent.clone();
        let limit = self.pipeline_timeout;
        let mut run = tracker.spawn(RUN_ROUTE.scope(route.clone(), async move {
            let mut agent = agent.lock().await;
            match limit {
                Some(limit) => tokio::time::timeout(limit, agent.submit_message(envelope))
                    .await
                    .unwrap_or_else(|_| Err(anyhow!("timed out after {}s", limit.as_secs()))),
                None => agent.submit_message(envelope).await,
            }
        }));

        let outcome = tokio::select! {
            joined = &mut run => Some(joined),
            _ = cancel.cancelled() => {
                run.abort();
                None
            }
        };

        match outcome {
            Some(Ok(Ok(()))) => {
                debug!("Agent {} finished {}", self.identity.id, message_id);
            }
            Some(Ok(Err(e))) => {
                let err = BridgeError::Pipeline {
                    agent_id: self.identity.id.clone(),
                    reason: format!("{:#}", e),
                };
                warn!("{}", err);
                route.send(ReplyRecord::failure(&self.identity, format!("{:#}", e)));
            }
            Some(Err(join_error)) => {
                warn!("Agent {} pipeline panicked: {}", self.identity.id, join_error);
                route.send(ReplyRecord::failure(
                    &self.identity,
                    format!("pipeline panicked: {}", join_error),
                ));
            }
            None => {
                debug!("Agent {} abandoned {} on shutdown", self.identity.id, message_id);
            }
        }

        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    async fn run_reset(&self, tracker: &TaskTracker, cancel: &CancellationToken) {
        let agent = self.agent.clone();
        let identity = self.identity.clone();
        let mut run = tracker.spawn(async move { reset_agent(&agent, &identity).await });

        let outcome = tokio::select! {
            joined = &mut run => joined,
            _ = cancel.cancelled() => {
                run.abort();
                return;
            }
        };
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to reset agent {}: {:#}", self.identity.id, e),
            Err(e) => warn!("Agent {} reset panicked: {}", self.identity.id, e),
        }
    }
}

async fn reset_agent(
    agent: &Mutex<Box<dyn ChatAgent>>,
    identity: &AgentIdentity,
) -> anyhow::Result<()> {
    let mut agent = agent.lock().await;
    if !agent.supports_reset() {
        debug!("Agent {} has no reset hook", identity.id);
        return Ok(());
    }
    agent.reset_history().await?;
    debug!("Agent {} history cleared", identity.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Script, ScriptedAgentFactory};
    use std::time::Duration;

    fn options() -> InitOptions {
        InitOptions::new("sk-test", 1).with_pipeline_timeout_secs(5)
    }

    fn persona() -> Persona {
        Persona::new("Pip", "tester", "#FF6B9D", "")
    }

    async fn started(
        script: Script,
    ) -> (Arc<AgentHandle>, Arc<RelayQueue>, TaskTracker, CancellationToken) {
        let relay = Arc::new(RelayQueue::new());
        let factory = ScriptedAgentFactory::new(script);
        let handle = Arc::new(
            AgentHandle::create(0, &persona(), &factory, &options(), relay.clone()).unwrap(),
        );
        handle.initialize().await.unwrap();
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        handle.start(&tracker, cancel.clone());
        (handle, relay, tracker, cancel)
    }

    async fn wait_for(relay: &RelayQueue, n: usize) -> Vec<ReplyRecord> {
        let mut got = Vec::new();
        for _ in 0..200 {
            got.extend(relay.drain_all());
            if got.len() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        got
    }

    #[tokio::test]
    async fn test_process_delivers_reply() {
        let (handle, relay, _tracker, _cancel) = started(Script::Echo).await;
        handle.process("hello", "alice");
        let got = wait_for(&relay, 1).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].agent_id, "bot_0");
        assert_eq!(got[0].agent_name, "Pip");
        assert_eq!(got[0].content, "Pip heard hello");
    }

    #[tokio::test]
    async fn test_not_ready_yields_one_failure() {
        let relay = Arc::new(RelayQueue::new());
        let factory = ScriptedAgentFactory::new(Script::Echo);
        let handle =
            AgentHandle::create(0, &persona(), &factory, &options(), relay.clone()).unwrap();
        handle.process("hello", "alice");
        let got = relay.drain_all();
        assert_eq!(got.len(), 1);
        assert!(got[0].content.contains("not initialized"));
    }

    #[tokio::test]
    async fn test_failing_pipeline_yields_exactly_one_record() {
        let (handle, relay, _tracker, _cancel) = started(Script::Fail).await;
        handle.process("one", "alice");
        handle.process("two", "alice");
        let got = wait_for(&relay, 2).await;
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|r| r.content.starts_with("Error:")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(relay.drain_all().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_pipeline_is_contained() {
        let (handle, relay, _tracker, _cancel) = started(Script::Panic).await;
        handle.process("boom", "alice");
        let got = wait_for(&relay, 1).await;
        assert_eq!(got.len(), 1);
        assert!(got[0].content.contains("panicked"));

        // the worker survives and keeps serving
        handle.process("again", "alice");
        assert_eq!(wait_for(&relay, 1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_silent_agent_produces_nothing() {
        let (handle, relay, _tracker, _cancel) = started(Script::Silent).await;
        handle.process("hello", "alice");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(relay.drain_all().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_becomes_failure() {
        let relay = Arc::new(RelayQueue::new());
        let factory = ScriptedAgentFactory::new(Script::Hang);
        let options = InitOptions::new("sk-test", 1).with_pipeline_timeout_secs(1);
        let handle =
            Arc::new(AgentHandle::create(0, &persona(), &factory, &options, relay.clone()).unwrap());
        handle.initialize().await.unwrap();
        let tracker = TaskTracker::new();
        handle.start(&tracker, CancellationToken::new());

        handle.process("hello", "alice");
        let mut got = Vec::new();
        for _ in 0..40 {
            got.extend(relay.drain_all());
            if !got.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(got.len(), 1);
        assert!(got[0].content.contains("timed out"));
    }

    #[tokio::test]
    async fn test_replies_keep_submission_order() {
        let (handle, relay, _tracker, _cancel) =
            started(Script::SlowEcho(Duration::from_millis(5))).await;
        for i in 0..10 {
            handle.process(&format!("m{}", i), "alice");
        }
        let got = wait_for(&relay, 10).await;
        let contents: Vec<String> = got.into_iter().map(|r| r.content).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("Pip heard m{}", i)).collect();
        assert_eq!(contents, expected);
    }

    #[tokio::test]
    async fn test_failed_initialize_stays_failed() {
        let relay = Arc::new(RelayQueue::new());
        let factory = ScriptedAgentFactory::new(Script::Echo).failing_init(&["Pip"]);
        let handle = AgentHandle::create(0, &persona(), &factory, &options(), relay).unwrap();
        assert!(handle.initialize().await.is_err());
        assert!(!handle.is_ready());
        assert!(handle.initialize().await.is_err());
        assert_eq!(factory.init_calls(), 1);
    }

    #[tokio::test]
    async fn test_reset_calls_hook() {
        let relay = Arc::new(RelayQueue::new());
        let factory = ScriptedAgentFactory::new(Script::Echo);
        let handle = AgentHandle::create(0, &persona(), &factory, &options(), relay.clone()).unwrap();
        handle.initialize().await.unwrap();
        handle.reset().await.unwrap();
        handle.reset().await.unwrap();
        assert_eq!(factory.reset_calls(), 2);
        assert!(relay.drain_all().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reset_queues_behind_in_flight_run() {
        let relay = Arc::new(RelayQueue::new());
        let factory = ScriptedAgentFactory::new(Script::SlowEcho(Duration::from_secs(1)));
        let handle =
            Arc::new(AgentHandle::create(0, &persona(), &factory, &options(), relay.clone()).unwrap());
        handle.initialize().await.unwrap();
        let tracker = TaskTracker::new();
        handle.start(&tracker, CancellationToken::new());

        handle.process("hello", "alice");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        handle.reset().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(factory.reset_calls(), 0);

        let got = wait_for(&relay, 1).await;
        assert_eq!(got.len(), 1);
        for _ in 0..100 {
            if factory.reset_calls() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(factory.reset_calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reply_outside_run_goes_to_relay() {
        let (handle, relay, _tracker, _cancel) = started(Script::LateEcho {
            work: Duration::ZERO,
            late: Duration::from_millis(100),
        })
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        handle.dispatch(Dispatch {
            envelope: MessageEnvelope::from_user("hello", "alice"),
            route: ReplyRoute::Collect(tx),
            done: Some(done_tx),
        });
        done_rx.await.unwrap();
        assert_eq!(rx.try_recv().unwrap().content, "Pip heard hello");

        let got = wait_for(&relay, 1).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].content, "Pip late on hello");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_abandons_in_flight_run() {
        let (handle, relay, tracker, cancel) = started(Script::Hang).await;
        handle.process("hello", "alice");
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(2), tracker.wait())
            .await
            .unwrap();
        assert!(relay.drain_all().is_empty());
    }
}
