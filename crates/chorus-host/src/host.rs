//! Synchronous host boundary
//!
//! A `Host` owns one background worker thread running a tokio runtime. Calls
//! that must await (initialize, reset, blocking submit, shutdown) are sent to
//! the worker as commands and the caller blocks on the answer. Fire-and-forget
//! submit, draining and listing never await, so they run on the caller's
//! thread directly.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use chorus_core::{AgentFactory, Bridge, BridgeError, InitOptions, PersonaAgentFactory, ReplyRecord};

use crate::options::resolve_init_options;

enum Command {
    Initialize {
        options: InitOptions,
        reply: std_mpsc::SyncSender<bool>,
    },
    Reset {
        reply: std_mpsc::SyncSender<bool>,
    },
    SubmitBlocking {
        message: String,
        sender_name: String,
        reply: std_mpsc::SyncSender<Vec<ReplyRecord>>,
    },
    Shutdown {
        reply: std_mpsc::SyncSender<()>,
    },
}

pub struct Host {
    bridge: Arc<Bridge>,
    commands: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("bridge", &self.bridge)
            .field("running", &!self.commands.is_closed())
            .finish()
    }
}

impl Host {
    /// Start a host backed by LLM persona agents
    pub fn start() -> Result<Self> {
        Self::with_factory(Arc::new(PersonaAgentFactory::new()))
    }

    pub fn with_factory(factory: Arc<dyn AgentFactory>) -> Result<Self> {
        let bridge = Arc::new(Bridge::new(factory));

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("chorus-agents")
            .build()
            .context("Failed to build tokio runtime")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let worker_bridge = bridge.clone();
        let worker = std::thread::Builder::new()
            .name("chorus-host".to_string())
            .spawn(move || {
                runtime.block_on(run_worker(worker_bridge, rx));
                debug!("Host worker thread exiting");
            })
            .context("Failed to spawn host worker thread")?;

        info!("Host worker started");
        Ok(Self {
            bridge,
            commands: tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// Send a command and block until the worker answers. `None` when the
    /// worker is gone.
    fn request<T>(&self, build: impl FnOnce(std_mpsc::SyncSender<T>) -> Command) -> Option<T> {
        let (reply_tx, reply_rx) = std_mpsc::sync_channel(1);
        if self.commands.send(build(reply_tx)).is_err() {
            warn!("Host worker is not running");
            return None;
        }
        reply_rx.recv().ok()
    }

    /// Build the agent pool. `config_json` is a JSON object of optional
    /// overrides; an empty credential falls back to the environment.
    pub fn initialize(&self, credential: &str, count: usize, config_json: &str) -> bool {
        let options = match resolve_init_options(credential, count, config_json) {
            Ok(options) => options,
            Err(e) => {
                warn!("Rejecting initialize: {:#}", e);
                return false;
            }
        };
        self.request(|reply| Command::Initialize { options, reply })
            .unwrap_or(false)
    }

    /// JSON array of `{id, name, color}`
    pub fn list_agents(&self) -> String {
        to_json(&self.bridge.list_agents())
    }

    /// Fire-and-forget fan-out; returns once every agent has been handed the
    /// message. Replies arrive through `pending_replies` or the callback.
    pub fn submit(&self, message: &str, sender_name: &str) -> bool {
        match self.bridge.submit(message, sender_name) {
            Ok(dispatched) => {
                debug!("Dispatched message to {} agents", dispatched);
                true
            }
            Err(e) => {
                debug!("Submit rejected: {}", e);
                false
            }
        }
    }

    /// Fan out and block until every agent has resolved. Returns a JSON array
    /// of this message's replies, failures included.
    pub fn submit_blocking(&self, message: &str, sender_name: &str) -> String {
        let records = self
            .request(|reply| Command::SubmitBlocking {
                message: message.to_string(),
                sender_name: sender_name.to_string(),
                reply,
            })
            .unwrap_or_else(|| vec![self.bridge.not_ready_record()]);
        to_json(&records)
    }

    /// Drain the relay; JSON array of reply records, oldest first
    pub fn pending_replies(&self) -> String {
        to_json(&self.bridge.drain_replies())
    }

    pub fn reset_all(&self) -> bool {
        self.request(|reply| Command::Reset { reply }).unwrap_or(false)
    }

    /// Push each reply to `callback` as a JSON object instead of queueing it.
    /// The callback runs on an agent task; a panic inside it is contained.
    pub fn set_reply_callback<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.bridge.set_reply_callback(Arc::new(move |record: ReplyRecord| {
            let json = to_json(&record);
            if catch_unwind(AssertUnwindSafe(|| callback(&json))).is_err() {
                error!("Reply callback panicked for {}", record.agent_id);
            }
        }));
    }

    pub fn clear_reply_callback(&self) {
        self.bridge.clear_reply_callback();
    }

    /// Tear down the pool and stop the worker thread. Later calls that need
    /// the worker return `false` or a not-ready record.
    pub fn shutdown(&self) {
        if self.request(|reply| Command::Shutdown { reply }).is_none() {
            debug!("Host already shut down");
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("Host worker thread panicked");
            }
            info!("Host shut down");
        }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        let (reply, _) = std_mpsc::sync_channel(1);
        let _ = self.commands.send(Command::Shutdown { reply });
    }
}

async fn run_worker(bridge: Arc<Bridge>, mut commands: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Initialize { options, reply } => {
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    let ok = match bridge.initialize(options).await {
                        Ok(size) => {
                            info!("Initialized {} agents", size);
                            true
                        }
                        Err(e) => {
                            warn!("{}", e);
                            false
                        }
                    };
                    let _ = reply.send(ok);
                });
            }
            Command::Reset { reply } => {
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    let ok = match bridge.reset().await {
                        Ok(count) => {
                            info!("Reset {} agents", count);
                            true
                        }
                        Err(e) => {
                            warn!("Reset rejected: {}", e);
                            false
                        }
                    };
                    let _ = reply.send(ok);
                });
            }
            Command::SubmitBlocking {
                message,
                sender_name,
                reply,
            } => {
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    let records = match bridge.submit_and_wait(&message, &sender_name).await {
                        Ok(records) => records,
                        Err(BridgeError::NotReady) => vec![bridge.not_ready_record()],
                        Err(e) => {
                            warn!("Blocking submit failed: {}", e);
                            Vec::new()
                        }
                    };
                    let _ = reply.send(records);
                });
            }
            Command::Shutdown { reply } => {
                bridge.shutdown().await;
                let _ = reply.send(());
                break;
            }
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        error!("Failed to serialize host output: {}", e);
        "[]".to_string()
    })
}
