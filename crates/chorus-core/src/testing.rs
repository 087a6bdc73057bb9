//! Scripted agents for exercising the handle, pool and bridge

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;

use crate::agent::{AgentFactory, ChatAgent};
use crate::options::InitOptions;
use crate::persona::Persona;
use crate::relay::ReplySink;
use crate::types::MessageEnvelope;

#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// "<name> heard <text>"
    Echo,
    SlowEcho(Duration),
    /// Two replies per message
    Double,
    Silent,
    Fail,
    Panic,
    /// Never completes
    Hang,
    /// Replies after `work`; a task it detaches replies again after `late`
    LateEcho { work: Duration, late: Duration },
}

#[derive(Default)]
pub struct Counters {
    pub prepare: AtomicUsize,
    pub init: AtomicUsize,
    pub reset: AtomicUsize,
}

pub struct ScriptedAgentFactory {
    script: Script,
    overrides: HashMap<String, Script>,
    failing_init: HashSet<String>,
    failing_create: HashSet<String>,
    fail_prepare: bool,
    prepare_delay: Duration,
    pub counters: Arc<Counters>,
}

impl ScriptedAgentFactory {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            overrides: HashMap::new(),
            failing_init: HashSet::new(),
            failing_create: HashSet::new(),
            fail_prepare: false,
            prepare_delay: Duration::ZERO,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_script_for(mut self, name: &str, script: Script) -> Self {
        self.overrides.insert(name.to_string(), script);
        self
    }

    pub fn failing_init(mut self, names: &[&str]) -> Self {
        self.failing_init.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn failing_create(mut self, names: &[&str]) -> Self {
        self.failing_create.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn failing_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    pub fn with_prepare_delay(mut self, delay: Duration) -> Self {
        self.prepare_delay = delay;
        self
    }

    pub fn init_calls(&self) -> usize {
        self.counters.init.load(Ordering::SeqCst)
    }

    pub fn prepare_calls(&self) -> usize {
        self.counters.prepare.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) -> usize {
        self.counters.reset.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentFactory for ScriptedAgentFactory {
    async fn prepare(&self, _options: &InitOptions) -> Result<()> {
        self.counters.prepare.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.prepare_delay).await;
        if self.fail_prepare {
            bail!("shared setup failed");
        }
        Ok(())
    }

    fn create(
        &self,
        persona: &Persona,
        _options: &InitOptions,
        sink: Arc<dyn ReplySink>,
    ) -> Result<Box<dyn ChatAgent>> {
        if self.failing_create.contains(&persona.name) {
            return Err(anyhow!("cannot build {}", persona.name));
        }
        Ok(Box::new(ScriptedAgent {
            name: persona.name.clone(),
            script: self.overrides.get(&persona.name).copied().unwrap_or(self.script),
            fail_init: self.failing_init.contains(&persona.name),
            sink,
            counters: self.counters.clone(),
        }))
    }
}

struct ScriptedAgent {
    name: String,
    script: Script,
    fail_init: bool,
    sink: Arc<dyn ReplySink>,
    counters: Arc<Counters>,
}

#[async_trait]
impl ChatAgent for ScriptedAgent {
    async fn initialize(&mut self) -> Result<()> {
        self.counters.init.fetch_add(1, Ordering::SeqCst);
        if self.fail_init {
            bail!("{} refused to start", self.name);
        }
        Ok(())
    }

    async fn submit_message(&mut self, envelope: MessageEnvelope) -> Result<()> {
        let reply = format!("{} heard {}", self.name, envelope.raw_text);
        match self.script {
            Script::Echo => self.sink.deliver(reply),
            Script::SlowEcho(delay) => {
                tokio::time::sleep(delay).await;
                self.sink.deliver(reply);
            }
            Script::Double => {
                self.sink.deliver(reply.clone());
                self.sink.deliver(format!("{} (again)", reply));
            }
            Script::Silent => {}
            Script::Fail => bail!("{} pipeline exploded", self.name),
            Script::Panic => panic!("{} lost its mind", self.name),
            Script::Hang => std::future::pending::<()>().await,
            Script::LateEcho { work, late } => {
                let sink = self.sink.clone();
                let late_reply = format!("{} late on {}", self.name, envelope.raw_text);
                tokio::spawn(async move {
                    tokio::time::sleep(late).await;
                    sink.deliver(late_reply);
                });
                tokio::time::sleep(work).await;
                self.sink.deliver(reply);
            }
        }
        Ok(())
    }

    fn supports_reset(&self) -> bool {
        true
    }

    async fn reset_history(&mut self) -> Result<()> {
        self.counters.reset.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
