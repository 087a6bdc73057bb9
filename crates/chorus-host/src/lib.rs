//! chorus-host - Synchronous boundary for hosts that cannot await
//!
//! The free functions below drive one process-wide [`Host`], created on first
//! use. Every result is a boolean or a JSON string; errors never cross this
//! boundary as panics.

pub mod host;
pub mod options;

use std::sync::OnceLock;

use tracing::error;

pub use host::Host;
pub use options::{HostOptions, resolve_init_options};

static HOST: OnceLock<Option<Host>> = OnceLock::new();

fn global() -> Option<&'static Host> {
    HOST.get_or_init(|| match Host::start() {
        Ok(host) => Some(host),
        Err(e) => {
            error!("Failed to start chorus host: {:#}", e);
            None
        }
    })
    .as_ref()
}

/// Build the agent pool; `false` on any failure
pub fn initialize_bots(credential: &str, count: usize, config_json: &str) -> bool {
    global().is_some_and(|host| host.initialize(credential, count, config_json))
}

pub fn list_agents() -> String {
    global().map_or_else(|| "[]".to_string(), Host::list_agents)
}

pub fn submit(message: &str, sender_name: &str) -> bool {
    global().is_some_and(|host| host.submit(message, sender_name))
}

pub fn submit_blocking(message: &str, sender_name: &str) -> String {
    global().map_or_else(
        || "[]".to_string(),
        |host| host.submit_blocking(message, sender_name),
    )
}

pub fn pending_replies() -> String {
    global().map_or_else(|| "[]".to_string(), Host::pending_replies)
}

pub fn reset_all() -> bool {
    global().is_some_and(Host::reset_all)
}

pub fn set_reply_callback<F>(callback: F)
where
    F: Fn(&str) + Send + Sync + 'static,
{
    if let Some(host) = global() {
        host.set_reply_callback(callback);
    }
}

pub fn clear_reply_callback() {
    if let Some(host) = global() {
        host.clear_reply_callback();
    }
}

/// Tear down the pool and stop the worker; the process-wide host stays
/// stopped afterwards
pub fn shutdown() {
    if let Some(Some(host)) = HOST.get() {
        host.shutdown();
    }
}
