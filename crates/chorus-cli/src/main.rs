use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use chorus_core::{AgentIdentity, ReplyRecord};
use config::ChorusConfig;

#[derive(Parser)]
#[command(name = "chorus")]
#[command(version)]
#[command(about = "Chorus - a group chat with a room full of AI personas")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the room interactively
    Chat {
        /// Name the agents see you as
        #[arg(short, long, default_value = "user")]
        name: String,
    },

    /// Send one message and wait for every agent to answer
    Ask {
        /// The message to send
        message: String,

        #[arg(short, long, default_value = "user")]
        name: String,
    },

    /// List the agents that joined the room
    Agents,

    /// Initialize config directory and default config
    Init,

    /// Show current configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(io::stderr)
        .init();

    let result = match cli.command {
        Commands::Init => cmd_init(),
        Commands::Config => cmd_config(&cli.config),
        Commands::Agents => cmd_agents(&cli.config),
        Commands::Ask { message, name } => cmd_ask(&cli.config, &message, &name),
        Commands::Chat { name } => cmd_chat(&cli.config, &name),
    };
    chorus_host::shutdown();
    result
}

fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config::default_config_path();
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        std::fs::write(&config_path, default_config)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))?;
        }
        info!("Created default config at {}", config_path.display());
    }

    println!("Chorus initialized at {}", config_dir.display());
    println!("Edit {} to configure your API key.", config_path.display());
    Ok(())
}

fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ChorusConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg.redacted())?);
    Ok(())
}

/// Load config and bring the room up
fn start_bridge(config_path: &Option<PathBuf>) -> Result<ChorusConfig> {
    let cfg = ChorusConfig::load(config_path)?;
    debug!("Loaded config: {:?}", cfg);

    if !chorus_host::initialize_bots(
        &cfg.provider.api_key,
        cfg.bridge.agent_count,
        &cfg.host_options_json(),
    ) {
        bail!("Failed to start the agents. Check the API key and provider settings (run with --debug for details).");
    }
    Ok(cfg)
}

fn parse_agents(json: &str) -> Result<Vec<AgentIdentity>> {
    serde_json::from_str(json).context("Host returned malformed agent list")
}

fn parse_replies(json: &str) -> Result<Vec<ReplyRecord>> {
    serde_json::from_str(json).context("Host returned malformed replies")
}

fn print_reply(record: &ReplyRecord) {
    println!(
        "[{}] {}: {}",
        record.timestamp.format("%H:%M:%S"),
        record.agent_name,
        record.content
    );
}

fn cmd_agents(config_path: &Option<PathBuf>) -> Result<()> {
    start_bridge(config_path)?;
    for agent in parse_agents(&chorus_host::list_agents())? {
        println!("{:<8} {:<10} {}", agent.id, agent.name, agent.color);
    }
    Ok(())
}

fn cmd_ask(config_path: &Option<PathBuf>, message: &str, name: &str) -> Result<()> {
    start_bridge(config_path)?;
    let replies = parse_replies(&chorus_host::submit_blocking(message, name))?;
    if replies.is_empty() {
        println!("(nobody replied)");
    }
    for record in &replies {
        print_reply(record);
    }
    Ok(())
}

fn cmd_chat(config_path: &Option<PathBuf>, name: &str) -> Result<()> {
    let cfg = start_bridge(config_path)?;

    let agents = parse_agents(&chorus_host::list_agents())?;
    let names: Vec<&str> = agents.iter().map(|a| a.name.as_str()).collect();
    println!("In the room: {}", names.join(", "));
    println!("Commands: /agents, /reset, /quit\n");

    let stop = Arc::new(AtomicBool::new(false));
    let poller = {
        let stop = stop.clone();
        let interval = Duration::from_millis(cfg.bridge.poll_interval_ms.max(10));
        std::thread::Builder::new()
            .name("chorus-poll".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    match parse_replies(&chorus_host::pending_replies()) {
                        Ok(replies) => replies.iter().for_each(print_reply),
                        Err(e) => warn!("{:#}", e),
                    }
                    std::thread::sleep(interval);
                }
            })
            .context("Failed to spawn reply poller")?
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        match line {
            "" => {}
            "/quit" | "/exit" => break,
            "/agents" => {
                for agent in parse_agents(&chorus_host::list_agents())? {
                    println!("  {} ({})", agent.name, agent.id);
                }
            }
            "/reset" => {
                if chorus_host::reset_all() {
                    println!("(everyone forgot the conversation)");
                } else {
                    println!("(reset failed)");
                }
            }
            message => {
                if !chorus_host::submit(message, name) {
                    warn!("Message was not delivered");
                }
            }
        }
        stdout.flush()?;
    }

    stop.store(true, Ordering::Relaxed);
    if poller.join().is_err() {
        warn!("Reply poller panicked");
    }
    // anything that arrived after the last poll
    for record in &parse_replies(&chorus_host::pending_replies())? {
        print_reply(record);
    }
    Ok(())
}
