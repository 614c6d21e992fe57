//! Command-line watcher for a pool of audio nodes.
//!
//! Loads a pool config, connects every node, pins the requested guilds and
//! logs everything the nodes report until Ctrl-C.
//!
//! Usage:
//!   lp-watch --config lavapool.toml --guild 1234 --guild 5678
//!   lp-watch check
//!
//! Env vars:
//!   LP_CONFIG          config path (default: lavapool.toml)
//!   LAVALINK_PASSWORD  overrides every node's password
//!   RUST_LOG           log filter (default: info,lp_node=debug)

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lp_domain::config::PoolConfig;
use lp_node::{EventHandler, GuildId, IncomingOp, NodePool, Payload};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Connect to a pool of audio nodes and watch their traffic.
#[derive(Debug, Parser)]
#[command(name = "lp-watch", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the pool config file.
    #[arg(long, env = "LP_CONFIG", default_value = "lavapool.toml", global = true)]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Guild to assign to a node once connected.  Repeatable.
    #[arg(long = "guild", global = true)]
    guilds: Vec<u64>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect and watch (default when no subcommand is given).
    Watch,
    /// Parse and validate the config, then print the resolved node list.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = load_config(&cli.config)?;

    match cli.command.unwrap_or(Command::Watch) {
        Command::Check => {
            for node in &config.nodes {
                println!(
                    "{}\tws://{}:{}\tuser_id={}\tshards={}",
                    node.display_name(),
                    node.host,
                    node.port,
                    node.user_id,
                    node.num_shards
                );
            }
            Ok(())
        }
        Command::Watch => watch(config, cli.guilds).await,
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,lp_node=debug"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<PoolConfig> {
    let mut config = PoolConfig::load(path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    if let Ok(password) = std::env::var("LAVALINK_PASSWORD") {
        config.override_password(&password);
    }
    config.validate().context("invalid pool config")?;
    Ok(config)
}

async fn watch(config: PoolConfig, guilds: Vec<u64>) -> anyhow::Result<()> {
    let pool = NodePool::from_config(&config, Arc::new(LogHandler))
        .context("building node pool")?;
    let timeout = config.connect_timeout_secs.map(Duration::from_secs);

    for (node, result) in pool.connect_all(timeout).await {
        if let Err(e) = result {
            tracing::warn!(node = %node.name(), error = %e, "initial connect failed");
        }
    }

    for guild in guilds.into_iter().map(GuildId) {
        let node = pool
            .assign_or_get(guild)
            .with_context(|| format!("assigning guild {guild}"))?;
        tracing::info!(guild = %guild, node = %node.name(), "guild pinned");
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    tracing::info!("ctrl-c received, shutting down");
    pool.shutdown_all().await;
    Ok(())
}

struct LogHandler;

impl EventHandler for LogHandler {
    fn handle(&self, op: IncomingOp, payload: Payload, _raw: &serde_json::Value) {
        match payload {
            Payload::Event(event) => {
                tracing::info!(op = %op, guild = ?event.guild_id(), event = ?event, "track event");
            }
            Payload::PlayerUpdate(update) => {
                tracing::debug!(
                    guild = ?update.guild_id,
                    position = update.state.position,
                    "player update"
                );
            }
            Payload::Stats(stats) => {
                tracing::info!(
                    players = stats.players,
                    playing = stats.playing_players,
                    cpu_load = stats.cpu.system_load,
                    "node stats"
                );
            }
        }
    }
}
