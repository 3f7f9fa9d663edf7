//! redpen: annotate a working tree and hand the notes to a coding agent.
//!
//! Entry point for the `redpen` binary. Wires together configuration
//! (`config`), the HTTP façade (`server`), the push stream (`transport`), the
//! agent hand-off (`agent`), and the feedback store and watcher from
//! `redpen-core`.
//!
//! # Startup sequence
//!
//! 1. Install the `tracing` subscriber so config problems are logged.
//! 2. Parse flags, load the TOML config, apply env and flag overrides.
//! 3. `register_sigterm()` returns `Arc<AtomicBool>` polled by the
//!    graceful-shutdown future.
//! 4. Bind the listener, then serve until SIGTERM or Ctrl-C. Open push
//!    streams are ended first so the drain does not wait on browser tabs.

mod agent;
mod config;
mod server;
mod shutdown;
mod transport;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::agent::{AgentWake, NoopWake, TmuxWake};
use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "redpen", version, about = "Review a working tree and hand feedback to a coding agent")]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/redpen/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the config file
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Review target as NAME=DIR; may be repeated
    #[arg(long = "target", value_name = "NAME=DIR", value_parser = config::parse_target_arg)]
    targets: Vec<(String, PathBuf)>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Step 1: logs go to stderr, filtered by RUST_LOG (default: info).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Step 2: layered configuration.
    let args = Args::parse();
    let path = args.config.clone().unwrap_or_else(config::config_path);
    let mut config = Config::load(&path);
    config.apply_env(|key| std::env::var(key).ok());
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    config.targets.extend(args.targets);
    let cwd = std::env::current_dir().context("cannot determine the current directory")?;
    config.finalize(&cwd);

    for (name, dir) in &config.targets {
        info!(target_name = %name, dir = %dir.display(), "review target");
    }

    // Step 3: SIGTERM flag for graceful shutdown.
    let term_flag = shutdown::register_sigterm().context("failed to register SIGTERM handler")?;

    let wake: Arc<dyn AgentWake> = if config.tmux_enabled {
        Arc::new(TmuxWake::new(config.tmux_session.clone()))
    } else {
        Arc::new(NoopWake)
    };

    // Step 4: serve.
    let bind = config.bind;
    let state = Arc::new(server::AppState::new(config, wake));
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("cannot listen on {bind}"))?;
    info!(addr = %bind, "redpen listening");

    server::serve(listener, state, shutdown::signal(term_flag))
        .await
        .context("server error")?;

    info!("redpen stopped");
    Ok(())
}
