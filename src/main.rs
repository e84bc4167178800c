//! xcp - zero-configuration, name-addressed text relay
//!
//! This is the main entry point for the xcp binary.
//! The process probes the local network for the manager of a named session,
//! then either follows it or becomes the manager itself, relaying every line
//! typed on stdin to all other participants.

mod cli;
mod config;
mod discovery;
mod error;
mod logging;
mod node;
mod relay;
mod session;
mod version;

use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use crate::cli::{Cli, Commands, ConfigSubcommand, JoinArgs};
use crate::config::XcpConfig;
use crate::error::{Error, Result};
use crate::node::{Exit, Node, NodeOptions};
use crate::session::resolve_name;

/// Grace period for runtime shutdown; the blocking stdin reader never finishes on its own
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

fn main() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    // Maintenance commands use minimal logging
    match &cli.command {
        Some(Commands::Version) => {
            print!("{}", version::report());
            return Ok(());
        }
        Some(Commands::Config { subcommand }) => {
            logging::init_simple(tracing::Level::WARN)?;
            if let Err(e) = handle_config_command(subcommand.clone()) {
                exit_with(e);
            }
            return Ok(());
        }
        None => {}
    }

    let config = match load_config(&cli.join) {
        Ok(cfg) => cfg,
        Err(e) => exit_with(e),
    };

    // The guards must be kept alive for the lifetime of the program
    let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    info!(
        version = version::VERSION,
        target = version::TARGET,
        profile = version::PROFILE,
        host = %host_name(),
        "Starting xcp"
    );

    if let Err(e) = run_session(config, cli.quiet) {
        if e.is_fatal() {
            error!(error = %e.format_for_log(), "Session failed");
        } else {
            warn!(error = %e.format_for_log(), "Session ended with an error");
        }
        exit_with(e);
    }

    Ok(())
}

/// Load file and environment settings, then apply command-line overrides
fn load_config(join: &JoinArgs) -> Result<XcpConfig> {
    let mut config = XcpConfig::load(join.config.as_deref())?;
    config.apply_cli(&join.overrides())?;
    Ok(config)
}

/// Report an error on the terminal and exit with its category code
fn exit_with(e: Error) -> ! {
    eprint!("{}", e.format_for_terminal());
    std::process::exit(e.exit_code());
}

fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Join the configured session until the console ends or Ctrl+C
fn run_session(config: XcpConfig, quiet: bool) -> Result<()> {
    let session = resolve_name(config.session.name.as_deref())?;
    let mut options = config.node_options(session);
    options.announce = !quiet;

    info!(
        session = %options.session,
        group = %config.group_addr(),
        relay_port = config.relay.port,
        timeout_ms = config.discovery.timeout_ms,
        settle_check = config.discovery.settle_check,
        "Configuration loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().clamp(2, 4))
        .thread_name("xcp")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    let result = runtime.block_on(async_main(options));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    result
}

async fn async_main(options: NodeOptions) -> Result<()> {
    let announce = options.announce;
    let node = Node::new(options);
    let session = node.session().clone();

    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    tokio::select! {
        exit = node.run(relay::stdio()) => {
            match exit? {
                Exit::ConsoleClosed => info!(session = %session, "Input closed, leaving session"),
                Exit::ManagerGone => info!(session = %session, "Manager went away, leaving session"),
            }
        }
        _ = &mut shutdown_signal => {
            info!("Shutdown signal received");
            if announce {
                eprintln!("\nClosing the client and server [{}].", session);
            }
        }
    }

    Ok(())
}

fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = XcpConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration file created: {}", written.display());
        }
        ConfigSubcommand::Validate { config } => match XcpConfig::load(config.as_deref()) {
            Ok(_) => {
                println!("Configuration is valid.");
            }
            Err(e) => exit_with(e),
        },
    }

    Ok(())
}
