//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for xcp. A bare invocation joins a
//! session; `version` and `config` are maintenance subcommands.

use std::net::Ipv4Addr;

use clap::{Args, Parser, Subcommand};

use crate::config::CliOverrides;

/// xcp - zero-configuration text relay for the local network
///
/// Joins the named session (a random name if omitted). The first process for
/// a name becomes its manager; later ones attach to it. Lines typed on stdin
/// reach every other participant; their lines are printed on stdout.
#[derive(Parser, Debug)]
#[command(name = "xcp")]
#[command(author, version = crate::version::VERSION, about, long_about = None)]
#[command(propagate_version = true)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(flatten)]
    pub join: JoinArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Options for joining a session
#[derive(Args, Debug, Clone, Default)]
pub struct JoinArgs {
    /// Session name to join or create
    pub name: Option<String>,

    /// Port for both the relay server and discovery
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Discovery group address (a unicast address disables multicast)
    #[arg(long)]
    pub group: Option<Ipv4Addr>,

    /// Local IPv4 address to probe from and advertise
    #[arg(long)]
    pub interface: Option<Ipv4Addr>,

    /// How long to wait for an existing manager, in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

impl JoinArgs {
    /// Settings that override the configuration file and environment
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            session: self.name.clone(),
            port: self.port,
            group: self.group,
            interface: self.interface,
            timeout_ms: self.timeout_ms,
        }
    }
}

/// Maintenance commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Display version, commit and build target
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}
