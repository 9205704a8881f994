use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "rotor", about = "Local HTTP proxy that rotates through a pool of Tor circuits")]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the backend pool and serve the proxy until Ctrl-C
    Run(RunArgs),
    /// Ask a running proxy to switch to the next circuit
    Rotate(RotateArgs),
    /// Print the configured pool layout without starting anything
    Status(StatusArgs),
    /// Check that the backend binary, proxy port and config are usable
    Check,
    /// Manage rotor configuration
    Config(ConfigArgs),
}

#[derive(Args, Default)]
pub struct RunArgs {
    /// Proxy listening port (overrides [proxy].bind_addr's port)
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Number of backend instances
    #[arg(long, value_name = "N")]
    pub pool_size: Option<usize>,

    /// Path to the backend binary
    #[arg(long, value_name = "PATH")]
    pub backend: Option<PathBuf>,

    /// Rotate automatically every SECS seconds (0 disables)
    #[arg(long, value_name = "SECS")]
    pub auto_rotate: Option<u64>,

    /// Log per-circuit identity and readiness every SECS seconds (0 disables)
    #[arg(long, value_name = "SECS", default_value_t = 0)]
    pub status_interval: u64,

    /// Load an additional config file on top of defaults
    #[arg(long = "config", value_name = "PATH")]
    pub extra_config: Option<PathBuf>,

    /// Ignore all config files; use only CLI flags
    #[arg(long)]
    pub no_config: bool,
}

#[derive(Args)]
pub struct RotateArgs {
    /// Address of the running proxy (defaults to the configured bind address)
    #[arg(long, value_name = "ADDR")]
    pub addr: Option<SocketAddr>,
}

#[derive(Args)]
pub struct StatusArgs {
    /// Number of backend instances
    #[arg(long, value_name = "N")]
    pub pool_size: Option<usize>,

    /// Ignore all config files
    #[arg(long)]
    pub no_config: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub subcommand: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Write a starter config file
    Init {
        #[arg(long)]
        global: bool,
    },
    /// Print the effective merged configuration
    Show {
        #[arg(long, value_enum, default_value = "toml")]
        format: OutputFormat,
    },
    /// Open config in $EDITOR
    Edit {
        #[arg(long)]
        global: bool,
    },
}

#[derive(ValueEnum, Clone, Copy)]
pub enum OutputFormat {
    Toml,
    Json,
}
