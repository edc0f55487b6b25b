//! Clap derive structures for the `pushok-mqtt` binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// pushok-mqtt -- Zigbee2MQTT-style bridge for Pushok hubs
#[derive(Debug, Parser)]
#[command(
    name = "pushok-mqtt",
    version,
    about = "Bridge a Pushok Zigbee hub to an MQTT broker",
    long_about = "Mirrors every device on a Pushok hub to MQTT topics under a base topic,\n\
        publishes Home Assistant discovery, and turns MQTT commands into hub writes.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the bridge until interrupted
    Run(RunArgs),

    /// Register a new user on the hub and store its credentials
    Register(RegisterArgs),

    /// Print the config file location
    ConfigPath,
}

#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// Hub host (overrides [hub].host)
    #[arg(long)]
    pub hub_host: Option<String>,

    /// Hub port (overrides [hub].port)
    #[arg(long)]
    pub hub_port: Option<u16>,

    /// Broker host (overrides [mqtt].host)
    #[arg(long)]
    pub mqtt_host: Option<String>,

    /// Broker port (overrides [mqtt].port)
    #[arg(long)]
    pub mqtt_port: Option<u16>,

    /// Topic prefix for device topics (overrides [mqtt].base_topic)
    #[arg(long)]
    pub base_topic: Option<String>,
}

#[derive(Debug, Default, Args)]
pub struct RegisterArgs {
    /// Hub host (defaults to [hub].host)
    #[arg(long)]
    pub host: Option<String>,

    /// Hub port (defaults to [hub].port)
    #[arg(long)]
    pub port: Option<u16>,

    /// Connect over wss://
    #[arg(long)]
    pub ssl: bool,

    /// Store the private key in the config file instead of the keyring
    #[arg(long)]
    pub plaintext: bool,
}
