//! Clap derive structures for `mocad`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// mocad -- MoCA interface state manager over a simulated gateway
#[derive(Debug, Parser)]
#[command(
    name = "mocad",
    version,
    about = "Run the MoCA interface state manager against a simulated gateway",
    propagate_version = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Option<Command>,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, short = 'c', env = "MOCA_CONFIG_FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve until interrupted (the default)
    Run(RunArgs),

    /// Print the effective configuration as TOML
    ShowConfig,

    /// Run one channel assessment and print its result as JSON
    Aca(AcaArgs),
}

#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    pub duration_secs: Option<u64>,
}

#[derive(Debug, Args)]
pub struct AcaArgs {
    /// Interface index
    #[arg(long, default_value_t = 0)]
    pub interface: u32,

    /// Probing node
    #[arg(long, default_value_t = 0)]
    pub node: u32,

    /// Probe type: 0 = quiet, 1 = EVM
    #[arg(long, default_value_t = 1)]
    pub probe: u32,

    /// Channel to assess
    #[arg(long)]
    pub channel: u32,

    /// Node bitmask to report on (LSB = node 0); 0 reports every node
    #[arg(long, default_value_t = 0)]
    pub report_nodes: u32,

    /// Received power the simulated hardware reports, dBm
    #[arg(long, default_value_t = -30, allow_negative_numbers = true)]
    pub rx_power: i32,
}
