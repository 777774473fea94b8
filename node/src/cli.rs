//! # CLI Interface
//!
//! Defines the command-line argument structure for `aurum-node` using
//! `clap` derive. Supports two subcommands: `simulate` and `version`.

use clap::{Parser, Subcommand};

/// AURUM relayer node.
///
/// Drives batch settlement rounds against the AURUM protocol core:
/// opens batches, takes simulated deposit and redemption flow, proposes
/// settlements against a reported deployment total, and executes them.
#[derive(Parser, Debug)]
#[command(
    name = "aurum-node",
    about = "AURUM protocol relayer node",
    version,
    propagate_version = true
)]
pub struct AurumNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the AURUM node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a deterministic settlement round in-process and print a
    /// JSON summary of the resulting state.
    Simulate(SimulateArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `simulate` subcommand.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Number of settlement epochs to run.
    #[arg(long, env = "AURUM_EPOCHS", default_value_t = 3)]
    pub epochs: u32,

    /// Institutional deposit per epoch, in asset units.
    #[arg(long, env = "AURUM_DEPOSIT", default_value_t = 1_000_000)]
    pub deposit: u64,

    /// Simulated yield per epoch, in basis points of the settled total.
    #[arg(long, env = "AURUM_YIELD_BPS", default_value_t = 50)]
    pub yield_bps: u64,

    /// Yield tolerance before guardian approval is required, in basis
    /// points.
    #[arg(long, env = "AURUM_TOLERANCE_BPS", default_value_t = 1_000)]
    pub tolerance_bps: u64,

    /// Emit logs as JSON lines instead of pretty-printed text.
    #[arg(long, env = "AURUM_LOG_JSON")]
    pub log_json: bool,
}
