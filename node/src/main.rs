//! # AURUM Relayer Node
//!
//! Entry point for the `aurum-node` binary. Parses CLI arguments,
//! initializes logging, and drives settlement rounds against an
//! in-process protocol engine.
//!
//! The binary supports two subcommands:
//!
//! - `simulate` — run deterministic settlement epochs and print a JSON
//!   summary
//! - `version`  — print build version information

mod cli;
mod logging;

use anyhow::Result;
use clap::Parser;
use serde::Serialize;

use aurum_protocol::config::{EngineConfig, DEFAULT_BATCH_CAP};
use aurum_protocol::external::{InMemoryToken, RecordingStrategy, Role, StaticRoles, TokenBackend};
use aurum_protocol::gateway::InstitutionalGateway;
use aurum_protocol::id::AssetId;
use aurum_protocol::settlement::engine::{SettlementEngine, VaultKind};
use aurum_protocol::settlement::proposal::FeeSnapshot;
use aurum_protocol::vault::RetailVault;

use cli::{AurumNodeCli, Commands};
use logging::LogFormat;

const ADMIN: &str = "aurum:admin";
const RELAYER: &str = "aurum:relayer";
const GUARDIAN: &str = "aurum:guardian";
const INSTITUTION: &str = "acme-capital";
const RETAIL_USER: &str = "rita";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = AurumNodeCli::parse();

    match cli.command {
        Commands::Simulate(args) => simulate(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Per-epoch figures captured for the summary.
#[derive(Debug, Serialize)]
struct EpochReport {
    epoch: u32,
    reserve_reported_total: u64,
    reserve_yield: i128,
    required_approval: bool,
    retail_reported_total: u64,
    token_supply: u64,
    total_attributed: u64,
}

/// Final state printed as JSON on stdout.
#[derive(Debug, Serialize)]
struct SimulationSummary {
    epochs: Vec<EpochReport>,
    final_token_supply: u64,
    reserve_virtual_balance: u64,
    retail_virtual_balance: u64,
    retail_share_supply: u64,
    retail_user_shares: u64,
    backing_intact: bool,
}

/// Runs `epochs` settlement rounds: institutional deposits and
/// redemptions against the reserve vault, retail stakes against the
/// share vault, each settled with a simulated yield.
fn simulate(args: cli::SimulateArgs) -> Result<()> {
    let format = if args.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    logging::init_logging("aurum_node=info,aurum_protocol=info", format);

    tracing::info!(
        epochs = args.epochs,
        deposit = args.deposit,
        yield_bps = args.yield_bps,
        tolerance_bps = args.tolerance_bps,
        "starting settlement simulation"
    );

    let mut roles = StaticRoles::new();
    roles.grant(ADMIN, Role::Admin);
    roles.grant(RELAYER, Role::Relayer);
    roles.grant(GUARDIAN, Role::Guardian);
    // Zero cooldown: the simulation settles in-process, with no window
    // for off-band review.
    let config = EngineConfig::new(args.tolerance_bps, 0)?;
    let mut engine =
        SettlementEngine::new(config, InMemoryToken::new(), roles, RecordingStrategy::new());

    let asset = AssetId::derive("aUSD", "aurum:issuer");
    let reserve = engine.register_vault(
        ADMIN,
        "treasury",
        asset,
        VaultKind::AssetBacked,
        DEFAULT_BATCH_CAP,
    )?;
    let retail_id = engine.register_vault(
        ADMIN,
        "retail",
        asset,
        VaultKind::ShareBased,
        DEFAULT_BATCH_CAP,
    )?;
    let gateway = InstitutionalGateway::new(reserve);
    let mut retail = RetailVault::new(retail_id);

    let stake_per_epoch = args.deposit / 10;
    let mut reports = Vec::new();

    for epoch in 1..=args.epochs {
        // --- Reserve epoch: deposit, partial redemption, settle ---
        let batch = engine.create_batch(RELAYER, reserve)?;
        gateway.deposit(&mut engine, INSTITUTION, INSTITUTION, args.deposit)?;
        // A slice of fresh capital is earmarked for the retail user.
        gateway.deposit(&mut engine, INSTITUTION, RETAIL_USER, stake_per_epoch)?;
        let redemption =
            gateway.request_redemption(&mut engine, INSTITUTION, INSTITUTION, args.deposit / 4)?;
        engine.close_batch(RELAYER, batch, false)?;

        let last = engine.virtual_balance(&reserve) - args.deposit - stake_per_epoch;
        let netted = (args.deposit + stake_per_epoch - args.deposit / 4) as i128;
        let yield_delta =
            ((last as u128) * (args.yield_bps as u128) / 10_000u128) as i128;
        let reported = (last as i128 + netted + yield_delta) as u64;

        let pid = engine.propose_settlement(RELAYER, batch, reported, FeeSnapshot::none())?;
        let required_approval = engine.proposal(&pid)?.requires_approval;
        if required_approval {
            engine.accept_proposal(GUARDIAN, pid)?;
        }
        engine.execute_settlement(pid)?;
        gateway.claim(&mut engine, INSTITUTION, redemption)?;

        // --- Retail epoch: stake everything rita holds ---
        let retail_batch = engine.create_batch(RELAYER, retail_id)?;
        let wallet = engine.tokens().balance_of(RETAIL_USER);
        let stake = retail.stake(&mut engine, RETAIL_USER, RETAIL_USER, wallet)?;
        engine.close_batch(RELAYER, retail_batch, false)?;

        let retail_last = engine.virtual_balance(&retail_id) - wallet;
        let retail_yield =
            ((retail_last as u128) * (args.yield_bps as u128) / 10_000u128) as u64;
        let retail_reported = retail_last + retail_yield + wallet;
        let retail_pid = engine.propose_settlement(
            RELAYER,
            retail_batch,
            retail_reported,
            FeeSnapshot::none(),
        )?;
        if engine.proposal(&retail_pid)?.requires_approval {
            engine.accept_proposal(GUARDIAN, retail_pid)?;
        }
        engine.execute_settlement(retail_pid)?;
        retail.claim(&mut engine, RETAIL_USER, stake)?;

        let report = EpochReport {
            epoch,
            reserve_reported_total: reported,
            reserve_yield: yield_delta,
            required_approval,
            retail_reported_total: retail_reported,
            token_supply: engine.tokens().total_supply(),
            total_attributed: engine.total_attributed(&asset),
        };
        tracing::info!(
            epoch,
            token_supply = report.token_supply,
            total_attributed = report.total_attributed,
            "epoch settled"
        );
        reports.push(report);
    }

    let backing_intact = engine.total_attributed(&asset) == engine.tokens().total_supply();
    let summary = SimulationSummary {
        final_token_supply: engine.tokens().total_supply(),
        reserve_virtual_balance: engine.virtual_balance(&reserve),
        retail_virtual_balance: engine.virtual_balance(&retail_id),
        retail_share_supply: engine
            .ledger()
            .entry(&retail_id, &asset)
            .map(|e| e.share_supply)
            .unwrap_or(0),
        retail_user_shares: retail.shares_of(RETAIL_USER),
        backing_intact,
        epochs: reports,
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if !backing_intact {
        anyhow::bail!("backing invariant violated after simulation");
    }
    Ok(())
}

fn print_version() {
    println!("aurum-node {}", env!("CARGO_PKG_VERSION"));
}
