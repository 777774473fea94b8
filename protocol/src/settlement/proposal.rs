//! # Settlement Proposals
//!
//! A proposal is the immutable record of one settlement computation
//! awaiting execution: the reported external total, the netted flow and
//! yield derived from it, and the review gates (cooldown, optional
//! guardian approval) that must clear before anyone may execute it.
//!
//! The lifecycle is an explicit state machine with timestamps:
//!
//! ```text
//! Pending ──accept──▶ Accepted ──execute──▶ Executed (terminal)
//!    │                    │
//!    └──────cancel────────┴─────▶ Cancelled (terminal)
//! ```
//!
//! A proposal that does not require approval may go straight from
//! `Pending` to `Executed` once its cooldown elapses. Exactly one
//! outcome per proposal -- never executed twice, never revived after
//! cancellation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{AssetId, BatchId, ProposalId, VaultId};
use crate::settlement::batch::SettlementSnapshot;

/// Review state of a settlement proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    /// Created; waiting out the cooldown (and approval, if required).
    Pending,
    /// Guardian has signed off on an out-of-tolerance yield.
    Accepted,
    /// Settlement applied. Terminal.
    Executed,
    /// Guardian withdrew the proposal before execution. Terminal.
    Cancelled,
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProposalStatus::Pending => write!(f, "Pending"),
            ProposalStatus::Accepted => write!(f, "Accepted"),
            ProposalStatus::Executed => write!(f, "Executed"),
            ProposalStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// The fee figures the engine consumes at settlement time. Fee-curve
/// bookkeeping lives outside the core; only the totals land here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSnapshot {
    /// Total fees owed at settlement time, in asset units. Deducted
    /// from the reported total before netting and yield isolation.
    pub accrued: u64,
    /// When management fees were last charged.
    pub management_charged_at: DateTime<Utc>,
    /// When performance fees were last charged.
    pub performance_charged_at: DateTime<Utc>,
}

impl FeeSnapshot {
    /// A zero-fee snapshot stamped now. Used by deployments that charge
    /// fees out of band and by tests.
    pub fn none() -> Self {
        let now = Utc::now();
        Self {
            accrued: 0,
            management_charged_at: now,
            performance_charged_at: now,
        }
    }
}

/// One settlement computation pending execution.
///
/// All derived figures (`netted`, `yield_delta`, `requires_approval`,
/// `execute_after`) are fixed at creation; only the status and its
/// timestamps move afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementProposal {
    /// Unique identifier.
    pub id: ProposalId,
    /// The asset being settled.
    pub asset: AssetId,
    /// The vault being settled.
    pub vault: VaultId,
    /// The closed batch this proposal settles.
    pub batch_id: BatchId,
    /// External deployment total reported by the relayer, gross of fees.
    pub reported_total_assets: u64,
    /// Fee figures snapshotted at proposal time.
    pub fee_snapshot: FeeSnapshot,
    /// Deposits minus redemptions for the batch (signed).
    pub netted: i128,
    /// Performance isolated from principal flows (signed).
    pub yield_delta: i128,
    /// Claim-pricing figures frozen at proposal time and copied onto
    /// the batch at execution.
    pub snapshot: SettlementSnapshot,
    /// Set when `|yield_delta|` exceeded the configured tolerance;
    /// blocks execution until a guardian accepts.
    pub requires_approval: bool,
    /// Earliest instant at which execution is permitted. A minimum
    /// wait, not a deadline -- proposals never expire.
    pub execute_after: DateTime<Utc>,
    /// Current review state.
    pub status: ProposalStatus,
    /// Timestamp when the proposal was created.
    pub created_at: DateTime<Utc>,
    /// Timestamp of guardian acceptance, if any.
    pub accepted_at: Option<DateTime<Utc>>,
    /// Timestamp of execution, if any.
    pub executed_at: Option<DateTime<Utc>>,
    /// Timestamp of cancellation, if any.
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl SettlementProposal {
    /// `true` while the proposal still holds its batch: neither
    /// executed nor cancelled.
    pub fn is_live(&self) -> bool {
        matches!(self.status, ProposalStatus::Pending | ProposalStatus::Accepted)
    }

    /// `true` once every execution gate has cleared at instant `now`:
    /// live, cooled down, and approved when approval is required.
    pub fn executable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_live()
            && now >= self.execute_after
            && (!self.requires_approval || self.status == ProposalStatus::Accepted)
    }
}
