//! # Settlement Engine
//!
//! The orchestrator that ties the batch book, the virtual balance
//! ledger, and the request registry together and drives the two-phase
//! settlement flow:
//!
//! 1. A relayer proposes a settlement for a CLOSED batch, reporting the
//!    externally observed deployment total. The engine nets the batch's
//!    flows, isolates yield, and gates the proposal behind a cooldown
//!    (and guardian approval when the yield exceeds tolerance).
//! 2. Anyone executes the proposal once its gates clear. Execution
//!    moves tokens, updates attribution, freezes the claim-pricing
//!    snapshot, and marks the batch SETTLED.
//!
//! The engine is generic over its collaborators so deployments can swap
//! the token backend, the role authority, and the strategy recorder
//! without touching settlement logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{EngineConfig, BPS_DENOMINATOR};
use crate::external::{Role, RoleAuthority, StrategyRecorder, TokenBackend, TokenError};
use crate::id::{AssetId, BatchId, ProposalId, RequestId, VaultId};
use crate::registry::{Request, RequestError, RequestKind, RequestRegistry};
use crate::settlement::batch::{
    Batch, BatchBook, BatchError, BatchState, BatchTotal, SettlementSnapshot,
};
use crate::settlement::ledger::{BatchFlows, LedgerError, ShareFlow, VirtualBalanceLedger};
use crate::settlement::proposal::{FeeSnapshot, ProposalStatus, SettlementProposal};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The actor does not hold the role the operation requires.
    #[error("{actor} lacks the {role} role")]
    Unauthorized {
        /// The address that attempted the operation.
        actor: String,
        /// The role it was missing.
        role: Role,
    },

    /// The referenced vault is not registered.
    #[error("unknown vault: {0}")]
    UnknownVault(VaultId),

    /// A vault with this id is already registered.
    #[error("vault already registered: {0}")]
    VaultExists(VaultId),

    /// The asset already has an asset-backed reserve vault.
    #[error("asset {0} already has a reserve vault")]
    ReserveExists(AssetId),

    /// A share vault cannot register before the asset's reserve vault.
    #[error("asset {0} has no reserve vault")]
    NoReserve(AssetId),

    /// The vault has no ACTIVE batch to take the request.
    #[error("no active batch for vault {0}")]
    NoActiveBatch(VaultId),

    /// Zero-amount requests are rejected outright.
    #[error("request amount must be positive")]
    ZeroAmount,

    /// The operation targets the wrong kind of vault.
    #[error("operation requires a {expected} vault")]
    WrongVaultKind {
        /// The kind the operation is defined for.
        expected: VaultKind,
    },

    /// Accepting the request would push a batch total past the cap.
    #[error("batch cap exceeded: cap {cap}, request would reach {attempted}")]
    BatchCapExceeded {
        /// The configured per-batch cap.
        cap: u64,
        /// The total the request would have produced.
        attempted: u64,
    },

    /// An unstake request exceeds the shares still outstanding.
    #[error("insufficient shares: {available} available, {requested} requested")]
    InsufficientShares {
        /// Shares not yet queued for exit.
        available: u64,
        /// Shares the request tried to queue.
        requested: u64,
    },

    /// The batch already has a live (pending or accepted) proposal.
    #[error("batch {0} already has a live proposal")]
    LiveProposalExists(BatchId),

    /// The referenced proposal does not exist.
    #[error("unknown proposal: {0}")]
    UnknownProposal(ProposalId),

    /// The proposal reached a terminal state and cannot move again.
    #[error("proposal {id} is {status}")]
    ProposalNotLive {
        /// The proposal in question.
        id: ProposalId,
        /// Its terminal status.
        status: ProposalStatus,
    },

    /// A guardian already accepted this proposal.
    #[error("proposal {0} already accepted")]
    AlreadyAccepted(ProposalId),

    /// The proposal's approval gate was not set, so there is nothing
    /// for a guardian to accept.
    #[error("proposal {0} does not require approval")]
    ApprovalNotRequired(ProposalId),

    /// The proposal's cooldown has not elapsed yet.
    #[error("cooldown active until {execute_after}")]
    CooldownActive {
        /// Earliest permitted execution instant.
        execute_after: DateTime<Utc>,
    },

    /// The proposal's yield breached tolerance and no guardian has
    /// accepted it.
    #[error("proposal {0} requires guardian approval")]
    ApprovalRequired(ProposalId),

    /// The reported total cannot even cover the accrued fees.
    #[error("accrued fees {accrued} exceed reported total {reported}")]
    FeesExceedReported {
        /// The relayer-reported gross total.
        reported: u64,
        /// The fees claimed against it.
        accrued: u64,
    },

    /// Every outstanding share is queued for exit; the share-pricing
    /// denominator would vanish.
    #[error("cannot settle a full share exit for vault {0}")]
    FullShareExit(VaultId),

    /// The reported total cannot cover the vault's liabilities.
    #[error("vault {0} is insolvent: liabilities exceed reported assets")]
    InsolventVault(VaultId),

    /// The batch escrow does not hold what settlement or a claim needs.
    /// Invariant-threatening; the whole operation aborts.
    #[error("escrow shortfall for batch {batch}: {available} available, {required} required")]
    EscrowShortfall {
        /// The batch whose escrow fell short.
        batch: BatchId,
        /// What the escrow holds.
        available: u64,
        /// What the operation needed.
        required: u64,
    },

    /// A settlement figure left u64 range.
    #[error("settlement arithmetic overflow")]
    AmountOverflow,

    /// The request's batch has not settled yet, so no claim pricing
    /// exists.
    #[error("batch {0} is not settled")]
    BatchNotSettled(BatchId),

    /// Batch state machine violation.
    #[error(transparent)]
    Batch(#[from] BatchError),

    /// Virtual balance ledger failure.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Request registry failure.
    #[error(transparent)]
    Registry(#[from] RequestError),

    /// Token backend failure.
    #[error(transparent)]
    Token(#[from] TokenError),
}

// ---------------------------------------------------------------------------
// Vault registration
// ---------------------------------------------------------------------------

/// How a vault accounts for its depositors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VaultKind {
    /// Institutional gateway vault: deposits mint tokens 1:1 and
    /// redemptions burn them. One per asset; it is the asset's reserve,
    /// the attribution counterparty for every share vault.
    AssetBacked,
    /// Retail vault: deposits buy shares priced off settled net assets.
    ShareBased,
}

impl std::fmt::Display for VaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VaultKind::AssetBacked => write!(f, "asset-backed"),
            VaultKind::ShareBased => write!(f, "share-based"),
        }
    }
}

/// Registration record for a vault.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VaultProfile {
    /// The asset the vault is denominated in.
    pub asset: AssetId,
    /// The vault's accounting model.
    pub kind: VaultKind,
    /// Per-batch gross cap on the vault's primary inflow/outflow
    /// totals. [`crate::config::DEFAULT_BATCH_CAP`] means uncapped.
    pub batch_cap: u64,
}

/// What a successful claim delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimOutcome {
    /// The request that was claimed.
    pub request: RequestId,
    /// The request's kind.
    pub kind: RequestKind,
    /// Output amount: asset units for Burn/Unstake, shares for Stake.
    pub amount: u64,
}

// ---------------------------------------------------------------------------
// SettlementEngine
// ---------------------------------------------------------------------------

/// The settlement orchestrator. Owns all protocol state and the three
/// collaborator seams.
pub struct SettlementEngine<T, A, R> {
    config: EngineConfig,
    batches: BatchBook,
    ledger: VirtualBalanceLedger,
    registry: RequestRegistry,
    proposals: HashMap<ProposalId, SettlementProposal>,
    live_proposals: HashMap<BatchId, ProposalId>,
    /// Off-system principal claimable per settled batch, in asset
    /// units. Funded when an asset-backed settlement burns escrowed
    /// tokens; drawn down by Burn claims.
    principal_escrow: HashMap<BatchId, u64>,
    /// Fees deducted from reported totals but not yet collected by the
    /// operator, per asset. Deployed capital equals token supply plus
    /// this figure.
    uncharged_fees: HashMap<AssetId, u64>,
    vaults: HashMap<VaultId, VaultProfile>,
    reserves: HashMap<AssetId, VaultId>,
    tokens: T,
    roles: A,
    recorder: R,
}

impl<T, A, R> SettlementEngine<T, A, R>
where
    T: TokenBackend,
    A: RoleAuthority,
    R: StrategyRecorder,
{
    /// Creates an engine with empty state around the given
    /// collaborators.
    pub fn new(config: EngineConfig, tokens: T, roles: A, recorder: R) -> Self {
        Self {
            config,
            batches: BatchBook::new(),
            ledger: VirtualBalanceLedger::new(),
            registry: RequestRegistry::new(),
            proposals: HashMap::new(),
            live_proposals: HashMap::new(),
            principal_escrow: HashMap::new(),
            uncharged_fees: HashMap::new(),
            vaults: HashMap::new(),
            reserves: HashMap::new(),
            tokens,
            roles,
            recorder,
        }
    }

    fn require_role(&self, actor: &str, role: Role) -> Result<(), EngineError> {
        if self.roles.has_role(actor, role) {
            Ok(())
        } else {
            Err(EngineError::Unauthorized {
                actor: actor.to_string(),
                role,
            })
        }
    }

    fn profile(&self, vault: &VaultId) -> Result<VaultProfile, EngineError> {
        self.vaults
            .get(vault)
            .copied()
            .ok_or(EngineError::UnknownVault(*vault))
    }

    // -----------------------------------------------------------------------
    // Administration
    // -----------------------------------------------------------------------

    /// Registers a vault under `name` for `asset`. Asset-backed vaults
    /// become the asset's reserve; share vaults require the reserve to
    /// exist first, since their settlements move attribution against
    /// it.
    pub fn register_vault(
        &mut self,
        actor: &str,
        name: &str,
        asset: AssetId,
        kind: VaultKind,
        batch_cap: u64,
    ) -> Result<VaultId, EngineError> {
        self.require_role(actor, Role::Admin)?;

        let vault = VaultId::derive(name, &asset);
        if self.vaults.contains_key(&vault) {
            return Err(EngineError::VaultExists(vault));
        }
        match kind {
            VaultKind::AssetBacked => {
                if self.reserves.contains_key(&asset) {
                    return Err(EngineError::ReserveExists(asset));
                }
                self.reserves.insert(asset, vault);
            }
            VaultKind::ShareBased => {
                if !self.reserves.contains_key(&asset) {
                    return Err(EngineError::NoReserve(asset));
                }
            }
        }

        self.vaults.insert(
            vault,
            VaultProfile {
                asset,
                kind,
                batch_cap,
            },
        );
        self.ledger.open_entry(vault, asset);

        info!(%vault, %asset, %kind, batch_cap, "vault registered");
        Ok(vault)
    }

    /// Replaces the engine configuration. Applies to proposals created
    /// afterwards; live proposals keep the gates they were created
    /// with.
    pub fn set_config(&mut self, actor: &str, config: EngineConfig) -> Result<(), EngineError> {
        self.require_role(actor, Role::Admin)?;
        info!(
            yield_tolerance_bps = config.yield_tolerance_bps,
            cooldown_secs = config.cooldown_secs,
            "engine configuration updated"
        );
        self.config = config;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Batch lifecycle
    // -----------------------------------------------------------------------

    /// Opens a fresh ACTIVE batch for the vault.
    pub fn create_batch(&mut self, actor: &str, vault: VaultId) -> Result<BatchId, EngineError> {
        self.require_role(actor, Role::Relayer)?;
        let profile = self.profile(&vault)?;
        let id = self.batches.create(vault, profile.asset)?;
        info!(batch = %id, %vault, "batch opened");
        Ok(id)
    }

    /// Closes the batch to new requests. With `open_next`, the
    /// successor opens in the same call.
    pub fn close_batch(
        &mut self,
        actor: &str,
        batch_id: BatchId,
        open_next: bool,
    ) -> Result<Option<BatchId>, EngineError> {
        self.require_role(actor, Role::Relayer)?;
        let next = self.batches.close(batch_id, open_next)?;
        info!(batch = %batch_id, next = ?next.map(|id| id.to_hex()), "batch closed");
        Ok(next)
    }

    // -----------------------------------------------------------------------
    // Request intake
    // -----------------------------------------------------------------------

    fn active_batch(
        &self,
        vault: &VaultId,
        asset: &AssetId,
    ) -> Result<Batch, EngineError> {
        self.batches
            .active_batch(vault, asset)
            .cloned()
            .ok_or(EngineError::NoActiveBatch(*vault))
    }

    fn check_cap(cap: u64, current: u64, amount: u64) -> Result<(), EngineError> {
        let attempted = current
            .checked_add(amount)
            .ok_or(EngineError::AmountOverflow)?;
        if attempted > cap {
            return Err(EngineError::BatchCapExceeded { cap, attempted });
        }
        Ok(())
    }

    /// Institutional deposit: mints tokens 1:1 to the beneficiary and
    /// attributes the capital to the vault. The request is recorded
    /// already terminal; there is nothing to claim later.
    pub fn submit_deposit(
        &mut self,
        requester: &str,
        beneficiary: &str,
        vault: VaultId,
        amount: u64,
    ) -> Result<RequestId, EngineError> {
        if amount == 0 {
            return Err(EngineError::ZeroAmount);
        }
        let profile = self.profile(&vault)?;
        if profile.kind != VaultKind::AssetBacked {
            return Err(EngineError::WrongVaultKind {
                expected: VaultKind::AssetBacked,
            });
        }
        let batch = self.active_batch(&vault, &profile.asset)?;
        Self::check_cap(profile.batch_cap, batch.deposited, amount)?;
        if self.tokens.total_supply().checked_add(amount).is_none() {
            return Err(TokenError::SupplyOverflow { amount }.into());
        }

        self.ledger.record_deposit(vault, profile.asset, amount)?;
        self.batches
            .accumulate(batch.id, BatchTotal::Deposited, amount)?;
        self.tokens.mint(beneficiary, amount)?;
        let id = self
            .registry
            .create(RequestKind::Mint, requester, beneficiary, amount, batch.id);

        debug!(request = %id, batch = %batch.id, requester, amount, "deposit minted");
        Ok(id)
    }

    /// Institutional redemption: escrows the requester's tokens against
    /// the batch. Principal becomes claimable after settlement.
    pub fn submit_redemption(
        &mut self,
        requester: &str,
        beneficiary: &str,
        vault: VaultId,
        amount: u64,
    ) -> Result<RequestId, EngineError> {
        if amount == 0 {
            return Err(EngineError::ZeroAmount);
        }
        let profile = self.profile(&vault)?;
        if profile.kind != VaultKind::AssetBacked {
            return Err(EngineError::WrongVaultKind {
                expected: VaultKind::AssetBacked,
            });
        }
        let batch = self.active_batch(&vault, &profile.asset)?;
        Self::check_cap(profile.batch_cap, batch.requested, amount)?;

        self.tokens.transfer(requester, &batch.escrow, amount)?;
        self.ledger
            .record_withdrawal_request(vault, profile.asset, amount)?;
        self.batches
            .accumulate(batch.id, BatchTotal::Requested, amount)?;
        let id = self
            .registry
            .create(RequestKind::Burn, requester, beneficiary, amount, batch.id);

        debug!(request = %id, batch = %batch.id, requester, amount, "redemption escrowed");
        Ok(id)
    }

    /// Retail stake: escrows the requester's tokens against the batch.
    /// Shares priced off the settlement snapshot become claimable after
    /// settlement.
    pub fn submit_stake(
        &mut self,
        requester: &str,
        beneficiary: &str,
        vault: VaultId,
        amount: u64,
    ) -> Result<RequestId, EngineError> {
        if amount == 0 {
            return Err(EngineError::ZeroAmount);
        }
        let profile = self.profile(&vault)?;
        if profile.kind != VaultKind::ShareBased {
            return Err(EngineError::WrongVaultKind {
                expected: VaultKind::ShareBased,
            });
        }
        let batch = self.active_batch(&vault, &profile.asset)?;
        Self::check_cap(profile.batch_cap, batch.deposited, amount)?;

        // Informational estimate at the last settled price. The claim
        // prices against the settlement snapshot, not this figure.
        let entry = *self.ledger.entry(&vault, &profile.asset)?;
        let estimated_shares = if entry.share_supply == 0 || entry.last_known_total == 0 {
            amount
        } else {
            let shares = (amount as u128) * (entry.share_supply as u128)
                / (entry.last_known_total as u128);
            u64::try_from(shares).map_err(|_| EngineError::AmountOverflow)?
        };

        self.tokens.transfer(requester, &batch.escrow, amount)?;
        self.ledger.record_deposit(vault, profile.asset, amount)?;
        self.ledger
            .record_share_flow(vault, profile.asset, estimated_shares, ShareFlow::In)?;
        self.batches
            .accumulate(batch.id, BatchTotal::Deposited, amount)?;
        self.batches
            .accumulate(batch.id, BatchTotal::ShareIn, estimated_shares)?;
        let id = self
            .registry
            .create(RequestKind::Stake, requester, beneficiary, amount, batch.id);

        debug!(request = %id, batch = %batch.id, requester, amount, estimated_shares, "stake escrowed");
        Ok(id)
    }

    /// Retail unstake: queues `shares` for exit. The caller (the retail
    /// vault) has already escrowed the requester's shares; the engine
    /// only does the aggregate bookkeeping.
    pub fn submit_unstake(
        &mut self,
        requester: &str,
        beneficiary: &str,
        vault: VaultId,
        shares: u64,
    ) -> Result<RequestId, EngineError> {
        if shares == 0 {
            return Err(EngineError::ZeroAmount);
        }
        let profile = self.profile(&vault)?;
        if profile.kind != VaultKind::ShareBased {
            return Err(EngineError::WrongVaultKind {
                expected: VaultKind::ShareBased,
            });
        }
        let batch = self.active_batch(&vault, &profile.asset)?;
        Self::check_cap(profile.batch_cap, batch.share_out, shares)?;

        let entry = *self.ledger.entry(&vault, &profile.asset)?;
        let available = entry.share_supply.saturating_sub(entry.pending_share_out);
        if shares > available {
            return Err(EngineError::InsufficientShares {
                available,
                requested: shares,
            });
        }

        self.ledger
            .record_share_flow(vault, profile.asset, shares, ShareFlow::Out)?;
        self.batches
            .accumulate(batch.id, BatchTotal::ShareOut, shares)?;
        let id = self
            .registry
            .create(RequestKind::Unstake, requester, beneficiary, shares, batch.id);

        debug!(request = %id, batch = %batch.id, requester, shares, "unstake queued");
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Proposal phase
    // -----------------------------------------------------------------------

    /// Proposes a settlement for a CLOSED batch against the relayer's
    /// reported deployment total. Nets the batch's flows, isolates
    /// yield, checks tolerance, and starts the cooldown. At most one
    /// live proposal may exist per batch.
    pub fn propose_settlement(
        &mut self,
        actor: &str,
        batch_id: BatchId,
        reported_total_assets: u64,
        fee_snapshot: FeeSnapshot,
    ) -> Result<ProposalId, EngineError> {
        self.require_role(actor, Role::Relayer)?;

        let batch = self.batches.get(&batch_id)?.clone();
        if batch.state() != BatchState::Closed {
            return Err(BatchError::InvalidState {
                current: batch.state(),
                expected: BatchState::Closed,
            }
            .into());
        }
        if let Some(live) = self.live_proposals.get(&batch_id) {
            if self.proposals.get(live).map(|p| p.is_live()).unwrap_or(false) {
                return Err(EngineError::LiveProposalExists(batch_id));
            }
        }

        let profile = self.profile(&batch.vault)?;
        let entry = *self.ledger.entry(&batch.vault, &batch.asset)?;
        let effective = reported_total_assets
            .checked_sub(fee_snapshot.accrued)
            .ok_or(EngineError::FeesExceedReported {
                reported: reported_total_assets,
                accrued: fee_snapshot.accrued,
            })?;
        let last = entry.last_known_total;

        let (netted, snapshot) = match profile.kind {
            VaultKind::AssetBacked => {
                let netted = batch.deposited as i128 - batch.requested as i128;
                let snapshot = SettlementSnapshot {
                    total_assets: reported_total_assets,
                    total_net_assets: effective,
                    total_share_supply: 0,
                };
                (netted, snapshot)
            }
            VaultKind::ShareBased => {
                let supply = entry.share_supply;
                let exiting = batch.share_out;
                let deposited = batch.deposited;

                let (netted, net_assets) = if supply == 0 {
                    if exiting > 0 {
                        return Err(EngineError::InsufficientShares {
                            available: 0,
                            requested: exiting,
                        });
                    }
                    let net = effective
                        .checked_sub(deposited)
                        .ok_or(EngineError::InsolventVault(batch.vault))?;
                    (deposited as i128, net)
                } else {
                    if exiting >= supply {
                        return Err(EngineError::FullShareExit(batch.vault));
                    }
                    // Pre-flow net assets: value the vault before this
                    // batch's deposits, scaled so exiting shares carry
                    // their pro-rata slice.
                    let headroom = effective
                        .checked_sub(deposited)
                        .ok_or(EngineError::InsolventVault(batch.vault))?;
                    let net_assets_wide =
                        (headroom as u128) * (supply as u128) / ((supply - exiting) as u128);
                    let net_assets = u64::try_from(net_assets_wide)
                        .map_err(|_| EngineError::AmountOverflow)?;
                    let released =
                        (exiting as u128) * (net_assets as u128) / (supply as u128);
                    let released =
                        u64::try_from(released).map_err(|_| EngineError::AmountOverflow)?;
                    (deposited as i128 - released as i128, net_assets)
                };

                let snapshot = SettlementSnapshot {
                    total_assets: reported_total_assets,
                    total_net_assets: net_assets,
                    total_share_supply: supply,
                };
                (netted, snapshot)
            }
        };

        let yield_delta = effective as i128 - netted - last as i128;
        let max_allowed =
            (last as u128) * (self.config.yield_tolerance_bps as u128) / (BPS_DENOMINATOR as u128);
        let requires_approval = yield_delta.unsigned_abs() > max_allowed;

        let now = Utc::now();
        let id = ProposalId::derive(&batch_id, reported_total_assets);
        let proposal = SettlementProposal {
            id,
            asset: batch.asset,
            vault: batch.vault,
            batch_id,
            reported_total_assets,
            fee_snapshot,
            netted,
            yield_delta,
            snapshot,
            requires_approval,
            execute_after: now + self.config.cooldown(),
            status: ProposalStatus::Pending,
            created_at: now,
            accepted_at: None,
            executed_at: None,
            cancelled_at: None,
        };
        self.proposals.insert(id, proposal);
        self.live_proposals.insert(batch_id, id);

        info!(
            proposal = %id,
            batch = %batch_id,
            reported_total_assets,
            netted,
            yield_delta,
            requires_approval,
            "settlement proposed"
        );
        Ok(id)
    }

    /// Guardian sign-off on an out-of-tolerance proposal.
    pub fn accept_proposal(&mut self, actor: &str, id: ProposalId) -> Result<(), EngineError> {
        self.require_role(actor, Role::Guardian)?;
        let proposal = self
            .proposals
            .get_mut(&id)
            .ok_or(EngineError::UnknownProposal(id))?;
        if !proposal.is_live() {
            return Err(EngineError::ProposalNotLive {
                id,
                status: proposal.status,
            });
        }
        if !proposal.requires_approval {
            return Err(EngineError::ApprovalNotRequired(id));
        }
        if proposal.status == ProposalStatus::Accepted {
            return Err(EngineError::AlreadyAccepted(id));
        }
        proposal.status = ProposalStatus::Accepted;
        proposal.accepted_at = Some(Utc::now());
        info!(proposal = %id, guardian = actor, "proposal accepted");
        Ok(())
    }

    /// Guardian withdrawal of a live proposal. Frees the batch for a
    /// fresh proposal; escrowed requests are untouched.
    pub fn cancel_proposal(&mut self, actor: &str, id: ProposalId) -> Result<(), EngineError> {
        self.require_role(actor, Role::Guardian)?;
        let proposal = self
            .proposals
            .get_mut(&id)
            .ok_or(EngineError::UnknownProposal(id))?;
        if !proposal.is_live() {
            return Err(EngineError::ProposalNotLive {
                id,
                status: proposal.status,
            });
        }
        proposal.status = ProposalStatus::Cancelled;
        proposal.cancelled_at = Some(Utc::now());
        let batch_id = proposal.batch_id;
        if self.live_proposals.get(&batch_id) == Some(&id) {
            self.live_proposals.remove(&batch_id);
        }
        info!(proposal = %id, guardian = actor, "proposal cancelled");
        Ok(())
    }

    /// Whether the proposal could execute right now.
    pub fn can_execute(&self, id: &ProposalId) -> Result<bool, EngineError> {
        let proposal = self
            .proposals
            .get(id)
            .ok_or(EngineError::UnknownProposal(*id))?;
        Ok(proposal.executable_at(Utc::now()))
    }

    // -----------------------------------------------------------------------
    // Execution phase
    // -----------------------------------------------------------------------

    /// Executes a proposal whose gates have cleared. Permissionless:
    /// the proposal itself already carries the relayer's attestation
    /// and, where required, the guardian's.
    ///
    /// Execution is validate-then-commit: every fallible condition is
    /// checked before the first mutation, so a failed call leaves the
    /// engine exactly as it found it.
    pub fn execute_settlement(&mut self, id: ProposalId) -> Result<(), EngineError> {
        let proposal = self
            .proposals
            .get(&id)
            .ok_or(EngineError::UnknownProposal(id))?
            .clone();
        if !proposal.is_live() {
            return Err(EngineError::ProposalNotLive {
                id,
                status: proposal.status,
            });
        }
        let now = Utc::now();
        if now < proposal.execute_after {
            return Err(EngineError::CooldownActive {
                execute_after: proposal.execute_after,
            });
        }
        if proposal.requires_approval && proposal.status != ProposalStatus::Accepted {
            return Err(EngineError::ApprovalRequired(id));
        }

        let batch = self.batches.get(&proposal.batch_id)?.clone();
        if batch.state() != BatchState::Closed {
            return Err(BatchError::InvalidState {
                current: batch.state(),
                expected: BatchState::Closed,
            }
            .into());
        }
        let profile = self.profile(&batch.vault)?;

        // Cannot underflow: validated when the proposal was created.
        let new_total = proposal.reported_total_assets - proposal.fee_snapshot.accrued;
        let vault_address = batch.vault.address();
        let gain = if proposal.yield_delta > 0 {
            u64::try_from(proposal.yield_delta).map_err(|_| EngineError::AmountOverflow)?
        } else {
            0
        };
        let loss = if proposal.yield_delta < 0 {
            u64::try_from(proposal.yield_delta.unsigned_abs())
                .map_err(|_| EngineError::AmountOverflow)?
        } else {
            0
        };

        match profile.kind {
            VaultKind::AssetBacked => {
                self.execute_asset_backed(&batch, new_total, &vault_address, gain, loss)?
            }
            VaultKind::ShareBased => {
                self.execute_share_based(&proposal, &batch, new_total, &vault_address, gain, loss)?
            }
        }

        if proposal.fee_snapshot.accrued > 0 {
            let fees = self.uncharged_fees.entry(batch.asset).or_insert(0);
            *fees = fees
                .checked_add(proposal.fee_snapshot.accrued)
                .ok_or(EngineError::AmountOverflow)?;
        }

        self.batches.settle(proposal.batch_id, proposal.snapshot)?;
        self.recorder.set_recorded_total(batch.vault, new_total);

        let stored = self
            .proposals
            .get_mut(&id)
            .ok_or(EngineError::UnknownProposal(id))?;
        stored.status = ProposalStatus::Executed;
        stored.executed_at = Some(now);
        if self.live_proposals.get(&proposal.batch_id) == Some(&id) {
            self.live_proposals.remove(&proposal.batch_id);
        }

        info!(
            proposal = %id,
            batch = %proposal.batch_id,
            vault = %batch.vault,
            new_total,
            yield_delta = proposal.yield_delta,
            "settlement executed"
        );
        Ok(())
    }

    fn execute_asset_backed(
        &mut self,
        batch: &Batch,
        new_total: u64,
        vault_address: &str,
        gain: u64,
        loss: u64,
    ) -> Result<(), EngineError> {
        let release = batch.requested;

        // Validate.
        let escrow_balance = self.tokens.balance_of(&batch.escrow);
        if escrow_balance < release {
            return Err(EngineError::EscrowShortfall {
                batch: batch.id,
                available: escrow_balance,
                required: release,
            });
        }
        if gain > 0 && self.tokens.total_supply().checked_add(gain).is_none() {
            return Err(TokenError::SupplyOverflow { amount: gain }.into());
        }
        if loss > 0 {
            let balance = self.tokens.balance_of(vault_address);
            if balance < loss {
                return Err(TokenError::InsufficientBalance {
                    account: vault_address.to_string(),
                    balance,
                    amount: loss,
                }
                .into());
            }
        }

        // Commit.
        if gain > 0 {
            self.tokens.mint(vault_address, gain)?;
        }
        if loss > 0 {
            self.tokens.burn(vault_address, loss)?;
        }
        self.tokens.burn(&batch.escrow, release)?;
        if release > 0 {
            let escrow = self.principal_escrow.entry(batch.id).or_insert(0);
            *escrow = escrow
                .checked_add(release)
                .ok_or(EngineError::AmountOverflow)?;
        }
        self.ledger
            .apply_settlement(batch.vault, batch.asset, new_total, settled_flows(batch))?;

        debug!(
            batch = %batch.id,
            release,
            gain,
            loss,
            "asset-backed settlement applied"
        );
        Ok(())
    }

    fn execute_share_based(
        &mut self,
        proposal: &SettlementProposal,
        batch: &Batch,
        new_total: u64,
        vault_address: &str,
        gain: u64,
        loss: u64,
    ) -> Result<(), EngineError> {
        let reserve = *self
            .reserves
            .get(&batch.asset)
            .ok_or(EngineError::NoReserve(batch.asset))?;

        // Tokens remaining in escrow to back unstake claims. Deposits
        // minus netted flow; non-negative by construction.
        let retained = u64::try_from(batch.deposited as i128 - proposal.netted)
            .map_err(|_| EngineError::AmountOverflow)?;
        let escrow_to_vault = batch.deposited.saturating_sub(retained);
        let vault_to_escrow = retained.saturating_sub(batch.deposited);

        // Validate.
        let escrow_balance = self.tokens.balance_of(&batch.escrow);
        if escrow_balance < escrow_to_vault {
            return Err(EngineError::EscrowShortfall {
                batch: batch.id,
                available: escrow_balance,
                required: escrow_to_vault,
            });
        }
        let vault_outflow = vault_to_escrow
            .checked_add(loss)
            .ok_or(EngineError::AmountOverflow)?;
        if vault_outflow > 0 {
            // The yield gain mints before the outbound transfers, so it
            // counts toward what the treasury can cover.
            let balance = self
                .tokens
                .balance_of(vault_address)
                .checked_add(gain)
                .ok_or(EngineError::AmountOverflow)?;
            if balance < vault_outflow {
                return Err(TokenError::InsufficientBalance {
                    account: vault_address.to_string(),
                    balance,
                    amount: vault_outflow,
                }
                .into());
            }
        }
        if gain > 0 && self.tokens.total_supply().checked_add(gain).is_none() {
            return Err(TokenError::SupplyOverflow { amount: gain }.into());
        }

        // Commit. The attribution transfer goes first: it is the one
        // remaining fallible step, and it aborts cleanly on reserve
        // underflow before anything has moved.
        self.ledger
            .transfer_attribution(reserve, batch.asset, proposal.netted)?;
        if gain > 0 {
            self.tokens.mint(vault_address, gain)?;
        }
        if escrow_to_vault > 0 {
            self.tokens
                .transfer(&batch.escrow, vault_address, escrow_to_vault)?;
        }
        if vault_to_escrow > 0 {
            self.tokens
                .transfer(vault_address, &batch.escrow, vault_to_escrow)?;
        }
        if loss > 0 {
            self.tokens.burn(vault_address, loss)?;
        }
        self.ledger
            .apply_settlement(batch.vault, batch.asset, new_total, settled_flows(batch))?;

        debug!(
            batch = %batch.id,
            retained,
            escrow_to_vault,
            vault_to_escrow,
            gain,
            loss,
            "share-based settlement applied"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Claims
    // -----------------------------------------------------------------------

    /// Claims the output of a settled request. Callable by the
    /// requester or the beneficiary, exactly once per request. Prices
    /// share-vault claims off the batch's frozen snapshot; floor
    /// rounding, with any dust staying in escrow.
    pub fn claim(&mut self, caller: &str, request_id: RequestId) -> Result<ClaimOutcome, EngineError> {
        let request = self.registry.claimable(&request_id, caller)?.clone();
        let batch = self.batches.get(&request.batch_id)?.clone();
        let snapshot = batch
            .snapshot
            .ok_or(EngineError::BatchNotSettled(batch.id))?;

        let outcome = match request.kind {
            // Mint requests are terminal at creation; `claimable` has
            // already rejected them. Kept for exhaustiveness.
            RequestKind::Mint => {
                return Err(RequestError::AlreadyClaimed(request.id).into());
            }
            RequestKind::Burn => self.claim_principal(&request, &batch)?,
            RequestKind::Stake => self.claim_shares(&request, &batch, &snapshot)?,
            RequestKind::Unstake => self.claim_assets(&request, &batch, &snapshot)?,
        };

        self.registry.mark_claimed(&request_id)?;
        debug!(
            request = %request_id,
            caller,
            kind = %request.kind,
            amount = outcome.amount,
            "request claimed"
        );
        Ok(outcome)
    }

    fn claim_principal(
        &mut self,
        request: &Request,
        batch: &Batch,
    ) -> Result<ClaimOutcome, EngineError> {
        let available = self.principal_escrow.get(&batch.id).copied().unwrap_or(0);
        if available < request.amount {
            return Err(EngineError::EscrowShortfall {
                batch: batch.id,
                available,
                required: request.amount,
            });
        }
        self.principal_escrow
            .insert(batch.id, available - request.amount);
        Ok(ClaimOutcome {
            request: request.id,
            kind: RequestKind::Burn,
            amount: request.amount,
        })
    }

    fn claim_shares(
        &mut self,
        request: &Request,
        batch: &Batch,
        snapshot: &SettlementSnapshot,
    ) -> Result<ClaimOutcome, EngineError> {
        let shares = if snapshot.total_share_supply == 0 {
            // Bootstrap: first settled batch of an empty vault prices
            // shares 1:1 with deposited assets.
            request.amount
        } else {
            if snapshot.total_net_assets == 0 {
                return Err(EngineError::InsolventVault(batch.vault));
            }
            let wide = (request.amount as u128) * (snapshot.total_share_supply as u128)
                / (snapshot.total_net_assets as u128);
            u64::try_from(wide).map_err(|_| EngineError::AmountOverflow)?
        };
        self.ledger
            .adjust_share_supply(batch.vault, batch.asset, shares as i128)?;
        Ok(ClaimOutcome {
            request: request.id,
            kind: RequestKind::Stake,
            amount: shares,
        })
    }

    fn claim_assets(
        &mut self,
        request: &Request,
        batch: &Batch,
        snapshot: &SettlementSnapshot,
    ) -> Result<ClaimOutcome, EngineError> {
        if snapshot.total_share_supply == 0 {
            return Err(EngineError::InsolventVault(batch.vault));
        }
        let wide = (request.amount as u128) * (snapshot.total_net_assets as u128)
            / (snapshot.total_share_supply as u128);
        let payout = u64::try_from(wide).map_err(|_| EngineError::AmountOverflow)?;

        let available = self.tokens.balance_of(&batch.escrow);
        if available < payout {
            return Err(EngineError::EscrowShortfall {
                batch: batch.id,
                available,
                required: payout,
            });
        }
        self.tokens
            .transfer(&batch.escrow, &request.beneficiary, payout)?;
        self.ledger
            .adjust_share_supply(batch.vault, batch.asset, -(request.amount as i128))?;
        Ok(ClaimOutcome {
            request: request.id,
            kind: RequestKind::Unstake,
            amount: payout,
        })
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The live engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Looks up a batch by id.
    pub fn batch(&self, id: &BatchId) -> Result<&Batch, EngineError> {
        Ok(self.batches.get(id)?)
    }

    /// The vault's currently ACTIVE batch, if any.
    pub fn open_batch(&self, vault: &VaultId) -> Option<&Batch> {
        let profile = self.vaults.get(vault)?;
        self.batches.active_batch(vault, &profile.asset)
    }

    /// Looks up a proposal by id.
    pub fn proposal(&self, id: &ProposalId) -> Result<&SettlementProposal, EngineError> {
        self.proposals
            .get(id)
            .ok_or(EngineError::UnknownProposal(*id))
    }

    /// Looks up a request by id.
    pub fn request(&self, id: &RequestId) -> Result<&Request, EngineError> {
        Ok(self.registry.get(id)?)
    }

    /// All requests created by `user`.
    pub fn user_requests(&self, user: &str) -> Vec<&Request> {
        self.registry.user_requests(user)
    }

    /// Ids of `user`'s still-unclaimed requests.
    pub fn open_requests(&self, user: &str) -> &[RequestId] {
        self.registry.open_requests(user)
    }

    /// The vault's registration record, if registered.
    pub fn vault_profile(&self, vault: &VaultId) -> Option<&VaultProfile> {
        self.vaults.get(vault)
    }

    /// The asset's reserve vault, if one is registered.
    pub fn reserve(&self, asset: &AssetId) -> Option<VaultId> {
        self.reserves.get(asset).copied()
    }

    /// The vault's virtual balance: last settled total plus pending
    /// deposits.
    pub fn virtual_balance(&self, vault: &VaultId) -> u64 {
        match self.vaults.get(vault) {
            Some(profile) => self.ledger.virtual_balance(vault, &profile.asset),
            None => 0,
        }
    }

    /// Sum of all vaults' virtual balances for the asset. Equals token
    /// supply immediately after every settlement execution.
    pub fn total_attributed(&self, asset: &AssetId) -> u64 {
        self.ledger.total_attributed(asset)
    }

    /// Fees deducted from settlements but not yet collected by the
    /// operator.
    pub fn uncharged_fees(&self, asset: &AssetId) -> u64 {
        self.uncharged_fees.get(asset).copied().unwrap_or(0)
    }

    /// Read access to the virtual balance ledger.
    pub fn ledger(&self) -> &VirtualBalanceLedger {
        &self.ledger
    }

    /// Read access to the token backend.
    pub fn tokens(&self) -> &T {
        &self.tokens
    }

    /// Read access to the strategy recorder.
    pub fn recorder(&self) -> &R {
        &self.recorder
    }
}

/// The settling batch's flow totals, handed to the ledger so only that
/// batch's pendings retire. A rollover successor's flows stay pending.
fn settled_flows(batch: &Batch) -> BatchFlows {
    BatchFlows {
        deposits: batch.deposited,
        withdrawals: batch.requested,
        share_in: batch.share_in,
        share_out: batch.share_out,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_BATCH_CAP;
    use crate::external::{InMemoryToken, RecordingStrategy, StaticRoles};

    const ADMIN: &str = "aurum:admin";
    const RELAYER: &str = "aurum:relayer";
    const GUARDIAN: &str = "aurum:guardian";

    type TestEngine = SettlementEngine<InMemoryToken, StaticRoles, RecordingStrategy>;

    fn engine(tolerance_bps: u64) -> TestEngine {
        let mut roles = StaticRoles::new();
        roles.grant(ADMIN, Role::Admin);
        roles.grant(RELAYER, Role::Relayer);
        roles.grant(GUARDIAN, Role::Guardian);
        // Zero cooldown so tests can execute without clock control.
        let config = EngineConfig::new(tolerance_bps, 0).unwrap();
        SettlementEngine::new(config, InMemoryToken::new(), roles, RecordingStrategy::new())
    }

    fn asset() -> AssetId {
        AssetId::derive("aUSD", "aurum:issuer")
    }

    fn with_reserve(tolerance_bps: u64) -> (TestEngine, AssetId, VaultId) {
        let mut eng = engine(tolerance_bps);
        let asset = asset();
        let vault = eng
            .register_vault(ADMIN, "treasury", asset, VaultKind::AssetBacked, DEFAULT_BATCH_CAP)
            .unwrap();
        (eng, asset, vault)
    }

    #[test]
    fn role_gates_enforced() {
        let (mut eng, _, vault) = with_reserve(1_000);
        assert!(matches!(
            eng.create_batch("nobody", vault),
            Err(EngineError::Unauthorized { .. })
        ));
        assert!(matches!(
            eng.register_vault(RELAYER, "x", asset(), VaultKind::AssetBacked, 1),
            Err(EngineError::Unauthorized { .. })
        ));
    }

    #[test]
    fn share_vault_requires_reserve() {
        let mut eng = engine(1_000);
        assert!(matches!(
            eng.register_vault(ADMIN, "retail", asset(), VaultKind::ShareBased, DEFAULT_BATCH_CAP),
            Err(EngineError::NoReserve(_))
        ));
    }

    #[test]
    fn second_reserve_rejected() {
        let (mut eng, asset, _) = with_reserve(1_000);
        assert!(matches!(
            eng.register_vault(ADMIN, "treasury2", asset, VaultKind::AssetBacked, 1),
            Err(EngineError::ReserveExists(_))
        ));
    }

    #[test]
    fn deposit_mints_one_to_one() {
        let (mut eng, asset, vault) = with_reserve(1_000);
        eng.create_batch(RELAYER, vault).unwrap();
        eng.submit_deposit("alice", "alice", vault, 2_000_000).unwrap();

        assert_eq!(eng.tokens().balance_of("alice"), 2_000_000);
        assert_eq!(eng.virtual_balance(&vault), 2_000_000);
        assert_eq!(eng.total_attributed(&asset), eng.tokens().total_supply());
    }

    #[test]
    fn batch_cap_enforced() {
        let mut eng = engine(1_000);
        let asset = asset();
        let vault = eng
            .register_vault(ADMIN, "treasury", asset, VaultKind::AssetBacked, 1_000)
            .unwrap();
        eng.create_batch(RELAYER, vault).unwrap();

        eng.submit_deposit("alice", "alice", vault, 800).unwrap();
        assert!(matches!(
            eng.submit_deposit("bob", "bob", vault, 201),
            Err(EngineError::BatchCapExceeded { cap: 1_000, attempted: 1_001 })
        ));
        // Exactly at the cap is fine.
        eng.submit_deposit("bob", "bob", vault, 200).unwrap();
    }

    #[test]
    fn requests_rejected_without_active_batch() {
        let (mut eng, _, vault) = with_reserve(1_000);
        assert!(matches!(
            eng.submit_deposit("alice", "alice", vault, 100),
            Err(EngineError::NoActiveBatch(_))
        ));
    }

    #[test]
    fn full_settlement_round_trip_preserves_backing() {
        let (mut eng, asset, vault) = with_reserve(1_000);
        let batch = eng.create_batch(RELAYER, vault).unwrap();

        eng.submit_deposit("alice", "alice", vault, 10_000_000).unwrap();
        eng.submit_redemption("alice", "alice", vault, 1_000_000).unwrap();
        eng.close_batch(RELAYER, batch, false).unwrap();

        // No yield: reported total equals the netted flow.
        let pid = eng
            .propose_settlement(RELAYER, batch, 9_000_000, FeeSnapshot::none())
            .unwrap();
        let proposal = eng.proposal(&pid).unwrap();
        assert_eq!(proposal.netted, 9_000_000);
        assert_eq!(proposal.yield_delta, 0);
        assert!(!proposal.requires_approval);

        eng.execute_settlement(pid).unwrap();
        assert_eq!(eng.virtual_balance(&vault), 9_000_000);
        assert_eq!(eng.tokens().total_supply(), 9_000_000);
        assert_eq!(eng.total_attributed(&asset), eng.tokens().total_supply());
        assert_eq!(eng.recorder().recorded_total(&vault), Some(9_000_000));
    }

    #[test]
    fn yield_isolated_from_principal_flows() {
        let (mut eng, _, vault) = with_reserve(10_000);
        let batch = eng.create_batch(RELAYER, vault).unwrap();
        eng.submit_deposit("alice", "alice", vault, 1_000_000).unwrap();
        eng.close_batch(RELAYER, batch, false).unwrap();
        let pid = eng
            .propose_settlement(RELAYER, batch, 1_000_000, FeeSnapshot::none())
            .unwrap();
        eng.execute_settlement(pid).unwrap();

        // Second epoch: 50_000 of yield on a flowless batch.
        let batch2 = eng.create_batch(RELAYER, vault).unwrap();
        eng.close_batch(RELAYER, batch2, false).unwrap();
        let pid2 = eng
            .propose_settlement(RELAYER, batch2, 1_050_000, FeeSnapshot::none())
            .unwrap();
        let proposal = eng.proposal(&pid2).unwrap();
        assert_eq!(proposal.netted, 0);
        assert_eq!(proposal.yield_delta, 50_000);

        eng.execute_settlement(pid2).unwrap();
        // Yield mints to the vault treasury address.
        assert_eq!(eng.tokens().balance_of(&vault.address()), 50_000);
        assert_eq!(eng.tokens().total_supply(), 1_050_000);
        assert_eq!(eng.virtual_balance(&vault), 1_050_000);
    }

    #[test]
    fn out_of_tolerance_yield_needs_guardian() {
        let (mut eng, _, vault) = with_reserve(100); // 1%
        let batch = eng.create_batch(RELAYER, vault).unwrap();
        eng.submit_deposit("alice", "alice", vault, 1_000_000).unwrap();
        eng.close_batch(RELAYER, batch, false).unwrap();
        let pid = eng
            .propose_settlement(RELAYER, batch, 1_000_000, FeeSnapshot::none())
            .unwrap();
        eng.execute_settlement(pid).unwrap();

        let batch2 = eng.create_batch(RELAYER, vault).unwrap();
        eng.close_batch(RELAYER, batch2, false).unwrap();
        // 2% yield against a 1% tolerance.
        let pid2 = eng
            .propose_settlement(RELAYER, batch2, 1_020_000, FeeSnapshot::none())
            .unwrap();
        assert!(eng.proposal(&pid2).unwrap().requires_approval);
        assert!(!eng.can_execute(&pid2).unwrap());
        assert!(matches!(
            eng.execute_settlement(pid2),
            Err(EngineError::ApprovalRequired(_))
        ));

        eng.accept_proposal(GUARDIAN, pid2).unwrap();
        assert!(eng.can_execute(&pid2).unwrap());
        eng.execute_settlement(pid2).unwrap();
    }

    #[test]
    fn one_live_proposal_per_batch() {
        let (mut eng, _, vault) = with_reserve(10_000);
        let batch = eng.create_batch(RELAYER, vault).unwrap();
        eng.submit_deposit("alice", "alice", vault, 500_000).unwrap();
        eng.close_batch(RELAYER, batch, false).unwrap();

        let pid = eng
            .propose_settlement(RELAYER, batch, 500_000, FeeSnapshot::none())
            .unwrap();
        assert!(matches!(
            eng.propose_settlement(RELAYER, batch, 500_000, FeeSnapshot::none()),
            Err(EngineError::LiveProposalExists(_))
        ));

        // Cancellation frees the batch for a corrected proposal.
        eng.cancel_proposal(GUARDIAN, pid).unwrap();
        let pid2 = eng
            .propose_settlement(RELAYER, batch, 500_000, FeeSnapshot::none())
            .unwrap();
        assert!(matches!(
            eng.execute_settlement(pid),
            Err(EngineError::ProposalNotLive { .. })
        ));
        eng.execute_settlement(pid2).unwrap();
    }

    #[test]
    fn settled_batch_rejects_second_execution() {
        let (mut eng, _, vault) = with_reserve(10_000);
        let batch = eng.create_batch(RELAYER, vault).unwrap();
        eng.submit_deposit("alice", "alice", vault, 500_000).unwrap();
        eng.close_batch(RELAYER, batch, false).unwrap();
        let pid = eng
            .propose_settlement(RELAYER, batch, 500_000, FeeSnapshot::none())
            .unwrap();
        eng.execute_settlement(pid).unwrap();
        assert!(matches!(
            eng.execute_settlement(pid),
            Err(EngineError::ProposalNotLive { .. })
        ));
    }

    #[test]
    fn fees_carved_out_before_netting() {
        let (mut eng, asset, vault) = with_reserve(10_000);
        let batch = eng.create_batch(RELAYER, vault).unwrap();
        eng.submit_deposit("alice", "alice", vault, 1_000_000).unwrap();
        eng.close_batch(RELAYER, batch, false).unwrap();

        let fees = FeeSnapshot {
            accrued: 10_000,
            ..FeeSnapshot::none()
        };
        let pid = eng
            .propose_settlement(RELAYER, batch, 1_010_000, fees)
            .unwrap();
        let proposal = eng.proposal(&pid).unwrap();
        assert_eq!(proposal.netted, 1_000_000);
        assert_eq!(proposal.yield_delta, 0);

        eng.execute_settlement(pid).unwrap();
        assert_eq!(eng.uncharged_fees(&asset), 10_000);
        assert_eq!(eng.virtual_balance(&vault), 1_000_000);
        assert_eq!(eng.total_attributed(&asset), eng.tokens().total_supply());
    }

    #[test]
    fn fees_exceeding_reported_rejected() {
        let (mut eng, _, vault) = with_reserve(10_000);
        let batch = eng.create_batch(RELAYER, vault).unwrap();
        eng.close_batch(RELAYER, batch, false).unwrap();
        let fees = FeeSnapshot {
            accrued: 100,
            ..FeeSnapshot::none()
        };
        assert!(matches!(
            eng.propose_settlement(RELAYER, batch, 99, fees),
            Err(EngineError::FeesExceedReported { reported: 99, accrued: 100 })
        ));
    }

    #[test]
    fn burn_claim_pays_principal_once() {
        let (mut eng, _, vault) = with_reserve(10_000);
        let batch = eng.create_batch(RELAYER, vault).unwrap();
        eng.submit_deposit("alice", "alice", vault, 1_000_000).unwrap();
        let req = eng
            .submit_redemption("alice", "alice", vault, 400_000)
            .unwrap();
        eng.close_batch(RELAYER, batch, false).unwrap();

        // Claim before settlement is rejected.
        assert!(matches!(
            eng.claim("alice", req),
            Err(EngineError::BatchNotSettled(_))
        ));

        let pid = eng
            .propose_settlement(RELAYER, batch, 600_000, FeeSnapshot::none())
            .unwrap();
        eng.execute_settlement(pid).unwrap();
        // Escrowed tokens burned at execution.
        assert_eq!(eng.tokens().total_supply(), 600_000);

        let outcome = eng.claim("alice", req).unwrap();
        assert_eq!(outcome.kind, RequestKind::Burn);
        assert_eq!(outcome.amount, 400_000);
        assert!(matches!(
            eng.claim("alice", req),
            Err(EngineError::Registry(RequestError::AlreadyClaimed(_)))
        ));
    }

    #[test]
    fn claim_ownership_enforced() {
        let (mut eng, _, vault) = with_reserve(10_000);
        let batch = eng.create_batch(RELAYER, vault).unwrap();
        eng.submit_deposit("alice", "alice", vault, 100).unwrap();
        let req = eng.submit_redemption("alice", "alice", vault, 50).unwrap();
        eng.close_batch(RELAYER, batch, false).unwrap();
        let pid = eng
            .propose_settlement(RELAYER, batch, 50, FeeSnapshot::none())
            .unwrap();
        eng.execute_settlement(pid).unwrap();

        assert!(matches!(
            eng.claim("mallory", req),
            Err(EngineError::Registry(RequestError::NotOwner { .. }))
        ));
        eng.claim("alice", req).unwrap();
    }

    // -- Share vault scenarios ----------------------------------------------

    fn with_retail(tolerance_bps: u64) -> (TestEngine, AssetId, VaultId, VaultId) {
        let (mut eng, asset, reserve) = with_reserve(tolerance_bps);
        let retail = eng
            .register_vault(ADMIN, "retail", asset, VaultKind::ShareBased, DEFAULT_BATCH_CAP)
            .unwrap();
        (eng, asset, reserve, retail)
    }

    /// Seeds the reserve with `amount` of settled, token-backed
    /// capital attributed to it, held by `holder`.
    fn seed_reserve(eng: &mut TestEngine, reserve: VaultId, holder: &str, amount: u64) {
        let batch = eng.create_batch(RELAYER, reserve).unwrap();
        eng.submit_deposit(holder, holder, reserve, amount).unwrap();
        eng.close_batch(RELAYER, batch, false).unwrap();
        let pid = eng
            .propose_settlement(RELAYER, batch, amount, FeeSnapshot::none())
            .unwrap();
        eng.execute_settlement(pid).unwrap();
    }

    #[test]
    fn stake_settles_and_mints_bootstrap_shares() {
        let (mut eng, asset, reserve, retail) = with_retail(10_000);
        seed_reserve(&mut eng, reserve, "alice", 1_000_000);

        let batch = eng.create_batch(RELAYER, retail).unwrap();
        let req = eng.submit_stake("alice", "alice", retail, 300_000).unwrap();
        eng.close_batch(RELAYER, batch, false).unwrap();

        let pid = eng
            .propose_settlement(RELAYER, batch, 300_000, FeeSnapshot::none())
            .unwrap();
        let proposal = eng.proposal(&pid).unwrap();
        assert_eq!(proposal.netted, 300_000);
        assert_eq!(proposal.yield_delta, 0);

        eng.execute_settlement(pid).unwrap();
        // Attribution moved from the reserve to the retail vault.
        assert_eq!(eng.virtual_balance(&reserve), 700_000);
        assert_eq!(eng.virtual_balance(&retail), 300_000);
        assert_eq!(eng.total_attributed(&asset), eng.tokens().total_supply());

        let outcome = eng.claim("alice", req).unwrap();
        assert_eq!(outcome.kind, RequestKind::Stake);
        assert_eq!(outcome.amount, 300_000); // 1:1 bootstrap
    }

    #[test]
    fn unstake_pays_at_settled_share_price() {
        let (mut eng, asset, reserve, retail) = with_retail(10_000);
        seed_reserve(&mut eng, reserve, "alice", 1_000_000);

        // Epoch 1: stake 400_000, claim 400_000 shares.
        let b1 = eng.create_batch(RELAYER, retail).unwrap();
        let stake = eng.submit_stake("alice", "alice", retail, 400_000).unwrap();
        eng.close_batch(RELAYER, b1, false).unwrap();
        let p1 = eng
            .propose_settlement(RELAYER, b1, 400_000, FeeSnapshot::none())
            .unwrap();
        eng.execute_settlement(p1).unwrap();
        eng.claim("alice", stake).unwrap();

        // Epoch 2: the vault doubles, then alice exits half her shares.
        let b2 = eng.create_batch(RELAYER, retail).unwrap();
        let unstake = eng.submit_unstake("alice", "alice", retail, 200_000).unwrap();
        eng.close_batch(RELAYER, b2, false).unwrap();
        // Pre-exit value 800_000; reporting the post-exit remainder:
        // net assets 800_000, half the shares exit, 400_000 released.
        let p2 = eng
            .propose_settlement(RELAYER, b2, 400_000, FeeSnapshot::none())
            .unwrap();
        let proposal = eng.proposal(&p2).unwrap();
        assert_eq!(proposal.snapshot.total_net_assets, 800_000);
        assert_eq!(proposal.netted, -400_000);
        assert_eq!(proposal.yield_delta, 400_000);

        eng.execute_settlement(p2).unwrap();
        let outcome = eng.claim("alice", unstake).unwrap();
        assert_eq!(outcome.kind, RequestKind::Unstake);
        assert_eq!(outcome.amount, 400_000); // 200_000 shares at 2.0

        // Shares burned, attribution returned to the reserve, backing
        // intact.
        assert_eq!(
            eng.ledger().entry(&retail, &asset).unwrap().share_supply,
            200_000
        );
        assert_eq!(eng.virtual_balance(&reserve), 1_000_000);
        assert_eq!(eng.total_attributed(&asset), eng.tokens().total_supply());
    }

    #[test]
    fn full_share_exit_rejected_at_proposal() {
        let (mut eng, _, reserve, retail) = with_retail(10_000);
        seed_reserve(&mut eng, reserve, "alice", 1_000_000);

        let b1 = eng.create_batch(RELAYER, retail).unwrap();
        let stake = eng.submit_stake("alice", "alice", retail, 100_000).unwrap();
        eng.close_batch(RELAYER, b1, false).unwrap();
        let p1 = eng
            .propose_settlement(RELAYER, b1, 100_000, FeeSnapshot::none())
            .unwrap();
        eng.execute_settlement(p1).unwrap();
        eng.claim("alice", stake).unwrap();

        let b2 = eng.create_batch(RELAYER, retail).unwrap();
        eng.submit_unstake("alice", "alice", retail, 100_000).unwrap();
        eng.close_batch(RELAYER, b2, false).unwrap();
        assert!(matches!(
            eng.propose_settlement(RELAYER, b2, 0, FeeSnapshot::none()),
            Err(EngineError::FullShareExit(_))
        ));
    }

    #[test]
    fn unstake_beyond_supply_rejected_at_request() {
        let (mut eng, _, reserve, retail) = with_retail(10_000);
        seed_reserve(&mut eng, reserve, "alice", 1_000_000);
        eng.create_batch(RELAYER, retail).unwrap();

        // No shares minted yet.
        assert!(matches!(
            eng.submit_unstake("alice", "alice", retail, 1),
            Err(EngineError::InsufficientShares { available: 0, requested: 1 })
        ));
    }

    #[test]
    fn zero_amount_requests_rejected() {
        let (mut eng, _, vault) = with_reserve(10_000);
        eng.create_batch(RELAYER, vault).unwrap();
        assert!(matches!(
            eng.submit_deposit("alice", "alice", vault, 0),
            Err(EngineError::ZeroAmount)
        ));
        assert!(matches!(
            eng.submit_redemption("alice", "alice", vault, 0),
            Err(EngineError::ZeroAmount)
        ));
    }
}
