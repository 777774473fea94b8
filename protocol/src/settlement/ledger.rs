//! # Virtual Balance Ledger
//!
//! Tracks capital claims without moving assets at request time. Each
//! `(vault, asset)` entry carries the vault's last settled total plus
//! the pending flows of its not-yet-settled batches. The sum of all
//! entries for an asset is the protocol's backing guarantee: it must
//! equal the outstanding token supply immediately after every
//! settlement execution.
//!
//! Pending deposits count toward [`VirtualBalanceLedger::virtual_balance`]
//! right away -- institutional gateways size external deployments off
//! this number before settlement finalizes. Pending withdrawals do NOT
//! reduce the balance until settlement, because the exact release
//! amount depends on the settlement's yield computation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::id::{AssetId, VaultId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// No entry exists for the `(vault, asset)` pair.
    #[error("no ledger entry for vault {vault} / asset {asset}")]
    EntryNotFound {
        /// The vault of the pair.
        vault: VaultId,
        /// The asset of the pair.
        asset: AssetId,
    },

    /// A pending-flow update would overflow u64.
    #[error("ledger overflow: adding {amount} to {current}")]
    Overflow {
        /// The running total before the failed update.
        current: u64,
        /// The amount that caused the overflow.
        amount: u64,
    },

    /// A settlement adjustment would drive a balance below zero. This
    /// is invariant-threatening and must abort the whole settlement.
    #[error("balance underflow: entry holds {current}, adjustment removes {amount}")]
    Underflow {
        /// The balance before the failed adjustment.
        current: u64,
        /// The amount the adjustment tried to remove.
        amount: u64,
    },
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Direction of a share-denominated flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareFlow {
    /// Shares entering the vault (stake side).
    In,
    /// Shares leaving the vault (unstake side).
    Out,
}

/// The flow totals of a single settling batch, subtracted from the
/// entry's pendings when that batch executes. Pendings aggregate over
/// every open batch of the pair, so a rollover successor's flows must
/// survive the predecessor's settlement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFlows {
    /// Gross deposits the settling batch recorded.
    pub deposits: u64,
    /// Gross redemption requests the settling batch recorded.
    pub withdrawals: u64,
    /// Share inflow the settling batch recorded.
    pub share_in: u64,
    /// Share outflow the settling batch recorded.
    pub share_out: u64,
}

/// Per-(vault, asset) aggregate of capital attributed to the vault,
/// regardless of where that capital is physically deployed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultEntry {
    /// Total as of the last executed settlement.
    pub last_known_total: u64,
    /// Gross deposits recorded against unsettled batches.
    pub pending_deposits: u64,
    /// Gross redemption requests recorded against unsettled batches.
    pub pending_withdrawals: u64,
    /// Shares queued to enter via unsettled batches (estimate).
    pub pending_share_in: u64,
    /// Shares queued to exit via unsettled batches.
    pub pending_share_out: u64,
    /// Live share supply (zero for asset-backed vaults). Grows when
    /// stake claims mint shares, shrinks when unstake claims burn them.
    pub share_supply: u64,
}

/// The explicit store keyed by `(vault, asset)`. Injected into the
/// settlement engine; every mutation goes through the engine's API so
/// the backing invariant stays auditable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualBalanceLedger {
    entries: HashMap<(VaultId, AssetId), VaultEntry>,
}

impl VirtualBalanceLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a zeroed entry for a pair. Idempotent.
    pub fn open_entry(&mut self, vault: VaultId, asset: AssetId) {
        self.entries.entry((vault, asset)).or_default();
    }

    fn entry_mut(&mut self, vault: VaultId, asset: AssetId) -> Result<&mut VaultEntry, LedgerError> {
        self.entries
            .get_mut(&(vault, asset))
            .ok_or(LedgerError::EntryNotFound { vault, asset })
    }

    /// Read-only view of a pair's entry.
    pub fn entry(&self, vault: &VaultId, asset: &AssetId) -> Result<&VaultEntry, LedgerError> {
        self.entries
            .get(&(*vault, *asset))
            .ok_or(LedgerError::EntryNotFound {
                vault: *vault,
                asset: *asset,
            })
    }

    /// Records a deposit into the open batch: grows the pending-deposit
    /// total, and thereby the vault's virtual balance.
    pub fn record_deposit(
        &mut self,
        vault: VaultId,
        asset: AssetId,
        amount: u64,
    ) -> Result<(), LedgerError> {
        let entry = self.entry_mut(vault, asset)?;
        entry.pending_deposits = checked_add(entry.pending_deposits, amount)?;
        Ok(())
    }

    /// Records a redemption request. Does not reduce the virtual
    /// balance -- the reduction happens at settlement execution.
    pub fn record_withdrawal_request(
        &mut self,
        vault: VaultId,
        asset: AssetId,
        amount: u64,
    ) -> Result<(), LedgerError> {
        let entry = self.entry_mut(vault, asset)?;
        entry.pending_withdrawals = checked_add(entry.pending_withdrawals, amount)?;
        Ok(())
    }

    /// Records a share-denominated flow, tracked separately from asset
    /// flows because retail vaults reconcile in shares.
    pub fn record_share_flow(
        &mut self,
        vault: VaultId,
        asset: AssetId,
        amount: u64,
        direction: ShareFlow,
    ) -> Result<(), LedgerError> {
        let entry = self.entry_mut(vault, asset)?;
        match direction {
            ShareFlow::In => entry.pending_share_in = checked_add(entry.pending_share_in, amount)?,
            ShareFlow::Out => {
                entry.pending_share_out = checked_add(entry.pending_share_out, amount)?
            }
        }
        Ok(())
    }

    /// The vault's latest settled total plus deposits recorded in the
    /// still-open batch. Reflects pending but not-yet-settled activity
    /// by design.
    pub fn virtual_balance(&self, vault: &VaultId, asset: &AssetId) -> u64 {
        self.entries
            .get(&(*vault, *asset))
            .map(|e| e.last_known_total.saturating_add(e.pending_deposits))
            .unwrap_or(0)
    }

    /// Sum of all vaults' virtual balances for an asset -- the quantity
    /// the backing invariant compares against token supply.
    pub fn total_attributed(&self, asset: &AssetId) -> u64 {
        self.entries
            .iter()
            .filter(|((_, a), _)| a == asset)
            .map(|(_, e)| e.last_known_total.saturating_add(e.pending_deposits))
            .sum()
    }

    /// Replaces the entry's settled total and retires the settling
    /// batch's flows from the pendings. Flows recorded by a rollover
    /// successor stay pending. Called only by the engine while
    /// executing a settlement.
    pub fn apply_settlement(
        &mut self,
        vault: VaultId,
        asset: AssetId,
        new_total: u64,
        settled: BatchFlows,
    ) -> Result<(), LedgerError> {
        let entry = self.entry_mut(vault, asset)?;
        // Every settled flow was recorded into the pendings first, so
        // a shortfall here means corrupted bookkeeping. Check before
        // mutating anything.
        let deposits = checked_sub(entry.pending_deposits, settled.deposits)?;
        let withdrawals = checked_sub(entry.pending_withdrawals, settled.withdrawals)?;
        let share_in = checked_sub(entry.pending_share_in, settled.share_in)?;
        let share_out = checked_sub(entry.pending_share_out, settled.share_out)?;
        entry.last_known_total = new_total;
        entry.pending_deposits = deposits;
        entry.pending_withdrawals = withdrawals;
        entry.pending_share_in = share_in;
        entry.pending_share_out = share_out;
        Ok(())
    }

    /// Applies the cross-vault attribution transfer implied by a share
    /// vault's netted flow: capital staked into a retail vault moves
    /// attribution out of the asset's reserve vault, and vice versa on
    /// net exits. `netted` is signed; positive pulls from the reserve.
    pub fn transfer_attribution(
        &mut self,
        reserve: VaultId,
        asset: AssetId,
        netted: i128,
    ) -> Result<(), LedgerError> {
        let entry = self.entry_mut(reserve, asset)?;
        let current = entry.last_known_total;
        if netted >= 0 {
            let amount = u64::try_from(netted).map_err(|_| LedgerError::Underflow {
                current,
                amount: u64::MAX,
            })?;
            if amount > current {
                return Err(LedgerError::Underflow { current, amount });
            }
            entry.last_known_total = current - amount;
        } else {
            let amount = u64::try_from(-netted).map_err(|_| LedgerError::Overflow {
                current,
                amount: u64::MAX,
            })?;
            entry.last_known_total = checked_add(current, amount)?;
        }
        Ok(())
    }

    /// Adjusts the live share supply after a claim mints or burns
    /// shares. `delta` is signed.
    pub fn adjust_share_supply(
        &mut self,
        vault: VaultId,
        asset: AssetId,
        delta: i128,
    ) -> Result<(), LedgerError> {
        let entry = self.entry_mut(vault, asset)?;
        let current = entry.share_supply;
        if delta >= 0 {
            let amount = u64::try_from(delta).map_err(|_| LedgerError::Overflow {
                current,
                amount: u64::MAX,
            })?;
            entry.share_supply = checked_add(current, amount)?;
        } else {
            let amount = u64::try_from(-delta).map_err(|_| LedgerError::Underflow {
                current,
                amount: u64::MAX,
            })?;
            if amount > current {
                return Err(LedgerError::Underflow { current, amount });
            }
            entry.share_supply = current - amount;
        }
        Ok(())
    }
}

fn checked_add(current: u64, amount: u64) -> Result<u64, LedgerError> {
    current
        .checked_add(amount)
        .ok_or(LedgerError::Overflow { current, amount })
}

fn checked_sub(current: u64, amount: u64) -> Result<u64, LedgerError> {
    current
        .checked_sub(amount)
        .ok_or(LedgerError::Underflow { current, amount })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (VaultId, AssetId) {
        let asset = AssetId::derive("aUSD", "aurum:issuer");
        let vault = VaultId::derive("treasury", &asset);
        (vault, asset)
    }

    #[test]
    fn deposit_counts_into_virtual_balance() {
        let (vault, asset) = pair();
        let mut ledger = VirtualBalanceLedger::new();
        ledger.open_entry(vault, asset);

        ledger.record_deposit(vault, asset, 2_000_000).unwrap();
        assert_eq!(ledger.virtual_balance(&vault, &asset), 2_000_000);
    }

    #[test]
    fn withdrawal_request_does_not_reduce_balance() {
        let (vault, asset) = pair();
        let mut ledger = VirtualBalanceLedger::new();
        ledger.open_entry(vault, asset);

        ledger.record_deposit(vault, asset, 2_000_000).unwrap();
        ledger
            .record_withdrawal_request(vault, asset, 500_000)
            .unwrap();
        assert_eq!(ledger.virtual_balance(&vault, &asset), 2_000_000);
        assert_eq!(
            ledger.entry(&vault, &asset).unwrap().pending_withdrawals,
            500_000
        );
    }

    #[test]
    fn unknown_pair_rejected() {
        let (vault, asset) = pair();
        let mut ledger = VirtualBalanceLedger::new();
        assert!(matches!(
            ledger.record_deposit(vault, asset, 1),
            Err(LedgerError::EntryNotFound { .. })
        ));
        assert_eq!(ledger.virtual_balance(&vault, &asset), 0);
    }

    #[test]
    fn apply_settlement_retires_settled_flows() {
        let (vault, asset) = pair();
        let mut ledger = VirtualBalanceLedger::new();
        ledger.open_entry(vault, asset);

        ledger.record_deposit(vault, asset, 2_000_000).unwrap();
        ledger
            .record_withdrawal_request(vault, asset, 500_000)
            .unwrap();
        let flows = BatchFlows {
            deposits: 2_000_000,
            withdrawals: 500_000,
            ..BatchFlows::default()
        };
        ledger.apply_settlement(vault, asset, 1_500_000, flows).unwrap();

        let entry = ledger.entry(&vault, &asset).unwrap();
        assert_eq!(entry.last_known_total, 1_500_000);
        assert_eq!(entry.pending_deposits, 0);
        assert_eq!(entry.pending_withdrawals, 0);
        assert_eq!(ledger.virtual_balance(&vault, &asset), 1_500_000);
    }

    #[test]
    fn apply_settlement_keeps_successor_batch_flows_pending() {
        let (vault, asset) = pair();
        let mut ledger = VirtualBalanceLedger::new();
        ledger.open_entry(vault, asset);

        // First batch records 100, then a rollover successor records
        // 50 before the first batch settles.
        ledger.record_deposit(vault, asset, 100).unwrap();
        ledger.record_deposit(vault, asset, 50).unwrap();

        let flows = BatchFlows {
            deposits: 100,
            ..BatchFlows::default()
        };
        ledger.apply_settlement(vault, asset, 100, flows).unwrap();

        let entry = ledger.entry(&vault, &asset).unwrap();
        assert_eq!(entry.last_known_total, 100);
        assert_eq!(entry.pending_deposits, 50);
        assert_eq!(ledger.virtual_balance(&vault, &asset), 150);
        assert_eq!(ledger.total_attributed(&asset), 150);
    }

    #[test]
    fn apply_settlement_rejects_unrecorded_flows() {
        let (vault, asset) = pair();
        let mut ledger = VirtualBalanceLedger::new();
        ledger.open_entry(vault, asset);
        ledger.record_deposit(vault, asset, 10).unwrap();

        let flows = BatchFlows {
            deposits: 11,
            ..BatchFlows::default()
        };
        assert!(matches!(
            ledger.apply_settlement(vault, asset, 10, flows),
            Err(LedgerError::Underflow { current: 10, amount: 11 })
        ));
        // Failed settlement leaves the entry untouched.
        assert_eq!(ledger.entry(&vault, &asset).unwrap().pending_deposits, 10);
    }

    #[test]
    fn share_flows_track_separately() {
        let (vault, asset) = pair();
        let mut ledger = VirtualBalanceLedger::new();
        ledger.open_entry(vault, asset);

        ledger
            .record_share_flow(vault, asset, 1_000, ShareFlow::In)
            .unwrap();
        ledger
            .record_share_flow(vault, asset, 250, ShareFlow::Out)
            .unwrap();

        let entry = ledger.entry(&vault, &asset).unwrap();
        assert_eq!(entry.pending_share_in, 1_000);
        assert_eq!(entry.pending_share_out, 250);
    }

    #[test]
    fn attribution_transfer_moves_both_ways() {
        let (vault, asset) = pair();
        let mut ledger = VirtualBalanceLedger::new();
        ledger.open_entry(vault, asset);
        ledger.apply_settlement(vault, asset, 5_000_000, BatchFlows::default()).unwrap();

        // Positive netted pulls attribution out of the reserve.
        ledger.transfer_attribution(vault, asset, 1_500_000).unwrap();
        assert_eq!(ledger.entry(&vault, &asset).unwrap().last_known_total, 3_500_000);

        // Negative netted hands it back.
        ledger.transfer_attribution(vault, asset, -500_000).unwrap();
        assert_eq!(ledger.entry(&vault, &asset).unwrap().last_known_total, 4_000_000);
    }

    #[test]
    fn attribution_underflow_rejected() {
        let (vault, asset) = pair();
        let mut ledger = VirtualBalanceLedger::new();
        ledger.open_entry(vault, asset);
        ledger.apply_settlement(vault, asset, 100, BatchFlows::default()).unwrap();

        assert!(matches!(
            ledger.transfer_attribution(vault, asset, 101),
            Err(LedgerError::Underflow { current: 100, amount: 101 })
        ));
        // Failed transfer leaves the entry untouched.
        assert_eq!(ledger.entry(&vault, &asset).unwrap().last_known_total, 100);
    }

    #[test]
    fn share_supply_adjustments() {
        let (vault, asset) = pair();
        let mut ledger = VirtualBalanceLedger::new();
        ledger.open_entry(vault, asset);

        ledger.adjust_share_supply(vault, asset, 1_000).unwrap();
        ledger.adjust_share_supply(vault, asset, -400).unwrap();
        assert_eq!(ledger.entry(&vault, &asset).unwrap().share_supply, 600);

        assert!(ledger.adjust_share_supply(vault, asset, -601).is_err());
    }

    #[test]
    fn total_attributed_sums_per_asset() {
        let asset = AssetId::derive("aUSD", "aurum:issuer");
        let reserve = VaultId::derive("reserve", &asset);
        let retail = VaultId::derive("retail", &asset);
        let other_asset = AssetId::derive("aEUR", "aurum:issuer");
        let other = VaultId::derive("reserve", &other_asset);

        let mut ledger = VirtualBalanceLedger::new();
        ledger.open_entry(reserve, asset);
        ledger.open_entry(retail, asset);
        ledger.open_entry(other, other_asset);

        ledger.apply_settlement(reserve, asset, 7_000_000, BatchFlows::default()).unwrap();
        ledger.record_deposit(retail, asset, 1_000_000).unwrap();
        ledger.apply_settlement(other, other_asset, 999, BatchFlows::default()).unwrap();

        assert_eq!(ledger.total_attributed(&asset), 8_000_000);
        assert_eq!(ledger.total_attributed(&other_asset), 999);
    }
}
