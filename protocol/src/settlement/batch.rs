//! # Batch State Machine
//!
//! One batch is one settlement epoch for a single `(vault, asset)`
//! pair. The lifecycle is strictly linear:
//!
//! ```text
//! ACTIVE ──close──▶ CLOSED ──settle──▶ SETTLED (terminal)
//! ```
//!
//! While ACTIVE the batch accumulates gross deposit and redemption
//! totals; CLOSED batches accept no further requests and wait for a
//! settlement proposal; SETTLED batches are frozen forever, carrying
//! the snapshot that prices every claim against them.
//!
//! The [`BatchBook`] enforces the core invariant: at most one ACTIVE
//! batch per pair at any time, with a monotonically increasing
//! per-asset sequence so batch history is totally ordered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::id::{AssetId, BatchId, VaultId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during batch lifecycle operations.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The referenced batch does not exist.
    #[error("batch not found: {0}")]
    NotFound(BatchId),

    /// Tried to open a second ACTIVE batch for the same pair.
    #[error("an active batch already exists for vault {vault} / asset {asset}")]
    AlreadyActive {
        /// The vault of the pair.
        vault: VaultId,
        /// The asset of the pair.
        asset: AssetId,
    },

    /// The batch is not in the state the operation requires.
    #[error("invalid batch state: batch is {current}, expected {expected}")]
    InvalidState {
        /// The batch's current lifecycle state.
        current: BatchState,
        /// The state required for this operation.
        expected: BatchState,
    },

    /// A totals update would overflow u64.
    #[error("batch totals overflow: adding {amount} to {current}")]
    TotalsOverflow {
        /// The running total before the failed update.
        current: u64,
        /// The amount that caused the overflow.
        amount: u64,
    },
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Lifecycle state of a batch, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchState {
    /// Accepting requests.
    Active,
    /// Closed to new requests, awaiting settlement.
    Closed,
    /// Settled; totals and snapshot frozen forever.
    Settled,
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchState::Active => write!(f, "Active"),
            BatchState::Closed => write!(f, "Closed"),
            BatchState::Settled => write!(f, "Settled"),
        }
    }
}

/// Totals captured at settlement execution and frozen into the batch.
///
/// Every claim against the batch is priced off these numbers, never off
/// live state, so request ordering within a batch cannot affect payout
/// fairness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementSnapshot {
    /// Gross reported deployment total, before fee deduction.
    pub total_assets: u64,
    /// Fee-net pre-flow asset basis used for share pricing.
    pub total_net_assets: u64,
    /// Share supply at settlement (zero for asset-backed vaults).
    pub total_share_supply: u64,
}

/// One settlement epoch for a `(vault, asset)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Unique identifier, derived from vault/asset/sequence/entropy.
    pub id: BatchId,
    /// The vault this batch settles.
    pub vault: VaultId,
    /// The asset this batch is denominated in.
    pub asset: AssetId,
    /// Position in the per-asset batch sequence, starting at 1.
    pub sequence: u64,
    /// Token-ledger address of this batch's escrow.
    pub escrow: String,
    /// Gross deposits recorded while the batch was active,
    /// in asset/token units.
    pub deposited: u64,
    /// Gross redemption requests, in asset/token units
    /// (asset-backed vaults only).
    pub requested: u64,
    /// Estimated shares entering via stake requests (share vaults).
    pub share_in: u64,
    /// Shares exiting via unstake requests (share vaults).
    pub share_out: u64,
    /// Set once the batch stops accepting requests.
    pub closed: bool,
    /// Set once a settlement proposal executed against the batch.
    pub settled: bool,
    /// Frozen at settlement; `None` until then.
    pub snapshot: Option<SettlementSnapshot>,
    /// Timestamp when the batch was created.
    pub created_at: DateTime<Utc>,
    /// Timestamp when the batch was closed.
    pub closed_at: Option<DateTime<Utc>>,
    /// Timestamp when the batch was settled.
    pub settled_at: Option<DateTime<Utc>>,
}

impl Batch {
    fn new(vault: VaultId, asset: AssetId, sequence: u64) -> Self {
        let id = BatchId::derive(&vault, &asset, sequence);
        Self {
            id,
            vault,
            asset,
            sequence,
            escrow: id.escrow_address(),
            deposited: 0,
            requested: 0,
            share_in: 0,
            share_out: 0,
            closed: false,
            settled: false,
            snapshot: None,
            created_at: Utc::now(),
            closed_at: None,
            settled_at: None,
        }
    }

    /// The batch's current lifecycle state.
    pub fn state(&self) -> BatchState {
        if self.settled {
            BatchState::Settled
        } else if self.closed {
            BatchState::Closed
        } else {
            BatchState::Active
        }
    }
}

// ---------------------------------------------------------------------------
// BatchBook
// ---------------------------------------------------------------------------

/// Which gross total a ledger mutation feeds. Totals are monotonically
/// non-decreasing until settlement freezes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchTotal {
    /// Asset/token units deposited.
    Deposited,
    /// Asset/token units requested for redemption.
    Requested,
    /// Shares entering (stake side, informational estimate).
    ShareIn,
    /// Shares exiting (unstake side, drives settlement).
    ShareOut,
}

/// The store of all batches, keyed by id, with the one-active-batch
/// invariant per `(vault, asset)` pair and a per-asset sequence counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchBook {
    #[serde(with = "crate::id::batch_id_map")]
    batches: HashMap<BatchId, Batch>,
    active: HashMap<(VaultId, AssetId), BatchId>,
    sequences: HashMap<AssetId, u64>,
}

impl BatchBook {
    /// Creates an empty batch book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a fresh ACTIVE batch for the pair.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::AlreadyActive`] if the pair already has an
    /// open batch.
    pub fn create(&mut self, vault: VaultId, asset: AssetId) -> Result<BatchId, BatchError> {
        if self.active.contains_key(&(vault, asset)) {
            return Err(BatchError::AlreadyActive { vault, asset });
        }

        let sequence = self.sequences.entry(asset).or_insert(0);
        *sequence += 1;
        let batch = Batch::new(vault, asset, *sequence);
        let id = batch.id;
        self.batches.insert(id, batch);
        self.active.insert((vault, asset), id);
        Ok(id)
    }

    /// Closes the batch to new requests. When `open_next` is set, the
    /// successor batch is opened in the same call so the pair never has
    /// a gap in request acceptance.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidState`] if the batch is not ACTIVE.
    pub fn close(
        &mut self,
        batch_id: BatchId,
        open_next: bool,
    ) -> Result<Option<BatchId>, BatchError> {
        let batch = self
            .batches
            .get_mut(&batch_id)
            .ok_or(BatchError::NotFound(batch_id))?;

        if batch.state() != BatchState::Active {
            return Err(BatchError::InvalidState {
                current: batch.state(),
                expected: BatchState::Active,
            });
        }

        batch.closed = true;
        batch.closed_at = Some(Utc::now());
        let vault = batch.vault;
        let asset = batch.asset;
        self.active.remove(&(vault, asset));

        if open_next {
            Ok(Some(self.create(vault, asset)?))
        } else {
            Ok(None)
        }
    }

    /// Marks the batch settled and freezes its snapshot. Called only by
    /// the settlement engine from a successful execution.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidState`] unless the batch is CLOSED.
    pub fn settle(
        &mut self,
        batch_id: BatchId,
        snapshot: SettlementSnapshot,
    ) -> Result<(), BatchError> {
        let batch = self
            .batches
            .get_mut(&batch_id)
            .ok_or(BatchError::NotFound(batch_id))?;

        if batch.state() != BatchState::Closed {
            return Err(BatchError::InvalidState {
                current: batch.state(),
                expected: BatchState::Closed,
            });
        }

        batch.settled = true;
        batch.snapshot = Some(snapshot);
        batch.settled_at = Some(Utc::now());
        Ok(())
    }

    /// Adds `amount` to one of the batch's gross totals. Only legal
    /// while the batch is ACTIVE (requests) -- the engine never grows
    /// totals after close.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidState`] if the batch is closed or
    /// settled, [`BatchError::TotalsOverflow`] on u64 overflow.
    pub fn accumulate(
        &mut self,
        batch_id: BatchId,
        total: BatchTotal,
        amount: u64,
    ) -> Result<(), BatchError> {
        let batch = self
            .batches
            .get_mut(&batch_id)
            .ok_or(BatchError::NotFound(batch_id))?;

        if batch.state() != BatchState::Active {
            return Err(BatchError::InvalidState {
                current: batch.state(),
                expected: BatchState::Active,
            });
        }

        let slot = match total {
            BatchTotal::Deposited => &mut batch.deposited,
            BatchTotal::Requested => &mut batch.requested,
            BatchTotal::ShareIn => &mut batch.share_in,
            BatchTotal::ShareOut => &mut batch.share_out,
        };
        *slot = slot.checked_add(amount).ok_or(BatchError::TotalsOverflow {
            current: *slot,
            amount,
        })?;
        Ok(())
    }

    /// Looks up a batch by id.
    pub fn get(&self, batch_id: &BatchId) -> Result<&Batch, BatchError> {
        self.batches.get(batch_id).ok_or(BatchError::NotFound(*batch_id))
    }

    /// The currently ACTIVE batch for a pair, if one is open.
    pub fn active_batch(&self, vault: &VaultId, asset: &AssetId) -> Option<&Batch> {
        self.active
            .get(&(*vault, *asset))
            .and_then(|id| self.batches.get(id))
    }

    /// The per-asset sequence counter (number of batches ever created).
    pub fn sequence(&self, asset: &AssetId) -> u64 {
        self.sequences.get(asset).copied().unwrap_or(0)
    }
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
    fn create_opens_active_batch() {
        let (vault, asset) = pair();
        let mut book = BatchBook::new();
        let id = book.create(vault, asset).unwrap();

        let batch = book.get(&id).unwrap();
        assert_eq!(batch.state(), BatchState::Active);
        assert_eq!(batch.sequence, 1);
        assert_eq!(batch.deposited, 0);
        assert!(book.active_batch(&vault, &asset).is_some());
    }

    #[test]
    fn second_active_batch_rejected() {
        let (vault, asset) = pair();
        let mut book = BatchBook::new();
        book.create(vault, asset).unwrap();
        assert!(matches!(
            book.create(vault, asset),
            Err(BatchError::AlreadyActive { .. })
        ));
    }

    #[test]
    fn close_with_open_next_leaves_no_gap() {
        let (vault, asset) = pair();
        let mut book = BatchBook::new();
        let first = book.create(vault, asset).unwrap();

        let next = book.close(first, true).unwrap().unwrap();
        assert_ne!(first, next);
        assert_eq!(book.get(&first).unwrap().state(), BatchState::Closed);
        assert_eq!(book.get(&next).unwrap().state(), BatchState::Active);
        assert_eq!(book.get(&next).unwrap().sequence, 2);
        assert_eq!(book.active_batch(&vault, &asset).unwrap().id, next);
    }

    #[test]
    fn close_without_open_next() {
        let (vault, asset) = pair();
        let mut book = BatchBook::new();
        let id = book.create(vault, asset).unwrap();
        assert_eq!(book.close(id, false).unwrap(), None);
        assert!(book.active_batch(&vault, &asset).is_none());
    }

    #[test]
    fn double_close_rejected() {
        let (vault, asset) = pair();
        let mut book = BatchBook::new();
        let id = book.create(vault, asset).unwrap();
        book.close(id, false).unwrap();
        assert!(matches!(
            book.close(id, false),
            Err(BatchError::InvalidState { .. })
        ));
    }

    #[test]
    fn settle_requires_closed() {
        let (vault, asset) = pair();
        let mut book = BatchBook::new();
        let id = book.create(vault, asset).unwrap();
        let snapshot = SettlementSnapshot {
            total_assets: 0,
            total_net_assets: 0,
            total_share_supply: 0,
        };

        // Active batch cannot be settled.
        assert!(book.settle(id, snapshot).is_err());

        book.close(id, false).unwrap();
        book.settle(id, snapshot).unwrap();
        assert_eq!(book.get(&id).unwrap().state(), BatchState::Settled);

        // And never twice.
        assert!(book.settle(id, snapshot).is_err());
    }

    #[test]
    fn accumulate_grows_totals_while_active() {
        let (vault, asset) = pair();
        let mut book = BatchBook::new();
        let id = book.create(vault, asset).unwrap();

        book.accumulate(id, BatchTotal::Deposited, 2_000_000).unwrap();
        book.accumulate(id, BatchTotal::Deposited, 500_000).unwrap();
        book.accumulate(id, BatchTotal::Requested, 300_000).unwrap();

        let batch = book.get(&id).unwrap();
        assert_eq!(batch.deposited, 2_500_000);
        assert_eq!(batch.requested, 300_000);
    }

    #[test]
    fn accumulate_rejected_after_close() {
        let (vault, asset) = pair();
        let mut book = BatchBook::new();
        let id = book.create(vault, asset).unwrap();
        book.close(id, false).unwrap();
        assert!(matches!(
            book.accumulate(id, BatchTotal::Deposited, 1),
            Err(BatchError::InvalidState { .. })
        ));
    }

    #[test]
    fn accumulate_overflow_rejected() {
        let (vault, asset) = pair();
        let mut book = BatchBook::new();
        let id = book.create(vault, asset).unwrap();
        book.accumulate(id, BatchTotal::Deposited, u64::MAX).unwrap();
        assert!(matches!(
            book.accumulate(id, BatchTotal::Deposited, 1),
            Err(BatchError::TotalsOverflow { .. })
        ));
    }

    #[test]
    fn sequence_counts_per_asset() {
        let (vault, asset) = pair();
        let other_asset = AssetId::derive("aEUR", "aurum:issuer");
        let other_vault = VaultId::derive("treasury", &other_asset);
        let mut book = BatchBook::new();

        let a = book.create(vault, asset).unwrap();
        book.close(a, true).unwrap();
        book.create(other_vault, other_asset).unwrap();

        assert_eq!(book.sequence(&asset), 2);
        assert_eq!(book.sequence(&other_asset), 1);
    }
}
