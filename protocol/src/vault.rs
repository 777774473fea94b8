//! # Retail Vault
//!
//! The typed front for retail flows against a share-based vault. On
//! top of the engine's aggregate bookkeeping it keeps the per-holder
//! share ledger: stakes credit shares at claim time, unstakes escrow
//! the holder's shares until the batch settles and the claim pays out.
//!
//! Shares never leave the vault's books. They are minted by stake
//! claims, parked in escrow by unstake requests, and burned by unstake
//! claims, so the sum of holdings and escrowed shares always equals
//! the engine's recorded share supply.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::external::{RoleAuthority, StrategyRecorder, TokenBackend};
use crate::id::{RequestId, VaultId};
use crate::registry::RequestKind;
use crate::settlement::engine::{ClaimOutcome, EngineError, SettlementEngine};

/// Errors surfaced by retail vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The holder does not have the shares to unstake.
    #[error("{holder} holds {available} shares, {requested} requested")]
    InsufficientShares {
        /// The holder attempting the unstake.
        holder: String,
        /// Shares the holder has available.
        available: u64,
        /// Shares the request tried to escrow.
        requested: u64,
    },

    /// Underlying engine failure.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Retail front over one share-based vault, with the per-holder share
/// ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetailVault {
    vault: VaultId,
    holdings: HashMap<String, u64>,
    /// Shares parked by pending unstake requests: request id to
    /// (holder, shares).
    escrowed: HashMap<String, (String, u64)>,
}

impl RetailVault {
    /// Binds a retail vault to a registered share-based vault.
    pub fn new(vault: VaultId) -> Self {
        Self {
            vault,
            holdings: HashMap::new(),
            escrowed: HashMap::new(),
        }
    }

    /// The vault this front manages.
    pub fn vault(&self) -> VaultId {
        self.vault
    }

    /// Shares currently held by `holder`, excluding escrowed shares.
    pub fn shares_of(&self, holder: &str) -> u64 {
        self.holdings.get(holder).copied().unwrap_or(0)
    }

    /// Shares parked by a pending unstake request, if any.
    pub fn escrowed_shares(&self, request: &RequestId) -> Option<u64> {
        self.escrowed.get(&request.to_hex()).map(|(_, s)| *s)
    }

    /// Holdings plus escrow, across all holders. Mirrors the engine's
    /// recorded share supply for this vault.
    pub fn total_shares(&self) -> u64 {
        let held: u64 = self.holdings.values().sum();
        let parked: u64 = self.escrowed.values().map(|(_, s)| *s).sum();
        held + parked
    }

    /// Stakes `amount` tokens for `beneficiary`. The tokens escrow into
    /// the open batch; shares are credited when the settled request is
    /// claimed.
    pub fn stake<T, A, R>(
        &self,
        engine: &mut SettlementEngine<T, A, R>,
        requester: &str,
        beneficiary: &str,
        amount: u64,
    ) -> Result<RequestId, VaultError>
    where
        T: TokenBackend,
        A: RoleAuthority,
        R: StrategyRecorder,
    {
        Ok(engine.submit_stake(requester, beneficiary, self.vault, amount)?)
    }

    /// Queues `shares` of the requester's holdings for exit. The shares
    /// move into the vault's escrow until the batch settles and the
    /// claim pays out.
    pub fn request_unstake<T, A, R>(
        &mut self,
        engine: &mut SettlementEngine<T, A, R>,
        requester: &str,
        beneficiary: &str,
        shares: u64,
    ) -> Result<RequestId, VaultError>
    where
        T: TokenBackend,
        A: RoleAuthority,
        R: StrategyRecorder,
    {
        let available = self.shares_of(requester);
        if shares > available {
            return Err(VaultError::InsufficientShares {
                holder: requester.to_string(),
                available,
                requested: shares,
            });
        }

        let id = engine.submit_unstake(requester, beneficiary, self.vault, shares)?;
        // Engine accepted; move the shares out of the holder's balance.
        if let Some(held) = self.holdings.get_mut(requester) {
            *held -= shares;
        }
        self.escrowed
            .insert(id.to_hex(), (requester.to_string(), shares));
        Ok(id)
    }

    /// Claims a settled stake or unstake request and updates the share
    /// ledger accordingly: stakes credit the minted shares to the
    /// beneficiary, unstakes burn the escrowed shares.
    pub fn claim<T, A, R>(
        &mut self,
        engine: &mut SettlementEngine<T, A, R>,
        caller: &str,
        request: RequestId,
    ) -> Result<ClaimOutcome, VaultError>
    where
        T: TokenBackend,
        A: RoleAuthority,
        R: StrategyRecorder,
    {
        let beneficiary = engine.request(&request)?.beneficiary.clone();
        let outcome = engine.claim(caller, request)?;
        match outcome.kind {
            RequestKind::Stake => {
                *self.holdings.entry(beneficiary).or_insert(0) += outcome.amount;
            }
            RequestKind::Unstake => {
                self.escrowed.remove(&request.to_hex());
            }
            RequestKind::Mint | RequestKind::Burn => {}
        }
        Ok(outcome)
    }
}
