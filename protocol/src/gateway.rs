//! # Institutional Gateway
//!
//! The typed front for institutional flows against an asset-backed
//! reserve vault: deposits mint tokens 1:1 and settle into the vault's
//! attribution, redemptions escrow tokens until the batch settles and
//! principal becomes claimable.
//!
//! The gateway holds no state of its own. It binds a vault id and
//! borrows the engine per call, so several gateways can front the same
//! engine without ownership gymnastics.

use crate::external::{RoleAuthority, StrategyRecorder, TokenBackend};
use crate::id::{RequestId, VaultId};
use crate::settlement::engine::{ClaimOutcome, EngineError, SettlementEngine};

/// Institutional front over one asset-backed vault.
#[derive(Debug, Clone, Copy)]
pub struct InstitutionalGateway {
    vault: VaultId,
}

impl InstitutionalGateway {
    /// Binds a gateway to a registered asset-backed vault.
    pub fn new(vault: VaultId) -> Self {
        Self { vault }
    }

    /// The vault this gateway fronts.
    pub fn vault(&self) -> VaultId {
        self.vault
    }

    /// Deposits `amount` for `beneficiary`: tokens mint 1:1 right away
    /// and the capital joins the vault's open batch.
    pub fn deposit<T, A, R>(
        &self,
        engine: &mut SettlementEngine<T, A, R>,
        requester: &str,
        beneficiary: &str,
        amount: u64,
    ) -> Result<RequestId, EngineError>
    where
        T: TokenBackend,
        A: RoleAuthority,
        R: StrategyRecorder,
    {
        engine.submit_deposit(requester, beneficiary, self.vault, amount)
    }

    /// Requests redemption of `amount` tokens. The tokens move to the
    /// batch escrow now; principal becomes claimable once the batch
    /// settles.
    pub fn request_redemption<T, A, R>(
        &self,
        engine: &mut SettlementEngine<T, A, R>,
        requester: &str,
        beneficiary: &str,
        amount: u64,
    ) -> Result<RequestId, EngineError>
    where
        T: TokenBackend,
        A: RoleAuthority,
        R: StrategyRecorder,
    {
        engine.submit_redemption(requester, beneficiary, self.vault, amount)
    }

    /// Claims the principal of a settled redemption.
    pub fn claim<T, A, R>(
        &self,
        engine: &mut SettlementEngine<T, A, R>,
        caller: &str,
        request: RequestId,
    ) -> Result<ClaimOutcome, EngineError>
    where
        T: TokenBackend,
        A: RoleAuthority,
        R: StrategyRecorder,
    {
        engine.claim(caller, request)
    }

    /// The vault's virtual balance: settled attribution plus pending
    /// deposits. Institutions size external deployments off this.
    pub fn virtual_balance<T, A, R>(&self, engine: &SettlementEngine<T, A, R>) -> u64
    where
        T: TokenBackend,
        A: RoleAuthority,
        R: StrategyRecorder,
    {
        engine.virtual_balance(&self.vault)
    }
}
