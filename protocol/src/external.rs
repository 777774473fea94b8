//! # Collaborator Seams
//!
//! The settlement core never owns its token supply, its permission
//! model, or its strategy plumbing -- those are external collaborators
//! behind the three traits here:
//!
//! - [`TokenBackend`] -- the fungible backing token (mint/burn/transfer).
//! - [`RoleAuthority`] -- capability checks for relayer/guardian/admin.
//! - [`StrategyRecorder`] -- the execution-authorization layer that
//!   physically moves capital; the engine only tells it the recorded
//!   total after each settlement and never moves assets itself.
//!
//! The in-memory reference implementations ([`InMemoryToken`],
//! [`StaticRoles`], [`RecordingStrategy`]) back the test suites and the
//! relayer simulator. Production deployments supply adapters to the
//! real token and authorization systems instead.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;

use crate::id::VaultId;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the token collaborator.
#[derive(Debug, Error)]
pub enum TokenError {
    /// A mint would overflow the total supply.
    #[error("supply overflow: minting {amount} would exceed u64::MAX")]
    SupplyOverflow {
        /// The amount that was attempted.
        amount: u64,
    },

    /// The account does not hold enough tokens for a burn or transfer.
    #[error("insufficient balance: account {account} has {balance}, needs {amount}")]
    InsufficientBalance {
        /// The account that was being debited.
        account: String,
        /// Current balance of the account.
        balance: u64,
        /// Amount the operation required.
        amount: u64,
    },
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Capabilities recognized by the settlement core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// May create/close batches and propose settlements.
    Relayer,
    /// May accept or cancel settlement proposals.
    Guardian,
    /// May register vaults and tune cooldown/tolerance.
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Relayer => write!(f, "Relayer"),
            Role::Guardian => write!(f, "Guardian"),
            Role::Admin => write!(f, "Admin"),
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// The fungible backing-token collaborator.
///
/// Supply changes (mint/burn) happen only during settlement execution
/// and 1:1 institutional deposits; transfers move escrowed tokens
/// between user, vault, and batch-escrow addresses.
pub trait TokenBackend {
    /// Mints `amount` new tokens to `to`, growing total supply.
    fn mint(&mut self, to: &str, amount: u64) -> Result<(), TokenError>;

    /// Burns `amount` tokens from `from`, shrinking total supply.
    fn burn(&mut self, from: &str, amount: u64) -> Result<(), TokenError>;

    /// Moves `amount` tokens between accounts; supply unchanged.
    fn transfer(&mut self, from: &str, to: &str, amount: u64) -> Result<(), TokenError>;

    /// Current balance of `account` (0 for unknown accounts).
    fn balance_of(&self, account: &str) -> u64;

    /// Current total outstanding supply.
    fn total_supply(&self) -> u64;
}

/// The authorization collaborator. Queried by capability, never
/// re-implemented per component.
pub trait RoleAuthority {
    /// Returns `true` if `actor` holds `role`.
    fn has_role(&self, actor: &str, role: Role) -> bool;
}

/// The execution-authorization collaborator that fronts external yield
/// strategies. The engine calls [`set_recorded_total`] exactly once per
/// executed settlement; everything else about strategy execution is out
/// of the core's hands.
///
/// [`set_recorded_total`]: StrategyRecorder::set_recorded_total
pub trait StrategyRecorder {
    /// Records the vault's post-settlement deployment total.
    fn set_recorded_total(&mut self, vault: VaultId, amount: u64);
}

// ---------------------------------------------------------------------------
// InMemoryToken
// ---------------------------------------------------------------------------

/// Supply-tracked in-memory token ledger.
///
/// Per-address balances and total supply are maintained atomically, with
/// overflow checked on every operation. Backs the protocol test suites
/// and the relayer simulator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryToken {
    balances: HashMap<String, u64>,
    total_supply: u64,
}

impl InMemoryToken {
    /// Creates an empty ledger with zero supply.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenBackend for InMemoryToken {
    fn mint(&mut self, to: &str, amount: u64) -> Result<(), TokenError> {
        let new_supply = self
            .total_supply
            .checked_add(amount)
            .ok_or(TokenError::SupplyOverflow { amount })?;

        let balance = self.balances.entry(to.to_string()).or_insert(0);
        *balance = balance
            .checked_add(amount)
            .ok_or(TokenError::SupplyOverflow { amount })?;
        self.total_supply = new_supply;
        Ok(())
    }

    fn burn(&mut self, from: &str, amount: u64) -> Result<(), TokenError> {
        if amount == 0 {
            return Ok(());
        }
        let balance = self.balances.get(from).copied().unwrap_or(0);
        if balance < amount {
            return Err(TokenError::InsufficientBalance {
                account: from.to_string(),
                balance,
                amount,
            });
        }

        *self.balances.entry(from.to_string()).or_insert(0) -= amount;
        // Supply cannot underflow: every balance was minted into it.
        self.total_supply -= amount;
        Ok(())
    }

    fn transfer(&mut self, from: &str, to: &str, amount: u64) -> Result<(), TokenError> {
        if amount == 0 {
            return Ok(());
        }
        let from_balance = self.balances.get(from).copied().unwrap_or(0);
        if from_balance < amount {
            return Err(TokenError::InsufficientBalance {
                account: from.to_string(),
                balance: from_balance,
                amount,
            });
        }
        if from == to {
            return Ok(());
        }

        *self.balances.entry(from.to_string()).or_insert(0) -= amount;
        let to_balance = self.balances.entry(to.to_string()).or_insert(0);
        *to_balance = to_balance
            .checked_add(amount)
            .ok_or(TokenError::SupplyOverflow { amount })?;
        Ok(())
    }

    fn balance_of(&self, account: &str) -> u64 {
        self.balances.get(account).copied().unwrap_or(0)
    }

    fn total_supply(&self) -> u64 {
        self.total_supply
    }
}

// ---------------------------------------------------------------------------
// StaticRoles
// ---------------------------------------------------------------------------

/// Role store backed by a plain set of `(actor, role)` grants.
#[derive(Debug, Clone, Default)]
pub struct StaticRoles {
    grants: HashSet<(String, Role)>,
}

impl StaticRoles {
    /// Creates an empty role store -- every check fails until grants
    /// are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `role` to `actor`.
    pub fn grant(&mut self, actor: &str, role: Role) {
        self.grants.insert((actor.to_string(), role));
    }

    /// Revokes `role` from `actor`. A no-op if the grant did not exist.
    pub fn revoke(&mut self, actor: &str, role: Role) {
        self.grants.remove(&(actor.to_string(), role));
    }
}

impl RoleAuthority for StaticRoles {
    fn has_role(&self, actor: &str, role: Role) -> bool {
        self.grants.contains(&(actor.to_string(), role))
    }
}

// ---------------------------------------------------------------------------
// RecordingStrategy
// ---------------------------------------------------------------------------

/// Strategy recorder that just remembers the last reported total per
/// vault, so tests can assert the engine called it with the right value.
#[derive(Debug, Clone, Default)]
pub struct RecordingStrategy {
    totals: HashMap<VaultId, u64>,
}

impl RecordingStrategy {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// The last total recorded for `vault`, if any settlement executed.
    pub fn recorded_total(&self, vault: &VaultId) -> Option<u64> {
        self.totals.get(vault).copied()
    }
}

impl StrategyRecorder for RecordingStrategy {
    fn set_recorded_total(&mut self, vault: VaultId, amount: u64) {
        self.totals.insert(vault, amount);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
