//! # Settlement Core
//!
//! The batch state machine, the virtual balance ledger, the proposal
//! records, and the engine that drives them through the two-phase
//! settlement flow. Everything else in the crate is a typed front over
//! [`engine::SettlementEngine`].

pub mod batch;
pub mod engine;
pub mod ledger;
pub mod proposal;

pub use batch::{Batch, BatchBook, BatchError, BatchState, BatchTotal, SettlementSnapshot};
pub use engine::{ClaimOutcome, EngineError, SettlementEngine, VaultKind, VaultProfile};
pub use ledger::{BatchFlows, LedgerError, ShareFlow, VaultEntry, VirtualBalanceLedger};
pub use proposal::{FeeSnapshot, ProposalStatus, SettlementProposal};
