//! # AURUM Protocol — Core Library
//!
//! Batch settlement for tokenized real-world capital. Deposits and
//! redemptions queue into per-vault batches, a relayer reports what the
//! externally deployed capital is actually worth, and a two-phase
//! proposal flow (net, isolate yield, cool down, execute) reconciles
//! the books in one atomic step.
//!
//! The design is deliberately boring where money is involved: explicit
//! state machines, checked arithmetic everywhere, and one invariant
//! that everything else serves -- the sum of vault attributions equals
//! the outstanding token supply after every settlement.
//!
//! ## Architecture
//!
//! - **id** — BLAKE3 content-addressed identifiers for every entity.
//! - **config** — Tolerance, cooldown, and cap parameters.
//! - **external** — The three collaborator seams: token backend, role
//!   authority, strategy recorder. Swap them, keep the settlement core.
//! - **settlement** — Batches, the virtual balance ledger, proposals,
//!   and the engine that drives them.
//! - **registry** — Per-user request records and the one-shot claim
//!   path.
//! - **gateway** — Institutional front: 1:1 mint and burn.
//! - **vault** — Retail front: share accounting over settled prices.
//!
//! ## Design Philosophy
//!
//! 1. Settlement executes completely or not at all.
//! 2. Yield is whatever the flows cannot explain. Isolate it, bound it,
//!    and make a guardian sign off when it looks wrong.
//! 3. If it touches balances, it has tests. Plural.

pub mod config;
pub mod external;
pub mod gateway;
pub mod id;
pub mod registry;
pub mod settlement;
pub mod vault;
