//! # Request Registry
//!
//! Tracks every user-level claim on a batch: institutional mint/burn
//! requests and retail stake/unstake requests. A request escrows its
//! input when created, rides through batch close and settlement as
//! `Pending`, and transitions to `Claimed` exactly once when its owner
//! collects the output.
//!
//! The registry enforces the ownership rule directly: only the original
//! requester or the named beneficiary may claim. It deliberately knows
//! nothing about batches or payout math -- the settlement engine checks
//! batch state and prices the payout, then asks the registry to flip
//! the status. The two-phase claim ([`RequestRegistry::claimable`] then
//! [`RequestRegistry::mark_claimed`]) keeps the status untouched when a
//! payout step fails.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::id::{BatchId, RequestId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The referenced request does not exist.
    #[error("request not found: {0}")]
    NotFound(RequestId),

    /// The caller is neither the requester nor the beneficiary.
    #[error("unauthorized: {caller} does not own request {request}")]
    NotOwner {
        /// The address that attempted the claim.
        caller: String,
        /// The request being claimed.
        request: RequestId,
    },

    /// The request already reached its terminal status.
    #[error("request {0} already claimed")]
    AlreadyClaimed(RequestId),
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What the request asks the protocol to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    /// Institutional deposit. Tokens mint 1:1 at creation time, so the
    /// request is recorded already terminal for audit and cap tracking.
    Mint,
    /// Institutional redemption: tokens escrowed now, principal
    /// claimable after settlement.
    Burn,
    /// Retail stake: tokens escrowed now, shares claimable after
    /// settlement.
    Stake,
    /// Retail unstake: shares escrowed now, tokens claimable after
    /// settlement.
    Unstake,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestKind::Mint => write!(f, "Mint"),
            RequestKind::Burn => write!(f, "Burn"),
            RequestKind::Stake => write!(f, "Stake"),
            RequestKind::Unstake => write!(f, "Unstake"),
        }
    }
}

/// Status of a request. Exactly one transition, ever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Waiting for batch settlement and the owner's claim.
    Pending,
    /// Output delivered. Terminal.
    Claimed,
}

/// One user's pending claim within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique identifier.
    pub id: RequestId,
    /// What this request does.
    pub kind: RequestKind,
    /// Address that created the request and escrowed the input.
    pub requester: String,
    /// Address entitled to the output. Often equals `requester`.
    pub beneficiary: String,
    /// Input amount: asset/token units for Mint/Burn/Stake, shares for
    /// Unstake.
    pub amount: u64,
    /// The batch this request settles with.
    pub batch_id: BatchId,
    /// Current status.
    pub status: RequestStatus,
    /// Timestamp when the request was created.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the claim, if it happened.
    pub claimed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// RequestRegistry
// ---------------------------------------------------------------------------

/// Store of all requests plus a per-user index of open (unclaimed) ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestRegistry {
    requests: HashMap<RequestId, Request>,
    open_by_user: HashMap<String, Vec<RequestId>>,
}

impl RequestRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new request against a batch. The caller (the engine)
    /// has already validated batch state, caps, and escrowed the input.
    ///
    /// `Mint` requests are stored already `Claimed`: their output was
    /// delivered at creation, so there is nothing left to collect.
    pub fn create(
        &mut self,
        kind: RequestKind,
        requester: &str,
        beneficiary: &str,
        amount: u64,
        batch_id: BatchId,
    ) -> RequestId {
        let id = RequestId::derive(&batch_id, requester);
        let now = Utc::now();
        let terminal = kind == RequestKind::Mint;
        let request = Request {
            id,
            kind,
            requester: requester.to_string(),
            beneficiary: beneficiary.to_string(),
            amount,
            batch_id,
            status: if terminal {
                RequestStatus::Claimed
            } else {
                RequestStatus::Pending
            },
            created_at: now,
            claimed_at: if terminal { Some(now) } else { None },
        };
        self.requests.insert(id, request);
        if !terminal {
            self.open_by_user
                .entry(requester.to_string())
                .or_default()
                .push(id);
        }
        id
    }

    /// Looks up a request by id.
    pub fn get(&self, id: &RequestId) -> Result<&Request, RequestError> {
        self.requests.get(id).ok_or(RequestError::NotFound(*id))
    }

    /// All requests created by `user`, open and terminal alike.
    pub fn user_requests(&self, user: &str) -> Vec<&Request> {
        self.requests
            .values()
            .filter(|r| r.requester == user)
            .collect()
    }

    /// Ids of `user`'s still-unclaimed requests.
    pub fn open_requests(&self, user: &str) -> &[RequestId] {
        self.open_by_user
            .get(user)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Validates that `caller` may claim the request right now:
    /// ownership and non-terminal status. Returns the request for the
    /// engine to price; does not mutate.
    pub fn claimable(&self, id: &RequestId, caller: &str) -> Result<&Request, RequestError> {
        let request = self.get(id)?;
        if caller != request.requester && caller != request.beneficiary {
            return Err(RequestError::NotOwner {
                caller: caller.to_string(),
                request: *id,
            });
        }
        if request.status == RequestStatus::Claimed {
            return Err(RequestError::AlreadyClaimed(*id));
        }
        Ok(request)
    }

    /// Flips the request to its terminal status and drops it from the
    /// owner's open index. Called after the payout has been delivered.
    pub fn mark_claimed(&mut self, id: &RequestId) -> Result<(), RequestError> {
        let request = self.requests.get_mut(id).ok_or(RequestError::NotFound(*id))?;
        if request.status == RequestStatus::Claimed {
            return Err(RequestError::AlreadyClaimed(*id));
        }
        request.status = RequestStatus::Claimed;
        request.claimed_at = Some(Utc::now());

        if let Some(open) = self.open_by_user.get_mut(&request.requester) {
            open.retain(|open_id| open_id != id);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{AssetId, VaultId};

    fn batch_id() -> BatchId {
        let asset = AssetId::derive("aUSD", "aurum:issuer");
        let vault = VaultId::derive("treasury", &asset);
        BatchId::derive(&vault, &asset, 1)
    }

    #[test]
    fn create_indexes_open_request() {
        let mut registry = RequestRegistry::new();
        let id = registry.create(RequestKind::Burn, "inst-a", "inst-a", 1_000_000, batch_id());

        let request = registry.get(&id).unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(registry.open_requests("inst-a"), &[id]);
    }

    #[test]
    fn mint_request_is_terminal_at_creation() {
        let mut registry = RequestRegistry::new();
        let id = registry.create(RequestKind::Mint, "inst-a", "inst-a", 1_000_000, batch_id());

        let request = registry.get(&id).unwrap();
        assert_eq!(request.status, RequestStatus::Claimed);
        assert!(registry.open_requests("inst-a").is_empty());
        assert!(matches!(
            registry.claimable(&id, "inst-a"),
            Err(RequestError::AlreadyClaimed(_))
        ));
    }

    #[test]
    fn owner_and_beneficiary_may_claim() {
        let mut registry = RequestRegistry::new();
        let id = registry.create(RequestKind::Burn, "inst-a", "desk-b", 500, batch_id());

        assert!(registry.claimable(&id, "inst-a").is_ok());
        assert!(registry.claimable(&id, "desk-b").is_ok());
    }

    #[test]
    fn third_party_cannot_claim() {
        let mut registry = RequestRegistry::new();
        let id = registry.create(RequestKind::Burn, "inst-a", "inst-a", 500, batch_id());

        assert!(matches!(
            registry.claimable(&id, "mallory"),
            Err(RequestError::NotOwner { .. })
        ));
    }

    #[test]
    fn mark_claimed_is_exactly_once() {
        let mut registry = RequestRegistry::new();
        let id = registry.create(RequestKind::Unstake, "user-1", "user-1", 250, batch_id());

        registry.mark_claimed(&id).unwrap();
        assert!(registry.open_requests("user-1").is_empty());
        assert!(matches!(
            registry.mark_claimed(&id),
            Err(RequestError::AlreadyClaimed(_))
        ));
        assert!(matches!(
            registry.claimable(&id, "user-1"),
            Err(RequestError::AlreadyClaimed(_))
        ));
    }

    #[test]
    fn user_requests_spans_all_statuses() {
        let mut registry = RequestRegistry::new();
        let batch = batch_id();
        registry.create(RequestKind::Mint, "inst-a", "inst-a", 100, batch);
        let open = registry.create(RequestKind::Burn, "inst-a", "inst-a", 50, batch);

        assert_eq!(registry.user_requests("inst-a").len(), 2);
        assert_eq!(registry.open_requests("inst-a"), &[open]);
        assert!(registry.user_requests("nobody").is_empty());
    }

    #[test]
    fn unknown_request_rejected() {
        let registry = RequestRegistry::new();
        let missing = RequestId::derive(&batch_id(), "ghost");
        assert!(matches!(
            registry.get(&missing),
            Err(RequestError::NotFound(_))
        ));
    }
}
