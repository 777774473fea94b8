//! # Identifiers
//!
//! Every entity in the settlement core -- assets, vaults, batches,
//! proposals, requests -- is addressed by a 32-byte BLAKE3-derived
//! identifier. Assets and vaults use deterministic content-addressed
//! derivation (same properties, same id, no registry coordination).
//! Batches, proposals, and requests combine a monotonic per-key sequence
//! with 16 bytes of fresh entropy, so identifiers are globally unique
//! and not predictable from public state alone.
//!
//! All five identifier types share the same representation and hex
//! encoding; the newtypes exist so the compiler catches a `BatchId`
//! handed to an API expecting a `ProposalId`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Domain-separation tags mixed into every derivation so that two
/// different entity types can never collide even on identical inputs.
/// These values are part of the persistent format and must never change.
const TAG_ASSET: u8 = 0x01;
const TAG_VAULT: u8 = 0x02;
const TAG_BATCH: u8 = 0x03;
const TAG_PROPOSAL: u8 = 0x04;
const TAG_REQUEST: u8 = 0x05;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Creates an identifier from raw 32-byte hash output.
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Returns the raw 32-byte identifier.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Returns the hex-encoded identifier.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parses a hex-encoded identifier.
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                if bytes.len() != 32 {
                    return Err(hex::FromHexError::InvalidStringLength);
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({}...)"), &self.to_hex()[..12])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl std::str::FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }
    };
}

define_id! {
    /// Content-addressed identifier for a settlement asset.
    ///
    /// Computed as `BLAKE3(0x01 || symbol || 0x00 || issuer)`. Two assets
    /// with identical properties always produce the same id.
    AssetId
}

define_id! {
    /// Content-addressed identifier for a vault.
    ///
    /// Computed as `BLAKE3(0x02 || name || 0x00 || asset_id)`.
    VaultId
}

define_id! {
    /// Identifier for one settlement batch.
    ///
    /// Combines vault, asset, the per-asset monotonic sequence number,
    /// and fresh entropy. The sequence keeps ids ordered per asset; the
    /// entropy keeps them collision-resistant and non-guessable.
    BatchId
}

define_id! {
    /// Identifier for one settlement proposal.
    ProposalId
}

define_id! {
    /// Identifier for one mint/burn/stake/unstake request.
    RequestId
}

impl AssetId {
    /// Derives an asset id from its canonical properties.
    pub fn derive(symbol: &str, issuer: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[TAG_ASSET]);
        hasher.update(symbol.as_bytes());
        hasher.update(&[0x00]);
        hasher.update(issuer.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

impl VaultId {
    /// Derives a vault id from its name and the asset it settles in.
    pub fn derive(name: &str, asset: &AssetId) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[TAG_VAULT]);
        hasher.update(name.as_bytes());
        hasher.update(&[0x00]);
        hasher.update(asset.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Returns the token-ledger address that holds this vault's own
    /// token balance (yield is minted here, losses are burned here).
    pub fn address(&self) -> String {
        format!("aurum:vault:{}", self.to_hex())
    }
}

impl BatchId {
    /// Derives a fresh batch id for the given pair and sequence number.
    pub fn derive(vault: &VaultId, asset: &AssetId, sequence: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[TAG_BATCH]);
        hasher.update(vault.as_bytes());
        hasher.update(asset.as_bytes());
        hasher.update(&sequence.to_be_bytes());
        hasher.update(&fresh_entropy());
        Self(*hasher.finalize().as_bytes())
    }

    /// Returns the token-ledger address of this batch's escrow, where
    /// requested tokens are parked until settlement and claims.
    pub fn escrow_address(&self) -> String {
        format!("aurum:escrow:{}", self.to_hex())
    }
}

impl ProposalId {
    /// Derives a fresh proposal id bound to the batch being settled.
    pub fn derive(batch: &BatchId, reported_total: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[TAG_PROPOSAL]);
        hasher.update(batch.as_bytes());
        hasher.update(&reported_total.to_be_bytes());
        hasher.update(&fresh_entropy());
        Self(*hasher.finalize().as_bytes())
    }
}

impl RequestId {
    /// Derives a fresh request id bound to the batch and requester.
    pub fn derive(batch: &BatchId, requester: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[TAG_REQUEST]);
        hasher.update(batch.as_bytes());
        hasher.update(requester.as_bytes());
        hasher.update(&fresh_entropy());
        Self(*hasher.finalize().as_bytes())
    }
}

/// 16 bytes of fresh randomness mixed into non-deterministic ids.
fn fresh_entropy() -> [u8; 16] {
    rand::random()
}

// ---------------------------------------------------------------------------
// Serde helper: serialize HashMap<Id, V> with hex-string keys
// ---------------------------------------------------------------------------

/// Serde helper for maps keyed by [`BatchId`], serialized as JSON objects
/// with hex-encoded string keys. JSON requires string keys, but the id
/// newtypes wrap `[u8; 32]` which serde would emit as an array.
pub mod batch_id_map {
    use super::BatchId;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;

    pub fn serialize<V, S>(map: &HashMap<BatchId, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        V: Serialize,
        S: Serializer,
    {
        use serde::ser::SerializeMap;
        let mut ser_map = serializer.serialize_map(Some(map.len()))?;
        for (key, value) in map {
            ser_map.serialize_entry(&key.to_hex(), value)?;
        }
        ser_map.end()
    }

    pub fn deserialize<'de, V, D>(deserializer: D) -> Result<HashMap<BatchId, V>, D::Error>
    where
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let string_map: HashMap<String, V> = HashMap::deserialize(deserializer)?;
        string_map
            .into_iter()
            .map(|(key, value)| {
                BatchId::from_hex(&key)
                    .map(|id| (id, value))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
