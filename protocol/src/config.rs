//! # Protocol Configuration & Constants
//!
//! Every tunable of the settlement core lives here. The constants are
//! the protocol defaults; per-deployment overrides go through
//! [`EngineConfig`], which validates the admin-supplied values against
//! the hard bounds below.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Yield tolerance
// ---------------------------------------------------------------------------

/// Denominator for basis-point arithmetic. 10_000 bps = 100%.
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Default yield tolerance: 1_000 bps = 10% of the vault's last known
/// balance. A reported yield beyond this flags the proposal for manual
/// guardian approval instead of failing it outright.
pub const DEFAULT_YIELD_TOLERANCE_BPS: u64 = 1_000;

/// Hard ceiling on the configurable tolerance. Beyond 100% the check is
/// meaningless -- every yield would pass unattended.
pub const MAX_YIELD_TOLERANCE_BPS: u64 = BPS_DENOMINATOR;

// ---------------------------------------------------------------------------
// Settlement cooldown
// ---------------------------------------------------------------------------

/// Default minimum wait between proposal and execution: 1 hour. Long
/// enough for a guardian to look at the numbers, short enough that
/// same-day settlement stays possible.
pub const DEFAULT_COOLDOWN_SECS: i64 = 3_600;

/// Hard ceiling on the configurable cooldown: 1 day. A longer cooldown
/// would strand user claims behind a single slow settlement.
pub const MAX_COOLDOWN_SECS: i64 = 86_400;

// ---------------------------------------------------------------------------
// Request caps
// ---------------------------------------------------------------------------

/// Default per-batch cap on gross deposits and gross redemption
/// requests, in smallest asset units. Deployments size this to the
/// liquidity their external strategies can absorb per settlement epoch.
pub const DEFAULT_BATCH_CAP: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Errors raised when an admin supplies out-of-bounds tunables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Tolerance beyond [`MAX_YIELD_TOLERANCE_BPS`].
    #[error("yield tolerance {0} bps exceeds maximum {MAX_YIELD_TOLERANCE_BPS} bps")]
    ToleranceTooHigh(u64),

    /// Cooldown beyond [`MAX_COOLDOWN_SECS`] or negative.
    #[error("cooldown {0}s outside allowed range 0..={MAX_COOLDOWN_SECS}s")]
    CooldownOutOfRange(i64),
}

/// Validated settlement-engine tunables.
///
/// Constructed once at engine startup and adjusted later only through
/// the engine's admin-gated API, so an out-of-range value can never be
/// smuggled in through a config file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Yield tolerance in basis points of the last known balance.
    pub yield_tolerance_bps: u64,
    /// Minimum wait between proposal creation and execution, seconds.
    pub cooldown_secs: i64,
}

impl EngineConfig {
    /// Creates a config, validating both values against the hard bounds.
    pub fn new(yield_tolerance_bps: u64, cooldown_secs: i64) -> Result<Self, ConfigError> {
        if yield_tolerance_bps > MAX_YIELD_TOLERANCE_BPS {
            return Err(ConfigError::ToleranceTooHigh(yield_tolerance_bps));
        }
        if !(0..=MAX_COOLDOWN_SECS).contains(&cooldown_secs) {
            return Err(ConfigError::CooldownOutOfRange(cooldown_secs));
        }
        Ok(Self {
            yield_tolerance_bps,
            cooldown_secs,
        })
    }

    /// The cooldown as a `chrono::Duration` for timestamp arithmetic.
    pub fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            yield_tolerance_bps: DEFAULT_YIELD_TOLERANCE_BPS,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
        }
    }
}
