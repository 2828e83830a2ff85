// =============================================================================
// Shared types used across the copy-trading engine
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// Long or short, as observed on the source account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// `+1.0` for long, `-1.0` for short — the sign convention used by every
    /// PnL and price-distance computation in the engine.
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// A region tag attached to an account reference. The engine never
/// interprets this beyond handing it to the broker gateway.
pub type RegionTag = String;

/// Opaque account identifier plus the region the gateway should resolve it
/// through. The engine never stores credentials — only this reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountRef {
    pub account_id: String,
    pub region: RegionTag,
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.account_id, self.region)
    }
}

/// Account balance/equity snapshot as returned by
/// `BrokerGateway::get_account_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    pub currency: String,
    pub leverage: f64,
}
