// =============================================================================
// Domain Model — Route, Position, and Mapping shapes
// =============================================================================
//
// These types carry the data-model invariants described in the design: a
// `PositionMapping` is the sole authoritative link from a source position to
// the destination position opened to mirror it. The mapping's `status` field
// is a closed enum so an `active` mapping can only become `closed` (via the
// Copy Pipeline, on a confirmed destination close) or `orphaned` (via the
// Orphan Reconciler, when the source side has vanished) — never anything
// else, and never back to `active`.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AccountRef, Side};

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

/// Immutable-at-runtime routing configuration. A route is the unit of
/// isolation: one failing route must not stall others.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub name: String,
    pub source: AccountRef,
    pub destination: AccountRef,
    pub rule_set: String,
    pub enabled: bool,
    #[serde(default)]
    pub notifications: NotificationPrefs,
}

/// Per-route notification preferences.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationPrefs {
    #[serde(default = "default_true")]
    pub orphan_alerts: bool,
    #[serde(default = "default_true")]
    pub risk_alerts: bool,
    #[serde(default = "default_true")]
    pub connection_alerts: bool,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Position (observed on the source, or owned on the destination)
// ---------------------------------------------------------------------------

/// A position as reported by the broker gateway — used both for the
/// "source position (observed)" and "destination position (owned)" shapes.
/// The destination-only fields are `None` for source positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Broker-unique position id.
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub open_price: f64,
    pub open_time: DateTime<Utc>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub profit: f64,

    /// Destination-only: the route that opened this position.
    #[serde(default)]
    pub route_id: Option<String>,
    /// Destination-only: the source position id this mirrors.
    #[serde(default)]
    pub source_position_id: Option<String>,
    /// Destination-only: sizing metadata recorded at open time.
    #[serde(default)]
    pub sizing: Option<SizingMetadata>,
}

impl Position {
    /// Extract the source position id a destination comment encodes, if any.
    /// Comments written by this engine follow the `copy:<route_id>:<src_id>`
    /// convention (see `copy_pipeline::encode_comment`).
    pub fn source_id_from_comment(&self) -> Option<&str> {
        let comment = self.comment.as_deref()?;
        let mut parts = comment.splitn(3, ':');
        if parts.next()? != "copy" {
            return None;
        }
        let _route_id = parts.next()?;
        parts.next()
    }
}

/// Sizing metadata recorded on a destination position at open time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingMetadata {
    pub multiplier: f64,
    #[serde(default)]
    pub squeeze_score: Option<f64>,
}

// ---------------------------------------------------------------------------
// Position mapping
// ---------------------------------------------------------------------------

/// Status of a position mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingStatus {
    Active,
    Closed,
    Orphaned,
}

impl std::fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Closed => write!(f, "closed"),
            Self::Orphaned => write!(f, "orphaned"),
        }
    }
}

/// The central invariant-carrier: the durable link from a source position to
/// the destination position opened to mirror it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionMapping {
    pub source_account: AccountRef,
    pub source_position_id: String,
    pub destination_account: AccountRef,
    pub destination_position_id: String,
    pub route_id: String,
    pub symbol: String,
    pub open_time: DateTime<Utc>,
    pub status: MappingStatus,
    pub last_seen: DateTime<Utc>,
}

impl PositionMapping {
    pub fn source_key(&self) -> (AccountRef, String) {
        (self.source_account.clone(), self.source_position_id.clone())
    }

    pub fn dest_key(&self) -> (AccountRef, String) {
        (
            self.destination_account.clone(),
            self.destination_position_id.clone(),
        )
    }
}

/// Reason a destination position was classified as an orphan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrphanReason {
    /// Mapping exists but the source position it pointed to no longer exists.
    SourceClosed,
    /// No mapping exists at all for this destination position.
    NoMapping,
}

impl std::fmt::Display for OrphanReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceClosed => write!(f, "source-closed"),
            Self::NoMapping => write!(f, "no-mapping"),
        }
    }
}

// ---------------------------------------------------------------------------
// Order request / outcomes passed to the Broker Gateway
// ---------------------------------------------------------------------------

/// A market order request handed to `BrokerGateway::execute_trade`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_id_from_comment_parses_engine_format() {
        let pos = Position {
            position_id: "d1".into(),
            symbol: "XAUUSD".into(),
            side: Side::Long,
            volume: 0.2,
            open_price: 2400.0,
            open_time: Utc::now(),
            stop_loss: None,
            take_profit: None,
            comment: Some("copy:route-1:src-42".into()),
            current_price: 0.0,
            profit: 0.0,
            route_id: None,
            source_position_id: None,
            sizing: None,
        };
        assert_eq!(pos.source_id_from_comment(), Some("src-42"));
    }

    #[test]
    fn source_id_from_comment_rejects_foreign_comment() {
        let mut pos_comment = None;
        std::mem::swap(&mut pos_comment, &mut Some("manual trade".to_string()));
        let pos = Position {
            position_id: "d1".into(),
            symbol: "XAUUSD".into(),
            side: Side::Long,
            volume: 0.2,
            open_price: 2400.0,
            open_time: Utc::now(),
            stop_loss: None,
            take_profit: None,
            comment: pos_comment,
            current_price: 0.0,
            profit: 0.0,
            route_id: None,
            source_position_id: None,
            sizing: None,
        };
        assert_eq!(pos.source_id_from_comment(), None);
    }
}
