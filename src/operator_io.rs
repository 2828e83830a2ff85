// =============================================================================
// Operator I/O — outbound alerts and alert-suppression tables
// =============================================================================
//
// Outbound alerts go to a single opaque chat channel via a thin `reqwest`
// webhook sink (a `send_message(&self, text: &str)` wrapper). Alert
// suppression tables throttle repeated notifications so a persistent
// condition — an orphaned position, a flaky connection — doesn't spam the
// channel on every check.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::types::AccountRef;

const ORPHAN_ALERT_SUPPRESSION: Duration = Duration::from_secs(24 * 3600);
const CONNECTION_ALERT_SUPPRESSION: Duration = Duration::from_secs(5 * 60);
const UNKNOWN_SYMBOL_ALERT_SUPPRESSION: Duration = Duration::from_secs(24 * 3600);
const DAILY_LIMIT_ALERT_SUPPRESSION: Duration = Duration::from_secs(24 * 3600);

/// Structured alert categories.
#[derive(Debug, Clone)]
pub enum Alert {
    ConnectionIssue { account: AccountRef, consecutive_failures: u32 },
    OrphanDetected { route_name: String, symbol: String, position_id: String, volume: f64, profit: f64, reason: String },
    UnknownSymbol { route_name: String, symbol: String },
    DailyLimitReached { route_name: String, reason: String },
    PhaseUpgraded { route_name: String, new_phase: u8 },
    EmergencyStopTriggered { route_name: String, equity_loss_pct: f64 },
    ConfigReloadRejected { error: String },
}

impl Alert {
    /// Render to the single-line structured text the outbound message sink
    /// expects.
    pub fn render(&self) -> String {
        match self {
            Alert::ConnectionIssue { account, consecutive_failures } => {
                format!(
                    "[connection-issue] account={account} consecutive_failures={consecutive_failures}"
                )
            }
            Alert::OrphanDetected { route_name, symbol, position_id, volume, profit, reason } => {
                format!(
                    "[orphan-detected] route={route_name} symbol={symbol} position={position_id} volume={volume} profit={profit:.2} reason={reason}"
                )
            }
            Alert::UnknownSymbol { route_name, symbol } => {
                format!("[unknown-symbol] route={route_name} symbol={symbol}")
            }
            Alert::DailyLimitReached { route_name, reason } => {
                format!("[daily-limit-reached] route={route_name} reason={reason}")
            }
            Alert::PhaseUpgraded { route_name, new_phase } => {
                format!("[phase-upgraded] route={route_name} new_phase={new_phase}")
            }
            Alert::EmergencyStopTriggered { route_name, equity_loss_pct } => {
                format!(
                    "[emergency-stop-triggered] route={route_name} equity_loss_pct={equity_loss_pct:.2}"
                )
            }
            Alert::ConfigReloadRejected { error } => {
                format!("[config-reload-rejected] error={error}")
            }
        }
    }
}

/// Thin webhook wrapper posting alert text to an opaque chat channel.
pub struct AlertSink {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl AlertSink {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url,
        }
    }

    /// Post a single-line structured alert. A missing webhook URL degrades
    /// to a log line rather than failing the caller.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        let Some(url) = &self.webhook_url else {
            info!(alert = text, "alert sink not configured, logging only");
            return Ok(());
        };

        let body = serde_json::json!({ "content": text });
        self.client
            .post(url)
            .json(&body)
            .send()
            .await
            .context("failed to post alert webhook")?
            .error_for_status()
            .context("alert webhook returned an error status")?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum OrphanKey {
    Orphan(AccountRef, String, String),
    Connection(AccountRef),
    UnknownSymbol(String, String),
    DailyLimit(String, String),
}

/// Throttles repeated alerts: orphan alerts to ≤1 per 24h per
/// (dest account, position, reason); connection-issue alerts to ≤1 per 5min
/// per source account.
pub struct AlertSuppression {
    last_alerted: RwLock<HashMap<OrphanKey, Instant>>,
}

impl AlertSuppression {
    pub fn new() -> Self {
        Self {
            last_alerted: RwLock::new(HashMap::new()),
        }
    }

    pub fn should_alert_orphan(&self, dst_acct: &AccountRef, position_id: &str, reason: &str) -> bool {
        self.should_alert(
            OrphanKey::Orphan(dst_acct.clone(), position_id.to_string(), reason.to_string()),
            ORPHAN_ALERT_SUPPRESSION,
        )
    }

    pub fn should_alert_connection(&self, src_acct: &AccountRef) -> bool {
        self.should_alert(OrphanKey::Connection(src_acct.clone()), CONNECTION_ALERT_SUPPRESSION)
    }

    pub fn should_alert_unknown_symbol(&self, route_id: &str, symbol: &str) -> bool {
        self.should_alert(
            OrphanKey::UnknownSymbol(route_id.to_string(), symbol.to_string()),
            UNKNOWN_SYMBOL_ALERT_SUPPRESSION,
        )
    }

    pub fn should_alert_daily_limit(&self, route_id: &str, reason: &str) -> bool {
        self.should_alert(
            OrphanKey::DailyLimit(route_id.to_string(), reason.to_string()),
            DAILY_LIMIT_ALERT_SUPPRESSION,
        )
    }

    fn should_alert(&self, key: OrphanKey, suppression: Duration) -> bool {
        let now = Instant::now();
        let mut table = self.last_alerted.write();
        match table.get(&key) {
            Some(last) if now.duration_since(*last) < suppression => false,
            _ => {
                table.insert(key, now);
                true
            }
        }
    }
}

impl Default for AlertSuppression {
    fn default() -> Self {
        Self::new()
    }
}

/// Combines the sink and suppression table into the single entry point the
/// rest of the engine calls (pipeline, reconciler, supervisor).
pub struct OperatorIo {
    sink: AlertSink,
    suppression: AlertSuppression,
}

impl OperatorIo {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            sink: AlertSink::new(webhook_url),
            suppression: AlertSuppression::new(),
        }
    }

    pub async fn alert_connection_issue(&self, account: &AccountRef, consecutive_failures: u32) {
        if !self.suppression.should_alert_connection(account) {
            return;
        }
        let alert = Alert::ConnectionIssue { account: account.clone(), consecutive_failures };
        if let Err(e) = self.sink.send_message(&alert.render()).await {
            warn!(error = %e, "failed to send connection-issue alert");
        }
    }

    /// Returns `true` if the alert was actually sent (i.e. not suppressed).
    pub async fn alert_orphan(
        &self,
        dst_acct: &AccountRef,
        route_name: &str,
        symbol: &str,
        position_id: &str,
        volume: f64,
        profit: f64,
        reason: &str,
    ) -> bool {
        if !self.suppression.should_alert_orphan(dst_acct, position_id, reason) {
            return false;
        }
        let alert = Alert::OrphanDetected {
            route_name: route_name.to_string(),
            symbol: symbol.to_string(),
            position_id: position_id.to_string(),
            volume,
            profit,
            reason: reason.to_string(),
        };
        if let Err(e) = self.sink.send_message(&alert.render()).await {
            warn!(error = %e, "failed to send orphan alert");
        }
        true
    }

    /// Alerts at most once per (route, symbol) per 24h — an unsupported
    /// symbol or side rejected by the gateway is a standing condition, not a
    /// one-off, until the route's rule set or the symbol's support changes.
    pub async fn alert_unknown_symbol(&self, route_id: &str, route_name: &str, symbol: &str) {
        if !self.suppression.should_alert_unknown_symbol(route_id, symbol) {
            return;
        }
        let alert = Alert::UnknownSymbol { route_name: route_name.to_string(), symbol: symbol.to_string() };
        if let Err(e) = self.sink.send_message(&alert.render()).await {
            warn!(error = %e, "failed to send unknown-symbol alert");
        }
    }

    /// Alerts at most once per (route, reason) per 24h. `emergency-stop` and
    /// `daily-loss-reached` both hold the risk gate shut for the rest of the
    /// day once tripped, so every subsequent denied event would otherwise
    /// re-alert — this collapses that to the single notification the spec
    /// calls for.
    pub async fn alert_daily_limit_reached(&self, route_id: &str, route_name: &str, reason: &str) {
        if !self.suppression.should_alert_daily_limit(route_id, reason) {
            return;
        }
        let alert = Alert::DailyLimitReached { route_name: route_name.to_string(), reason: reason.to_string() };
        if let Err(e) = self.sink.send_message(&alert.render()).await {
            warn!(error = %e, "failed to send daily-limit-reached alert");
        }
    }

    /// Alerts not subject to throttling: these fire once per triggering
    /// event, not on a rolling window.
    pub async fn alert_now(&self, alert: Alert) {
        if let Err(e) = self.sink.send_message(&alert.render()).await {
            warn!(error = %e, "failed to send alert");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: &str) -> AccountRef {
        AccountRef { account_id: id.into(), region: "us".into() }
    }

    #[test]
    fn orphan_alert_fires_once_then_suppresses() {
        let suppression = AlertSuppression::new();
        let acct = account("dst-1");
        assert!(suppression.should_alert_orphan(&acct, "p1", "source-closed"));
        assert!(!suppression.should_alert_orphan(&acct, "p1", "source-closed"));
    }

    #[test]
    fn distinct_positions_alert_independently() {
        let suppression = AlertSuppression::new();
        let acct = account("dst-1");
        assert!(suppression.should_alert_orphan(&acct, "p1", "source-closed"));
        assert!(suppression.should_alert_orphan(&acct, "p2", "source-closed"));
    }

    #[test]
    fn connection_alert_fires_once_then_suppresses() {
        let suppression = AlertSuppression::new();
        let acct = account("src-1");
        assert!(suppression.should_alert_connection(&acct));
        assert!(!suppression.should_alert_connection(&acct));
    }

    #[test]
    fn unknown_symbol_alert_fires_once_per_route_symbol_pair() {
        let suppression = AlertSuppression::new();
        assert!(suppression.should_alert_unknown_symbol("route-1", "XYZABC"));
        assert!(!suppression.should_alert_unknown_symbol("route-1", "XYZABC"));
        assert!(suppression.should_alert_unknown_symbol("route-1", "OTHER"));
        assert!(suppression.should_alert_unknown_symbol("route-2", "XYZABC"));
    }

    #[test]
    fn daily_limit_alert_fires_once_per_route_reason_pair() {
        let suppression = AlertSuppression::new();
        assert!(suppression.should_alert_daily_limit("route-1", "emergency-stop"));
        assert!(!suppression.should_alert_daily_limit("route-1", "emergency-stop"));
        assert!(suppression.should_alert_daily_limit("route-1", "daily-loss-reached"));
        assert!(suppression.should_alert_daily_limit("route-2", "emergency-stop"));
    }

    #[tokio::test]
    async fn sink_without_webhook_url_does_not_error() {
        let sink = AlertSink::new(None);
        assert!(sink.send_message("test").await.is_ok());
    }

    #[test]
    fn alert_render_is_single_line() {
        let alert = Alert::OrphanDetected {
            route_name: "r1".into(),
            symbol: "XAUUSD".into(),
            position_id: "p1".into(),
            volume: 0.1,
            profit: -5.0,
            reason: "source-closed".into(),
        };
        let text = alert.render();
        assert!(!text.contains('\n'));
        assert!(text.contains("source-closed"));
    }
}
