// =============================================================================
// Risk State — per-route risk counters and gate evaluation
// =============================================================================
//
// One instance per route, private to that route's pipeline — all mutations
// happen in that route's own task. Four breaker gates (daily loss, drawdown,
// consecutive losses, emergency stop) plus volatility pause, cooldown-until,
// daily-trade cap, concurrent-position cap, per-symbol cap, and the
// phase-progression state machine.
//
// `on_event_ingress` evaluates the risk-state snapshot captured at call
// entry: concurrent mutations from other events are never observed
// mid-check.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{PhaseConfig, PhaseTier, RiskConfig};

/// Reason a gate check denied an event. Closed set, never an exception —
/// the Filter Chain and Sizing Policy share this "typed outcome" idiom.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DenyReason {
    #[error("daily loss limit reached")]
    DailyLossReached,
    #[error("emergency stop triggered")]
    EmergencyStop,
    #[error("drawdown limit reached")]
    DrawdownReached,
    #[error("consecutive loss pause")]
    ConsecutiveLossPause,
    #[error("volatility pause")]
    VolatilityPause,
    #[error("cooldown active")]
    Cooldown,
    #[error("daily trade cap reached")]
    DailyTradeCap,
    #[error("concurrent position cap reached")]
    ConcurrentPositionCap,
    #[error("per-symbol position cap reached")]
    PerSymbolCap,
    #[error("route killed")]
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateResult {
    Allow,
    Deny(DenyReason),
}

impl GateResult {
    pub fn is_allow(self) -> bool {
        matches!(self, GateResult::Allow)
    }
}

/// Risk mode surfaced to the Operator I/O stats endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RiskMode {
    Normal,
    Cautious,
    BreakerTripped,
    EmergencyStopped,
    Killed,
}

/// Read-only view of a route's risk state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskView {
    pub starting_balance: f64,
    pub current_balance: f64,
    pub current_equity: f64,
    pub high_water_mark: f64,
    pub daily_pnl: f64,
    pub daily_pnl_pct: f64,
    pub consecutive_losses: u32,
    pub trades_in_window: u32,
    pub last_trade_time: Option<DateTime<Utc>>,
    pub phase: u8,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub killed: bool,
    pub emergency_stopped: bool,
    pub volatility_paused: bool,
    pub risk_mode: RiskMode,
    pub win_rate: f64,
    pub profit_pct_since_start: f64,
    pub days_since_start: i64,
}

struct Inner {
    route_start: DateTime<Utc>,
    rollover_date: NaiveDate,

    starting_balance: f64,
    current_balance: f64,
    current_equity: f64,
    high_water_mark: f64,
    daily_pnl: f64,

    consecutive_losses: u32,
    trades_in_window: u32,
    last_trade_time: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,

    squeeze_sequence_start: HashMap<String, DateTime<Utc>>,
    symbol_open_counts: HashMap<String, u32>,
    open_positions: u32,

    total_trades: u64,
    total_wins: u64,
    cumulative_pnl: f64,

    phase: u8,
    killed: bool,
    emergency_stopped: bool,
    volatility_paused: bool,
}

/// Per-route mutable risk counters gating every copy decision.
pub struct RiskState {
    config: RiskConfig,
    phases: PhaseConfig,
    inner: RwLock<Inner>,
}

impl RiskState {
    pub fn new(config: RiskConfig, phases: PhaseConfig, starting_balance: f64, now: DateTime<Utc>) -> Self {
        Self {
            config,
            phases,
            inner: RwLock::new(Inner {
                route_start: now,
                rollover_date: now.date_naive(),
                starting_balance,
                current_balance: starting_balance,
                current_equity: starting_balance,
                high_water_mark: starting_balance,
                daily_pnl: 0.0,
                consecutive_losses: 0,
                trades_in_window: 0,
                last_trade_time: None,
                cooldown_until: None,
                squeeze_sequence_start: HashMap::new(),
                symbol_open_counts: HashMap::new(),
                open_positions: 0,
                total_trades: 0,
                total_wins: 0,
                cumulative_pnl: 0.0,
                phase: 1,
                killed: false,
                emergency_stopped: false,
                volatility_paused: false,
            }),
        }
    }

    /// Read-only snapshot of the current risk state.
    pub fn snapshot(&self) -> RiskView {
        let inner = self.inner.read();
        self.build_view(&inner)
    }

    fn build_view(&self, inner: &Inner) -> RiskView {
        let win_rate = if inner.total_trades > 0 {
            inner.total_wins as f64 / inner.total_trades as f64
        } else {
            0.0
        };
        let profit_pct_since_start = if inner.starting_balance > 0.0 {
            inner.cumulative_pnl / inner.starting_balance * 100.0
        } else {
            0.0
        };
        let daily_pnl_pct = if inner.starting_balance > 0.0 {
            inner.daily_pnl / inner.starting_balance * 100.0
        } else {
            0.0
        };

        RiskView {
            starting_balance: inner.starting_balance,
            current_balance: inner.current_balance,
            current_equity: inner.current_equity,
            high_water_mark: inner.high_water_mark,
            daily_pnl: inner.daily_pnl,
            daily_pnl_pct,
            consecutive_losses: inner.consecutive_losses,
            trades_in_window: inner.trades_in_window,
            last_trade_time: inner.last_trade_time,
            phase: inner.phase,
            cooldown_until: inner.cooldown_until,
            killed: inner.killed,
            emergency_stopped: inner.emergency_stopped,
            volatility_paused: inner.volatility_paused,
            risk_mode: Self::compute_risk_mode(inner),
            win_rate,
            profit_pct_since_start,
            days_since_start: (Utc::now() - inner.route_start).num_days(),
        }
    }

    fn compute_risk_mode(inner: &Inner) -> RiskMode {
        if inner.killed {
            RiskMode::Killed
        } else if inner.emergency_stopped {
            RiskMode::EmergencyStopped
        } else if inner.consecutive_losses >= 2 {
            RiskMode::Cautious
        } else {
            RiskMode::Normal
        }
    }

    /// Evaluate all gates against the snapshot captured at call entry; the
    /// caller passes in the live open-position counts since the mapping
    /// store — not the risk state — is authoritative for "what's open".
    pub fn on_event_ingress(
        &self,
        now: DateTime<Utc>,
        symbol: &str,
        open_positions: u32,
        symbol_open_positions: u32,
    ) -> GateResult {
        self.maybe_reset_daily(now);
        let inner = self.inner.read();

        if inner.killed {
            return GateResult::Deny(DenyReason::Killed);
        }
        if inner.emergency_stopped {
            return GateResult::Deny(DenyReason::EmergencyStop);
        }

        let daily_pnl_pct = if inner.starting_balance > 0.0 {
            (inner.daily_pnl / inner.starting_balance) * 100.0
        } else {
            0.0
        };
        if daily_pnl_pct <= -self.config.max_daily_loss_pct {
            return GateResult::Deny(DenyReason::DailyLossReached);
        }

        let drawdown_pct = if inner.high_water_mark > 0.0 {
            (inner.high_water_mark - inner.current_equity) / inner.high_water_mark * 100.0
        } else {
            0.0
        };
        if drawdown_pct >= self.config.max_drawdown_pct {
            return GateResult::Deny(DenyReason::DrawdownReached);
        }

        if inner.consecutive_losses >= self.config.max_consecutive_losses {
            return GateResult::Deny(DenyReason::ConsecutiveLossPause);
        }

        if inner.volatility_paused {
            return GateResult::Deny(DenyReason::VolatilityPause);
        }

        if let Some(until) = inner.cooldown_until {
            if now < until {
                return GateResult::Deny(DenyReason::Cooldown);
            }
        }

        if inner.trades_in_window >= self.config.max_daily_trades {
            return GateResult::Deny(DenyReason::DailyTradeCap);
        }

        if open_positions >= self.config.max_concurrent_positions {
            return GateResult::Deny(DenyReason::ConcurrentPositionCap);
        }

        let _ = symbol;
        if symbol_open_positions >= self.config.max_per_symbol_positions {
            return GateResult::Deny(DenyReason::PerSymbolCap);
        }

        GateResult::Allow
    }

    /// Record a successfully opened trade.
    pub fn on_trade_opened(&self, symbol: &str, now: DateTime<Utc>) {
        let mut inner = self.inner.write();
        inner.trades_in_window += 1;
        inner.last_trade_time = Some(now);
        inner.open_positions += 1;
        *inner.symbol_open_counts.entry(symbol.to_string()).or_insert(0) += 1;
    }

    /// Record a realized close. Updates the consecutive-loss streak, the
    /// daily P/L counter, and evaluates phase progression. Returns
    /// `Some(equity_loss_pct)` if this call is the one that newly trips the
    /// emergency stop — the caller (Copy Pipeline) uses that edge to close
    /// every remaining open position on the route and fire a single alert.
    pub fn on_trade_closed(&self, symbol: &str, realized_pnl: f64, now: DateTime<Utc>) -> Option<f64> {
        let mut inner = self.inner.write();

        inner.open_positions = inner.open_positions.saturating_sub(1);
        if let Some(count) = inner.symbol_open_counts.get_mut(symbol) {
            *count = count.saturating_sub(1);
        }

        inner.daily_pnl += realized_pnl;
        inner.current_balance += realized_pnl;
        inner.current_equity = inner.current_balance;
        if inner.current_equity > inner.high_water_mark {
            inner.high_water_mark = inner.current_equity;
        }

        inner.total_trades += 1;
        if realized_pnl > 0.0 {
            inner.total_wins += 1;
            inner.consecutive_losses = 0;
        } else if realized_pnl < 0.0 {
            inner.consecutive_losses += 1;
            if self.config.cooldown_after_loss_secs > 0 {
                inner.cooldown_until = Some(now + chrono::Duration::seconds(self.config.cooldown_after_loss_secs));
            }
        }
        inner.cumulative_pnl += realized_pnl;

        let equity_loss_pct = if inner.starting_balance > 0.0 {
            (inner.starting_balance - inner.current_equity) / inner.starting_balance * 100.0
        } else {
            0.0
        };
        let mut newly_triggered = None;
        if equity_loss_pct >= self.config.emergency_stop_pct && !inner.emergency_stopped {
            inner.emergency_stopped = true;
            newly_triggered = Some(equity_loss_pct);
            warn!(equity_loss_pct, "emergency stop triggered");
        }

        self.maybe_promote_phase(&mut inner);
        newly_triggered
    }

    fn maybe_promote_phase(&self, inner: &mut Inner) {
        if !self.phases.enabled || inner.phase >= 3 {
            return;
        }

        let days_since_start = (Utc::now() - inner.route_start).num_days();
        let win_rate = if inner.total_trades > 0 {
            inner.total_wins as f64 / inner.total_trades as f64
        } else {
            0.0
        };
        let profit_pct = if inner.starting_balance > 0.0 {
            inner.cumulative_pnl / inner.starting_balance * 100.0
        } else {
            0.0
        };

        let next_phase = inner.phase + 1;
        let tier: PhaseTier = self.phases.tier(next_phase);

        let eligible = days_since_start as u32 >= tier.min_days
            && win_rate >= tier.min_win_rate
            && profit_pct >= tier.min_profit_pct;

        if eligible {
            inner.phase = next_phase;
            info!(new_phase = next_phase, win_rate, profit_pct, "route phase upgraded");
        }
    }

    /// The `(multiplier, risk_factor)` pair consumed by Sizing Policy for the
    /// route's current phase.
    pub fn phase_tier(&self) -> PhaseTier {
        let inner = self.inner.read();
        self.phases.tier(inner.phase)
    }

    pub fn record_squeeze_sequence_start(&self, symbol: &str, at: DateTime<Utc>) {
        let mut inner = self.inner.write();
        inner.squeeze_sequence_start.entry(symbol.to_string()).or_insert(at);
    }

    pub fn clear_squeeze_sequence(&self, symbol: &str) {
        self.inner.write().squeeze_sequence_start.remove(symbol);
    }

    /// External volatility monitoring can pause/resume copying on a route.
    /// The underlying volatility metric is left to the caller — this exposes
    /// the gate as a settable flag rather than inventing a concrete
    /// indicator.
    pub fn set_volatility_pause(&self, paused: bool) {
        self.inner.write().volatility_paused = paused;
    }

    pub fn kill(&self) {
        let mut inner = self.inner.write();
        inner.killed = true;
        warn!("route killed");
    }

    /// Auto-rollover-on-read safety net: if a gate check observes that the
    /// wall-clock date has advanced past `rollover_date`, roll over before
    /// evaluating. The supervisor's explicit `daily_rollover` call remains
    /// the primary path; this only guards against a missed tick.
    fn maybe_reset_daily(&self, now: DateTime<Utc>) {
        let today = now.date_naive();
        {
            let inner = self.inner.read();
            if inner.rollover_date == today {
                return;
            }
        }
        self.daily_rollover(now);
    }

    /// Archive yesterday's counters and reseed today's starting balance with
    /// current equity. Runs under a single exclusive write lock with no I/O
    /// inside it.
    pub fn daily_rollover(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.write();
        let today = now.date_naive();
        if inner.rollover_date == today {
            return;
        }
        inner.rollover_date = today;
        inner.starting_balance = inner.current_equity;
        inner.daily_pnl = 0.0;
        inner.trades_in_window = 0;
        inner.emergency_stopped = false;
        info!(starting_balance = inner.current_equity, "daily rollover");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RiskState {
        RiskState::new(RiskConfig::default(), PhaseConfig::default(), 10_000.0, Utc::now())
    }

    #[test]
    fn allows_by_default() {
        let rs = state();
        assert_eq!(
            rs.on_event_ingress(Utc::now(), "XAUUSD", 0, 0),
            GateResult::Allow
        );
    }

    #[test]
    fn consecutive_losses_trip_breaker() {
        let rs = state();
        for _ in 0..5 {
            rs.on_trade_closed("XAUUSD", -50.0, Utc::now());
        }
        assert_eq!(
            rs.on_event_ingress(Utc::now(), "XAUUSD", 0, 0),
            GateResult::Deny(DenyReason::ConsecutiveLossPause)
        );
    }

    #[test]
    fn daily_loss_limit_denies() {
        let rs = state();
        rs.on_trade_closed("XAUUSD", -400.0, Utc::now());
        assert_eq!(
            rs.on_event_ingress(Utc::now(), "XAUUSD", 0, 0),
            GateResult::Deny(DenyReason::DailyLossReached)
        );
    }

    #[test]
    fn emergency_stop_persists_across_gate_checks() {
        let rs = state();
        rs.on_trade_closed("XAUUSD", -900.0, Utc::now());
        assert_eq!(
            rs.on_event_ingress(Utc::now(), "XAUUSD", 0, 0),
            GateResult::Deny(DenyReason::EmergencyStop)
        );
    }

    #[test]
    fn daily_rollover_resets_counters() {
        let rs = state();
        rs.on_trade_closed("XAUUSD", -400.0, Utc::now());
        let tomorrow = Utc::now() + chrono::Duration::days(1);
        rs.daily_rollover(tomorrow);
        assert_eq!(
            rs.on_event_ingress(tomorrow, "XAUUSD", 0, 0),
            GateResult::Allow
        );
    }

    #[test]
    fn concurrent_position_cap_denies() {
        let rs = state();
        assert_eq!(
            rs.on_event_ingress(Utc::now(), "XAUUSD", 10, 0),
            GateResult::Deny(DenyReason::ConcurrentPositionCap)
        );
    }

    #[test]
    fn phase_progression_disabled_stays_phase_one() {
        let rs = state();
        rs.on_trade_closed("XAUUSD", 100.0, Utc::now());
        assert_eq!(rs.phase_tier().multiplier, 1.0);
    }

    #[test]
    fn phase_progression_promotes_when_eligible() {
        let phases = PhaseConfig {
            enabled: true,
            tiers: vec![
                PhaseTier { multiplier: 1.0, risk_factor: 1.0, min_days: 0, min_win_rate: 0.0, min_profit_pct: 0.0 },
                PhaseTier { multiplier: 2.0, risk_factor: 1.2, min_days: 0, min_win_rate: 0.0, min_profit_pct: 0.0 },
            ],
        };
        let rs = RiskState::new(RiskConfig::default(), phases, 10_000.0, Utc::now());
        rs.on_trade_closed("XAUUSD", 100.0, Utc::now());
        assert_eq!(rs.phase_tier().multiplier, 2.0);
    }

    #[test]
    fn kill_denies_all_events() {
        let rs = state();
        rs.kill();
        assert_eq!(
            rs.on_event_ingress(Utc::now(), "XAUUSD", 0, 0),
            GateResult::Deny(DenyReason::Killed)
        );
    }
}
