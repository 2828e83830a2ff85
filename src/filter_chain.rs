// =============================================================================
// Filter Chain — fixed-order predicates gating a candidate copy
// =============================================================================
//
// Evaluated in a fixed order; the first deny short-circuits the rest. Every
// filter is pure over its inputs — no I/O, no shared mutable state.
// =============================================================================

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::FilterConfig;
use crate::domain::{Position, PositionMapping};
use crate::risk::RiskView;
use crate::types::{AccountRef, Side};

/// A source position-created event under evaluation.
#[derive(Debug, Clone)]
pub struct CopyCandidate<'a> {
    pub source_account: &'a AccountRef,
    pub source_position_id: &'a str,
    pub symbol: &'a str,
    pub side: Side,
    pub volume: f64,
    pub open_price: f64,
    pub now: DateTime<Utc>,
}

/// Reason a candidate was denied by the Filter Chain. Closed set, matching
/// the "never throw" idiom shared with Risk State and Sizing Policy.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterDeny {
    #[error("already copied")]
    AlreadyCopied,
    #[error("position count cap reached")]
    PositionCount,
    #[error("cooldown active")]
    Cooldown,
    #[error("daily trade cap reached")]
    DailyTradeCap,
    #[error("outside trading hours")]
    TradingHours,
    #[error("symbol not allowed")]
    SymbolNotAllowed,
    #[error("martingale pattern detected")]
    Martingale,
    #[error("grid pattern detected")]
    Grid,
}

/// Fixed-order filter evaluation across the eight configured filters.
pub struct FilterChain;

impl FilterChain {
    /// `existing_mapping` is the result of `MappingStore::get_by_source` for
    /// this candidate's source key — filter 1 needs only its presence.
    /// `route_mappings` are the route's currently active mappings (for
    /// filters 2 and 7). `source_open_positions` are the source account's
    /// currently observed open positions (for filter 8).
    pub fn evaluate(
        candidate: &CopyCandidate<'_>,
        config: &FilterConfig,
        risk: &RiskView,
        existing_mapping: Option<&PositionMapping>,
        route_mappings: &[PositionMapping],
        source_open_positions: &[Position],
    ) -> Option<FilterDeny> {
        if existing_mapping.is_some() {
            debug!(source_position_id = candidate.source_position_id, "filter: already-copied");
            return Some(FilterDeny::AlreadyCopied);
        }

        let active_count = route_mappings.len() as u32;
        if active_count >= config.max_positions {
            debug!(active_count, cap = config.max_positions, "filter: position-count");
            return Some(FilterDeny::PositionCount);
        }

        if let Some(last_trade) = risk.last_trade_time {
            let elapsed = (candidate.now - last_trade).num_seconds();
            if elapsed < config.min_time_between_trades_secs {
                debug!(elapsed, "filter: cooldown");
                return Some(FilterDeny::Cooldown);
            }
        }

        if risk.trades_in_window >= config.max_daily_trades {
            debug!(trades_in_window = risk.trades_in_window, "filter: daily-trade-cap");
            return Some(FilterDeny::DailyTradeCap);
        }

        let hour = candidate.now.hour() as u8;
        if !config.trading_hours_utc.contains(&hour) {
            debug!(hour, "filter: trading-hours");
            return Some(FilterDeny::TradingHours);
        }

        if !config.allowed_symbols.is_empty() && !config.allowed_symbols.iter().any(|s| s == candidate.symbol) {
            debug!(symbol = candidate.symbol, "filter: symbol-not-allowed");
            return Some(FilterDeny::SymbolNotAllowed);
        }

        if candidate.volume > config.martingale_k * config.martingale_base_unit {
            debug!(volume = candidate.volume, "filter: martingale (volume)");
            return Some(FilterDeny::Martingale);
        }
        let window_start = candidate.now - chrono::Duration::seconds(config.martingale_window_secs);
        let same_symbol_recent = route_mappings
            .iter()
            .filter(|m| m.symbol == candidate.symbol && m.open_time >= window_start)
            .count() as u32;
        if same_symbol_recent >= config.martingale_max_same_symbol {
            debug!(same_symbol_recent, "filter: martingale (same-symbol count)");
            return Some(FilterDeny::Martingale);
        }

        let pip = pip_size(candidate.symbol);
        let band = config.grid_pip_band * pip;
        let nearby = source_open_positions
            .iter()
            .filter(|p| {
                p.symbol == candidate.symbol && (p.open_price - candidate.open_price).abs() <= band
            })
            .count();
        if nearby > 1 {
            debug!(nearby, "filter: grid");
            return Some(FilterDeny::Grid);
        }

        None
    }
}

/// Pip size heuristic: most FX pairs use 0.0001, JPY crosses use 0.01, metals
/// and indices use 0.1. Coarse on purpose — the grid and martingale filters
/// only need an order-of-magnitude price band, not exact pip conventions.
fn pip_size(symbol: &str) -> f64 {
    let upper = symbol.to_ascii_uppercase();
    if upper.ends_with("JPY") {
        0.01
    } else if upper.starts_with("XAU") || upper.starts_with("XAG") {
        0.1
    } else {
        0.0001
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MappingStatus;
    use crate::risk::RiskMode;

    fn risk_view() -> RiskView {
        RiskView {
            starting_balance: 10_000.0,
            current_balance: 10_000.0,
            current_equity: 10_000.0,
            high_water_mark: 10_000.0,
            daily_pnl: 0.0,
            daily_pnl_pct: 0.0,
            consecutive_losses: 0,
            trades_in_window: 0,
            last_trade_time: None,
            phase: 1,
            cooldown_until: None,
            killed: false,
            emergency_stopped: false,
            volatility_paused: false,
            risk_mode: RiskMode::Normal,
            win_rate: 0.0,
            profit_pct_since_start: 0.0,
            days_since_start: 0,
        }
    }

    fn account(id: &str) -> AccountRef {
        AccountRef { account_id: id.into(), region: "us".into() }
    }

    fn candidate<'a>(symbol: &'a str, acct: &'a AccountRef) -> CopyCandidate<'a> {
        CopyCandidate {
            source_account: acct,
            source_position_id: "s1",
            symbol,
            side: Side::Long,
            volume: 0.1,
            open_price: 2400.0,
            now: Utc::now(),
        }
    }

    #[test]
    fn allows_clean_candidate() {
        let acct = account("src-1");
        let c = candidate("XAUUSD", &acct);
        let cfg = FilterConfig::default();
        let risk = risk_view();
        assert_eq!(
            FilterChain::evaluate(&c, &cfg, &risk, None, &[], &[]),
            None
        );
    }

    #[test]
    fn denies_when_mapping_already_exists() {
        let acct = account("src-1");
        let c = candidate("XAUUSD", &acct);
        let cfg = FilterConfig::default();
        let risk = risk_view();
        let mapping = PositionMapping {
            source_account: acct.clone(),
            source_position_id: "s1".into(),
            destination_account: account("dst-1"),
            destination_position_id: "d1".into(),
            route_id: "r1".into(),
            symbol: "XAUUSD".into(),
            open_time: Utc::now(),
            status: MappingStatus::Active,
            last_seen: Utc::now(),
        };
        assert_eq!(
            FilterChain::evaluate(&c, &cfg, &risk, Some(&mapping), &[], &[]),
            Some(FilterDeny::AlreadyCopied)
        );
    }

    #[test]
    fn denies_when_symbol_not_allowed() {
        let acct = account("src-1");
        let c = candidate("EURUSD", &acct);
        let mut cfg = FilterConfig::default();
        cfg.allowed_symbols = vec!["XAUUSD".into()];
        let risk = risk_view();
        assert_eq!(
            FilterChain::evaluate(&c, &cfg, &risk, None, &[], &[]),
            Some(FilterDeny::SymbolNotAllowed)
        );
    }

    #[test]
    fn denies_outside_trading_hours() {
        let acct = account("src-1");
        let c = candidate("XAUUSD", &acct);
        let mut cfg = FilterConfig::default();
        cfg.trading_hours_utc = vec![]; // no hours allowed
        let risk = risk_view();
        assert_eq!(
            FilterChain::evaluate(&c, &cfg, &risk, None, &[], &[]),
            Some(FilterDeny::TradingHours)
        );
    }

    #[test]
    fn denies_martingale_on_oversized_volume() {
        let acct = account("src-1");
        let mut c = candidate("XAUUSD", &acct);
        c.volume = 1.0;
        let mut cfg = FilterConfig::default();
        cfg.martingale_k = 3.0;
        cfg.martingale_base_unit = 0.01;
        let risk = risk_view();
        assert_eq!(
            FilterChain::evaluate(&c, &cfg, &risk, None, &[], &[]),
            Some(FilterDeny::Martingale)
        );
    }

    #[test]
    fn denies_grid_when_multiple_nearby_source_positions() {
        let acct = account("src-1");
        let c = candidate("XAUUSD", &acct);
        let cfg = FilterConfig::default();
        let risk = risk_view();
        let nearby_positions = vec![
            Position {
                position_id: "p1".into(),
                symbol: "XAUUSD".into(),
                side: Side::Long,
                volume: 0.1,
                open_price: 2400.5,
                open_time: Utc::now(),
                stop_loss: None,
                take_profit: None,
                comment: None,
                current_price: 0.0,
                profit: 0.0,
                route_id: None,
                source_position_id: None,
                sizing: None,
            },
            Position {
                position_id: "p2".into(),
                symbol: "XAUUSD".into(),
                side: Side::Long,
                volume: 0.1,
                open_price: 2399.8,
                open_time: Utc::now(),
                stop_loss: None,
                take_profit: None,
                comment: None,
                current_price: 0.0,
                profit: 0.0,
                route_id: None,
                source_position_id: None,
                sizing: None,
            },
        ];
        assert_eq!(
            FilterChain::evaluate(&c, &cfg, &risk, None, &[], &nearby_positions),
            Some(FilterDeny::Grid)
        );
    }
}
