// =============================================================================
// Engine Configuration — hot-reloadable routes, rule-sets, and accounts
// =============================================================================
//
// Central configuration hub for the copy-trading engine. A single JSON
// document carries every account reference, rule-set, route, and global
// setting. Persistence uses the atomic tmp + rename pattern to
// prevent corruption on crash. All fields carry `#[serde(default)]` so that
// adding new fields never breaks loading an older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::Route;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_reference_balance() -> f64 {
    10_000.0
}

fn default_phase_multiplier() -> f64 {
    1.0
}

fn default_risk_factor() -> f64 {
    1.0
}

fn default_min_lot() -> f64 {
    0.01
}

fn default_lot_increment() -> f64 {
    0.01
}

fn default_per_position_cap() -> f64 {
    5.0
}

fn default_total_exposure_cap() -> f64 {
    50.0
}

fn default_squeeze_k() -> f64 {
    0.4
}

fn default_squeeze_threshold() -> f64 {
    0.5
}

fn default_squeeze_max_boost() -> f64 {
    1.5
}

fn default_loss_dampener_cap() -> u32 {
    4
}

fn default_max_positions() -> u32 {
    10
}

fn default_min_time_between_trades_secs() -> i64 {
    0
}

fn default_max_daily_trades() -> u32 {
    100
}

fn default_trading_hours() -> Vec<u8> {
    (0..24).collect()
}

fn default_martingale_k() -> f64 {
    3.0
}

fn default_martingale_window_secs() -> i64 {
    3600
}

fn default_martingale_max_same_symbol() -> u32 {
    2
}

fn default_grid_pip_band() -> f64 {
    20.0
}

fn default_sl_buffer() -> f64 {
    0.0
}

fn default_tp_buffer() -> f64 {
    0.0
}

fn default_max_daily_loss_pct() -> f64 {
    3.0
}

fn default_emergency_stop_pct() -> f64 {
    8.0
}

fn default_max_drawdown_pct() -> f64 {
    10.0
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_cooldown_secs() -> i64 {
    0
}

fn default_rollover_utc_hour() -> u32 {
    0
}

fn default_reconcile_interval_secs() -> u64 {
    1800
}

// =============================================================================
// Filter configuration
// =============================================================================

/// Tunable parameters for the Filter Chain. An empty `allowed_symbols` means
/// every symbol is allowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,
    #[serde(default = "default_min_time_between_trades_secs")]
    pub min_time_between_trades_secs: i64,
    #[serde(default = "default_max_daily_trades")]
    pub max_daily_trades: u32,
    #[serde(default = "default_trading_hours")]
    pub trading_hours_utc: Vec<u8>,
    #[serde(default)]
    pub allowed_symbols: Vec<String>,
    #[serde(default = "default_martingale_k")]
    pub martingale_k: f64,
    #[serde(default = "default_martingale_window_secs")]
    pub martingale_window_secs: i64,
    #[serde(default = "default_martingale_max_same_symbol")]
    pub martingale_max_same_symbol: u32,
    #[serde(default = "default_grid_pip_band")]
    pub grid_pip_band: f64,
    #[serde(default = "default_martingale_base_unit")]
    pub martingale_base_unit: f64,
}

fn default_martingale_base_unit() -> f64 {
    0.01
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_positions: default_max_positions(),
            min_time_between_trades_secs: default_min_time_between_trades_secs(),
            max_daily_trades: default_max_daily_trades(),
            trading_hours_utc: default_trading_hours(),
            allowed_symbols: Vec::new(),
            martingale_k: default_martingale_k(),
            martingale_window_secs: default_martingale_window_secs(),
            martingale_max_same_symbol: default_martingale_max_same_symbol(),
            grid_pip_band: default_grid_pip_band(),
            martingale_base_unit: default_martingale_base_unit(),
        }
    }
}

// =============================================================================
// Sizing configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    #[serde(default = "default_reference_balance")]
    pub reference_balance: f64,
    #[serde(default = "default_min_lot")]
    pub min_lot: f64,
    #[serde(default = "default_lot_increment")]
    pub lot_increment: f64,
    #[serde(default = "default_per_position_cap")]
    pub per_position_cap: f64,
    #[serde(default = "default_total_exposure_cap")]
    pub total_exposure_cap: f64,
    #[serde(default = "default_loss_dampener_cap")]
    pub loss_dampener_cap: u32,
    #[serde(default)]
    pub squeeze_symbols: Vec<String>,
    #[serde(default = "default_squeeze_threshold")]
    pub squeeze_threshold: f64,
    #[serde(default = "default_squeeze_k")]
    pub squeeze_k: f64,
    #[serde(default = "default_squeeze_max_boost")]
    pub squeeze_max_boost: f64,
    #[serde(default = "default_sl_buffer")]
    pub sl_buffer: f64,
    #[serde(default = "default_tp_buffer")]
    pub tp_buffer: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            reference_balance: default_reference_balance(),
            min_lot: default_min_lot(),
            lot_increment: default_lot_increment(),
            per_position_cap: default_per_position_cap(),
            total_exposure_cap: default_total_exposure_cap(),
            loss_dampener_cap: default_loss_dampener_cap(),
            squeeze_symbols: Vec::new(),
            squeeze_threshold: default_squeeze_threshold(),
            squeeze_k: default_squeeze_k(),
            squeeze_max_boost: default_squeeze_max_boost(),
            sl_buffer: default_sl_buffer(),
            tp_buffer: default_tp_buffer(),
        }
    }
}

// =============================================================================
// Risk configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,
    #[serde(default = "default_emergency_stop_pct")]
    pub emergency_stop_pct: f64,
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_after_loss_secs: i64,
    #[serde(default = "default_max_positions")]
    pub max_concurrent_positions: u32,
    #[serde(default = "default_max_per_symbol_positions")]
    pub max_per_symbol_positions: u32,
    #[serde(default = "default_max_daily_trades")]
    pub max_daily_trades: u32,
}

fn default_max_per_symbol_positions() -> u32 {
    3
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: default_max_daily_loss_pct(),
            emergency_stop_pct: default_emergency_stop_pct(),
            max_drawdown_pct: default_max_drawdown_pct(),
            max_consecutive_losses: default_max_consecutive_losses(),
            cooldown_after_loss_secs: default_cooldown_secs(),
            max_concurrent_positions: default_max_positions(),
            max_per_symbol_positions: default_max_per_symbol_positions(),
            max_daily_trades: default_max_daily_trades(),
        }
    }
}

// =============================================================================
// Phase configuration (phase progression)
// =============================================================================

/// One phase's sizing/risk multiplier pair plus its promotion thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTier {
    pub multiplier: f64,
    pub risk_factor: f64,
    #[serde(default)]
    pub min_days: u32,
    #[serde(default)]
    pub min_win_rate: f64,
    #[serde(default)]
    pub min_profit_pct: f64,
}

/// Phase progression is opt-in per rule-set. `None` means the route always
/// uses `PhaseTier { multiplier: 1.0, risk_factor: 1.0, .. }` (phase 1, no
/// promotion).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tiers: Vec<PhaseTier>,
}

impl PhaseConfig {
    pub fn tier(&self, phase: u8) -> PhaseTier {
        if !self.enabled {
            return PhaseTier {
                multiplier: default_phase_multiplier(),
                risk_factor: default_risk_factor(),
                min_days: 0,
                min_win_rate: 0.0,
                min_profit_pct: 0.0,
            };
        }
        self.tiers
            .get((phase.saturating_sub(1)) as usize)
            .cloned()
            .unwrap_or(PhaseTier {
                multiplier: default_phase_multiplier(),
                risk_factor: default_risk_factor(),
                min_days: 0,
                min_win_rate: 0.0,
                min_profit_pct: 0.0,
            })
    }
}

// =============================================================================
// Rule set
// =============================================================================

/// A named bundle of filter/sizing/risk/phase settings, referenced by id from
/// one or more routes (`ruleSets` in the config document).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub phases: PhaseConfig,
    #[serde(default)]
    pub mirror_sl_tp: bool,
    #[serde(default)]
    pub auto_close_orphans: bool,
}

// =============================================================================
// Account configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub region: String,
    #[serde(default = "default_reference_balance")]
    pub reference_balance: f64,
}

// =============================================================================
// Global settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default = "default_emergency_stop_pct")]
    pub emergency_stop_loss_pct: f64,
    #[serde(default = "default_max_daily_loss_pct")]
    pub daily_drawdown_limit_pct: f64,
    #[serde(default = "default_rollover_utc_hour")]
    pub rollover_utc_hour: u32,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            emergency_stop_loss_pct: default_emergency_stop_pct(),
            daily_drawdown_limit_pct: default_max_daily_loss_pct(),
            rollover_utc_hour: default_rollover_utc_hour(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
        }
    }
}

// =============================================================================
// Engine configuration (top-level document)
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub accounts: HashMap<String, AccountConfig>,
    #[serde(default)]
    pub rule_sets: HashMap<String, RuleSet>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub global_settings: GlobalSettings,
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            routes = config.routes.len(),
            rule_sets = config.rule_sets.len(),
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename). Prevents corruption if the process
    /// crashes mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Look up the rule-set for a route, falling back to an empty default if
    /// the route references an unknown rule-set id (logged by the caller).
    pub fn rule_set_for(&self, route: &Route) -> Option<&RuleSet> {
        self.rule_sets.get(&route.rule_set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.accounts.is_empty());
        assert!(cfg.routes.is_empty());
        assert_eq!(cfg.global_settings.rollover_utc_hour, 0);
        assert!((cfg.global_settings.emergency_stop_loss_pct - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn filter_config_defaults_allow_all_symbols() {
        let fc = FilterConfig::default();
        assert!(fc.allowed_symbols.is_empty());
        assert_eq!(fc.trading_hours_utc.len(), 24);
    }

    #[test]
    fn phase_config_disabled_returns_neutral_tier() {
        let pc = PhaseConfig::default();
        let tier = pc.tier(2);
        assert_eq!(tier.multiplier, 1.0);
        assert_eq!(tier.risk_factor, 1.0);
    }

    #[test]
    fn phase_config_enabled_returns_configured_tier() {
        let pc = PhaseConfig {
            enabled: true,
            tiers: vec![
                PhaseTier {
                    multiplier: 10.0,
                    risk_factor: 1.0,
                    min_days: 0,
                    min_win_rate: 0.0,
                    min_profit_pct: 0.0,
                },
                PhaseTier {
                    multiplier: 20.0,
                    risk_factor: 1.5,
                    min_days: 14,
                    min_win_rate: 0.55,
                    min_profit_pct: 5.0,
                },
            ],
        };
        assert_eq!(pc.tier(1).multiplier, 10.0);
        assert_eq!(pc.tier(2).multiplier, 20.0);
        // Out-of-range phase falls back to the neutral tier rather than panicking.
        assert_eq!(pc.tier(5).multiplier, 1.0);
    }

    #[test]
    fn roundtrip_serialisation() {
        let mut cfg = EngineConfig::default();
        cfg.rule_sets.insert("default".to_string(), RuleSet::default());
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.rule_sets.len(), cfg2.rule_sets.len());
    }
}
