// =============================================================================
// Sizing Policy — source volume → destination volume
// =============================================================================
//
// Pure function of its inputs, in the same "never throw" style as the
// Filter Chain: returns `Execute(volume)` or `Skip`, never a panic or error.
// Percentage-of-capital sizing relative to a reference balance, scaled by
// phase multiplier, loss dampener, and squeeze boost, then clamped.
// =============================================================================

use crate::config::{PhaseTier, SizingConfig};

/// Outcome of a sizing computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizingOutcome {
    Execute(f64),
    /// Computed volume rounded below `minLot`.
    Skip,
}

/// Inputs a candidate brings to the sizing formula, independent of risk/phase
/// state (those are passed separately so Sizing Policy stays pure).
#[derive(Debug, Clone, Copy)]
pub struct SizingInput {
    pub source_volume: f64,
    pub dest_balance: f64,
    pub current_exposure: f64,
    pub squeeze_score: Option<f64>,
    pub is_long: bool,
    pub symbol_is_squeeze_eligible: bool,
}

pub struct SizingPolicy;

impl SizingPolicy {
    /// Compute the destination volume for a candidate.
    pub fn compute(
        input: &SizingInput,
        config: &SizingConfig,
        phase: &PhaseTier,
        consecutive_losses: u32,
    ) -> SizingOutcome {
        let reference_balance = if config.reference_balance > 0.0 {
            config.reference_balance
        } else {
            1.0
        };
        let phase_multiplier = if phase.multiplier != 0.0 { phase.multiplier } else { 1.0 };

        let base = input.source_volume * (input.dest_balance / reference_balance) / phase_multiplier;

        let dampener = loss_dampener(consecutive_losses, config.loss_dampener_cap);
        let squeeze = squeeze_boost(input, config);

        let scaled = base * phase.risk_factor * dampener * squeeze;

        let exposure_headroom = (config.total_exposure_cap - input.current_exposure).max(0.0);
        let clamp = scaled.min(config.per_position_cap).min(exposure_headroom);

        let rounded = round_to_increment(clamp, config.lot_increment);

        if rounded < config.min_lot {
            SizingOutcome::Skip
        } else {
            SizingOutcome::Execute(rounded)
        }
    }
}

/// `0.5^min(n, cap)` — halves per consecutive loss up to a cap.
fn loss_dampener(consecutive_losses: u32, cap: u32) -> f64 {
    let n = consecutive_losses.min(cap);
    0.5f64.powi(n as i32)
}

/// `1 + (score − 0.5) × k`, clipped to `max_boost`; only for long-side trades
/// on configured symbols when `score ≥ threshold`. Otherwise `1.0`.
fn squeeze_boost(input: &SizingInput, config: &SizingConfig) -> f64 {
    if !input.is_long || !input.symbol_is_squeeze_eligible {
        return 1.0;
    }
    let Some(score) = input.squeeze_score else {
        return 1.0;
    };
    if score < config.squeeze_threshold {
        return 1.0;
    }
    let boost = 1.0 + (score - 0.5) * config.squeeze_k;
    boost.min(config.squeeze_max_boost)
}

/// Round to the nearest broker lot increment, ties breaking toward zero.
fn round_to_increment(value: f64, increment: f64) -> f64 {
    if increment <= 0.0 {
        return value;
    }
    let units = value / increment;
    let floor = units.floor();
    let frac = units - floor;
    let rounded_units = if frac > 0.5 {
        floor + 1.0
    } else if frac < 0.5 {
        floor
    } else {
        // Exact tie: break toward zero.
        floor
    };
    rounded_units * increment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase_neutral() -> PhaseTier {
        PhaseTier {
            multiplier: 10.0,
            risk_factor: 1.0,
            min_days: 0,
            min_win_rate: 0.0,
            min_profit_pct: 0.0,
        }
    }

    #[test]
    fn happy_copy_scenario_scales_by_balance_ratio_and_phase() {
        // source 0.10 lots, phaseMultiplier=10, riskFactor=1.0, refBalance=5000,
        // destBalance=100000 => 0.10 * (100000/5000) / 10 * 1.0 = 0.20 lots.
        let input = SizingInput {
            source_volume: 0.10,
            dest_balance: 100_000.0,
            current_exposure: 0.0,
            squeeze_score: None,
            is_long: true,
            symbol_is_squeeze_eligible: false,
        };
        let config = SizingConfig {
            reference_balance: 5000.0,
            min_lot: 0.01,
            lot_increment: 0.01,
            per_position_cap: 2.0,
            total_exposure_cap: 50.0,
            loss_dampener_cap: 4,
            squeeze_symbols: vec![],
            squeeze_threshold: 0.5,
            squeeze_k: 0.4,
            squeeze_max_boost: 1.5,
            sl_buffer: 0.0,
            tp_buffer: 0.0,
        };
        let outcome = SizingPolicy::compute(&input, &config, &phase_neutral(), 0);
        match outcome {
            SizingOutcome::Execute(vol) => assert!((vol - 0.20).abs() < 1e-9),
            SizingOutcome::Skip => panic!("expected execute"),
        }
    }

    #[test]
    fn skips_when_below_min_lot() {
        let input = SizingInput {
            source_volume: 0.001,
            dest_balance: 1000.0,
            current_exposure: 0.0,
            squeeze_score: None,
            is_long: true,
            symbol_is_squeeze_eligible: false,
        };
        let config = SizingConfig {
            reference_balance: 100_000.0,
            min_lot: 0.01,
            lot_increment: 0.01,
            per_position_cap: 2.0,
            total_exposure_cap: 50.0,
            loss_dampener_cap: 4,
            squeeze_symbols: vec![],
            squeeze_threshold: 0.5,
            squeeze_k: 0.4,
            squeeze_max_boost: 1.5,
            sl_buffer: 0.0,
            tp_buffer: 0.0,
        };
        let outcome = SizingPolicy::compute(&input, &config, &phase_neutral(), 0);
        assert_eq!(outcome, SizingOutcome::Skip);
    }

    #[test]
    fn loss_dampener_halves_per_consecutive_loss() {
        assert_eq!(loss_dampener(0, 4), 1.0);
        assert_eq!(loss_dampener(1, 4), 0.5);
        assert_eq!(loss_dampener(2, 4), 0.25);
        // capped
        assert_eq!(loss_dampener(10, 4), loss_dampener(4, 4));
    }

    #[test]
    fn squeeze_boost_only_applies_to_long_eligible_symbols() {
        let config = SizingConfig {
            reference_balance: 1.0,
            min_lot: 0.01,
            lot_increment: 0.01,
            per_position_cap: 100.0,
            total_exposure_cap: 100.0,
            loss_dampener_cap: 4,
            squeeze_symbols: vec!["XAUUSD".into()],
            squeeze_threshold: 0.5,
            squeeze_k: 0.4,
            squeeze_max_boost: 1.5,
            sl_buffer: 0.0,
            tp_buffer: 0.0,
        };

        let eligible = SizingInput {
            source_volume: 1.0,
            dest_balance: 1.0,
            current_exposure: 0.0,
            squeeze_score: Some(0.9),
            is_long: true,
            symbol_is_squeeze_eligible: true,
        };
        assert!(squeeze_boost(&eligible, &config) > 1.0);

        let short_side = SizingInput { is_long: false, ..eligible };
        assert_eq!(squeeze_boost(&short_side, &config), 1.0);

        let below_threshold = SizingInput { squeeze_score: Some(0.1), ..eligible };
        assert_eq!(squeeze_boost(&below_threshold, &config), 1.0);
    }

    #[test]
    fn exposure_cap_clamps_scaled_volume() {
        let input = SizingInput {
            source_volume: 10.0,
            dest_balance: 100_000.0,
            current_exposure: 48.0,
            squeeze_score: None,
            is_long: true,
            symbol_is_squeeze_eligible: false,
        };
        let config = SizingConfig {
            reference_balance: 1.0,
            min_lot: 0.01,
            lot_increment: 0.01,
            per_position_cap: 100.0,
            total_exposure_cap: 50.0,
            loss_dampener_cap: 4,
            squeeze_symbols: vec![],
            squeeze_threshold: 0.5,
            squeeze_k: 0.4,
            squeeze_max_boost: 1.5,
            sl_buffer: 0.0,
            tp_buffer: 0.0,
        };
        let outcome = SizingPolicy::compute(&input, &config, &phase_neutral(), 0);
        match outcome {
            SizingOutcome::Execute(vol) => assert!((vol - 2.0).abs() < 1e-9),
            SizingOutcome::Skip => panic!("expected execute"),
        }
    }
}
