/// Convex position-sizing weight for a score that has cleared `entry`.
/// `strength` is the normalized distance from `entry` to 100, squared, so
/// conviction well above the threshold earns disproportionately more
/// capital than conviction just past it.
pub fn desired_weight(score: i64, entry: i64, min_weight: f64, max_weight: f64) -> f64 {
    if score <= entry {
        return min_weight;
    }
    let span = (100 - entry).max(1) as f64;
    let strength = (((score - entry) as f64) / span).clamp(0.0, 1.0);
    min_weight + (max_weight - min_weight) * strength * strength
}

/// Cost-benefit gate for displacing `out_score`/`out_notional` in favor
/// of `in_score`. Benefit scales with notional and score delta; cost is
/// slippage (paid twice, in and out) plus commission (paid twice).
/// Rotation proceeds only if benefit clears cost by `switch_mult`.
#[allow(clippy::too_many_arguments)]
pub fn rotation_worth_it(
    out_notional: f64,
    out_score: i64,
    in_score: i64,
    score_point_bps: f64,
    slippage_bps: f64,
    commission_per_trade: f64,
    switch_mult: f64,
) -> bool {
    if out_notional <= 0.0 {
        return false;
    }
    let delta = (in_score - out_score).max(0) as f64;
    let benefit = out_notional * delta * score_point_bps / 10_000.0;
    let slip = out_notional * (slippage_bps / 10_000.0) * 2.0;
    let cost = slip + commission_per_trade * 2.0;
    benefit >= cost * switch_mult
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_weight_at_entry_is_minimum() {
        assert_eq!(desired_weight(74, 74, 0.08, 0.25), 0.08);
    }

    #[test]
    fn desired_weight_scenario_1_balanced_score_80() {
        // entry=74, score=80, min=0.08, max=0.25 (balanced profile)
        let w = desired_weight(80, 74, 0.08, 0.25);
        let expected = 0.08 + (0.25 - 0.08) * ((6.0 / 26.0) * (6.0 / 26.0));
        assert!((w - expected).abs() < 1e-9);
        assert!(w > 0.08 && w < 0.25);
    }

    #[test]
    fn desired_weight_at_max_score_is_max_weight() {
        let w = desired_weight(100, 74, 0.08, 0.25);
        assert!((w - 0.25).abs() < 1e-9);
    }

    #[test]
    fn rotation_worth_it_scenario_matches_cost_benefit_example() {
        // out_notional=2000, out_score=60, in_score=75: benefit=12, cost*1.5=1.5
        assert!(rotation_worth_it(2000.0, 60, 75, 4.0, 2.5, 0.0, 1.5));
    }

    #[test]
    fn rotation_not_worth_it_when_delta_too_small() {
        assert!(!rotation_worth_it(2000.0, 70, 72, 4.0, 2.5, 1.0, 1.5));
    }

    #[test]
    fn rotation_never_worth_it_with_zero_notional() {
        assert!(!rotation_worth_it(0.0, 50, 90, 4.0, 2.5, 0.0, 1.5));
    }
}
