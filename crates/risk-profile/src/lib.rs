use serde::{Deserialize, Serialize};

/// One of the three risk postures the engine can be run under. `Balanced`
/// is the default and the fallback for an unrecognized name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskProfileName {
    Conservative,
    Balanced,
    Aggressive,
}

impl RiskProfileName {
    /// Case-insensitive, trims whitespace; anything unrecognized falls
    /// back to `Balanced` rather than erroring, matching the upstream
    /// control surface where an operator can type a bad profile name.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "conservative" => Self::Conservative,
            "aggressive" => Self::Aggressive,
            "balanced" => Self::Balanced,
            other => {
                tracing::warn!(profile = other, "unrecognized risk profile, falling back to balanced");
                Self::Balanced
            }
        }
    }
}

/// Immutable tuning for one risk profile. Every field here corresponds to
/// a named threshold in the decision engine's tick; there is no mutable
/// or persisted risk state in this crate — profiles are pure data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileParams {
    pub entry: i64,
    pub exit: i64,
    pub entry_confirm_s: u64,
    pub exit_confirm_s: u64,
    pub max_positions: usize,
    pub max_exposure: f64,
    pub max_weight_per_pos: f64,
    pub rotation_margin: i64,
    pub min_hold_s: u64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub daily_max_drawdown_pct: f64,
}

const CONSERVATIVE: ProfileParams = ProfileParams {
    entry: 78,
    exit: 58,
    entry_confirm_s: 60,
    exit_confirm_s: 20,
    max_positions: 3,
    max_exposure: 0.75,
    max_weight_per_pos: 0.35,
    rotation_margin: 14,
    min_hold_s: 900,
    stop_loss_pct: 0.022,
    take_profit_pct: 0.05,
    daily_max_drawdown_pct: 0.03,
};

const BALANCED: ProfileParams = ProfileParams {
    entry: 74,
    exit: 56,
    entry_confirm_s: 45,
    exit_confirm_s: 15,
    max_positions: 5,
    max_exposure: 0.85,
    max_weight_per_pos: 0.25,
    rotation_margin: 12,
    min_hold_s: 600,
    stop_loss_pct: 0.03,
    take_profit_pct: 0.065,
    daily_max_drawdown_pct: 0.05,
};

const AGGRESSIVE: ProfileParams = ProfileParams {
    entry: 70,
    exit: 54,
    entry_confirm_s: 30,
    exit_confirm_s: 10,
    max_positions: 7,
    max_exposure: 0.95,
    max_weight_per_pos: 0.20,
    rotation_margin: 10,
    min_hold_s: 420,
    stop_loss_pct: 0.04,
    take_profit_pct: 0.085,
    daily_max_drawdown_pct: 0.08,
};

/// Looks up the immutable parameter table for a profile. There is no
/// fallible path: every `RiskProfileName` variant has an entry.
pub fn params_for(profile: RiskProfileName) -> ProfileParams {
    match profile {
        RiskProfileName::Conservative => CONSERVATIVE,
        RiskProfileName::Balanced => BALANCED,
        RiskProfileName::Aggressive => AGGRESSIVE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_profile_name_falls_back_to_balanced() {
        assert_eq!(RiskProfileName::parse("yolo"), RiskProfileName::Balanced);
        assert_eq!(RiskProfileName::parse("  Aggressive \n"), RiskProfileName::Aggressive);
    }

    #[test]
    fn balanced_matches_documented_table() {
        let p = params_for(RiskProfileName::Balanced);
        assert_eq!(p.entry, 74);
        assert_eq!(p.max_positions, 5);
        assert!((p.stop_loss_pct - 0.03).abs() < 1e-9);
    }

    #[test]
    fn every_profile_has_exit_below_entry() {
        for profile in [
            RiskProfileName::Conservative,
            RiskProfileName::Balanced,
            RiskProfileName::Aggressive,
        ] {
            let p = params_for(profile);
            assert!(p.exit < p.entry);
        }
    }
}
