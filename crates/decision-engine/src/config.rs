use anyhow::{Context, Result};
use std::env;

/// Every tunable the engine reads at startup. Fields mirror the env vars
/// documented for operators; defaults match the reference numbers the
/// system was validated against.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub decision_seconds: u64,
    pub account_poll_seconds: u64,
    pub poll_seconds: u64,
    pub signal_stale_seconds: i64,
    pub missing_symbol_grace_seconds: i64,
    pub safe_reduce_step_seconds: i64,
    pub safe_reduce_per_step: usize,
    pub safe_stale_escalate_seconds: i64,
    pub cooldown_seconds: i64,
    pub cash_buffer: f64,
    pub min_weight_per_pos: f64,
    pub score_point_value_bps: f64,
    pub commission_per_trade: f64,
    pub slippage_bps: f64,
    pub switch_cost_multiplier: f64,

    pub state_dir: String,

    pub alpaca_api_key: String,
    pub alpaca_secret_key: String,
    pub alpaca_base_url: String,
    pub alpaca_data_url: String,

    pub signal_snapshot_url: String,
    pub signal_ws_url: Option<String>,
    pub signal_ws_token: Option<String>,

    pub risk_profile: String,
    pub live_trading_approved: bool,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{} invalid: {}", key, e)),
        Err(_) => Ok(default),
    }
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            decision_seconds: env_or("BOT_DECISION_SECONDS", 12)?,
            account_poll_seconds: env_or("BOT_ACCOUNT_POLL_SECONDS", 20)?,
            poll_seconds: env_or("BOT_POLL_SECONDS", 20)?,
            signal_stale_seconds: env_or("BOT_SIGNAL_STALE_SECONDS", 480)?,
            missing_symbol_grace_seconds: env_or("BOT_MISSING_SYMBOL_GRACE_SECONDS", 180)?,
            safe_reduce_step_seconds: env_or("BOT_SAFE_REDUCE_STEP_SECONDS", 60)?,
            safe_reduce_per_step: env_or("BOT_SAFE_REDUCE_PER_STEP", 1)?,
            safe_stale_escalate_seconds: env_or("BOT_SAFE_STALE_ESCALATE_SECONDS", 900)?,
            cooldown_seconds: env_or("BOT_COOLDOWN_SECONDS", 240)?,
            cash_buffer: env_or("BOT_CASH_BUFFER", 0.05)?,
            min_weight_per_pos: env_or("BOT_MIN_WEIGHT_PER_POS", 0.08)?,
            score_point_value_bps: env_or("BOT_SCORE_POINT_VALUE_BPS", 4.0)?,
            commission_per_trade: env_or("BOT_COMMISSION_PER_TRADE", 0.0)?,
            slippage_bps: env_or("BOT_SLIPPAGE_BPS", 2.5)?,
            switch_cost_multiplier: env_or("BOT_SWITCH_COST_MULTIPLIER", 1.5)?,

            state_dir: env::var("BOT_STATE_DIR").unwrap_or_else(|_| "./state".to_string()),

            alpaca_api_key: env::var("ALPACA_API_KEY").context("ALPACA_API_KEY not set")?,
            alpaca_secret_key: env::var("ALPACA_SECRET_KEY")
                .context("ALPACA_SECRET_KEY not set")?,
            alpaca_base_url: env::var("ALPACA_BASE_URL")
                .unwrap_or_else(|_| "https://paper-api.alpaca.markets".to_string()),
            alpaca_data_url: env::var("ALPACA_DATA_URL")
                .unwrap_or_else(|_| "https://data.alpaca.markets".to_string()),

            signal_snapshot_url: env::var("SIGNAL_SNAPSHOT_URL")
                .context("SIGNAL_SNAPSHOT_URL not set")?,
            signal_ws_url: env::var("SIGNAL_WS_URL").ok(),
            signal_ws_token: env::var("SIGNAL_WS_TOKEN").ok(),

            risk_profile: env::var("RISK_PROFILE").unwrap_or_else(|_| "balanced".to_string()),
            live_trading_approved: env::var("LIVE_TRADING_APPROVED")
                .map(|v| v.eq_ignore_ascii_case("yes"))
                .unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_to_default_when_unset() {
        std::env::remove_var("SOME_NONEXISTENT_KEY_12345");
        let v: u64 = env_or("SOME_NONEXISTENT_KEY_12345", 7).unwrap();
        assert_eq!(v, 7);
    }
}
