use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broker-agnostic account snapshot. Only the fields the decision engine
/// actually reasons about survive here; broker-specific detail stays in
/// the adapter crate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Account {
    pub equity: Decimal,
    pub cash: Decimal,
}

/// A held long position. Short-side rows are never surfaced through this
/// type; adapters filter them out before returning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub qty: Decimal,
    pub avg_entry_price: Option<Decimal>,
    pub market_value: Option<Decimal>,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker not configured")]
    NotConfigured,
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("order rejected: {0}")]
    OrderRejected(String),
    #[error("no price available for {0}")]
    NoPrice(String),
}

/// Uniform capability contract implemented by every broker adapter.
/// Variants (Alpaca-style REST, a TWS-style gateway, …) are independent
/// implementations of the same trait object, not a class hierarchy.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Short name used in logs and trade-log rows ("alpaca", …).
    fn name(&self) -> &str;

    /// Whether credentials/connection are sufficient to trade at all.
    fn is_configured(&self) -> bool;

    /// Best-effort market-hours check. Implementations must return
    /// `false` rather than error on any transport failure — the engine
    /// treats "unknown" the same as "closed".
    async fn is_market_open(&self) -> bool;

    async fn get_account(&self) -> Result<Account>;

    /// Long positions only. Soft failures are logged and return an
    /// empty vec rather than propagating an error.
    async fn list_positions(&self) -> Vec<Position>;

    /// Best available reference price for sizing and cost-benefit math.
    /// `None` means "no usable quote or trade right now," never an error.
    async fn latest_price(&self, symbol: &str) -> Option<Decimal>;

    /// Open a long market position of `qty` whole shares with a
    /// broker-side bracket: a take-profit at `+take_profit_pct` and a
    /// stop-loss at `-stop_loss_pct` from the fill/reference price,
    /// grouped so one cancels the other.
    async fn place_entry_with_bracket(
        &self,
        symbol: &str,
        qty: i64,
        stop_loss_pct: f64,
        take_profit_pct: f64,
        client_order_id: &str,
    ) -> Result<()>;

    /// Close a position. `qty = None` closes the full position and is
    /// the only mode the decision engine ever invokes; a partial qty
    /// remains part of the contract for completeness. Closing a symbol
    /// with no open position is not an error.
    async fn close_position(&self, symbol: &str, qty: Option<i64>, client_order_id: &str) -> Result<()>;
}
