use crate::models::*;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use broker_trait::{Account as BrokerAccount, BrokerClient, Position as BrokerPosition};
use reqwest::{header, Client};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

/// REST adapter for Alpaca's trading + market-data APIs. Alpaca splits
/// order/account/position endpoints (trading) from quotes/trades
/// (market data) across two base URLs; both are required.
pub struct AlpacaClient {
    client: Client,
    trading_base_url: String,
    data_base_url: String,
    api_key: String,
    secret_key: String,
}

impl AlpacaClient {
    pub fn new(
        api_key: String,
        secret_key: String,
        trading_base_url: String,
        data_base_url: String,
    ) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            trading_base_url,
            data_base_url,
            api_key,
            secret_key,
        })
    }

    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ALPACA_API_KEY").context("ALPACA_API_KEY not set")?;
        let secret_key =
            std::env::var("ALPACA_SECRET_KEY").context("ALPACA_SECRET_KEY not set")?;
        let trading_base_url = std::env::var("ALPACA_BASE_URL")
            .unwrap_or_else(|_| "https://paper-api.alpaca.markets".to_string());
        let data_base_url = std::env::var("ALPACA_DATA_URL")
            .unwrap_or_else(|_| "https://data.alpaca.markets".to_string());
        Self::new(api_key, secret_key, trading_base_url, data_base_url)
    }

    fn auth_headers(&self) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "APCA-API-KEY-ID",
            header::HeaderValue::from_str(&self.api_key)
                .expect("API key contains invalid header characters"),
        );
        headers.insert(
            "APCA-API-SECRET-KEY",
            header::HeaderValue::from_str(&self.secret_key)
                .expect("secret key contains invalid header characters"),
        );
        headers
    }

    pub fn is_paper(&self) -> bool {
        self.trading_base_url.contains("paper-api")
    }

    async fn get_account_raw(&self) -> Result<Account> {
        let url = format!("{}/v2/account", self.trading_base_url);
        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers())
            .send()
            .await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("alpaca get_account failed: {}", body));
        }
        Ok(response.json::<Account>().await?)
    }

    async fn list_positions_raw(&self) -> Result<Vec<Position>> {
        let url = format!("{}/v2/positions", self.trading_base_url);
        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers())
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(vec![]);
        }
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("alpaca list_positions failed: {}", body));
        }
        Ok(response.json::<Vec<Position>>().await?)
    }

    async fn quote_midpoint(&self, symbol: &str) -> Option<f64> {
        let url = format!(
            "{}/v2/stocks/{}/quotes/latest",
            self.data_base_url, symbol
        );
        let resp = self
            .client
            .get(&url)
            .headers(self.auth_headers())
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let parsed: QuoteResponse = resp.json().await.ok()?;
        let quote = parsed.quote?;
        if quote.bid_price > 0.0 && quote.ask_price > 0.0 {
            Some((quote.bid_price + quote.ask_price) / 2.0)
        } else if quote.bid_price > 0.0 {
            Some(quote.bid_price)
        } else if quote.ask_price > 0.0 {
            Some(quote.ask_price)
        } else {
            None
        }
    }

    /// Cancels every open order for `symbol` so a broker-side bracket leg
    /// cannot re-trigger a fill after the engine has closed the position.
    async fn cancel_open_orders(&self, symbol: &str) -> Result<()> {
        let url = format!(
            "{}/v2/orders?status=open&symbols={}",
            self.trading_base_url, symbol
        );
        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers())
            .send()
            .await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("list open orders failed: {}", body));
        }
        let open_orders: Vec<OpenOrder> = response.json().await?;
        for order in open_orders {
            let cancel_url = format!("{}/v2/orders/{}", self.trading_base_url, order.id);
            let resp = self
                .client
                .delete(&cancel_url)
                .headers(self.auth_headers())
                .send()
                .await?;
            if !resp.status().is_success() && resp.status().as_u16() != 404 {
                tracing::warn!(
                    "failed to cancel order {} for {}: {}",
                    order.id,
                    symbol,
                    resp.status()
                );
            }
        }
        Ok(())
    }

    async fn last_trade_price(&self, symbol: &str) -> Option<f64> {
        let url = format!(
            "{}/v2/stocks/{}/trades/latest",
            self.data_base_url, symbol
        );
        let resp = self
            .client
            .get(&url)
            .headers(self.auth_headers())
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let parsed: TradeResponse = resp.json().await.ok()?;
        parsed.trade.map(|t| t.price).filter(|p| *p > 0.0)
    }
}

#[async_trait]
impl BrokerClient for AlpacaClient {
    fn name(&self) -> &str {
        "alpaca"
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.secret_key.is_empty()
    }

    async fn is_market_open(&self) -> bool {
        let url = format!("{}/v2/clock", self.trading_base_url);
        let result = self
            .client
            .get(&url)
            .headers(self.auth_headers())
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => resp
                .json::<Clock>()
                .await
                .map(|c| c.is_open)
                .unwrap_or(false),
            _ => false,
        }
    }

    async fn get_account(&self) -> Result<BrokerAccount> {
        let raw = self.get_account_raw().await?;
        let equity = Decimal::from_str(&raw.equity).unwrap_or_default();
        let cash = Decimal::from_str(&raw.cash).unwrap_or_default();
        Ok(BrokerAccount { equity, cash })
    }

    async fn list_positions(&self) -> Vec<BrokerPosition> {
        match self.list_positions_raw().await {
            Ok(positions) => positions
                .into_iter()
                .filter(|p| p.side == "long")
                .map(|p| BrokerPosition {
                    symbol: p.symbol,
                    qty: Decimal::from_str(&p.qty).unwrap_or_default().abs(),
                    avg_entry_price: Decimal::from_str(&p.avg_entry_price).ok(),
                    market_value: p.market_value.and_then(|v| Decimal::from_str(&v).ok()),
                })
                .collect(),
            Err(e) => {
                tracing::warn!("alpaca list_positions failed: {}", e);
                vec![]
            }
        }
    }

    async fn latest_price(&self, symbol: &str) -> Option<Decimal> {
        let price = match self.quote_midpoint(symbol).await {
            Some(p) => Some(p),
            None => self.last_trade_price(symbol).await,
        }?;
        Decimal::from_f64(price)
    }

    async fn place_entry_with_bracket(
        &self,
        symbol: &str,
        qty: i64,
        stop_loss_pct: f64,
        take_profit_pct: f64,
        client_order_id: &str,
    ) -> Result<()> {
        if qty <= 0 {
            return Err(anyhow!("qty must be positive, got {}", qty));
        }
        let price = self
            .latest_price(symbol)
            .await
            .ok_or_else(|| anyhow!("no_price for {}", symbol))?
            .to_string()
            .parse::<f64>()
            .unwrap_or(0.0);
        if price <= 0.0 {
            return Err(anyhow!("no_price for {}", symbol));
        }
        let stop_price = round2(price * (1.0 - stop_loss_pct));
        let take_price = round2(price * (1.0 + take_profit_pct));

        let truncated_id: String = client_order_id.chars().take(48).collect();
        let order = OrderRequest {
            symbol: symbol.to_string(),
            qty: Some(qty.to_string()),
            notional: None,
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Day,
            limit_price: None,
            stop_price: None,
            client_order_id: Some(truncated_id),
            order_class: Some("bracket".to_string()),
            take_profit: Some(BracketLeg {
                limit_price: Some(format!("{:.2}", take_price)),
                stop_price: None,
            }),
            stop_loss: Some(BracketLeg {
                limit_price: None,
                stop_price: Some(format!("{:.2}", stop_price)),
            }),
        };

        let url = format!("{}/v2/orders", self.trading_base_url);
        let response = self
            .client
            .post(&url)
            .headers(self.auth_headers())
            .json(&order)
            .send()
            .await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("bracket order rejected: {}", body));
        }
        Ok(())
    }

    async fn close_position(&self, symbol: &str, qty: Option<i64>, client_order_id: &str) -> Result<()> {
        if let Err(e) = self.cancel_open_orders(symbol).await {
            tracing::warn!("cancel_open_orders failed for {}: {}", symbol, e);
        }
        match qty {
            None => {
                let url = format!("{}/v2/positions/{}", self.trading_base_url, symbol);
                let response = self
                    .client
                    .delete(&url)
                    .headers(self.auth_headers())
                    .send()
                    .await?;
                let status = response.status();
                if status.as_u16() == 404 {
                    return Ok(());
                }
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(anyhow!("close_position failed: {}", body));
                }
                Ok(())
            }
            Some(n) if n > 0 => {
                let truncated_id: String = client_order_id.chars().take(48).collect();
                let order = OrderRequest {
                    symbol: symbol.to_string(),
                    qty: Some(n.to_string()),
                    notional: None,
                    side: OrderSide::Sell,
                    order_type: OrderType::Market,
                    time_in_force: TimeInForce::Day,
                    limit_price: None,
                    stop_price: None,
                    client_order_id: Some(truncated_id),
                    order_class: None,
                    take_profit: None,
                    stop_loss: None,
                };
                let url = format!("{}/v2/orders", self.trading_base_url);
                let response = self
                    .client
                    .post(&url)
                    .headers(self.auth_headers())
                    .json(&order)
                    .send()
                    .await?;
                if !response.status().is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(anyhow!("partial close rejected: {}", body));
                }
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
