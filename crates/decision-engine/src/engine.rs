use crate::config::AgentConfig;
use crate::control::ControlInputs;
use crate::sizing::{desired_weight, rotation_worth_it};
use crate::state::{PersistentStateStore, RuntimeState};
use anyhow::Result;
use broker_trait::{BrokerClient, Position};
use chrono::Utc;
use rand::seq::SliceRandom;
use risk_profile::ProfileParams;
use signal_feed::SignalFeed;
use std::collections::HashMap;
use std::sync::Arc;
use trade_log::TradeLog;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn new_client_order_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("de_{}", &id[..10])
}

struct CachedAccount {
    equity: f64,
    cash: f64,
    polled_at_ms: i64,
}

/// The orchestrator: one `tick()` per `T_DECISION` fuses the score map,
/// broker state, risk profile, and control inputs into open/close/rotate
/// actions, then persists runtime state.
pub struct DecisionEngine {
    broker: Arc<dyn BrokerClient>,
    feed: Arc<SignalFeed>,
    control: ControlInputs,
    store: PersistentStateStore,
    trade_log: Arc<TradeLog>,
    cfg: AgentConfig,
    state: RuntimeState,
    account: Option<CachedAccount>,
}

impl DecisionEngine {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        feed: Arc<SignalFeed>,
        control: ControlInputs,
        store: PersistentStateStore,
        trade_log: Arc<TradeLog>,
        cfg: AgentConfig,
    ) -> Self {
        let state = store.load();
        Self {
            broker,
            feed,
            control,
            store,
            trade_log,
            cfg,
            state,
            account: None,
        }
    }

    pub async fn tick(&mut self) -> Result<()> {
        let now = now_ms();
        let params = risk_profile::params_for(self.control.get_profile());
        let panic = self.control.get_panic();

        if !self.broker.is_configured() {
            self.finish_tick(now, "needs_broker_config", None, 0, false)?;
            return Ok(());
        }

        let market_open = self.broker.is_market_open().await;

        if panic && market_open {
            self.close_all(now, "panic").await;
            self.finish_tick(now, "panic", Some(market_open), 0, market_open)?;
            return Ok(());
        }

        if !market_open {
            self.finish_tick(now, "market_closed", Some(false), 0, false)?;
            return Ok(());
        }

        let last_update = self.feed.last_update_ms();
        let Some(last_update) = last_update else {
            self.finish_tick(now, "waiting_signals", Some(true), 0, false)?;
            return Ok(());
        };
        let age_s = (now - last_update) / 1000;

        if age_s > self.cfg.signal_stale_seconds {
            self.graceful_reduction(now, age_s).await;
            self.finish_tick(now, "safe_signal_stale", Some(true), age_s, false)?;
            return Ok(());
        }
        self.state.safe_signal.last_reduce_ms = None;

        self.refresh_account(now).await;
        let Some(account) = &self.account else {
            self.finish_tick(now, "no_account", Some(true), age_s, false)?;
            return Ok(());
        };
        let equity = account.equity;

        let day_id = Utc::now().format("%Y-%m-%d").to_string();
        if self.state.day.day_id.as_deref() != Some(day_id.as_str()) {
            self.state.day.day_id = Some(day_id);
            self.state.day.equity_start = Some(equity);
        }
        let equity_start = self.state.day.equity_start.unwrap_or(equity);
        let drawdown = if equity_start > 0.0 {
            (equity_start - equity) / equity_start
        } else {
            0.0
        };
        if drawdown > params.daily_max_drawdown_pct {
            self.close_all(now, &format!("daily_drawdown_{:.2}%", drawdown * 100.0))
                .await;
            self.finish_tick(now, "safe_daily_drawdown", Some(true), age_s, false)?;
            return Ok(());
        }

        let mut positions: HashMap<String, Position> = self
            .broker
            .list_positions()
            .await
            .into_iter()
            .map(|p| (p.symbol.clone(), p))
            .collect();

        self.update_confirmation(now, &positions, &params);
        self.decide_exits(now, &mut positions, &params).await;
        self.entries_and_rotation(now, &mut positions, &params, equity)
            .await;

        self.finish_tick(now, "ok", Some(true), age_s, true)?;
        Ok(())
    }

    async fn refresh_account(&mut self, now: i64) {
        let needs_poll = match &self.account {
            None => true,
            Some(a) => now - a.polled_at_ms >= (self.cfg.account_poll_seconds as i64) * 1000,
        };
        if !needs_poll {
            return;
        }
        match self.broker.get_account().await {
            Ok(acc) => {
                self.account = Some(CachedAccount {
                    equity: to_f64(acc.equity),
                    cash: to_f64(acc.cash),
                    polled_at_ms: now,
                });
            }
            Err(e) => {
                tracing::warn!("account poll failed: {}", e);
            }
        }
    }

    fn update_confirmation(
        &mut self,
        now: i64,
        positions: &HashMap<String, Position>,
        params: &ProfileParams,
    ) {
        for entry in self.feed.snapshot() {
            let (sym, score) = entry;
            if score >= params.entry {
                self.state.above_since.entry(sym).or_insert(now);
            } else {
                self.state.above_since.remove(&sym);
            }
        }
        for sym in positions.keys() {
            match self.feed.score(sym) {
                Some(score) => {
                    self.state.missing_since.remove(sym);
                    if score <= params.exit {
                        self.state.below_since.entry(sym.clone()).or_insert(now);
                    } else {
                        self.state.below_since.remove(sym);
                    }
                }
                None => {
                    self.state.missing_since.entry(sym.clone()).or_insert(now);
                }
            }
        }
    }

    async fn decide_exits(
        &mut self,
        now: i64,
        positions: &mut HashMap<String, Position>,
        params: &ProfileParams,
    ) {
        self.state.below_since.retain(|sym, _| positions.contains_key(sym));

        let grace_ms = self.cfg.missing_symbol_grace_seconds * 1000;
        let longest_missing = self
            .state
            .missing_since
            .iter()
            .filter(|(sym, since)| positions.contains_key(*sym) && now - **since >= grace_ms)
            .max_by_key(|(_, since)| now - **since)
            .map(|(sym, _)| sym.clone());

        let mut acted = std::collections::HashSet::new();
        if let Some(sym) = longest_missing {
            let qty = positions.get(&sym).map(|p| to_f64(p.qty)).unwrap_or(0.0);
            self.close_symbol(now, &sym, qty, "symbol_missing").await;
            self.state.missing_since.remove(&sym);
            self.state.below_since.remove(&sym);
            positions.remove(&sym);
            acted.insert(sym);
        }

        let confirm_ms = (params.exit_confirm_s as i64) * 1000;
        let confirmed: Vec<String> = self
            .state
            .below_since
            .iter()
            .filter(|(sym, since)| {
                !acted.contains(*sym) && positions.contains_key(*sym) && now - **since >= confirm_ms
            })
            .map(|(sym, _)| sym.clone())
            .collect();

        for sym in confirmed {
            let qty = positions.get(&sym).map(|p| to_f64(p.qty)).unwrap_or(0.0);
            self.close_symbol(now, &sym, qty, "score_exit").await;
            self.state.below_since.remove(&sym);
            positions.remove(&sym);
        }
    }

    async fn graceful_reduction(&mut self, now: i64, age_s: i64) {
        let step_ms = self.cfg.safe_reduce_step_seconds * 1000;
        let last = self.state.safe_signal.last_reduce_ms.unwrap_or(0);
        if now - last < step_ms {
            return;
        }
        self.state.safe_signal.last_reduce_ms = Some(now);

        let positions = self.broker.list_positions().await;
        if positions.is_empty() {
            return;
        }

        if age_s >= self.cfg.safe_stale_escalate_seconds {
            self.close_all(now, &format!("signal_stale_{}s", age_s)).await;
            return;
        }

        let mut scored: Vec<(String, Option<i64>, f64)> = positions
            .iter()
            .map(|p| (p.symbol.clone(), self.feed.score(&p.symbol), to_f64(p.qty)))
            .collect();
        if scored.iter().all(|(_, s, _)| s.is_none()) {
            scored.shuffle(&mut rand::thread_rng());
        } else {
            scored.sort_by_key(|(_, s, _)| s.unwrap_or(i64::MAX));
        }

        let reason = format!("signal_stale_reduce_{}s", age_s);
        for (sym, _, qty) in scored.into_iter().take(self.cfg.safe_reduce_per_step) {
            self.close_symbol(now, &sym, qty, &reason).await;
        }
    }

    async fn entries_and_rotation(
        &mut self,
        now: i64,
        positions: &mut HashMap<String, Position>,
        params: &ProfileParams,
        equity: f64,
    ) {
        let mut candidates: Vec<(String, i64)> = self
            .state
            .above_since
            .iter()
            .filter(|(sym, since)| {
                !positions.contains_key(*sym)
                    && now - **since >= (params.entry_confirm_s as i64) * 1000
            })
            .filter_map(|(sym, _)| self.feed.score(sym).map(|score| (sym.clone(), score)))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        if positions.len() < params.max_positions {
            let slots = params.max_positions - positions.len();
            for (sym, score) in candidates.into_iter().take(slots) {
                self.open_position(now, &sym, score, params, equity).await;
            }
            return;
        }

        let Some((candidate_sym, candidate_score)) = candidates.into_iter().next() else {
            return;
        };

        let worst = positions
            .iter()
            .map(|(sym, pos)| (sym.clone(), self.feed.score(sym).unwrap_or(50), pos.clone()))
            .min_by_key(|(_, score, _)| *score);
        let Some((worst_sym, worst_score, worst_pos)) = worst else {
            return;
        };

        if candidate_score < worst_score + params.rotation_margin {
            return;
        }
        let opened_at = self.state.opened_at_ms.get(&worst_sym).copied().unwrap_or(0);
        if now - opened_at < (params.min_hold_s as i64) * 1000 {
            return;
        }

        let out_price = self
            .broker
            .latest_price(&worst_sym)
            .await
            .map(to_f64)
            .or(worst_pos.avg_entry_price.map(to_f64))
            .unwrap_or(0.0);
        let out_notional = to_f64(worst_pos.qty) * out_price;

        if !rotation_worth_it(
            out_notional,
            worst_score,
            candidate_score,
            self.cfg.score_point_value_bps,
            self.cfg.slippage_bps,
            self.cfg.commission_per_trade,
            self.cfg.switch_cost_multiplier,
        ) {
            return;
        }

        self.close_symbol(now, &worst_sym, to_f64(worst_pos.qty), "rotate")
            .await;
        positions.remove(&worst_sym);
        self.open_position(now, &candidate_sym, candidate_score, params, equity)
            .await;
    }

    async fn open_position(
        &mut self,
        now: i64,
        symbol: &str,
        score: i64,
        params: &ProfileParams,
        equity: f64,
    ) {
        if let Some(expiry) = self.state.cooldowns.get(symbol) {
            if *expiry > now {
                return;
            }
        }

        let weight = desired_weight(
            score,
            params.entry,
            self.cfg.min_weight_per_pos,
            params.max_weight_per_pos,
        );
        let mut alloc = equity * weight.min(params.max_exposure);
        let cash = self.account.as_ref().map(|a| a.cash).unwrap_or(0.0);
        let max_spend = (cash - equity * self.cfg.cash_buffer).max(0.0);
        alloc = alloc.min(max_spend);
        if alloc <= 50.0 {
            return;
        }

        let Some(price) = self.broker.latest_price(symbol).await else {
            return;
        };
        let price_f64 = to_f64(price);
        if price_f64 <= 0.0 {
            return;
        }
        let qty = (alloc / price_f64).floor() as i64;
        if qty < 1 {
            return;
        }

        let client_id = new_client_order_id();
        match self
            .broker
            .place_entry_with_bracket(
                symbol,
                qty,
                params.stop_loss_pct,
                params.take_profit_pct,
                &client_id,
            )
            .await
        {
            Ok(()) => {
                let _ = self
                    .trade_log
                    .log_trade(
                        now,
                        symbol,
                        "BUY",
                        qty as f64,
                        score,
                        Some(price_f64),
                        Some("entry"),
                        self.broker.name(),
                        "live",
                    )
                    .await;
                self.state.opened_at_ms.insert(symbol.to_string(), now);
                self.state
                    .cooldowns
                    .insert(symbol.to_string(), now + self.cfg.cooldown_seconds * 1000);
                if let Some(acc) = self.account.as_mut() {
                    acc.cash = (acc.cash - qty as f64 * price_f64).max(0.0);
                }
            }
            Err(e) => {
                tracing::warn!("entry failed for {}: {}", symbol, e);
            }
        }
    }

    async fn close_symbol(&mut self, now: i64, symbol: &str, qty: f64, reason: &str) {
        let score = self.feed.score(symbol).unwrap_or(0);
        let client_id = new_client_order_id();
        match self.broker.close_position(symbol, None, &client_id).await {
            Ok(()) => {
                let _ = self
                    .trade_log
                    .log_trade(
                        now,
                        symbol,
                        "SELL",
                        qty,
                        score,
                        None,
                        Some(reason),
                        self.broker.name(),
                        "live",
                    )
                    .await;
                self.state.opened_at_ms.remove(symbol);
            }
            Err(e) => {
                tracing::warn!("close failed for {} ({}): {}", symbol, reason, e);
            }
        }
    }

    async fn close_all(&mut self, now: i64, reason: &str) {
        let positions = self.broker.list_positions().await;
        for p in positions {
            let qty = to_f64(p.qty);
            self.close_symbol(now, &p.symbol, qty, reason).await;
        }
    }

    /// Persists current state as-is, for the shutdown path — no phase
    /// logic runs, just a final write so trackers and health survive the
    /// process exit.
    pub fn persist_on_shutdown(&mut self) -> Result<()> {
        let now = now_ms();
        self.store.save(&mut self.state, now)
    }

    fn finish_tick(
        &mut self,
        now: i64,
        mode: &str,
        market_open: Option<bool>,
        signal_age_s: i64,
        had_positions_phase: bool,
    ) -> Result<()> {
        self.state.health.mode = Some(mode.to_string());
        self.state.health.last_tick_ms = Some(now);
        self.state.health.push_ok = Some(self.feed.push_ok());
        self.state.health.signal_last_ms = self.feed.last_update_ms();
        self.state.health.signal_age_s = Some(signal_age_s);
        self.state.health.market_open = market_open;
        if had_positions_phase {
            let mut symbols: Vec<String> = self.state.opened_at_ms.keys().cloned().collect();
            symbols.sort();
            self.state.health.positions = Some(symbols);
        }
        self.store.save(&mut self.state, now)?;
        Ok(())
    }
}

fn to_f64(d: rust_decimal::Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    d.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker_trait::Account;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::sync::Mutex;

    struct FakeBroker {
        configured: bool,
        market_open: bool,
        equity: Decimal,
        cash: Decimal,
        positions: Mutex<Vec<Position>>,
        prices: HashMap<String, Decimal>,
        opened: Mutex<Vec<String>>,
        opened_qty: Mutex<HashMap<String, i64>>,
        closed: Mutex<Vec<String>>,
    }

    impl FakeBroker {
        fn new() -> Self {
            Self {
                configured: true,
                market_open: true,
                equity: Decimal::from_str("10000").unwrap(),
                cash: Decimal::from_str("10000").unwrap(),
                positions: Mutex::new(vec![]),
                prices: HashMap::new(),
                opened: Mutex::new(vec![]),
                opened_qty: Mutex::new(HashMap::new()),
                closed: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl BrokerClient for FakeBroker {
        fn name(&self) -> &str {
            "fake"
        }
        fn is_configured(&self) -> bool {
            self.configured
        }
        async fn is_market_open(&self) -> bool {
            self.market_open
        }
        async fn get_account(&self) -> Result<Account> {
            Ok(Account {
                equity: self.equity,
                cash: self.cash,
            })
        }
        async fn list_positions(&self) -> Vec<Position> {
            self.positions.lock().unwrap().clone()
        }
        async fn latest_price(&self, symbol: &str) -> Option<Decimal> {
            self.prices.get(symbol).copied()
        }
        async fn place_entry_with_bracket(
            &self,
            symbol: &str,
            qty: i64,
            _sl: f64,
            _tp: f64,
            _cid: &str,
        ) -> Result<()> {
            self.opened.lock().unwrap().push(symbol.to_string());
            self.opened_qty
                .lock()
                .unwrap()
                .insert(symbol.to_string(), qty);
            Ok(())
        }
        async fn close_position(&self, symbol: &str, _qty: Option<i64>, _cid: &str) -> Result<()> {
            self.closed.lock().unwrap().push(symbol.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn tick_reports_needs_broker_config_when_not_configured() {
        let mut broker = FakeBroker::new();
        broker.configured = false;
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStateStore::new(dir.path()).unwrap();
        let feed = Arc::new(SignalFeed::new("http://x".into(), None, None, 20));
        let log = Arc::new(TradeLog::open(":memory:").await.unwrap());
        let cfg = test_config();
        let mut engine = DecisionEngine::new(
            Arc::new(broker),
            feed,
            ControlInputs::new("balanced".to_string()),
            store,
            log,
            cfg,
        );
        engine.tick().await.unwrap();
        assert_eq!(engine.state.health.mode.as_deref(), Some("needs_broker_config"));
    }

    #[tokio::test]
    async fn tick_opens_a_position_once_confirmed() {
        let mut broker = FakeBroker::new();
        broker
            .prices
            .insert("AAA".to_string(), Decimal::from_str("100").unwrap());
        let broker = Arc::new(broker);
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStateStore::new(dir.path()).unwrap();
        let feed = Arc::new(SignalFeed::new("http://x".into(), None, None, 20));
        feed.seed_score("AAA", 80);
        let log = Arc::new(TradeLog::open(":memory:").await.unwrap());
        let cfg = test_config();

        let mut engine = DecisionEngine::new(
            broker.clone(),
            feed.clone(),
            ControlInputs::new("balanced".to_string()),
            store,
            log,
            cfg,
        );

        // First tick establishes above_since; not enough time has passed yet.
        engine.tick().await.unwrap();
        assert!(broker.opened.lock().unwrap().is_empty());

        // Backdate the confirmation so the next tick clears entry_confirm_s.
        let sym_since = engine.state.above_since.get_mut("AAA").unwrap();
        *sym_since -= 50_000;
        engine.tick().await.unwrap();

        assert_eq!(broker.opened.lock().unwrap().as_slice(), ["AAA"]);
        // score=80, entry=74, min=0.08, max=0.25 (balanced): qty = floor(10000 * weight / 100) = 8.
        assert_eq!(broker.opened_qty.lock().unwrap().get("AAA"), Some(&8));
    }

    fn pos(symbol: &str, qty: &str, avg_entry: &str) -> Position {
        Position {
            symbol: symbol.to_string(),
            qty: Decimal::from_str(qty).unwrap(),
            avg_entry_price: Some(Decimal::from_str(avg_entry).unwrap()),
            market_value: None,
        }
    }

    #[tokio::test]
    async fn panic_tick_closes_all_longs_and_opens_nothing() {
        let mut broker = FakeBroker::new();
        broker.positions = Mutex::new(vec![pos("AAA", "10", "100"), pos("BBB", "5", "50")]);
        let broker = Arc::new(broker);
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStateStore::new(dir.path()).unwrap();
        let feed = Arc::new(SignalFeed::new("http://x".into(), None, None, 20));
        let log = Arc::new(TradeLog::open(":memory:").await.unwrap());
        let control = ControlInputs::new("balanced".to_string());
        control.set_panic(true);

        let mut engine = DecisionEngine::new(broker.clone(), feed, control, store, log, test_config());
        engine.tick().await.unwrap();

        let mut closed = broker.closed.lock().unwrap().clone();
        closed.sort();
        assert_eq!(closed, vec!["AAA".to_string(), "BBB".to_string()]);
        assert!(broker.opened.lock().unwrap().is_empty());
        assert_eq!(engine.state.health.mode.as_deref(), Some("panic"));
    }

    #[tokio::test]
    async fn market_closed_emits_no_orders_but_keeps_trackers() {
        let mut broker = FakeBroker::new();
        broker.market_open = false;
        broker.positions = Mutex::new(vec![pos("AAA", "10", "100")]);
        let broker = Arc::new(broker);
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStateStore::new(dir.path()).unwrap();
        let feed = Arc::new(SignalFeed::new("http://x".into(), None, None, 20));
        feed.seed_score("AAA", 90);
        let log = Arc::new(TradeLog::open(":memory:").await.unwrap());

        let mut engine = DecisionEngine::new(
            broker.clone(),
            feed,
            ControlInputs::new("balanced".to_string()),
            store,
            log,
            test_config(),
        );
        engine.tick().await.unwrap();

        assert!(broker.closed.lock().unwrap().is_empty());
        assert!(broker.opened.lock().unwrap().is_empty());
        assert_eq!(engine.state.health.mode.as_deref(), Some("market_closed"));
    }

    #[tokio::test]
    async fn confirmed_exit_closes_position_with_score_exit_reason() {
        let mut broker = FakeBroker::new();
        broker.positions = Mutex::new(vec![pos("AAA", "8", "100")]);
        let broker = Arc::new(broker);
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStateStore::new(dir.path()).unwrap();
        let feed = Arc::new(SignalFeed::new("http://x".into(), None, None, 20));
        feed.seed_score("AAA", 55); // below balanced exit=56
        let log = Arc::new(TradeLog::open(":memory:").await.unwrap());

        let mut engine = DecisionEngine::new(
            broker.clone(),
            feed,
            ControlInputs::new("balanced".to_string()),
            store,
            log.clone(),
            test_config(),
        );

        // First tick starts below_since; confirm window (15s) hasn't elapsed.
        engine.tick().await.unwrap();
        assert!(broker.closed.lock().unwrap().is_empty());

        let since = engine.state.below_since.get_mut("AAA").unwrap();
        *since -= 20_000;
        engine.tick().await.unwrap();

        assert_eq!(broker.closed.lock().unwrap().as_slice(), ["AAA"]);
        let trades = log.recent_trades(10).await.unwrap();
        assert_eq!(trades[0].reason.as_deref(), Some("score_exit"));
    }

    #[tokio::test]
    async fn missing_symbol_closes_after_grace_period() {
        let mut broker = FakeBroker::new();
        broker.positions = Mutex::new(vec![pos("ZZZ", "4", "40")]);
        let broker = Arc::new(broker);
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStateStore::new(dir.path()).unwrap();
        // ZZZ never appears in the feed.
        let feed = Arc::new(SignalFeed::new("http://x".into(), None, None, 20));
        feed.seed_score("UNRELATED", 10);
        let log = Arc::new(TradeLog::open(":memory:").await.unwrap());

        let mut engine = DecisionEngine::new(
            broker.clone(),
            feed,
            ControlInputs::new("balanced".to_string()),
            store,
            log.clone(),
            test_config(),
        );

        engine.tick().await.unwrap();
        assert!(broker.closed.lock().unwrap().is_empty());

        let since = engine.state.missing_since.get_mut("ZZZ").unwrap();
        *since -= 181_000;
        engine.tick().await.unwrap();

        assert_eq!(broker.closed.lock().unwrap().as_slice(), ["ZZZ"]);
        let trades = log.recent_trades(10).await.unwrap();
        assert_eq!(trades[0].reason.as_deref(), Some("symbol_missing"));
    }

    #[tokio::test]
    async fn signal_stale_past_escalate_threshold_closes_every_long() {
        let mut broker = FakeBroker::new();
        broker.positions = Mutex::new(vec![pos("AAA", "1", "100"), pos("BBB", "2", "50")]);
        let broker = Arc::new(broker);
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStateStore::new(dir.path()).unwrap();
        let feed = Arc::new(SignalFeed::new("http://x".into(), None, None, 20));
        let stale_ts = now_ms() - 950_000;
        feed.seed_score_at("AAA", 80, stale_ts);
        let log = Arc::new(TradeLog::open(":memory:").await.unwrap());

        let mut engine = DecisionEngine::new(
            broker.clone(),
            feed,
            ControlInputs::new("balanced".to_string()),
            store,
            log,
            test_config(),
        );
        engine.tick().await.unwrap();

        let mut closed = broker.closed.lock().unwrap().clone();
        closed.sort();
        assert_eq!(closed, vec!["AAA".to_string(), "BBB".to_string()]);
        assert_eq!(engine.state.health.mode.as_deref(), Some("safe_signal_stale"));
    }

    #[tokio::test]
    async fn daily_drawdown_breach_closes_all_longs() {
        let mut broker = FakeBroker::new();
        broker.equity = Decimal::from_str("9400").unwrap();
        broker.cash = Decimal::from_str("9400").unwrap();
        broker.positions = Mutex::new(vec![pos("AAA", "3", "100")]);
        let broker = Arc::new(broker);
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStateStore::new(dir.path()).unwrap();
        let feed = Arc::new(SignalFeed::new("http://x".into(), None, None, 20));
        feed.seed_score("AAA", 80);
        let log = Arc::new(TradeLog::open(":memory:").await.unwrap());

        let mut engine = DecisionEngine::new(
            broker.clone(),
            feed,
            ControlInputs::new("balanced".to_string()),
            store,
            log,
            test_config(),
        );
        // Prime today's baseline at 10000, then let equity drop to 9400 (6% > balanced's 5%).
        engine.state.day.day_id = Some(Utc::now().format("%Y-%m-%d").to_string());
        engine.state.day.equity_start = Some(10000.0);
        engine.account = Some(CachedAccount {
            equity: 10000.0,
            cash: 10000.0,
            polled_at_ms: 0,
        });

        engine.tick().await.unwrap();

        assert_eq!(broker.closed.lock().unwrap().as_slice(), ["AAA"]);
        assert_eq!(engine.state.health.mode.as_deref(), Some("safe_daily_drawdown"));
    }

    #[tokio::test]
    async fn cooldown_blocks_reopening_a_symbol_just_closed() {
        let mut broker = FakeBroker::new();
        broker
            .prices
            .insert("AAA".to_string(), Decimal::from_str("100").unwrap());
        let broker = Arc::new(broker);
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStateStore::new(dir.path()).unwrap();
        let feed = Arc::new(SignalFeed::new("http://x".into(), None, None, 20));
        feed.seed_score("AAA", 90);
        let log = Arc::new(TradeLog::open(":memory:").await.unwrap());

        let mut engine = DecisionEngine::new(
            broker.clone(),
            feed,
            ControlInputs::new("balanced".to_string()),
            store,
            log,
            test_config(),
        );
        let now = now_ms();
        engine.state.cooldowns.insert("AAA".to_string(), now + 60_000);
        engine
            .state
            .above_since
            .insert("AAA".to_string(), now - 50_000);

        engine.tick().await.unwrap();

        assert!(broker.opened.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rotation_displaces_worst_position_when_benefit_clears_cost() {
        let mut broker = FakeBroker::new();
        broker.positions = Mutex::new(vec![
            pos("WWW", "100", "20"),
            pos("P2", "1", "30"),
            pos("P3", "1", "30"),
            pos("P4", "1", "30"),
            pos("P5", "1", "30"),
        ]);
        broker.prices.insert("WWW".to_string(), Decimal::from_str("20").unwrap());
        broker.prices.insert("NEW".to_string(), Decimal::from_str("50").unwrap());
        let broker = Arc::new(broker);
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStateStore::new(dir.path()).unwrap();
        let feed = Arc::new(SignalFeed::new("http://x".into(), None, None, 20));
        feed.seed_score("WWW", 60);
        feed.seed_score("P2", 65);
        feed.seed_score("P3", 65);
        feed.seed_score("P4", 65);
        feed.seed_score("P5", 65);
        feed.seed_score("NEW", 75);
        let log = Arc::new(TradeLog::open(":memory:").await.unwrap());

        let mut engine = DecisionEngine::new(
            broker.clone(),
            feed,
            ControlInputs::new("balanced".to_string()),
            store,
            log,
            test_config(),
        );

        let now = now_ms();
        engine.state.opened_at_ms.insert("WWW".to_string(), now - 700_000);
        engine.state.above_since.insert("NEW".to_string(), now - 50_000);

        engine.tick().await.unwrap();

        assert_eq!(broker.closed.lock().unwrap().as_slice(), ["WWW"]);
        assert_eq!(broker.opened.lock().unwrap().as_slice(), ["NEW"]);
    }

    #[tokio::test]
    async fn rotation_withheld_when_min_hold_not_yet_elapsed() {
        let mut broker = FakeBroker::new();
        broker.positions = Mutex::new(vec![
            pos("WWW", "100", "20"),
            pos("P2", "1", "30"),
            pos("P3", "1", "30"),
            pos("P4", "1", "30"),
            pos("P5", "1", "30"),
        ]);
        broker.prices.insert("WWW".to_string(), Decimal::from_str("20").unwrap());
        broker.prices.insert("NEW".to_string(), Decimal::from_str("50").unwrap());
        let broker = Arc::new(broker);
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStateStore::new(dir.path()).unwrap();
        let feed = Arc::new(SignalFeed::new("http://x".into(), None, None, 20));
        feed.seed_score("WWW", 60);
        feed.seed_score("P2", 65);
        feed.seed_score("P3", 65);
        feed.seed_score("P4", 65);
        feed.seed_score("P5", 65);
        feed.seed_score("NEW", 75);
        let log = Arc::new(TradeLog::open(":memory:").await.unwrap());

        let mut engine = DecisionEngine::new(
            broker.clone(),
            feed,
            ControlInputs::new("balanced".to_string()),
            store,
            log,
            test_config(),
        );

        let now = now_ms();
        // Opened only 60s ago: well short of balanced's 600s min_hold_s.
        engine.state.opened_at_ms.insert("WWW".to_string(), now - 60_000);
        engine.state.above_since.insert("NEW".to_string(), now - 50_000);

        engine.tick().await.unwrap();

        assert!(broker.closed.lock().unwrap().is_empty());
        assert!(broker.opened.lock().unwrap().is_empty());
    }

    fn test_config() -> AgentConfig {
        AgentConfig {
            decision_seconds: 12,
            account_poll_seconds: 20,
            poll_seconds: 20,
            signal_stale_seconds: 480,
            missing_symbol_grace_seconds: 180,
            safe_reduce_step_seconds: 60,
            safe_reduce_per_step: 1,
            safe_stale_escalate_seconds: 900,
            cooldown_seconds: 240,
            cash_buffer: 0.05,
            min_weight_per_pos: 0.08,
            score_point_value_bps: 4.0,
            commission_per_trade: 0.0,
            slippage_bps: 2.5,
            switch_cost_multiplier: 1.5,
            state_dir: "./state".to_string(),
            alpaca_api_key: "k".to_string(),
            alpaca_secret_key: "s".to_string(),
            alpaca_base_url: "https://paper-api.alpaca.markets".to_string(),
            alpaca_data_url: "https://data.alpaca.markets".to_string(),
            signal_snapshot_url: "http://x".to_string(),
            signal_ws_url: None,
            signal_ws_token: None,
            risk_profile: "balanced".to_string(),
            live_trading_approved: false,
        }
    }
}
