pub mod poll;
pub mod push;

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// Upstream score snapshot: `{e: epoch, t: ts_ms, m/d: [[symbol, score], ...]}`.
/// `m` is used on the poll path (full baseline), `d` on the push path
/// (delta since the last publication); both upsert the same way.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ScorePayload {
    pub e: Option<i64>,
    pub t: Option<i64>,
    #[serde(default, alias = "d")]
    pub m: Vec<(String, i64)>,
}

/// Shared, always-readable view of the latest per-symbol scores. Owned by
/// one [`SignalFeed`]; two independent providers (poll + push) upsert into
/// it concurrently, the decision engine only ever reads it.
pub struct SignalFeed {
    scores: Arc<DashMap<String, i64>>,
    epoch: Arc<AtomicI64>,
    last_update_ms: Arc<AtomicI64>,
    push_ok: Arc<AtomicBool>,
    shutdown: Arc<tokio::sync::Notify>,
    snapshot_url: String,
    ws_url: Option<String>,
    ws_token: Option<String>,
    poll_seconds: u64,
}

impl SignalFeed {
    pub fn new(
        snapshot_url: String,
        ws_url: Option<String>,
        ws_token: Option<String>,
        poll_seconds: u64,
    ) -> Self {
        Self {
            scores: Arc::new(DashMap::new()),
            epoch: Arc::new(AtomicI64::new(0)),
            last_update_ms: Arc::new(AtomicI64::new(0)),
            push_ok: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(tokio::sync::Notify::new()),
            snapshot_url,
            ws_url,
            ws_token,
            poll_seconds,
        }
    }

    /// A read-mostly handle usable by the decision engine without cloning
    /// the whole map: `score(sym)` is a single shard lock.
    pub fn score(&self, symbol: &str) -> Option<i64> {
        self.scores.get(symbol).map(|v| *v)
    }

    pub fn snapshot(&self) -> std::collections::HashMap<String, i64> {
        self.scores
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Milliseconds since epoch of the last successful update from either
    /// path, or `None` if nothing has arrived yet.
    pub fn last_update_ms(&self) -> Option<i64> {
        match self.last_update_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub fn push_ok(&self) -> bool {
        self.push_ok.load(Ordering::Relaxed)
    }

    /// Directly seeds a score, bypassing both providers. Exists for test
    /// harnesses in downstream crates that need a known feed state
    /// without running the network providers.
    pub fn seed_score(&self, symbol: &str, score: i64) {
        self.scores.insert(symbol.to_uppercase(), score);
        self.last_update_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Like [`Self::seed_score`] but lets a test pin `last_update_ms` to an
    /// arbitrary value, e.g. to simulate a stale feed without sleeping.
    pub fn seed_score_at(&self, symbol: &str, score: i64, last_update_ms: i64) {
        self.scores.insert(symbol.to_uppercase(), score);
        self.last_update_ms.store(last_update_ms, Ordering::Relaxed);
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    fn upsert(&self, payload: &ScorePayload) {
        for (sym, score) in &payload.m {
            self.scores.insert(sym.to_uppercase(), *score);
        }
        if let Some(e) = payload.e {
            self.epoch.store(e, Ordering::Relaxed);
        }
        let ts = payload.t.unwrap_or_else(now_ms);
        self.last_update_ms.store(ts, Ordering::Relaxed);
    }

    fn set_push_ok(&self, ok: bool) {
        self.push_ok.store(ok, Ordering::Relaxed);
    }

    /// Runs both providers until `shutdown()` is called. Intended to be
    /// spawned once at startup and left running for the process lifetime.
    pub async fn run(self: Arc<Self>) {
        let poll_feed = self.clone();
        let poll_handle = tokio::spawn(async move { poll::run(poll_feed).await });

        let push_handle = if self.ws_url.is_some() {
            let push_feed = self.clone();
            Some(tokio::spawn(async move { push::run(push_feed).await }))
        } else {
            None
        };

        self.shutdown.notified().await;
        poll_handle.abort();
        if let Some(h) = push_handle {
            h.abort();
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
