use anyhow::Result;
use serde::Serialize;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

/// One executed action, as written by the decision engine after every
/// open/close. Append-only; there is no update or delete path.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TradeRow {
    pub id: i64,
    pub ts_ms: i64,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub score: i64,
    pub price_est: Option<f64>,
    pub reason: Option<String>,
    pub broker: Option<String>,
    pub mode: Option<String>,
}

pub struct TradeLog {
    pool: SqlitePool,
}

impl TradeLog {
    /// Opens (creating if necessary) the sqlite file at `path` and
    /// ensures the schema exists.
    pub async fn open(path: &str) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", path);
        let pool = SqlitePoolOptions::new().max_connections(4).connect(&url).await?;
        let log = Self { pool };
        log.init().await?;
        Ok(log)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts_ms INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                qty REAL NOT NULL,
                score INTEGER NOT NULL,
                price_est REAL,
                reason TEXT,
                broker TEXT,
                mode TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_ts ON trades(ts_ms)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn log_trade(
        &self,
        ts_ms: i64,
        symbol: &str,
        side: &str,
        qty: f64,
        score: i64,
        price_est: Option<f64>,
        reason: Option<&str>,
        broker: &str,
        mode: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO trades (ts_ms, symbol, side, qty, score, price_est, reason, broker, mode)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(ts_ms)
        .bind(symbol)
        .bind(side)
        .bind(qty)
        .bind(score)
        .bind(price_est)
        .bind(reason)
        .bind(broker)
        .bind(mode)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_trades(&self, limit: i64) -> Result<Vec<TradeRow>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT id, ts_ms, symbol, side, qty, score, price_est, reason, broker, mode
             FROM trades ORDER BY ts_ms DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
