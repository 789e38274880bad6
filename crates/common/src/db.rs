use std::time::Instant;

use anyhow::Result;
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};

/// Synchronous handle, used by tests and one-shot tooling.
pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        // Retry for up to 30s when another connection holds the write lock.
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    pub fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ranked_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    period_days INTEGER NOT NULL,
    address TEXT NOT NULL,             -- normalized lowercase hex
    rank INTEGER NOT NULL,             -- 1-based, dense per period
    score REAL NOT NULL,
    weight REAL NOT NULL,
    win_rate REAL NOT NULL,
    executed_orders INTEGER NOT NULL,
    realized_pnl REAL NOT NULL,
    pnl_consistency REAL,
    efficiency REAL,
    remark TEXT,
    labels TEXT,                       -- JSON array of tags
    metrics TEXT,                      -- JSON audit blob (raw entry + scoring details)
    stat_open_positions INTEGER,
    stat_closed_positions INTEGER,
    stat_avg_pos_duration REAL,        -- seconds
    stat_total_pnl REAL,
    stat_max_drawdown REAL,
    fetched_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(period_days, address)
);

CREATE TABLE IF NOT EXISTS pnl_points (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    period_days INTEGER NOT NULL,
    address TEXT NOT NULL,
    source TEXT NOT NULL,              -- hyperbot, hyperliquid
    window_name TEXT NOT NULL,
    point_ts INTEGER NOT NULL,         -- unix epoch millis
    pnl_value REAL,
    equity_value REAL
);

CREATE INDEX IF NOT EXISTS idx_ranked_entries_period_rank
    ON ranked_entries(period_days, rank);
CREATE INDEX IF NOT EXISTS idx_pnl_points_period_addr
    ON pnl_points(period_days, address, source);
"#;

type DbJob = Box<dyn FnOnce(&mut Connection) + Send>;

/// Cloneable async wrapper that owns a dedicated SQLite thread.
///
/// Closures are shipped over an mpsc channel and executed sequentially on the
/// one writer connection; callers await the result through a oneshot. This is
/// the single serialization point for all persistence in the process.
#[derive(Clone)]
pub struct AsyncDb {
    tx: mpsc::Sender<DbJob>,
}

impl AsyncDb {
    pub async fn open(path: &str) -> Result<Self> {
        let path = path.to_string();
        let (tx, mut rx) = mpsc::channel::<DbJob>(256);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        std::thread::Builder::new()
            .name("sqlite".to_string())
            .spawn(move || {
                let db = match Database::open(&path).and_then(|db| {
                    db.run_migrations()?;
                    Ok(db)
                }) {
                    Ok(db) => {
                        let _ = ready_tx.send(Ok(()));
                        db
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let mut conn = db.conn;
                while let Some(job) = rx.blocking_recv() {
                    job(&mut conn);
                }
            })?;

        ready_rx.await??;
        Ok(Self { tx })
    }

    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        self.call_named("unnamed", f).await
    }

    /// Run a closure on the SQLite thread, recording queue-wait, exec time,
    /// total latency, and errors under the given query name.
    pub async fn call_named<T, F>(&self, name: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel::<Result<T>>();
        let queued_at = Instant::now();
        metrics::gauge!("selector_db_queue_depth").increment(1.0);

        let job: DbJob = Box::new(move |conn| {
            let wait_ms = queued_at.elapsed().as_secs_f64() * 1000.0;
            metrics::histogram!("selector_db_queue_wait_ms", "query" => name).record(wait_ms);

            let started = Instant::now();
            let out = f(conn);
            let exec_ms = started.elapsed().as_secs_f64() * 1000.0;
            let status = if out.is_ok() { "ok" } else { "err" };
            metrics::histogram!("selector_db_exec_ms", "query" => name).record(exec_ms);
            metrics::histogram!(
                "selector_db_query_latency_ms",
                "query" => name, "status" => status
            )
            .record(wait_ms + exec_ms);
            if out.is_err() {
                metrics::counter!("selector_db_query_errors_total", "query" => name).increment(1);
            }
            let _ = result_tx.send(out);
        });

        let send_res = self.tx.send(job).await;
        if send_res.is_err() {
            metrics::gauge!("selector_db_queue_depth").decrement(1.0);
            anyhow::bail!("db worker thread is gone");
        }
        let out = result_rx.await;
        metrics::gauge!("selector_db_queue_depth").decrement(1.0);
        out.map_err(|_| anyhow::anyhow!("db worker dropped the job for {name}"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_create_tables() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();

        let tables: Vec<String> = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"ranked_entries".to_string()));
        assert!(tables.contains(&"pnl_points".to_string()));
    }

    #[test]
    fn test_migrations_idempotent() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        db.run_migrations().unwrap(); // second call must not fail
    }

    #[test]
    fn test_ranked_entries_unique_per_period_and_address() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();

        let insert = "INSERT INTO ranked_entries
            (period_days, address, rank, score, weight, win_rate, executed_orders, realized_pnl)
            VALUES (30, '0xabc', 1, 0.9, 1.0, 0.7, 80, 100.0)";
        db.conn.execute(insert, []).unwrap();
        assert!(db.conn.execute(insert, []).is_err());
    }

    #[tokio::test]
    async fn test_asyncdb_roundtrip_and_error_path() {
        let db = AsyncDb::open(":memory:").await.unwrap();

        let v: i64 = db.call(|_conn| Ok(41 + 1)).await.unwrap();
        assert_eq!(v, 42);

        let err: Result<()> = db
            .call_named("test.err", |conn| {
                conn.execute("SELECT * FROM definitely_missing_table", [])?;
                Ok(())
            })
            .await;
        assert!(err.is_err());

        // Worker must survive an errored job.
        let v: i64 = db
            .call(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM ranked_entries", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(v, 0);
    }

    #[tokio::test]
    async fn test_asyncdb_transaction_rollback_on_error() {
        let db = AsyncDb::open(":memory:").await.unwrap();

        let res: Result<()> = db
            .call(|conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO ranked_entries
                        (period_days, address, rank, score, weight, win_rate, executed_orders, realized_pnl)
                        VALUES (30, '0xabc', 1, 0.9, 1.0, 0.7, 80, 100.0)",
                    [],
                )?;
                anyhow::bail!("boom") // tx dropped without commit
            })
            .await;
        assert!(res.is_err());

        let count: i64 = db
            .call(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM ranked_entries", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
