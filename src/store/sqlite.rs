use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use super::CandleStore;
use crate::market_data::Candle;

/// SQLite-backed candle cache.
///
/// A single connection guarded by a mutex; writers from different instance
/// threads are serialised here and deduplicated by the primary key.
pub struct SqliteCandleStore {
    conn: Mutex<Connection>,
}

impl SqliteCandleStore {
    /// Open (or create) the database file at `path` and ensure the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open candle database {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("failed to set busy timeout")?;
        enable_wal(&conn);

        ensure_schema(&conn)?;
        info!(path = %path.display(), "candle store opened");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Switch to WAL with NORMAL sync. Some filesystems (and in-memory
/// databases) refuse WAL; the store still works in the default mode.
fn enable_wal(conn: &Connection) -> bool {
    let wal = match conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0)) {
        Ok(mode) if mode.eq_ignore_ascii_case("wal") => true,
        Ok(mode) => {
            warn!(journal_mode = %mode, "WAL journal unavailable, keeping current mode");
            false
        }
        Err(e) => {
            warn!(error = %e, "failed to enable WAL journal");
            false
        }
    };
    if let Err(e) = conn.execute_batch("PRAGMA synchronous=NORMAL;") {
        warn!(error = %e, "failed to set synchronous=NORMAL");
    }
    wal
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS klines_cache (
            symbol TEXT NOT NULL,
            interval TEXT NOT NULL,
            open_time INTEGER NOT NULL,
            close_time INTEGER NOT NULL,
            open REAL NOT NULL,
            high REAL NOT NULL,
            low REAL NOT NULL,
            close REAL NOT NULL,
            volume REAL NOT NULL,
            PRIMARY KEY (symbol, interval, open_time)
        );
        CREATE INDEX IF NOT EXISTS ix_klines_cache_symbol_interval_open_time
        ON klines_cache(symbol, interval, open_time);
        "#,
    )
    .context("failed to create klines_cache schema")?;
    Ok(())
}

impl CandleStore for SqliteCandleStore {
    fn upsert_ignore_duplicates(&self, candles: &[Candle]) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to begin candle transaction")?;
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare_cached(
                    r#"
                    INSERT INTO klines_cache
                        (symbol, interval, open_time, close_time, open, high, low, close, volume)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                    ON CONFLICT(symbol, interval, open_time) DO NOTHING
                    "#,
                )
                .context("failed to prepare candle insert")?;

            for c in candles {
                inserted += stmt
                    .execute(params![
                        c.symbol,
                        c.interval,
                        c.open_time,
                        c.close_time,
                        c.open,
                        c.high,
                        c.low,
                        c.close,
                        c.volume
                    ])
                    .with_context(|| {
                        format!("failed to insert candle {}@{} {}", c.symbol, c.interval, c.open_time)
                    })?;
            }
        }
        tx.commit().context("failed to commit candle transaction")?;

        debug!(requested = candles.len(), inserted, "candles persisted");
        Ok(inserted)
    }

    fn query_range(
        &self,
        symbol: &str,
        interval: &str,
        start: i64,
        end: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                r#"
                SELECT symbol, interval, open_time, close_time, open, high, low, close, volume
                FROM klines_cache
                WHERE symbol = ?1 AND interval = ?2 AND open_time >= ?3 AND open_time <= ?4
                ORDER BY open_time ASC
                "#,
            )
            .context("failed to prepare candle range query")?;

        let rows = stmt
            .query_map(
                params![symbol, interval, start, end.unwrap_or(i64::MAX)],
                |row| {
                    Ok(Candle {
                        symbol: row.get(0)?,
                        interval: row.get(1)?,
                        open_time: row.get(2)?,
                        close_time: row.get(3)?,
                        open: row.get(4)?,
                        high: row.get(5)?,
                        low: row.get(6)?,
                        close: row.get(7)?,
                        volume: row.get(8)?,
                    })
                },
            )
            .context("failed to run candle range query")?;

        let mut candles = Vec::new();
        for row in rows {
            candles.push(row.context("failed to decode candle row")?);
        }
        Ok(candles)
    }
}
