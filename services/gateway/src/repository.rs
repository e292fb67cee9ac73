//! Optional durable repository
//!
//! Structured SQLite tables behind the PIT store's dual-write: trades that
//! decode cleanly land in `trades`, regime snapshots in `regime_snapshots`,
//! and everything else in `premove_artifacts`. The file snapshot is always
//! authoritative; this store exists for fast structured queries.

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use types::Trade;

use crate::error::{GatewayError, Result};
use crate::pit::PitRecord;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS trades (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_ns     INTEGER NOT NULL,
    venue     TEXT    NOT NULL,
    symbol    TEXT    NOT NULL,
    price     REAL    NOT NULL,
    size      REAL    NOT NULL,
    side      TEXT    NOT NULL,
    trade_id  TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_trades_symbol_ts ON trades(symbol, ts_ns);

CREATE TABLE IF NOT EXISTS regime_snapshots (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    ts      TEXT NOT NULL,
    source  TEXT NOT NULL,
    payload TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS premove_artifacts (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    ts      TEXT NOT NULL,
    source  TEXT NOT NULL,
    entity  TEXT NOT NULL,
    payload TEXT NOT NULL
);
";

/// SQLite-backed structured store.
pub struct Repository {
    conn: Mutex<Connection>,
}

impl Repository {
    /// Open (and create) the database, applying the schema and WAL mode.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| GatewayError::Repository(format!("open {path}: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| GatewayError::Repository(format!("wal: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| GatewayError::Repository(format!("schema: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| GatewayError::Repository(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| GatewayError::Repository(format!("schema: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Route a PIT record into its structured table.
    pub fn store_snapshot(&self, record: &PitRecord) -> Result<()> {
        if record.entity == "trades" {
            if let Ok(trade) = serde_json::from_slice::<Trade>(&record.payload) {
                return self.insert_trade(&record.source, &trade);
            }
        }
        if record.entity.contains("regime") {
            return self.insert_regime_snapshot(
                &record.ts.to_rfc3339(),
                &record.source,
                &String::from_utf8_lossy(&record.payload),
            );
        }
        self.insert_artifact(
            &record.ts.to_rfc3339(),
            &record.source,
            &record.entity,
            &String::from_utf8_lossy(&record.payload),
        )
    }

    /// Insert one trade row.
    pub fn insert_trade(&self, venue: &str, trade: &Trade) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO trades (ts_ns, venue, symbol, price, size, side, trade_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    trade.timestamp_ns as i64,
                    venue,
                    trade.symbol,
                    trade.price,
                    trade.size,
                    trade.side.to_string(),
                    trade.trade_id,
                ],
            )
            .map_err(|e| GatewayError::Repository(format!("insert trade: {e}")))?;
        Ok(())
    }

    /// Insert one regime snapshot row.
    pub fn insert_regime_snapshot(&self, ts: &str, source: &str, payload: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO regime_snapshots (ts, source, payload) VALUES (?1, ?2, ?3)",
                params![ts, source, payload],
            )
            .map_err(|e| GatewayError::Repository(format!("insert regime: {e}")))?;
        Ok(())
    }

    /// Insert one artifact row.
    pub fn insert_artifact(
        &self,
        ts: &str,
        source: &str,
        entity: &str,
        payload: &str,
    ) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO premove_artifacts (ts, source, entity, payload)
                 VALUES (?1, ?2, ?3, ?4)",
                params![ts, source, entity, payload],
            )
            .map_err(|e| GatewayError::Repository(format!("insert artifact: {e}")))?;
        Ok(())
    }

    /// Most recent trades for a symbol, newest first.
    pub fn recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<(String, Trade)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT venue, ts_ns, symbol, price, size, side, trade_id
                 FROM trades WHERE symbol = ?1 ORDER BY ts_ns DESC LIMIT ?2",
            )
            .map_err(|e| GatewayError::Repository(e.to_string()))?;

        let rows = stmt
            .query_map(params![symbol, limit as i64], |row| {
                let venue: String = row.get(0)?;
                let side: String = row.get(5)?;
                Ok((
                    venue,
                    Trade {
                        timestamp_ns: row.get::<_, i64>(1)? as u64,
                        symbol: row.get(2)?,
                        price: row.get(3)?,
                        size: row.get(4)?,
                        side: if side == "sell" {
                            types::Side::Sell
                        } else {
                            types::Side::Buy
                        },
                        trade_id: row.get(6)?,
                    },
                ))
            })
            .map_err(|e| GatewayError::Repository(e.to_string()))?;

        let mut trades = Vec::new();
        for row in rows {
            trades.push(row.map_err(|e| GatewayError::Repository(e.to_string()))?);
        }
        Ok(trades)
    }

    /// Row counts per table, for observability.
    pub fn counts(&self) -> Result<(u64, u64, u64)> {
        let conn = self.conn.lock();
        let count = |table: &str| -> Result<u64> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as u64)
            .map_err(|e| GatewayError::Repository(e.to_string()))
        };
        Ok((
            count("trades")?,
            count("regime_snapshots")?,
            count("premove_artifacts")?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use types::Side;

    fn sample_trade(id: &str, ts_ns: u64) -> Trade {
        Trade {
            symbol: "BTCUSD".to_string(),
            price: 62_000.0,
            size: 0.1,
            side: Side::Buy,
            trade_id: id.to_string(),
            timestamp_ns: ts_ns,
        }
    }

    #[test]
    fn trades_round_trip_newest_first() {
        let repo = Repository::open_in_memory().unwrap();
        repo.insert_trade("kraken", &sample_trade("a", 100)).unwrap();
        repo.insert_trade("kraken", &sample_trade("b", 200)).unwrap();

        let trades = repo.recent_trades("BTCUSD", 10).unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].1.trade_id, "b");
        assert_eq!(trades[1].1.trade_id, "a");
        assert_eq!(trades[0].0, "kraken");
    }

    #[test]
    fn snapshot_routing_by_entity() {
        let repo = Repository::open_in_memory().unwrap();

        let trade = sample_trade("t1", 42);
        let record = PitRecord {
            entity: "trades".to_string(),
            ts: Utc::now(),
            source: "kraken".to_string(),
            payload: serde_json::to_vec(&trade).unwrap(),
            integrity_digest: String::new(),
        };
        repo.store_snapshot(&record).unwrap();

        let regime = PitRecord {
            entity: "regime".to_string(),
            ts: Utc::now(),
            source: "scanner".to_string(),
            payload: b"{\"state\":\"trending\"}".to_vec(),
            integrity_digest: String::new(),
        };
        repo.store_snapshot(&regime).unwrap();

        let other = PitRecord {
            entity: "book_l2".to_string(),
            ts: Utc::now(),
            source: "binance".to_string(),
            payload: b"{}".to_vec(),
            integrity_digest: String::new(),
        };
        repo.store_snapshot(&other).unwrap();

        assert_eq!(repo.counts().unwrap(), (1, 1, 1));
    }

    #[test]
    fn open_creates_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.db");
        let repo = Repository::open(&path.display().to_string()).unwrap();
        repo.insert_artifact("2026-07-15T00:00:00Z", "test", "premove", "{}").unwrap();
        assert!(path.exists());
    }
}
