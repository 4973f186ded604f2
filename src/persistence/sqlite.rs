//! SQLite-backed position store.
//!
//! Each position is stored as a JSON document next to a few indexed columns
//! (status, symbol, exchange) used for listing. Blocking SQLite work runs on
//! the blocking thread pool.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use super::{HedgeFilter, PositionStore, TriangularFilter};
use crate::error::{ArbError, Result};
use crate::position::{HedgePosition, TriangularPosition};

#[derive(Clone)]
pub struct SqlitePositionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePositionStore {
    /// Open (or create) the database at `db_path`.
    pub fn open<P: AsRef<Path>>(db_path: P) -> anyhow::Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {parent:?}"))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {path:?}"))?;
        let store = Self::from_connection(conn)?;
        info!("Position store initialized at {:?}", path);
        Ok(store)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| anyhow!("position store connection poisoned"))?;
            f(&guard)
        })
        .await
        .map_err(|e| ArbError::Store(e.into()))?
        .map_err(ArbError::Store)
    }
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS hedge_positions (
            id TEXT PRIMARY KEY,
            symbol TEXT NOT NULL,
            status TEXT NOT NULL,
            monitoring INTEGER NOT NULL,
            primary_exchange TEXT NOT NULL,
            hedge_exchange TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_hedge_status ON hedge_positions(status);
        CREATE INDEX IF NOT EXISTS idx_hedge_symbol ON hedge_positions(symbol);

        CREATE TABLE IF NOT EXISTS triangular_positions (
            id TEXT PRIMARY KEY,
            exchange TEXT NOT NULL,
            status TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_triangular_status ON triangular_positions(status);
        "#,
    )?;
    debug!("Position store schema initialized");
    Ok(())
}

fn load_bodies(conn: &Connection, sql: &str) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[async_trait]
impl PositionStore for SqlitePositionStore {
    async fn create_hedge(&self, position: &HedgePosition) -> Result<()> {
        let p = position.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO hedge_positions (id, symbol, status, monitoring, primary_exchange,
                                             hedge_exchange, body, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    p.id.to_string(),
                    p.symbol,
                    p.status.as_str(),
                    p.monitoring_enabled,
                    p.primary.exchange.to_string(),
                    p.hedge.exchange.to_string(),
                    serde_json::to_string(&p)?,
                    p.created_at.to_rfc3339(),
                    p.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to insert hedge position {}", p.id))?;
            Ok(())
        })
        .await
    }

    async fn update_hedge(&self, position: &HedgePosition) -> Result<()> {
        let p = position.clone();
        let id = p.id;
        let changed = self
            .with_conn(move |conn| {
                Ok(conn.execute(
                    r#"
                    UPDATE hedge_positions
                    SET status = ?2, monitoring = ?3, body = ?4, updated_at = ?5
                    WHERE id = ?1
                    "#,
                    params![
                        p.id.to_string(),
                        p.status.as_str(),
                        p.monitoring_enabled,
                        serde_json::to_string(&p)?,
                        p.updated_at.to_rfc3339(),
                    ],
                )?)
            })
            .await?;
        if changed == 0 {
            return Err(ArbError::NotFound(format!("hedge position {id}")));
        }
        Ok(())
    }

    async fn get_hedge(&self, id: Uuid) -> Result<Option<HedgePosition>> {
        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM hedge_positions WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            body.map(|b| serde_json::from_str(&b).context("Corrupt hedge position row"))
                .transpose()
        })
        .await
    }

    async fn find_hedges(&self, filter: &HedgeFilter) -> Result<Vec<HedgePosition>> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut positions = Vec::new();
            for body in load_bodies(conn, "SELECT body FROM hedge_positions ORDER BY created_at")? {
                let position: HedgePosition =
                    serde_json::from_str(&body).context("Corrupt hedge position row")?;
                if filter.matches(&position) {
                    positions.push(position);
                }
            }
            Ok(positions)
        })
        .await
    }

    async fn create_triangular(&self, position: &TriangularPosition) -> Result<()> {
        let p = position.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO triangular_positions (id, exchange, status, body, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    p.id.to_string(),
                    p.exchange.to_string(),
                    p.status.to_string(),
                    serde_json::to_string(&p)?,
                    p.created_at.to_rfc3339(),
                    p.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to insert triangular position {}", p.id))?;
            Ok(())
        })
        .await
    }

    async fn update_triangular(&self, position: &TriangularPosition) -> Result<()> {
        let p = position.clone();
        let id = p.id;
        let changed = self
            .with_conn(move |conn| {
                Ok(conn.execute(
                    "UPDATE triangular_positions SET status = ?2, body = ?3, updated_at = ?4 WHERE id = ?1",
                    params![
                        p.id.to_string(),
                        p.status.to_string(),
                        serde_json::to_string(&p)?,
                        p.updated_at.to_rfc3339(),
                    ],
                )?)
            })
            .await?;
        if changed == 0 {
            return Err(ArbError::NotFound(format!("triangular position {id}")));
        }
        Ok(())
    }

    async fn get_triangular(&self, id: Uuid) -> Result<Option<TriangularPosition>> {
        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM triangular_positions WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            body.map(|b| serde_json::from_str(&b).context("Corrupt triangular position row"))
                .transpose()
        })
        .await
    }

    async fn find_triangular(&self, filter: &TriangularFilter) -> Result<Vec<TriangularPosition>> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut positions = Vec::new();
            for body in load_bodies(
                conn,
                "SELECT body FROM triangular_positions ORDER BY created_at",
            )? {
                let position: TriangularPosition =
                    serde_json::from_str(&body).context("Corrupt triangular position row")?;
                if filter.matches(&position) {
                    positions.push(position);
                }
            }
            Ok(positions)
        })
        .await
    }

    async fn delete_triangular(&self, id: Uuid) -> Result<bool> {
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM triangular_positions WHERE id = ?1",
                params![id.to_string()],
            )?;
            Ok(removed > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Venue;
    use crate::persistence::fixtures;
    use crate::position::{HedgeStatus, TriangularPosition, TriangularStatus};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_hedge_round_trip_through_sqlite() {
        let store = SqlitePositionStore::in_memory().unwrap();
        let mut pos = fixtures::hedge("ETH/USDT", Venue::Bybit, Venue::Mexc);
        store.create_hedge(&pos).await.unwrap();

        pos.transition(HedgeStatus::Executing).unwrap();
        pos.primary.record_fill("BB-1".into(), dec!(0.5), dec!(2000), dec!(1));
        store.update_hedge(&pos).await.unwrap();

        let loaded = store.get_hedge(pos.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, HedgeStatus::Executing);
        assert_eq!(loaded.primary.filled_quantity, dec!(0.5));
        assert_eq!(loaded.primary.order_ids, vec!["BB-1".to_string()]);

        let by_venue = HedgeFilter {
            exchange: Some(Venue::Mexc),
            ..HedgeFilter::default()
        };
        assert_eq!(store.find_hedges(&by_venue).await.unwrap().len(), 1);
        assert!(store
            .find_hedges(&HedgeFilter::status(HedgeStatus::Active))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_missing_rows() {
        let store = SqlitePositionStore::in_memory().unwrap();
        let pos = fixtures::hedge("ETH/USDT", Venue::Bybit, Venue::Mexc);
        assert!(store.get_hedge(pos.id).await.unwrap().is_none());
        assert!(matches!(
            store.update_hedge(&pos).await,
            Err(ArbError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_triangular_delete() {
        use crate::position::{Direction, LegConversion, TrianglePath, TriangularOpportunity};
        use crate::exchange::{OrderSide, PairPrice};

        let price = |s: &str| PairPrice {
            symbol: s.into(),
            bid: dec!(1),
            ask: dec!(1),
            last: dec!(1),
            timestamp: chrono::Utc::now(),
        };
        let leg = |s: &str, from: &str, to: &str| LegConversion {
            symbol: s.into(),
            from_asset: from.into(),
            to_asset: to.into(),
            side: OrderSide::Buy,
        };
        let opportunity = TriangularOpportunity {
            id: Uuid::new_v4(),
            exchange: Venue::Binance,
            path: TrianglePath {
                asset_a: "USDT".into(),
                asset_b: "BTC".into(),
                asset_c: "ETH".into(),
                direction: Direction::Forward,
            },
            legs: [
                leg("BTC/USDT", "USDT", "BTC"),
                leg("ETH/BTC", "BTC", "ETH"),
                leg("ETH/USDT", "ETH", "USDT"),
            ],
            prices: [price("BTC/USDT"), price("ETH/BTC"), price("ETH/USDT")],
            theoretical_profit_pct: dec!(0),
            realistic_profit_pct: dec!(0),
            profit_amount: dec!(0),
            reference_size: dec!(100),
            estimated_slippage_pct: dec!(0),
            is_executable: false,
            detected_at: chrono::Utc::now(),
        };

        let store = SqlitePositionStore::in_memory().unwrap();
        let mut pos = TriangularPosition::from_opportunity(&opportunity, dec!(100));
        store.create_triangular(&pos).await.unwrap();
        pos.status = TriangularStatus::Cancelled;
        store.update_triangular(&pos).await.unwrap();

        let cancelled = TriangularFilter {
            statuses: vec![TriangularStatus::Cancelled],
            ..TriangularFilter::default()
        };
        assert_eq!(store.find_triangular(&cancelled).await.unwrap().len(), 1);
        assert!(store.delete_triangular(pos.id).await.unwrap());
        assert!(store.get_triangular(pos.id).await.unwrap().is_none());
    }
}
