//! SQLite persistence for flows, runs, waiting registrations and timers.
//!
//! Records are stored as JSON with the lookup fields in their own columns.
//! Expiry is checked in SQL so an expired registration can never be taken.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use stillcore::store::{RunStore, StoreResult, TimerStore, WaitingStore};
use stillcore::{
    timer_key, FlowDefinition, FlowId, FlowRun, NodeId, RunId, StoreError, TimerJob,
    WaitingRegistration,
};
use std::time::Duration;

fn db(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, json: &str) -> StoreResult<T> {
    serde_json::from_str(json).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        cause: e.to_string(),
    })
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating when needed) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = url
            .parse::<sqlx::sqlite::SqliteConnectOptions>()
            .map_err(db)?
            .create_if_missing(true);
        let mut pool_options = SqlitePoolOptions::new().max_connections(5);
        if url.contains(":memory:") {
            // Every connection to an in-memory database is a separate
            // database, and it vanishes with its connection.
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let store = Self { pool };
        store.init_schema().await?;
        tracing::info!(url, "SQLite store ready");
        Ok(store)
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes. Safe to call multiple times.
    pub async fn init_schema(&self) -> StoreResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS flows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                definition TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                status TEXT NOT NULL,
                record TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS waiting_registrations (
                correlation_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                channel_key TEXT,
                expires_at INTEGER,
                created_at INTEGER NOT NULL,
                record TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_waits_run_node ON waiting_registrations(run_id, node_id)",
            "CREATE INDEX IF NOT EXISTS idx_waits_expires ON waiting_registrations(expires_at)",
            r#"
            CREATE TABLE IF NOT EXISTS timer_jobs (
                job_key TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                record TEXT NOT NULL
            )
            "#,
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await.map_err(db)?;
        }
        Ok(())
    }

    fn registrations(rows: Vec<sqlx::sqlite::SqliteRow>) -> StoreResult<Vec<WaitingRegistration>> {
        rows.iter()
            .map(|row| {
                let cid: String = row.get("correlation_id");
                let record: String = row.get("record");
                decode(&cid, &record)
            })
            .collect()
    }
}

#[async_trait]
impl WaitingStore for SqliteStore {
    async fn put(&self, mut registration: WaitingRegistration, ttl: Option<Duration>) -> StoreResult<()> {
        if let Some(ttl) = ttl {
            registration.expires_at = chrono::Duration::from_std(ttl).ok().map(|d| Utc::now() + d);
        }
        let record = serde_json::to_string(&registration)?;
        sqlx::query(
            r#"
            INSERT INTO waiting_registrations
                (correlation_id, run_id, node_id, kind, channel_key, expires_at, created_at, record)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(correlation_id) DO UPDATE SET
                run_id = excluded.run_id,
                node_id = excluded.node_id,
                kind = excluded.kind,
                channel_key = excluded.channel_key,
                expires_at = excluded.expires_at,
                record = excluded.record
            "#,
        )
        .bind(&registration.correlation_id)
        .bind(registration.run_id.to_string())
        .bind(&registration.node_id)
        .bind(format!("{:?}", registration.kind))
        .bind(registration.channel_key.clone())
        .bind(registration.expires_at.map(millis))
        .bind(millis(registration.created_at))
        .bind(&record)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn get(&self, correlation_id: &str) -> StoreResult<Option<WaitingRegistration>> {
        let row = sqlx::query(
            "SELECT record FROM waiting_registrations
             WHERE correlation_id = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(correlation_id)
        .bind(millis(Utc::now()))
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        match row {
            Some(row) => {
                let record: String = row.get("record");
                decode(correlation_id, &record).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, correlation_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM waiting_registrations WHERE correlation_id = ?")
            .bind(correlation_id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(result.rows_affected() > 0)
    }

    async fn take_if_present(&self, correlation_id: &str) -> StoreResult<Option<WaitingRegistration>> {
        // Single statement: concurrent takers cannot both see the row.
        let row = sqlx::query(
            "DELETE FROM waiting_registrations
             WHERE correlation_id = ? AND (expires_at IS NULL OR expires_at > ?)
             RETURNING record",
        )
        .bind(correlation_id)
        .bind(millis(Utc::now()))
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        match row {
            Some(row) => {
                let record: String = row.get("record");
                decode(correlation_id, &record).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn find_by_node(&self, run_id: RunId, node_id: &str) -> StoreResult<Option<WaitingRegistration>> {
        let rows = sqlx::query(
            "SELECT correlation_id, record FROM waiting_registrations
             WHERE run_id = ? AND node_id = ? AND (expires_at IS NULL OR expires_at > ?)
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(run_id.to_string())
        .bind(node_id)
        .bind(millis(Utc::now()))
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(Self::registrations(rows)?.into_iter().next())
    }

    async fn list_by_run(&self, run_id: RunId) -> StoreResult<Vec<WaitingRegistration>> {
        let rows = sqlx::query(
            "SELECT correlation_id, record FROM waiting_registrations
             WHERE run_id = ? ORDER BY created_at",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Self::registrations(rows)
    }

    async fn list_active(&self) -> StoreResult<Vec<WaitingRegistration>> {
        let rows = sqlx::query(
            "SELECT correlation_id, record FROM waiting_registrations
             WHERE expires_at IS NULL OR expires_at > ?",
        )
        .bind(millis(Utc::now()))
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Self::registrations(rows)
    }

    async fn purge_expired(&self) -> StoreResult<Vec<WaitingRegistration>> {
        let rows = sqlx::query(
            "DELETE FROM waiting_registrations
             WHERE expires_at IS NOT NULL AND expires_at <= ?
             RETURNING correlation_id, record",
        )
        .bind(millis(Utc::now()))
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Self::registrations(rows)
    }
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn save_flow(&self, flow: &FlowDefinition) -> StoreResult<()> {
        let definition = serde_json::to_string(flow)?;
        sqlx::query(
            r#"
            INSERT INTO flows (id, name, definition, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(flow.id.to_string())
        .bind(&flow.name)
        .bind(&definition)
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn load_flow(&self, flow_id: FlowId) -> StoreResult<Option<FlowDefinition>> {
        let key = flow_id.to_string();
        let row = sqlx::query("SELECT definition FROM flows WHERE id = ?")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        match row {
            Some(row) => {
                let definition: String = row.get("definition");
                decode(&key, &definition).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn list_flows(&self) -> StoreResult<Vec<FlowDefinition>> {
        let rows = sqlx::query("SELECT id, definition FROM flows ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                let definition: String = row.get("definition");
                decode(&id, &definition)
            })
            .collect()
    }

    async fn save_run(&self, run: &FlowRun) -> StoreResult<()> {
        let record = serde_json::to_string(run)?;
        sqlx::query(
            r#"
            INSERT INTO runs (run_id, flow_id, tenant_id, status, record, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(run_id) DO UPDATE SET
                status = excluded.status,
                record = excluded.record,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(run.flow_id.to_string())
        .bind(&run.tenant_id)
        .bind(run.status.as_str())
        .bind(&record)
        .bind(millis(run.created_at))
        .bind(millis(run.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn load_run(&self, run_id: RunId) -> StoreResult<Option<FlowRun>> {
        let key = run_id.to_string();
        let row = sqlx::query("SELECT record FROM runs WHERE run_id = ?")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        match row {
            Some(row) => {
                let record: String = row.get("record");
                decode(&key, &record).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn list_runs(&self) -> StoreResult<Vec<FlowRun>> {
        let rows = sqlx::query("SELECT run_id, record FROM runs ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter()
            .map(|row| {
                let id: String = row.get("run_id");
                let record: String = row.get("record");
                decode(&id, &record)
            })
            .collect()
    }
}

#[async_trait]
impl TimerStore for SqliteStore {
    async fn save_timer(&self, job: &TimerJob) -> StoreResult<()> {
        let record = serde_json::to_string(job)?;
        sqlx::query(
            r#"
            INSERT INTO timer_jobs (job_key, run_id, node_id, record)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(job_key) DO UPDATE SET record = excluded.record
            "#,
        )
        .bind(job.key())
        .bind(job.run_id.to_string())
        .bind(&job.node_id)
        .bind(&record)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn delete_timer(&self, run_id: RunId, node_id: &NodeId) -> StoreResult<()> {
        sqlx::query("DELETE FROM timer_jobs WHERE job_key = ?")
            .bind(timer_key(run_id, node_id))
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn list_timers(&self) -> StoreResult<Vec<TimerJob>> {
        let rows = sqlx::query("SELECT job_key, record FROM timer_jobs")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter()
            .map(|row| {
                let key: String = row.get("job_key");
                let record: String = row.get("record");
                decode(&key, &record)
            })
            .collect()
    }
}
