use crate::model::{RawRecord, UpsertSummary, WatermarkEntry};
use crate::sink::{prepare_batch, UpsertSink};
use crate::watermark::{parse_or_reload, WatermarkStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashSet;
use sync_core::config::{is_safe_identifier, SyncConfig};
use sync_core::{Error, Result};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

/// SQLSTATEs raised when two sessions race on `CREATE TABLE IF NOT EXISTS`.
const CREATE_RACE_SQLSTATES: &[&str] = &["23505", "42P07"];

/// Postgres-backed warehouse: raw landing tables plus the watermark table.
pub struct Store {
    pool: PgPool,
    table_prefix: String,
    watermark_table: String,
    created: RwLock<HashSet<String>>,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub version: String,
    pub database: String,
    pub user: String,
}

impl Store {
    pub fn new(pool: PgPool, config: &SyncConfig) -> Self {
        Self {
            pool,
            table_prefix: config.table_prefix.clone(),
            watermark_table: config.watermark_table.clone(),
            created: RwLock::new(HashSet::new()),
        }
    }

    pub fn raw_table_name(&self, table: &str) -> Result<String> {
        let name = format!("{}{}", self.table_prefix, table.replace('-', "_"));
        if !is_safe_identifier(&name) {
            return Err(Error::Config(format!(
                "'{}' is not a valid table name",
                name
            )));
        }
        Ok(name)
    }

    async fn execute_ddl(&self, name: &str, ddl: &str) -> Result<()> {
        if self.created.read().await.contains(name) {
            return Ok(());
        }

        match sqlx::query(ddl).execute(&self.pool).await {
            Ok(_) => {}
            Err(sqlx::Error::Database(e))
                if e.code()
                    .map_or(false, |c| CREATE_RACE_SQLSTATES.contains(&c.as_ref())) =>
            {
                debug!(table = name, "Table created concurrently");
            }
            Err(e) => return Err(e.into()),
        }

        self.created.write().await.insert(name.to_string());
        Ok(())
    }

    async fn ensure_watermark_table(&self) -> Result<()> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                table_name TEXT PRIMARY KEY,
                watermark TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            self.watermark_table
        );
        self.execute_ddl(&self.watermark_table, &ddl).await
    }

    /// Creates the raw landing table for `table` if it does not exist yet.
    pub async fn ensure_raw_table(&self, table: &str) -> Result<String> {
        let raw_table = self.raw_table_name(table)?;
        let logical = table.replace('-', "_");
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {raw_table} (
                id VARCHAR(255) PRIMARY KEY,
                last_processed_at TIMESTAMPTZ,
                _airbyte_ab_id VARCHAR(255),
                _airbyte_emitted_at TIMESTAMPTZ,
                _airbyte_normalized_at TIMESTAMPTZ,
                _airbyte_{logical}_hashid VARCHAR(255),
                data JSONB
            )
            "#
        );
        self.execute_ddl(&raw_table, &ddl).await?;
        Ok(raw_table)
    }

    #[instrument(skip(self))]
    pub async fn list_watermarks(&self) -> Result<Vec<WatermarkEntry>> {
        self.ensure_watermark_table().await?;
        let query = format!(
            "SELECT table_name, watermark, updated_at FROM {} ORDER BY table_name",
            self.watermark_table
        );
        let entries = sqlx::query_as::<_, WatermarkEntry>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    /// Maintenance: forget the watermark so the next sync is a full load.
    #[instrument(skip(self))]
    pub async fn reset_watermark(&self, table: &str) -> Result<bool> {
        self.ensure_watermark_table().await?;
        let query = format!("DELETE FROM {} WHERE table_name = $1", self.watermark_table);
        let result = sqlx::query(&query)
            .bind(table.replace('-', "_"))
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected() > 0;
        info!(table, removed, "Reset watermark");
        Ok(removed)
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn connection_info(&self) -> Result<ConnectionInfo> {
        let version: String = sqlx::query_scalar("SELECT version()")
            .fetch_one(&self.pool)
            .await?;
        let (database, user): (String, String) =
            sqlx::query_as("SELECT current_database()::text, current_user::text")
                .fetch_one(&self.pool)
                .await?;

        Ok(ConnectionInfo {
            version,
            database,
            user,
        })
    }
}

#[async_trait]
impl WatermarkStore for Store {
    #[instrument(skip(self))]
    async fn get(&self, table: &str) -> Result<Option<DateTime<Utc>>> {
        self.ensure_watermark_table().await?;
        self.ensure_raw_table(table).await?;

        // Read as text so legacy text-typed values parse the same way
        let query = format!(
            "SELECT watermark::text FROM {} WHERE table_name = $1",
            self.watermark_table
        );
        let raw: Option<Option<String>> = sqlx::query_scalar(&query)
            .bind(table)
            .fetch_optional(&self.pool)
            .await?;

        let watermark = parse_or_reload(table, raw.flatten());
        debug!(table, watermark = ?watermark, "Read watermark");
        Ok(watermark)
    }

    #[instrument(skip(self))]
    async fn advance(&self, table: &str, at: DateTime<Utc>) -> Result<()> {
        self.ensure_watermark_table().await?;
        let query = format!(
            r#"
            INSERT INTO {wm} (table_name, watermark, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (table_name) DO UPDATE SET
                watermark = GREATEST({wm}.watermark, EXCLUDED.watermark),
                updated_at = NOW()
            "#,
            wm = self.watermark_table
        );
        sqlx::query(&query)
            .bind(table)
            .bind(at)
            .execute(&self.pool)
            .await?;

        counter!("sync_watermarks_advanced", "table" => table.to_string()).increment(1);
        debug!(table, watermark = %at, "Advanced watermark");
        Ok(())
    }
}

#[async_trait]
impl UpsertSink for Store {
    #[instrument(skip(self, records), fields(records = records.len()))]
    async fn upsert(
        &self,
        table: &str,
        identity_field: &str,
        records: &[RawRecord],
    ) -> Result<UpsertSummary> {
        if records.is_empty() {
            info!(table, "No new data to upsert");
            return Ok(UpsertSummary::default());
        }

        let raw_table = self.ensure_raw_table(table).await?;
        let captured_at = Utc::now();
        let prepared = prepare_batch(table, identity_field, records, captured_at);
        let summary = prepared.summary();

        if prepared.rows.is_empty() {
            info!(table, dropped = summary.dropped, "Batch had no records with an identity");
            return Ok(summary);
        }

        let mut ids = Vec::with_capacity(prepared.rows.len());
        let mut ab_ids = Vec::with_capacity(prepared.rows.len());
        let mut hashids = Vec::with_capacity(prepared.rows.len());
        let mut payloads: Vec<Value> = Vec::with_capacity(prepared.rows.len());
        for row in prepared.rows {
            ids.push(row.id);
            ab_ids.push(row.ab_id);
            hashids.push(row.hashid);
            payloads.push(row.data);
        }

        let hash_column = format!("_airbyte_{}_hashid", table.replace('-', "_"));
        let query = format!(
            r#"
            INSERT INTO {raw_table} (
                id, last_processed_at, _airbyte_ab_id,
                _airbyte_emitted_at, _airbyte_normalized_at,
                {hash_column}, data
            )
            SELECT u.id, $5, u.ab_id, $5, $5, u.hashid, u.data
            FROM UNNEST($1::varchar[], $2::varchar[], $3::varchar[], $4::jsonb[])
                AS u(id, ab_id, hashid, data)
            ON CONFLICT (id) DO UPDATE SET
                last_processed_at = EXCLUDED.last_processed_at,
                _airbyte_ab_id = EXCLUDED._airbyte_ab_id,
                _airbyte_emitted_at = EXCLUDED._airbyte_emitted_at,
                _airbyte_normalized_at = EXCLUDED._airbyte_normalized_at,
                {hash_column} = EXCLUDED.{hash_column},
                data = EXCLUDED.data
            "#
        );

        // One transaction per batch: either every row reflects it or none do
        let mut tx = self.pool.begin().await?;
        sqlx::query(&query)
            .bind(&ids)
            .bind(&ab_ids)
            .bind(&hashids)
            .bind(&payloads)
            .bind(captured_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        counter!("sync_records_landed", "table" => table.to_string())
            .increment(summary.landed as u64);
        counter!("sync_records_dropped", "table" => table.to_string())
            .increment(summary.dropped as u64);

        info!(
            table = %raw_table,
            landed = summary.landed,
            dropped = summary.dropped,
            duplicates = summary.duplicates,
            "Upserted batch"
        );

        Ok(summary)
    }
}
