//! SQLite persistence for canonical health records. Writes go through a
//! table allow-list and per-table column whitelist; the natural-key unique
//! indexes make every ingest idempotent.

pub mod queries;
pub(crate) mod schema;

use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use vitals_core::RecordSet;

pub const CRATE_NAME: &str = "vitals-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("row serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

// Concurrent opens of the same database must not race the dedup migration.
static MIGRATION_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database at `path` and bring the
    /// schema up to date.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;
        info!(db = %path.display(), "opened database");
        Self::initialize(pool).await
    }

    /// In-memory store, single connection so every query sees the same db.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::initialize(pool).await
    }

    async fn initialize(pool: SqlitePool) -> Result<Self, StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

        let _guard = MIGRATION_LOCK.lock().await;
        schema::create_all(&pool).await?;
        schema::migrate_sleep_dedup(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert dynamic rows into a known table. Unknown tables are a hard
    /// error; unknown columns within a row are silently dropped. Returns
    /// the attempted row count (duplicates are ignored by the engine).
    pub async fn insert_many(
        &self,
        table: &str,
        rows: &[Map<String, Value>],
    ) -> Result<usize, StorageError> {
        let spec = schema::table_spec(table)
            .ok_or_else(|| StorageError::UnknownTable(table.to_string()))?;
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let attempted = insert_rows(&mut tx, spec, rows).await?;
        tx.commit().await?;
        Ok(attempted)
    }

    /// Persist everything one adapter produced in a single transaction.
    pub async fn insert_record_set(
        &self,
        set: RecordSet,
    ) -> Result<BTreeMap<String, usize>, StorageError> {
        let tables = set.into_tables()?;
        let mut counts = BTreeMap::new();
        let mut tx = self.pool.begin().await?;
        for (name, rows) in tables {
            let spec = schema::table_spec(name)
                .ok_or_else(|| StorageError::UnknownTable(name.to_string()))?;
            let attempted = insert_rows(&mut tx, spec, &rows).await?;
            counts.insert(name.to_string(), attempted);
        }
        tx.commit().await?;
        Ok(counts)
    }

    /// Row count per known table, for status reporting.
    pub async fn table_counts(&self) -> Result<BTreeMap<String, i64>, StorageError> {
        let mut counts = BTreeMap::new();
        for spec in schema::TABLES {
            let sql = format!("SELECT COUNT(*) FROM {}", spec.name);
            let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
            counts.insert(spec.name.to_string(), count);
        }
        Ok(counts)
    }
}

async fn insert_rows(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    spec: &schema::TableSpec,
    rows: &[Map<String, Value>],
) -> Result<usize, StorageError> {
    let mut attempted = 0;
    for row in rows {
        let columns: Vec<&str> = spec
            .columns
            .iter()
            .copied()
            .filter(|column| row.contains_key(*column))
            .collect();
        if columns.is_empty() {
            continue;
        }
        let quoted: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
            spec.name,
            quoted.join(", "),
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for column in &columns {
            query = match &row[*column] {
                Value::Null => query.bind(None::<String>),
                Value::Bool(flag) => query.bind(*flag),
                Value::Number(number) => {
                    if let Some(int) = number.as_i64() {
                        query.bind(int)
                    } else {
                        query.bind(number.as_f64())
                    }
                }
                Value::String(text) => query.bind(text.clone()),
                other => query.bind(other.to_string()),
            };
        }
        query.execute(&mut **tx).await?;
        attempted += 1;
    }
    Ok(attempted)
}
