//! SQLite bug store + HTTP CSV fetch utilities for dfbugs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use dfbugs_core::BugRecord;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dfbugs-storage";

const CREATE_TABLE_SQL: &str = "\
CREATE TABLE IF NOT EXISTS bugs (
    id TEXT PRIMARY KEY,
    summary TEXT NOT NULL,
    status TEXT,
    category TEXT,
    resolution TEXT,
    severity TEXT,
    date_submitted TEXT
)";

const UPSERT_SQL: &str = "\
INSERT INTO bugs (id, summary, status, category, resolution, severity, date_submitted)
VALUES (?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(id) DO UPDATE SET
    summary = excluded.summary,
    status = excluded.status,
    category = excluded.category,
    resolution = excluded.resolution,
    severity = excluded.severity,
    date_submitted = excluded.date_submitted";

const SELECT_COLUMNS: &str = "id, summary, status, category, resolution, severity, date_submitted";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database not found at {0}; run `dfbugs sync` first to create it")]
    MissingDatabase(PathBuf),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Local bug database keyed by the tracker's bug id.
///
/// Single-writer by design: the pool holds one connection, and concurrent
/// sync runs against the same file are not supported.
#[derive(Debug, Clone)]
pub struct BugStore {
    pool: SqlitePool,
}

impl BugStore {
    /// Open the store, creating the database file and `bugs` table if absent.
    /// An existing table's shape is never altered.
    pub async fn open_or_create(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(CREATE_TABLE_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Open an existing store without creating anything. The posting path
    /// uses this so that a missing database is reported as such instead of
    /// silently materializing an empty one.
    pub async fn open_existing(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(StoreError::MissingDatabase(path.to_path_buf()));
        }
        let options = SqliteConnectOptions::new().filename(path);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Apply a batch of records in order inside one transaction: each record
    /// is upserted by id, counting prior existence as an update. A failure
    /// mid-batch rolls the whole transaction back, so the table never holds
    /// a partially written row.
    ///
    /// Returns `(added, updated)`. A duplicate id within the batch counts
    /// once as added and once per repeat as updated; the last occurrence's
    /// values win.
    pub async fn apply_batch(&self, records: &[BugRecord]) -> Result<(u64, u64), StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut added = 0u64;
        let mut updated = 0u64;

        for record in records {
            let exists = sqlx::query("SELECT 1 FROM bugs WHERE id = ?")
                .bind(&record.id)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();

            sqlx::query(UPSERT_SQL)
                .bind(&record.id)
                .bind(&record.summary)
                .bind(&record.status)
                .bind(&record.category)
                .bind(&record.resolution)
                .bind(&record.severity)
                .bind(&record.date_submitted)
                .execute(&mut *tx)
                .await?;

            if exists {
                updated += 1;
            } else {
                added += 1;
            }
        }

        tx.commit().await?;
        Ok((added, updated))
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) FROM bugs")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count as u64)
    }

    pub async fn get(&self, id: &str) -> Result<Option<BugRecord>, StoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM bugs WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|row| row_to_bug(&row)).transpose().map_err(Into::into)
    }

    /// Select one stored bug uniformly at random, sampling inside the engine
    /// rather than loading the table into memory. An empty (or fully
    /// filtered-out) store yields `None`.
    ///
    /// `status_filter` restricts eligibility to the listed statuses when
    /// non-empty; the default configuration leaves it empty.
    pub async fn select_random(
        &self,
        status_filter: &[String],
    ) -> Result<Option<BugRecord>, StoreError> {
        let sql = if status_filter.is_empty() {
            format!("SELECT {SELECT_COLUMNS} FROM bugs ORDER BY RANDOM() LIMIT 1")
        } else {
            let placeholders = vec!["?"; status_filter.len()].join(", ");
            format!(
                "SELECT {SELECT_COLUMNS} FROM bugs WHERE status IN ({placeholders}) \
                 ORDER BY RANDOM() LIMIT 1"
            )
        };

        let mut query = sqlx::query(&sql);
        for status in status_filter {
            query = query.bind(status);
        }

        let row = query.fetch_optional(&self.pool).await?;
        row.map(|row| row_to_bug(&row)).transpose().map_err(Into::into)
    }
}

fn row_to_bug(row: &SqliteRow) -> Result<BugRecord, sqlx::Error> {
    Ok(BugRecord {
        id: row.try_get("id")?,
        summary: row.try_get("summary")?,
        status: row.try_get("status")?,
        category: row.try_get("category")?,
        resolution: row.try_get("resolution")?,
        severity: row.try_get("severity")?,
        date_submitted: row.try_get("date_submitted")?,
    })
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Bounded-timeout HTTP text fetcher. One attempt per run: any timeout or
/// non-2xx response terminates the run before the store is touched.
#[derive(Debug)]
pub struct CsvFetcher {
    client: reqwest::Client,
}

impl CsvFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build().context("building reqwest client")?,
        })
    }

    pub async fn fetch_text(&self, run_id: Uuid, url: &str) -> Result<String, FetchError> {
        let span = info_span!("csv_fetch", %run_id, url);
        let _guard = span.enter();

        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        Ok(resp.text().await?)
    }
}
