//! CSV-to-store synchronization pipeline for dfbugs.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dfbugs_core::BugRecord;
use dfbugs_storage::{BugStore, CsvFetcher, FetchError, HttpClientConfig, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dfbugs-sync";

/// Header columns the tracker export must carry. Logical names, matched
/// verbatim against the CSV header row.
pub const REQUIRED_COLUMNS: [&str; 7] = [
    "Id",
    "Summary",
    "Status",
    "Category",
    "Resolution",
    "Severity",
    "Date Submitted",
];

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub csv_url: String,
    pub db_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            csv_url: std::env::var("DFBUGS_CSV_URL").unwrap_or_else(|_| {
                "https://dwarffortressbugtracker.com/csv_export.php".to_string()
            }),
            db_path: std::env::var("DFBUGS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_db_path()),
            user_agent: std::env::var("DFBUGS_USER_AGENT")
                .unwrap_or_else(|_| "dfbugs-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("DFBUGS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

/// Database lives next to the executable unless overridden, so cron-driven
/// runs find the same file regardless of working directory.
pub fn default_db_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("dfbugs.db")))
        .unwrap_or_else(|| PathBuf::from("dfbugs.db"))
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("required column {missing:?} not found in csv header; columns present: {present:?}")]
    MissingColumn {
        missing: String,
        present: Vec<String>,
    },
    #[error("malformed csv payload: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub added: u64,
    pub updated: u64,
    pub total: u64,
}

/// Seam for the remote CSV payload, so tests can substitute a canned body
/// for the live tracker export.
#[async_trait]
pub trait CsvSource: Send + Sync {
    async fn fetch(&self, run_id: Uuid) -> Result<String, FetchError>;
}

pub struct HttpCsvSource {
    fetcher: CsvFetcher,
    url: String,
}

impl HttpCsvSource {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let fetcher = CsvFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self {
            fetcher,
            url: config.csv_url.clone(),
        })
    }
}

#[async_trait]
impl CsvSource for HttpCsvSource {
    async fn fetch(&self, run_id: Uuid) -> Result<String, FetchError> {
        self.fetcher.fetch_text(run_id, &self.url).await
    }
}

/// The tracker export is sometimes BOM-prefixed; the marker must not reach
/// the CSV reader or it corrupts the first header name.
pub fn strip_bom(payload: &str) -> &str {
    payload.strip_prefix('\u{feff}').unwrap_or(payload)
}

/// Decode a CSV payload into records, validating the header first.
///
/// A header missing any required column fails the whole payload with the
/// missing name and the observed column set; no partial result is returned.
pub fn parse_csv(payload: &str) -> Result<Vec<BugRecord>, SyncError> {
    let mut reader = csv::Reader::from_reader(strip_bom(payload).as_bytes());
    let headers = reader.headers()?.clone();

    let mut indices = [0usize; REQUIRED_COLUMNS.len()];
    for (slot, column) in indices.iter_mut().zip(REQUIRED_COLUMNS) {
        *slot = headers
            .iter()
            .position(|header| header == column)
            .ok_or_else(|| SyncError::MissingColumn {
                missing: column.to_string(),
                present: headers.iter().map(str::to_string).collect(),
            })?;
    }
    let [id_at, summary_at, status_at, category_at, resolution_at, severity_at, submitted_at] =
        indices;

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let field = |at: usize| row.get(at).unwrap_or_default().to_string();
        records.push(BugRecord {
            id: field(id_at),
            summary: field(summary_at),
            status: field(status_at),
            category: field(category_at),
            resolution: field(resolution_at),
            severity: field(severity_at),
            date_submitted: field(submitted_at),
        });
    }
    Ok(records)
}

/// Fetch, parse, reconcile. Fetch and parse both complete before the store
/// is touched, so transport and schema failures leave it untouched; the
/// batch itself commits atomically inside the store.
pub struct SyncPipeline {
    store: BugStore,
    source: Box<dyn CsvSource>,
}

impl SyncPipeline {
    pub fn new(store: BugStore, source: Box<dyn CsvSource>) -> Self {
        Self { store, source }
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let payload = self.source.fetch(run_id).await?;
        let records = parse_csv(&payload)?;

        let (added, updated) = self.store.apply_batch(&records).await?;
        let total = self.store.count().await?;
        let finished_at = Utc::now();

        info!(%run_id, added, updated, total, "sync complete");
        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            added,
            updated,
            total,
        })
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let store = BugStore::open_or_create(&config.db_path)
        .await
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let source = HttpCsvSource::new(&config)?;
    let summary = SyncPipeline::new(store, Box::new(source)).run_once().await?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "Id,Summary,Status,Category,Resolution,Severity,Date Submitted";

    #[test]
    fn strip_bom_removes_leading_marker_only() {
        assert_eq!(strip_bom("\u{feff}Id,Summary"), "Id,Summary");
        assert_eq!(strip_bom("Id,Summary"), "Id,Summary");
        assert_eq!(strip_bom(""), "");
    }

    #[test]
    fn parses_rows_in_file_order() {
        let payload = format!("{HEADER}\n2,b,new,Gen,,minor,2020-01-02\n1,a,new,Gen,,minor,2020-01-01\n");
        let records = parse_csv(&payload).expect("parse");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "2");
        assert_eq!(records[1].id, "1");
        assert_eq!(records[1].date_submitted, "2020-01-01");
    }

    #[test]
    fn column_order_in_header_does_not_matter() {
        let payload = "Summary,Id,Status,Category,Resolution,Severity,Date Submitted\n\
                       cats adopt owners,7,new,Pets,,minor,2020-01-01\n";
        let records = parse_csv(payload).expect("parse");
        assert_eq!(records[0].id, "7");
        assert_eq!(records[0].summary, "cats adopt owners");
    }

    #[test]
    fn quoted_fields_with_commas_survive() {
        let payload = format!("{HEADER}\n1,\"stuck, badly\",new,Gen,,minor,2020-01-01\n");
        let records = parse_csv(&payload).expect("parse");
        assert_eq!(records[0].summary, "stuck, badly");
    }

    #[test]
    fn missing_column_names_the_column_and_lists_the_header() {
        let payload = "Id,Summary,Status,Category,Severity,Date Submitted\n\
                       1,a,new,Gen,minor,2020-01-01\n";
        match parse_csv(payload) {
            Err(SyncError::MissingColumn { missing, present }) => {
                assert_eq!(missing, "Resolution");
                assert_eq!(
                    present,
                    vec!["Id", "Summary", "Status", "Category", "Severity", "Date Submitted"]
                );
            }
            other => panic!("expected MissingColumn, got {other:?}"),
        }
    }

    #[test]
    fn bom_prefixed_payload_parses_identically() {
        let plain = format!("{HEADER}\n1,a,new,Gen,,minor,2020-01-01\n");
        let bommed = format!("\u{feff}{plain}");
        assert_eq!(parse_csv(&plain).expect("plain"), parse_csv(&bommed).expect("bommed"));
    }

    #[test]
    fn extra_columns_are_tolerated() {
        let payload = format!("{HEADER},Reporter\n1,a,new,Gen,,minor,2020-01-01,urist\n");
        let records = parse_csv(&payload).expect("parse");
        assert_eq!(records[0].id, "1");
    }
}
