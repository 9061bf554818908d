//! Backing-store access for menuwatch: HTTP fetch utilities with
//! retry/backoff, the remote tabular row-API client, the reader/writer
//! contracts the pipeline depends on, and a raw page archive.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use menuwatch_core::RawRecord;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "menuwatch-storage";

// Row 1 of every table is the header row; data rows start here.
pub const FIRST_DATA_ROW: u32 = 2;

pub const PRODUCTS_TABLE: &str = "products";
pub const DIFFERENCES_TABLE: &str = "differences";
pub const AVERAGES_TABLE: &str = "averages";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store api returned status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("could not decode store row: {0}")]
    Decode(String),
    #[error("row index {0} is outside the table")]
    RowIndex(u32),
}

/// Contract for reading the persisted product snapshot. The reader attaches
/// each record's physical 1-based row index before handing it to the core.
#[async_trait]
pub trait SnapshotReader: Send + Sync {
    async fn read_products(&self) -> Result<Vec<RawRecord>, StoreError>;
}

/// Contract for the write path. Whole-row overwrites only; deletes are
/// applied highest index first so earlier deletes never shift a
/// not-yet-deleted row.
#[async_trait]
pub trait CatalogWriter: Send + Sync {
    async fn append_products(&self, rows: Vec<Vec<String>>) -> Result<(), StoreError>;
    async fn update_product_row(&self, row_index: u32, row: Vec<String>) -> Result<(), StoreError>;
    async fn delete_product_rows(&self, row_indices: Vec<u32>) -> Result<(), StoreError>;
    async fn append_differences(&self, rows: Vec<Vec<String>>) -> Result<(), StoreError>;
    async fn replace_averages(&self, rows: Vec<Vec<String>>) -> Result<(), StoreError>;
    async fn set_last_run(&self, date: &str) -> Result<(), StoreError>;
}

/// Sort delete indices highest-first, dropping duplicates.
pub fn descending_unique(mut row_indices: Vec<u32>) -> Vec<u32> {
    row_indices.sort_unstable_by(|a, b| b.cmp(a));
    row_indices.dedup();
    row_indices
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Plain GET fetcher for site menu pages. One run fetches a handful of
/// pages sequentially, so there is no concurrency control here, only
/// timeout and retry.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_page(&self, site_id: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", site_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedPage {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct SheetApiConfig {
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

/// Client for the remote tabular row API the catalog lives in. Created once
/// at process start and passed into the pipeline; there is no ambient
/// global handle.
#[derive(Debug)]
pub struct SheetApiClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    backoff: BackoffPolicy,
}

impl SheetApiClient {
    pub fn new(config: SheetApiConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !config.base_url.trim().is_empty(),
            "store api base url is not configured"
        );
        anyhow::ensure!(
            !config.token.trim().is_empty(),
            "store api token is not configured"
        );

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building store api client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
            backoff: config.backoff,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, StoreError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match build().bearer_auth(&self.token).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(StoreError::Request(err));
                }
            }
        }

        Err(StoreError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    async fn append_rows(&self, table: &str, rows: Vec<Vec<String>>) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let url = self.url(&format!("tables/{table}/rows:append"));
        let body = serde_json::json!({ "rows": rows });
        self.send_with_retry(|| self.client.post(&url).json(&body))
            .await?;
        Ok(())
    }

    async fn clear_rows(&self, table: &str) -> Result<(), StoreError> {
        let url = self.url(&format!("tables/{table}/rows"));
        self.send_with_retry(|| self.client.delete(&url)).await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotReader for SheetApiClient {
    async fn read_products(&self) -> Result<Vec<RawRecord>, StoreError> {
        let url = self.url(&format!("tables/{PRODUCTS_TABLE}/rows"));
        let resp = self.send_with_retry(|| self.client.get(&url)).await?;
        let values: Vec<JsonValue> = resp.json().await?;

        let mut records = Vec::with_capacity(values.len());
        for (i, value) in values.into_iter().enumerate() {
            let mut record: RawRecord = serde_json::from_value(value)
                .map_err(|err| StoreError::Decode(err.to_string()))?;
            record.row_index = Some(FIRST_DATA_ROW + i as u32);
            records.push(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl CatalogWriter for SheetApiClient {
    async fn append_products(&self, rows: Vec<Vec<String>>) -> Result<(), StoreError> {
        self.append_rows(PRODUCTS_TABLE, rows).await
    }

    async fn update_product_row(&self, row_index: u32, row: Vec<String>) -> Result<(), StoreError> {
        let url = self.url(&format!("tables/{PRODUCTS_TABLE}/rows/{row_index}"));
        let body = serde_json::json!({ "values": row });
        self.send_with_retry(|| self.client.put(&url).json(&body))
            .await?;
        Ok(())
    }

    async fn delete_product_rows(&self, row_indices: Vec<u32>) -> Result<(), StoreError> {
        for row_index in descending_unique(row_indices) {
            let url = self.url(&format!("tables/{PRODUCTS_TABLE}/rows/{row_index}"));
            self.send_with_retry(|| self.client.delete(&url)).await?;
        }
        Ok(())
    }

    async fn append_differences(&self, rows: Vec<Vec<String>>) -> Result<(), StoreError> {
        self.append_rows(DIFFERENCES_TABLE, rows).await
    }

    async fn replace_averages(&self, rows: Vec<Vec<String>>) -> Result<(), StoreError> {
        self.clear_rows(AVERAGES_TABLE).await?;
        self.append_rows(AVERAGES_TABLE, rows).await
    }

    async fn set_last_run(&self, date: &str) -> Result<(), StoreError> {
        let url = self.url("meta/last_run");
        let body = serde_json::json!({ "date": date });
        self.send_with_retry(|| self.client.put(&url).json(&body))
            .await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryTables {
    products: Vec<Vec<String>>,
    differences: Vec<Vec<String>>,
    averages: Vec<Vec<String>>,
    last_run: Option<String>,
}

/// In-memory implementation of both store contracts, used by tests and
/// `--dry-run`. Mirrors the remote store's row addressing: data rows start
/// at [`FIRST_DATA_ROW`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub async fn products(&self) -> Vec<Vec<String>> {
        self.tables.lock().await.products.clone()
    }

    pub async fn differences(&self) -> Vec<Vec<String>> {
        self.tables.lock().await.differences.clone()
    }

    pub async fn averages(&self) -> Vec<Vec<String>> {
        self.tables.lock().await.averages.clone()
    }

    pub async fn last_run(&self) -> Option<String> {
        self.tables.lock().await.last_run.clone()
    }

    pub async fn seed_products(&self, rows: Vec<Vec<String>>) {
        self.tables.lock().await.products = rows;
    }

    fn slot(row_index: u32, len: usize) -> Result<usize, StoreError> {
        let slot = row_index
            .checked_sub(FIRST_DATA_ROW)
            .ok_or(StoreError::RowIndex(row_index))? as usize;
        if slot >= len {
            return Err(StoreError::RowIndex(row_index));
        }
        Ok(slot)
    }
}

#[async_trait]
impl SnapshotReader for MemoryStore {
    async fn read_products(&self) -> Result<Vec<RawRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .products
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let mut record = RawRecord::from_product_row(row);
                record.row_index = Some(FIRST_DATA_ROW + i as u32);
                record
            })
            .collect())
    }
}

#[async_trait]
impl CatalogWriter for MemoryStore {
    async fn append_products(&self, rows: Vec<Vec<String>>) -> Result<(), StoreError> {
        self.tables.lock().await.products.extend(rows);
        Ok(())
    }

    async fn update_product_row(&self, row_index: u32, row: Vec<String>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let slot = Self::slot(row_index, tables.products.len())?;
        tables.products[slot] = row;
        Ok(())
    }

    async fn delete_product_rows(&self, row_indices: Vec<u32>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        for row_index in descending_unique(row_indices) {
            let slot = Self::slot(row_index, tables.products.len())?;
            tables.products.remove(slot);
        }
        Ok(())
    }

    async fn append_differences(&self, rows: Vec<Vec<String>>) -> Result<(), StoreError> {
        self.tables.lock().await.differences.extend(rows);
        Ok(())
    }

    async fn replace_averages(&self, rows: Vec<Vec<String>>) -> Result<(), StoreError> {
        self.tables.lock().await.averages = rows;
        Ok(())
    }

    async fn set_last_run(&self, date: &str) -> Result<(), StoreError> {
        self.tables.lock().await.last_run = Some(date.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of fetched raw pages, kept per run for debugging
/// parser regressions against what the site actually served.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        site_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(site_id)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably at their hash-addressed path.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        site_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.page_relative_path(fetched_at, site_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let written = Self::publish(&absolute_path, bytes).await?;

        Ok(ArchivedPage {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: !written,
        })
    }

    /// Place `bytes` at `target` through a temp file and rename. Returns
    /// false when the target already holds identical content (the path is
    /// hash-addressed) and the write was skipped or lost a benign race.
    async fn publish(target: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
        let parent = target
            .parent()
            .expect("archive paths are nested under the root");
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(target)
            .await
            .with_context(|| format!("checking archive path {}", target.display()))?
        {
            return Ok(false);
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;

        match fs::rename(&temp_path, target).await {
            Ok(()) => Ok(true),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    return Ok(false);
                }
                Err(err).with_context(|| {
                    format!("renaming {} -> {}", temp_path.display(), target.display())
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn page_hashing_is_stable() {
        let hash = PageArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_writes_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let archive = PageArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-08-26T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .store_page(fetched_at, "bellozzo-pizza", "html", b"<html>same</html>")
            .await
            .expect("first store");
        let second = archive
            .store_page(fetched_at, "bellozzo-pizza", "html", b"<html>same</html>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());

        // only the published file remains, no leftover temp files
        let parent = first.absolute_path.parent().expect("parent");
        let entries = std::fs::read_dir(parent).expect("read dir").count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retryable_statuses_are_5xx_and_429() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    fn product_row(name: &str, price: u32) -> Vec<String> {
        vec![
            "2026-08-26".to_string(),
            "Bellozzo".to_string(),
            "pizza".to_string(),
            name.to_string(),
            price.to_string(),
            "tomato, cheese".to_string(),
        ]
    }

    #[tokio::test]
    async fn memory_store_attaches_physical_row_indices() {
        let store = MemoryStore::default();
        store
            .seed_products(vec![product_row("Margherita", 2000), product_row("Diavola", 2400)])
            .await;

        let records = store.read_products().await.expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].row_index, Some(2));
        assert_eq!(records[1].row_index, Some(3));
        assert_eq!(records[1].name.as_deref(), Some("Diavola"));
    }

    #[tokio::test]
    async fn deletes_apply_descending_so_indices_stay_valid() {
        let store = MemoryStore::default();
        store
            .seed_products(vec![
                product_row("A", 1000),
                product_row("B", 1100),
                product_row("C", 1200),
                product_row("D", 1300),
            ])
            .await;

        // rows 2 and 4: ascending application would delete the wrong second row
        store
            .delete_product_rows(vec![2, 4])
            .await
            .expect("delete");

        let remaining = store.products().await;
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0][3], "B");
        assert_eq!(remaining[1][3], "D");
    }

    #[tokio::test]
    async fn update_overwrites_the_whole_row_in_place() {
        let store = MemoryStore::default();
        store.seed_products(vec![product_row("A", 1000)]).await;

        store
            .update_product_row(2, product_row("A", 1500))
            .await
            .expect("update");
        let rows = store.products().await;
        assert_eq!(rows[0][4], "1500");

        let err = store
            .update_product_row(9, product_row("A", 1500))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RowIndex(9)));
    }

    #[test]
    fn descending_unique_sorts_and_dedupes() {
        assert_eq!(descending_unique(vec![3, 9, 3, 5]), vec![9, 5, 3]);
    }
}
