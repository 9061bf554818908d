//! The reconciliation core and the batch pipeline around it.
//!
//! Everything in the first half of this file is pure in-memory
//! transformation: normalize raw records into keyed collections, diff the
//! fresh catalog against the persisted snapshot, aggregate prices, and
//! render the results. All I/O lives in [`SyncPipeline`], which runs
//! strictly before and after the pure core.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use menuwatch_adapters::{parser_for, FetchMode, SiteConfig, SiteRegistry};
use menuwatch_core::{
    AggregateBucket, CatalogError, ChangeRecord, PersistedRecord, ProductKey, ProductRecord,
    RawRecord, AVERAGES_HEADER, CATEGORY_PIZZA, DIFFERENCES_HEADER,
};
use menuwatch_storage::{
    CatalogWriter, HttpClientConfig, HttpFetcher, PageArchive, SheetApiConfig, SnapshotReader,
};
use serde::Serialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "menuwatch-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_api_base: String,
    pub store_api_token: String,
    pub sites_path: PathBuf,
    pub manual_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            store_api_base: std::env::var("MENUWATCH_STORE_API_BASE")
                .unwrap_or_else(|_| "http://localhost:8800/api".to_string()),
            store_api_token: std::env::var("MENUWATCH_STORE_API_TOKEN").unwrap_or_default(),
            sites_path: std::env::var("MENUWATCH_SITES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sites.yaml")),
            manual_dir: std::env::var("MENUWATCH_MANUAL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("manual")),
            archive_dir: std::env::var("MENUWATCH_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("archive")),
            reports_dir: std::env::var("MENUWATCH_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("reports")),
            user_agent: std::env::var("MENUWATCH_USER_AGENT")
                .unwrap_or_else(|_| "menuwatch-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("MENUWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            cron: std::env::var("MENUWATCH_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
        }
    }

    pub fn sheet_api_config(&self) -> SheetApiConfig {
        SheetApiConfig {
            base_url: self.store_api_base.clone(),
            token: self.store_api_token.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: Default::default(),
        }
    }
}

/// Fresh records keyed by identity, iterable in input insertion order.
#[derive(Debug, Default)]
pub struct Inventory {
    records: Vec<ProductRecord>,
    index: HashMap<ProductKey, usize>,
}

impl Inventory {
    pub fn insert(&mut self, record: ProductRecord) {
        let key = record.key();
        match self.index.get(&key) {
            Some(&slot) => {
                warn!(%key, "duplicate identity key in batch, keeping the later record");
                self.records[slot] = record;
            }
            None => {
                self.index.insert(key, self.records.len());
                self.records.push(record);
            }
        }
    }

    pub fn get(&self, key: &ProductKey) -> Option<&ProductRecord> {
        self.index.get(key).map(|&slot| &self.records[slot])
    }

    pub fn contains(&self, key: &ProductKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProductRecord> {
        self.records.iter()
    }

    pub fn records(&self) -> &[ProductRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Persisted records keyed by identity, iterable in store row order.
#[derive(Debug, Default)]
pub struct Snapshot {
    records: Vec<PersistedRecord>,
    index: HashMap<ProductKey, usize>,
}

impl Snapshot {
    pub fn insert(&mut self, persisted: PersistedRecord) {
        let key = persisted.record.key();
        match self.index.get(&key) {
            Some(&slot) => {
                warn!(%key, "duplicate identity key in snapshot, keeping the later record");
                self.records[slot] = persisted;
            }
            None => {
                self.index.insert(key, self.records.len());
                self.records.push(persisted);
            }
        }
    }

    pub fn get(&self, key: &ProductKey) -> Option<&PersistedRecord> {
        self.index.get(key).map(|&slot| &self.records[slot])
    }

    pub fn iter(&self) -> impl Iterator<Item = &PersistedRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Validate one raw record into the canonical shape, stamping today's date.
pub fn normalize_record(raw: RawRecord, today: NaiveDate) -> Result<ProductRecord, CatalogError> {
    let missing = raw.missing_fields();
    if !missing.is_empty() {
        return Err(CatalogError::Validation {
            missing: missing.join(", "),
            record: format!("{raw:?}"),
        });
    }
    let RawRecord {
        restaurant: Some(restaurant),
        category: Some(category),
        name: Some(name),
        price: Some(price),
        description: Some(description),
        ..
    } = raw
    else {
        unreachable!("missing_fields() checked every required field");
    };

    Ok(ProductRecord {
        restaurant: restaurant.trim().to_string(),
        category: category.trim().to_string(),
        name: name.trim().to_string(),
        price: price.as_minor_units()?,
        description: description.trim().to_string(),
        observed_date: today,
    })
}

/// Normalize freshly scraped records. Any invalid record aborts the run:
/// reconciling against a partial catalog would desynchronize the store.
pub fn normalize_fresh(raw: Vec<RawRecord>, today: NaiveDate) -> Result<Inventory, CatalogError> {
    let mut inventory = Inventory::default();
    for record in raw {
        inventory.insert(normalize_record(record, today)?);
    }
    Ok(inventory)
}

/// Normalize the persisted snapshot. Every entry must carry the row index
/// the reader attached; one without is a caller bug, not recoverable.
pub fn normalize_snapshot(raw: Vec<RawRecord>, today: NaiveDate) -> Result<Snapshot, CatalogError> {
    let mut snapshot = Snapshot::default();
    for record in raw {
        let Some(row_index) = record.row_index else {
            return Err(CatalogError::MissingRowIndex {
                record: format!("{record:?}"),
            });
        };
        snapshot.insert(PersistedRecord {
            row_index,
            record: normalize_record(record, today)?,
        });
    }
    Ok(snapshot)
}

/// Whole-row overwrite instruction for one changed product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowUpdate {
    pub row_index: u32,
    pub record: ProductRecord,
}

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub append: Vec<ProductRecord>,
    pub updates: Vec<RowUpdate>,
    pub deletes: Vec<u32>,
    pub diffs: Vec<ChangeRecord>,
}

/// Diff the fresh catalog against the persisted snapshot.
///
/// One pass over each side, keyed lookups by identity. Diff order is adds
/// (fresh order), then modifications (fresh order), then removals
/// (snapshot order). The delete indices are correct as a set; applying
/// them highest-first is the writer's concern.
pub fn reconcile(fresh: &Inventory, snapshot: &Snapshot) -> ReconcileOutcome {
    let mut append = Vec::new();
    let mut updates = Vec::new();
    let mut deletes = Vec::new();
    let mut added = Vec::new();
    let mut modified = Vec::new();
    let mut removed = Vec::new();

    for record in fresh.iter() {
        match snapshot.get(&record.key()) {
            None => {
                append.push(record.clone());
                added.push(ChangeRecord::added(record));
            }
            Some(persisted) => {
                let price_changed = record.price != persisted.record.price;
                let description_changed =
                    record.description.trim() != persisted.record.description.trim();
                if !price_changed && !description_changed {
                    continue;
                }
                modified.push(ChangeRecord::modified(
                    record,
                    &persisted.record,
                    price_changed,
                    description_changed,
                ));
                updates.push(RowUpdate {
                    row_index: persisted.row_index,
                    record: record.clone(),
                });
            }
        }
    }

    for persisted in snapshot.iter() {
        if !fresh.contains(&persisted.record.key()) {
            removed.push(ChangeRecord::removed(&persisted.record));
            deletes.push(persisted.row_index);
        }
    }

    let mut diffs = added;
    diffs.append(&mut modified);
    diffs.append(&mut removed);

    ReconcileOutcome {
        append,
        updates,
        deletes,
        diffs,
    }
}

/// Row indices of snapshot entries whose key is gone from the fresh
/// catalog. Used against a freshly re-read snapshot right before deleting,
/// since earlier appends/updates may have moved rows.
pub fn rows_to_delete(fresh: &Inventory, snapshot: &Snapshot) -> Vec<u32> {
    snapshot
        .iter()
        .filter(|persisted| !fresh.contains(&persisted.record.key()))
        .map(|persisted| persisted.row_index)
        .collect()
}

/// Grouped price statistics per `(restaurant, category)`.
///
/// The average truncates: whole currency units, matching how the averages
/// table is presented. Pizza buckets sort before everything else, then
/// restaurant, then category.
pub fn aggregate(records: &[ProductRecord]) -> Vec<AggregateBucket> {
    let mut groups: BTreeMap<(String, String), Vec<u32>> = BTreeMap::new();
    for record in records {
        groups
            .entry((record.restaurant.clone(), record.category.clone()))
            .or_default()
            .push(record.price);
    }

    let mut buckets: Vec<AggregateBucket> = groups
        .into_iter()
        .map(|((restaurant, category), prices)| {
            let count = prices.len() as u32;
            let sum: u64 = prices.iter().map(|&p| u64::from(p)).sum();
            let min_price = *prices.iter().min().expect("group has at least one price");
            let max_price = *prices.iter().max().expect("group has at least one price");
            AggregateBucket {
                restaurant,
                category,
                count,
                average: (sum / u64::from(count)) as u32,
                min_price,
                max_price,
            }
        })
        .collect();

    buckets.sort_by(|a, b| {
        (a.category != CATEGORY_PIZZA, &a.restaurant, &a.category).cmp(&(
            b.category != CATEGORY_PIZZA,
            &b.restaurant,
            &b.category,
        ))
    });
    buckets
}

/// Diff rows in the differences table's column order.
pub fn diff_rows(diffs: &[ChangeRecord]) -> Vec<Vec<String>> {
    diffs.iter().map(ChangeRecord::to_row).collect()
}

/// Averages rows in the averages table's column order, with one blank
/// separator row before the first non-pizza bucket.
pub fn averages_rows(buckets: &[AggregateBucket]) -> Vec<Vec<String>> {
    let mut rows = Vec::with_capacity(buckets.len() + 1);
    let mut separated = false;
    for bucket in buckets {
        if !separated && bucket.category != CATEGORY_PIZZA {
            rows.push(vec![String::new(); AVERAGES_HEADER.len()]);
            separated = true;
        }
        rows.push(bucket.to_row());
    }
    rows
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// HTML diff report used as the notification body. An empty diff renders
/// an explicit empty-state message, not an empty table.
pub fn render_diff_html(diffs: &[ChangeRecord]) -> String {
    let body = if diffs.is_empty() {
        "<p><em>No differences detected today.</em></p>".to_string()
    } else {
        let header_row: String = DIFFERENCES_HEADER
            .iter()
            .map(|col| format!("<th>{col}</th>"))
            .collect();
        let mut data_rows = String::new();
        for diff in diffs {
            let cells: String = diff
                .to_row()
                .iter()
                .map(|cell| format!("<td>{}</td>", escape_html(cell)))
                .collect();
            data_rows.push_str(&format!("<tr>{cells}</tr>\n"));
        }
        format!(
            "<table>\n<thead><tr>{header_row}</tr></thead>\n<tbody>\n{data_rows}</tbody>\n</table>"
        )
    };

    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<style>\n\
         table {{ border-collapse: collapse; }}\n\
         th, td {{ border: 1px solid #999; padding: 4px 8px; text-align: left; }}\n\
         </style>\n</head>\n<body>\n{body}\n</body>\n</html>\n"
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sites: usize,
    pub fetched_records: usize,
    pub snapshot_records: usize,
    pub appended: usize,
    pub updated: usize,
    pub deleted: usize,
    pub diffs: usize,
    pub report_dir: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: SiteRegistry,
    http: HttpFetcher,
    archive: PageArchive,
    reader: Arc<dyn SnapshotReader>,
    writer: Arc<dyn CatalogWriter>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        registry: SiteRegistry,
        reader: Arc<dyn SnapshotReader>,
        writer: Arc<dyn CatalogWriter>,
    ) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let archive = PageArchive::new(config.archive_dir.clone());
        Ok(Self {
            config,
            registry,
            http,
            archive,
            reader,
            writer,
        })
    }

    /// One complete scrape-reconcile-write cycle. The diff is fully
    /// computed before the first write, so aborting anywhere earlier
    /// leaves the store untouched.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let today = started_at.date_naive();

        let enabled: Vec<&SiteConfig> =
            self.registry.sites.iter().filter(|s| s.enabled).collect();

        let mut raw_site_records = Vec::new();
        for site in &enabled {
            let body = self.fetch_site_body(site, started_at).await?;
            let mut records = parser_for(site.parser)
                .parse(&body, site)
                .with_context(|| format!("parsing menu for {}", site.site_id))?;
            info!(site = %site.site_id, records = records.len(), "parsed site menu");
            raw_site_records.append(&mut records);
        }
        let fetched_records = raw_site_records.len();

        let fresh = normalize_fresh(raw_site_records, today)?;
        let snapshot_rows = self
            .reader
            .read_products()
            .await
            .context("reading product snapshot")?;
        let snapshot = normalize_snapshot(snapshot_rows, today)?;
        let snapshot_records = snapshot.len();

        let outcome = reconcile(&fresh, &snapshot);
        info!(
            appended = outcome.append.len(),
            updated = outcome.updates.len(),
            deleted = outcome.deletes.len(),
            diffs = outcome.diffs.len(),
            "reconciled fresh catalog against snapshot"
        );

        for update in &outcome.updates {
            self.writer
                .update_product_row(update.row_index, update.record.to_row())
                .await
                .with_context(|| format!("updating row {}", update.row_index))?;
        }
        if !outcome.append.is_empty() {
            self.writer
                .append_products(outcome.append.iter().map(ProductRecord::to_row).collect())
                .await
                .context("appending new products")?;
        }
        if !outcome.diffs.is_empty() {
            self.writer
                .append_differences(diff_rows(&outcome.diffs))
                .await
                .context("appending diff rows")?;
        }

        let mut deleted = 0;
        if !outcome.deletes.is_empty() {
            // re-read so the delete indices reflect the rows as they are
            // now, after the appends and updates above
            let reread = self
                .reader
                .read_products()
                .await
                .context("re-reading product snapshot")?;
            let current = normalize_snapshot(reread, today)?;
            let rows = rows_to_delete(&fresh, &current);
            deleted = rows.len();
            self.writer
                .delete_product_rows(rows)
                .await
                .context("deleting removed products")?;
        }

        let buckets = aggregate(fresh.records());
        self.writer
            .replace_averages(averages_rows(&buckets))
            .await
            .context("replacing averages")?;

        let report_dir = self.write_report(run_id, &outcome.diffs).await?;
        self.writer
            .set_last_run(&today.to_string())
            .await
            .context("recording last run date")?;

        let finished_at = Utc::now();
        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            sites: enabled.len(),
            fetched_records,
            snapshot_records,
            appended: outcome.append.len(),
            updated: outcome.updates.len(),
            deleted,
            diffs: outcome.diffs.len(),
            report_dir: report_dir.display().to_string(),
        })
    }

    async fn fetch_site_body(
        &self,
        site: &SiteConfig,
        fetched_at: DateTime<Utc>,
    ) -> Result<String> {
        let extension = site.parser.artifact_extension();
        let body = match site.mode {
            FetchMode::Fetch => {
                let page = self
                    .http
                    .fetch_page(&site.site_id, &site.url)
                    .await
                    .with_context(|| format!("fetching {}", site.url))?;
                String::from_utf8_lossy(&page.body).into_owned()
            }
            FetchMode::Manual => {
                let path = self
                    .config
                    .manual_dir
                    .join(&site.site_id)
                    .join(format!("payload.{extension}"));
                fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("reading manual payload {}", path.display()))?
            }
        };

        self.archive
            .store_page(fetched_at, &site.site_id, extension, body.as_bytes())
            .await
            .with_context(|| format!("archiving page for {}", site.site_id))?;
        Ok(body)
    }

    async fn write_report(&self, run_id: Uuid, diffs: &[ChangeRecord]) -> Result<PathBuf> {
        let report_dir = self.config.reports_dir.join(run_id.to_string());
        fs::create_dir_all(&report_dir)
            .await
            .with_context(|| format!("creating {}", report_dir.display()))?;

        fs::write(report_dir.join("diff.html"), render_diff_html(diffs))
            .await
            .context("writing diff.html")?;

        let mut kind_counts: BTreeMap<&str, usize> = BTreeMap::new();
        for diff in diffs {
            *kind_counts.entry(diff.kind.comment()).or_default() += 1;
        }
        let summary = format!(
            "# Menuwatch Run\n\n- Run ID: `{}`\n- Differences: {}\n\n## By kind\n{}\n",
            run_id,
            diffs.len(),
            kind_counts
                .iter()
                .map(|(kind, count)| format!("- {kind}: {count}"))
                .collect::<Vec<_>>()
                .join("\n")
        );
        fs::write(report_dir.join("summary.md"), summary)
            .await
            .context("writing summary.md")?;

        Ok(report_dir)
    }
}

/// Register the pipeline on a cron schedule. The schedule fires one run at
/// a time; runs are assumed non-overlapping (the store has no locking).
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    diffs = summary.diffs,
                    "scheduled run complete"
                ),
                Err(err) => warn!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
