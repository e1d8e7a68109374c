//! Incremental extraction pipeline: discovery, watermarks, batching, idempotent staging.

pub mod config;
pub mod db;
pub mod discovery;
pub mod export;
pub mod orchestrator;
pub mod report;
pub mod watermark;
pub mod writer;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flowcast_adapters::{catalog_for, source_for_feed, FetchClient, SiteCatalog, TimeSeriesSource};
use flowcast_core::{FeedType, Watermark};
use flowcast_storage::{CacheMode, DiskCache, HttpFetcher, ResponseCache};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub use config::PipelineConfig;
pub use discovery::{DiscoveryError, DiscoveryReport, SiteDiscovery, SiteRegistry};
pub use orchestrator::{BatchOrchestrator, RunSummary};
pub use watermark::{AdvanceOutcome, WatermarkTracker};
pub use writer::{CommitReceipt, ObservationWriter, WriteError};

pub const CRATE_NAME: &str = "flowcast-sync";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Bypass cache lookups; every request goes upstream and repopulates the cache.
    pub fresh: bool,
    /// Truncate the feed table and reset its watermarks before extracting.
    pub full_refresh: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub discovery: Option<DiscoveryReport>,
    pub runs: Vec<RunSummary>,
}

impl SyncSummary {
    pub fn escalations(&self) -> Vec<String> {
        self.runs.iter().filter_map(RunSummary::escalation).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedStatus {
    pub feed: FeedType,
    pub enabled: bool,
    pub capabilities: BTreeMap<String, i64>,
    pub rows: i64,
    pub oldest_watermark: Option<DateTime<Utc>>,
    pub newest_watermark: Option<DateTime<Utc>>,
    pub failing_sites: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub sites: usize,
    pub feeds: Vec<FeedStatus>,
}

pub struct Pipeline {
    config: PipelineConfig,
    pool: SqlitePool,
    http: Arc<HttpFetcher>,
    cache: Arc<dyn ResponseCache>,
    catalog: Arc<dyn SiteCatalog>,
}

impl Pipeline {
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let pool = db::connect(&config.database_url).await?;
        let http = Arc::new(HttpFetcher::new(config.http.client_config())?);
        let cache: Arc<dyn ResponseCache> = Arc::new(DiskCache::new(config.cache_dir.clone(), config.cache.ttl()));
        let catalog = catalog_for(&config.upstream);
        Ok(Self::with_parts(config, pool, http, cache, catalog))
    }

    pub fn with_parts(
        config: PipelineConfig,
        pool: SqlitePool,
        http: Arc<HttpFetcher>,
        cache: Arc<dyn ResponseCache>,
        catalog: Arc<dyn SiteCatalog>,
    ) -> Self {
        Self {
            config,
            pool,
            http,
            cache,
            catalog,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn registry(&self) -> SiteRegistry {
        SiteRegistry::new(self.pool.clone())
    }

    pub fn tracker(&self) -> WatermarkTracker {
        WatermarkTracker::new(self.pool.clone(), self.config.feeds.clone())
    }

    pub fn writer(&self) -> ObservationWriter {
        ObservationWriter::new(self.pool.clone())
    }

    fn source(&self, feed: FeedType) -> Arc<dyn TimeSeriesSource> {
        source_for_feed(feed, &self.config.upstream)
    }

    pub async fn discover(&self, now: DateTime<Utc>, refresh_all: bool) -> Result<DiscoveryReport, DiscoveryError> {
        let sources = self
            .config
            .feeds
            .enabled_feeds()
            .into_iter()
            .map(|feed| self.source(feed))
            .collect();
        let discovery = SiteDiscovery::new(
            self.registry(),
            Arc::clone(&self.catalog),
            sources,
            Arc::clone(&self.http),
            self.config.discovery.clone(),
            Uuid::new_v4(),
        )
        .refresh_all(refresh_all);

        let report = discovery.run(now).await?;
        info!(
            candidates = report.candidates,
            capable = report.capable,
            excluded = report.excluded,
            unknown = report.unknown,
            probes = report.probes_issued,
            "discovery finished"
        );
        Ok(report)
    }

    pub async fn extract(
        &self,
        feed: FeedType,
        now: DateTime<Utc>,
        options: ExtractOptions,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let tracker = self.tracker();
        let writer = self.writer();

        if options.full_refresh {
            let removed = writer
                .truncate(feed)
                .await
                .with_context(|| format!("truncating {}", feed.table_name()))?;
            let reset = tracker.reset(feed).await?;
            warn!(%feed, removed, watermarks = reset, "full refresh: feed table cleared");
        }

        let mode = if options.fresh {
            CacheMode::Refresh
        } else {
            self.config.cache.mode
        };
        let client = FetchClient::new(
            Arc::clone(&self.http),
            Arc::clone(&self.cache),
            mode,
            self.source(feed),
            run_id,
        );
        let orchestrator = BatchOrchestrator::new(
            self.registry(),
            tracker,
            writer,
            client,
            self.config.orchestrator.clone(),
            self.config.coordinate_binning,
            run_id,
        );

        let summary = orchestrator.run_feed(feed, now, cancel).await?;
        report::record_run(&self.pool, &summary).await?;
        let dir = report::write_run_report(&self.config.reports_dir, &summary).await?;
        info!(run_id = %summary.run_id, %feed, status = summary.status(), reports = %dir.display(), "run recorded");
        Ok(summary)
    }

    /// Discovery, then every enabled feed. A failed discovery falls back to stored sites.
    pub async fn sync(
        &self,
        now: DateTime<Utc>,
        options: ExtractOptions,
        cancel: CancellationToken,
    ) -> Result<SyncSummary> {
        let discovery = match self.discover(now, false).await {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(error = %err, "discovery failed; extracting against previously stored sites");
                None
            }
        };

        let mut runs = Vec::new();
        for feed in self.config.feeds.enabled_feeds() {
            if cancel.is_cancelled() {
                break;
            }
            runs.push(self.extract(feed, now, options, cancel.clone()).await?);
        }
        Ok(SyncSummary { discovery, runs })
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let registry = self.registry();
        let tracker = self.tracker();
        let writer = self.writer();
        let sites = registry.all_sites().await?.len();

        let mut feeds = Vec::new();
        for feed in FeedType::ALL {
            let watermarks: Vec<Watermark> = tracker.load_feed(feed).await?.into_values().collect();
            let successes = watermarks.iter().filter_map(|wm| wm.last_success);
            feeds.push(FeedStatus {
                feed,
                enabled: self.config.feeds.for_feed(feed).enabled,
                capabilities: registry.capability_counts(feed).await?,
                rows: writer.row_count(feed).await?,
                oldest_watermark: successes.clone().min(),
                newest_watermark: successes.max(),
                failing_sites: watermarks.iter().filter(|wm| wm.consecutive_failures > 0).count(),
            });
        }
        Ok(StatusReport { sites, feeds })
    }

    pub async fn clear_cache(&self) -> Result<usize> {
        let removed = self.cache.clear().await.context("clearing response cache")?;
        info!(removed, "response cache cleared");
        Ok(removed)
    }

    pub async fn export(&self, out_dir: &Path) -> Result<PathBuf> {
        export::export_snapshot(&self.pool, out_dir).await
    }
}
