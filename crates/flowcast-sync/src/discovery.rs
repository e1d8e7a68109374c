use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use flowcast_adapters::{ProbeOutcome, SiteCatalog, TimeSeriesSource};
use flowcast_core::{Capability, FeedType, Site, SpatialScope};
use flowcast_storage::HttpFetcher;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DiscoverySettings;
use crate::db::{parse_opt_ts, ts};

#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityRecord {
    pub capability: Capability,
    pub detail: Option<String>,
    pub checked_at: Option<DateTime<Utc>>,
}

/// Stored site universe and per-(site, feed) capability flags.
#[derive(Debug, Clone)]
pub struct SiteRegistry {
    pool: SqlitePool,
}

fn encode_feeds(feeds: &BTreeSet<FeedType>) -> String {
    feeds.iter().map(FeedType::as_str).collect::<Vec<_>>().join(",")
}

fn decode_feeds(text: &str) -> BTreeSet<FeedType> {
    text.split(',')
        .filter_map(|name| name.trim().parse::<FeedType>().ok())
        .collect()
}

fn row_to_site(row: &sqlx::sqlite::SqliteRow) -> Result<Site> {
    let declared: String = row.try_get("declared_feeds")?;
    Ok(Site {
        site_id: row.try_get("site_id")?,
        station_name: row.try_get("station_name")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        region_code: row.try_get("region_code")?,
        huc_code: row.try_get("huc_code")?,
        drainage_area_sq_mi: row.try_get("drainage_area_sq_mi")?,
        altitude_ft: row.try_get("altitude_ft")?,
        declared_feeds: decode_feeds(&declared),
    })
}

const SITE_COLUMNS: &str = "s.site_id, s.station_name, s.latitude, s.longitude, s.region_code, \
     s.huc_code, s.drainage_area_sq_mi, s.altitude_ft, s.declared_feeds";

impl SiteRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert new sites; for known ones refresh only descriptive fields and declared feeds.
    pub async fn upsert_sites(&self, sites: &[Site], now: DateTime<Utc>) -> Result<usize> {
        let mut tx = self.pool.begin().await.context("opening site upsert transaction")?;
        for site in sites {
            sqlx::query(
                "INSERT INTO sites (site_id, station_name, latitude, longitude, region_code, huc_code, \
                   drainage_area_sq_mi, altitude_ft, declared_feeds, discovered_at, refreshed_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (site_id) DO UPDATE SET \
                   station_name = excluded.station_name, \
                   latitude = excluded.latitude, \
                   longitude = excluded.longitude, \
                   region_code = excluded.region_code, \
                   huc_code = excluded.huc_code, \
                   drainage_area_sq_mi = excluded.drainage_area_sq_mi, \
                   altitude_ft = excluded.altitude_ft, \
                   declared_feeds = excluded.declared_feeds, \
                   refreshed_at = excluded.refreshed_at",
            )
            .bind(&site.site_id)
            .bind(&site.station_name)
            .bind(site.latitude)
            .bind(site.longitude)
            .bind(&site.region_code)
            .bind(&site.huc_code)
            .bind(site.drainage_area_sq_mi)
            .bind(site.altitude_ft)
            .bind(encode_feeds(&site.declared_feeds))
            .bind(ts(now))
            .bind(ts(now))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("upserting site {}", site.site_id))?;
        }
        tx.commit().await.context("committing sites")?;
        Ok(sites.len())
    }

    pub async fn all_sites(&self) -> Result<Vec<Site>> {
        let rows = sqlx::query(&format!("SELECT {SITE_COLUMNS} FROM sites s ORDER BY s.site_id"))
            .fetch_all(&self.pool)
            .await
            .context("listing sites")?;
        rows.iter().map(row_to_site).collect()
    }

    /// Sites verified for `feed`; the only ones extraction ever touches.
    pub async fn capable_sites(&self, feed: FeedType) -> Result<Vec<Site>> {
        let rows = sqlx::query(&format!(
            "SELECT {SITE_COLUMNS} FROM sites s \
             JOIN site_capabilities c ON c.site_id = s.site_id \
             WHERE c.feed_type = ? AND c.capability = ? ORDER BY s.site_id"
        ))
        .bind(feed.as_str())
        .bind(Capability::Capable.as_str())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("listing capable sites for {feed}"))?;
        rows.iter().map(row_to_site).collect()
    }

    pub async fn capabilities(&self, feed: FeedType) -> Result<HashMap<String, CapabilityRecord>> {
        let rows = sqlx::query(
            "SELECT site_id, capability, detail, checked_at FROM site_capabilities WHERE feed_type = ?",
        )
        .bind(feed.as_str())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading capabilities for {feed}"))?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let site_id: String = row.try_get("site_id")?;
            let raw: String = row.try_get("capability")?;
            let capability = raw
                .parse::<Capability>()
                .with_context(|| format!("capability for {site_id}/{feed}"))?;
            out.insert(
                site_id,
                CapabilityRecord {
                    capability,
                    detail: row.try_get("detail")?,
                    checked_at: parse_opt_ts(row.try_get("checked_at")?),
                },
            );
        }
        Ok(out)
    }

    pub async fn capability(&self, site_id: &str, feed: FeedType) -> Result<Option<CapabilityRecord>> {
        let mut all = self.capabilities(feed).await?;
        Ok(all.remove(site_id))
    }

    pub async fn set_capability(
        &self,
        site_id: &str,
        feed: FeedType,
        capability: Capability,
        detail: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO site_capabilities (site_id, feed_type, capability, detail, checked_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (site_id, feed_type) DO UPDATE SET \
               capability = excluded.capability, \
               detail = excluded.detail, \
               checked_at = excluded.checked_at",
        )
        .bind(site_id)
        .bind(feed.as_str())
        .bind(capability.as_str())
        .bind(detail)
        .bind(ts(at))
        .execute(&self.pool)
        .await
        .with_context(|| format!("setting capability for {site_id}/{feed}"))?;
        Ok(())
    }

    pub async fn capability_counts(&self, feed: FeedType) -> Result<BTreeMap<String, i64>> {
        let rows = sqlx::query(
            "SELECT capability, COUNT(*) AS n FROM site_capabilities WHERE feed_type = ? GROUP BY capability",
        )
        .bind(feed.as_str())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("counting capabilities for {feed}"))?;
        rows.iter()
            .map(|row| -> Result<(String, i64)> { Ok((row.try_get("capability")?, row.try_get("n")?)) })
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no discovery regions configured")]
    NoRegions,
    #[error("every region query failed ({failed} regions), last error: {last_error}")]
    AllRegionsFailed { failed: usize, last_error: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub regions_queried: usize,
    pub regions_failed: usize,
    pub candidates: usize,
    /// Existence checks run. Weather checks are local and never reach upstream.
    pub probes_issued: usize,
    pub capable: usize,
    pub excluded: usize,
    pub unknown: usize,
}

enum ProbePlan {
    Probe,
    /// Site-scoped catalog never listed the feed for this site.
    Undeclared,
    Skip,
}

pub struct SiteDiscovery {
    registry: SiteRegistry,
    catalog: Arc<dyn SiteCatalog>,
    sources: Vec<Arc<dyn TimeSeriesSource>>,
    http: Arc<HttpFetcher>,
    settings: DiscoverySettings,
    run_id: Uuid,
    refresh_all: bool,
}

impl SiteDiscovery {
    pub fn new(
        registry: SiteRegistry,
        catalog: Arc<dyn SiteCatalog>,
        sources: Vec<Arc<dyn TimeSeriesSource>>,
        http: Arc<HttpFetcher>,
        settings: DiscoverySettings,
        run_id: Uuid,
    ) -> Self {
        Self {
            registry,
            catalog,
            sources,
            http,
            settings,
            run_id,
            refresh_all: false,
        }
    }

    /// Re-check every capability, excluded ones included.
    pub fn refresh_all(mut self, refresh: bool) -> Self {
        self.refresh_all = refresh;
        self
    }

    fn plan(&self, site: &Site, feed: FeedType, existing: Option<&CapabilityRecord>, now: DateTime<Utc>) -> ProbePlan {
        let needs_check = match existing {
            _ if self.refresh_all => true,
            None => true,
            Some(record) => match record.capability {
                Capability::Unknown => true,
                Capability::Excluded => false,
                Capability::Capable => match (self.settings.capability_refresh_days, record.checked_at) {
                    (Some(days), Some(checked)) => now - checked >= Duration::days(i64::from(days)),
                    (Some(_), None) => true,
                    (None, _) => false,
                },
            },
        };
        if !needs_check {
            ProbePlan::Skip
        } else if feed.scope() == SpatialScope::Site && !site.declares(feed) {
            ProbePlan::Undeclared
        } else {
            ProbePlan::Probe
        }
    }

    async fn query_regions(&self, regions: &[String]) -> Result<(Vec<Site>, usize), DiscoveryError> {
        if regions.is_empty() {
            return Err(DiscoveryError::NoRegions);
        }

        let mut by_id: BTreeMap<String, Site> = BTreeMap::new();
        let mut failed = 0usize;
        let mut last_error = String::new();
        for region in regions {
            match self.catalog.sites_in_region(&self.http, self.run_id, region).await {
                Ok(sites) => {
                    info!(region = %region, sites = sites.len(), "catalog region loaded");
                    for site in sites {
                        by_id
                            .entry(site.site_id.clone())
                            .and_modify(|known| known.declared_feeds.extend(site.declared_feeds.iter().copied()))
                            .or_insert(site);
                    }
                }
                Err(err) => {
                    warn!(region = %region, error = %err, "catalog region failed");
                    failed += 1;
                    last_error = err.to_string();
                }
            }
        }

        if failed == regions.len() {
            return Err(DiscoveryError::AllRegionsFailed { failed, last_error });
        }
        Ok((by_id.into_values().collect(), failed))
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<DiscoveryReport, DiscoveryError> {
        let regions = self.settings.regions.clone();
        let (mut sites, regions_failed) = self.query_regions(&regions).await?;

        if self.settings.sample_mode && sites.len() > self.settings.max_sites {
            info!(max_sites = self.settings.max_sites, total = sites.len(), "sample mode caps site universe");
            sites.truncate(self.settings.max_sites);
        }

        self.registry.upsert_sites(&sites, now).await?;

        let mut report = DiscoveryReport {
            regions_queried: regions.len(),
            regions_failed,
            candidates: sites.len(),
            ..Default::default()
        };

        for source in &self.sources {
            let feed = source.feed();
            let existing = self.registry.capabilities(feed).await?;

            let mut to_probe: Vec<&Site> = Vec::new();
            for site in &sites {
                match self.plan(site, feed, existing.get(&site.site_id), now) {
                    ProbePlan::Skip => {}
                    ProbePlan::Undeclared => {
                        self.registry
                            .set_capability(&site.site_id, feed, Capability::Excluded, Some("not listed in catalog"), now)
                            .await?;
                    }
                    ProbePlan::Probe => to_probe.push(site),
                }
            }

            report.probes_issued += to_probe.len();
            let concurrency = self.settings.probe_concurrency.max(1);
            let outcomes: Vec<(String, ProbeOutcome)> = stream::iter(to_probe)
                .map(|site| {
                    let source = Arc::clone(source);
                    let http = Arc::clone(&self.http);
                    let run_id = self.run_id;
                    async move {
                        let outcome = source.probe(&http, run_id, site).await;
                        (site.site_id.clone(), outcome)
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

            for (site_id, outcome) in outcomes {
                let (capability, detail) = match outcome {
                    ProbeOutcome::Present => (Capability::Capable, None),
                    ProbeOutcome::Absent => (Capability::Excluded, Some("existence check found no series".to_string())),
                    ProbeOutcome::Failed(reason) => (Capability::Unknown, Some(reason)),
                };
                self.registry
                    .set_capability(&site_id, feed, capability, detail.as_deref(), now)
                    .await?;
            }

            let after = self.registry.capabilities(feed).await?;
            for site in &sites {
                match after.get(&site.site_id).map(|record| record.capability) {
                    Some(Capability::Capable) => report.capable += 1,
                    Some(Capability::Excluded) => report.excluded += 1,
                    Some(Capability::Unknown) | None => report.unknown += 1,
                }
            }
            info!(%feed, probed = report.probes_issued, "capabilities checked");
        }

        Ok(report)
    }
}
