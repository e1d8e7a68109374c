use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flowcast_adapters::FetchClient;
use flowcast_core::{
    Capability, FeedType, FetchBatch, FetchItem, ItemOutcome, ItemResult, Site, SpatialScope, TimeRange,
};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{CoordinateBinning, OrchestratorSettings};
use crate::discovery::SiteRegistry;
use crate::watermark::{AdvanceOutcome, WatermarkTracker};
use crate::writer::{CommitReceipt, ObservationWriter};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub feed: FeedType,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub batches_planned: usize,
    pub batches_attempted: usize,
    pub batches_committed: usize,
    pub sites_attempted: usize,
    pub sites_succeeded: usize,
    pub sites_transient_failed: usize,
    pub sites_permanently_excluded: usize,
    pub sites_up_to_date: usize,
    pub records_fetched: usize,
    pub records_inserted: u64,
    pub cache_hits: usize,
    /// Batches whose records or site bookkeeping could not be persisted.
    pub write_failures: usize,
    pub cancelled: bool,
}

impl RunSummary {
    fn new(run_id: Uuid, feed: FeedType, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            feed,
            started_at,
            finished_at: started_at,
            batches_planned: 0,
            batches_attempted: 0,
            batches_committed: 0,
            sites_attempted: 0,
            sites_succeeded: 0,
            sites_transient_failed: 0,
            sites_permanently_excluded: 0,
            sites_up_to_date: 0,
            records_fetched: 0,
            records_inserted: 0,
            cache_hits: 0,
            write_failures: 0,
            cancelled: false,
        }
    }

    /// Conditions an operator has to look at; routine per-site failures are not among them.
    pub fn escalation(&self) -> Option<String> {
        if self.write_failures > 0 {
            return Some(format!("{} batch writes failed for {}", self.write_failures, self.feed));
        }
        if self.sites_attempted > 0 && self.sites_succeeded == 0 && self.sites_permanently_excluded == 0 {
            return Some(format!(
                "upstream for {} unavailable: all {} attempted sites failed",
                self.feed, self.sites_attempted
            ));
        }
        None
    }

    pub fn status(&self) -> &'static str {
        if self.cancelled {
            "cancelled"
        } else if self.escalation().is_some() {
            "escalated"
        } else if self.sites_transient_failed > 0 {
            "partial"
        } else {
            "completed"
        }
    }
}

/// Collapse sites onto shared spatial keys, merging their ranges.
pub fn build_items(
    feed: FeedType,
    needed: &[(Site, TimeRange)],
    binning: CoordinateBinning,
) -> Vec<FetchItem> {
    let mut by_key: BTreeMap<String, FetchItem> = BTreeMap::new();
    for (site, range) in needed {
        let (key, latitude, longitude) = match feed.scope() {
            SpatialScope::Site => (site.site_id.clone(), site.latitude, site.longitude),
            SpatialScope::Coordinate => match site.coordinates() {
                Some((lat, lon)) => {
                    let (key, lat, lon) = binning.bin(lat, lon);
                    (key, Some(lat), Some(lon))
                }
                None => {
                    warn!(site_id = %site.site_id, %feed, "capable site has no coordinates; skipped");
                    continue;
                }
            },
        };
        by_key
            .entry(key.clone())
            .and_modify(|item| {
                item.sites.push(site.site_id.clone());
                item.range = item.range.merge(range);
            })
            .or_insert_with(|| FetchItem {
                spatial_key: key,
                sites: vec![site.site_id.clone()],
                latitude,
                longitude,
                range: *range,
            });
    }
    by_key.into_values().collect()
}

/// Group items sharing a range, then chunk each group to the batch size.
pub fn plan_batches(feed: FeedType, items: Vec<FetchItem>, max_items_per_batch: usize) -> Vec<FetchBatch> {
    let mut by_range: BTreeMap<TimeRange, Vec<FetchItem>> = BTreeMap::new();
    for item in items {
        by_range.entry(item.range).or_default().push(item);
    }

    let size = max_items_per_batch.max(1);
    let mut batches = Vec::new();
    for (range, group) in by_range {
        for chunk in group.chunks(size) {
            batches.push(FetchBatch {
                batch_no: batches.len(),
                feed,
                range,
                items: chunk.to_vec(),
            });
        }
    }
    batches
}

pub struct BatchOrchestrator {
    registry: SiteRegistry,
    tracker: WatermarkTracker,
    writer: ObservationWriter,
    client: FetchClient,
    settings: OrchestratorSettings,
    binning: CoordinateBinning,
    run_id: Uuid,
}

impl BatchOrchestrator {
    pub fn new(
        registry: SiteRegistry,
        tracker: WatermarkTracker,
        writer: ObservationWriter,
        client: FetchClient,
        settings: OrchestratorSettings,
        binning: CoordinateBinning,
        run_id: Uuid,
    ) -> Self {
        Self {
            registry,
            tracker,
            writer,
            client,
            settings,
            binning,
            run_id,
        }
    }

    pub async fn run_feed(&self, feed: FeedType, now: DateTime<Utc>, cancel: CancellationToken) -> Result<RunSummary> {
        let mut summary = RunSummary::new(self.run_id, feed, Utc::now());

        let sites = self.registry.capable_sites(feed).await?;

        let mut needed = Vec::new();
        for site in sites {
            match self.tracker.range_needed(&site.site_id, feed, now).await? {
                Some(range) => needed.push((site, range)),
                None => summary.sites_up_to_date += 1,
            }
        }

        let items = build_items(feed, &needed, self.binning);
        let batches = plan_batches(feed, items, self.settings.max_items_per_batch);
        summary.batches_planned = batches.len();
        info!(
            run_id = %self.run_id,
            %feed,
            sites = needed.len(),
            up_to_date = summary.sites_up_to_date,
            batches = batches.len(),
            "extraction planned"
        );

        let queue = Arc::new(Mutex::new(VecDeque::from(batches)));
        let workers = self.settings.workers.max(1);
        let (tx, mut rx) = mpsc::channel::<(FetchBatch, Vec<ItemResult>)>(workers * 2);

        let mut pool = JoinSet::new();
        for worker in 0..workers {
            let queue = Arc::clone(&queue);
            let client = self.client.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            pool.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let Some(batch) = queue.lock().await.pop_front() else {
                        break;
                    };
                    let results = client.fetch_batch(&batch).await;
                    if tx.send((batch, results)).await.is_err() {
                        break;
                    }
                }
                worker
            });
        }
        drop(tx);

        // Single writer: results are committed and watermarks moved one batch at a time.
        while let Some((batch, results)) = rx.recv().await {
            summary.batches_attempted += 1;
            self.apply_batch(feed, now, &batch, results, &mut summary).await;
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "fetch worker aborted");
            }
        }

        summary.cancelled = cancel.is_cancelled() && summary.batches_attempted < summary.batches_planned;
        summary.finished_at = Utc::now();
        info!(
            run_id = %self.run_id,
            %feed,
            attempted = summary.sites_attempted,
            succeeded = summary.sites_succeeded,
            transient_failed = summary.sites_transient_failed,
            excluded = summary.sites_permanently_excluded,
            inserted = summary.records_inserted,
            "extraction finished"
        );
        Ok(summary)
    }

    /// Commit a batch, then settle every site in it. A failed commit moves no watermark,
    /// but exclusions and failed attempts are still recorded.
    async fn apply_batch(
        &self,
        feed: FeedType,
        now: DateTime<Utc>,
        batch: &FetchBatch,
        results: Vec<ItemResult>,
        summary: &mut RunSummary,
    ) {
        summary.sites_attempted += batch.site_count();

        let mut records = Vec::new();
        for result in &results {
            if let ItemOutcome::Succeeded { records: item_records, from_cache } = &result.outcome {
                summary.records_fetched += item_records.len();
                if *from_cache {
                    summary.cache_hits += 1;
                }
                records.extend(item_records.iter().cloned());
            }
        }

        let receipt = match self.writer.commit(feed, &records).await {
            Ok(receipt) => {
                summary.batches_committed += 1;
                summary.records_inserted += receipt.inserted;
                Some(receipt)
            }
            Err(err) => {
                error!(batch_no = batch.batch_no, %feed, error = %err, "batch commit failed; watermarks untouched");
                summary.write_failures += 1;
                None
            }
        };

        let mut bookkeeping_failed = false;
        for result in results {
            for site_id in &result.item.sites {
                let settled = match (&result.outcome, &receipt) {
                    (ItemOutcome::Succeeded { .. }, Some(receipt)) => self
                        .settle_success(site_id, feed, receipt, now)
                        .await
                        .map(|()| SiteOutcome::Succeeded),
                    (ItemOutcome::Succeeded { .. }, None) => self
                        .tracker
                        .record_attempt(site_id, feed, now, false)
                        .await
                        .map(|()| SiteOutcome::Transient),
                    (ItemOutcome::TransientFailure { reason, attempts }, _) => {
                        warn!(%site_id, %feed, attempts, %reason, "transient failure; retry next run");
                        self.tracker
                            .record_attempt(site_id, feed, now, false)
                            .await
                            .map(|()| SiteOutcome::Transient)
                    }
                    (ItemOutcome::PermanentFailure { reason }, _) => {
                        info!(%site_id, %feed, %reason, "feed not available; excluding");
                        self.registry
                            .set_capability(site_id, feed, Capability::Excluded, Some(reason.as_str()), now)
                            .await
                            .with_context(|| format!("excluding {site_id} from {feed}"))
                            .map(|()| SiteOutcome::Excluded)
                    }
                };
                match settled {
                    Ok(SiteOutcome::Succeeded) => summary.sites_succeeded += 1,
                    Ok(SiteOutcome::Transient) => summary.sites_transient_failed += 1,
                    Ok(SiteOutcome::Excluded) => summary.sites_permanently_excluded += 1,
                    Err(err) => {
                        error!(%site_id, %feed, error = %format_args!("{err:#}"), "site bookkeeping failed");
                        bookkeeping_failed = true;
                        summary.sites_transient_failed += 1;
                    }
                }
            }
        }
        if bookkeeping_failed {
            summary.write_failures += 1;
        }
    }

    async fn settle_success(
        &self,
        site_id: &str,
        feed: FeedType,
        receipt: &CommitReceipt,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let advanced = match receipt.per_site_max.get(site_id) {
            Some(max) => self.tracker.advance(site_id, feed, *max, now).await?,
            None => AdvanceOutcome::Rejected,
        };
        if advanced == AdvanceOutcome::Rejected {
            self.tracker.record_attempt(site_id, feed, now, true).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum SiteOutcome {
    Succeeded,
    Transient,
    Excluded,
}
