use std::sync::Arc;

use chrono::Utc;
use flowcast_core::{FetchBatch, FetchItem, ItemOutcome, ItemResult};
use flowcast_storage::{CacheMode, FetchError, Fingerprint, HttpFetcher, ResponseCache};
use futures::future::join_all;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{FeedResponse, TimeSeriesSource};

/// Fetcher + cache + adapter for one feed: turns a batch into per-item outcomes.
#[derive(Clone)]
pub struct FetchClient {
    http: Arc<HttpFetcher>,
    cache: Arc<dyn ResponseCache>,
    mode: CacheMode,
    source: Arc<dyn TimeSeriesSource>,
    run_id: Uuid,
}

impl FetchClient {
    pub fn new(
        http: Arc<HttpFetcher>,
        cache: Arc<dyn ResponseCache>,
        mode: CacheMode,
        source: Arc<dyn TimeSeriesSource>,
        run_id: Uuid,
    ) -> Self {
        Self {
            http,
            cache,
            mode,
            source,
            run_id,
        }
    }

    fn fingerprint(&self, item: &FetchItem) -> Fingerprint {
        Fingerprint::new(
            self.source.source_id(),
            item.spatial_key.clone(),
            item.range,
            self.source.feed(),
        )
    }

    pub async fn fetch_item(&self, item: &FetchItem) -> ItemOutcome {
        let fingerprint = self.fingerprint(item);

        if self.mode == CacheMode::ReadWrite {
            if let Some(entry) = self.cache.lookup(&fingerprint).await {
                match self.source.decode(item, &entry.body, entry.stored_at) {
                    FeedResponse::Records(records) => {
                        debug!(spatial_key = %item.spatial_key, records = records.len(), "cache hit");
                        return ItemOutcome::Succeeded {
                            records,
                            from_cache: true,
                        };
                    }
                    _ => warn!(digest = %entry.digest, "cached body no longer decodes; refetching"),
                }
            }
        }

        let url = match self.source.request_url(item) {
            Ok(url) => url,
            Err(err) => {
                return ItemOutcome::PermanentFailure {
                    reason: err.to_string(),
                }
            }
        };

        match self.http.fetch_bytes(self.run_id, self.source.source_id(), &url).await {
            Ok(resp) => {
                let fetched_at = Utc::now();
                match self.source.decode(item, &resp.body, fetched_at) {
                    FeedResponse::Records(records) => {
                        if let Err(err) = self.cache.store(&fingerprint, &resp.body, fetched_at).await {
                            warn!(spatial_key = %item.spatial_key, error = %err, "failed to cache response");
                        }
                        ItemOutcome::Succeeded {
                            records,
                            from_cache: false,
                        }
                    }
                    FeedResponse::NotSupported(reason) => ItemOutcome::PermanentFailure { reason },
                    FeedResponse::Transient(reason) => ItemOutcome::TransientFailure {
                        reason,
                        attempts: resp.attempts,
                    },
                }
            }
            Err(FetchError::HttpStatus { status, body, .. }) => {
                match self.source.classify_rejection(status, &body) {
                    FeedResponse::NotSupported(reason) => ItemOutcome::PermanentFailure { reason },
                    FeedResponse::Transient(reason) => ItemOutcome::TransientFailure { reason, attempts: 1 },
                    FeedResponse::Records(_) => ItemOutcome::TransientFailure {
                        reason: format!("unexpected http {status}"),
                        attempts: 1,
                    },
                }
            }
            Err(err) => ItemOutcome::TransientFailure {
                attempts: err.attempts(),
                reason: err.to_string(),
            },
        }
    }

    /// One result per item, in item order. Items of a batch are fetched concurrently;
    /// the fetcher's limits bound what actually reaches the network.
    pub async fn fetch_batch(&self, batch: &FetchBatch) -> Vec<ItemResult> {
        let outcomes = join_all(batch.items.iter().map(|item| self.fetch_item(item))).await;
        batch
            .items
            .iter()
            .cloned()
            .zip(outcomes)
            .map(|(item, outcome)| ItemResult { item, outcome })
            .collect()
    }
}
