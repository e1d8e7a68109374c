//! Upstream adapters: decode each feed into a fixed record contract.

mod client;
pub mod nwis;
pub mod open_meteo;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowcast_core::{FeedType, FetchItem, ObservationRecord, Site};
use flowcast_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub use client::FetchClient;
pub use nwis::{NwisCatalog, NwisFeed};
pub use open_meteo::OpenMeteoFeed;

pub const CRATE_NAME: &str = "flowcast-adapters";

pub const DEFAULT_NWIS_BASE_URL: &str = "https://waterservices.usgs.gov/nwis";
pub const DEFAULT_OPEN_METEO_ARCHIVE_URL: &str = "https://archive-api.open-meteo.com/v1/archive";

/// A decoded upstream response, whatever shape the upstream used.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedResponse {
    Records(Vec<ObservationRecord>),
    /// Upstream says the measurement does not exist for this item.
    NotSupported(String),
    /// Unusable right now; worth asking again on a later run.
    Transient(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Present,
    Absent,
    Failed(String),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("catalog query for region {region} failed: {message}")]
    Catalog { region: String, message: String },
    #[error(transparent)]
    Fetch(#[from] flowcast_storage::FetchError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamEndpoints {
    pub nwis_base_url: String,
    pub open_meteo_archive_url: String,
}

impl Default for UpstreamEndpoints {
    fn default() -> Self {
        Self {
            nwis_base_url: DEFAULT_NWIS_BASE_URL.to_string(),
            open_meteo_archive_url: DEFAULT_OPEN_METEO_ARCHIVE_URL.to_string(),
        }
    }
}

#[async_trait]
pub trait TimeSeriesSource: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn feed(&self) -> FeedType;

    fn request_url(&self, item: &FetchItem) -> Result<String, AdapterError>;

    /// Decode a successful body. Records are emitted for every site sharing the
    /// item and only inside `item.range`.
    fn decode(&self, item: &FetchItem, body: &[u8], fetched_at: DateTime<Utc>) -> FeedResponse;

    /// Interpret a non-retryable HTTP status.
    fn classify_rejection(&self, status: u16, body: &[u8]) -> FeedResponse;

    /// Cheap check that the feed exists for `site` before it is ever extracted.
    async fn probe(&self, http: &HttpFetcher, run_id: Uuid, site: &Site) -> ProbeOutcome;
}

#[async_trait]
pub trait SiteCatalog: Send + Sync {
    async fn sites_in_region(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        region: &str,
    ) -> Result<Vec<Site>, AdapterError>;
}

pub fn source_for_feed(feed: FeedType, endpoints: &UpstreamEndpoints) -> Arc<dyn TimeSeriesSource> {
    match feed {
        FeedType::StreamflowInstant | FeedType::StreamflowDaily => {
            Arc::new(NwisFeed::new(endpoints.nwis_base_url.clone(), feed))
        }
        FeedType::WeatherHourly => {
            Arc::new(OpenMeteoFeed::new(endpoints.open_meteo_archive_url.clone()))
        }
    }
}

pub fn catalog_for(endpoints: &UpstreamEndpoints) -> Arc<dyn SiteCatalog> {
    Arc::new(NwisCatalog::new(endpoints.nwis_base_url.clone()))
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

/// Fan one decoded series out to every site sharing the item, clipped to its range.
fn fan_out(
    item: &FetchItem,
    feed: FeedType,
    points: Vec<(DateTime<Utc>, flowcast_core::Measurement)>,
    fetched_at: DateTime<Utc>,
) -> Vec<ObservationRecord> {
    let mut records = Vec::with_capacity(points.len() * item.sites.len());
    for site_id in &item.sites {
        for (observed_at, measurement) in &points {
            if !item.range.contains(*observed_at) {
                continue;
            }
            records.push(ObservationRecord {
                site_id: site_id.clone(),
                feed,
                observed_at: *observed_at,
                measurement: measurement.clone(),
                fetched_at,
            });
        }
    }
    records
}
