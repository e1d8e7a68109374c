//! Open-Meteo historical archive, hourly forcing per coordinate.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use flowcast_core::{FeedType, FetchItem, ForcingValues, ForcingVariable, Measurement, Site};
use flowcast_storage::HttpFetcher;
use reqwest::Url;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::{fan_out, json_str, AdapterError, FeedResponse, ProbeOutcome, TimeSeriesSource};

pub const SOURCE_ID: &str = "open-meteo";

#[derive(Debug, Clone)]
pub struct OpenMeteoFeed {
    archive_url: String,
}

impl OpenMeteoFeed {
    pub fn new(archive_url: impl Into<String>) -> Self {
        Self {
            archive_url: archive_url.into(),
        }
    }
}

pub fn valid_coordinates(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}

fn hourly_variables() -> String {
    ForcingVariable::ALL
        .iter()
        .map(ForcingVariable::open_meteo_name)
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_hour(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Hourly rows from an archive body; rows with every variable null are dropped.
pub fn decode_hourly(body: &[u8]) -> Option<Vec<(DateTime<Utc>, Measurement)>> {
    let doc: JsonValue = serde_json::from_slice(body).ok()?;
    let hourly = doc.get("hourly")?;
    let times = hourly.get("time")?.as_array()?;

    let columns: Vec<(ForcingVariable, Option<&Vec<JsonValue>>)> = ForcingVariable::ALL
        .iter()
        .map(|var| (*var, hourly.get(var.open_meteo_name()).and_then(JsonValue::as_array)))
        .collect();

    let mut points = Vec::with_capacity(times.len());
    for (idx, time) in times.iter().enumerate() {
        let Some(observed_at) = time.as_str().and_then(parse_hour) else {
            continue;
        };
        let mut values = ForcingValues::default();
        for (var, column) in &columns {
            let value = column.and_then(|col| col.get(idx)).and_then(JsonValue::as_f64);
            values.set(*var, value);
        }
        if !values.is_empty() {
            points.push((observed_at, Measurement::Forcing(values)));
        }
    }
    Some(points)
}

#[async_trait]
impl TimeSeriesSource for OpenMeteoFeed {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn feed(&self) -> FeedType {
        FeedType::WeatherHourly
    }

    fn request_url(&self, item: &FetchItem) -> Result<String, AdapterError> {
        let (Some(latitude), Some(longitude)) = (item.latitude, item.longitude) else {
            return Err(AdapterError::InvalidRequest(format!(
                "{} has no coordinates",
                item.spatial_key
            )));
        };
        // end_date is inclusive on the archive side
        let last_day = item.range.end - Duration::seconds(1);
        Url::parse_with_params(
            &self.archive_url,
            &[
                ("latitude", latitude.to_string()),
                ("longitude", longitude.to_string()),
                ("start_date", item.range.start.format("%Y-%m-%d").to_string()),
                ("end_date", last_day.format("%Y-%m-%d").to_string()),
                ("hourly", hourly_variables()),
                ("timezone", "UTC".to_string()),
                ("wind_speed_unit", "ms".to_string()),
            ],
        )
        .map(|url| url.to_string())
        .map_err(|err| AdapterError::InvalidRequest(format!("{}: {err}", self.archive_url)))
    }

    fn decode(&self, item: &FetchItem, body: &[u8], fetched_at: DateTime<Utc>) -> FeedResponse {
        match decode_hourly(body) {
            Some(points) => FeedResponse::Records(fan_out(item, FeedType::WeatherHourly, points, fetched_at)),
            None => FeedResponse::Transient("archive response has no hourly block".to_string()),
        }
    }

    fn classify_rejection(&self, status: u16, body: &[u8]) -> FeedResponse {
        let reason = serde_json::from_slice::<JsonValue>(body)
            .ok()
            .and_then(|doc| json_str(&doc, &["reason"]).map(str::to_string))
            .unwrap_or_else(|| format!("http {status}"));
        let lowered = reason.to_ascii_lowercase();
        let about_location = ["latitude", "longitude", "coordinate"]
            .iter()
            .any(|word| lowered.contains(word));
        if status == 400 && about_location {
            FeedResponse::NotSupported(reason)
        } else {
            FeedResponse::Transient(reason)
        }
    }

    /// Local coordinate check only; no request is issued. Whether the archive serves a
    /// point is settled at fetch time, where a coordinate rejection excludes the site.
    async fn probe(&self, _http: &HttpFetcher, _run_id: Uuid, site: &Site) -> ProbeOutcome {
        match site.coordinates() {
            Some((lat, lon)) if valid_coordinates(lat, lon) => ProbeOutcome::Present,
            _ => ProbeOutcome::Absent,
        }
    }
}
