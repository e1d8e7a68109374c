//! Core domain model for the flowcast extraction layer.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "flowcast-core";

/// USGS parameter code for discharge (cubic feet per second).
pub const PARAM_DISCHARGE: &str = "00060";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Fixed-width UTC text form used for every persisted timestamp.
///
/// Lexical order of the output equals chronological order, which the sqlite
/// tables rely on for `MAX(observed_at)` and range scans.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text.trim(), TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Round `ts` down to a multiple of `step` since the unix epoch.
pub fn floor_to(ts: DateTime<Utc>, step: Duration) -> DateTime<Utc> {
    let step_secs = step.num_seconds();
    if step_secs <= 0 {
        return ts;
    }
    let secs = ts.timestamp().div_euclid(step_secs) * step_secs;
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or(ts)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FeedType {
    /// 15-minute instantaneous discharge from NWIS.
    #[serde(rename = "streamflow_iv")]
    StreamflowInstant,
    /// Daily mean discharge from NWIS.
    #[serde(rename = "streamflow_dv")]
    StreamflowDaily,
    /// Hourly meteorological forcing from the Open-Meteo archive.
    #[serde(rename = "weather_hourly")]
    WeatherHourly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialScope {
    Site,
    Coordinate,
}

impl FeedType {
    pub const ALL: [FeedType; 3] = [
        FeedType::StreamflowInstant,
        FeedType::StreamflowDaily,
        FeedType::WeatherHourly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedType::StreamflowInstant => "streamflow_iv",
            FeedType::StreamflowDaily => "streamflow_dv",
            FeedType::WeatherHourly => "weather_hourly",
        }
    }

    pub fn source_id(&self) -> &'static str {
        match self {
            FeedType::StreamflowInstant | FeedType::StreamflowDaily => "usgs-nwis",
            FeedType::WeatherHourly => "open-meteo",
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            FeedType::StreamflowInstant => "streamflow_15min",
            FeedType::StreamflowDaily => "streamflow_daily",
            FeedType::WeatherHourly => "weather_forcing",
        }
    }

    /// Spacing between consecutive upstream values.
    pub fn native_step(&self) -> Duration {
        match self {
            FeedType::StreamflowInstant => Duration::minutes(15),
            FeedType::StreamflowDaily => Duration::days(1),
            FeedType::WeatherHourly => Duration::hours(1),
        }
    }

    /// Resolution of the upstream time parameters; request ranges are aligned to it.
    pub fn request_granularity(&self) -> Duration {
        match self {
            FeedType::StreamflowInstant => Duration::hours(1),
            FeedType::StreamflowDaily | FeedType::WeatherHourly => Duration::days(1),
        }
    }

    pub fn scope(&self) -> SpatialScope {
        match self {
            FeedType::StreamflowInstant | FeedType::StreamflowDaily => SpatialScope::Site,
            FeedType::WeatherHourly => SpatialScope::Coordinate,
        }
    }

    /// NWIS `outputDataTypeCd` value for site-scoped feeds.
    pub fn nwis_data_type(&self) -> Option<&'static str> {
        match self {
            FeedType::StreamflowInstant => Some("iv"),
            FeedType::StreamflowDaily => Some("dv"),
            FeedType::WeatherHourly => None,
        }
    }
}

impl fmt::Display for FeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown variant `{0}`")]
pub struct UnknownVariant(pub String);

impl FromStr for FeedType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeedType::ALL
            .into_iter()
            .find(|feed| feed.as_str() == s)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

/// Verified ability of a site to produce a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Not verified yet, or the last existence check failed; probed again on the next pass.
    Unknown,
    Capable,
    /// Upstream reported the measurement does not exist here. Never fetched again.
    Excluded,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Unknown => "unknown",
            Capability::Capable => "capable",
            Capability::Excluded => "excluded",
        }
    }
}

impl FromStr for Capability {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Capability::Unknown),
            "capable" => Ok(Capability::Capable),
            "excluded" => Ok(Capability::Excluded),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// A monitored location as reported by the region catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub site_id: String,
    pub station_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub region_code: String,
    pub huc_code: Option<String>,
    pub drainage_area_sq_mi: Option<f64>,
    pub altitude_ft: Option<f64>,
    /// Feeds the catalog claims this site carries. Over-inclusive upstream.
    pub declared_feeds: BTreeSet<FeedType>,
}

impl Site {
    pub fn new(site_id: impl Into<String>, region_code: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            station_name: None,
            latitude: None,
            longitude: None,
            region_code: region_code.into(),
            huc_code: None,
            drainage_area_sq_mi: None,
            altitude_ft: None,
            declared_feeds: BTreeSet::new(),
        }
    }

    /// `(latitude, longitude)` when both are known.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }

    pub fn declares(&self, feed: FeedType) -> bool {
        self.declared_feeds.contains(&feed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcingVariable {
    Prcp,
    Temp,
    Humidity,
    WindSpeed,
    WindDirection,
    Rsds,
    Rlds,
    Psurf,
    Pet,
}

impl ForcingVariable {
    pub const ALL: [ForcingVariable; 9] = [
        ForcingVariable::Prcp,
        ForcingVariable::Temp,
        ForcingVariable::Humidity,
        ForcingVariable::WindSpeed,
        ForcingVariable::WindDirection,
        ForcingVariable::Rsds,
        ForcingVariable::Rlds,
        ForcingVariable::Psurf,
        ForcingVariable::Pet,
    ];

    pub fn column_name(&self) -> &'static str {
        match self {
            ForcingVariable::Prcp => "prcp",
            ForcingVariable::Temp => "temp",
            ForcingVariable::Humidity => "humidity",
            ForcingVariable::WindSpeed => "wind_speed",
            ForcingVariable::WindDirection => "wind_direction",
            ForcingVariable::Rsds => "rsds",
            ForcingVariable::Rlds => "rlds",
            ForcingVariable::Psurf => "psurf",
            ForcingVariable::Pet => "pet",
        }
    }

    pub fn open_meteo_name(&self) -> &'static str {
        match self {
            ForcingVariable::Prcp => "precipitation",
            ForcingVariable::Temp => "temperature_2m",
            ForcingVariable::Humidity => "relative_humidity_2m",
            ForcingVariable::WindSpeed => "wind_speed_10m",
            ForcingVariable::WindDirection => "wind_direction_10m",
            ForcingVariable::Rsds => "shortwave_radiation",
            ForcingVariable::Rlds => "terrestrial_radiation",
            ForcingVariable::Psurf => "surface_pressure",
            ForcingVariable::Pet => "et0_fao_evapotranspiration",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ForcingValues {
    pub prcp: Option<f64>,
    pub temp: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    pub rsds: Option<f64>,
    pub rlds: Option<f64>,
    pub psurf: Option<f64>,
    pub pet: Option<f64>,
}

impl ForcingValues {
    pub fn get(&self, variable: ForcingVariable) -> Option<f64> {
        match variable {
            ForcingVariable::Prcp => self.prcp,
            ForcingVariable::Temp => self.temp,
            ForcingVariable::Humidity => self.humidity,
            ForcingVariable::WindSpeed => self.wind_speed,
            ForcingVariable::WindDirection => self.wind_direction,
            ForcingVariable::Rsds => self.rsds,
            ForcingVariable::Rlds => self.rlds,
            ForcingVariable::Psurf => self.psurf,
            ForcingVariable::Pet => self.pet,
        }
    }

    pub fn set(&mut self, variable: ForcingVariable, value: Option<f64>) {
        let slot = match variable {
            ForcingVariable::Prcp => &mut self.prcp,
            ForcingVariable::Temp => &mut self.temp,
            ForcingVariable::Humidity => &mut self.humidity,
            ForcingVariable::WindSpeed => &mut self.wind_speed,
            ForcingVariable::WindDirection => &mut self.wind_direction,
            ForcingVariable::Rsds => &mut self.rsds,
            ForcingVariable::Rlds => &mut self.rlds,
            ForcingVariable::Psurf => &mut self.psurf,
            ForcingVariable::Pet => &mut self.pet,
        };
        *slot = value;
    }

    pub fn is_empty(&self) -> bool {
        ForcingVariable::ALL.iter().all(|v| self.get(*v).is_none())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Measurement {
    Discharge {
        cfs: Option<f64>,
        qualifiers: Option<String>,
    },
    Forcing(ForcingValues),
}

/// One measured value (or forcing vector) at a site and instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub site_id: String,
    pub feed: FeedType,
    pub observed_at: DateTime<Utc>,
    pub measurement: Measurement,
    pub fetched_at: DateTime<Utc>,
}

/// Ingestion progress for one (site, feed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub site_id: String,
    pub feed: FeedType,
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl Watermark {
    pub fn new(site_id: impl Into<String>, feed: FeedType) -> Self {
        Self {
            site_id: site_id.into(),
            feed,
            last_success: None,
            last_attempt: None,
            consecutive_failures: 0,
        }
    }
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// `None` when the interval would be empty.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn merge(&self, other: &TimeRange) -> TimeRange {
        TimeRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            format_timestamp(self.start),
            format_timestamp(self.end)
        )
    }
}

/// One upstream request: a spatial key shared by one or more sites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchItem {
    pub spatial_key: String,
    pub sites: Vec<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub range: TimeRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchBatch {
    pub batch_no: usize,
    pub feed: FeedType,
    pub range: TimeRange,
    pub items: Vec<FetchItem>,
}

impl FetchBatch {
    pub fn site_count(&self) -> usize {
        self.items.iter().map(|item| item.sites.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Succeeded {
        records: Vec<ObservationRecord>,
        from_cache: bool,
    },
    /// Retries exhausted or upstream temporarily unusable; eligible next run.
    TransientFailure { reason: String, attempts: usize },
    /// Upstream says the feed does not exist for this item.
    PermanentFailure { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemResult {
    pub item: FetchItem,
    pub outcome: ItemOutcome,
}
