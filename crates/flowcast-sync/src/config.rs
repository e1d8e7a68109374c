use std::path::PathBuf;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use flowcast_adapters::UpstreamEndpoints;
use flowcast_core::FeedType;
use flowcast_storage::{BackoffPolicy, CacheMode, HttpClientConfig};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "flowcast.yaml";

/// Mississippi basin two-digit HUC regions.
pub const MISSISSIPPI_BASIN_HUCS: [&str; 6] = ["05", "06", "07", "08", "10", "11"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub database_url: String,
    pub cache_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub http: HttpSettings,
    pub cache: CacheSettings,
    pub orchestrator: OrchestratorSettings,
    pub feeds: FeedPolicies,
    pub discovery: DiscoverySettings,
    pub coordinate_binning: CoordinateBinning,
    pub upstream: UpstreamEndpoints,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://flowcast.db".to_string(),
            cache_dir: PathBuf::from("./cache"),
            reports_dir: PathBuf::from("./reports"),
            http: HttpSettings::default(),
            cache: CacheSettings::default(),
            orchestrator: OrchestratorSettings::default(),
            feeds: FeedPolicies::default(),
            discovery: DiscoverySettings::default(),
            coordinate_binning: CoordinateBinning::default(),
            upstream: UpstreamEndpoints::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub user_agent: String,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    /// Minimum gap between request starts against one upstream; 0 disables pacing.
    pub min_spacing_ms: u64,
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub rate_limit_base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            user_agent: "flowcast/0.1".to_string(),
            global_concurrency: 16,
            per_source_concurrency: 4,
            // 500 calls/minute
            min_spacing_ms: 120,
            max_retries: 3,
            base_delay_ms: 5_000,
            rate_limit_base_delay_ms: 60_000,
            max_delay_ms: 300_000,
        }
    }
}

impl HttpSettings {
    pub fn client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: StdDuration::from_secs(self.timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.global_concurrency,
            per_source_concurrency: self.per_source_concurrency,
            min_spacing: (self.min_spacing_ms > 0).then(|| StdDuration::from_millis(self.min_spacing_ms)),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                base_delay: StdDuration::from_millis(self.base_delay_ms),
                rate_limit_base_delay: StdDuration::from_millis(self.rate_limit_base_delay_ms),
                max_delay: StdDuration::from_millis(self.max_delay_ms),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// `None` keeps entries until an explicit clear.
    pub ttl_hours: Option<u64>,
    pub mode: CacheMode,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_hours: None,
            mode: CacheMode::ReadWrite,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Option<chrono::Duration> {
        self.ttl_hours
            .and_then(|h| i64::try_from(h).ok())
            .map(chrono::Duration::hours)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub workers: usize,
    pub max_items_per_batch: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            max_items_per_batch: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedPolicy {
    pub enabled: bool,
    pub max_lookback_days: u32,
    pub min_recheck_minutes: u32,
    /// How far behind `now` the upstream can actually serve data.
    pub availability_lag_minutes: u32,
    /// Re-fetch window behind the watermark.
    pub overlap_minutes: u32,
}

impl Default for FeedPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_lookback_days: 30,
            min_recheck_minutes: 60,
            availability_lag_minutes: 0,
            overlap_minutes: 0,
        }
    }
}

impl FeedPolicy {
    pub fn max_lookback(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.max_lookback_days))
    }

    pub fn min_recheck(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.min_recheck_minutes))
    }

    pub fn availability_lag(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.availability_lag_minutes))
    }

    pub fn overlap(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.overlap_minutes))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedPolicies {
    pub streamflow_iv: FeedPolicy,
    pub streamflow_dv: FeedPolicy,
    pub weather_hourly: FeedPolicy,
}

impl Default for FeedPolicies {
    fn default() -> Self {
        Self {
            streamflow_iv: FeedPolicy::default(),
            streamflow_dv: FeedPolicy {
                min_recheck_minutes: 24 * 60,
                ..FeedPolicy::default()
            },
            weather_hourly: FeedPolicy {
                max_lookback_days: 7,
                min_recheck_minutes: 24 * 60,
                // the archive serves up to yesterday
                availability_lag_minutes: 24 * 60,
                ..FeedPolicy::default()
            },
        }
    }
}

impl FeedPolicies {
    pub fn for_feed(&self, feed: FeedType) -> &FeedPolicy {
        match feed {
            FeedType::StreamflowInstant => &self.streamflow_iv,
            FeedType::StreamflowDaily => &self.streamflow_dv,
            FeedType::WeatherHourly => &self.weather_hourly,
        }
    }

    pub fn for_feed_mut(&mut self, feed: FeedType) -> &mut FeedPolicy {
        match feed {
            FeedType::StreamflowInstant => &mut self.streamflow_iv,
            FeedType::StreamflowDaily => &mut self.streamflow_dv,
            FeedType::WeatherHourly => &mut self.weather_hourly,
        }
    }

    pub fn enabled_feeds(&self) -> Vec<FeedType> {
        FeedType::ALL
            .into_iter()
            .filter(|feed| self.for_feed(*feed).enabled)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub regions: Vec<String>,
    pub sample_mode: bool,
    pub max_sites: usize,
    /// Re-verify `capable` sites older than this many days.
    pub capability_refresh_days: Option<u32>,
    pub probe_concurrency: usize,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            regions: vec!["10".to_string()],
            sample_mode: false,
            max_sites: 100,
            capability_refresh_days: None,
            probe_concurrency: 16,
        }
    }
}

/// How weather sites are collapsed onto shared upstream coordinates.
///
/// Absent `decimals` means exact coordinates: only identical points share a request.
/// Precision is capped at [`MAX_BIN_DECIMALS`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinateBinning {
    pub decimals: Option<u32>,
}

pub const MAX_BIN_DECIMALS: u32 = 6;

impl CoordinateBinning {
    pub fn exact() -> Self {
        Self { decimals: None }
    }

    pub fn decimals(decimals: u32) -> Self {
        Self {
            decimals: Some(decimals),
        }
    }

    /// The spatial key plus the coordinates actually requested for it.
    pub fn bin(&self, latitude: f64, longitude: f64) -> (String, f64, f64) {
        match self.decimals {
            None => (format!("{latitude},{longitude}"), latitude, longitude),
            Some(decimals) => {
                let decimals = decimals.min(MAX_BIN_DECIMALS);
                let factor = 10f64.powi(decimals as i32);
                let lat = (latitude * factor).round() / factor;
                let lon = (longitude * factor).round() / factor;
                let width = decimals as usize;
                (format!("{lat:.width$},{lon:.width$}"), lat, lon)
            }
        }
    }
}

impl PipelineConfig {
    /// `flowcast.yaml` (or `FLOWCAST_CONFIG`) if present, else defaults; then env overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(std::env::var("FLOWCAST_CONFIG").ok().map(PathBuf::from))
    }

    /// An explicit path must exist; the default path may be absent.
    pub fn load_from(explicit: Option<PathBuf>) -> Result<Self> {
        let path = explicit.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))?,
            Err(err) if explicit.is_none() && err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("deserializing pipeline config")
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("FLOWCAST_DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(dir) = lookup("FLOWCAST_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("FLOWCAST_REPORTS_DIR") {
            self.reports_dir = PathBuf::from(dir);
        }
        if let Some(agent) = lookup("FLOWCAST_USER_AGENT") {
            self.http.user_agent = agent;
        }
        if let Some(secs) = lookup("FLOWCAST_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.http.timeout_secs = secs;
        }
    }
}
