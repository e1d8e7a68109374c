#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use flowcast_adapters::{catalog_for, UpstreamEndpoints};
use flowcast_core::FeedType;
use flowcast_storage::{DiskCache, HttpFetcher, RawResponse, ResponseCache, Transport, TransportError};
use flowcast_sync::config::FeedPolicy;
use flowcast_sync::{db, Pipeline, PipelineConfig};
use reqwest::{StatusCode, Url};
use tempfile::TempDir;

pub const NWIS_BASE: &str = "http://nwis.test/nwis";
pub const METEO_ARCHIVE: &str = "http://meteo.test/v1/archive";

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
}

pub fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, d, 0, 0, 0).unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Catalog,
    Probe,
    Data,
    Weather,
}

#[derive(Debug, Clone)]
pub struct LoggedRequest {
    pub kind: RequestKind,
    /// Site number, or the `lat,lon` pair for weather.
    pub key: String,
    pub status: u16,
}

#[derive(Debug, Clone)]
pub struct StubSite {
    pub site_id: String,
    pub region: String,
    pub latitude: f64,
    pub longitude: f64,
    /// NWIS data type codes the catalog lists for the site.
    pub declared: Vec<&'static str>,
    /// Data type codes whose series actually exist.
    pub series: Vec<&'static str>,
}

impl StubSite {
    pub fn river(index: usize) -> Self {
        Self {
            site_id: format!("0680{index:04}"),
            region: "10".to_string(),
            latitude: 41.0 + index as f64 * 0.01,
            longitude: -96.0 - index as f64 * 0.01,
            declared: vec!["iv", "dv"],
            series: vec!["iv", "dv"],
        }
    }
}

pub fn rivers(count: usize) -> Vec<StubSite> {
    (0..count).map(StubSite::river).collect()
}

/// In-process stand-in for NWIS and the Open-Meteo archive.
pub struct StubUpstream {
    sites: Vec<StubSite>,
    data_status: Mutex<HashMap<String, u16>>,
    probe_status: Mutex<HashMap<String, u16>>,
    catalog_down: AtomicBool,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    in_flight_limit: Option<usize>,
    latency: Duration,
    log: Mutex<Vec<LoggedRequest>>,
}

impl StubUpstream {
    pub fn new(sites: Vec<StubSite>) -> Self {
        Self {
            sites,
            data_status: Mutex::new(HashMap::new()),
            probe_status: Mutex::new(HashMap::new()),
            catalog_down: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            in_flight_limit: None,
            latency: Duration::from_millis(1),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Answer 429 whenever more than `limit` requests are open at once.
    pub fn with_in_flight_limit(mut self, limit: usize, latency: Duration) -> Self {
        self.in_flight_limit = Some(limit);
        self.latency = latency;
        self
    }

    pub fn set_data_status(&self, site_id: &str, status: u16) {
        self.data_status.lock().unwrap().insert(site_id.to_string(), status);
    }

    pub fn heal(&self, site_id: &str) {
        self.data_status.lock().unwrap().remove(site_id);
        self.probe_status.lock().unwrap().remove(site_id);
    }

    pub fn set_probe_status(&self, site_id: &str, status: u16) {
        self.probe_status.lock().unwrap().insert(site_id.to_string(), status);
    }

    pub fn set_catalog_down(&self, down: bool) {
        self.catalog_down.store(down, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }

    pub fn count(&self, kind: RequestKind) -> usize {
        self.requests().iter().filter(|r| r.kind == kind).count()
    }

    pub fn requests_for(&self, key: &str) -> usize {
        self.requests().iter().filter(|r| r.key == key).count()
    }

    pub fn rate_limited(&self) -> usize {
        self.requests().iter().filter(|r| r.status == 429).count()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn site(&self, site_id: &str) -> Option<&StubSite> {
        self.sites.iter().find(|s| s.site_id == site_id)
    }

    fn route(&self, url: &Url) -> (RequestKind, String, u16, Vec<u8>) {
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let service = url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .unwrap_or_default()
            .to_string();

        match service.as_str() {
            "site" if params.contains_key("huc") => {
                let region = params.get("huc").cloned().unwrap_or_default();
                if self.catalog_down.load(Ordering::SeqCst) {
                    return (RequestKind::Catalog, region, 503, b"maintenance".to_vec());
                }
                let body = self.catalog_body(&region);
                (RequestKind::Catalog, region, 200, body)
            }
            "site" => {
                let site_id = params.get("sites").cloned().unwrap_or_default();
                let data_type = params.get("outputDataTypeCd").cloned().unwrap_or_default();
                if let Some(status) = self.probe_status.lock().unwrap().get(&site_id).copied() {
                    return (RequestKind::Probe, site_id, status, Vec::new());
                }
                match self.site(&site_id) {
                    Some(site) if site.series.contains(&data_type.as_str()) => {
                        let body = rdb(&[(site, data_type.as_str())]);
                        (RequestKind::Probe, site_id, 200, body)
                    }
                    _ => (RequestKind::Probe, site_id, 404, b"No sites found".to_vec()),
                }
            }
            "iv" | "dv" => {
                let site_id = params.get("sites").cloned().unwrap_or_default();
                if let Some(status) = self.data_status.lock().unwrap().get(&site_id).copied() {
                    return (RequestKind::Data, site_id, status, b"upstream said no".to_vec());
                }
                if self.site(&site_id).is_none() {
                    return (RequestKind::Data, site_id, 404, Vec::new());
                }
                let body = waterml(&site_id, &service, &params);
                (RequestKind::Data, site_id, 200, body)
            }
            "archive" => {
                let key = format!(
                    "{},{}",
                    params.get("latitude").cloned().unwrap_or_default(),
                    params.get("longitude").cloned().unwrap_or_default()
                );
                (RequestKind::Weather, key, 200, archive(&params))
            }
            _ => (RequestKind::Data, service, 404, Vec::new()),
        }
    }

    fn catalog_body(&self, region: &str) -> Vec<u8> {
        let rows: Vec<(&StubSite, &str)> = self
            .sites
            .iter()
            .filter(|s| s.region == region)
            .flat_map(|s| s.declared.iter().map(move |dt| (s, *dt)))
            .collect();
        rdb(&rows)
    }
}

fn rdb(rows: &[(&StubSite, &str)]) -> Vec<u8> {
    let mut out = String::from(
        "# stub catalog\n\
         agency_cd\tsite_no\tstation_nm\tsite_tp_cd\tdec_lat_va\tdec_long_va\talt_va\thuc_cd\tdata_type_cd\tparm_cd\n\
         5s\t15s\t50s\t7s\t16s\t16s\t8s\t16s\t2s\t5s\n",
    );
    for (site, data_type) in rows {
        out.push_str(&format!(
            "USGS\t{}\tSTUB CREEK {}\tST\t{}\t{}\t1100.00\t{}020003\t{}\t00060\n",
            site.site_id, site.site_id, site.latitude, site.longitude, site.region, data_type
        ));
    }
    out.into_bytes()
}

fn waterml(site_id: &str, service: &str, params: &HashMap<String, String>) -> Vec<u8> {
    let start = params.get("startDT").map(String::as_str).unwrap_or_default();
    let end = params.get("endDT").map(String::as_str).unwrap_or_default();

    let mut stamps = Vec::new();
    if service == "dv" {
        let (Ok(first), Ok(last)) = (
            NaiveDate::parse_from_str(start, "%Y-%m-%d"),
            NaiveDate::parse_from_str(end, "%Y-%m-%d"),
        ) else {
            return b"bad dates".to_vec();
        };
        let mut d = first;
        while d <= last {
            stamps.push(format!("{}T00:00:00.000", d.format("%Y-%m-%d")));
            d += ChronoDuration::days(1);
        }
    } else {
        let (Ok(first), Ok(last)) = (
            NaiveDateTime::parse_from_str(start, "%Y-%m-%dT%H:%MZ"),
            NaiveDateTime::parse_from_str(end, "%Y-%m-%dT%H:%MZ"),
        ) else {
            return b"bad datetimes".to_vec();
        };
        let mut t = first;
        while t <= last {
            stamps.push(format!("{}+00:00", t.format("%Y-%m-%dT%H:%M:%S%.3f")));
            t += ChronoDuration::minutes(15);
        }
    }

    let values: Vec<serde_json::Value> = stamps
        .iter()
        .enumerate()
        .map(|(i, stamp)| {
            serde_json::json!({
                "value": format!("{:.1}", 100.0 + i as f64),
                "qualifiers": ["P"],
                "dateTime": stamp,
            })
        })
        .collect();

    serde_json::json!({
        "value": {"timeSeries": [{
            "sourceInfo": {"siteCode": [{"value": site_id}]},
            "variable": {"variableCode": [{"value": "00060"}], "noDataValue": -999999.0},
            "values": [{"value": values}]
        }]}
    })
    .to_string()
    .into_bytes()
}

fn archive(params: &HashMap<String, String>) -> Vec<u8> {
    let start = params.get("start_date").map(String::as_str).unwrap_or_default();
    let end = params.get("end_date").map(String::as_str).unwrap_or_default();
    let (Ok(first), Ok(last)) = (
        NaiveDate::parse_from_str(start, "%Y-%m-%d"),
        NaiveDate::parse_from_str(end, "%Y-%m-%d"),
    ) else {
        return serde_json::json!({"error": true, "reason": "bad dates"}).to_string().into_bytes();
    };

    let mut times = Vec::new();
    let mut d = first;
    while d <= last {
        for hour in 0..24 {
            times.push(format!("{}T{hour:02}:00", d.format("%Y-%m-%d")));
        }
        d += ChronoDuration::days(1);
    }
    let precipitation: Vec<f64> = (0..times.len()).map(|i| (i % 3) as f64 * 0.2).collect();
    let temperature: Vec<f64> = (0..times.len()).map(|i| -2.0 + (i % 24) as f64 * 0.5).collect();

    serde_json::json!({
        "hourly": {
            "time": times,
            "precipitation": precipitation,
            "temperature_2m": temperature,
        }
    })
    .to_string()
    .into_bytes()
}

#[async_trait]
impl Transport for StubUpstream {
    async fn get(&self, url: &str) -> Result<RawResponse, TransportError> {
        let parsed = Url::parse(url).map_err(|err| TransportError::other(err.to_string()))?;

        let open = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(open, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;

        let (kind, key, status, body) = match self.in_flight_limit {
            Some(limit) if open > limit => {
                let (kind, key, _, _) = self.route(&parsed);
                (kind, key, 429, b"too many requests".to_vec())
            }
            _ => self.route(&parsed),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.log.lock().unwrap().push(LoggedRequest { kind, key, status });
        Ok(RawResponse {
            status: StatusCode::from_u16(status).map_err(|err| TransportError::other(err.to_string()))?,
            final_url: url.to_string(),
            body,
        })
    }
}

fn feed_policy(enabled: bool, lookback_days: u32, recheck_minutes: u32) -> FeedPolicy {
    FeedPolicy {
        enabled,
        max_lookback_days: lookback_days,
        min_recheck_minutes: recheck_minutes,
        availability_lag_minutes: 0,
        overlap_minutes: 0,
    }
}

/// Daily discharge only, ten days of lookback, near-zero backoff.
pub fn test_config(dir: &std::path::Path) -> PipelineConfig {
    let mut config = PipelineConfig {
        database_url: format!("sqlite://{}", dir.join("flowcast.db").display()),
        cache_dir: dir.join("cache"),
        reports_dir: dir.join("reports"),
        upstream: UpstreamEndpoints {
            nwis_base_url: NWIS_BASE.to_string(),
            open_meteo_archive_url: METEO_ARCHIVE.to_string(),
        },
        ..PipelineConfig::default()
    };
    config.http.timeout_secs = 5;
    config.http.min_spacing_ms = 0;
    config.http.max_retries = 1;
    config.http.base_delay_ms = 1;
    config.http.rate_limit_base_delay_ms = 2;
    config.http.max_delay_ms = 5;
    config.feeds.streamflow_iv = feed_policy(false, 1, 60);
    config.feeds.streamflow_dv = feed_policy(true, 10, 24 * 60);
    config.feeds.weather_hourly = feed_policy(false, 3, 24 * 60);
    config
}

pub struct Harness {
    pub upstream: Arc<StubUpstream>,
    pub pipeline: Pipeline,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new(upstream: StubUpstream) -> Self {
        Self::with_config(upstream, |_| {}).await
    }

    pub async fn with_config(upstream: StubUpstream, tweak: impl FnOnce(&mut PipelineConfig)) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let mut config = test_config(dir.path());
        tweak(&mut config);

        let upstream = Arc::new(upstream);
        let transport: Arc<dyn Transport> = upstream.clone();
        let http = Arc::new(HttpFetcher::with_transport(config.http.client_config(), transport));
        let cache: Arc<dyn ResponseCache> = Arc::new(DiskCache::new(config.cache_dir.clone(), None));
        let catalog = catalog_for(&config.upstream);
        let pool = db::connect(&config.database_url).await.expect("database");

        Self {
            upstream,
            pipeline: Pipeline::with_parts(config, pool, http, cache, catalog),
            dir,
        }
    }

    pub async fn rows(&self, feed: FeedType) -> i64 {
        self.pipeline.writer().row_count(feed).await.expect("row count")
    }
}
