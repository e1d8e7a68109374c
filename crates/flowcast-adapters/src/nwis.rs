//! USGS NWIS water services: site catalog (RDB) and IV/DV discharge (WaterML JSON).

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use flowcast_core::{FeedType, FetchItem, Measurement, Site, PARAM_DISCHARGE};
use flowcast_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{fan_out, json_at, json_str, AdapterError, FeedResponse, ProbeOutcome, SiteCatalog, TimeSeriesSource};

pub const SOURCE_ID: &str = "usgs-nwis";

/// One parsed RDB table: header names plus rows keyed by header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RdbTable {
    pub columns: Vec<String>,
    pub rows: Vec<HashMap<String, String>>,
}

/// Parse USGS tab-delimited RDB: `#` comments, a header row, a column-format row, data.
pub fn parse_rdb(text: &str) -> RdbTable {
    let mut lines = text
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.starts_with('#') && !line.trim().is_empty());

    let Some(header) = lines.next() else {
        return RdbTable::default();
    };
    let columns: Vec<String> = header.split('\t').map(|c| c.trim().to_string()).collect();
    // column widths/types, e.g. "5s\t15s"
    let _ = lines.next();

    let rows = lines
        .map(|line| {
            columns
                .iter()
                .cloned()
                .zip(line.split('\t').map(|v| v.trim().to_string()))
                .collect::<HashMap<_, _>>()
        })
        .collect();

    RdbTable { columns, rows }
}

fn cell<'a>(row: &'a HashMap<String, String>, column: &str) -> Option<&'a str> {
    row.get(column).map(String::as_str).filter(|v| !v.is_empty())
}

fn cell_f64(row: &HashMap<String, String>, column: &str) -> Option<f64> {
    cell(row, column)?.parse().ok()
}

fn feed_for_data_type(code: &str) -> Option<FeedType> {
    FeedType::ALL
        .into_iter()
        .find(|feed| feed.nwis_data_type() == Some(code))
}

/// Group series-catalog rows into sites; each `data_type_cd` row declares a feed.
pub fn sites_from_catalog(table: &RdbTable, region: &str) -> Vec<Site> {
    let mut sites: BTreeMap<String, Site> = BTreeMap::new();
    for row in &table.rows {
        let Some(site_no) = cell(row, "site_no") else {
            continue;
        };
        let site = sites.entry(site_no.to_string()).or_insert_with(|| {
            let mut site = Site::new(site_no, region);
            site.station_name = cell(row, "station_nm").map(str::to_string);
            site.latitude = cell_f64(row, "dec_lat_va");
            site.longitude = cell_f64(row, "dec_long_va");
            site.huc_code = cell(row, "huc_cd").map(str::to_string);
            site.drainage_area_sq_mi = cell_f64(row, "drain_area_va");
            site.altitude_ft = cell_f64(row, "alt_va");
            site
        });

        let parameter_matches = cell(row, "parm_cd").map_or(true, |p| p == PARAM_DISCHARGE);
        if let (true, Some(feed)) = (
            parameter_matches,
            cell(row, "data_type_cd").and_then(feed_for_data_type),
        ) {
            site.declared_feeds.insert(feed);
        }
    }
    sites.into_values().collect()
}

fn endpoint(base_url: &str, path: &str, params: &[(&str, String)]) -> Result<String, AdapterError> {
    let raw = format!("{}/{}", base_url.trim_end_matches('/'), path);
    Url::parse_with_params(&raw, params)
        .map(|url| url.to_string())
        .map_err(|err| AdapterError::InvalidRequest(format!("{raw}: {err}")))
}

#[derive(Debug, Clone)]
pub struct NwisCatalog {
    base_url: String,
}

impl NwisCatalog {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn catalog_url(&self, region: &str) -> Result<String, AdapterError> {
        endpoint(
            &self.base_url,
            "site/",
            &[
                ("format", "rdb".to_string()),
                ("huc", region.to_string()),
                ("siteType", "ST".to_string()),
                ("parameterCd", PARAM_DISCHARGE.to_string()),
                ("seriesCatalogOutput", "true".to_string()),
                ("outputDataTypeCd", "iv,dv".to_string()),
                ("siteStatus", "all".to_string()),
            ],
        )
    }
}

#[async_trait]
impl SiteCatalog for NwisCatalog {
    async fn sites_in_region(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        region: &str,
    ) -> Result<Vec<Site>, AdapterError> {
        let url = self.catalog_url(region)?;
        match http.fetch_bytes(run_id, SOURCE_ID, &url).await {
            Ok(resp) => {
                let table = parse_rdb(&String::from_utf8_lossy(&resp.body));
                let sites = sites_from_catalog(&table, region);
                debug!(region, rows = table.rows.len(), sites = sites.len(), "parsed site catalog");
                Ok(sites)
            }
            // NWIS answers 404 when a region has no matching sites.
            Err(FetchError::HttpStatus { status: 404, .. }) => Ok(Vec::new()),
            Err(err) => Err(AdapterError::Catalog {
                region: region.to_string(),
                message: err.to_string(),
            }),
        }
    }
}

/// Discharge for one NWIS service (`iv` or `dv`).
#[derive(Debug, Clone)]
pub struct NwisFeed {
    base_url: String,
    feed: FeedType,
}

impl NwisFeed {
    pub fn new(base_url: impl Into<String>, feed: FeedType) -> Self {
        Self {
            base_url: base_url.into(),
            feed,
        }
    }

    fn data_type(&self) -> &'static str {
        self.feed.nwis_data_type().unwrap_or("iv")
    }

    pub fn probe_url(&self, site_id: &str) -> Result<String, AdapterError> {
        endpoint(
            &self.base_url,
            "site/",
            &[
                ("format", "rdb".to_string()),
                ("sites", site_id.to_string()),
                ("parameterCd", PARAM_DISCHARGE.to_string()),
                ("seriesCatalogOutput", "true".to_string()),
                ("outputDataTypeCd", self.data_type().to_string()),
                ("siteStatus", "all".to_string()),
            ],
        )
    }
}

fn parse_nwis_datetime(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    // daily values come without an offset
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn parse_value(raw: &JsonValue, no_data: Option<f64>) -> Option<f64> {
    let value = match raw {
        JsonValue::String(text) => text.trim().parse::<f64>().ok()?,
        JsonValue::Number(n) => n.as_f64()?,
        _ => return None,
    };
    match no_data {
        Some(sentinel) if (value - sentinel).abs() < f64::EPSILON => None,
        _ if value <= -999_999.0 => None,
        _ => Some(value),
    }
}

/// Pull `(observed_at, Discharge)` points for `site_id` out of a WaterML JSON body.
///
/// `None` means the body is not a WaterML time-series document at all.
pub fn decode_waterml(body: &[u8], site_id: &str) -> Option<Vec<(DateTime<Utc>, Measurement)>> {
    let doc: JsonValue = serde_json::from_slice(body).ok()?;
    let series = json_at(&doc, &["value", "timeSeries"])?.as_array()?;

    let mut points: BTreeMap<DateTime<Utc>, Measurement> = BTreeMap::new();
    for ts in series {
        let code = ts
            .get("sourceInfo")
            .and_then(|info| info.get("siteCode"))
            .and_then(|codes| codes.get(0))
            .and_then(|code| json_str(code, &["value"]));
        if code != Some(site_id) {
            continue;
        }
        let variable = ts
            .get("variable")
            .and_then(|v| v.get("variableCode"))
            .and_then(|codes| codes.get(0))
            .and_then(|code| json_str(code, &["value"]));
        if variable.is_some_and(|v| v != PARAM_DISCHARGE) {
            continue;
        }
        let no_data = json_at(ts, &["variable", "noDataValue"]).and_then(JsonValue::as_f64);

        for block in ts.get("values").and_then(JsonValue::as_array).into_iter().flatten() {
            for point in block.get("value").and_then(JsonValue::as_array).into_iter().flatten() {
                let Some(observed_at) = json_str(point, &["dateTime"]).and_then(parse_nwis_datetime) else {
                    continue;
                };
                let qualifiers = point
                    .get("qualifiers")
                    .and_then(JsonValue::as_array)
                    .map(|qs| {
                        qs.iter()
                            .filter_map(JsonValue::as_str)
                            .collect::<Vec<_>>()
                            .join(",")
                    })
                    .filter(|q| !q.is_empty());
                let cfs = point.get("value").and_then(|raw| parse_value(raw, no_data));
                points
                    .entry(observed_at)
                    .or_insert(Measurement::Discharge { cfs, qualifiers });
            }
        }
    }
    Some(points.into_iter().collect())
}

#[async_trait]
impl TimeSeriesSource for NwisFeed {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn feed(&self) -> FeedType {
        self.feed
    }

    fn request_url(&self, item: &FetchItem) -> Result<String, AdapterError> {
        let (start, end) = match self.feed {
            FeedType::StreamflowDaily => (
                item.range.start.format("%Y-%m-%d").to_string(),
                (item.range.end - Duration::days(1)).format("%Y-%m-%d").to_string(),
            ),
            _ => (
                item.range.start.format("%Y-%m-%dT%H:%MZ").to_string(),
                item.range.end.format("%Y-%m-%dT%H:%MZ").to_string(),
            ),
        };
        endpoint(
            &self.base_url,
            &format!("{}/", self.data_type()),
            &[
                ("format", "json".to_string()),
                ("sites", item.spatial_key.clone()),
                ("parameterCd", PARAM_DISCHARGE.to_string()),
                ("startDT", start),
                ("endDT", end),
                ("siteStatus", "all".to_string()),
            ],
        )
    }

    fn decode(&self, item: &FetchItem, body: &[u8], fetched_at: DateTime<Utc>) -> FeedResponse {
        match decode_waterml(body, &item.spatial_key) {
            Some(points) => FeedResponse::Records(fan_out(item, self.feed, points, fetched_at)),
            None => FeedResponse::Transient("response is not a WaterML time-series document".to_string()),
        }
    }

    fn classify_rejection(&self, status: u16, body: &[u8]) -> FeedResponse {
        let snippet: String = String::from_utf8_lossy(body).chars().take(160).collect();
        match status {
            400 | 404 => FeedResponse::NotSupported(format!(
                "{} discharge not available (http {status}): {}",
                self.data_type(),
                snippet.trim()
            )),
            _ => FeedResponse::Transient(format!("http {status}")),
        }
    }

    async fn probe(&self, http: &HttpFetcher, run_id: Uuid, site: &Site) -> ProbeOutcome {
        let url = match self.probe_url(&site.site_id) {
            Ok(url) => url,
            Err(err) => return ProbeOutcome::Failed(err.to_string()),
        };
        match http.fetch_bytes(run_id, SOURCE_ID, &url).await {
            Ok(resp) => {
                let table = parse_rdb(&String::from_utf8_lossy(&resp.body));
                let present = table.rows.iter().any(|row| {
                    cell(row, "site_no") == Some(site.site_id.as_str())
                        && cell(row, "data_type_cd").map_or(true, |code| code == self.data_type())
                });
                if present {
                    ProbeOutcome::Present
                } else {
                    ProbeOutcome::Absent
                }
            }
            Err(FetchError::HttpStatus { status: 404, .. }) => ProbeOutcome::Absent,
            Err(err) => {
                warn!(site_id = %site.site_id, feed = %self.feed, error = %err, "existence check failed");
                ProbeOutcome::Failed(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcast_core::TimeRange;

    const CATALOG: &str = "#\n# US Geological Survey\n#\n\
agency_cd\tsite_no\tstation_nm\tsite_tp_cd\tdec_lat_va\tdec_long_va\talt_va\thuc_cd\tdata_type_cd\tparm_cd\n\
5s\t15s\t50s\t7s\t16s\t16s\t8s\t16s\t2s\t5s\n\
USGS\t06800000\tMAPLE CREEK NEAR NICKERSON, NE\tST\t41.5597\t-96.5434\t1250.00\t10220003\tiv\t00060\n\
USGS\t06800000\tMAPLE CREEK NEAR NICKERSON, NE\tST\t41.5597\t-96.5434\t1250.00\t10220003\tdv\t00060\n\
USGS\t06800500\tELKHORN RIVER AT WATERLOO, NE\tST\t41.2933\t-96.2836\t\t10220003\tdv\t00060\n\
USGS\t06800500\tELKHORN RIVER AT WATERLOO, NE\tST\t41.2933\t-96.2836\t\t10220003\tqw\t00060\n";

    fn item(site: &str) -> FetchItem {
        FetchItem {
            spatial_key: site.to_string(),
            sites: vec![site.to_string()],
            latitude: None,
            longitude: None,
            range: TimeRange::new(
                Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap(),
            )
            .expect("range"),
        }
    }

    #[test]
    fn catalog_rows_group_into_sites_with_declared_feeds() {
        let sites = sites_from_catalog(&parse_rdb(CATALOG), "10");
        assert_eq!(sites.len(), 2);

        let maple = &sites[0];
        assert_eq!(maple.site_id, "06800000");
        assert_eq!(maple.region_code, "10");
        assert_eq!(maple.altitude_ft, Some(1250.0));
        assert!(maple.declares(FeedType::StreamflowInstant));
        assert!(maple.declares(FeedType::StreamflowDaily));

        let elkhorn = &sites[1];
        assert_eq!(elkhorn.altitude_ft, None);
        assert!(!elkhorn.declares(FeedType::StreamflowInstant));
        assert!(elkhorn.declares(FeedType::StreamflowDaily));
    }

    #[test]
    fn waterml_values_map_to_discharge_records_inside_range() {
        let body = serde_json::json!({
            "value": {"timeSeries": [{
                "sourceInfo": {"siteCode": [{"value": "06800000"}]},
                "variable": {"variableCode": [{"value": "00060"}], "noDataValue": -999999.0},
                "values": [{"value": [
                    {"value": "12.5", "qualifiers": ["P"], "dateTime": "2024-12-31T18:00:00.000-06:00"},
                    {"value": "-999999", "qualifiers": ["P", "Ice"], "dateTime": "2024-12-31T18:15:00.000-06:00"},
                    {"value": "13.0", "qualifiers": [], "dateTime": "2024-12-31T19:00:00.000-06:00"}
                ]}]
            }]}
        });
        let feed = NwisFeed::new("http://stub", FeedType::StreamflowInstant);
        let fetched_at = Utc::now();
        let FeedResponse::Records(records) =
            feed.decode(&item("06800000"), body.to_string().as_bytes(), fetched_at)
        else {
            panic!("expected records");
        };

        // 19:00 local is 01:00 UTC, the exclusive end
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].observed_at, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(
            records[0].measurement,
            Measurement::Discharge { cfs: Some(12.5), qualifiers: Some("P".to_string()) }
        );
        assert_eq!(
            records[1].measurement,
            Measurement::Discharge { cfs: None, qualifiers: Some("P,Ice".to_string()) }
        );
    }

    #[test]
    fn daily_datetimes_without_offset_parse_as_utc() {
        assert_eq!(
            parse_nwis_datetime("2025-01-01T00:00:00.000"),
            Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn missing_series_is_an_empty_success_and_garbage_is_transient() {
        let feed = NwisFeed::new("http://stub", FeedType::StreamflowInstant);
        let empty = br#"{"value":{"timeSeries":[]}}"#;
        assert_eq!(
            feed.decode(&item("06800000"), empty, Utc::now()),
            FeedResponse::Records(Vec::new())
        );
        assert!(matches!(
            feed.decode(&item("06800000"), b"<html>maintenance</html>", Utc::now()),
            FeedResponse::Transient(_)
        ));
    }

    #[test]
    fn rejections_split_permanent_from_transient() {
        let feed = NwisFeed::new("http://stub", FeedType::StreamflowDaily);
        assert!(matches!(
            feed.classify_rejection(404, b"No sites found matching all criteria"),
            FeedResponse::NotSupported(_)
        ));
        assert!(matches!(feed.classify_rejection(403, b""), FeedResponse::Transient(_)));
    }

    #[test]
    fn daily_requests_use_inclusive_dates() {
        let feed = NwisFeed::new("http://stub/nwis/", FeedType::StreamflowDaily);
        let mut daily = item("06800000");
        daily.range = TimeRange::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 8, 0, 0, 0).unwrap(),
        )
        .expect("range");
        let url = Url::parse(&feed.request_url(&daily).expect("url")).expect("parse");
        assert_eq!(url.path(), "/nwis/dv/");
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["startDT"], "2025-01-01");
        assert_eq!(params["endDT"], "2025-01-07");
        assert_eq!(params["sites"], "06800000");
    }
}
