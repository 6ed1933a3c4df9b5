//! HTTP resolvers for place labels.
//!
//! - Reverse geocoding via a Nominatim-compatible `/reverse` endpoint
//! - Landmark lookup via an Overpass API interpreter, aimed ahead of the device
//!
//! The pipeline calls resolvers synchronously, so each call runs the async
//! request to completion on an internal tokio runtime, bounded by a timeout.
//! Every failure (timeout, HTTP status, bad JSON, empty result) is logged and
//! reported as `None`.
//!
//! Do not call these resolvers from inside an async task: blocking on the
//! internal runtime from another runtime's worker panics.

use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Runtime};

use crate::cache::{PoiFinder, ReverseGeocoder};
use crate::geo_utils::{angle_diff_deg, bearing_deg, destination, distance_m};
use crate::GpsPoint;

// Landmarks more than this far off the direction of travel are not "ahead"
const AHEAD_MAX_ANGLE_DEG: f64 = 60.0;
const POI_RESULT_LIMIT: u32 = 25;

/// Endpoints and timeouts for [`HttpResolver`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpResolverConfig {
    /// Base URL of a Nominatim-compatible service
    pub nominatim_url: String,
    /// Overpass interpreter URL
    pub overpass_url: String,
    /// Sent with every request (Nominatim's usage policy requires one)
    pub user_agent: String,
    /// Default: 10
    pub street_timeout_secs: u64,
    /// Default: 15
    pub poi_timeout_secs: u64,
}

impl Default for HttpResolverConfig {
    fn default() -> Self {
        Self {
            nominatim_url: "https://nominatim.openstreetmap.org".to_string(),
            overpass_url: "https://overpass-api.de/api/interpreter".to_string(),
            user_agent: concat!("location-tracker/", env!("CARGO_PKG_VERSION")).to_string(),
            street_timeout_secs: 10,
            poi_timeout_secs: 15,
        }
    }
}

/// Nominatim `/reverse?format=jsonv2` response (fields we use)
#[derive(Debug, Deserialize)]
struct ReverseResponse {
    display_name: Option<String>,
    address: Option<HashMap<String, String>>,
}

/// Overpass `[out:json]` response
#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<OverpassElement>,
}

#[derive(Debug, Deserialize)]
struct OverpassElement {
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

/// Reverse geocoder and POI finder over HTTP.
pub struct HttpResolver {
    client: Client,
    runtime: Runtime,
    config: HttpResolverConfig,
}

impl HttpResolver {
    pub fn new(config: HttpResolverConfig) -> Result<Self, String> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(Duration::from_secs(config.street_timeout_secs.max(config.poi_timeout_secs)))
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;

        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| format!("Failed to create tokio runtime: {}", e))?;

        info!(
            "[HttpResolver] Using {} (timeout {}s) and {} (timeout {}s)",
            config.nominatim_url,
            config.street_timeout_secs,
            config.overpass_url,
            config.poi_timeout_secs
        );

        Ok(Self {
            client,
            runtime,
            config,
        })
    }

    /// Run `fut` to completion, giving up after `secs`.
    fn block_on_with_timeout<T>(
        &self,
        what: &str,
        secs: u64,
        fut: impl Future<Output = Result<T, String>>,
    ) -> Option<T> {
        let start = Instant::now();
        let result = self
            .runtime
            .block_on(async { tokio::time::timeout(Duration::from_secs(secs), fut).await });

        match result {
            Ok(Ok(value)) => {
                debug!("[HttpResolver] {} done in {:?}", what, start.elapsed());
                Some(value)
            }
            Ok(Err(e)) => {
                warn!("[HttpResolver] {} failed after {:?}: {}", what, start.elapsed(), e);
                None
            }
            Err(_) => {
                warn!("[HttpResolver] {} timed out after {}s", what, secs);
                None
            }
        }
    }

    async fn fetch_reverse(&self, point: GpsPoint) -> Result<Option<String>, String> {
        let url = format!("{}/reverse", self.config.nominatim_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("format", "jsonv2".to_string()),
                ("lat", point.latitude.to_string()),
                ("lon", point.longitude.to_string()),
                ("zoom", "17".to_string()),
            ])
            .send()
            .await
            .map_err(|e| format!("Request error: {}", e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status));
        }

        let bytes = resp.bytes().await.map_err(|e| format!("Body download error: {}", e))?;
        let data: ReverseResponse =
            serde_json::from_slice(&bytes).map_err(|e| format!("JSON parse error: {}", e))?;
        Ok(street_label(&data))
    }

    async fn fetch_pois(
        &self,
        center: GpsPoint,
        radius_m: f64,
    ) -> Result<Vec<OverpassElement>, String> {
        let query = overpass_query(&center, radius_m);
        let resp = self
            .client
            .post(&self.config.overpass_url)
            .form(&[("data", query)])
            .send()
            .await
            .map_err(|e| format!("Request error: {}", e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status));
        }

        let bytes = resp.bytes().await.map_err(|e| format!("Body download error: {}", e))?;
        let data: OverpassResponse =
            serde_json::from_slice(&bytes).map_err(|e| format!("JSON parse error: {}", e))?;
        Ok(data.elements)
    }
}

impl ReverseGeocoder for HttpResolver {
    fn reverse_geocode(&self, point: &GpsPoint) -> Option<String> {
        let point = *point;
        self.block_on_with_timeout(
            "reverse geocode",
            self.config.street_timeout_secs,
            self.fetch_reverse(point),
        )
        .flatten()
    }
}

impl PoiFinder for HttpResolver {
    fn find_poi_ahead(&self, point: &GpsPoint, heading_deg: f64, radius_m: f64) -> Option<String> {
        // Search around a point half a radius ahead, so the circle leans forward
        let center = destination(point, heading_deg, radius_m / 2.0);
        let elements = self.block_on_with_timeout(
            "POI lookup",
            self.config.poi_timeout_secs,
            self.fetch_pois(center, radius_m),
        )?;
        pick_poi_ahead(&elements, point, heading_deg)
    }
}

/// "Road, Suburb" when the address has them, else the first two parts of the
/// display name.
fn street_label(data: &ReverseResponse) -> Option<String> {
    if let Some(address) = &data.address {
        let road = ["road", "pedestrian", "footway", "path"]
            .iter()
            .find_map(|k| address.get(*k));
        let area = [
            "suburb",
            "neighbourhood",
            "quarter",
            "city_district",
            "city",
            "town",
            "village",
        ]
        .iter()
        .find_map(|k| address.get(*k));
        match (road, area) {
            (Some(r), Some(a)) => return Some(format!("{}, {}", r, a)),
            (Some(r), None) => return Some(r.clone()),
            _ => {}
        }
    }

    let display = data.display_name.as_deref()?;
    let label = display
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .take(2)
        .collect::<Vec<_>>()
        .join(", ");
    if label.is_empty() {
        None
    } else {
        Some(label)
    }
}

fn overpass_query(center: &GpsPoint, radius_m: f64) -> String {
    let around = format!("around:{:.0},{:.6},{:.6}", radius_m, center.latitude, center.longitude);
    format!(
        "[out:json][timeout:10];(node({a})[name][amenity];node({a})[name][tourism];node({a})[name][shop];node({a})[name][leisure];);out body {limit};",
        a = around,
        limit = POI_RESULT_LIMIT
    )
}

/// Nearest named element in the direction of travel, or the nearest overall
/// when nothing lies ahead.
fn pick_poi_ahead(
    elements: &[OverpassElement],
    origin: &GpsPoint,
    heading_deg: f64,
) -> Option<String> {
    let candidates: Vec<(f64, bool, &str)> = elements
        .iter()
        .filter_map(|e| {
            let name = e.tags.get("name")?.trim();
            if name.is_empty() {
                return None;
            }
            let p = GpsPoint::new(e.lat?, e.lon?);
            let dist = distance_m(origin, &p);
            let ahead = angle_diff_deg(bearing_deg(origin, &p), heading_deg) <= AHEAD_MAX_ANGLE_DEG;
            Some((dist, ahead, name))
        })
        .collect();

    let nearest = |want_ahead: bool| {
        candidates
            .iter()
            .filter(|(_, ahead, _)| !want_ahead || *ahead)
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, _, name)| name.to_string())
    };

    nearest(true).or_else(|| nearest(false))
}
