//! # Location Tracker
//!
//! Last-known-position tracking for phone trackers (OwnTracks-style clients).
//!
//! This library provides:
//! - Ingestion of location pings with eager validation
//! - Stationary/moving classification with GPS-noise rejection
//! - TTL and distance gated place-label caches (street and point of interest)
//! - User-named circular regions for friendlier labels
//! - "Where is X" / "details on X" status text
//!
//! ## Features
//!
//! - **`parallel`** - Process ping batches in parallel with rayon
//! - **`http`** - Reverse geocoding (Nominatim) and POI lookup (Overpass) resolvers
//! - **`persistence`** - SQLite-backed device and region stores
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use location_tracker::{LocationTracker, Ping};
//!
//! let tracker = LocationTracker::in_memory();
//!
//! let ping = Ping {
//!     device_id: Some("Alex".to_string()),
//!     lat: Some(-23.5505),
//!     lon: Some(-46.6333),
//!     timestamp: Some(1_700_000_000),
//!     ..Ping::default()
//! };
//! let ack = tracker.ingest(ping).unwrap();
//! assert_eq!(ack.device_id, "alex");
//!
//! let status = tracker.where_is("alex").unwrap().unwrap();
//! assert_eq!(status.text, "alex is stationary near this area");
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

// Unified error handling
pub mod error;
pub use error::{Result, TrackerError, ValidationError};

// Geodesic primitives
pub mod geo_utils;

// Stationary/moving classification
pub mod motion;
pub use motion::{classify, MotionConfig, MotionObservation, MotionOutcome};

// Place-label cache policy and resolver interfaces
pub mod cache;
pub use cache::{
    CacheConfig, CacheManager, CacheRefresh, NoopResolver, PoiFinder, RefreshOutcome,
    RefreshReason, ReverseGeocoder,
};

// Named region containment and label selection
pub mod regions;
pub use regions::{select_label, LabelSource, PlaceLabel, RegionIndex, FALLBACK_LABEL};

// Store contracts and in-memory implementations
pub mod store;
pub use store::{DeviceLocks, DeviceStore, MemoryRegionStore, MemoryStore, RegionStore};

// Ping ingestion
pub mod pipeline;
pub use pipeline::{
    IngestConfig, Ping, PingAck, ReportingConfig, ReportingHint, UpdatePipeline, ValidatedPing,
};

// Status queries
pub mod query;
pub use query::{DeviceDetails, DeviceStatus, QueryService};

// HTTP resolvers for reverse geocoding and POI lookup
#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::{HttpResolver, HttpResolverConfig};

// SQLite persistence
#[cfg(feature = "persistence")]
pub mod persistence;

#[cfg(feature = "persistence")]
pub use persistence::SqliteStore;

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use location_tracker::GpsPoint;
/// let point = GpsPoint::new(-23.5505, -46.6333); // São Paulo
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Classifier output for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionState {
    #[default]
    Stationary,
    Moving,
}

impl MotionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MotionState::Stationary => "stationary",
            MotionState::Moving => "moving",
        }
    }

    pub fn is_moving(&self) -> bool {
        matches!(self, MotionState::Moving)
    }
}

impl std::fmt::Display for MotionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single last-known-state record kept per device.
///
/// Overwritten on every accepted ping; no history is retained. Cache timestamps
/// are never later than `updated_at`. The motion state is only written by the
/// update pipeline, from the classifier's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicePosition {
    /// Lower-cased, trimmed device identifier
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Fused velocity in m/s (>= 0)
    pub velocity_ms: f64,
    /// Heading in degrees, [0, 360)
    pub heading_deg: f64,
    /// Battery level 0-100, `None` when unknown
    pub battery_pct: Option<u8>,
    /// Epoch seconds of the last accepted ping
    pub updated_at: i64,
    pub(crate) motion_state: MotionState,

    pub street_cache: Option<String>,
    pub street_cache_at: Option<i64>,
    /// Where the street label was resolved
    pub street_cache_point: Option<GpsPoint>,

    pub poi_cache: Option<String>,
    pub poi_cache_at: Option<i64>,
    /// Heading at the time of POI resolution
    pub poi_cache_heading: Option<f64>,
    /// Where the POI label was resolved
    pub poi_cache_point: Option<GpsPoint>,
}

impl DevicePosition {
    /// Fresh record for a device seen for the first time: stationary, no caches.
    pub fn new(device_id: &str, point: GpsPoint, updated_at: i64) -> Self {
        Self {
            device_id: device_id.to_string(),
            latitude: point.latitude,
            longitude: point.longitude,
            velocity_ms: 0.0,
            heading_deg: 0.0,
            battery_pct: None,
            updated_at,
            motion_state: MotionState::Stationary,
            street_cache: None,
            street_cache_at: None,
            street_cache_point: None,
            poi_cache: None,
            poi_cache_at: None,
            poi_cache_heading: None,
            poi_cache_point: None,
        }
    }

    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }

    pub fn motion_state(&self) -> MotionState {
        self.motion_state
    }

    /// Velocity in km/h.
    pub fn speed_kmh(&self) -> f64 {
        self.velocity_ms * 3.6
    }
}

/// A user-named circular area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Radius in meters (> 0)
    pub radius_m: f64,
}

impl Region {
    pub fn new(name: &str, latitude: f64, longitude: f64, radius_m: f64) -> Self {
        Self {
            name: name.to_string(),
            latitude,
            longitude,
            radius_m,
        }
    }

    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }

    /// Check name, center and radius; returns the region with its name trimmed.
    pub fn validated(&self) -> std::result::Result<Region, ValidationError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(ValidationError::MissingField("name"));
        }
        if !self.center().is_valid() {
            return Err(ValidationError::InvalidCoordinates {
                lat: self.latitude,
                lon: self.longitude,
            });
        }
        if !self.radius_m.is_finite() || self.radius_m <= 0.0 {
            return Err(ValidationError::InvalidRadius(self.radius_m));
        }
        Ok(Region {
            name: name.to_string(),
            ..self.clone()
        })
    }
}

/// All tunables in one place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub motion: MotionConfig,
    pub cache: CacheConfig,
    pub reporting: ReportingConfig,
    pub ingest: IngestConfig,
}

impl TrackerConfig {
    /// Parse a (possibly partial) JSON override; absent fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ValidationError::Malformed(e.to_string()).into())
    }
}

// ============================================================================
// Facade
// ============================================================================

/// Wires stores, resolvers and config into an [`UpdatePipeline`] and a
/// [`QueryService`] sharing the same device store.
pub struct LocationTracker {
    pipeline: UpdatePipeline,
    queries: QueryService,
    regions: Arc<dyn RegionStore>,
}

impl LocationTracker {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        regions: Arc<dyn RegionStore>,
        geocoder: Arc<dyn ReverseGeocoder>,
        poi_finder: Arc<dyn PoiFinder>,
        config: TrackerConfig,
    ) -> Self {
        let caches = CacheManager::new(geocoder, poi_finder, config.cache.clone());
        let pipeline = UpdatePipeline::new(
            Arc::clone(&store),
            caches,
            config.motion.clone(),
            config.reporting.clone(),
        )
        .with_ingest_config(config.ingest.clone());
        let queries = QueryService::new(store, Arc::clone(&regions));
        Self {
            pipeline,
            queries,
            regions,
        }
    }

    /// In-memory stores, no resolvers, default config.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryRegionStore::new()),
            Arc::new(NoopResolver),
            Arc::new(NoopResolver),
            TrackerConfig::default(),
        )
    }

    pub fn ingest(&self, ping: Ping) -> Result<PingAck> {
        self.pipeline.ingest(ping)
    }

    pub fn ingest_json(&self, json: &str) -> Result<PingAck> {
        self.pipeline.ingest_json(json)
    }

    pub fn ingest_batch(&self, pings: Vec<Ping>) -> Vec<Result<PingAck>> {
        self.pipeline.ingest_batch(pings)
    }

    pub fn where_is(&self, device_id: &str) -> Result<Option<DeviceStatus>> {
        self.queries.where_is(device_id)
    }

    pub fn details(&self, device_id: &str) -> Result<Option<DeviceDetails>> {
        self.queries.details(device_id)
    }

    pub fn details_at(&self, device_id: &str, now: i64) -> Result<Option<DeviceDetails>> {
        self.queries.details_at(device_id, now)
    }

    /// Create or overwrite (by name) a region.
    pub fn save_region(&self, region: Region) -> Result<()> {
        let region = region.validated()?;
        self.regions.save(&region)?;
        log::info!(
            "[LocationTracker] Saved region '{}' ({:.5}, {:.5}) r={:.0}m",
            region.name,
            region.latitude,
            region.longitude,
            region.radius_m
        );
        Ok(())
    }

    /// All regions, sorted by name.
    pub fn list_regions(&self) -> Result<Vec<Region>> {
        let mut regions = self.regions.list()?;
        regions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(regions)
    }

    pub fn pipeline(&self) -> &UpdatePipeline {
        &self.pipeline
    }

    pub fn queries(&self) -> &QueryService {
        &self.queries
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Current wall-clock time in epoch seconds.
pub(crate) fn now_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Lower-case and trim a device id.
pub(crate) fn normalize_device_id(device_id: &str) -> String {
    device_id.trim().to_lowercase()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::{destination, distance_m};
    use std::sync::Mutex;

    const T0: i64 = 1_700_000_000;

    /// Resolver returning fixed labels and counting calls.
    struct FixedResolver {
        street: Option<String>,
        poi: Option<String>,
        calls: Mutex<(u32, u32)>,
    }

    impl FixedResolver {
        fn new(street: Option<&str>, poi: Option<&str>) -> Self {
            Self {
                street: street.map(|s| s.to_string()),
                poi: poi.map(|s| s.to_string()),
                calls: Mutex::new((0, 0)),
            }
        }
    }

    impl ReverseGeocoder for FixedResolver {
        fn reverse_geocode(&self, _point: &GpsPoint) -> Option<String> {
            self.calls.lock().unwrap().0 += 1;
            self.street.clone()
        }
    }

    impl PoiFinder for FixedResolver {
        fn find_poi_ahead(
            &self,
            _point: &GpsPoint,
            _heading: f64,
            _radius_m: f64,
        ) -> Option<String> {
            self.calls.lock().unwrap().1 += 1;
            self.poi.clone()
        }
    }

    fn tracker_with(resolver: Arc<FixedResolver>) -> LocationTracker {
        LocationTracker::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryRegionStore::new()),
            resolver.clone(),
            resolver,
            TrackerConfig::default(),
        )
    }

    fn ping(device: &str, point: GpsPoint, speed: f64, timestamp: i64) -> Ping {
        Ping {
            device_id: Some(device.to_string()),
            lat: Some(point.latitude),
            lon: Some(point.longitude),
            speed: Some(speed),
            timestamp: Some(timestamp),
            ..Ping::default()
        }
    }

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(51.5074, -0.1278).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, 181.0).is_valid());
        assert!(!GpsPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_region_validation() {
        assert!(Region::new("Home", -23.55, -46.63, 100.0).validated().is_ok());
        assert_eq!(
            Region::new("  ", -23.55, -46.63, 100.0).validated(),
            Err(ValidationError::MissingField("name"))
        );
        assert_eq!(
            Region::new("Home", -23.55, -46.63, 0.0).validated(),
            Err(ValidationError::InvalidRadius(0.0))
        );
        assert!(Region::new("Home", 95.0, -46.63, 10.0).validated().is_err());
        assert_eq!(
            Region::new(" Home ", -23.55, -46.63, 10.0).validated().unwrap().name,
            "Home"
        );
    }

    #[test]
    fn test_config_partial_json_override() {
        let config = TrackerConfig::from_json(r#"{"motion": {"start_distance_m": 75.0}}"#).unwrap();
        assert_eq!(config.motion.start_distance_m, 75.0);
        assert_eq!(config.motion.stop_distance_m, 20.0);
        assert_eq!(config.cache.street_ttl_secs, 900);
        assert_eq!(config.ingest.max_future_skew_secs, 300);
        assert!(TrackerConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_end_to_end_stationary_then_passing() {
        let resolver = Arc::new(FixedResolver::new(Some("Praça da Sé"), Some("Catedral da Sé")));
        let tracker = tracker_with(resolver);

        let start = GpsPoint::new(-23.5505, -46.6333);
        tracker.ingest(ping("alex", start, 0.0, T0)).unwrap();

        let status = tracker.where_is("alex").unwrap().unwrap();
        assert!(status.text.contains("stationary"), "{}", status.text);

        // 100s later, 60m away, reporting 20 km/h
        let moved = destination(&start, 45.0, 60.0);
        assert!((distance_m(&start, &moved) - 60.0).abs() < 0.5);
        tracker.ingest(ping("alex", moved, 20.0, T0 + 100)).unwrap();

        let status = tracker.where_is("alex").unwrap().unwrap();
        assert!(status.text.contains("passing"), "{}", status.text);

        let details = tracker.details_at("alex", T0 + 130).unwrap().unwrap();
        assert!(details.compass_heading.is_some());
        assert!(details.speed_kmh.unwrap() > 0.0);
        assert!(!details.should_prompt_region_save);
    }

    #[test]
    fn test_device_ids_are_case_insensitive() {
        let tracker = LocationTracker::in_memory();
        tracker
            .ingest(ping(" ALEX ", GpsPoint::new(-23.5505, -46.6333), 0.0, T0))
            .unwrap();
        assert!(tracker.where_is("Alex").unwrap().is_some());
        assert!(tracker.where_is("alex").unwrap().is_some());
    }

    #[test]
    fn test_unknown_device_is_not_found() {
        let tracker = LocationTracker::in_memory();
        assert!(tracker.where_is("nobody").unwrap().is_none());
        assert!(tracker.details("nobody").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_ping_is_idempotent() {
        let resolver = Arc::new(FixedResolver::new(Some("Rua Augusta"), Some("MASP")));
        let tracker = tracker_with(resolver.clone());

        let start = GpsPoint::new(-23.5505, -46.6333);
        tracker.ingest(ping("alex", start, 0.0, T0)).unwrap();
        let moved = destination(&start, 90.0, 200.0);
        tracker.ingest(ping("alex", moved, 30.0, T0 + 30)).unwrap();

        let before = tracker.queries().record("alex").unwrap().unwrap();
        let calls_before = *resolver.calls.lock().unwrap();

        let ack = tracker.ingest(ping("alex", moved, 30.0, T0 + 30)).unwrap();
        assert!(!ack.applied);

        let after = tracker.queries().record("alex").unwrap().unwrap();
        assert_eq!(before, after);
        assert_eq!(calls_before, *resolver.calls.lock().unwrap());
    }

    #[test]
    fn test_region_label_and_save_prompt() {
        let tracker = LocationTracker::in_memory();
        let home = GpsPoint::new(-23.5505, -46.6333);
        tracker.ingest(ping("alex", home, 0.0, T0)).unwrap();

        let details = tracker.details_at("alex", T0 + 10).unwrap().unwrap();
        assert!(details.should_prompt_region_save);

        tracker
            .save_region(Region::new("Home", home.latitude, home.longitude, 100.0))
            .unwrap();

        let status = tracker.where_is("alex").unwrap().unwrap();
        assert_eq!(status.text, "alex is stationary near Home");

        let details = tracker.details_at("alex", T0 + 10).unwrap().unwrap();
        assert!(!details.should_prompt_region_save);
    }

    #[test]
    fn test_save_region_overwrites_by_name() {
        let tracker = LocationTracker::in_memory();
        tracker.save_region(Region::new("Work", -23.56, -46.65, 50.0)).unwrap();
        tracker.save_region(Region::new("Home", -23.55, -46.63, 80.0)).unwrap();
        tracker.save_region(Region::new("Work", -23.57, -46.66, 120.0)).unwrap();

        let regions = tracker.list_regions().unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].name, "Home");
        assert_eq!(regions[1].name, "Work");
        assert_eq!(regions[1].radius_m, 120.0);
    }

    #[test]
    fn test_save_region_rejects_invalid() {
        let tracker = LocationTracker::in_memory();
        let err = tracker
            .save_region(Region::new("Bad", -23.55, -46.63, -5.0))
            .unwrap_err();
        assert!(err.is_bad_request());
        assert!(tracker.list_regions().unwrap().is_empty());
    }

    #[test]
    fn test_ingest_json_owntracks_payload() {
        let tracker = LocationTracker::in_memory();
        let ack = tracker
            .ingest_json(
                r#"{"_type":"location","tid":"BR","lat":-23.5505,"lon":-46.6333,"vel":0,"cog":270,"batt":77,"tst":1700000000}"#,
            )
            .unwrap();
        assert_eq!(ack.device_id, "br");

        let record = tracker.queries().record("br").unwrap().unwrap();
        assert_eq!(record.battery_pct, Some(77));
        assert_eq!(record.heading_deg, 270.0);
        assert_eq!(record.updated_at, 1_700_000_000);
    }
}
