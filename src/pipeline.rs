//! # Update Pipeline
//!
//! Ingests one ping at a time:
//!
//! 1. validate the payload (nothing is read or written on rejection)
//! 2. take the device's lock
//! 3. load the prior record
//! 4. classify motion against it
//! 5. refresh place-label caches for the new state
//! 6. upsert the record
//!
//! and acknowledges with an adaptive-reporting hint: report more often and more
//! precisely while moving, less often while stationary.
//!
//! Payload field names follow the tracker clients in the wild: `device`/`tid`
//! for the id, and OwnTracks' `vel`, `cog`, `batt`, `tst` for speed, heading,
//! battery and timestamp.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cache::{CacheManager, CacheRefresh};
use crate::motion::{classify, MotionConfig, MotionObservation};
use crate::store::{DeviceLocks, DeviceStore};
use crate::{
    normalize_device_id, now_epoch_secs, DevicePosition, GpsPoint, MotionState, Result,
    ValidationError,
};

/// One raw location report, as received from a client.
///
/// Every field is optional at the type level; [`Ping::validate`] enforces which
/// ones are required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Alternate id field used by generic clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// OwnTracks tracker id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    /// km/h
    #[serde(default, alias = "vel")]
    pub speed: Option<f64>,
    /// Degrees clockwise from north
    #[serde(default, alias = "cog")]
    pub heading: Option<f64>,
    /// Percent
    #[serde(default, alias = "batt")]
    pub battery: Option<f64>,
    /// Epoch seconds
    #[serde(default, alias = "tst")]
    pub timestamp: Option<i64>,
}

/// A ping that passed validation, with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPing {
    /// Trimmed, lower-cased
    pub device_id: String,
    pub point: GpsPoint,
    pub speed_kmh: f64,
    pub heading: Option<f64>,
    pub battery_pct: Option<u8>,
    pub timestamp: i64,
}

/// Ingestion limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// How far ahead of the server clock a ping timestamp may be (seconds).
    /// Anything later, e.g. milliseconds sent as seconds, is rejected. Default: 300
    pub max_future_skew_secs: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_future_skew_secs: 300,
        }
    }
}

impl Ping {
    /// [`Ping::validate_with`] using the default [`IngestConfig`].
    pub fn validate(&self, now: i64) -> std::result::Result<ValidatedPing, ValidationError> {
        self.validate_with(now, &IngestConfig::default())
    }

    /// Check required fields and ranges; fill defaults (speed 0, battery unknown,
    /// timestamp `now`).
    ///
    /// A timestamp must be positive and no later than `now + max_future_skew_secs`;
    /// an accepted far-future timestamp would make every later ping look stale.
    pub fn validate_with(
        &self,
        now: i64,
        config: &IngestConfig,
    ) -> std::result::Result<ValidatedPing, ValidationError> {
        let device_id = [&self.device_id, &self.device, &self.tid]
            .into_iter()
            .flatten()
            .map(|id| normalize_device_id(id))
            .find(|id| !id.is_empty())
            .ok_or(ValidationError::MissingField("device_id"))?;

        let lat = self.lat.ok_or(ValidationError::MissingField("lat"))?;
        let lon = self.lon.ok_or(ValidationError::MissingField("lon"))?;
        let point = GpsPoint::new(lat, lon);
        if !point.is_valid() {
            return Err(ValidationError::InvalidCoordinates { lat, lon });
        }

        let speed_kmh = self.speed.unwrap_or(0.0);
        if !speed_kmh.is_finite() || speed_kmh < 0.0 {
            return Err(ValidationError::InvalidSpeed(speed_kmh));
        }

        let heading = self.heading.filter(|h| h.is_finite());

        let battery_pct = self
            .battery
            .filter(|b| b.is_finite() && *b >= 0.0)
            .map(|b| b.round().min(100.0) as u8);

        let timestamp = self.timestamp.unwrap_or(now);
        if timestamp <= 0 || timestamp > now.saturating_add(config.max_future_skew_secs) {
            return Err(ValidationError::InvalidTimestamp(timestamp));
        }

        Ok(ValidatedPing {
            device_id,
            point,
            speed_kmh,
            heading,
            battery_pct,
            timestamp,
        })
    }
}

/// Reporting parameters the client should apply to its next report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReportingHint {
    /// Seconds between reports
    pub interval_secs: u32,
    /// Desired positional accuracy (meters)
    pub accuracy_m: u32,
    /// Seconds after which the client should report even without movement
    pub keepalive_secs: u32,
}

/// Hints handed out per motion state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    /// Default: 30s interval, 10m accuracy, 60s keep-alive
    pub moving: ReportingHint,
    /// Default: 300s interval, 100m accuracy, 900s keep-alive
    pub stationary: ReportingHint,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            moving: ReportingHint {
                interval_secs: 30,
                accuracy_m: 10,
                keepalive_secs: 60,
            },
            stationary: ReportingHint {
                interval_secs: 300,
                accuracy_m: 100,
                keepalive_secs: 900,
            },
        }
    }
}

impl ReportingConfig {
    pub fn hint_for(&self, state: MotionState) -> ReportingHint {
        match state {
            MotionState::Moving => self.moving,
            MotionState::Stationary => self.stationary,
        }
    }
}

/// Acknowledgement returned for an ingested ping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingAck {
    pub device_id: String,
    pub motion_state: MotionState,
    /// Fused velocity in m/s
    pub velocity_ms: f64,
    /// The state changed on this ping
    pub transitioned: bool,
    /// False for duplicate or out-of-order pings, which leave the record untouched
    pub applied: bool,
    pub hint: ReportingHint,
}

/// Owns all writes to the device store.
pub struct UpdatePipeline {
    store: Arc<dyn DeviceStore>,
    caches: CacheManager,
    locks: DeviceLocks,
    motion: MotionConfig,
    reporting: ReportingConfig,
    ingest: IngestConfig,
}

impl UpdatePipeline {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        caches: CacheManager,
        motion: MotionConfig,
        reporting: ReportingConfig,
    ) -> Self {
        Self {
            store,
            caches,
            locks: DeviceLocks::new(),
            motion,
            reporting,
            ingest: IngestConfig::default(),
        }
    }

    pub fn with_ingest_config(mut self, ingest: IngestConfig) -> Self {
        self.ingest = ingest;
        self
    }

    /// Validate and apply one ping.
    pub fn ingest(&self, ping: Ping) -> Result<PingAck> {
        let ping = ping.validate_with(now_epoch_secs(), &self.ingest).map_err(|e| {
            warn!("[UpdatePipeline] Rejected ping: {}", e);
            e
        })?;
        self.apply(ping)
    }

    /// Parse a JSON payload and apply it.
    pub fn ingest_json(&self, json: &str) -> Result<PingAck> {
        let ping: Ping = serde_json::from_str(json).map_err(|e| {
            warn!("[UpdatePipeline] Malformed payload: {}", e);
            ValidationError::Malformed(e.to_string())
        })?;
        self.ingest(ping)
    }

    /// Apply many pings. Pings for different devices run in parallel when the
    /// `parallel` feature is on; pings for one device are still serialized, and
    /// any that arrive behind a newer one are reported as not applied.
    pub fn ingest_batch(&self, pings: Vec<Ping>) -> Vec<Result<PingAck>> {
        #[cfg(feature = "parallel")]
        let results = {
            use rayon::prelude::*;
            pings.into_par_iter().map(|ping| self.ingest(ping)).collect()
        };

        #[cfg(not(feature = "parallel"))]
        let results = pings.into_iter().map(|ping| self.ingest(ping)).collect();

        results
    }

    /// Apply an already validated ping.
    pub fn apply(&self, ping: ValidatedPing) -> Result<PingAck> {
        let device_id = ping.device_id.clone();
        self.locks.with_lock(&device_id, || self.apply_locked(ping))
    }

    fn apply_locked(&self, ping: ValidatedPing) -> Result<PingAck> {
        let prior = self.store.get(&ping.device_id).map_err(|e| {
            warn!("[UpdatePipeline] {} store read failed: {}", ping.device_id, e);
            e
        })?;

        let obs = MotionObservation {
            point: ping.point,
            timestamp: ping.timestamp,
            reported_kmh: ping.speed_kmh,
            reported_heading: ping.heading,
        };
        let outcome = classify(prior.as_ref(), &obs, &self.motion);

        if outcome.stale {
            debug!(
                "[UpdatePipeline] {} stale ping (dt={}s), record left untouched",
                ping.device_id, outcome.dt_secs
            );
            return Ok(PingAck {
                device_id: ping.device_id,
                motion_state: outcome.motion_state,
                velocity_ms: outcome.velocity_ms,
                transitioned: false,
                applied: false,
                hint: self.reporting.hint_for(outcome.motion_state),
            });
        }

        let mut record = prior.unwrap_or_else(|| {
            info!("[UpdatePipeline] New device {}", ping.device_id);
            DevicePosition::new(&ping.device_id, ping.point, ping.timestamp)
        });
        record.latitude = ping.point.latitude;
        record.longitude = ping.point.longitude;
        record.velocity_ms = outcome.velocity_ms;
        record.heading_deg = outcome.heading_deg;
        record.battery_pct = ping.battery_pct;
        record.updated_at = ping.timestamp;
        record.motion_state = outcome.motion_state;

        let CacheRefresh { street, poi } = self.caches.refresh(&mut record);
        debug!("[UpdatePipeline] {} caches: street={:?} poi={:?}", record.device_id, street, poi);

        self.store.upsert(&record).map_err(|e| {
            warn!("[UpdatePipeline] {} store write failed: {}", record.device_id, e);
            e
        })?;

        if outcome.transitioned {
            info!(
                "[UpdatePipeline] {} is now {} ({:.1} km/h, {:.0}m in {}s)",
                record.device_id,
                record.motion_state,
                record.speed_kmh(),
                outcome.distance_m,
                outcome.dt_secs
            );
        }

        Ok(PingAck {
            device_id: record.device_id,
            motion_state: outcome.motion_state,
            velocity_ms: outcome.velocity_ms,
            transitioned: outcome.transitioned,
            applied: true,
            hint: self.reporting.hint_for(outcome.motion_state),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, NoopResolver, PoiFinder, ReverseGeocoder};
    use crate::geo_utils::destination;
    use crate::store::MemoryStore;
    use crate::TrackerError;

    const T0: i64 = 1_700_000_000;

    struct FailingStore;

    impl DeviceStore for FailingStore {
        fn get(&self, _device_id: &str) -> Result<Option<DevicePosition>> {
            Err(TrackerError::Store("backend unavailable".to_string()))
        }

        fn upsert(&self, _record: &DevicePosition) -> Result<()> {
            Err(TrackerError::Store("backend unavailable".to_string()))
        }
    }

    struct StreetOnly;

    impl ReverseGeocoder for StreetOnly {
        fn reverse_geocode(&self, _point: &GpsPoint) -> Option<String> {
            Some("Rua da Consolação".to_string())
        }
    }

    fn pipeline_with(
        store: Arc<dyn DeviceStore>,
        geocoder: Arc<dyn ReverseGeocoder>,
    ) -> UpdatePipeline {
        let poi: Arc<dyn PoiFinder> = Arc::new(NoopResolver);
        UpdatePipeline::new(
            store,
            CacheManager::new(geocoder, poi, CacheConfig::default()),
            MotionConfig::default(),
            ReportingConfig::default(),
        )
    }

    fn ping_at(device: &str, point: GpsPoint, speed: f64, timestamp: i64) -> Ping {
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
    fn test_validate_requires_device_and_coordinates() {
        let mut ping = Ping {
            lat: Some(1.0),
            lon: Some(2.0),
            ..Ping::default()
        };
        assert_eq!(ping.validate(T0), Err(ValidationError::MissingField("device_id")));

        ping.device_id = Some("   ".to_string());
        assert_eq!(ping.validate(T0), Err(ValidationError::MissingField("device_id")));

        ping.device_id = Some("alex".to_string());
        ping.lat = None;
        assert_eq!(ping.validate(T0), Err(ValidationError::MissingField("lat")));

        ping.lat = Some(1.0);
        ping.lon = None;
        assert_eq!(ping.validate(T0), Err(ValidationError::MissingField("lon")));
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let ping = Ping {
            device_id: Some("alex".to_string()),
            lat: Some(-91.0),
            lon: Some(2.0),
            ..Ping::default()
        };
        assert!(matches!(ping.validate(T0), Err(ValidationError::InvalidCoordinates { .. })));

        let ping = Ping {
            lat: Some(1.0),
            lon: Some(f64::INFINITY),
            ..ping
        };
        assert!(matches!(ping.validate(T0), Err(ValidationError::InvalidCoordinates { .. })));

        let ping = Ping {
            lon: Some(2.0),
            speed: Some(-4.0),
            ..ping
        };
        assert_eq!(ping.validate(T0), Err(ValidationError::InvalidSpeed(-4.0)));
    }

    #[test]
    fn test_validate_defaults_and_normalization() {
        let ping = Ping {
            tid: Some(" BR ".to_string()),
            lat: Some(1.0),
            lon: Some(2.0),
            battery: Some(140.0),
            ..Ping::default()
        };
        let valid = ping.validate(T0).unwrap();
        assert_eq!(valid.device_id, "br");
        assert_eq!(valid.speed_kmh, 0.0);
        assert_eq!(valid.heading, None);
        assert_eq!(valid.battery_pct, Some(100));
        assert_eq!(valid.timestamp, T0);
    }

    #[test]
    fn test_validate_id_precedence() {
        let ping = Ping {
            device_id: Some("primary".to_string()),
            device: Some("secondary".to_string()),
            tid: Some("tt".to_string()),
            lat: Some(1.0),
            lon: Some(2.0),
            ..Ping::default()
        };
        assert_eq!(ping.validate(T0).unwrap().device_id, "primary");
    }

    #[test]
    fn test_validate_rejects_bad_timestamps() {
        let ping = Ping {
            device_id: Some("alex".to_string()),
            lat: Some(1.0),
            lon: Some(2.0),
            ..Ping::default()
        };
        let at = |ts: i64| Ping {
            timestamp: Some(ts),
            ..ping.clone()
        };

        assert_eq!(at(0).validate(T0), Err(ValidationError::InvalidTimestamp(0)));
        assert_eq!(
            at(i64::MIN).validate(T0),
            Err(ValidationError::InvalidTimestamp(i64::MIN))
        );
        // Milliseconds instead of seconds
        assert_eq!(
            at(T0 * 1000).validate(T0),
            Err(ValidationError::InvalidTimestamp(T0 * 1000))
        );
        assert_eq!(at(i64::MAX).validate(T0), Err(ValidationError::InvalidTimestamp(i64::MAX)));

        // Small clock skew is tolerated
        assert_eq!(at(T0 + 300).validate(T0).unwrap().timestamp, T0 + 300);
        assert!(at(T0 + 301).validate(T0).is_err());

        let strict = IngestConfig {
            max_future_skew_secs: 0,
        };
        assert!(at(T0 + 1).validate_with(T0, &strict).is_err());
        assert!(at(T0).validate_with(T0, &strict).is_ok());
    }

    #[test]
    fn test_future_timestamp_does_not_freeze_device() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_with(store.clone(), Arc::new(NoopResolver));
        let start = GpsPoint::new(-23.5505, -46.6333);

        pipeline.ingest(ping_at("alex", start, 0.0, T0)).unwrap();
        let err = pipeline
            .ingest(ping_at("alex", start, 0.0, 1_700_000_000_000))
            .unwrap_err();
        assert!(matches!(
            err,
            TrackerError::Validation(ValidationError::InvalidTimestamp(_))
        ));

        let mut point = start;
        for i in 1..=10 {
            point = destination(&point, 0.0, 100.0);
            let ack = pipeline.ingest(ping_at("alex", point, 12.0, T0 + 60 * i)).unwrap();
            assert!(ack.applied);
        }
        let record = store.get("alex").unwrap().unwrap();
        assert_eq!(record.updated_at, T0 + 600);
        assert_eq!(record.point(), point);
    }

    #[test]
    fn test_extreme_timestamp_json_is_bad_request() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_with(store.clone(), Arc::new(NoopResolver));
        pipeline
            .ingest(ping_at("alex", GpsPoint::new(-23.5505, -46.6333), 0.0, T0))
            .unwrap();

        let err = pipeline
            .ingest_json(r#"{"tid":"alex","lat":-23.55,"lon":-46.63,"tst":-9223372036854775808}"#)
            .unwrap_err();
        assert!(err.is_bad_request());
        assert_eq!(store.get("alex").unwrap().unwrap().updated_at, T0);
    }

    #[test]
    fn test_negative_battery_is_unknown() {
        let ping = Ping {
            device: Some("alex".to_string()),
            lat: Some(1.0),
            lon: Some(2.0),
            battery: Some(-1.0),
            ..Ping::default()
        };
        assert_eq!(ping.validate(T0).unwrap().battery_pct, None);
    }

    #[test]
    fn test_rejected_ping_touches_nothing() {
        // A failing store would surface as Store error if it were touched
        let pipeline = pipeline_with(Arc::new(FailingStore), Arc::new(NoopResolver));
        let err = pipeline
            .ingest(Ping {
                device_id: Some("alex".to_string()),
                ..Ping::default()
            })
            .unwrap_err();
        assert!(err.is_bad_request());
    }

    #[test]
    fn test_store_failure_is_fatal_for_request() {
        let pipeline = pipeline_with(Arc::new(FailingStore), Arc::new(NoopResolver));
        let err = pipeline
            .ingest(ping_at("alex", GpsPoint::new(1.0, 2.0), 0.0, T0))
            .unwrap_err();
        assert!(matches!(err, TrackerError::Store(_)));
    }

    #[test]
    fn test_malformed_json_is_bad_request() {
        let pipeline = pipeline_with(Arc::new(MemoryStore::new()), Arc::new(NoopResolver));
        let err = pipeline.ingest_json("{\"lat\": ").unwrap_err();
        assert!(matches!(err, TrackerError::Validation(ValidationError::Malformed(_))));

        let err = pipeline.ingest_json(r#"{"lat": "north"}"#).unwrap_err();
        assert!(err.is_bad_request());
    }

    #[test]
    fn test_first_ping_creates_stationary_record() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_with(store.clone(), Arc::new(StreetOnly));

        let ack = pipeline
            .ingest(ping_at("Alex", GpsPoint::new(-23.5505, -46.6333), 0.0, T0))
            .unwrap();
        assert!(ack.applied);
        assert_eq!(ack.motion_state, MotionState::Stationary);
        assert_eq!(ack.hint, ReportingConfig::default().stationary);

        let record = store.get("alex").unwrap().unwrap();
        assert_eq!(record.motion_state(), MotionState::Stationary);
        assert_eq!(record.street_cache.as_deref(), Some("Rua da Consolação"));
        assert_eq!(record.street_cache_at, Some(T0));
        assert!(record.poi_cache.is_none());
    }

    #[test]
    fn test_transition_to_moving_changes_hint() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_with(store.clone(), Arc::new(NoopResolver));
        let start = GpsPoint::new(-23.5505, -46.6333);

        pipeline.ingest(ping_at("alex", start, 0.0, T0)).unwrap();
        let ack = pipeline
            .ingest(ping_at("alex", destination(&start, 0.0, 60.0), 0.0, T0 + 15))
            .unwrap();

        assert!(ack.transitioned);
        assert_eq!(ack.motion_state, MotionState::Moving);
        assert_eq!(ack.hint, ReportingConfig::default().moving);
        assert!(ack.hint.interval_secs < ReportingConfig::default().stationary.interval_secs);
    }

    #[test]
    fn test_out_of_order_ping_is_not_applied() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_with(store.clone(), Arc::new(NoopResolver));
        let start = GpsPoint::new(-23.5505, -46.6333);

        pipeline.ingest(ping_at("alex", start, 0.0, T0)).unwrap();
        let before = store.get("alex").unwrap().unwrap();

        let ack = pipeline
            .ingest(ping_at("alex", destination(&start, 0.0, 900.0), 90.0, T0 - 60))
            .unwrap();
        assert!(!ack.applied);
        assert_eq!(store.get("alex").unwrap().unwrap(), before);
    }

    #[test]
    fn test_cache_timestamps_never_exceed_updated_at() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_with(store.clone(), Arc::new(StreetOnly));
        let mut point = GpsPoint::new(-23.5505, -46.6333);

        for i in 0..10 {
            point = destination(&point, 45.0, 40.0 * i as f64);
            pipeline
                .ingest(ping_at("alex", point, 10.0 * i as f64, T0 + 20 * i))
                .unwrap();
            let record = store.get("alex").unwrap().unwrap();
            assert!(record.street_cache_at.unwrap() <= record.updated_at);
            if let Some(at) = record.poi_cache_at {
                assert!(at <= record.updated_at);
            }
        }
    }

    #[test]
    fn test_batch_processes_many_devices() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_with(store.clone(), Arc::new(NoopResolver));

        let pings: Vec<Ping> = (0..20)
            .map(|i| ping_at(&format!("device-{}", i), GpsPoint::new(10.0, i as f64), 0.0, T0))
            .chain(std::iter::once(Ping::default()))
            .collect();

        let results = pipeline.ingest_batch(pings);
        assert_eq!(results.len(), 21);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 20);
        assert!(results[20].as_ref().unwrap_err().is_bad_request());
        assert_eq!(store.len(), 20);
    }
}
