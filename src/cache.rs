//! Place-label cache policy.
//!
//! Each device record carries two independently gated caches:
//! - **street**: reverse-geocoded address, refreshed when missing, after moving
//!   more than 50m from where it was resolved, or when older than 15 minutes;
//! - **POI**: landmark ahead of the device, only considered while moving, refreshed
//!   when missing, after 100m, after 5 minutes, or after a heading change of more
//!   than 30°.
//!
//! A refresh calls the resolver at most once per cache per update. A resolver
//! returning nothing leaves the cached value and its timestamp untouched.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::geo_utils::{angle_diff_deg, distance_m};
use crate::{DevicePosition, GpsPoint};

/// Resolves coordinates to a human-readable address.
///
/// Implementations must bound their own latency and never panic; `None` covers
/// both "nothing found" and "lookup failed".
pub trait ReverseGeocoder: Send + Sync {
    fn reverse_geocode(&self, point: &GpsPoint) -> Option<String>;
}

/// Finds a named landmark near `point`, preferably in the direction of travel.
///
/// Same failure contract as [`ReverseGeocoder`].
pub trait PoiFinder: Send + Sync {
    fn find_poi_ahead(&self, point: &GpsPoint, heading_deg: f64, radius_m: f64) -> Option<String>;
}

/// Resolver that never finds anything. Labels fall back to regions or "this area".
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResolver;

impl ReverseGeocoder for NoopResolver {
    fn reverse_geocode(&self, _point: &GpsPoint) -> Option<String> {
        None
    }
}

impl PoiFinder for NoopResolver {
    fn find_poi_ahead(
        &self,
        _point: &GpsPoint,
        _heading_deg: f64,
        _radius_m: f64,
    ) -> Option<String> {
        None
    }
}

/// Configuration for cache refresh gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Refresh the street label after moving more than this (meters). Default: 50
    pub street_refresh_distance_m: f64,
    /// Street label max age (seconds). Default: 900
    pub street_ttl_secs: i64,
    /// Refresh the POI label after moving more than this (meters). Default: 100
    pub poi_refresh_distance_m: f64,
    /// POI label max age (seconds). Default: 300
    pub poi_ttl_secs: i64,
    /// Refresh the POI label after turning more than this (degrees). Default: 30
    pub poi_heading_change_deg: f64,
    /// Search radius passed to the POI finder (meters). Default: 500
    pub poi_search_radius_m: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            street_refresh_distance_m: 50.0,
            street_ttl_secs: 900,
            poi_refresh_distance_m: 100.0,
            poi_ttl_secs: 300,
            poi_heading_change_deg: 30.0,
            poi_search_radius_m: 500.0,
        }
    }
}

/// Why a cache needs refreshing. The first matching condition is reported.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RefreshReason {
    /// No cached value yet
    Missing,
    /// Moved this many meters since the value was resolved
    Moved(f64),
    /// The value is this many seconds old
    Expired(i64),
    /// Heading changed this many degrees since the value was resolved
    Turned(f64),
}

/// What happened to one cache during an update.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// Still fresh, no resolver call
    Fresh,
    /// Not considered (POI cache while stationary)
    Skipped,
    /// Resolver returned a label; cache replaced
    Refreshed(RefreshReason),
    /// Resolver returned nothing; stale value kept
    Failed(RefreshReason),
}

impl RefreshOutcome {
    /// True when the resolver was called.
    pub fn called_resolver(&self) -> bool {
        matches!(self, RefreshOutcome::Refreshed(_) | RefreshOutcome::Failed(_))
    }
}

/// Outcome for both caches.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRefresh {
    pub street: RefreshOutcome,
    pub poi: RefreshOutcome,
}

/// Whether the street cache of `record` (already moved to its new position and
/// timestamp) needs refreshing.
pub fn street_refresh_reason(
    record: &DevicePosition,
    config: &CacheConfig,
) -> Option<RefreshReason> {
    let (cached_at, cached_point) = match (
        &record.street_cache,
        record.street_cache_at,
        record.street_cache_point,
    ) {
        (Some(_), Some(at), Some(point)) => (at, point),
        _ => return Some(RefreshReason::Missing),
    };

    let moved = distance_m(&cached_point, &record.point());
    if moved > config.street_refresh_distance_m {
        return Some(RefreshReason::Moved(moved));
    }

    let age = record.updated_at.saturating_sub(cached_at);
    if age > config.street_ttl_secs {
        return Some(RefreshReason::Expired(age));
    }

    None
}

/// Whether the POI cache of `record` needs refreshing. Always `None` while the
/// device is stationary.
pub fn poi_refresh_reason(record: &DevicePosition, config: &CacheConfig) -> Option<RefreshReason> {
    if !record.motion_state().is_moving() {
        return None;
    }

    let (cached_at, cached_point, cached_heading) = match (
        &record.poi_cache,
        record.poi_cache_at,
        record.poi_cache_point,
        record.poi_cache_heading,
    ) {
        (Some(_), Some(at), Some(point), Some(heading)) => (at, point, heading),
        _ => return Some(RefreshReason::Missing),
    };

    let moved = distance_m(&cached_point, &record.point());
    if moved > config.poi_refresh_distance_m {
        return Some(RefreshReason::Moved(moved));
    }

    let age = record.updated_at.saturating_sub(cached_at);
    if age > config.poi_ttl_secs {
        return Some(RefreshReason::Expired(age));
    }

    let turned = angle_diff_deg(record.heading_deg, cached_heading);
    if turned > config.poi_heading_change_deg {
        return Some(RefreshReason::Turned(turned));
    }

    None
}

/// Applies the refresh policy to a record using the injected resolvers.
pub struct CacheManager {
    geocoder: Arc<dyn ReverseGeocoder>,
    poi_finder: Arc<dyn PoiFinder>,
    config: CacheConfig,
}

impl CacheManager {
    pub fn new(
        geocoder: Arc<dyn ReverseGeocoder>,
        poi_finder: Arc<dyn PoiFinder>,
        config: CacheConfig,
    ) -> Self {
        Self {
            geocoder,
            poi_finder,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Refresh whichever caches are due. `record` must already carry the new
    /// position, heading, motion state and `updated_at`; refreshed caches are
    /// stamped with `updated_at`.
    pub fn refresh(&self, record: &mut DevicePosition) -> CacheRefresh {
        let street = match street_refresh_reason(record, &self.config) {
            None => RefreshOutcome::Fresh,
            Some(reason) => self.refresh_street(record, reason),
        };

        let poi = if !record.motion_state().is_moving() {
            RefreshOutcome::Skipped
        } else {
            match poi_refresh_reason(record, &self.config) {
                None => RefreshOutcome::Fresh,
                Some(reason) => self.refresh_poi(record, reason),
            }
        };

        CacheRefresh { street, poi }
    }

    fn refresh_street(&self, record: &mut DevicePosition, reason: RefreshReason) -> RefreshOutcome {
        let point = record.point();
        match non_empty(self.geocoder.reverse_geocode(&point)) {
            Some(label) => {
                debug!(
                    "[CacheManager] {} street cache refreshed ({:?}): {}",
                    record.device_id, reason, label
                );
                record.street_cache = Some(label);
                record.street_cache_at = Some(record.updated_at);
                record.street_cache_point = Some(point);
                RefreshOutcome::Refreshed(reason)
            }
            None => {
                warn!(
                    "[CacheManager] {} reverse geocode failed ({:?}), keeping {:?}",
                    record.device_id, reason, record.street_cache
                );
                RefreshOutcome::Failed(reason)
            }
        }
    }

    fn refresh_poi(&self, record: &mut DevicePosition, reason: RefreshReason) -> RefreshOutcome {
        let point = record.point();
        let heading = record.heading_deg;
        let radius_m = self.config.poi_search_radius_m;
        match non_empty(self.poi_finder.find_poi_ahead(&point, heading, radius_m)) {
            Some(label) => {
                debug!(
                    "[CacheManager] {} POI cache refreshed ({:?}): {}",
                    record.device_id, reason, label
                );
                record.poi_cache = Some(label);
                record.poi_cache_at = Some(record.updated_at);
                record.poi_cache_heading = Some(heading);
                record.poi_cache_point = Some(point);
                RefreshOutcome::Refreshed(reason)
            }
            None => {
                warn!(
                    "[CacheManager] {} POI lookup failed ({:?}), keeping {:?}",
                    record.device_id, reason, record.poi_cache
                );
                RefreshOutcome::Failed(reason)
            }
        }
    }
}

fn non_empty(label: Option<String>) -> Option<String> {
    label
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
