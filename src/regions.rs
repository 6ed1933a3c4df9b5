//! Named-region containment and label selection.
//!
//! Regions are indexed in an R-tree by the bounding box of their circle, so a
//! point lookup only runs the exact haversine test against nearby candidates.

use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::geo_utils::{distance_m, meters_to_degrees};
use crate::{DevicePosition, GpsPoint, Region};

/// Label used when neither a region nor a cache has anything to say.
pub const FALLBACK_LABEL: &str = "this area";

// Envelopes are padded so the degree approximation never clips a circle.
const ENVELOPE_MARGIN: f64 = 1.05;

/// Where a label came from, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelSource {
    Region,
    Poi,
    Street,
    Fallback,
}

/// The label chosen for a device's position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceLabel {
    pub text: String,
    pub source: LabelSource,
}

/// Bounding box of one region's circle (used for R-tree indexing).
#[derive(Debug, Clone)]
struct RegionEnvelope {
    idx: usize,
    min_lat: f64,
    max_lat: f64,
    min_lng: f64,
    max_lng: f64,
}

impl RegionEnvelope {
    fn from_region(idx: usize, region: &Region) -> Self {
        let lat_pad = region.radius_m / 111_320.0 * ENVELOPE_MARGIN;
        // Near the poles or across the antimeridian, span every longitude
        let (min_lng, max_lng) = if region.latitude.abs() > 80.0 {
            (-180.0, 180.0)
        } else {
            let lng_pad = meters_to_degrees(region.radius_m, region.latitude) * ENVELOPE_MARGIN;
            let (lo, hi) = (region.longitude - lng_pad, region.longitude + lng_pad);
            if lo < -180.0 || hi > 180.0 {
                (-180.0, 180.0)
            } else {
                (lo, hi)
            }
        };

        Self {
            idx,
            min_lat: (region.latitude - lat_pad).max(-90.0),
            max_lat: (region.latitude + lat_pad).min(90.0),
            min_lng,
            max_lng,
        }
    }
}

impl RTreeObject for RegionEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners([self.min_lng, self.min_lat], [self.max_lng, self.max_lat])
    }
}

/// Spatial index over a snapshot of the user's regions.
pub struct RegionIndex {
    regions: Vec<Region>,
    tree: RTree<RegionEnvelope>,
}

impl RegionIndex {
    pub fn new(regions: Vec<Region>) -> Self {
        let envelopes: Vec<RegionEnvelope> = regions
            .iter()
            .enumerate()
            .map(|(idx, region)| RegionEnvelope::from_region(idx, region))
            .collect();
        let tree = RTree::bulk_load(envelopes);
        Self { regions, tree }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Every region whose circle contains `point`, smallest radius first.
    ///
    /// A point exactly on the boundary counts as inside.
    ///
    /// # Example
    /// ```
    /// use location_tracker::{GpsPoint, Region, RegionIndex};
    ///
    /// let index = RegionIndex::new(vec![
    ///     Region::new("Home", -23.5505, -46.6333, 100.0),
    ///     Region::new("Downtown", -23.5480, -46.6350, 2000.0),
    /// ]);
    /// let names: Vec<&str> = index
    ///     .containing(&GpsPoint::new(-23.5507, -46.6331))
    ///     .iter()
    ///     .map(|r| r.name.as_str())
    ///     .collect();
    /// assert_eq!(names, vec!["Home", "Downtown"]);
    /// ```
    pub fn containing(&self, point: &GpsPoint) -> Vec<&Region> {
        let query = AABB::from_point([point.longitude, point.latitude]);
        let mut hits: Vec<&Region> = self
            .tree
            .locate_in_envelope_intersecting(&query)
            .map(|env| &self.regions[env.idx])
            .filter(|region| distance_m(&region.center(), point) <= region.radius_m)
            .collect();

        hits.sort_by(|a, b| {
            a.radius_m
                .total_cmp(&b.radius_m)
                .then_with(|| a.name.cmp(&b.name))
        });
        hits
    }

    /// True when any region contains `point`.
    pub fn contains(&self, point: &GpsPoint) -> bool {
        !self.containing(point).is_empty()
    }
}

/// Pick the best label for a device.
///
/// Priority: matching region (most specific first) > POI cache (only while
/// moving) > street cache > [`FALLBACK_LABEL`].
pub fn select_label(matching: &[&Region], record: &DevicePosition) -> PlaceLabel {
    if let Some(region) = matching.first() {
        return PlaceLabel {
            text: region.name.clone(),
            source: LabelSource::Region,
        };
    }

    if record.motion_state().is_moving() {
        if let Some(poi) = &record.poi_cache {
            return PlaceLabel {
                text: poi.clone(),
                source: LabelSource::Poi,
            };
        }
    }

    if let Some(street) = &record.street_cache {
        return PlaceLabel {
            text: street.clone(),
            source: LabelSource::Street,
        };
    }

    PlaceLabel {
        text: FALLBACK_LABEL.to_string(),
        source: LabelSource::Fallback,
    }
}
