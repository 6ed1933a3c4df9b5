//! "Where is X" / "details on X" answers.
//!
//! Read-only: composes text from the stored record, the user's regions and the
//! cached labels. Motion is never recomputed here.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::geo_utils::compass_point;
use crate::regions::{select_label, PlaceLabel, RegionIndex};
use crate::store::{DeviceStore, RegionStore};
use crate::{normalize_device_id, now_epoch_secs, DevicePosition, GpsPoint, MotionState, Result};

/// One-line answer to "where is X".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub motion_state: MotionState,
    pub label: PlaceLabel,
    /// e.g. "alex is passing near Avenida Paulista"
    pub text: String,
}

/// Longer answer to "details on X".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDetails {
    pub status: DeviceStatus,
    pub point: GpsPoint,
    pub updated_at: i64,
    /// Seconds since the last accepted ping (never negative)
    pub elapsed_secs: i64,
    /// "now", "N minutes" or "N hours and M minutes"
    pub elapsed_text: String,
    pub battery_pct: Option<u8>,
    /// Only while moving
    pub speed_kmh: Option<f64>,
    /// Only while moving; one of 8 compass points
    pub compass_heading: Option<String>,
    /// Stationary outside every known region
    pub should_prompt_region_save: bool,
    pub text: String,
}

/// Text for a device that has never reported.
pub fn not_found_message(device_id: &str) -> String {
    format!("I don't have a location for {} yet", normalize_device_id(device_id))
}

/// Bucket an elapsed time for speech.
pub fn elapsed_text(elapsed_secs: i64) -> String {
    let minutes = elapsed_secs.max(0) / 60;
    if minutes == 0 {
        return "now".to_string();
    }
    if minutes < 60 {
        return plural(minutes, "minute");
    }
    format!("{} and {}", plural(minutes / 60, "hour"), plural(minutes % 60, "minute"))
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", n, unit)
    }
}

/// Answers status queries from stored state.
pub struct QueryService {
    store: Arc<dyn DeviceStore>,
    regions: Arc<dyn RegionStore>,
}

impl QueryService {
    pub fn new(store: Arc<dyn DeviceStore>, regions: Arc<dyn RegionStore>) -> Self {
        Self { store, regions }
    }

    /// Raw stored record, if any.
    pub fn record(&self, device_id: &str) -> Result<Option<DevicePosition>> {
        self.store.get(&normalize_device_id(device_id))
    }

    /// `None` when the device never reported.
    pub fn where_is(&self, device_id: &str) -> Result<Option<DeviceStatus>> {
        let record = match self.record(device_id)? {
            Some(r) => r,
            None => return Ok(None),
        };
        let index = RegionIndex::new(self.regions.list()?);
        Ok(Some(status_for(&record, &index)))
    }

    pub fn details(&self, device_id: &str) -> Result<Option<DeviceDetails>> {
        self.details_at(device_id, now_epoch_secs())
    }

    /// Details with elapsed time measured against `now` (epoch seconds).
    pub fn details_at(&self, device_id: &str, now: i64) -> Result<Option<DeviceDetails>> {
        let record = match self.record(device_id)? {
            Some(r) => r,
            None => return Ok(None),
        };
        let index = RegionIndex::new(self.regions.list()?);
        let status = status_for(&record, &index);

        let elapsed_secs = now.saturating_sub(record.updated_at).max(0);
        let elapsed = elapsed_text(elapsed_secs);
        let moving = record.motion_state().is_moving();
        let speed_kmh = moving.then(|| record.speed_kmh().round());
        let compass_heading = moving.then(|| compass_point(record.heading_deg).to_string());
        let should_prompt_region_save = !moving && !index.contains(&record.point());

        let mut text = status.text.clone();
        if elapsed_secs < 60 {
            text.push_str(", updated just now.");
        } else {
            text.push_str(&format!(", updated {} ago.", elapsed));
        }
        match record.battery_pct {
            Some(b) => text.push_str(&format!(" Battery {}%.", b)),
            None => text.push_str(" Battery unknown."),
        }
        if let (Some(speed), Some(compass)) = (speed_kmh, &compass_heading) {
            text.push_str(&format!(" Moving at {:.0} km/h heading {}.", speed, compass));
        }

        Ok(Some(DeviceDetails {
            status,
            point: record.point(),
            updated_at: record.updated_at,
            elapsed_secs,
            elapsed_text: elapsed,
            battery_pct: record.battery_pct,
            speed_kmh,
            compass_heading,
            should_prompt_region_save,
            text,
        }))
    }
}

fn status_for(record: &DevicePosition, index: &RegionIndex) -> DeviceStatus {
    let matching = index.containing(&record.point());
    let label = select_label(&matching, record);
    let verb = match record.motion_state() {
        MotionState::Stationary => "stationary",
        MotionState::Moving => "passing",
    };
    DeviceStatus {
        device_id: record.device_id.clone(),
        motion_state: record.motion_state(),
        text: format!("{} is {} near {}", record.device_id, verb, label.text),
        label,
    }
}
