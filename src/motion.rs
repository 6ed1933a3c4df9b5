//! # Motion Classification
//!
//! Two-state (`Stationary` / `Moving`) classifier driven by consecutive pings.
//!
//! ## Algorithm
//! 1. **GPS-jump rejection**: a short hop (< 80m) arriving within 5s that implies
//!    more than 15 km/h is sensor noise. Velocity is forced to zero and the prior
//!    heading is kept.
//! 2. **Velocity fusion**: the client's reported speed wins when plausible
//!    (5–160 km/h exclusive), then the speed computed from distance/time
//!    (< 160 km/h), otherwise zero.
//! 3. **Hysteresis transition**: distance AND time evidence first, with the
//!    instantaneous reported speed as an additional qualifying condition.
//!
//! Pings with `dt <= 0` (duplicates, out-of-order delivery) are marked stale and
//! leave state, velocity and heading at their prior values.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::geo_utils::{bearing_deg, distance_m, normalize_heading};
use crate::{DevicePosition, GpsPoint, MotionState};

const KMH_PER_MS: f64 = 3.6;

/// Thresholds for motion classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Hops shorter than this (meters) can be rejected as GPS jumps. Default: 80
    pub jump_max_distance_m: f64,
    /// Hops arriving faster than this (seconds) can be rejected as GPS jumps. Default: 5
    pub jump_max_dt_secs: i64,
    /// Implied speed above which a short, fast hop is a jump (km/h). Default: 15
    pub jump_min_implied_kmh: f64,
    /// Reported speed must exceed this to be trusted over the computed one (km/h). Default: 5
    pub reported_min_kmh: f64,
    /// Speeds at or above this are implausible for a tracked phone (km/h). Default: 160
    pub max_plausible_kmh: f64,
    /// Stationary → Moving needs at least this displacement (meters). Default: 50
    pub start_distance_m: f64,
    /// ...over at least this interval (seconds). Default: 10
    pub start_dt_secs: i64,
    /// ...or a reported speed at least this high (km/h). Default: 8
    pub start_speed_kmh: f64,
    /// Moving → Stationary needs displacement below this (meters). Default: 20
    pub stop_distance_m: f64,
    /// ...over at least this interval (seconds). Default: 90
    pub stop_dt_secs: i64,
    /// ...or a reported speed at most this (km/h). Default: 3
    pub stop_speed_kmh: f64,
    /// Pings without a heading get the track bearing once the hop is at least
    /// this long (meters). Shorter hops keep the prior heading. Default: 20
    pub heading_from_track_min_m: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            jump_max_distance_m: 80.0,
            jump_max_dt_secs: 5,
            jump_min_implied_kmh: 15.0,
            reported_min_kmh: 5.0,
            max_plausible_kmh: 160.0,
            start_distance_m: 50.0,
            start_dt_secs: 10,
            start_speed_kmh: 8.0,
            stop_distance_m: 20.0,
            stop_dt_secs: 90,
            stop_speed_kmh: 3.0,
            heading_from_track_min_m: 20.0,
        }
    }
}

/// One new position report, already validated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionObservation {
    pub point: GpsPoint,
    /// Epoch seconds
    pub timestamp: i64,
    /// Speed reported by the client in km/h (0 when the client sent none)
    pub reported_kmh: f64,
    /// Heading reported by the client, if any
    pub reported_heading: Option<f64>,
}

/// Result of classifying one observation against the prior record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionOutcome {
    pub motion_state: MotionState,
    /// Fused velocity in m/s
    pub velocity_ms: f64,
    pub heading_deg: f64,
    /// Seconds since the prior record (0 when there is none)
    pub dt_secs: i64,
    /// Meters from the prior record (0 when there is none)
    pub distance_m: f64,
    /// The hop was rejected as a GPS jump
    pub gps_jump: bool,
    /// The state changed on this observation
    pub transitioned: bool,
    /// `dt <= 0`: nothing was evaluated, prior values were carried over
    pub stale: bool,
}

/// Classify `obs` against the device's prior record.
///
/// The first ping of a device is always `Stationary` with the reported velocity
/// as-is.
///
/// # Example
/// ```
/// use location_tracker::motion::{classify, MotionConfig, MotionObservation};
/// use location_tracker::{GpsPoint, MotionState};
///
/// let obs = MotionObservation {
///     point: GpsPoint::new(-23.5505, -46.6333),
///     timestamp: 1_700_000_000,
///     reported_kmh: 0.0,
///     reported_heading: None,
/// };
/// let outcome = classify(None, &obs, &MotionConfig::default());
/// assert_eq!(outcome.motion_state, MotionState::Stationary);
/// ```
pub fn classify(
    prior: Option<&DevicePosition>,
    obs: &MotionObservation,
    config: &MotionConfig,
) -> MotionOutcome {
    let reported_kmh = obs.reported_kmh;

    let prior = match prior {
        Some(p) => p,
        None => {
            return MotionOutcome {
                motion_state: MotionState::Stationary,
                velocity_ms: reported_kmh.max(0.0) / KMH_PER_MS,
                heading_deg: obs.reported_heading.map_or(0.0, normalize_heading),
                dt_secs: 0,
                distance_m: 0.0,
                gps_jump: false,
                transitioned: false,
                stale: false,
            };
        }
    };

    let dt = obs.timestamp.saturating_sub(prior.updated_at);
    let dist = distance_m(&prior.point(), &obs.point);

    if dt <= 0 {
        return MotionOutcome {
            motion_state: prior.motion_state,
            velocity_ms: prior.velocity_ms,
            heading_deg: prior.heading_deg,
            dt_secs: dt,
            distance_m: dist,
            gps_jump: false,
            transitioned: false,
            stale: true,
        };
    }

    let computed_kmh = (dist / dt as f64) * KMH_PER_MS;

    // Step 1: GPS jump rejection
    let gps_jump = dist < config.jump_max_distance_m
        && dt < config.jump_max_dt_secs
        && computed_kmh > config.jump_min_implied_kmh;

    let (velocity_ms, heading_deg) = if gps_jump {
        (0.0, prior.heading_deg)
    } else {
        // Step 2: velocity fusion
        let fused_kmh = fuse_speed_kmh(reported_kmh, computed_kmh, config);
        let heading = match obs.reported_heading {
            Some(h) => normalize_heading(h),
            None if dist >= config.heading_from_track_min_m => {
                bearing_deg(&prior.point(), &obs.point)
            }
            None => prior.heading_deg,
        };
        (fused_kmh / KMH_PER_MS, heading)
    };

    // Step 3: state transition
    let motion_state = next_state(prior.motion_state, dist, dt, reported_kmh, config);
    let transitioned = motion_state != prior.motion_state;

    debug!(
        "[MotionClassifier] {} dt={}s dist={:.1}m reported={:.1}km/h computed={:.1}km/h jump={} {:?} -> {:?}",
        prior.device_id,
        dt,
        dist,
        reported_kmh,
        computed_kmh,
        gps_jump,
        prior.motion_state,
        motion_state
    );

    MotionOutcome {
        motion_state,
        velocity_ms,
        heading_deg,
        dt_secs: dt,
        distance_m: dist,
        gps_jump,
        transitioned,
        stale: false,
    }
}

/// Pick the speed to trust, in km/h.
fn fuse_speed_kmh(reported_kmh: f64, computed_kmh: f64, config: &MotionConfig) -> f64 {
    if reported_kmh > config.reported_min_kmh && reported_kmh < config.max_plausible_kmh {
        reported_kmh
    } else if computed_kmh < config.max_plausible_kmh {
        computed_kmh
    } else {
        // Both signals implausible
        0.0
    }
}

/// Hysteresis transition. Only called with `dt > 0`.
fn next_state(
    current: MotionState,
    dist: f64,
    dt: i64,
    reported_kmh: f64,
    config: &MotionConfig,
) -> MotionState {
    match current {
        MotionState::Stationary => {
            let sustained = dist >= config.start_distance_m && dt >= config.start_dt_secs;
            if sustained || reported_kmh >= config.start_speed_kmh {
                MotionState::Moving
            } else {
                MotionState::Stationary
            }
        }
        MotionState::Moving => {
            let settled = dist < config.stop_distance_m && dt >= config.stop_dt_secs;
            if settled || reported_kmh <= config.stop_speed_kmh {
                MotionState::Stationary
            } else {
                MotionState::Moving
            }
        }
    }
}
