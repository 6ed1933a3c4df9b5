//! Error types for the location tracker.
//!
//! Only two things can fail a request: a ping or region that does not pass
//! validation, and a store that cannot be read or written. Resolver failures
//! (reverse geocoding, POI lookup) are never errors; they degrade to cached labels.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Top-level error returned by pipeline, query and region operations.
#[derive(Error, Debug)]
pub enum TrackerError {
    /// The request was rejected before any state was read or written.
    #[error("bad request: {0}")]
    Validation(#[from] ValidationError),

    /// The backing store failed. Fatal for the request, never retried.
    #[error("store error: {0}")]
    Store(String),
}

impl TrackerError {
    /// True when the caller sent bad input (as opposed to a backend failure).
    pub fn is_bad_request(&self) -> bool {
        matches!(self, TrackerError::Validation(_))
    }
}

/// Reasons a ping or region is rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// A required field is absent or blank.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// Latitude/longitude not finite or outside [-90,90] / [-180,180].
    #[error("invalid coordinates: lat={lat}, lon={lon}")]
    InvalidCoordinates { lat: f64, lon: f64 },

    /// Reported speed is negative or not a number.
    #[error("invalid speed: {0}")]
    InvalidSpeed(f64),

    /// Timestamp not positive, or too far ahead of the server clock.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    /// Region radius must be a positive, finite number of meters.
    #[error("invalid region radius: {0}")]
    InvalidRadius(f64),

    /// The payload could not be parsed at all.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for TrackerError {
    fn from(e: rusqlite::Error) -> Self {
        TrackerError::Store(e.to_string())
    }
}
