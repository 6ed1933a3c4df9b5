//! # SQLite Store
//!
//! Device and region stores backed by a single SQLite database.
//!
//! One row per device (overwritten on every accepted ping) and one row per
//! region name. The connection sits behind a mutex, so each `get`/`upsert` is
//! atomic; the pipeline's per-device lock covers the read-modify-write.

use std::sync::{Mutex, MutexGuard};

use log::info;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};

use crate::store::{DeviceStore, RegionStore};
use crate::{DevicePosition, GpsPoint, MotionState, Region, Result, TrackerError};

const DEVICE_COLUMNS: &str = "device_id, latitude, longitude, velocity_ms, heading_deg, battery_pct,
    updated_at, motion_state,
    street_cache, street_cache_at, street_cache_lat, street_cache_lng,
    poi_cache, poi_cache_at, poi_cache_heading, poi_cache_lat, poi_cache_lng";

/// SQLite-backed [`DeviceStore`] and [`RegionStore`].
pub struct SqliteStore {
    db: Mutex<Connection>,
    db_path: String,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`.
    pub fn new(db_path: &str) -> Result<Self> {
        let db = Connection::open(db_path)?;
        Self::init_schema(&db)?;
        info!("[SqliteStore] Opened {}", db_path);

        Ok(Self {
            db: Mutex::new(db),
            db_path: db_path.to_string(),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    fn init_schema(conn: &Connection) -> SqlResult<()> {
        conn.execute_batch(
            r#"
            -- Last known state, one row per device
            CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                velocity_ms REAL NOT NULL DEFAULT 0,
                heading_deg REAL NOT NULL DEFAULT 0,
                battery_pct INTEGER,
                updated_at INTEGER NOT NULL,
                motion_state TEXT NOT NULL DEFAULT 'stationary',
                street_cache TEXT,
                street_cache_at INTEGER,
                street_cache_lat REAL,
                street_cache_lng REAL,
                poi_cache TEXT,
                poi_cache_at INTEGER,
                poi_cache_heading REAL,
                poi_cache_lat REAL,
                poi_cache_lng REAL
            );

            -- User-named circular regions
            CREATE TABLE IF NOT EXISTS regions (
                name TEXT PRIMARY KEY,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                radius_m REAL NOT NULL
            );
            "#,
        )
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| TrackerError::Store("database lock poisoned".to_string()))
    }
}

fn point_from(lat: Option<f64>, lng: Option<f64>) -> Option<GpsPoint> {
    match (lat, lng) {
        (Some(lat), Some(lng)) => Some(GpsPoint::new(lat, lng)),
        _ => None,
    }
}

fn motion_state_from(value: &str) -> MotionState {
    match value {
        "moving" => MotionState::Moving,
        _ => MotionState::Stationary,
    }
}

fn device_from_row(row: &Row<'_>) -> SqlResult<DevicePosition> {
    let battery: Option<i64> = row.get(5)?;
    let motion: String = row.get(7)?;

    Ok(DevicePosition {
        device_id: row.get(0)?,
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        velocity_ms: row.get(3)?,
        heading_deg: row.get(4)?,
        battery_pct: battery.map(|b| b.clamp(0, 100) as u8),
        updated_at: row.get(6)?,
        motion_state: motion_state_from(&motion),
        street_cache: row.get(8)?,
        street_cache_at: row.get(9)?,
        street_cache_point: point_from(row.get(10)?, row.get(11)?),
        poi_cache: row.get(12)?,
        poi_cache_at: row.get(13)?,
        poi_cache_heading: row.get(14)?,
        poi_cache_point: point_from(row.get(15)?, row.get(16)?),
    })
}

impl DeviceStore for SqliteStore {
    fn get(&self, device_id: &str) -> Result<Option<DevicePosition>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM devices WHERE device_id = ?", DEVICE_COLUMNS);
        let record = conn
            .query_row(&sql, params![device_id], device_from_row)
            .optional()?;
        Ok(record)
    }

    fn upsert(&self, record: &DevicePosition) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO devices (
                device_id, latitude, longitude, velocity_ms, heading_deg, battery_pct,
                updated_at, motion_state,
                street_cache, street_cache_at, street_cache_lat, street_cache_lng,
                poi_cache, poi_cache_at, poi_cache_heading, poi_cache_lat, poi_cache_lng
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ON CONFLICT(device_id) DO UPDATE SET
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                velocity_ms = excluded.velocity_ms,
                heading_deg = excluded.heading_deg,
                battery_pct = excluded.battery_pct,
                updated_at = excluded.updated_at,
                motion_state = excluded.motion_state,
                street_cache = excluded.street_cache,
                street_cache_at = excluded.street_cache_at,
                street_cache_lat = excluded.street_cache_lat,
                street_cache_lng = excluded.street_cache_lng,
                poi_cache = excluded.poi_cache,
                poi_cache_at = excluded.poi_cache_at,
                poi_cache_heading = excluded.poi_cache_heading,
                poi_cache_lat = excluded.poi_cache_lat,
                poi_cache_lng = excluded.poi_cache_lng",
            params![
                record.device_id,
                record.latitude,
                record.longitude,
                record.velocity_ms,
                record.heading_deg,
                record.battery_pct.map(i64::from),
                record.updated_at,
                record.motion_state.as_str(),
                record.street_cache,
                record.street_cache_at,
                record.street_cache_point.map(|p| p.latitude),
                record.street_cache_point.map(|p| p.longitude),
                record.poi_cache,
                record.poi_cache_at,
                record.poi_cache_heading,
                record.poi_cache_point.map(|p| p.latitude),
                record.poi_cache_point.map(|p| p.longitude),
            ],
        )?;
        Ok(())
    }
}

impl RegionStore for SqliteStore {
    fn list(&self) -> Result<Vec<Region>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name, latitude, longitude, radius_m FROM regions")?;
        let regions = stmt
            .query_map([], |row| {
                Ok(Region {
                    name: row.get(0)?,
                    latitude: row.get(1)?,
                    longitude: row.get(2)?,
                    radius_m: row.get(3)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(regions)
    }

    fn save(&self, region: &Region) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO regions (name, latitude, longitude, radius_m) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                radius_m = excluded.radius_m",
            params![region.name, region.latitude, region.longitude, region.radius_m],
        )?;
        Ok(())
    }
}
