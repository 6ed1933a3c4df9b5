//! Basic example of tracking one device through a short trip.
//!
//! Run with: cargo run --example basic_tracking

use location_tracker::geo_utils::destination;
use location_tracker::{GpsPoint, LocationTracker, Ping, Region};

fn ping(device: &str, point: GpsPoint, speed_kmh: f64, heading: f64, timestamp: i64) -> Ping {
    Ping {
        device_id: Some(device.to_string()),
        lat: Some(point.latitude),
        lon: Some(point.longitude),
        speed: Some(speed_kmh),
        heading: Some(heading),
        battery: Some(72.0),
        timestamp: Some(timestamp),
        ..Ping::default()
    }
}

fn main() {
    let tracker = LocationTracker::in_memory();
    let t0 = 1_700_000_000;

    // Home in São Paulo
    let home = GpsPoint::new(-23.5505, -46.6333);
    if let Err(e) = tracker.save_region(Region::new("Home", home.latitude, home.longitude, 100.0)) {
        eprintln!("Failed to save region: {}", e);
        return;
    }

    println!("Location Tracking Example\n");

    // Sitting at home, then driving northeast at ~30 km/h
    let mut pings = vec![ping("Alex", home, 0.0, 0.0, t0)];
    let mut position = home;
    for i in 1..=4 {
        position = destination(&position, 45.0, 250.0);
        pings.push(ping("Alex", position, 30.0, 45.0, t0 + i * 30));
    }

    for (i, p) in pings.into_iter().enumerate() {
        match tracker.ingest(p) {
            Ok(ack) => println!(
                "{}. {} -> {} at {:.1} m/s{} (next report in {}s)",
                i + 1,
                ack.device_id,
                ack.motion_state,
                ack.velocity_ms,
                if ack.transitioned { ", transitioned" } else { "" },
                ack.hint.interval_secs
            ),
            Err(e) => println!("{}. rejected: {}", i + 1, e),
        }
    }

    // A malformed ping is rejected up front
    let bad = Ping {
        device_id: Some("alex".to_string()),
        lat: Some(123.0),
        lon: Some(0.0),
        ..Ping::default()
    };
    if let Err(e) = tracker.ingest(bad) {
        println!("\nBad ping: {} (bad request: {})", e, e.is_bad_request());
    }

    println!("\nQueries:");
    match tracker.where_is("alex") {
        Ok(Some(status)) => println!("  where: {}", status.text),
        Ok(None) => println!("  where: unknown"),
        Err(e) => println!("  where failed: {}", e),
    }
    match tracker.details_at("alex", t0 + 4 * 30 + 400) {
        Ok(Some(details)) => println!("  details: {}", details.text),
        Ok(None) => println!("  details: unknown"),
        Err(e) => println!("  details failed: {}", e),
    }
    match tracker.where_is("bruno") {
        Ok(None) => println!("  {}", location_tracker::query::not_found_message("bruno")),
        Ok(Some(status)) => println!("  where: {}", status.text),
        Err(e) => println!("  where failed: {}", e),
    }
}
