#![allow(dead_code)]

use std::sync::Arc;
use dispatch::audit::MemoryAuditSink;
use dispatch::config::DispatchConfig;
use dispatch::fleet::GeoPoint;
use dispatch::models::{MatchRequestBody, UpdateDriverRequest};
use dispatch::service::DispatchService;

/// Berlin Mitte, where most test drivers are placed
pub const BERLIN: (f64, f64) = (52.5200, 13.4050);

/// Munich center, far from every Berlin driver
pub const MUNICH: (f64, f64) = (48.1351, 11.5820);

pub fn point(lat: f64, lng: f64) -> GeoPoint {
    GeoPoint::new(lat, lng).expect("valid test coordinates")
}

/// Create a test location offset north/east of Berlin by the given meters
pub fn berlin_offset(north_m: f64, east_m: f64) -> (f64, f64) {
    // Approximate conversion: 1 degree latitude = 111km
    // 1 degree longitude = 111km * cos(latitude)
    let lat = BERLIN.0 + north_m / 111_000.0;
    let lng = BERLIN.1 + east_m / (111_000.0 * BERLIN.0.to_radians().cos());
    (lat, lng)
}

/// Service with an in-memory audit sink for inspection
pub fn test_service(config: DispatchConfig) -> (DispatchService, MemoryAuditSink) {
    let audit = MemoryAuditSink::new();
    let service = DispatchService::new(config, Arc::new(audit.clone())).expect("valid test config");
    (service, audit)
}

pub fn update(id: &str, (lat, lng): (f64, f64), available: bool) -> UpdateDriverRequest {
    UpdateDriverRequest {
        id: id.to_string(),
        lat,
        lng,
        available,
    }
}

pub fn match_body(rider: &str, session: &str, (lat, lng): (f64, f64), radius_km: Option<f64>) -> MatchRequestBody {
    MatchRequestBody {
        rider_id: rider.to_string(),
        session_id: session.to_string(),
        lat,
        lng,
        radius_km,
    }
}

/// Three drivers spread over central Berlin
pub fn seed_berlin(service: &DispatchService) {
    for (id, lat, lng) in [
        ("driver_berlin_01", 52.5200, 13.4050), // Mitte
        ("driver_berlin_02", 52.5300, 13.3800), // Wedding
        ("driver_berlin_03", 52.4800, 13.4200), // Neukoelln
    ] {
        service
            .update_driver(update(id, (lat, lng), true))
            .expect("seed driver");
    }
}
