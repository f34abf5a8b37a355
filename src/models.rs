//! Data models for the dispatch service.
//! Defines the JSON request/response bodies of the HTTP surface.

use serde::{Deserialize, Serialize};
use crate::fleet::{Driver, DriverState, FleetStats};
use crate::matching::{MatchResult, MatchStats};

/// Position and availability heartbeat from a driver client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateDriverRequest {
    pub id: String,
    /// Latitude in degrees (-90 to 90)
    pub lat: f64,
    /// Longitude in degrees (-180 to 180)
    pub lng: f64,
    pub available: bool,
}

/// Driver state as echoed back to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverView {
    pub id: String,
    pub lat: f64,
    pub lng: f64,
    pub available: bool,
    pub state: DriverState,
    /// Unix timestamp in milliseconds of the last update
    pub last_update_ms: i64,
}

impl From<&Driver> for DriverView {
    fn from(driver: &Driver) -> Self {
        Self {
            id: driver.id.clone(),
            lat: driver.position.lat(),
            lng: driver.position.lng(),
            available: driver.online,
            state: driver.state,
            last_update_ms: (driver.last_update.unix_timestamp_nanos() / 1_000_000) as i64,
        }
    }
}

/// Rider request for the closest available driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRequestBody {
    /// Missing ids deserialize as empty and are rejected by validation
    #[serde(default)]
    pub rider_id: String,
    #[serde(default)]
    pub session_id: String,
    pub lat: f64,
    pub lng: f64,
    /// Search radius in kilometers (service default if omitted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius_km: Option<f64>,
}

/// Response to a match request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_lng: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
    pub message: String,
}

impl From<MatchResult> for MatchResponse {
    fn from(result: MatchResult) -> Self {
        Self {
            success: result.success,
            driver_id: result.driver_id,
            driver_lat: result.driver_position.map(|p| p.lat()),
            driver_lng: result.driver_position.map(|p| p.lng()),
            distance_km: result.distance_km,
            message: result.message,
        }
    }
}

/// Confirms or cancels a reservation held by a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationAction {
    pub driver_id: String,
    pub session_id: String,
}

/// Marks an assigned driver's ride as finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRide {
    pub driver_id: String,
}

/// Liveness report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    pub version: String,
    pub uptime_seconds: u64,
    pub fleet: FleetStats,
    pub matches: MatchStats,
}
