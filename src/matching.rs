//! Match orchestration: nearest-driver lookup, atomic reservation with a
//! bounded retry on lost races, and audit reporting.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use crate::audit::AuditSink;
use crate::error::DispatchError;
use crate::fleet::{DriverRegistry, GeoPoint};

/// Default number of reservation attempts per match.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Largest search radius accepted by default, in kilometers.
pub const DEFAULT_MAX_RADIUS_KM: f64 = 50.0;

pub const MSG_MATCHED: &str = "driver found and dispatched";
pub const MSG_NO_DRIVERS: &str = "no drivers available within radius";

/// A rider asking for the closest driver. Coordinates are raw and are
/// validated by [`MatchingEngine::match_request`].
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRequest {
    pub rider_id: String,
    pub session_id: String,
    pub lat: f64,
    pub lng: f64,
    pub radius_km: f64,
}

/// Outcome of a match. A `success: false` result is a normal outcome,
/// not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub success: bool,
    pub driver_id: Option<String>,
    pub driver_position: Option<GeoPoint>,
    pub distance_km: Option<f64>,
    pub message: String,
}

impl MatchResult {
    fn no_match() -> Self {
        Self {
            success: false,
            driver_id: None,
            driver_position: None,
            distance_km: None,
            message: MSG_NO_DRIVERS.to_string(),
        }
    }
}

/// Running totals for the health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchStats {
    pub matched: u64,
    pub unmatched: u64,
    pub rejected: u64,
    pub reservation_conflicts: u64,
}

#[derive(Default)]
struct Counters {
    matched: AtomicU64,
    unmatched: AtomicU64,
    rejected: AtomicU64,
    reservation_conflicts: AtomicU64,
}

/// Turns match requests into reserved drivers.
///
/// Concurrent matches never lock the whole fleet for the query-then-reserve
/// span. Each attempt queries under the shared lock and then reserves with
/// a single compare-and-set; a lost race excludes that driver and tries
/// again, up to `max_attempts` times.
#[derive(Clone)]
pub struct MatchingEngine {
    registry: DriverRegistry,
    audit: Arc<dyn AuditSink>,
    max_attempts: u32,
    max_radius_km: f64,
    counters: Arc<Counters>,
}

impl MatchingEngine {
    pub fn new(registry: DriverRegistry, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            registry,
            audit,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_radius_km: DEFAULT_MAX_RADIUS_KM,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_max_radius_km(mut self, max_radius_km: f64) -> Self {
        self.max_radius_km = max_radius_km;
        self
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    /// Finds and reserves the closest eligible driver for `request`.
    ///
    /// # Returns
    /// - Ok(MatchResult{success: true, ..}) with the reserved driver
    /// - Ok(MatchResult{success: false, ..}) if no driver could be reserved
    /// - Err(DispatchError::InvalidArgument) if the request is malformed
    pub fn match_request(&self, request: &MatchRequest) -> Result<MatchResult, DispatchError> {
        let origin = match self.validate(request) {
            Ok(origin) => origin,
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Rejected match request from rider {:?} (session {:?}): {}",
                    request.rider_id,
                    request.session_id,
                    e
                );
                self.audit.record_error("MATCH_VALIDATE", &request.rider_id, &request.session_id, &e.to_string());
                return Err(e);
            }
        };

        self.audit
            .record_match_attempt(&request.rider_id, &request.session_id, request.lat, request.lng);

        let mut excluded: HashSet<String> = HashSet::new();
        for attempt in 1..=self.max_attempts {
            let nearest = match self.registry.query_nearest(&origin, request.radius_km, &excluded) {
                Ok(Some(nearest)) => nearest,
                Ok(None) => break,
                Err(e) => return Err(self.fail(request, "MATCH_QUERY", e)),
            };

            match self
                .registry
                .reserve(&nearest.driver_id, &request.rider_id, &request.session_id)
            {
                Ok(driver) => {
                    self.counters.matched.fetch_add(1, Ordering::Relaxed);
                    log::info!(
                        "Matched rider {} (session {}) with driver {} at {:.3} km on attempt {}",
                        request.rider_id,
                        request.session_id,
                        driver.id,
                        nearest.distance_km,
                        attempt
                    );
                    self.audit.record_match_outcome(
                        &request.rider_id,
                        Some(&driver.id),
                        &request.session_id,
                        nearest.distance_km,
                        true,
                    );
                    return Ok(MatchResult {
                        success: true,
                        driver_id: Some(driver.id),
                        driver_position: Some(driver.position),
                        distance_km: Some(nearest.distance_km),
                        message: MSG_MATCHED.to_string(),
                    });
                }
                // Lost the race, or the driver went away between query and reserve
                Err(DispatchError::ReservationConflict(_)) | Err(DispatchError::NotFound(_)) => {
                    self.counters.reservation_conflicts.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "Attempt {}/{} for session {} lost driver {}",
                        attempt,
                        self.max_attempts,
                        request.session_id,
                        nearest.driver_id
                    );
                    excluded.insert(nearest.driver_id);
                }
                Err(e) => return Err(self.fail(request, "MATCH_RESERVE", e)),
            }
        }

        self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "No driver for rider {} (session {}) within {:.1} km",
            request.rider_id,
            request.session_id,
            request.radius_km
        );
        self.audit
            .record_match_outcome(&request.rider_id, None, &request.session_id, 0.0, false);
        Ok(MatchResult::no_match())
    }

    fn fail(&self, request: &MatchRequest, action: &str, e: DispatchError) -> DispatchError {
        log::error!("Match for session {} failed during {}: {}", request.session_id, action, e);
        self.audit
            .record_error(action, &request.rider_id, &request.session_id, &e.to_string());
        e
    }

    fn validate(&self, request: &MatchRequest) -> Result<GeoPoint, DispatchError> {
        if request.rider_id.trim().is_empty() {
            return Err(DispatchError::InvalidArgument("rider_id is required".to_string()));
        }
        if request.session_id.trim().is_empty() {
            return Err(DispatchError::InvalidArgument("session_id is required".to_string()));
        }
        if !request.radius_km.is_finite() || request.radius_km <= 0.0 {
            return Err(DispatchError::InvalidArgument(format!(
                "radius_km must be positive, got {}",
                request.radius_km
            )));
        }
        if request.radius_km > self.max_radius_km {
            return Err(DispatchError::InvalidArgument(format!(
                "radius_km must be at most {}, got {}",
                self.max_radius_km, request.radius_km
            )));
        }
        GeoPoint::new(request.lat, request.lng)
    }

    pub fn stats(&self) -> MatchStats {
        MatchStats {
            matched: self.counters.matched.load(Ordering::Relaxed),
            unmatched: self.counters.unmatched.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            reservation_conflicts: self.counters.reservation_conflicts.load(Ordering::Relaxed),
        }
    }
}
