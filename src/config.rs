//! Configuration management for the dispatch service.
//!
//! This module provides configuration handling via environment variables with sensible defaults.
//! All configuration parameters can be customized through environment variables with the DISPATCH_ prefix.
//!
//! # Environment Variables
//! - DISPATCH_DEFAULT_RADIUS_KM: Search radius when a match request omits it (default: 10.0)
//! - DISPATCH_MAX_RADIUS_KM: Largest accepted search radius (default: 50.0)
//! - DISPATCH_STALENESS_MS: Freshness window for driver updates (default: 30000)
//! - DISPATCH_RESERVATION_TIMEOUT_MS: Time a reservation may stay unconfirmed (default: 10000)
//! - DISPATCH_SWEEP_INTERVAL_MS: Reservation expiry / stale pruning interval (default: 1000)
//! - DISPATCH_MAX_MATCH_ATTEMPTS: Reservation attempts per match request (default: 3)
//! - DISPATCH_H3_RESOLUTION: Spatial index cell resolution (default: 8)
//! - DISPATCH_AUDIT_BUFFER: Pending audit events before new ones are dropped (default: 1024)

use serde::Deserialize;
use std::env;
use h3o::Resolution;
use time::Duration;

/// Prefix for all dispatch service environment variables.
const ENV_PREFIX: &str = "DISPATCH_";

/// Configuration parameters for the dispatch service.
///
/// Unset variables keep their default value, so a partial environment is
/// enough to override a single setting.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Radius applied when a match request does not carry one. Kilometers.
    pub default_radius_km: f64,

    /// Upper bound on the search radius a caller may ask for. Kilometers.
    pub max_radius_km: f64,

    /// Drivers silent for longer than this are excluded from matching.
    /// Milliseconds.
    pub staleness_ms: u64,

    /// A reservation not confirmed within this window reverts to available.
    /// Milliseconds.
    pub reservation_timeout_ms: u64,

    /// Interval of the background sweep. Milliseconds.
    pub sweep_interval_ms: u64,

    /// Reservation attempts per match before reporting no driver.
    pub max_match_attempts: u32,

    /// H3 resolution of the spatial index cells (0-15).
    pub h3_resolution: u8,

    /// Capacity of the audit event channel.
    pub audit_buffer: usize,
}

impl DispatchConfig {
    /// Attempts to load configuration from environment variables.
    ///
    /// # Returns
    /// - Ok(config) if all present variables parse and the result validates
    /// - Err(message) if any variable is malformed or a value is out of range
    pub fn from_env() -> Result<Self, String> {
        // Load .env file if it exists for local development
        dotenv::dotenv().ok();

        let env_vars: std::collections::HashMap<String, String> = env::vars()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .map(|(k, v)| (k.trim_start_matches(ENV_PREFIX).to_lowercase(), v))
            .collect();

        match envy::from_iter::<_, Self>(env_vars) {
            Ok(config) => {
                config.validate()?;
                Ok(config)
            }
            Err(e) => Err(format!("Failed to parse environment variables: {}", e)),
        }
    }

    /// Loads configuration from environment variables, falling back to defaults
    /// if environment variables are not set or are invalid.
    pub fn from_env_or_default() -> Self {
        Self::from_env().unwrap_or_else(|e| {
            log::warn!("Invalid configuration ({}), using defaults", e);
            Self::default()
        })
    }

    /// Validates all configuration parameters.
    ///
    /// # Returns
    /// - Ok(()) if all validation passes
    /// - Err(message) with description of the first validation failure
    pub fn validate(&self) -> Result<(), String> {
        if !(self.max_radius_km > 0.0) {
            return Err("max_radius_km must be positive".to_string());
        }
        if !(self.default_radius_km > 0.0) || self.default_radius_km > self.max_radius_km {
            return Err("default_radius_km must be positive and at most max_radius_km".to_string());
        }
        if self.staleness_ms == 0 {
            return Err("staleness_ms must be positive".to_string());
        }
        if self.reservation_timeout_ms == 0 {
            return Err("reservation_timeout_ms must be positive".to_string());
        }
        if self.sweep_interval_ms == 0 {
            return Err("sweep_interval_ms must be positive".to_string());
        }
        if self.max_match_attempts == 0 {
            return Err("max_match_attempts must be positive".to_string());
        }
        if Resolution::try_from(self.h3_resolution).is_err() {
            return Err(format!("h3_resolution {} is not a valid H3 resolution", self.h3_resolution));
        }
        if self.audit_buffer == 0 {
            return Err("audit_buffer must be positive".to_string());
        }
        Ok(())
    }

    pub fn resolution(&self) -> Result<Resolution, String> {
        Resolution::try_from(self.h3_resolution)
            .map_err(|e| format!("invalid h3_resolution {}: {}", self.h3_resolution, e))
    }

    pub fn staleness(&self) -> Duration {
        Duration::milliseconds(self.staleness_ms as i64)
    }

    pub fn reservation_timeout(&self) -> Duration {
        Duration::milliseconds(self.reservation_timeout_ms as i64)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Default configuration values.
impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_radius_km: 10.0,
            max_radius_km: 50.0,
            staleness_ms: 30_000,
            reservation_timeout_ms: 10_000,
            sweep_interval_ms: 1_000,
            max_match_attempts: 3,
            h3_resolution: 8,
            audit_buffer: 1024,
        }
    }
}
