use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use crate::audit::{AuditSink, ChannelAuditSink, LogAuditWriter};
use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::fleet::{DriverRegistry, GeoPoint};
use crate::matching::{MatchRequest, MatchingEngine};
use crate::models::{
    CompleteRide, DriverView, HealthStatus, MatchRequestBody, MatchResponse, ReservationAction,
    UpdateDriverRequest,
};

/// What one background sweep changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub expired_reservations: Vec<String>,
    pub pruned_stale: Vec<String>,
}

#[derive(Clone)]
/// Service that owns the driver registry and matching engine and exposes
/// the operations behind the HTTP endpoints.
pub struct DispatchService {
    registry: DriverRegistry,
    engine: MatchingEngine,
    /// Configuration for matching and background behavior
    config: DispatchConfig,
    /// Service start time for calculating uptime
    start_time: Arc<Instant>,
}

impl DispatchService {
    /// Returns the current timestamp in milliseconds since epoch
    fn current_timestamp_ms() -> i64 {
        (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
    }

    pub fn new(config: DispatchConfig, audit: Arc<dyn AuditSink>) -> Result<Self, DispatchError> {
        config.validate().map_err(DispatchError::InvalidArgument)?;
        let resolution = config.resolution().map_err(DispatchError::InvalidArgument)?;

        let registry = DriverRegistry::new(resolution, config.staleness(), config.reservation_timeout());
        let engine = MatchingEngine::new(registry.clone(), audit)
            .with_max_attempts(config.max_match_attempts)
            .with_max_radius_km(config.max_radius_km);

        Ok(Self {
            registry,
            engine,
            config,
            start_time: Arc::new(Instant::now()),
        })
    }

    /// Builds the service with the channel-backed audit sink writing to the
    /// `audit` log target. Must be called from within a tokio runtime.
    pub fn with_log_audit(config: DispatchConfig) -> Result<Self, DispatchError> {
        let (sink, _writer) = ChannelAuditSink::spawn(config.audit_buffer, LogAuditWriter);
        Self::new(config, Arc::new(sink))
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &MatchingEngine {
        &self.engine
    }

    /// Spawns the periodic sweep that expires reservations and prunes stale
    /// drivers from the spatial index.
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        let service = self.clone();
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = service.sweep(OffsetDateTime::now_utc()) {
                    log::error!("Sweep failed: {}", e);
                }
            }
        })
    }

    /// Runs one sweep at `now`.
    pub fn sweep(&self, now: OffsetDateTime) -> Result<SweepReport, DispatchError> {
        let expired_reservations = self.registry.expire_reservations(now)?;
        let pruned_stale = self.registry.prune_stale(now);
        if !expired_reservations.is_empty() || !pruned_stale.is_empty() {
            log::info!(
                "Sweep released {} reservations and pruned {} stale drivers",
                expired_reservations.len(),
                pruned_stale.len()
            );
        }
        Ok(SweepReport {
            expired_reservations,
            pruned_stale,
        })
    }

    /// Records a driver heartbeat.
    ///
    /// # Returns
    /// - Ok(DriverView) with the stored state
    /// - Err(DispatchError::InvalidArgument) for an empty id or bad coordinates
    pub fn update_driver(&self, request: UpdateDriverRequest) -> Result<DriverView, DispatchError> {
        let position = GeoPoint::new(request.lat, request.lng)?;
        let driver = self.registry.upsert(&request.id, position, request.available)?;
        Ok(DriverView::from(&driver))
    }

    pub fn get_driver(&self, id: &str) -> Result<DriverView, DispatchError> {
        self.registry
            .get(id)
            .map(|d| DriverView::from(&d))
            .ok_or_else(|| DispatchError::NotFound(id.to_string()))
    }

    /// Matches a rider with the closest available driver, applying the
    /// configured default radius when the request has none.
    pub fn match_rider(&self, request: MatchRequestBody) -> Result<MatchResponse, DispatchError> {
        let request = MatchRequest {
            rider_id: request.rider_id,
            session_id: request.session_id,
            lat: request.lat,
            lng: request.lng,
            radius_km: request.radius_km.unwrap_or(self.config.default_radius_km),
        };
        self.engine.match_request(&request).map(MatchResponse::from)
    }

    pub fn confirm(&self, action: ReservationAction) -> Result<DriverView, DispatchError> {
        let driver = self.registry.confirm(&action.driver_id, &action.session_id)?;
        Ok(DriverView::from(&driver))
    }

    pub fn cancel(&self, action: ReservationAction) -> Result<DriverView, DispatchError> {
        let driver = self.registry.cancel(&action.driver_id, &action.session_id)?;
        Ok(DriverView::from(&driver))
    }

    pub fn complete(&self, ride: CompleteRide) -> Result<DriverView, DispatchError> {
        let driver = self.registry.complete(&ride.driver_id)?;
        Ok(DriverView::from(&driver))
    }

    /// Get health status information for the service
    pub fn health_status(&self) -> HealthStatus {
        HealthStatus {
            status: "ok".to_string(),
            timestamp: Self::current_timestamp_ms(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            fleet: self.registry.stats(),
            matches: self.engine.stats(),
        }
    }
}
