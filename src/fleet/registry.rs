use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use h3o::Resolution;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use crate::error::DispatchError;
use crate::fleet::position::GeoPoint;
use crate::fleet::index::{Nearest, SpatialIndex};
use crate::fleet::types::{Driver, DriverState, Reservation};

/// Default freshness window for driver heartbeats
pub const DEFAULT_STALENESS: Duration = Duration::seconds(30);

/// Default time a reservation may stay unconfirmed
pub const DEFAULT_RESERVATION_TIMEOUT: Duration = Duration::seconds(10);

/// Driver records and the spatial index, guarded together so that every
/// mutation keeps both in step.
#[derive(Debug)]
struct FleetState {
    drivers: HashMap<String, Driver>,
    index: SpatialIndex,
}

impl FleetState {
    /// Brings the driver's index membership in line with its record.
    fn sync_index(&mut self, id: &str) -> Result<(), DispatchError> {
        match self.drivers.get(id) {
            Some(driver) => self.index.upsert(id, &driver.position, driver.is_indexable()),
            None => {
                self.index.remove(id);
                Ok(())
            }
        }
    }

    fn driver_mut(&mut self, id: &str) -> Result<&mut Driver, DispatchError> {
        self.drivers
            .get_mut(id)
            .ok_or_else(|| DispatchError::NotFound(id.to_string()))
    }
}

/// Counts describing the fleet at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetStats {
    pub known: usize,
    pub indexed: usize,
    pub eligible: usize,
    pub reserved: usize,
    pub assigned: usize,
    pub occupied_cells: usize,
}

/// Authoritative in-memory record of every driver's last known state.
///
/// Cloning shares the underlying state. Reads (`get`, `query_nearest`) take
/// the shared lock; every mutation takes the exclusive lock for the duration
/// of a single record + index update, never across a query-then-reserve span.
#[derive(Clone)]
pub struct DriverRegistry {
    state: Arc<RwLock<FleetState>>,
    staleness: Duration,
    reservation_timeout: Duration,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new(
            SpatialIndex::default().resolution(),
            DEFAULT_STALENESS,
            DEFAULT_RESERVATION_TIMEOUT,
        )
    }
}

impl DriverRegistry {
    pub fn new(resolution: Resolution, staleness: Duration, reservation_timeout: Duration) -> Self {
        log::info!(
            "Creating DriverRegistry with resolution {:?}, staleness {:?}, reservation timeout {:?}",
            resolution,
            staleness,
            reservation_timeout
        );
        Self {
            state: Arc::new(RwLock::new(FleetState {
                drivers: HashMap::new(),
                index: SpatialIndex::new(resolution),
            })),
            staleness,
            reservation_timeout,
        }
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    pub fn reservation_timeout(&self) -> Duration {
        self.reservation_timeout
    }

    /// Creates or refreshes a driver's position, availability and timestamp.
    pub fn upsert(&self, id: &str, position: GeoPoint, available: bool) -> Result<Driver, DispatchError> {
        self.upsert_at(id, position, available, OffsetDateTime::now_utc())
    }

    /// [`upsert`](Self::upsert) with an explicit update time.
    ///
    /// A heartbeat never changes the dispatch state of a reserved or
    /// assigned driver; only position, reported availability and freshness
    /// are refreshed.
    pub fn upsert_at(
        &self,
        id: &str,
        position: GeoPoint,
        available: bool,
        at: OffsetDateTime,
    ) -> Result<Driver, DispatchError> {
        if id.trim().is_empty() {
            return Err(DispatchError::InvalidArgument("driver id must not be empty".to_string()));
        }

        let mut state = self.state.write();
        let driver = state
            .drivers
            .entry(id.to_string())
            .and_modify(|d| {
                d.position = position;
                d.online = available;
                d.last_update = at;
            })
            .or_insert_with(|| Driver {
                id: id.to_string(),
                position,
                online: available,
                state: DriverState::Available,
                last_update: at,
                reservation: None,
            })
            .clone();
        state.sync_index(id)?;

        log::debug!(
            "Driver {} at ({:.6}, {:.6}) online={} state={:?}",
            id,
            position.lat(),
            position.lng(),
            available,
            driver.state
        );
        Ok(driver)
    }

    pub fn get(&self, id: &str) -> Option<Driver> {
        self.state.read().drivers.get(id).cloned()
    }

    /// Whether the driver is currently bucketed in the spatial index.
    pub fn is_indexed(&self, id: &str) -> bool {
        self.state.read().index.contains(id)
    }

    /// Applies a state-machine transition.
    ///
    /// `Available -> Reserved` through this path places an anonymous hold;
    /// the matching engine uses [`reserve`](Self::reserve) instead so the
    /// hold carries the rider and session.
    pub fn set_state(&self, id: &str, next: DriverState) -> Result<Driver, DispatchError> {
        if next == DriverState::Reserved {
            let current = self.get(id).ok_or_else(|| DispatchError::NotFound(id.to_string()))?;
            check_transition(&current, next)?;
            return self.reserve(id, "", "");
        }
        let mut state = self.state.write();
        let driver = state.driver_mut(id)?;
        check_transition(driver, next)?;
        driver.state = next;
        driver.reservation = None;
        let driver = driver.clone();
        state.sync_index(id)?;
        log::info!("Driver {} moved to {:?}", id, next);
        Ok(driver)
    }

    /// Atomically reserves the driver if and only if it is currently
    /// eligible (online, `Available` and fresh).
    ///
    /// Returns `ReservationConflict` when another request already holds the
    /// driver or it stopped being eligible since it was found.
    pub fn reserve(&self, id: &str, rider_id: &str, session_id: &str) -> Result<Driver, DispatchError> {
        self.reserve_at(id, rider_id, session_id, OffsetDateTime::now_utc())
    }

    pub fn reserve_at(
        &self,
        id: &str,
        rider_id: &str,
        session_id: &str,
        now: OffsetDateTime,
    ) -> Result<Driver, DispatchError> {
        let staleness = self.staleness;
        let timeout = self.reservation_timeout;

        let mut state = self.state.write();
        let driver = state.driver_mut(id)?;
        if !driver.is_eligible(now, staleness) {
            log::debug!(
                "Reservation of driver {} for session {} refused: state={:?} online={}",
                id,
                session_id,
                driver.state,
                driver.online
            );
            return Err(DispatchError::ReservationConflict(id.to_string()));
        }

        driver.state = DriverState::Reserved;
        driver.reservation = Some(Reservation {
            rider_id: rider_id.to_string(),
            session_id: session_id.to_string(),
            reserved_at: now,
            expires_at: now + timeout,
        });
        let driver = driver.clone();
        state.index.remove(id);

        log::info!("Driver {} reserved for rider {} (session {})", id, rider_id, session_id);
        Ok(driver)
    }

    /// Confirms a reservation: `Reserved -> Assigned`.
    pub fn confirm(&self, id: &str, session_id: &str) -> Result<Driver, DispatchError> {
        self.release_hold(id, session_id, DriverState::Assigned)
    }

    /// Cancels a reservation immediately: `Reserved -> Available`.
    pub fn cancel(&self, id: &str, session_id: &str) -> Result<Driver, DispatchError> {
        self.release_hold(id, session_id, DriverState::Available)
    }

    /// Ends a ride: `Assigned -> Available`.
    pub fn complete(&self, id: &str) -> Result<Driver, DispatchError> {
        let mut state = self.state.write();
        let driver = state.driver_mut(id)?;
        if driver.state != DriverState::Assigned {
            return Err(DispatchError::InvalidTransition(format!(
                "driver {} is {:?}, not ASSIGNED",
                id, driver.state
            )));
        }
        driver.state = DriverState::Available;
        let driver = driver.clone();
        state.sync_index(id)?;
        log::info!("Driver {} finished a ride and is available again", id);
        Ok(driver)
    }

    fn release_hold(&self, id: &str, session_id: &str, next: DriverState) -> Result<Driver, DispatchError> {
        let mut state = self.state.write();
        let driver = state.driver_mut(id)?;
        check_transition(driver, next)?;
        if driver.state != DriverState::Reserved {
            return Err(DispatchError::InvalidTransition(format!(
                "driver {} is {:?}, not RESERVED",
                id, driver.state
            )));
        }
        let held_by = driver
            .reservation
            .as_ref()
            .map(|r| r.session_id.as_str())
            .unwrap_or_default();
        if held_by != session_id {
            return Err(DispatchError::InvalidTransition(format!(
                "driver {} is reserved by another session",
                id
            )));
        }

        driver.state = next;
        driver.reservation = None;
        let driver = driver.clone();
        state.sync_index(id)?;
        log::info!("Driver {} moved to {:?} by session {}", id, next, session_id);
        Ok(driver)
    }

    /// Returns the closest eligible driver within `radius_km`, skipping
    /// `exclude`. Stale, offline and held drivers are never returned even if
    /// their bucket entry has not been pruned yet.
    pub fn query_nearest(
        &self,
        origin: &GeoPoint,
        radius_km: f64,
        exclude: &HashSet<String>,
    ) -> Result<Option<Nearest>, DispatchError> {
        self.query_nearest_at(origin, radius_km, exclude, OffsetDateTime::now_utc())
    }

    pub fn query_nearest_at(
        &self,
        origin: &GeoPoint,
        radius_km: f64,
        exclude: &HashSet<String>,
        now: OffsetDateTime,
    ) -> Result<Option<Nearest>, DispatchError> {
        let staleness = self.staleness;
        let state = self.state.read();
        state.index.query_nearest(origin, radius_km, exclude, |id| {
            state
                .drivers
                .get(id)
                .filter(|d| d.is_eligible(now, staleness))
                .map(|d| d.position)
        })
    }

    /// Reverts every reservation that expired by `now` back to `Available`.
    /// Returns the ids of the released drivers.
    pub fn expire_reservations(&self, now: OffsetDateTime) -> Result<Vec<String>, DispatchError> {
        let mut state = self.state.write();
        let expired: Vec<String> = state
            .drivers
            .values()
            .filter(|d| d.state == DriverState::Reserved)
            .filter(|d| d.reservation.as_ref().map_or(true, |r| r.is_expired(now)))
            .map(|d| d.id.clone())
            .collect();

        for id in &expired {
            if let Some(driver) = state.drivers.get_mut(id) {
                driver.state = DriverState::Available;
                driver.reservation = None;
            }
            state.sync_index(id)?;
            log::info!("Reservation for driver {} timed out; driver is available again", id);
        }
        Ok(expired)
    }

    /// Drops drivers whose last update is older than the staleness window
    /// from the spatial index. Their records stay in the registry and the
    /// next heartbeat re-indexes them.
    pub fn prune_stale(&self, now: OffsetDateTime) -> Vec<String> {
        let staleness = self.staleness;
        let mut state = self.state.write();
        let stale: Vec<String> = state
            .drivers
            .values()
            .filter(|d| !d.is_fresh(now, staleness))
            .filter(|d| state.index.contains(&d.id))
            .map(|d| d.id.clone())
            .collect();

        for id in &stale {
            state.index.remove(id);
        }
        if !stale.is_empty() {
            log::debug!("Pruned {} stale drivers from the spatial index", stale.len());
        }
        stale
    }

    pub fn stats(&self) -> FleetStats {
        self.stats_at(OffsetDateTime::now_utc())
    }

    pub fn stats_at(&self, now: OffsetDateTime) -> FleetStats {
        let state = self.state.read();
        let mut stats = FleetStats {
            known: state.drivers.len(),
            indexed: state.index.len(),
            occupied_cells: state.index.occupied_cells(),
            ..FleetStats::default()
        };
        for driver in state.drivers.values() {
            match driver.state {
                DriverState::Reserved => stats.reserved += 1,
                DriverState::Assigned => stats.assigned += 1,
                DriverState::Available if driver.is_eligible(now, self.staleness) => stats.eligible += 1,
                DriverState::Available => {}
            }
        }
        stats
    }
}

fn check_transition(driver: &Driver, next: DriverState) -> Result<(), DispatchError> {
    if driver.state.can_transition_to(next) {
        Ok(())
    } else {
        Err(DispatchError::InvalidTransition(format!(
            "driver {} cannot move from {:?} to {:?}",
            driver.id, driver.state, next
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn berlin() -> GeoPoint {
        GeoPoint::new(52.5200, 13.4050).unwrap()
    }

    fn registry() -> DriverRegistry {
        DriverRegistry::default()
    }

    #[test]
    fn first_upsert_creates_available_driver() {
        let registry = registry();
        let driver = registry.upsert("d1", berlin(), true).unwrap();
        assert_eq!(driver.state, DriverState::Available);
        assert!(driver.online);
        assert!(registry.is_indexed("d1"));
    }

    #[test]
    fn offline_driver_is_kept_but_not_indexed() {
        let registry = registry();
        registry.upsert("d1", berlin(), false).unwrap();
        assert!(registry.get("d1").is_some());
        assert!(!registry.is_indexed("d1"));

        registry.upsert("d1", berlin(), true).unwrap();
        assert!(registry.is_indexed("d1"));
    }

    #[test]
    fn upsert_is_idempotent() {
        let registry = registry();
        let at = OffsetDateTime::now_utc();
        let first = registry.upsert_at("d1", berlin(), true, at).unwrap();
        let second = registry.upsert_at("d1", berlin(), true, at).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.stats().known, 1);
        assert_eq!(registry.stats().indexed, 1);
    }

    #[test]
    fn empty_id_is_rejected() {
        let registry = registry();
        assert!(matches!(
            registry.upsert("  ", berlin(), true),
            Err(DispatchError::InvalidArgument(_))
        ));
    }

    #[test]
    fn reserve_is_exclusive() {
        let registry = registry();
        registry.upsert("d1", berlin(), true).unwrap();

        let held = registry.reserve("d1", "rider-a", "session-a").unwrap();
        assert_eq!(held.state, DriverState::Reserved);
        assert!(!registry.is_indexed("d1"));

        assert_eq!(
            registry.reserve("d1", "rider-b", "session-b"),
            Err(DispatchError::ReservationConflict("d1".to_string()))
        );
    }

    #[test]
    fn reserve_unknown_driver_is_not_found() {
        let registry = registry();
        assert_eq!(
            registry.reserve("ghost", "r", "s"),
            Err(DispatchError::NotFound("ghost".to_string()))
        );
    }

    #[test]
    fn stale_driver_cannot_be_reserved() {
        let registry = registry();
        let long_ago = OffsetDateTime::now_utc() - Duration::minutes(5);
        registry.upsert_at("d1", berlin(), true, long_ago).unwrap();
        assert!(matches!(
            registry.reserve("d1", "r", "s"),
            Err(DispatchError::ReservationConflict(_))
        ));
    }

    #[test]
    fn heartbeat_does_not_release_reservation() {
        let registry = registry();
        registry.upsert("d1", berlin(), true).unwrap();
        registry.reserve("d1", "r", "s").unwrap();

        let moved = GeoPoint::new(52.5210, 13.4060).unwrap();
        let driver = registry.upsert("d1", moved, true).unwrap();
        assert_eq!(driver.state, DriverState::Reserved);
        assert_eq!(driver.position, moved);
        assert!(!registry.is_indexed("d1"));
    }

    #[test]
    fn confirm_and_complete_cycle() {
        let registry = registry();
        registry.upsert("d1", berlin(), true).unwrap();
        registry.reserve("d1", "r", "s").unwrap();

        let assigned = registry.confirm("d1", "s").unwrap();
        assert_eq!(assigned.state, DriverState::Assigned);
        assert!(assigned.reservation.is_none());
        assert!(!registry.is_indexed("d1"));

        let available = registry.complete("d1").unwrap();
        assert_eq!(available.state, DriverState::Available);
        assert!(registry.is_indexed("d1"));
    }

    #[test]
    fn confirm_requires_matching_session() {
        let registry = registry();
        registry.upsert("d1", berlin(), true).unwrap();
        registry.reserve("d1", "r", "s").unwrap();

        assert!(matches!(
            registry.confirm("d1", "other"),
            Err(DispatchError::InvalidTransition(_))
        ));
        assert_eq!(registry.get("d1").unwrap().state, DriverState::Reserved);
    }

    #[test]
    fn cancel_returns_driver_to_index() {
        let registry = registry();
        registry.upsert("d1", berlin(), true).unwrap();
        registry.reserve("d1", "r", "s").unwrap();

        let driver = registry.cancel("d1", "s").unwrap();
        assert_eq!(driver.state, DriverState::Available);
        assert!(registry.is_indexed("d1"));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let registry = registry();
        registry.upsert("d1", berlin(), true).unwrap();

        assert!(matches!(
            registry.set_state("d1", DriverState::Assigned),
            Err(DispatchError::InvalidTransition(_))
        ));
        assert!(matches!(registry.complete("d1"), Err(DispatchError::InvalidTransition(_))));
        assert!(matches!(registry.cancel("d1", "s"), Err(DispatchError::InvalidTransition(_))));
        assert!(matches!(
            registry.set_state("ghost", DriverState::Available),
            Err(DispatchError::NotFound(_))
        ));
    }

    #[test]
    fn set_state_walks_the_state_machine() {
        let registry = registry();
        registry.upsert("d1", berlin(), true).unwrap();

        assert_eq!(registry.set_state("d1", DriverState::Reserved).unwrap().state, DriverState::Reserved);
        assert_eq!(registry.set_state("d1", DriverState::Assigned).unwrap().state, DriverState::Assigned);
        assert_eq!(registry.set_state("d1", DriverState::Available).unwrap().state, DriverState::Available);
        assert!(registry.is_indexed("d1"));
    }

    #[test]
    fn expired_reservations_revert() {
        let registry = registry();
        registry.upsert("d1", berlin(), true).unwrap();
        let now = OffsetDateTime::now_utc();
        registry.reserve_at("d1", "r", "s", now).unwrap();

        assert!(registry.expire_reservations(now).unwrap().is_empty());

        let later = now + DEFAULT_RESERVATION_TIMEOUT + Duration::seconds(1);
        assert_eq!(registry.expire_reservations(later).unwrap(), vec!["d1".to_string()]);
        assert_eq!(registry.get("d1").unwrap().state, DriverState::Available);
        assert!(registry.is_indexed("d1"));
    }

    #[test]
    fn stale_drivers_are_pruned_and_hidden() {
        let registry = registry();
        let now = OffsetDateTime::now_utc();
        registry.upsert_at("old", berlin(), true, now - Duration::minutes(2)).unwrap();
        registry
            .upsert_at("fresh", GeoPoint::new(52.5300, 13.3800).unwrap(), true, now)
            .unwrap();

        // Stale entries are filtered at query time even before pruning
        let found = registry
            .query_nearest_at(&berlin(), 10.0, &HashSet::new(), now)
            .unwrap()
            .unwrap();
        assert_eq!(found.driver_id, "fresh");

        assert_eq!(registry.prune_stale(now), vec!["old".to_string()]);
        assert!(!registry.is_indexed("old"));
        assert!(registry.get("old").is_some());

        registry.upsert("old", berlin(), true).unwrap();
        assert!(registry.is_indexed("old"));
    }

    #[test]
    fn stats_count_states() {
        let registry = registry();
        registry.upsert("a", berlin(), true).unwrap();
        registry.upsert("b", berlin(), true).unwrap();
        registry.upsert("c", berlin(), true).unwrap();
        registry.upsert("d", berlin(), false).unwrap();
        registry.reserve("a", "r", "s1").unwrap();
        registry.reserve("b", "r", "s2").unwrap();
        registry.confirm("b", "s2").unwrap();

        let stats = registry.stats();
        assert_eq!(stats.known, 4);
        assert_eq!(stats.indexed, 1);
        assert_eq!(stats.eligible, 1);
        assert_eq!(stats.reserved, 1);
        assert_eq!(stats.assigned, 1);
    }
}
