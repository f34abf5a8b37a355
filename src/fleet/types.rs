use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use crate::fleet::position::GeoPoint;

/// Dispatch state of a driver.
///
/// Legal transitions:
/// - `Available -> Reserved` (a match won the driver)
/// - `Reserved -> Assigned` (ride confirmed)
/// - `Reserved -> Available` (reservation timed out or was cancelled)
/// - `Assigned -> Available` (ride finished)
#[derive(Clone, Debug, PartialEq, Eq, Copy, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverState {
    Available,
    Reserved,
    Assigned,
}

impl DriverState {
    pub fn can_transition_to(self, next: DriverState) -> bool {
        matches!(
            (self, next),
            (DriverState::Available, DriverState::Reserved)
                | (DriverState::Reserved, DriverState::Assigned)
                | (DriverState::Reserved, DriverState::Available)
                | (DriverState::Assigned, DriverState::Available)
        )
    }
}

/// Temporary hold placed on a driver by a successful match.
#[derive(Clone, Debug, PartialEq)]
pub struct Reservation {
    pub rider_id: String,
    pub session_id: String,
    pub reserved_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl Reservation {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }
}

/// Last known state of a driver, owned by the registry.
#[derive(Clone, Debug, PartialEq)]
pub struct Driver {
    pub id: String,
    pub position: GeoPoint,
    /// Availability as last reported by the driver client
    pub online: bool,
    pub state: DriverState,
    pub last_update: OffsetDateTime,
    pub reservation: Option<Reservation>,
}

impl Driver {
    pub fn is_fresh(&self, now: OffsetDateTime, staleness: Duration) -> bool {
        now - self.last_update <= staleness
    }

    /// Whether the driver may be handed to a rider right now.
    pub fn is_eligible(&self, now: OffsetDateTime, staleness: Duration) -> bool {
        self.online && self.state == DriverState::Available && self.is_fresh(now, staleness)
    }

    /// Whether the driver belongs in the spatial index. Freshness is not
    /// part of this; stale entries are pruned by the sweeper and filtered
    /// at query time.
    pub(crate) fn is_indexable(&self) -> bool {
        self.online && self.state == DriverState::Available
    }
}
