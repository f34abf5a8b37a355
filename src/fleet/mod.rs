//! Shared driver state: the registry of driver records and the spatial
//! index it keeps in step with them.

mod position;
mod index;
mod registry;
mod types;

pub use position::{haversine_km, GeoPoint, EARTH_RADIUS_KM};
pub use index::{Nearest, SpatialIndex, DEFAULT_RESOLUTION, MAX_RING};
pub use registry::{DriverRegistry, FleetStats, DEFAULT_RESERVATION_TIMEOUT, DEFAULT_STALENESS};
pub use types::{Driver, DriverState, Reservation};
