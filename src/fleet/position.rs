use serde::Serialize;
use crate::error::DispatchError;

/// Earth radius in kilometers used for every great-circle distance
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A validated WGS-84 position in degrees.
///
/// Construction through [`GeoPoint::new`] guarantees latitude in [-90, 90]
/// and longitude in [-180, 180], so everything downstream of the HTTP layer
/// can assume well-formed coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoPoint {
    lat: f64,
    lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Result<Self, DispatchError> {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(DispatchError::InvalidArgument(format!(
                "latitude {} out of range [-90, 90]",
                lat
            )));
        }
        if !lng.is_finite() || !(-180.0..=180.0).contains(&lng) {
            return Err(DispatchError::InvalidArgument(format!(
                "longitude {} out of range [-180, 180]",
                lng
            )));
        }
        Ok(Self { lat, lng })
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lng(&self) -> f64 {
        self.lng
    }

    /// Great-circle distance to `other` in kilometers.
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        haversine_km(self, other)
    }
}

impl From<GeoPoint> for geo::Point<f64> {
    fn from(p: GeoPoint) -> Self {
        geo::Point::new(p.lng, p.lat)
    }
}

/// Haversine formula over a spherical Earth of radius [`EARTH_RADIUS_KM`].
pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    haversine_deg(a.lat, a.lng, b.lat, b.lng)
}

/// Haversine on raw degree pairs, for callers holding unvalidated cell centers.
pub(crate) fn haversine_deg(lat_a: f64, lng_a: f64, lat_b: f64, lng_b: f64) -> f64 {
    let lat1 = lat_a.to_radians();
    let lat2 = lat_b.to_radians();
    let delta_lat = (lat_b - lat_a).to_radians();
    let delta_lng = (lng_b - lng_a).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lng / 2.0).sin().powi(2);
    // asin is undefined past 1.0, which rounding can produce for antipodal points
    let c = 2.0 * h.sqrt().min(1.0).asin();

    EARTH_RADIUS_KM * c
}
