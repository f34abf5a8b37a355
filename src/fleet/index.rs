//! Bucketed spatial index over driver positions.
//!
//! Drivers are bucketed into H3 cells at a fixed resolution. The index only
//! stores driver ids; positions and eligibility are looked up from the
//! registry through a callback at query time, so the index never owns
//! driver data.

use std::collections::{HashMap, HashSet};
use h3o::{CellIndex, LatLng, Resolution};
use crate::error::DispatchError;
use crate::fleet::position::{haversine_deg, GeoPoint};

/// Default resolution: neighbor cell centers sit roughly 0.9 km apart.
pub const DEFAULT_RESOLUTION: Resolution = Resolution::Eight;

/// Upper bound on the ring search depth, independent of the radius.
pub const MAX_RING: u32 = 512;

/// Two candidates closer than this (in km) are treated as equidistant.
const TIE_EPSILON_KM: f64 = 1e-9;

/// Closest eligible driver found by a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Nearest {
    pub driver_id: String,
    pub position: GeoPoint,
    pub distance_km: f64,
}

impl Nearest {
    /// Whether a candidate at `distance_km` should replace this one:
    /// strictly closer, or equidistant with a smaller id.
    fn is_beaten_by(&self, driver_id: &str, distance_km: f64) -> bool {
        if distance_km < self.distance_km - TIE_EPSILON_KM {
            return true;
        }
        (distance_km - self.distance_km).abs() <= TIE_EPSILON_KM
            && driver_id < self.driver_id.as_str()
    }
}

#[derive(Debug)]
pub struct SpatialIndex {
    resolution: Resolution,
    /// Map from cell to the ids of drivers currently in that cell
    drivers_by_cell: HashMap<CellIndex, HashSet<String>>,
    /// Reverse mapping: driver id -> current cell (for efficient moves)
    driver_to_cell: HashMap<String, CellIndex>,
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::new(DEFAULT_RESOLUTION)
    }
}

impl SpatialIndex {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            drivers_by_cell: HashMap::new(),
            driver_to_cell: HashMap::new(),
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Cell containing `position` at this index's resolution.
    pub fn cell_for(&self, position: &GeoPoint) -> Result<CellIndex, DispatchError> {
        let latlng = LatLng::new(position.lat(), position.lng())
            .map_err(|e| DispatchError::InvalidArgument(format!("invalid position: {}", e)))?;
        Ok(latlng.to_cell(self.resolution))
    }

    /// Moves the driver into the cell for `position` when `available`,
    /// otherwise drops it from the index entirely.
    pub fn upsert(&mut self, id: &str, position: &GeoPoint, available: bool) -> Result<(), DispatchError> {
        if !available {
            self.remove(id);
            return Ok(());
        }

        let new_cell = self.cell_for(position)?;
        if self.driver_to_cell.get(id) == Some(&new_cell) {
            return Ok(());
        }

        self.detach(id);
        self.drivers_by_cell
            .entry(new_cell)
            .or_default()
            .insert(id.to_string());
        self.driver_to_cell.insert(id.to_string(), new_cell);
        Ok(())
    }

    /// Removes the driver from its bucket. Returns whether it was indexed.
    pub fn remove(&mut self, id: &str) -> bool {
        self.detach(id).is_some()
    }

    fn detach(&mut self, id: &str) -> Option<CellIndex> {
        let cell = self.driver_to_cell.remove(id)?;
        if let Some(ids) = self.drivers_by_cell.get_mut(&cell) {
            ids.remove(id);
            if ids.is_empty() {
                self.drivers_by_cell.remove(&cell);
            }
        }
        Some(cell)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.driver_to_cell.contains_key(id)
    }

    pub fn cell_of(&self, id: &str) -> Option<CellIndex> {
        self.driver_to_cell.get(id).copied()
    }

    /// Ids currently bucketed in `cell`.
    pub fn drivers_in_cell(&self, cell: CellIndex) -> Vec<String> {
        self.drivers_by_cell
            .get(&cell)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.driver_to_cell.len()
    }

    pub fn is_empty(&self) -> bool {
        self.driver_to_cell.is_empty()
    }

    pub fn occupied_cells(&self) -> usize {
        self.drivers_by_cell.len()
    }

    /// Returns the closest driver within `radius_km` of `origin`.
    ///
    /// `locate` resolves a driver id to its position, or `None` if the driver
    /// is not currently eligible (unavailable, reserved, stale). Ids in
    /// `exclude` are skipped without being resolved.
    ///
    /// The search walks outward ring by ring from the origin cell and stops
    /// once the radius is covered or the best candidate is closer than
    /// anything an unvisited ring could hold. When the ring disk would be
    /// larger than the set of occupied cells, every bucket is scanned
    /// directly instead.
    pub fn query_nearest<F>(
        &self,
        origin: &GeoPoint,
        radius_km: f64,
        exclude: &HashSet<String>,
        locate: F,
    ) -> Result<Option<Nearest>, DispatchError>
    where
        F: Fn(&str) -> Option<GeoPoint>,
    {
        if !radius_km.is_finite() || radius_km <= 0.0 {
            return Err(DispatchError::InvalidArgument(format!(
                "radius_km must be positive, got {}",
                radius_km
            )));
        }
        let origin_cell = self.cell_for(origin)?;
        if self.drivers_by_cell.is_empty() {
            return Ok(None);
        }

        let spacing = ring_spacing_km(origin_cell);
        let max_ring = rings_for_radius(radius_km, spacing);
        let mut best: Option<Nearest> = None;

        if disk_size(max_ring) >= self.drivers_by_cell.len() {
            log::debug!(
                "Scanning all {} occupied cells (ring disk {} would be larger)",
                self.drivers_by_cell.len(),
                max_ring
            );
            for ids in self.drivers_by_cell.values() {
                self.consider_bucket(ids, origin, radius_km, exclude, &locate, &mut best);
            }
            return Ok(best);
        }

        let mut rings: Vec<Vec<CellIndex>> = vec![Vec::new(); max_ring as usize + 1];
        for (cell, ring) in origin_cell.grid_disk_distances::<Vec<_>>(max_ring) {
            if let Some(cells) = rings.get_mut(ring as usize) {
                cells.push(cell);
            }
        }

        for (k, cells) in rings.iter().enumerate() {
            for cell in cells {
                if let Some(ids) = self.drivers_by_cell.get(cell) {
                    self.consider_bucket(ids, origin, radius_km, exclude, &locate, &mut best);
                }
            }
            // Anything beyond ring k is farther than covered_km(k)
            if let Some(found) = &best {
                if found.distance_km < covered_km(k as u32, spacing) {
                    log::debug!("Ring search settled at ring {} of {}", k, max_ring);
                    break;
                }
            }
        }

        Ok(best)
    }

    fn consider_bucket<F>(
        &self,
        ids: &HashSet<String>,
        origin: &GeoPoint,
        radius_km: f64,
        exclude: &HashSet<String>,
        locate: &F,
        best: &mut Option<Nearest>,
    ) where
        F: Fn(&str) -> Option<GeoPoint>,
    {
        for id in ids {
            if exclude.contains(id) {
                continue;
            }
            let Some(position) = locate(id) else {
                continue;
            };
            let distance_km = origin.distance_km(&position);
            if distance_km > radius_km {
                continue;
            }
            let replace = match best {
                None => true,
                Some(current) => current.is_beaten_by(id, distance_km),
            };
            if replace {
                *best = Some(Nearest {
                    driver_id: id.clone(),
                    position,
                    distance_km,
                });
            }
        }
    }
}

/// Smallest great-circle distance between `cell`'s center and the centers of
/// its immediate neighbors. Measured locally because H3 cell size varies
/// across the globe.
fn ring_spacing_km(cell: CellIndex) -> f64 {
    let center: LatLng = cell.into();
    cell.grid_disk::<Vec<_>>(1)
        .into_iter()
        .filter(|neighbor| *neighbor != cell)
        .map(|neighbor| {
            let p: LatLng = neighbor.into();
            haversine_deg(center.lat(), center.lng(), p.lat(), p.lng())
        })
        .fold(f64::INFINITY, f64::min)
}

/// Lower bound on the distance from any point of the origin cell to any
/// cell outside the k-ring disk. Ring boundaries advance by at least
/// sqrt(3)/2 of the center spacing per ring, and the query point may sit
/// off-center, so the bound is kept well under that rate.
fn covered_km(k: u32, spacing_km: f64) -> f64 {
    (0.75 * k as f64 - 0.25).max(0.0) * spacing_km
}

/// Ring depth whose guaranteed coverage reaches `radius_km`.
fn rings_for_radius(radius_km: f64, spacing_km: f64) -> u32 {
    if !spacing_km.is_finite() || spacing_km <= 0.0 {
        return MAX_RING;
    }
    let k = ((radius_km / spacing_km + 0.25) / 0.75).ceil();
    (k as u32).clamp(1, MAX_RING)
}

/// Number of cells in a k-ring disk.
fn disk_size(k: u32) -> usize {
    let k = k as usize;
    3 * k * (k + 1) + 1
}
