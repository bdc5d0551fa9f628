//! Geographic types and calculations for flight tracking

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Minimum number of vertices a danger-zone ring must be built from
pub const MIN_POLYGON_VERTICES: usize = 4;

/// Geographic position with latitude, longitude, and altitude
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoPosition {
    /// Latitude in degrees (-90 to 90)
    pub latitude: f64,
    /// Longitude in degrees (-180 to 180)
    pub longitude: f64,
    /// Altitude in meters
    pub altitude: f64,
}

impl GeoPosition {
    /// Create a new geographic position
    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
        }
    }

    /// Create a ground-level position from degrees
    pub fn from_degrees(lat_deg: f64, lng_deg: f64) -> Self {
        Self::new(lat_deg, lng_deg, 0.0)
    }

    /// Check if this position is valid
    pub fn is_valid(&self) -> bool {
        is_valid_coordinate(self.latitude, self.longitude)
    }

    /// Great-circle distance to another position using the Haversine formula.
    /// Returns distance in meters; altitude is ignored.
    pub fn distance_to(&self, other: &GeoPosition) -> f64 {
        haversine_distance(
            self.latitude,
            self.longitude,
            other.latitude,
            other.longitude,
        )
    }

    /// Initial bearing to another position in degrees (0-360)
    pub fn bearing_to(&self, other: &GeoPosition) -> f64 {
        bearing(self.latitude, self.longitude, other.latitude, other.longitude)
    }
}

/// Check latitude/longitude ranges
pub fn is_valid_coordinate(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}

/// Haversine great-circle distance in meters
pub fn haversine_distance(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lng = (lng2 - lng1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Initial great-circle bearing in degrees, normalized to 0-360
pub fn bearing(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_lng = (lng2 - lng1).to_radians();

    let y = delta_lng.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * delta_lng.cos();

    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

/// A polygon vertex
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Geographic bounding box used to short-circuit containment tests
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl GeoBounds {
    pub fn new(min_lat: f64, max_lat: f64, min_lng: f64, max_lng: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        }
    }

    /// Check if a point is within these bounds (edges inclusive)
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        latitude >= self.min_lat
            && latitude <= self.max_lat
            && longitude >= self.min_lng
            && longitude <= self.max_lng
    }
}

/// Closed polygon ring. The first vertex is always repeated as the last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Coordinate>", into = "Vec<Coordinate>")]
pub struct Polygon {
    ring: Vec<Coordinate>,
}

impl Polygon {
    /// Build a polygon from at least four vertices, closing the ring if needed
    pub fn new(mut vertices: Vec<Coordinate>) -> CoreResult<Self> {
        if vertices.len() < MIN_POLYGON_VERTICES {
            return Err(CoreError::invalid_zone(format!(
                "polygon must have at least {} coordinates, got {}",
                MIN_POLYGON_VERTICES,
                vertices.len()
            )));
        }

        if let Some(bad) = vertices
            .iter()
            .find(|v| !is_valid_coordinate(v.latitude, v.longitude))
        {
            return Err(CoreError::invalid_position(bad.latitude, bad.longitude));
        }

        let first = vertices[0];
        if vertices.last() != Some(&first) {
            vertices.push(first);
        }

        Ok(Self { ring: vertices })
    }

    /// Vertices of the closed ring
    pub fn ring(&self) -> &[Coordinate] {
        &self.ring
    }

    /// Ray-casting point-in-polygon test.
    /// Points on the bounding box but outside the ring are rejected.
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        if !self.bounds().contains(latitude, longitude) {
            return false;
        }

        let mut inside = false;
        let n = self.ring.len();
        let mut j = n - 1;

        for i in 0..n {
            let vi = &self.ring[i];
            let vj = &self.ring[j];

            if ((vi.longitude > longitude) != (vj.longitude > longitude))
                && (latitude
                    < (vj.latitude - vi.latitude) * (longitude - vi.longitude)
                        / (vj.longitude - vi.longitude)
                        + vi.latitude)
            {
                inside = !inside;
            }
            j = i;
        }

        inside
    }

    /// Bounding box of the ring
    pub fn bounds(&self) -> GeoBounds {
        let min_lat = self.ring.iter().map(|v| v.latitude).fold(f64::MAX, f64::min);
        let max_lat = self.ring.iter().map(|v| v.latitude).fold(f64::MIN, f64::max);
        let min_lng = self.ring.iter().map(|v| v.longitude).fold(f64::MAX, f64::min);
        let max_lng = self.ring.iter().map(|v| v.longitude).fold(f64::MIN, f64::max);

        GeoBounds::new(min_lat, max_lat, min_lng, max_lng)
    }
}

impl TryFrom<Vec<Coordinate>> for Polygon {
    type Error = CoreError;

    fn try_from(vertices: Vec<Coordinate>) -> Result<Self, Self::Error> {
        Polygon::new(vertices)
    }
}

impl From<Polygon> for Vec<Coordinate> {
    fn from(polygon: Polygon) -> Self {
        polygon.ring
    }
}

// ============================================================================
// TESTS
// ============================================================================
