use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::error::{AppError, ErrorKind};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

typed_id!(UserId);
typed_id!(RegionId);
typed_id!(RoomId);

// --- Coordinates ---

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum CoordinateError {
    #[error("Latitude {0} is out of valid range [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("Longitude {0} is out of valid range [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("Coordinate value is not finite (NaN or Infinity)")]
    NonFinite,
}

impl From<CoordinateError> for AppError {
    fn from(e: CoordinateError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

/// A validated WGS84 point. Immutable once constructed; deserialization runs the same checks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPoint", into = "RawPoint")]
pub struct GeoPoint {
    lat: f64,
    lng: f64,
}

#[derive(Serialize, Deserialize)]
struct RawPoint {
    lat: f64,
    lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Result<Self, CoordinateError> {
        if !lat.is_finite() || !lng.is_finite() {
            return Err(CoordinateError::NonFinite);
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(CoordinateError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(CoordinateError::LongitudeOutOfRange(lng));
        }
        Ok(Self { lat, lng })
    }

    #[must_use]
    pub const fn lat(self) -> f64 {
        self.lat
    }

    #[must_use]
    pub const fn lng(self) -> f64 {
        self.lng
    }

    #[must_use]
    pub fn distance_to(self, other: Self) -> f64 {
        haversine_distance(self, other)
    }

    /// `lat,lng` as the geocoding provider expects it.
    #[must_use]
    pub fn to_query_value(self) -> String {
        format!("{},{}", self.lat, self.lng)
    }
}

impl TryFrom<(f64, f64)> for GeoPoint {
    type Error = CoordinateError;

    fn try_from((lat, lng): (f64, f64)) -> Result<Self, Self::Error> {
        Self::new(lat, lng)
    }
}

impl TryFrom<RawPoint> for GeoPoint {
    type Error = CoordinateError;

    fn try_from(raw: RawPoint) -> Result<Self, Self::Error> {
        Self::new(raw.lat, raw.lng)
    }
}

impl From<GeoPoint> for RawPoint {
    fn from(point: GeoPoint) -> Self {
        Self {
            lat: point.lat,
            lng: point.lng,
        }
    }
}

// --- Resolved location ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationSource {
    ExplicitSearch,
    SavedPreference,
    DeviceGps,
}

impl fmt::Display for LocationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ExplicitSearch => "explicit_search",
            Self::SavedPreference => "saved_preference",
            Self::DeviceGps => "device_gps",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedLocation {
    pub point: GeoPoint,
    pub formatted_address: String,
    pub source: LocationSource,
}

impl ResolvedLocation {
    pub fn new(point: GeoPoint, formatted_address: impl Into<String>, source: LocationSource) -> Self {
        Self {
            point,
            formatted_address: formatted_address.into(),
            source,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: LocationSource) -> Self {
        self.source = source;
        self
    }
}

// --- Distance helpers ---

#[must_use]
pub fn haversine_distance(p1: GeoPoint, p2: GeoPoint) -> f64 {
    const EPSILON: f64 = 1e-10;

    if (p1.lat - p2.lat).abs() < EPSILON && (p1.lng - p2.lng).abs() < EPSILON {
        return 0.0;
    }

    let lat1_rad = p1.lat.to_radians();
    let lat2_rad = p2.lat.to_radians();
    let delta_lat = (p2.lat - p1.lat).to_radians();
    let delta_lng = (p2.lng - p1.lng).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lng / 2.0).sin().powi(2);
    let a = a.clamp(0.0, 1.0);
    let c = 2.0 * a.sqrt().asin();

    let result = EARTH_RADIUS_M * c;
    if result.is_finite() {
        result
    } else {
        f64::MAX
    }
}

#[must_use]
pub fn format_distance(meters: f64) -> String {
    if !meters.is_finite() || meters < 0.0 {
        return "Unknown".to_string();
    }

    if meters < 1000.0 {
        format!("{meters:.0} m")
    } else if meters < 10_000.0 {
        format!("{:.1} km", meters / 1000.0)
    } else {
        format!("{:.0} km", meters / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn point_rejects_nan_and_infinity() {
        assert_eq!(GeoPoint::new(f64::NAN, 0.0), Err(CoordinateError::NonFinite));
        assert_eq!(GeoPoint::new(0.0, f64::INFINITY), Err(CoordinateError::NonFinite));
    }

    #[test]
    fn point_rejects_out_of_range() {
        assert!(matches!(
            GeoPoint::new(90.5, 0.0),
            Err(CoordinateError::LatitudeOutOfRange(_))
        ));
        assert!(matches!(
            GeoPoint::new(0.0, -180.5),
            Err(CoordinateError::LongitudeOutOfRange(_))
        ));
    }

    #[test]
    fn point_accepts_bounds() {
        assert!(GeoPoint::new(90.0, 180.0).is_ok());
        assert!(GeoPoint::new(-90.0, -180.0).is_ok());
    }

    #[test]
    fn deserialize_validates() {
        let ok: Result<GeoPoint, _> = serde_json::from_str(r#"{"lat":10.776,"lng":106.7}"#);
        assert!(ok.is_ok());
        let bad: Result<GeoPoint, _> = serde_json::from_str(r#"{"lat":123.0,"lng":106.7}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn query_value_is_lat_comma_lng() {
        let point = GeoPoint::new(10.776, 106.7).unwrap();
        assert_eq!(point.to_query_value(), "10.776,106.7");
    }

    #[test]
    fn haversine_known_distance() {
        // about 820 m apart in District 1
        let a = GeoPoint::new(10.7725, 106.6980).unwrap();
        let b = GeoPoint::new(10.7798, 106.6990).unwrap();
        let d = haversine_distance(a, b);
        assert!(d > 700.0 && d < 1_000.0, "distance was {d}");
    }

    #[test]
    fn format_distance_units() {
        assert_eq!(format_distance(850.0), "850 m");
        assert_eq!(format_distance(2_400.0), "2.4 km");
        assert_eq!(format_distance(25_000.0), "25 km");
        assert_eq!(format_distance(f64::NAN), "Unknown");
    }

    #[test]
    fn typed_ids_serialize_transparently() {
        let id = RegionId::new("79");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"79\"");
    }

    proptest! {
        #[test]
        fn valid_ranges_always_construct(lat in -90.0f64..=90.0, lng in -180.0f64..=180.0) {
            let point = GeoPoint::new(lat, lng).unwrap();
            prop_assert_eq!(point.lat(), lat);
            prop_assert_eq!(point.lng(), lng);
        }

        #[test]
        fn distance_is_symmetric(
            a in (-89.0f64..89.0, -179.0f64..179.0),
            b in (-89.0f64..89.0, -179.0f64..179.0),
        ) {
            let p1 = GeoPoint::new(a.0, a.1).unwrap();
            let p2 = GeoPoint::new(b.0, b.1).unwrap();
            prop_assert!((haversine_distance(p1, p2) - haversine_distance(p2, p1)).abs() < 1e-6);
        }
    }
}
