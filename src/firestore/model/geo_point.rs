use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Latitude/longitude pair stored as a field value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> FirestoreResult<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(invalid_argument(format!(
                "Latitude must be a number between -90 and 90, got {latitude}"
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(invalid_argument(format!(
                "Longitude must be a number between -180 and 180, got {longitude}"
            )));
        }
        Ok(Self { latitude, longitude })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Query ordering: latitude first, then longitude.
    pub fn compare(&self, other: &GeoPoint) -> Ordering {
        self.latitude
            .total_cmp(&other.latitude)
            .then_with(|| self.longitude.total_cmp(&other.longitude))
    }
}

impl Display for GeoPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "geo({},{})", self.latitude, self.longitude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;

    #[test]
    fn rejects_out_of_range_and_nan() {
        assert_eq!(
            GeoPoint::new(91.0, 0.0).unwrap_err().code,
            FirestoreErrorCode::InvalidArgument
        );
        assert!(GeoPoint::new(0.0, f64::NAN).is_err());
        assert!(GeoPoint::new(-90.0, 180.0).is_ok());
    }

    #[test]
    fn orders_by_latitude_then_longitude() {
        let south = GeoPoint::new(-10.0, 50.0).unwrap();
        let north_west = GeoPoint::new(10.0, -50.0).unwrap();
        let north_east = GeoPoint::new(10.0, 50.0).unwrap();
        assert_eq!(south.compare(&north_west), Ordering::Less);
        assert_eq!(north_west.compare(&north_east), Ordering::Less);
        assert_eq!(north_east.to_string(), "geo(10,50)");
    }
}
