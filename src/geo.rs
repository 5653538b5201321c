use geo::{HaversineDistance, Point};

/// Great-circle distance between two coordinates, in meters.
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let a = Point::new(lon1, lat1);
    let b = Point::new(lon2, lat2);
    a.haversine_distance(&b)
}

/// Offset a coordinate by east/north meters. Flat-earth approximation,
/// fine at the few-kilometer scale the simulator needs.
pub fn offset_by_meters(lat: f64, lon: f64, east_m: f64, north_m: f64) -> (f64, f64) {
    const R: f64 = 6_371_000.0;
    let d_lat = north_m / R;
    let d_lon = east_m / (R * lat.to_radians().cos());
    (lat + d_lat.to_degrees(), lon + d_lon.to_degrees())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_zero_distance() {
        assert_relative_eq!(
            distance_meters(37.5665, 126.978, 37.5665, 126.978),
            0.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_one_degree_latitude() {
        // One degree of latitude is ~111.2 km everywhere.
        let d = distance_meters(37.0, 126.978, 38.0, 126.978);
        assert_relative_eq!(d, 111_195.0, max_relative = 0.01);
    }

    #[test]
    fn test_offset_round_trips_through_distance() {
        let (lat, lon) = (37.5665, 126.978);
        let (lat2, lon2) = offset_by_meters(lat, lon, 300.0, 400.0);
        let d = distance_meters(lat, lon, lat2, lon2);
        assert_relative_eq!(d, 500.0, max_relative = 0.01);
    }
}
