// =============================================================================
// GEO MODULE
// =============================================================================
// Great-circle distance between two coordinates. This is the only geographic
// primitive the service needs; at our scale an O(n) scan over pharmacies with
// this function beats maintaining a spatial index.
// =============================================================================

/// Mean Earth radius in kilometers.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance between two points, in kilometers.
///
/// Total over finite inputs; the caller is responsible for coordinate
/// validity. Returns the shorter arc.
pub fn distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

#[cfg(test)]
mod tests {
    use super::*;

    // Yaoundé city centre, used as the reference origin throughout.
    const YAOUNDE: (f64, f64) = (3.848, 11.502);

    #[test]
    fn distance_to_self_is_zero() {
        assert_eq!(distance_km(YAOUNDE.0, YAOUNDE.1, YAOUNDE.0, YAOUNDE.1), 0.0);
        assert_eq!(distance_km(0.0, 0.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn distance_is_symmetric() {
        let points = [
            (3.848, 11.502, 4.051, 9.768),   // Yaoundé <-> Douala
            (48.8566, 2.3522, 51.5074, -0.1278), // Paris <-> London
            (-33.9249, 18.4241, 35.6762, 139.6503), // Cape Town <-> Tokyo
        ];
        for (lat1, lon1, lat2, lon2) in points {
            let ab = distance_km(lat1, lon1, lat2, lon2);
            let ba = distance_km(lat2, lon2, lat1, lon1);
            let rel = (ab - ba).abs() / ab.max(ba);
            assert!(rel < 1e-9, "asymmetry {rel} for {lat1},{lon1} <-> {lat2},{lon2}");
        }
    }

    #[test]
    fn yaounde_douala_is_about_210_km() {
        // Road distance is ~240 km; great-circle is shorter.
        let d = distance_km(3.848, 11.502, 4.051, 9.768);
        assert!((190.0..230.0).contains(&d), "got {d}");
    }

    #[test]
    fn one_degree_of_latitude_is_about_111_km() {
        let d = distance_km(0.0, 0.0, 1.0, 0.0);
        assert!((110.0..112.5).contains(&d), "got {d}");
    }

    #[test]
    fn nearby_point_is_under_filter_radius() {
        // ~2.2 km north of the origin: must survive a 5 km radius filter.
        let d = distance_km(YAOUNDE.0, YAOUNDE.1, YAOUNDE.0 + 0.02, YAOUNDE.1);
        assert!(d < 5.0, "got {d}");
    }

    #[test]
    fn far_point_is_over_filter_radius() {
        // ~6.7 km north of the origin: must be excluded at 5 km.
        let d = distance_km(YAOUNDE.0, YAOUNDE.1, YAOUNDE.0 + 0.06, YAOUNDE.1);
        assert!(d > 5.0, "got {d}");
    }
}
