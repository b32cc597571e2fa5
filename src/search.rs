// =============================================================================
// SEARCH MODULE
// =============================================================================
// Proximity ranking: merges geospatial distance with stock availability.
// db.rs supplies pre-filtered candidate rows (available, in-stock, at active
// approved pharmacies); everything here is pure so it can be tested with
// synthetic rows. The computed distance lives on dedicated value objects
// instead of being bolted onto a shared entity type.
// =============================================================================

use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::geo;
use crate::models::{Medicine, Pharmacy, StockCandidate};

/// Default search cutoff when the caller supplies coordinates.
pub const DEFAULT_MAX_DISTANCE_KM: f64 = 50.0;

/// Default radius for the nearby-pharmacies endpoint.
pub const DEFAULT_NEARBY_RADIUS_KM: f64 = 10.0;

/// A pharmacy carrying one medicine's stock snapshot, plus its distance from
/// the caller when coordinates were supplied.
#[derive(Debug, Clone, Serialize)]
pub struct PharmacyWithStock {
    pub pharmacy_id: Uuid,
    pub name: String,
    pub address: String,
    pub phone: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
    pub stock_id: Uuid,
    pub price: Decimal,
    pub quantity: i32,
}

/// One search hit: a medicine with its ranked pharmacy list.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    #[serde(flatten)]
    pub medicine: Medicine,
    pub pharmacies: Vec<PharmacyWithStock>,
    pub total_pharmacies: usize,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
}

/// A pharmacy with its distance, for the nearby endpoint (coordinates are
/// mandatory there, so the distance is not optional).
#[derive(Debug, Clone, Serialize)]
pub struct PharmacyWithDistance {
    #[serde(flatten)]
    pub pharmacy: Pharmacy,
    pub distance_km: f64,
}

/// Whitespace tokenization; matching is OR across tokens downstream.
pub fn tokenize(query: &str) -> Vec<String> {
    query.split_whitespace().map(|t| t.to_string()).collect()
}

fn round_km(d: f64) -> f64 {
    (d * 100.0).round() / 100.0
}

/// Rank one medicine's stock candidates: compute distances when an origin is
/// given, drop candidates beyond `max_distance_km`, sort ascending. Without
/// an origin the incoming order is kept and no distance is attached.
pub fn rank_candidates(
    candidates: Vec<StockCandidate>,
    origin: Option<(f64, f64)>,
    max_distance_km: f64,
) -> Vec<PharmacyWithStock> {
    let mut ranked: Vec<PharmacyWithStock> = candidates
        .into_iter()
        .filter_map(|c| {
            let distance_km = match origin {
                Some((lat, lon)) => {
                    let d = geo::distance_km(lat, lon, c.latitude, c.longitude);
                    if d > max_distance_km {
                        return None;
                    }
                    Some(round_km(d))
                }
                None => None,
            };
            Some(PharmacyWithStock {
                pharmacy_id: c.pharmacy_id,
                name: c.pharmacy_name,
                address: c.pharmacy_address,
                phone: c.pharmacy_phone,
                latitude: c.latitude,
                longitude: c.longitude,
                distance_km,
                stock_id: c.stock_id,
                price: c.price,
                quantity: c.quantity,
            })
        })
        .collect();

    if origin.is_some() {
        ranked.sort_by(|a, b| {
            a.distance_km
                .partial_cmp(&b.distance_km)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
    ranked
}

/// Assemble search results: each medicine paired with its surviving
/// pharmacies. Medicines whose every candidate was filtered out are dropped
/// entirely, never returned with an empty pharmacy list.
pub fn build_results(
    medicines: Vec<Medicine>,
    candidates: Vec<StockCandidate>,
    origin: Option<(f64, f64)>,
    max_distance_km: f64,
) -> Vec<SearchResult> {
    medicines
        .into_iter()
        .filter_map(|medicine| {
            let own: Vec<StockCandidate> = candidates
                .iter()
                .filter(|c| c.medicine_id == medicine.id)
                .cloned()
                .collect();
            let pharmacies = rank_candidates(own, origin, max_distance_km);
            if pharmacies.is_empty() {
                return None;
            }
            let min_price = pharmacies.iter().map(|p| p.price).min();
            let max_price = pharmacies.iter().map(|p| p.price).max();
            Some(SearchResult {
                medicine,
                total_pharmacies: pharmacies.len(),
                min_price,
                max_price,
                pharmacies,
            })
        })
        .collect()
}

/// The nearby-pharmacies sibling: same distance-filter-sort, no medicine join.
pub fn pharmacies_within(
    pharmacies: Vec<Pharmacy>,
    lat: f64,
    lon: f64,
    radius_km: f64,
) -> Vec<PharmacyWithDistance> {
    let mut nearby: Vec<PharmacyWithDistance> = pharmacies
        .into_iter()
        .filter_map(|p| {
            let d = geo::distance_km(lat, lon, p.latitude, p.longitude);
            if d <= radius_km {
                Some(PharmacyWithDistance {
                    pharmacy: p,
                    distance_km: round_km(d),
                })
            } else {
                None
            }
        })
        .collect();

    nearby.sort_by(|a, b| {
        a.distance_km
            .partial_cmp(&b.distance_km)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    nearby
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const ORIGIN: (f64, f64) = (3.848, 11.502);

    fn medicine(name: &str) -> Medicine {
        let now = Utc::now();
        Medicine {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            dosage: Some("500mg".into()),
            form: Some("comprimé".into()),
            category: "analgesique".into(),
            average_price: None,
            requires_prescription: false,
            image_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn candidate(
        medicine_id: Uuid,
        name: &str,
        lat_offset: f64,
        price: Decimal,
        quantity: i32,
    ) -> StockCandidate {
        StockCandidate {
            medicine_id,
            stock_id: Uuid::new_v4(),
            quantity,
            price,
            pharmacy_id: Uuid::new_v4(),
            pharmacy_name: name.into(),
            pharmacy_address: "Yaoundé".into(),
            pharmacy_phone: "+237".into(),
            latitude: ORIGIN.0 + lat_offset,
            longitude: ORIGIN.1,
        }
    }

    #[test]
    fn tokenize_splits_on_whitespace() {
        assert_eq!(tokenize("dolipran  500"), vec!["dolipran", "500"]);
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn candidates_beyond_max_distance_are_dropped() {
        let m = medicine("Doliprane");
        // ~2.2 km and ~6.7 km from the origin.
        let near = candidate(m.id, "Near", 0.02, Decimal::from(1000), 5);
        let far = candidate(m.id, "Far", 0.06, Decimal::from(900), 5);

        let ranked = rank_candidates(vec![far, near], Some(ORIGIN), 5.0);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].name, "Near");
        assert!(ranked[0].distance_km.unwrap() < 5.0);
    }

    #[test]
    fn ranking_sorts_by_ascending_distance() {
        let m = medicine("Doliprane");
        let c1 = candidate(m.id, "Mid", 0.10, Decimal::from(1000), 5);
        let c2 = candidate(m.id, "Closest", 0.01, Decimal::from(1000), 5);
        let c3 = candidate(m.id, "Farthest", 0.20, Decimal::from(1000), 5);

        let ranked = rank_candidates(vec![c1, c2, c3], Some(ORIGIN), 50.0);
        let names: Vec<&str> = ranked.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Closest", "Mid", "Farthest"]);

        let distances: Vec<f64> = ranked.iter().map(|p| p.distance_km.unwrap()).collect();
        assert!(distances.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn without_origin_order_is_kept_and_distance_absent() {
        let m = medicine("Doliprane");
        let c1 = candidate(m.id, "First", 0.2, Decimal::from(1000), 5);
        let c2 = candidate(m.id, "Second", 0.01, Decimal::from(1000), 5);

        let ranked = rank_candidates(vec![c1, c2], None, 50.0);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].name, "First");
        assert!(ranked.iter().all(|p| p.distance_km.is_none()));
    }

    #[test]
    fn medicine_with_no_surviving_pharmacy_is_dropped() {
        let with_stock = medicine("Doliprane");
        let out_of_range = medicine("Efferalgan");
        let candidates = vec![
            candidate(with_stock.id, "Near", 0.01, Decimal::from(1000), 3),
            candidate(out_of_range.id, "Far", 1.0, Decimal::from(800), 3),
        ];

        let results = build_results(
            vec![with_stock.clone(), out_of_range],
            candidates,
            Some(ORIGIN),
            5.0,
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].medicine.name, "Doliprane");
        assert_eq!(results[0].total_pharmacies, 1);
    }

    #[test]
    fn price_range_covers_surviving_pharmacies_only() {
        let m = medicine("Doliprane");
        let candidates = vec![
            candidate(m.id, "Cheap", 0.01, Decimal::from(800), 3),
            candidate(m.id, "Pricey", 0.02, Decimal::from(1500), 3),
            // Cheapest of all, but out of range: must not drag min_price down.
            candidate(m.id, "TooFar", 0.5, Decimal::from(100), 3),
        ];

        let results = build_results(vec![m], candidates, Some(ORIGIN), 5.0);
        assert_eq!(results[0].total_pharmacies, 2);
        assert_eq!(results[0].min_price, Some(Decimal::from(800)));
        assert_eq!(results[0].max_price, Some(Decimal::from(1500)));
    }

    #[test]
    fn nearby_filters_and_sorts() {
        let now = Utc::now();
        let make = |name: &str, lat_offset: f64| Pharmacy {
            id: Uuid::new_v4(),
            name: name.into(),
            address: "Yaoundé".into(),
            phone: "+237".into(),
            email: None,
            latitude: ORIGIN.0 + lat_offset,
            longitude: ORIGIN.1,
            is_active: true,
            approval_status: "approved".into(),
            created_at: now,
            updated_at: now,
        };

        let nearby = pharmacies_within(
            vec![make("Far", 0.06), make("Near", 0.01), make("Mid", 0.03)],
            ORIGIN.0,
            ORIGIN.1,
            5.0,
        );
        let names: Vec<&str> = nearby.iter().map(|p| p.pharmacy.name.as_str()).collect();
        // "Far" is ~6.7 km out, beyond the 5 km radius.
        assert_eq!(names, vec!["Near", "Mid"]);
    }
}
