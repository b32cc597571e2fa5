// =============================================================================
// MODELS MODULE
// =============================================================================
// Entities mapped from database rows, API request/response structures, and
// the reservation state machine's pure transition rules. Keeping the
// transition table here (instead of inside SQL) lets it be tested without a
// database; db.rs only persists outcomes this module has already validated.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::AppError;

// =============================================================================
// ENTITIES
// =============================================================================

/// Catalog entry. Immutable reference data from this service's perspective.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Medicine {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub dosage: Option<String>,
    pub form: Option<String>,
    pub category: String,
    pub average_price: Option<Decimal>,
    pub requires_prescription: bool,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A physical pharmacy. Only `approved` + `active` pharmacies are visible
/// to search.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Pharmacy {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    pub phone: String,
    pub email: Option<String>,
    /// Decimal degrees
    pub latitude: f64,
    pub longitude: f64,
    pub is_active: bool,
    /// pending / approved / rejected
    pub approval_status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const APPROVAL_APPROVED: &str = "approved";

/// The contended resource: one quantity counter per (pharmacy, medicine).
///
/// Invariant: `is_available` is false whenever `quantity == 0`. The converse
/// does not hold; a pharmacy may flag stock unavailable while quantity > 0,
/// and restores never override that manual flag.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Stock {
    pub id: Uuid,
    pub pharmacy_id: Uuid,
    pub medicine_id: Uuid,
    pub quantity: i32,
    pub price: Decimal,
    pub is_available: bool,
    pub last_updated: DateTime<Utc>,
}

/// A held order for pickup, progressing through the status lifecycle below.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Reservation {
    pub id: Uuid,
    /// Format: RES-<year>-<6 alphanumeric>
    pub reservation_number: String,
    pub user_id: Uuid,
    pub pharmacy_id: Uuid,
    pub status: String,
    pub contact_name: String,
    pub contact_phone: String,
    pub contact_email: Option<String>,
    pub pickup_date: DateTime<Utc>,
    pub notes: Option<String>,
    pub pharmacy_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub collected_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
}

/// One medicine line within a reservation. `stock_id` is nullable: the stock
/// row may be deleted later, but the decrement already applied must persist.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReservationItem {
    pub id: Uuid,
    pub reservation_id: Uuid,
    pub medicine_id: Uuid,
    pub stock_id: Option<Uuid>,
    pub quantity: i32,
    /// Snapshotted from the stock at creation; 0 when no stock reference.
    pub unit_price: Decimal,
    /// True iff the stock's quantity currently reflects this item's
    /// decrement. Checked-and-cleared atomically with any restore.
    pub stock_decremented: bool,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// RESERVATION STATE MACHINE
// =============================================================================
// pending -> confirmed -> ready -> collected, with side exits to cancelled
// and expired from any of the three active states. Terminal states are final.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Ready,
    Collected,
    Cancelled,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Ready => "ready",
            ReservationStatus::Collected => "collected",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReservationStatus::Pending),
            "confirmed" => Some(ReservationStatus::Confirmed),
            "ready" => Some(ReservationStatus::Ready),
            "collected" => Some(ReservationStatus::Collected),
            "cancelled" => Some(ReservationStatus::Cancelled),
            "expired" => Some(ReservationStatus::Expired),
            _ => None,
        }
    }

    /// Still holding stock and still transitionable.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Pending | ReservationStatus::Confirmed | ReservationStatus::Ready
        )
    }

    pub fn is_cancellable(&self) -> bool {
        self.is_active()
    }
}

/// The events that move a reservation through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationEvent {
    Confirm,
    MarkReady,
    MarkCollected,
    Cancel,
    Expire,
}

impl ReservationEvent {
    pub fn target(&self) -> ReservationStatus {
        match self {
            ReservationEvent::Confirm => ReservationStatus::Confirmed,
            ReservationEvent::MarkReady => ReservationStatus::Ready,
            ReservationEvent::MarkCollected => ReservationStatus::Collected,
            ReservationEvent::Cancel => ReservationStatus::Cancelled,
            ReservationEvent::Expire => ReservationStatus::Expired,
        }
    }

    /// Map a requested target status (pharmacy-side `update_status` body)
    /// to the event that reaches it.
    pub fn from_requested_status(status: &str) -> Option<Self> {
        match status {
            "confirmed" => Some(ReservationEvent::Confirm),
            "ready" => Some(ReservationEvent::MarkReady),
            "collected" => Some(ReservationEvent::MarkCollected),
            "cancelled" => Some(ReservationEvent::Cancel),
            _ => None,
        }
    }

    /// Whether the event restores stock as a side effect.
    pub fn restores_stock(&self) -> bool {
        matches!(self, ReservationEvent::Cancel | ReservationEvent::Expire)
    }
}

/// Validate one step of the lifecycle. Illegal transitions fail loudly and
/// identify both ends; they never silently no-op.
pub fn transition(
    from: ReservationStatus,
    event: ReservationEvent,
) -> Result<ReservationStatus, AppError> {
    let allowed = match event {
        ReservationEvent::Confirm => from == ReservationStatus::Pending,
        ReservationEvent::MarkReady => {
            matches!(from, ReservationStatus::Pending | ReservationStatus::Confirmed)
        }
        ReservationEvent::MarkCollected => {
            matches!(from, ReservationStatus::Confirmed | ReservationStatus::Ready)
        }
        ReservationEvent::Cancel | ReservationEvent::Expire => from.is_active(),
    };

    if allowed {
        Ok(event.target())
    } else {
        Err(AppError::IllegalTransition {
            from: from.as_str().to_string(),
            to: event.target().as_str().to_string(),
        })
    }
}

/// Expiry predicate: past its deadline and still holding stock.
pub fn is_expired(status: ReservationStatus, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    status.is_active() && now > expires_at
}

/// Expiry deadline: explicit value, or pickup + 24h.
pub fn expiry_deadline(
    pickup_date: DateTime<Utc>,
    explicit: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    explicit.unwrap_or(pickup_date + Duration::hours(24))
}

/// Generate a reservation number: RES-<year>-<6 uppercase alphanumeric>.
/// Uniqueness is probabilistic; the caller retries on a unique-constraint
/// collision.
pub fn generate_reservation_number(year: i32) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("RES-{}-{}", year, hex[..6].to_uppercase())
}

// =============================================================================
// CART
// =============================================================================

pub const CART_ACTIVE: &str = "active";
pub const CART_COMPLETED: &str = "completed";

/// Staging list. Never mutates stock; availability is only validated
/// optimistically at add-time and quantity-update time.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Cart {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// JOINED ROW TYPES
// =============================================================================
// Flat row shapes for queries that join across tables.

/// A stock row joined with its pharmacy, as fed into proximity ranking.
#[derive(Debug, Clone, FromRow)]
pub struct StockCandidate {
    pub medicine_id: Uuid,
    pub stock_id: Uuid,
    pub quantity: i32,
    pub price: Decimal,
    pub pharmacy_id: Uuid,
    pub pharmacy_name: String,
    pub pharmacy_address: String,
    pub pharmacy_phone: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Reservation item joined with its medicine name, for responses.
#[derive(Debug, Clone, FromRow)]
pub struct ReservationItemDetail {
    pub id: Uuid,
    pub medicine_id: Uuid,
    pub medicine_name: String,
    pub stock_id: Option<Uuid>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub stock_decremented: bool,
}

/// One reservation plus the pharmacy fields its responses embed.
#[derive(Debug, Clone)]
pub struct ReservationBundle {
    pub reservation: Reservation,
    pub pharmacy_name: String,
    pub pharmacy_address: String,
    pub pharmacy_phone: String,
    pub items: Vec<ReservationItemDetail>,
}

/// List-view row with SQL-aggregated totals.
#[derive(Debug, Clone, FromRow)]
pub struct ReservationListRow {
    pub id: Uuid,
    pub reservation_number: String,
    pub status: String,
    pub pharmacy_name: String,
    pub pickup_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub total_items: i64,
    pub total_price: Decimal,
}

/// Stock row joined with its medicine, for the pharmacy detail view.
#[derive(Debug, Clone, FromRow)]
pub struct PharmacyStockRow {
    pub stock_id: Uuid,
    pub price: Decimal,
    pub quantity: i32,
    pub medicine_id: Uuid,
    pub medicine_name: String,
    pub dosage: Option<String>,
    pub form: Option<String>,
    pub category: String,
    pub requires_prescription: bool,
}

/// Cart item joined with medicine and pharmacy names.
#[derive(Debug, Clone, FromRow)]
pub struct CartItemDetail {
    pub id: Uuid,
    pub medicine_id: Uuid,
    pub medicine_name: String,
    pub pharmacy_id: Uuid,
    pub pharmacy_name: String,
    pub stock_id: Option<Uuid>,
    pub quantity: i32,
    pub unit_price: Decimal,
}

// =============================================================================
// API REQUEST STRUCTURES
// =============================================================================

fn default_item_quantity() -> i32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateReservationItem {
    pub medicine_id: Uuid,
    pub stock_id: Option<Uuid>,
    #[serde(default = "default_item_quantity")]
    pub quantity: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateReservationRequest {
    pub pharmacy_id: Uuid,
    pub items: Vec<CreateReservationItem>,
    pub contact_name: String,
    pub contact_phone: String,
    pub contact_email: Option<String>,
    pub pickup_date: DateTime<Utc>,
    /// Optional explicit deadline; defaults to pickup_date + 24h.
    pub expires_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelReservationRequest {
    pub reason: Option<String>,
}

/// Pharmacy-side status update: a target status plus an optional note.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddCartItemRequest {
    pub medicine_id: Uuid,
    pub pharmacy_id: Uuid,
    pub stock_id: Option<Uuid>,
    #[serde(default = "default_item_quantity")]
    pub quantity: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateCartItemRequest {
    pub quantity: i32,
}

// =============================================================================
// API RESPONSE STRUCTURES
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ReservationItemResponse {
    pub id: Uuid,
    pub medicine_id: Uuid,
    pub medicine_name: String,
    pub stock_id: Option<Uuid>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReservationResponse {
    pub id: Uuid,
    pub reservation_number: String,
    pub status: String,
    pub user_id: Uuid,
    pub pharmacy_id: Uuid,
    pub pharmacy_name: String,
    pub pharmacy_address: String,
    pub pharmacy_phone: String,
    pub contact_name: String,
    pub contact_phone: String,
    pub contact_email: Option<String>,
    pub pickup_date: DateTime<Utc>,
    pub notes: Option<String>,
    pub pharmacy_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub collected_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub items: Vec<ReservationItemResponse>,
    pub total_items: i64,
    pub total_price: Decimal,
    pub is_cancellable: bool,
}

impl ReservationResponse {
    /// Assemble the full representation. Totals are always derived from the
    /// item lines, never read from storage.
    pub fn from_bundle(bundle: ReservationBundle) -> Self {
        let items: Vec<ReservationItemResponse> = bundle
            .items
            .into_iter()
            .map(|item| ReservationItemResponse {
                id: item.id,
                medicine_id: item.medicine_id,
                medicine_name: item.medicine_name,
                stock_id: item.stock_id,
                quantity: item.quantity,
                unit_price: item.unit_price,
                subtotal: Decimal::from(item.quantity) * item.unit_price,
            })
            .collect();

        let total_items: i64 = items.iter().map(|i| i.quantity as i64).sum();
        let total_price: Decimal = items.iter().map(|i| i.subtotal).sum();
        let is_cancellable = ReservationStatus::parse(&bundle.reservation.status)
            .map(|s| s.is_cancellable())
            .unwrap_or(false);

        let r = bundle.reservation;
        Self {
            id: r.id,
            reservation_number: r.reservation_number,
            status: r.status,
            user_id: r.user_id,
            pharmacy_id: r.pharmacy_id,
            pharmacy_name: bundle.pharmacy_name,
            pharmacy_address: bundle.pharmacy_address,
            pharmacy_phone: bundle.pharmacy_phone,
            contact_name: r.contact_name,
            contact_phone: r.contact_phone,
            contact_email: r.contact_email,
            pickup_date: r.pickup_date,
            notes: r.notes,
            pharmacy_notes: r.pharmacy_notes,
            created_at: r.created_at,
            updated_at: r.updated_at,
            confirmed_at: r.confirmed_at,
            ready_at: r.ready_at,
            collected_at: r.collected_at,
            cancelled_at: r.cancelled_at,
            expires_at: r.expires_at,
            items,
            total_items,
            total_price,
            is_cancellable,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReservationListEntry {
    pub id: Uuid,
    pub reservation_number: String,
    pub status: String,
    pub pharmacy_name: String,
    pub pickup_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub total_items: i64,
    pub total_price: Decimal,
    pub is_cancellable: bool,
}

impl From<ReservationListRow> for ReservationListEntry {
    fn from(row: ReservationListRow) -> Self {
        let is_cancellable = ReservationStatus::parse(&row.status)
            .map(|s| s.is_cancellable())
            .unwrap_or(false);
        Self {
            id: row.id,
            reservation_number: row.reservation_number,
            status: row.status,
            pharmacy_name: row.pharmacy_name,
            pickup_date: row.pickup_date,
            created_at: row.created_at,
            total_items: row.total_items,
            total_price: row.total_price,
            is_cancellable,
        }
    }
}

/// Role-scoped counts by status.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ReservationStats {
    pub total: i64,
    pub pending: i64,
    pub confirmed: i64,
    pub ready: i64,
    pub collected: i64,
    pub cancelled: i64,
    pub expired: i64,
    /// Reservations whose pickup date falls on the current day.
    pub today: i64,
    /// pending + confirmed + ready
    pub active: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CartItemResponse {
    pub id: Uuid,
    pub medicine_id: Uuid,
    pub medicine_name: String,
    pub pharmacy_id: Uuid,
    pub pharmacy_name: String,
    pub stock_id: Option<Uuid>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct CartResponse {
    pub id: Uuid,
    pub status: String,
    pub items: Vec<CartItemResponse>,
    pub total_items: i64,
    pub total_price: Decimal,
}

impl CartResponse {
    pub fn build(cart: Cart, items: Vec<CartItemDetail>) -> Self {
        let items: Vec<CartItemResponse> = items
            .into_iter()
            .map(|item| CartItemResponse {
                id: item.id,
                medicine_id: item.medicine_id,
                medicine_name: item.medicine_name,
                pharmacy_id: item.pharmacy_id,
                pharmacy_name: item.pharmacy_name,
                stock_id: item.stock_id,
                quantity: item.quantity,
                unit_price: item.unit_price,
                subtotal: Decimal::from(item.quantity) * item.unit_price,
            })
            .collect();
        let total_items: i64 = items.iter().map(|i| i.quantity as i64).sum();
        let total_price: Decimal = items.iter().map(|i| i.subtotal).sum();
        Self {
            id: cart.id,
            status: cart.status,
            items,
            total_items,
            total_price,
        }
    }
}

/// Pharmacy detail with its stocked, available medicines. Deserialize is
/// needed for the cache read-through path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PharmacyDetailResponse {
    #[serde(flatten)]
    pub pharmacy: Pharmacy,
    pub medicines: Vec<StockedMedicine>,
    pub total_medicines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockedMedicine {
    pub medicine_id: Uuid,
    pub name: String,
    pub dosage: Option<String>,
    pub form: Option<String>,
    pub category: String,
    pub requires_prescription: bool,
    pub stock_id: Uuid,
    pub price: Decimal,
    pub quantity: i32,
}

// =============================================================================
// HEALTH & ERROR RESPONSES
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub database: bool,
    pub redis: bool,
}

/// API error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ReservationEvent::*;
    use ReservationStatus::*;

    fn all_statuses() -> [ReservationStatus; 6] {
        [Pending, Confirmed, Ready, Collected, Cancelled, Expired]
    }

    #[test]
    fn transition_table_matches_design() {
        // (event, states that may fire it)
        let table: [(ReservationEvent, &[ReservationStatus]); 5] = [
            (Confirm, &[Pending]),
            (MarkReady, &[Pending, Confirmed]),
            (MarkCollected, &[Confirmed, Ready]),
            (Cancel, &[Pending, Confirmed, Ready]),
            (Expire, &[Pending, Confirmed, Ready]),
        ];

        for (event, allowed_from) in table {
            for from in all_statuses() {
                let result = transition(from, event);
                if allowed_from.contains(&from) {
                    assert_eq!(result.unwrap(), event.target(), "{from:?} + {event:?}");
                } else {
                    let err = result.unwrap_err();
                    match err {
                        AppError::IllegalTransition { from: f, to } => {
                            assert_eq!(f, from.as_str());
                            assert_eq!(to, event.target().as_str());
                        }
                        other => panic!("expected IllegalTransition, got {other:?}"),
                    }
                }
            }
        }
    }

    #[test]
    fn no_transition_leaves_a_terminal_state() {
        for from in [Collected, Cancelled, Expired] {
            for event in [Confirm, MarkReady, MarkCollected, Cancel, Expire] {
                assert!(transition(from, event).is_err(), "{from:?} + {event:?}");
            }
        }
    }

    #[test]
    fn confirm_twice_is_rejected() {
        let confirmed = transition(Pending, Confirm).unwrap();
        assert!(transition(confirmed, Confirm).is_err());
    }

    #[test]
    fn requested_status_maps_to_event() {
        assert_eq!(ReservationEvent::from_requested_status("confirmed"), Some(Confirm));
        assert_eq!(ReservationEvent::from_requested_status("ready"), Some(MarkReady));
        assert_eq!(ReservationEvent::from_requested_status("collected"), Some(MarkCollected));
        assert_eq!(ReservationEvent::from_requested_status("cancelled"), Some(Cancel));
        // Expiry is system-driven, never requestable.
        assert_eq!(ReservationEvent::from_requested_status("expired"), None);
        assert_eq!(ReservationEvent::from_requested_status("pending"), None);
    }

    #[test]
    fn only_cancel_and_expire_restore_stock() {
        assert!(Cancel.restores_stock());
        assert!(Expire.restores_stock());
        assert!(!Confirm.restores_stock());
        assert!(!MarkReady.restores_stock());
        assert!(!MarkCollected.restores_stock());
    }

    #[test]
    fn cancellable_only_while_active() {
        assert!(Pending.is_cancellable());
        assert!(Confirmed.is_cancellable());
        assert!(Ready.is_cancellable());
        assert!(!Collected.is_cancellable());
        assert!(!Cancelled.is_cancellable());
        assert!(!Expired.is_cancellable());
    }

    #[test]
    fn expiry_predicate() {
        let deadline = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let before = deadline - Duration::minutes(1);
        let after = deadline + Duration::minutes(1);

        assert!(is_expired(Pending, deadline, after));
        assert!(is_expired(Confirmed, deadline, after));
        assert!(is_expired(Ready, deadline, after));

        assert!(!is_expired(Pending, deadline, before));
        assert!(!is_expired(Pending, deadline, deadline));

        // Terminal states never re-expire.
        assert!(!is_expired(Collected, deadline, after));
        assert!(!is_expired(Cancelled, deadline, after));
        assert!(!is_expired(Expired, deadline, after));
    }

    #[test]
    fn expiry_deadline_defaults_to_pickup_plus_24h() {
        let pickup = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        assert_eq!(expiry_deadline(pickup, None), pickup + Duration::hours(24));

        let explicit = Utc.with_ymd_and_hms(2025, 6, 1, 18, 0, 0).unwrap();
        assert_eq!(expiry_deadline(pickup, Some(explicit)), explicit);
    }

    #[test]
    fn reservation_number_format() {
        let number = generate_reservation_number(2025);
        let parts: Vec<&str> = number.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "RES");
        assert_eq!(parts[1], "2025");
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2]
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in all_statuses() {
            assert_eq!(ReservationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ReservationStatus::parse("bogus"), None);
    }

    fn bundle_with_items(items: Vec<ReservationItemDetail>) -> ReservationBundle {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        ReservationBundle {
            reservation: Reservation {
                id: Uuid::new_v4(),
                reservation_number: "RES-2025-A1B2C3".into(),
                user_id: Uuid::new_v4(),
                pharmacy_id: Uuid::new_v4(),
                status: "pending".into(),
                contact_name: "Jean Dupont".into(),
                contact_phone: "+237600000000".into(),
                contact_email: None,
                pickup_date: now + Duration::hours(4),
                notes: None,
                pharmacy_notes: None,
                created_at: now,
                updated_at: now,
                confirmed_at: None,
                ready_at: None,
                collected_at: None,
                cancelled_at: None,
                cancelled_by: None,
                expires_at: now + Duration::hours(28),
            },
            pharmacy_name: "Pharmacie Centrale".into(),
            pharmacy_address: "Avenue Kennedy".into(),
            pharmacy_phone: "+237222222222".into(),
            items,
        }
    }

    fn item(quantity: i32, unit_price: Decimal) -> ReservationItemDetail {
        ReservationItemDetail {
            id: Uuid::new_v4(),
            medicine_id: Uuid::new_v4(),
            medicine_name: "Paracetamol 500mg".into(),
            stock_id: Some(Uuid::new_v4()),
            quantity,
            unit_price,
            stock_decremented: true,
        }
    }

    #[test]
    fn totals_are_derived_from_items() {
        let response = ReservationResponse::from_bundle(bundle_with_items(vec![
            item(3, Decimal::new(100000, 2)), // 3 x 1000.00
            item(2, Decimal::new(50050, 2)),  // 2 x 500.50
        ]));

        assert_eq!(response.total_items, 5);
        assert_eq!(response.total_price, Decimal::new(400100, 2)); // 4001.00
        assert_eq!(response.items[0].subtotal, Decimal::new(300000, 2));
        assert_eq!(response.items[1].subtotal, Decimal::new(100100, 2));
        assert!(response.is_cancellable);
    }

    #[test]
    fn empty_item_list_yields_zero_totals() {
        let response = ReservationResponse::from_bundle(bundle_with_items(vec![]));
        assert_eq!(response.total_items, 0);
        assert_eq!(response.total_price, Decimal::ZERO);
    }

    #[test]
    fn cart_totals_are_derived() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let cart = Cart {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            status: CART_ACTIVE.into(),
            created_at: now,
            updated_at: now,
        };
        let response = CartResponse::build(
            cart,
            vec![CartItemDetail {
                id: Uuid::new_v4(),
                medicine_id: Uuid::new_v4(),
                medicine_name: "Amoxicilline".into(),
                pharmacy_id: Uuid::new_v4(),
                pharmacy_name: "Pharmacie du Marché".into(),
                stock_id: None,
                quantity: 4,
                unit_price: Decimal::new(250000, 2), // 2500.00
            }],
        );
        assert_eq!(response.total_items, 4);
        assert_eq!(response.total_price, Decimal::new(1000000, 2)); // 10000.00
    }
}
