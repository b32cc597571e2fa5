// =============================================================================
// HANDLERS MODULE
// =============================================================================
// HTTP request handlers. Handlers parse and validate input, enforce the
// permission rules the gateway identity allows, delegate to the database
// layer, and record metrics. Expiry is pull-based here: every reservation
// read path first settles overdue rows, so a lagging background sweep never
// lets an expired reservation keep its stock.
// =============================================================================

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::auth::Actor;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::*;
use crate::search::{
    self, PharmacyWithDistance, SearchResult, DEFAULT_MAX_DISTANCE_KM, DEFAULT_NEARBY_RADIUS_KM,
};
use crate::AppState;

// =============================================================================
// HEALTH & METRICS ENDPOINTS
// =============================================================================

/// Liveness probe.
///
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "pharmacy-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe: checks PostgreSQL and Redis.
///
/// GET /ready
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, StatusCode> {
    let db_healthy = state.db.health_check().await;

    let redis_healthy = redis::cmd("PING")
        .query_async::<_, String>(&mut state.redis.clone())
        .await
        .is_ok();

    let all_healthy = db_healthy && redis_healthy;
    let status = if all_healthy { "ready" } else { "not_ready" };

    let response = ReadinessResponse {
        status: status.to_string(),
        checks: ReadinessChecks {
            database: db_healthy,
            redis: redis_healthy,
        },
    };

    if all_healthy {
        Ok(Json(response))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// Prometheus metrics in exposition format.
///
/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// CACHE HELPERS
// =============================================================================
// Read-through cache for pharmacy detail. All cache failures are swallowed;
// the database remains the source of truth.

const PHARMACY_CACHE_TTL_SECS: usize = 300;

fn pharmacy_cache_key(id: Uuid) -> String {
    format!("pharmacy:{}", id)
}

async fn cache_get(state: &AppState, key: &str) -> Option<String> {
    let start = Instant::now();
    let value: Option<String> = redis::cmd("GET")
        .arg(key)
        .query_async(&mut state.redis.clone())
        .await
        .ok();
    metrics::record_redis_operation("get", start.elapsed().as_secs_f64());
    value
}

async fn cache_set(state: &AppState, key: &str, value: &str) {
    let start = Instant::now();
    let _: Result<(), _> = redis::cmd("SETEX")
        .arg(key)
        .arg(PHARMACY_CACHE_TTL_SECS)
        .arg(value)
        .query_async(&mut state.redis.clone())
        .await;
    metrics::record_redis_operation("set", start.elapsed().as_secs_f64());
}

async fn cache_delete(state: &AppState, key: &str) {
    let start = Instant::now();
    let _: Result<(), _> = redis::cmd("DEL")
        .arg(key)
        .query_async(&mut state.redis.clone())
        .await;
    metrics::record_redis_operation("delete", start.elapsed().as_secs_f64());
}

async fn invalidate_pharmacies(state: &AppState, pharmacy_ids: &[Uuid]) {
    for id in pharmacy_ids {
        cache_delete(state, &pharmacy_cache_key(*id)).await;
    }
}

// =============================================================================
// INPUT PARSING HELPERS
// =============================================================================

/// Parse an optional numeric query parameter; present-but-non-numeric is a
/// validation error, absent degrades to None.
fn parse_opt_f64(name: &str, raw: &Option<String>) -> AppResult<Option<f64>> {
    match raw {
        None => Ok(None),
        Some(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed.parse::<f64>().map(Some).map_err(|_| {
                AppError::Validation(format!("Parameter '{}' must be a number", name))
            })
        }
    }
}

fn validate_status_filter(status: &Option<String>) -> AppResult<Option<String>> {
    match status {
        None => Ok(None),
        Some(s) => match ReservationStatus::parse(s) {
            Some(_) => Ok(Some(s.clone())),
            None => Err(AppError::Validation(format!("Unknown status '{}'", s))),
        },
    }
}

/// Settle overdue reservations before serving a read, and drop the cache of
/// any pharmacy whose stock was restored. Also driven on a timer from main,
/// so expiry does not depend on read traffic alone.
pub async fn settle_expired(state: &AppState) -> AppResult<()> {
    let now = state.clock.now();
    let pharmacies = state.db.expire_due(now).await?;
    if !pharmacies.is_empty() {
        metrics::record_expired(pharmacies.len() as u64);
        invalidate_pharmacies(state, &pharmacies).await;
    }
    Ok(())
}

// =============================================================================
// SEARCH ENDPOINTS
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub max_distance: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub count: usize,
    pub results: Vec<SearchResult>,
}

/// Medicine search with nearby availability.
///
/// GET /api/v1/search?q=doliprane&latitude=3.848&longitude=11.502&max_distance=5
pub async fn search_medicines(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> AppResult<Json<SearchResponse>> {
    let start = Instant::now();

    let query = params
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| AppError::Validation("Parameter 'q' is required".into()))?
        .to_string();

    let latitude = parse_opt_f64("latitude", &params.latitude)?;
    let longitude = parse_opt_f64("longitude", &params.longitude)?;
    let max_distance = parse_opt_f64("max_distance", &params.max_distance)?
        .unwrap_or(DEFAULT_MAX_DISTANCE_KM);

    // Both coordinates, or the no-distance path.
    let origin = match (latitude, longitude) {
        (Some(lat), Some(lon)) => Some((lat, lon)),
        _ => None,
    };

    let tokens = search::tokenize(&query);
    let patterns: Vec<String> = tokens.iter().map(|t| format!("%{}%", t)).collect();

    let db_start = Instant::now();
    let medicines = state.db.search_medicines(&patterns).await?;
    let results = if medicines.is_empty() {
        Vec::new()
    } else {
        let ids: Vec<Uuid> = medicines.iter().map(|m| m.id).collect();
        let candidates = state.db.stock_candidates(&ids).await?;
        search::build_results(medicines, candidates, origin, max_distance)
    };
    metrics::record_db_query("select", db_start.elapsed().as_secs_f64());

    metrics::record_search(!results.is_empty());
    metrics::record_http_request("GET", "/api/v1/search", 200, start.elapsed().as_secs_f64());

    Ok(Json(SearchResponse {
        count: results.len(),
        query,
        results,
    }))
}

#[derive(Debug, Deserialize)]
pub struct NearbyParams {
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub radius: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NearbyResponse {
    pub count: usize,
    pub radius_km: f64,
    pub pharmacies: Vec<PharmacyWithDistance>,
}

/// Nearby pharmacies. Coordinates are mandatory here.
///
/// GET /api/v1/nearby?latitude=3.848&longitude=11.502&radius=5
pub async fn nearby_pharmacies(
    State(state): State<Arc<AppState>>,
    Query(params): Query<NearbyParams>,
) -> AppResult<Json<NearbyResponse>> {
    let start = Instant::now();

    let latitude = parse_opt_f64("latitude", &params.latitude)?
        .ok_or_else(|| AppError::Validation("Parameter 'latitude' is required".into()))?;
    let longitude = parse_opt_f64("longitude", &params.longitude)?
        .ok_or_else(|| AppError::Validation("Parameter 'longitude' is required".into()))?;
    let radius =
        parse_opt_f64("radius", &params.radius)?.unwrap_or(DEFAULT_NEARBY_RADIUS_KM);

    let pharmacies = state.db.visible_pharmacies().await?;
    let nearby = search::pharmacies_within(pharmacies, latitude, longitude, radius);

    metrics::record_http_request("GET", "/api/v1/nearby", 200, start.elapsed().as_secs_f64());

    Ok(Json(NearbyResponse {
        count: nearby.len(),
        radius_km: radius,
        pharmacies: nearby,
    }))
}

/// Pharmacy detail with its available medicines, cached for five minutes.
///
/// GET /api/v1/pharmacies/:id
pub async fn pharmacy_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<PharmacyDetailResponse>> {
    let start = Instant::now();
    let cache_key = pharmacy_cache_key(id);

    if let Some(cached) = cache_get(&state, &cache_key).await {
        if let Ok(detail) = serde_json::from_str::<PharmacyDetailResponse>(&cached) {
            metrics::record_http_request(
                "GET",
                "/api/v1/pharmacies/:id",
                200,
                start.elapsed().as_secs_f64(),
            );
            return Ok(Json(detail));
        }
    }

    let pharmacy = state
        .db
        .get_pharmacy(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Pharmacy {} not found", id)))?;

    let stocks = state.db.pharmacy_stocks(id).await?;
    for stock in &stocks {
        metrics::set_stock_level(id, stock.medicine_id, stock.quantity);
    }

    let medicines: Vec<StockedMedicine> = stocks
        .into_iter()
        .map(|s| StockedMedicine {
            medicine_id: s.medicine_id,
            name: s.medicine_name,
            dosage: s.dosage,
            form: s.form,
            category: s.category,
            requires_prescription: s.requires_prescription,
            stock_id: s.stock_id,
            price: s.price,
            quantity: s.quantity,
        })
        .collect();

    let detail = PharmacyDetailResponse {
        pharmacy,
        total_medicines: medicines.len(),
        medicines,
    };

    if let Ok(serialized) = serde_json::to_string(&detail) {
        cache_set(&state, &cache_key, &serialized).await;
    }

    metrics::record_http_request(
        "GET",
        "/api/v1/pharmacies/:id",
        200,
        start.elapsed().as_secs_f64(),
    );

    Ok(Json(detail))
}

// =============================================================================
// RESERVATION ENDPOINTS
// =============================================================================

/// Create a reservation, decrementing stock for each item. All-or-nothing.
///
/// POST /api/v1/reservations
pub async fn create_reservation(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(request): Json<CreateReservationRequest>,
) -> AppResult<(StatusCode, Json<ReservationResponse>)> {
    let start = Instant::now();
    let now = state.clock.now();

    tracing::info!(
        user_id = %actor.user_id,
        pharmacy_id = %request.pharmacy_id,
        items = request.items.len(),
        "Creating reservation"
    );

    let result = state.db.create_reservation(actor.user_id, &request, now).await;
    let duration = start.elapsed().as_secs_f64();

    match result {
        Ok(bundle) => {
            metrics::record_reservation_event("create", true);
            metrics::record_http_request("POST", "/api/v1/reservations", 201, duration);
            cache_delete(&state, &pharmacy_cache_key(request.pharmacy_id)).await;

            tracing::info!(
                reservation_number = %bundle.reservation.reservation_number,
                "Reservation created"
            );

            Ok((
                StatusCode::CREATED,
                Json(ReservationResponse::from_bundle(bundle)),
            ))
        }
        Err(err) => {
            metrics::record_reservation_event("create", false);
            metrics::record_http_request("POST", "/api/v1/reservations", 400, duration);

            tracing::warn!(
                user_id = %actor.user_id,
                error = %err,
                "Reservation creation rejected"
            );

            Err(err)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListReservationParams {
    pub status: Option<String>,
    /// Admin-only extra filter.
    pub pharmacy_id: Option<Uuid>,
}

/// Role-scoped reservation list.
///
/// GET /api/v1/reservations?status=pending
pub async fn list_reservations(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Query(params): Query<ListReservationParams>,
) -> AppResult<Json<Vec<ReservationListEntry>>> {
    let start = Instant::now();

    let status = validate_status_filter(&params.status)?;
    settle_expired(&state).await?;

    let scope = match (params.pharmacy_id, actor.is_admin()) {
        (Some(pharmacy_id), true) => crate::auth::ReservationScope::Pharmacy(pharmacy_id),
        _ => actor.scope(),
    };

    let rows = state
        .db
        .list_reservations(scope, status.as_deref(), None)
        .await?;
    let entries: Vec<ReservationListEntry> =
        rows.into_iter().map(ReservationListEntry::from).collect();

    metrics::record_http_request(
        "GET",
        "/api/v1/reservations",
        200,
        start.elapsed().as_secs_f64(),
    );

    Ok(Json(entries))
}

/// Reservation detail, scoped to the caller's visibility.
///
/// GET /api/v1/reservations/:id
pub async fn get_reservation(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ReservationResponse>> {
    let start = Instant::now();
    let now = state.clock.now();

    if let Some(pharmacy_id) = state.db.expire_if_due(id, now).await? {
        metrics::record_expired(1);
        cache_delete(&state, &pharmacy_cache_key(pharmacy_id)).await;
    }

    let bundle = state
        .db
        .get_reservation(actor.scope(), id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Reservation {} not found", id)))?;

    metrics::record_http_request(
        "GET",
        "/api/v1/reservations/:id",
        200,
        start.elapsed().as_secs_f64(),
    );

    Ok(Json(ReservationResponse::from_bundle(bundle)))
}

/// Cancel a reservation, restoring every item's stock exactly once.
///
/// POST /api/v1/reservations/:id/cancel
pub async fn cancel_reservation(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelReservationRequest>,
) -> AppResult<Json<ReservationResponse>> {
    let start = Instant::now();
    let now = state.clock.now();

    // Expire first: past-deadline reservations are no longer cancellable.
    if let Some(pharmacy_id) = state.db.expire_if_due(id, now).await? {
        metrics::record_expired(1);
        cache_delete(&state, &pharmacy_cache_key(pharmacy_id)).await;
    }

    // Visibility scope doubles as the cancel permission: owner, owning
    // pharmacy, or admin.
    let bundle = state
        .db
        .get_reservation(actor.scope(), id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Reservation {} not found", id)))?;

    let result = state
        .db
        .transition_reservation(
            id,
            ReservationEvent::Cancel,
            Some(actor.user_id),
            request.reason.as_deref(),
            now,
        )
        .await;
    let duration = start.elapsed().as_secs_f64();

    match result {
        Ok(updated) => {
            metrics::record_reservation_event("cancel", true);
            metrics::record_http_request(
                "POST",
                "/api/v1/reservations/:id/cancel",
                200,
                duration,
            );
            cache_delete(&state, &pharmacy_cache_key(bundle.reservation.pharmacy_id)).await;

            tracing::info!(
                reservation_number = %updated.reservation.reservation_number,
                cancelled_by = %actor.user_id,
                "Reservation cancelled"
            );

            Ok(Json(ReservationResponse::from_bundle(updated)))
        }
        Err(err) => {
            metrics::record_reservation_event("cancel", false);
            metrics::record_http_request(
                "POST",
                "/api/v1/reservations/:id/cancel",
                400,
                duration,
            );
            Err(err)
        }
    }
}

/// Pharmacy-side status update (confirm / ready / collected / cancelled).
///
/// POST /api/v1/reservations/:id/update_status
pub async fn update_reservation_status(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateStatusRequest>,
) -> AppResult<Json<ReservationResponse>> {
    let start = Instant::now();
    let now = state.clock.now();

    let event = ReservationEvent::from_requested_status(&request.status).ok_or_else(|| {
        AppError::Validation(format!("'{}' is not a requestable status", request.status))
    })?;

    if let Some(pharmacy_id) = state.db.expire_if_due(id, now).await? {
        metrics::record_expired(1);
        cache_delete(&state, &pharmacy_cache_key(pharmacy_id)).await;
    }

    let bundle = state
        .db
        .get_reservation(actor.scope(), id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Reservation {} not found", id)))?;

    if !actor.can_manage_pharmacy(bundle.reservation.pharmacy_id) {
        return Err(AppError::PermissionDenied(
            "Only the owning pharmacy may update this reservation".into(),
        ));
    }

    let result = state
        .db
        .transition_reservation(
            id,
            event,
            Some(actor.user_id),
            request.notes.as_deref(),
            now,
        )
        .await;
    let duration = start.elapsed().as_secs_f64();

    match result {
        Ok(updated) => {
            metrics::record_reservation_event(&request.status, true);
            metrics::record_http_request(
                "POST",
                "/api/v1/reservations/:id/update_status",
                200,
                duration,
            );
            if event.restores_stock() {
                cache_delete(&state, &pharmacy_cache_key(bundle.reservation.pharmacy_id)).await;
            }

            tracing::info!(
                reservation_number = %updated.reservation.reservation_number,
                status = %request.status,
                "Reservation status updated"
            );

            Ok(Json(ReservationResponse::from_bundle(updated)))
        }
        Err(err) => {
            metrics::record_reservation_event(&request.status, false);
            metrics::record_http_request(
                "POST",
                "/api/v1/reservations/:id/update_status",
                400,
                duration,
            );
            Err(err)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PharmacyQueueParams {
    pub status: Option<String>,
    /// Pickup day filter, YYYY-MM-DD.
    pub date: Option<String>,
}

/// The owning pharmacy's reservation queue.
///
/// GET /api/v1/reservations/pharmacy?status=pending&date=2025-06-01
pub async fn pharmacy_reservations(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Query(params): Query<PharmacyQueueParams>,
) -> AppResult<Json<Vec<ReservationListEntry>>> {
    let start = Instant::now();

    let pharmacy_id = actor.pharmacy_id.ok_or_else(|| {
        AppError::PermissionDenied("Pharmacy role required for the reservation queue".into())
    })?;

    let status = validate_status_filter(&params.status)?;
    let pickup_day = match &params.date {
        None => None,
        Some(s) => Some(NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| {
            AppError::Validation("Parameter 'date' must be formatted YYYY-MM-DD".into())
        })?),
    };

    settle_expired(&state).await?;

    let rows = state
        .db
        .list_reservations(
            crate::auth::ReservationScope::Pharmacy(pharmacy_id),
            status.as_deref(),
            pickup_day,
        )
        .await?;
    let entries: Vec<ReservationListEntry> =
        rows.into_iter().map(ReservationListEntry::from).collect();

    metrics::record_http_request(
        "GET",
        "/api/v1/reservations/pharmacy",
        200,
        start.elapsed().as_secs_f64(),
    );

    Ok(Json(entries))
}

/// Role-scoped reservation counts.
///
/// GET /api/v1/reservations/stats
pub async fn reservation_stats(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> AppResult<Json<ReservationStats>> {
    let start = Instant::now();
    let now = state.clock.now();

    settle_expired(&state).await?;

    let stats = state
        .db
        .reservation_stats(actor.scope(), now.date_naive())
        .await?;

    metrics::record_http_request(
        "GET",
        "/api/v1/reservations/stats",
        200,
        start.elapsed().as_secs_f64(),
    );

    Ok(Json(stats))
}

// =============================================================================
// CART ENDPOINTS
// =============================================================================
// The cart stages items without committing stock; validation against stock
// is optimistic and repeated at quantity updates.

/// The caller's active cart (created on first use).
///
/// GET /api/v1/cart
pub async fn get_cart(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> AppResult<Json<CartResponse>> {
    let now = state.clock.now();
    let cart = state.db.active_cart(actor.user_id, now).await?;
    let items = state.db.cart_items(cart.id).await?;
    Ok(Json(CartResponse::build(cart, items)))
}

/// Add an item (or merge into an existing line).
///
/// POST /api/v1/cart/items
pub async fn add_cart_item(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(request): Json<AddCartItemRequest>,
) -> AppResult<(StatusCode, Json<CartResponse>)> {
    let now = state.clock.now();
    let cart = state
        .db
        .add_cart_item(
            actor.user_id,
            request.medicine_id,
            request.pharmacy_id,
            request.stock_id,
            request.quantity,
            now,
        )
        .await?;
    let items = state.db.cart_items(cart.id).await?;
    Ok((StatusCode::CREATED, Json(CartResponse::build(cart, items))))
}

/// Update a line's quantity.
///
/// PATCH /api/v1/cart/items/:id
pub async fn update_cart_item(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(item_id): Path<Uuid>,
    Json(request): Json<UpdateCartItemRequest>,
) -> AppResult<Json<CartResponse>> {
    let now = state.clock.now();
    state
        .db
        .update_cart_item(actor.user_id, item_id, request.quantity, now)
        .await?;
    let cart = state.db.active_cart(actor.user_id, now).await?;
    let items = state.db.cart_items(cart.id).await?;
    Ok(Json(CartResponse::build(cart, items)))
}

/// Remove one line.
///
/// DELETE /api/v1/cart/items/:id
pub async fn remove_cart_item(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(item_id): Path<Uuid>,
) -> AppResult<Json<CartResponse>> {
    let now = state.clock.now();
    state.db.remove_cart_item(actor.user_id, item_id).await?;
    let cart = state.db.active_cart(actor.user_id, now).await?;
    let items = state.db.cart_items(cart.id).await?;
    Ok(Json(CartResponse::build(cart, items)))
}

/// Empty the active cart.
///
/// POST /api/v1/cart/clear
pub async fn clear_cart(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> AppResult<Json<CartResponse>> {
    let now = state.clock.now();
    state.db.clear_cart(actor.user_id).await?;
    let cart = state.db.active_cart(actor.user_id, now).await?;
    Ok(Json(CartResponse::build(cart, Vec::new())))
}

/// Close the active cart.
///
/// POST /api/v1/cart/complete
pub async fn complete_cart(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> AppResult<Json<CartResponse>> {
    let now = state.clock.now();
    let cart = state.db.complete_cart(actor.user_id, now).await?;
    let items = state.db.cart_items(cart.id).await?;
    Ok(Json(CartResponse::build(cart, items)))
}
