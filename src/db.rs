// =============================================================================
// DATABASE MODULE
// =============================================================================
// All PostgreSQL access, behind a typed wrapper around the SQLx pool.
//
// Stock rows are the only contended resource in the system. Every path that
// mutates one (reservation creation, cancellation, expiry) runs inside a
// transaction and takes a `FOR UPDATE` row lock first, so the
// check-then-write on quantity is atomic per stock row: two concurrent
// reservations against the same stock serialize, and only one succeeds when
// quantity covers just one of them. The `stock_decremented` flag on each
// reservation item is checked-and-cleared in the same transaction as the
// quantity it guards, so a restore can never be applied twice.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::auth::ReservationScope;
use crate::error::{AppError, AppResult};
use crate::models::{
    expiry_deadline, generate_reservation_number, is_expired, transition, Cart, CartItemDetail,
    CreateReservationRequest, Medicine, Pharmacy, PharmacyStockRow, Reservation,
    ReservationBundle, ReservationEvent, ReservationItem, ReservationItemDetail,
    ReservationListRow,
    ReservationStats, ReservationStatus, Stock, StockCandidate, APPROVAL_APPROVED, CART_ACTIVE,
    CART_COMPLETED,
};

const RESERVATION_COLUMNS: &str = "id, reservation_number, user_id, pharmacy_id, status, \
     contact_name, contact_phone, contact_email, pickup_date, notes, pharmacy_notes, \
     created_at, updated_at, confirmed_at, ready_at, collected_at, cancelled_at, \
     cancelled_by, expires_at";

/// How many reservation-number collisions we tolerate before giving up. The
/// 36^6 space makes even one collision rare; five in a row means something
/// else is wrong.
const RESERVATION_NUMBER_ATTEMPTS: u32 = 5;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    // -------------------------------------------------------------------------
    // CONNECTION & MIGRATIONS
    // -------------------------------------------------------------------------

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    /// Create tables and indexes. Idempotent, safe to run on every startup.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS medicines (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                name VARCHAR(255) NOT NULL,
                description TEXT,
                dosage VARCHAR(100),
                form VARCHAR(100),
                category VARCHAR(50) NOT NULL DEFAULT 'autre',
                average_price NUMERIC(10, 2),
                requires_prescription BOOLEAN NOT NULL DEFAULT FALSE,
                image_url TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create medicines table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_medicines_name ON medicines(name)
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create medicines name index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pharmacies (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                name VARCHAR(255) NOT NULL,
                address TEXT NOT NULL,
                phone VARCHAR(20) NOT NULL,
                email VARCHAR(255),
                latitude DOUBLE PRECISION NOT NULL,
                longitude DOUBLE PRECISION NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                approval_status VARCHAR(20) NOT NULL DEFAULT 'pending'
                    CHECK (approval_status IN ('pending', 'approved', 'rejected')),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create pharmacies table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stocks (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                pharmacy_id UUID NOT NULL REFERENCES pharmacies(id) ON DELETE CASCADE,
                medicine_id UUID NOT NULL REFERENCES medicines(id) ON DELETE CASCADE,
                quantity INTEGER NOT NULL DEFAULT 0 CHECK (quantity >= 0),
                price NUMERIC(10, 2) NOT NULL CHECK (price > 0),
                is_available BOOLEAN NOT NULL DEFAULT TRUE,
                last_updated TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (pharmacy_id, medicine_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create stocks table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_stocks_medicine ON stocks(medicine_id)
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create stocks medicine index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reservations (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                reservation_number VARCHAR(20) NOT NULL UNIQUE,
                user_id UUID NOT NULL,
                pharmacy_id UUID NOT NULL REFERENCES pharmacies(id) ON DELETE CASCADE,
                status VARCHAR(20) NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'confirmed', 'ready',
                                      'collected', 'cancelled', 'expired')),
                contact_name VARCHAR(100) NOT NULL,
                contact_phone VARCHAR(20) NOT NULL,
                contact_email VARCHAR(255),
                pickup_date TIMESTAMPTZ NOT NULL,
                notes TEXT,
                pharmacy_notes TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                confirmed_at TIMESTAMPTZ,
                ready_at TIMESTAMPTZ,
                collected_at TIMESTAMPTZ,
                cancelled_at TIMESTAMPTZ,
                cancelled_by UUID,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create reservations table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_reservations_user_status
                ON reservations(user_id, status)
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create reservations user index")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_reservations_pharmacy_status
                ON reservations(pharmacy_id, status)
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create reservations pharmacy index")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_reservations_expires_at
                ON reservations(expires_at)
                WHERE status IN ('pending', 'confirmed', 'ready')
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create reservations expiry index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reservation_items (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                reservation_id UUID NOT NULL REFERENCES reservations(id) ON DELETE CASCADE,
                medicine_id UUID NOT NULL REFERENCES medicines(id) ON DELETE CASCADE,
                stock_id UUID REFERENCES stocks(id) ON DELETE SET NULL,
                quantity INTEGER NOT NULL CHECK (quantity >= 1),
                unit_price NUMERIC(10, 2) NOT NULL DEFAULT 0,
                stock_decremented BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create reservation_items table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_reservation_items_reservation
                ON reservation_items(reservation_id)
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create reservation_items index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS carts (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                user_id UUID NOT NULL,
                status VARCHAR(20) NOT NULL DEFAULT 'active'
                    CHECK (status IN ('active', 'completed', 'abandoned')),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create carts table")?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_carts_one_active_per_user
                ON carts(user_id) WHERE status = 'active'
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create carts active index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cart_items (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                cart_id UUID NOT NULL REFERENCES carts(id) ON DELETE CASCADE,
                medicine_id UUID NOT NULL REFERENCES medicines(id) ON DELETE CASCADE,
                pharmacy_id UUID NOT NULL REFERENCES pharmacies(id) ON DELETE CASCADE,
                stock_id UUID REFERENCES stocks(id) ON DELETE SET NULL,
                quantity INTEGER NOT NULL CHECK (quantity >= 1),
                unit_price NUMERIC(10, 2) NOT NULL DEFAULT 0,
                added_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (cart_id, medicine_id, pharmacy_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create cart_items table")?;

        Ok(())
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    // -------------------------------------------------------------------------
    // SEARCH READS
    // -------------------------------------------------------------------------

    /// Medicines whose name or description contains any of the patterns
    /// (case-insensitive; patterns are pre-wrapped in `%`).
    pub async fn search_medicines(&self, patterns: &[String]) -> AppResult<Vec<Medicine>> {
        let medicines = sqlx::query_as::<_, Medicine>(
            r#"
            SELECT id, name, description, dosage, form, category, average_price,
                   requires_prescription, image_url, created_at, updated_at
            FROM medicines
            WHERE name ILIKE ANY($1) OR COALESCE(description, '') ILIKE ANY($1)
            ORDER BY name ASC
            "#,
        )
        .bind(patterns)
        .fetch_all(&self.pool)
        .await?;

        Ok(medicines)
    }

    /// Stock rows eligible for search results: available, in stock, at an
    /// active approved pharmacy.
    pub async fn stock_candidates(&self, medicine_ids: &[Uuid]) -> AppResult<Vec<StockCandidate>> {
        let candidates = sqlx::query_as::<_, StockCandidate>(
            r#"
            SELECT s.medicine_id, s.id AS stock_id, s.quantity, s.price,
                   p.id AS pharmacy_id, p.name AS pharmacy_name,
                   p.address AS pharmacy_address, p.phone AS pharmacy_phone,
                   p.latitude, p.longitude
            FROM stocks s
            JOIN pharmacies p ON p.id = s.pharmacy_id
            WHERE s.medicine_id = ANY($1)
              AND s.is_available
              AND s.quantity > 0
              AND p.is_active
              AND p.approval_status = $2
            "#,
        )
        .bind(medicine_ids)
        .bind(APPROVAL_APPROVED)
        .fetch_all(&self.pool)
        .await?;

        Ok(candidates)
    }

    /// All pharmacies visible to discovery (active + approved).
    pub async fn visible_pharmacies(&self) -> AppResult<Vec<Pharmacy>> {
        let pharmacies = sqlx::query_as::<_, Pharmacy>(
            r#"
            SELECT id, name, address, phone, email, latitude, longitude,
                   is_active, approval_status, created_at, updated_at
            FROM pharmacies
            WHERE is_active AND approval_status = $1
            ORDER BY name ASC
            "#,
        )
        .bind(APPROVAL_APPROVED)
        .fetch_all(&self.pool)
        .await?;

        Ok(pharmacies)
    }

    pub async fn get_pharmacy(&self, id: Uuid) -> AppResult<Option<Pharmacy>> {
        let pharmacy = sqlx::query_as::<_, Pharmacy>(
            r#"
            SELECT id, name, address, phone, email, latitude, longitude,
                   is_active, approval_status, created_at, updated_at
            FROM pharmacies
            WHERE id = $1 AND is_active AND approval_status = $2
            "#,
        )
        .bind(id)
        .bind(APPROVAL_APPROVED)
        .fetch_optional(&self.pool)
        .await?;

        Ok(pharmacy)
    }

    /// A pharmacy's available, in-stock medicines.
    pub async fn pharmacy_stocks(&self, pharmacy_id: Uuid) -> AppResult<Vec<PharmacyStockRow>> {
        let rows = sqlx::query_as::<_, PharmacyStockRow>(
            r#"
            SELECT s.id AS stock_id, s.price, s.quantity,
                   m.id AS medicine_id, m.name AS medicine_name,
                   m.dosage, m.form, m.category, m.requires_prescription
            FROM stocks s
            JOIN medicines m ON m.id = s.medicine_id
            WHERE s.pharmacy_id = $1 AND s.is_available AND s.quantity > 0
            ORDER BY m.name ASC
            "#,
        )
        .bind(pharmacy_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // RESERVATIONS
    // -------------------------------------------------------------------------

    /// Create a reservation with its items, decrementing stock for each item
    /// that references one. All-or-nothing: any failure rolls the whole
    /// transaction back, leaving no reservation, no items and no stock
    /// mutation behind.
    pub async fn create_reservation(
        &self,
        user_id: Uuid,
        req: &CreateReservationRequest,
        now: DateTime<Utc>,
    ) -> AppResult<ReservationBundle> {
        if req.items.is_empty() {
            return Err(AppError::Validation(
                "Reservation must contain at least one item".into(),
            ));
        }
        if let Some(bad) = req.items.iter().find(|i| i.quantity < 1) {
            return Err(AppError::Validation(format!(
                "Item quantity must be at least 1 (got {})",
                bad.quantity
            )));
        }
        if req.pickup_date <= now {
            return Err(AppError::Validation(
                "Pickup date must be in the future".into(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        let pharmacy = sqlx::query_as::<_, Pharmacy>(
            r#"
            SELECT id, name, address, phone, email, latitude, longitude,
                   is_active, approval_status, created_at, updated_at
            FROM pharmacies
            WHERE id = $1
            "#,
        )
        .bind(req.pharmacy_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Pharmacy {} not found", req.pharmacy_id)))?;

        let expires_at = expiry_deadline(req.pickup_date, req.expires_at);

        // The random number space makes collisions unlikely; retried inserts
        // use ON CONFLICT DO NOTHING so a collision never aborts the
        // transaction.
        let mut reservation: Option<Reservation> = None;
        for _ in 0..RESERVATION_NUMBER_ATTEMPTS {
            let number = generate_reservation_number(now.year());
            let inserted = sqlx::query_as::<_, Reservation>(&format!(
                r#"
                INSERT INTO reservations
                    (id, reservation_number, user_id, pharmacy_id, status,
                     contact_name, contact_phone, contact_email, pickup_date,
                     notes, created_at, updated_at, expires_at)
                VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9, $10, $10, $11)
                ON CONFLICT (reservation_number) DO NOTHING
                RETURNING {RESERVATION_COLUMNS}
                "#
            ))
            .bind(Uuid::new_v4())
            .bind(&number)
            .bind(user_id)
            .bind(req.pharmacy_id)
            .bind(&req.contact_name)
            .bind(&req.contact_phone)
            .bind(&req.contact_email)
            .bind(req.pickup_date)
            .bind(&req.notes)
            .bind(now)
            .bind(expires_at)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = inserted {
                reservation = Some(row);
                break;
            }
        }
        let reservation = reservation.ok_or_else(|| {
            AppError::Internal("Could not allocate a unique reservation number".into())
        })?;

        // Items in list order; each decrement locks its stock row first.
        let mut items = Vec::with_capacity(req.items.len());
        for item in &req.items {
            let medicine = sqlx::query_as::<_, Medicine>(
                r#"
                SELECT id, name, description, dosage, form, category, average_price,
                       requires_prescription, image_url, created_at, updated_at
                FROM medicines
                WHERE id = $1
                "#,
            )
            .bind(item.medicine_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Medicine {} not found", item.medicine_id))
            })?;

            let mut unit_price = Decimal::ZERO;
            let mut stock_ref: Option<Uuid> = None;

            if let Some(stock_id) = item.stock_id {
                let stock =
                    lock_stock(&mut tx, stock_id)
                        .await?
                        .ok_or_else(|| {
                            AppError::NotFound(format!("Stock {} not found", stock_id))
                        })?;

                if stock.pharmacy_id != req.pharmacy_id {
                    return Err(AppError::Validation(format!(
                        "Stock for {} belongs to a different pharmacy",
                        medicine.name
                    )));
                }
                if stock.medicine_id != item.medicine_id {
                    return Err(AppError::Validation(format!(
                        "Stock {} does not hold medicine {}",
                        stock_id, medicine.name
                    )));
                }
                if stock.quantity < item.quantity {
                    return Err(AppError::InsufficientStock {
                        medicine: medicine.name.clone(),
                        available: stock.quantity,
                        requested: item.quantity,
                    });
                }

                // Availability is forced off when the counter hits zero; a
                // manual unavailable flag is never turned back on here.
                sqlx::query(
                    r#"
                    UPDATE stocks
                    SET quantity = quantity - $1,
                        is_available = is_available AND (quantity - $1) > 0,
                        last_updated = $2
                    WHERE id = $3
                    "#,
                )
                .bind(item.quantity)
                .bind(now)
                .bind(stock_id)
                .execute(&mut *tx)
                .await?;

                unit_price = stock.price;
                stock_ref = Some(stock_id);
            }

            let row = sqlx::query_as::<_, ReservationItem>(
                r#"
                INSERT INTO reservation_items
                    (id, reservation_id, medicine_id, stock_id, quantity,
                     unit_price, stock_decremented, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING id, reservation_id, medicine_id, stock_id, quantity,
                          unit_price, stock_decremented, created_at
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(reservation.id)
            .bind(item.medicine_id)
            .bind(stock_ref)
            .bind(item.quantity)
            .bind(unit_price)
            .bind(stock_ref.is_some())
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

            items.push(ReservationItemDetail {
                id: row.id,
                medicine_id: row.medicine_id,
                medicine_name: medicine.name,
                stock_id: row.stock_id,
                quantity: row.quantity,
                unit_price: row.unit_price,
                stock_decremented: row.stock_decremented,
            });
        }

        tx.commit().await?;

        Ok(ReservationBundle {
            reservation,
            pharmacy_name: pharmacy.name,
            pharmacy_address: pharmacy.address,
            pharmacy_phone: pharmacy.phone,
            items,
        })
    }

    /// Fetch one reservation within the caller's visibility scope. Rows
    /// outside the scope come back as None, indistinguishable from absent.
    pub async fn get_reservation(
        &self,
        scope: ReservationScope,
        id: Uuid,
    ) -> AppResult<Option<ReservationBundle>> {
        let (user_filter, pharmacy_filter) = scope.filters();

        let reservation = sqlx::query_as::<_, Reservation>(&format!(
            r#"
            SELECT {RESERVATION_COLUMNS}
            FROM reservations
            WHERE id = $1
              AND ($2::uuid IS NULL OR user_id = $2)
              AND ($3::uuid IS NULL OR pharmacy_id = $3)
            "#
        ))
        .bind(id)
        .bind(user_filter)
        .bind(pharmacy_filter)
        .fetch_optional(&self.pool)
        .await?;

        let Some(reservation) = reservation else {
            return Ok(None);
        };

        Ok(Some(self.load_bundle(reservation).await?))
    }

    async fn load_bundle(&self, reservation: Reservation) -> AppResult<ReservationBundle> {
        let (pharmacy_name, pharmacy_address, pharmacy_phone): (String, String, String) =
            sqlx::query_as(
                r#"
                SELECT name, address, phone FROM pharmacies WHERE id = $1
                "#,
            )
            .bind(reservation.pharmacy_id)
            .fetch_one(&self.pool)
            .await?;

        let items = sqlx::query_as::<_, ReservationItemDetail>(
            r#"
            SELECT ri.id, ri.medicine_id, m.name AS medicine_name, ri.stock_id,
                   ri.quantity, ri.unit_price, ri.stock_decremented
            FROM reservation_items ri
            JOIN medicines m ON m.id = ri.medicine_id
            WHERE ri.reservation_id = $1
            ORDER BY ri.created_at ASC
            "#,
        )
        .bind(reservation.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ReservationBundle {
            reservation,
            pharmacy_name,
            pharmacy_address,
            pharmacy_phone,
            items,
        })
    }

    /// Role-scoped list with SQL-aggregated totals, newest first.
    pub async fn list_reservations(
        &self,
        scope: ReservationScope,
        status: Option<&str>,
        pickup_day: Option<NaiveDate>,
    ) -> AppResult<Vec<ReservationListRow>> {
        let (user_filter, pharmacy_filter) = scope.filters();

        let rows = sqlx::query_as::<_, ReservationListRow>(
            r#"
            SELECT r.id, r.reservation_number, r.status, p.name AS pharmacy_name,
                   r.pickup_date, r.created_at,
                   COALESCE(SUM(ri.quantity), 0)::BIGINT AS total_items,
                   COALESCE(SUM(ri.quantity * ri.unit_price), 0)::NUMERIC AS total_price
            FROM reservations r
            JOIN pharmacies p ON p.id = r.pharmacy_id
            LEFT JOIN reservation_items ri ON ri.reservation_id = r.id
            WHERE ($1::uuid IS NULL OR r.user_id = $1)
              AND ($2::uuid IS NULL OR r.pharmacy_id = $2)
              AND ($3::text IS NULL OR r.status = $3)
              AND ($4::date IS NULL OR (r.pickup_date AT TIME ZONE 'UTC')::date = $4)
            GROUP BY r.id, p.name
            ORDER BY r.created_at DESC
            "#,
        )
        .bind(user_filter)
        .bind(pharmacy_filter)
        .bind(status)
        .bind(pickup_day)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Role-scoped counts by status.
    pub async fn reservation_stats(
        &self,
        scope: ReservationScope,
        today: NaiveDate,
    ) -> AppResult<ReservationStats> {
        let (user_filter, pharmacy_filter) = scope.filters();

        let stats = sqlx::query_as::<_, ReservationStats>(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                   COUNT(*) FILTER (WHERE status = 'confirmed') AS confirmed,
                   COUNT(*) FILTER (WHERE status = 'ready') AS ready,
                   COUNT(*) FILTER (WHERE status = 'collected') AS collected,
                   COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled,
                   COUNT(*) FILTER (WHERE status = 'expired') AS expired,
                   COUNT(*) FILTER
                       (WHERE (pickup_date AT TIME ZONE 'UTC')::date = $3) AS today,
                   COUNT(*) FILTER
                       (WHERE status IN ('pending', 'confirmed', 'ready')) AS active
            FROM reservations
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::uuid IS NULL OR pharmacy_id = $2)
            "#,
        )
        .bind(user_filter)
        .bind(pharmacy_filter)
        .bind(today)
        .fetch_one(&self.pool)
        .await?;

        Ok(stats)
    }

    /// Drive one lifecycle event under a row lock. Cancel and expire restore
    /// stock for every item before the status flips; the item flags are
    /// cleared in the same transaction.
    pub async fn transition_reservation(
        &self,
        id: Uuid,
        event: ReservationEvent,
        actor_user_id: Option<Uuid>,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<ReservationBundle> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, Reservation>(&format!(
            r#"
            SELECT {RESERVATION_COLUMNS}
            FROM reservations
            WHERE id = $1
            FOR UPDATE
            "#
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Reservation {} not found", id)))?;

        let from = ReservationStatus::parse(&current.status)
            .ok_or_else(|| AppError::Internal(format!("Corrupt status '{}'", current.status)))?;
        let to = transition(from, event)?;

        if event.restores_stock() {
            restore_reservation_stock(&mut tx, id, now).await?;
        }

        let updated = match event {
            ReservationEvent::Confirm => {
                sqlx::query_as::<_, Reservation>(&format!(
                    r#"
                    UPDATE reservations
                    SET status = $2, confirmed_at = $3, updated_at = $3,
                        pharmacy_notes = COALESCE($4, pharmacy_notes)
                    WHERE id = $1
                    RETURNING {RESERVATION_COLUMNS}
                    "#
                ))
                .bind(id)
                .bind(to.as_str())
                .bind(now)
                .bind(notes)
                .fetch_one(&mut *tx)
                .await?
            }
            ReservationEvent::MarkReady => {
                sqlx::query_as::<_, Reservation>(&format!(
                    r#"
                    UPDATE reservations
                    SET status = $2, ready_at = $3, updated_at = $3,
                        pharmacy_notes = COALESCE($4, pharmacy_notes)
                    WHERE id = $1
                    RETURNING {RESERVATION_COLUMNS}
                    "#
                ))
                .bind(id)
                .bind(to.as_str())
                .bind(now)
                .bind(notes)
                .fetch_one(&mut *tx)
                .await?
            }
            ReservationEvent::MarkCollected => {
                sqlx::query_as::<_, Reservation>(&format!(
                    r#"
                    UPDATE reservations
                    SET status = $2, collected_at = $3, updated_at = $3,
                        pharmacy_notes = COALESCE($4, pharmacy_notes)
                    WHERE id = $1
                    RETURNING {RESERVATION_COLUMNS}
                    "#
                ))
                .bind(id)
                .bind(to.as_str())
                .bind(now)
                .bind(notes)
                .fetch_one(&mut *tx)
                .await?
            }
            ReservationEvent::Cancel => {
                sqlx::query_as::<_, Reservation>(&format!(
                    r#"
                    UPDATE reservations
                    SET status = $2, cancelled_at = $3, updated_at = $3,
                        cancelled_by = $4,
                        pharmacy_notes = COALESCE($5, pharmacy_notes)
                    WHERE id = $1
                    RETURNING {RESERVATION_COLUMNS}
                    "#
                ))
                .bind(id)
                .bind(to.as_str())
                .bind(now)
                .bind(actor_user_id)
                .bind(notes)
                .fetch_one(&mut *tx)
                .await?
            }
            ReservationEvent::Expire => {
                sqlx::query_as::<_, Reservation>(&format!(
                    r#"
                    UPDATE reservations
                    SET status = $2, updated_at = $3
                    WHERE id = $1
                    RETURNING {RESERVATION_COLUMNS}
                    "#
                ))
                .bind(id)
                .bind(to.as_str())
                .bind(now)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        tx.commit().await?;

        self.load_bundle(updated).await
    }

    /// Expire one reservation if its deadline has passed, restoring stock.
    /// Returns the pharmacy id when a transition happened (the caller uses
    /// it for cache invalidation).
    pub async fn expire_if_due(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<Option<Uuid>> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, Reservation>(&format!(
            r#"
            SELECT {RESERVATION_COLUMNS}
            FROM reservations
            WHERE id = $1
            FOR UPDATE
            "#
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(current) = current else {
            return Ok(None);
        };
        let Some(status) = ReservationStatus::parse(&current.status) else {
            return Ok(None);
        };
        // Re-checked under the lock: another request may have expired or
        // transitioned it since the caller looked.
        if !is_expired(status, current.expires_at, now) {
            return Ok(None);
        }

        restore_reservation_stock(&mut tx, id, now).await?;

        sqlx::query(
            r#"
            UPDATE reservations SET status = 'expired', updated_at = $2 WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(current.pharmacy_id))
    }

    /// Expire every overdue active reservation. Used by both the background
    /// sweep and the lazy check that guards list reads. Returns the pharmacy
    /// ids whose stock changed.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        let due: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM reservations
            WHERE status IN ('pending', 'confirmed', 'ready') AND expires_at < $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut pharmacies = Vec::new();
        for (id,) in due {
            if let Some(pharmacy_id) = self.expire_if_due(id, now).await? {
                pharmacies.push(pharmacy_id);
            }
        }
        Ok(pharmacies)
    }

    // -------------------------------------------------------------------------
    // CART
    // -------------------------------------------------------------------------

    /// Get-or-create the user's single active cart.
    pub async fn active_cart(&self, user_id: Uuid, now: DateTime<Utc>) -> AppResult<Cart> {
        sqlx::query(
            r#"
            INSERT INTO carts (id, user_id, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (user_id) WHERE status = 'active' DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(CART_ACTIVE)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let cart = sqlx::query_as::<_, Cart>(
            r#"
            SELECT id, user_id, status, created_at, updated_at
            FROM carts
            WHERE user_id = $1 AND status = $2
            "#,
        )
        .bind(user_id)
        .bind(CART_ACTIVE)
        .fetch_one(&self.pool)
        .await?;

        Ok(cart)
    }

    pub async fn cart_items(&self, cart_id: Uuid) -> AppResult<Vec<CartItemDetail>> {
        let items = sqlx::query_as::<_, CartItemDetail>(
            r#"
            SELECT ci.id, ci.medicine_id, m.name AS medicine_name,
                   ci.pharmacy_id, p.name AS pharmacy_name,
                   ci.stock_id, ci.quantity, ci.unit_price
            FROM cart_items ci
            JOIN medicines m ON m.id = ci.medicine_id
            JOIN pharmacies p ON p.id = ci.pharmacy_id
            WHERE ci.cart_id = $1
            ORDER BY ci.added_at ASC
            "#,
        )
        .bind(cart_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    /// Add a line to the active cart. Validates against stock (optimistic,
    /// no decrement) and merges with an existing (medicine, pharmacy) line.
    pub async fn add_cart_item(
        &self,
        user_id: Uuid,
        medicine_id: Uuid,
        pharmacy_id: Uuid,
        stock_id: Option<Uuid>,
        quantity: i32,
        now: DateTime<Utc>,
    ) -> AppResult<Cart> {
        if quantity < 1 {
            return Err(AppError::Validation("Quantity must be at least 1".into()));
        }

        let cart = self.active_cart(user_id, now).await?;

        let mut tx = self.pool.begin().await?;

        let medicine = sqlx::query_as::<_, Medicine>(
            r#"
            SELECT id, name, description, dosage, form, category, average_price,
                   requires_prescription, image_url, created_at, updated_at
            FROM medicines
            WHERE id = $1
            "#,
        )
        .bind(medicine_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Medicine {} not found", medicine_id)))?;

        let pharmacy_exists: (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pharmacies WHERE id = $1)")
                .bind(pharmacy_id)
                .fetch_one(&mut *tx)
                .await?;
        if !pharmacy_exists.0 {
            return Err(AppError::NotFound(format!(
                "Pharmacy {} not found",
                pharmacy_id
            )));
        }

        let existing: Option<(Uuid, i32)> = sqlx::query_as(
            r#"
            SELECT id, quantity FROM cart_items
            WHERE cart_id = $1 AND medicine_id = $2 AND pharmacy_id = $3
            "#,
        )
        .bind(cart.id)
        .bind(medicine_id)
        .bind(pharmacy_id)
        .fetch_optional(&mut *tx)
        .await?;

        let merged_quantity = existing.map(|(_, q)| q).unwrap_or(0) + quantity;

        let mut unit_price = medicine.average_price.unwrap_or(Decimal::ZERO);
        if let Some(stock_id) = stock_id {
            let stock = sqlx::query_as::<_, Stock>(
                r#"
                SELECT id, pharmacy_id, medicine_id, quantity, price, is_available, last_updated
                FROM stocks
                WHERE id = $1
                "#,
            )
            .bind(stock_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Stock {} not found", stock_id)))?;

            if stock.pharmacy_id != pharmacy_id || stock.medicine_id != medicine_id {
                return Err(AppError::Validation(format!(
                    "Stock does not match {} at the selected pharmacy",
                    medicine.name
                )));
            }
            if !stock.is_available {
                return Err(AppError::Validation(format!(
                    "{} is not available at the selected pharmacy",
                    medicine.name
                )));
            }
            if stock.quantity < merged_quantity {
                return Err(AppError::InsufficientStock {
                    medicine: medicine.name.clone(),
                    available: stock.quantity,
                    requested: merged_quantity,
                });
            }
            unit_price = stock.price;
        }

        match existing {
            Some((item_id, _)) => {
                sqlx::query(
                    r#"
                    UPDATE cart_items SET quantity = $2, updated_at = $3 WHERE id = $1
                    "#,
                )
                .bind(item_id)
                .bind(merged_quantity)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO cart_items
                        (id, cart_id, medicine_id, pharmacy_id, stock_id,
                         quantity, unit_price, added_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(cart.id)
                .bind(medicine_id)
                .bind(pharmacy_id)
                .bind(stock_id)
                .bind(quantity)
                .bind(unit_price)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query("UPDATE carts SET updated_at = $2 WHERE id = $1")
            .bind(cart.id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(cart)
    }

    /// Change a line's quantity, re-validating optimistically against the
    /// current stock level.
    pub async fn update_cart_item(
        &self,
        user_id: Uuid,
        item_id: Uuid,
        quantity: i32,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        if quantity < 1 {
            return Err(AppError::Validation("Quantity must be at least 1".into()));
        }

        let mut tx = self.pool.begin().await?;

        let row: Option<(Uuid, Option<Uuid>, Uuid)> = sqlx::query_as(
            r#"
            SELECT ci.id, ci.stock_id, ci.medicine_id
            FROM cart_items ci
            JOIN carts c ON c.id = ci.cart_id
            WHERE ci.id = $1 AND c.user_id = $2 AND c.status = $3
            "#,
        )
        .bind(item_id)
        .bind(user_id)
        .bind(CART_ACTIVE)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((_, stock_id, medicine_id)) = row else {
            return Err(AppError::NotFound(format!("Cart item {} not found", item_id)));
        };

        if let Some(stock_id) = stock_id {
            let stock: Option<(i32,)> = sqlx::query_as("SELECT quantity FROM stocks WHERE id = $1")
                .bind(stock_id)
                .fetch_optional(&mut *tx)
                .await?;
            if let Some((available,)) = stock {
                if available < quantity {
                    let name: (String,) =
                        sqlx::query_as("SELECT name FROM medicines WHERE id = $1")
                            .bind(medicine_id)
                            .fetch_one(&mut *tx)
                            .await?;
                    return Err(AppError::InsufficientStock {
                        medicine: name.0,
                        available,
                        requested: quantity,
                    });
                }
            }
        }

        sqlx::query(
            r#"
            UPDATE cart_items SET quantity = $2, updated_at = $3 WHERE id = $1
            "#,
        )
        .bind(item_id)
        .bind(quantity)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_cart_item(&self, user_id: Uuid, item_id: Uuid) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM cart_items
            USING carts
            WHERE cart_items.cart_id = carts.id
              AND cart_items.id = $1
              AND carts.user_id = $2
              AND carts.status = $3
            "#,
        )
        .bind(item_id)
        .bind(user_id)
        .bind(CART_ACTIVE)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Cart item {} not found", item_id)));
        }
        Ok(())
    }

    pub async fn clear_cart(&self, user_id: Uuid) -> AppResult<()> {
        sqlx::query(
            r#"
            DELETE FROM cart_items
            USING carts
            WHERE cart_items.cart_id = carts.id
              AND carts.user_id = $1
              AND carts.status = $2
            "#,
        )
        .bind(user_id)
        .bind(CART_ACTIVE)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Close the active cart. The next `active_cart` call starts a fresh one.
    pub async fn complete_cart(&self, user_id: Uuid, now: DateTime<Utc>) -> AppResult<Cart> {
        let cart = sqlx::query_as::<_, Cart>(
            r#"
            UPDATE carts SET status = $3, updated_at = $2
            WHERE user_id = $1 AND status = $4
            RETURNING id, user_id, status, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(CART_COMPLETED)
        .bind(CART_ACTIVE)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("No active cart".into()))?;

        Ok(cart)
    }
}

// -----------------------------------------------------------------------------
// SHARED TRANSACTION HELPERS
// -----------------------------------------------------------------------------

/// Lock a stock row for the remainder of the transaction.
async fn lock_stock(
    tx: &mut Transaction<'_, Postgres>,
    stock_id: Uuid,
) -> Result<Option<Stock>, sqlx::Error> {
    sqlx::query_as::<_, Stock>(
        r#"
        SELECT id, pharmacy_id, medicine_id, quantity, price, is_available, last_updated
        FROM stocks
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(stock_id)
    .fetch_optional(&mut **tx)
    .await
}

/// Restore stock for every still-decremented item of a reservation and clear
/// the flags, as one atomic unit. Items whose stock row was deleted keep
/// their flag; there is nothing left to credit.
async fn restore_reservation_stock(
    tx: &mut Transaction<'_, Postgres>,
    reservation_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE stocks s
        SET quantity = s.quantity + ri.quantity,
            last_updated = $2
        FROM reservation_items ri
        WHERE ri.reservation_id = $1
          AND ri.stock_id = s.id
          AND ri.stock_decremented
        "#,
    )
    .bind(reservation_id)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE reservation_items
        SET stock_decremented = FALSE
        WHERE reservation_id = $1
          AND stock_decremented
          AND stock_id IS NOT NULL
        "#,
    )
    .bind(reservation_id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}
