use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    DailyRevenue, DealFilter, DealListing, DealOrder, NewPurchase, Page, PaymentFilter,
    PaymentStats, PurchaseOutcome, StatsScope, Store, StoreError, StoreResult, VoucherFilter,
    VoucherOwner, VoucherStats,
};
use crate::models::{
    Deal, DealChanges, DealStatus, NewDeal, Payment, PaymentStatus, User, Venue, Voucher,
    VoucherStatus,
};

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!().run(&self.pool).await?;
        info!("Migrations run successfully");
        Ok(())
    }
}

fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            StoreError::Duplicate(db.message().to_string())
        }
        _ => StoreError::Database(err),
    }
}

fn owner_column(owner: VoucherOwner) -> (&'static str, Uuid) {
    match owner {
        VoucherOwner::User(id) => ("user_id", id),
        VoucherOwner::Venue(id) => ("venue_id", id),
    }
}

fn scope_column(scope: StatsScope) -> (&'static str, Option<Uuid>) {
    match scope {
        StatsScope::All => ("venue_id", None),
        StatsScope::Venue(id) => ("venue_id", Some(id)),
        StatsScope::Deal(id) => ("deal_id", Some(id)),
    }
}

fn deal_order(order: DealOrder) -> &'static str {
    match order {
        DealOrder::Newest => "d.created_at DESC",
        DealOrder::EndingSoon => "d.end_date ASC",
        DealOrder::BestSelling => "s.sold DESC, d.created_at DESC",
    }
}

/// Escapes `LIKE` wildcards and wraps the term for a substring match.
fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

const ON_SALE_WHERE: &str = r#"
    d.status = 'active' AND v.is_active AND d.start_date <= $1 AND d.end_date >= $1
    AND ($2::text IS NULL OR LOWER(v.city) = LOWER($2))
    AND ($3::uuid IS NULL OR d.venue_id = $3)
    AND ($4::text IS NULL OR d.title ILIKE $4 OR d.description ILIKE $4 OR v.name ILIKE $4)
    AND ($5::numeric IS NULL OR (d.original_price - d.deal_price) / d.original_price * 100 >= $5)
    AND ($6::numeric IS NULL OR d.deal_price <= $6)
    AND ($7::timestamptz IS NULL OR d.end_date <= $7)
"#;

const PAYMENT_WHERE: &str = r#"
    ($1::uuid IS NULL OR user_id = $1)
    AND ($2::uuid IS NULL OR venue_id = $2)
    AND ($3::payment_status IS NULL OR status = $3)
    AND ($4::timestamptz IS NULL OR created_at >= $4)
    AND ($5::timestamptz IS NULL OR created_at <= $5)
"#;

#[async_trait]
impl Store for PgStore {
    async fn find_user(&self, id: Uuid) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_venue(&self, id: Uuid) -> StoreResult<Option<Venue>> {
        let venue = sqlx::query_as::<_, Venue>("SELECT * FROM venues WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(venue)
    }

    async fn find_deal(&self, id: Uuid) -> StoreResult<Option<Deal>> {
        let deal = sqlx::query_as::<_, Deal>("SELECT * FROM deals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(deal)
    }

    async fn insert_deal(&self, deal: NewDeal) -> StoreResult<Deal> {
        debug!(deal_id = %deal.id, venue_id = %deal.venue_id, "Inserting deal");
        sqlx::query_as::<_, Deal>(
            r#"
            INSERT INTO deals (
                id, venue_id, title, description, terms_and_conditions,
                original_price, deal_price, max_vouchers, max_per_customer,
                start_date, end_date, requires_age_verification, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 'draft')
            RETURNING *
            "#,
        )
        .bind(deal.id)
        .bind(deal.venue_id)
        .bind(&deal.title)
        .bind(&deal.description)
        .bind(&deal.terms_and_conditions)
        .bind(deal.original_price)
        .bind(deal.deal_price)
        .bind(deal.max_vouchers)
        .bind(deal.max_per_customer)
        .bind(deal.start_date)
        .bind(deal.end_date)
        .bind(deal.requires_age_verification)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)
    }

    async fn list_venue_deals(
        &self,
        venue_id: Uuid,
        status: Option<DealStatus>,
    ) -> StoreResult<Vec<Deal>> {
        let deals = sqlx::query_as::<_, Deal>(
            r#"
            SELECT * FROM deals
            WHERE venue_id = $1 AND ($2::deal_status IS NULL OR status = $2)
            ORDER BY created_at DESC
            "#,
        )
        .bind(venue_id)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(deals)
    }

    async fn list_deals(&self, filter: DealFilter) -> StoreResult<Page<DealListing>> {
        let search = filter.search.as_deref().map(like_pattern);

        let items = sqlx::query_as::<_, DealListing>(&format!(
            r#"
            SELECT d.*, v.name AS venue_name, v.city AS venue_city, s.sold AS vouchers_sold,
                   GREATEST(d.max_vouchers::BIGINT - s.sold, 0) AS vouchers_remaining
            FROM deals d
            JOIN venues v ON v.id = d.venue_id
            CROSS JOIN LATERAL (
                SELECT COUNT(*) AS sold FROM vouchers x WHERE x.deal_id = d.id
            ) s
            WHERE {ON_SALE_WHERE}
            ORDER BY {}
            LIMIT $8 OFFSET $9
            "#,
            deal_order(filter.order)
        ))
        .bind(filter.now)
        .bind(&filter.city)
        .bind(filter.venue_id)
        .bind(&search)
        .bind(filter.min_savings)
        .bind(filter.max_price)
        .bind(filter.ends_before)
        .bind(i64::from(filter.page.limit))
        .bind(filter.page.offset())
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM deals d JOIN venues v ON v.id = d.venue_id WHERE {ON_SALE_WHERE}"
        ))
        .bind(filter.now)
        .bind(&filter.city)
        .bind(filter.venue_id)
        .bind(&search)
        .bind(filter.min_savings)
        .bind(filter.max_price)
        .bind(filter.ends_before)
        .fetch_one(&self.pool)
        .await?;

        Ok(Page::new(items, filter.page, total))
    }

    async fn update_deal(
        &self,
        id: Uuid,
        status: DealStatus,
        changes: DealChanges,
    ) -> StoreResult<Option<Deal>> {
        let deal = sqlx::query_as::<_, Deal>(
            r#"
            UPDATE deals
            SET title = $3, description = $4, terms_and_conditions = $5,
                original_price = $6, deal_price = $7, max_vouchers = $8,
                max_per_customer = $9, start_date = $10, end_date = $11,
                requires_age_verification = $12, updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(&changes.title)
        .bind(&changes.description)
        .bind(&changes.terms_and_conditions)
        .bind(changes.original_price)
        .bind(changes.deal_price)
        .bind(changes.max_vouchers)
        .bind(changes.max_per_customer)
        .bind(changes.start_date)
        .bind(changes.end_date)
        .bind(changes.requires_age_verification)
        .fetch_optional(&self.pool)
        .await?;
        Ok(deal)
    }

    async fn update_deal_status(
        &self,
        id: Uuid,
        from: DealStatus,
        to: DealStatus,
    ) -> StoreResult<Option<Deal>> {
        let deal = sqlx::query_as::<_, Deal>(
            r#"
            UPDATE deals SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .fetch_optional(&self.pool)
        .await?;
        Ok(deal)
    }

    async fn count_vouchers_for_deal(&self, deal_id: Uuid) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM vouchers WHERE deal_id = $1")
            .bind(deal_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn count_vouchers_for_user_and_deal(
        &self,
        user_id: Uuid,
        deal_id: Uuid,
    ) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM vouchers WHERE user_id = $1 AND deal_id = $2",
        )
        .bind(user_id)
        .bind(deal_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn insert_purchase(&self, purchase: NewPurchase) -> StoreResult<PurchaseOutcome> {
        let mut tx = self.pool.begin().await?;

        // Concurrent purchases of the same deal queue up here until commit.
        let locked = sqlx::query_as::<_, (DealStatus, i32, i32, DateTime<Utc>, DateTime<Utc>)>(
            r#"
            SELECT status, max_vouchers, max_per_customer, start_date, end_date
            FROM deals WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(purchase.deal_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (max_vouchers, max_per_customer) = match locked {
            Some((DealStatus::Active, max_vouchers, max_per_customer, start_date, end_date)) => {
                let now = Utc::now();
                if now < start_date || now > end_date {
                    return Ok(PurchaseOutcome::DealUnavailable);
                }
                (max_vouchers, max_per_customer)
            }
            _ => return Ok(PurchaseOutcome::DealInactive),
        };

        let issued = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM vouchers WHERE deal_id = $1")
            .bind(purchase.deal_id)
            .fetch_one(&mut *tx)
            .await?;
        let remaining = (i64::from(max_vouchers) - issued).max(0);
        if remaining < purchase.quantity() {
            return Ok(PurchaseOutcome::SoldOut { remaining });
        }

        let held = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM vouchers WHERE user_id = $1 AND deal_id = $2",
        )
        .bind(purchase.user_id)
        .bind(purchase.deal_id)
        .fetch_one(&mut *tx)
        .await?;
        if held + purchase.quantity() > i64::from(max_per_customer) {
            return Ok(PurchaseOutcome::LimitReached {
                limit: max_per_customer,
                current: held,
            });
        }

        let mut insert: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO vouchers (id, user_id, deal_id, venue_id, voucher_code, qr_code_data, \
             purchase_price, quantity, expires_at, status) ",
        );
        insert.push_values(&purchase.vouchers, |mut row, voucher| {
            row.push_bind(voucher.id)
                .push_bind(purchase.user_id)
                .push_bind(purchase.deal_id)
                .push_bind(purchase.venue_id)
                .push_bind(&voucher.voucher_code)
                .push_bind(&voucher.qr_code_data)
                .push_bind(purchase.unit_price)
                .push_bind(1_i32)
                .push_bind(voucher.expires_at)
                .push_bind(VoucherStatus::Active);
        });
        insert.push(" RETURNING *");
        let vouchers = insert
            .build_query_as::<Voucher>()
            .fetch_all(&mut *tx)
            .await
            .map_err(classify)?;

        let voucher_ids: Vec<Uuid> = vouchers.iter().map(|v| v.id).collect();
        let payment = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (
                id, user_id, deal_id, venue_id, amount, currency, payment_method,
                external_payment_id, voucher_ids, status, processed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(purchase.payment.id)
        .bind(purchase.user_id)
        .bind(purchase.deal_id)
        .bind(purchase.venue_id)
        .bind(purchase.payment.amount)
        .bind(&purchase.payment.currency)
        .bind(&purchase.payment.payment_method)
        .bind(&purchase.payment.external_payment_id)
        .bind(&voucher_ids)
        .bind(purchase.payment.status)
        .bind(purchase.payment.processed_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(classify)?;

        tx.commit().await?;

        Ok(PurchaseOutcome::Committed { vouchers, payment })
    }

    async fn find_voucher(&self, id: Uuid) -> StoreResult<Option<Voucher>> {
        let voucher = sqlx::query_as::<_, Voucher>("SELECT * FROM vouchers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(voucher)
    }

    async fn find_voucher_by_code(&self, code: &str) -> StoreResult<Option<Voucher>> {
        let voucher = sqlx::query_as::<_, Voucher>("SELECT * FROM vouchers WHERE voucher_code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(voucher)
    }

    async fn find_vouchers(&self, ids: &[Uuid]) -> StoreResult<Vec<Voucher>> {
        let vouchers = sqlx::query_as::<_, Voucher>(
            "SELECT * FROM vouchers WHERE id = ANY($1) ORDER BY created_at",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(vouchers)
    }

    async fn list_vouchers(&self, filter: VoucherFilter) -> StoreResult<Page<Voucher>> {
        let (column, owner_id) = owner_column(filter.owner);

        let items = sqlx::query_as::<_, Voucher>(&format!(
            "SELECT * FROM vouchers \
             WHERE {column} = $1 AND ($2::voucher_status IS NULL OR status = $2) \
             ORDER BY created_at DESC LIMIT $3 OFFSET $4"
        ))
        .bind(owner_id)
        .bind(filter.status)
        .bind(i64::from(filter.page.limit))
        .bind(filter.page.offset())
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM vouchers \
             WHERE {column} = $1 AND ($2::voucher_status IS NULL OR status = $2)"
        ))
        .bind(owner_id)
        .bind(filter.status)
        .fetch_one(&self.pool)
        .await?;

        Ok(Page::new(items, filter.page, total))
    }

    async fn update_voucher_status(
        &self,
        id: Uuid,
        from: VoucherStatus,
        to: VoucherStatus,
        redeemed_by: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Voucher>> {
        let voucher = sqlx::query_as::<_, Voucher>(
            r#"
            UPDATE vouchers
            SET status = $3,
                updated_at = $4,
                redeemed_at = CASE WHEN $3 = 'redeemed'::voucher_status THEN $4 ELSE redeemed_at END,
                redeemed_by = CASE WHEN $3 = 'redeemed'::voucher_status THEN $5 ELSE redeemed_by END
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(at)
        .bind(redeemed_by)
        .fetch_optional(&self.pool)
        .await?;
        Ok(voucher)
    }

    async fn sweep_expired_vouchers(&self, now: DateTime<Utc>) -> StoreResult<Vec<Voucher>> {
        let expired = sqlx::query_as::<_, Voucher>(
            r#"
            UPDATE vouchers
            SET status = 'expired', updated_at = $1
            WHERE status = 'active' AND expires_at <= $1
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(expired)
    }

    async fn list_expiring_vouchers(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<Voucher>> {
        let vouchers = sqlx::query_as::<_, Voucher>(
            r#"
            SELECT * FROM vouchers
            WHERE status = 'active' AND expires_at > $1 AND expires_at <= $2
            ORDER BY expires_at
            "#,
        )
        .bind(now)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;
        Ok(vouchers)
    }

    async fn voucher_stats(
        &self,
        scope: StatsScope,
        since: DateTime<Utc>,
    ) -> StoreResult<VoucherStats> {
        let (column, scope_id) = scope_column(scope);
        let stats = sqlx::query_as::<_, VoucherStats>(&format!(
            r#"
            SELECT
                COUNT(*) AS total_vouchers,
                COUNT(*) FILTER (WHERE status = 'active') AS active_vouchers,
                COUNT(*) FILTER (WHERE status = 'redeemed') AS redeemed_vouchers,
                COUNT(*) FILTER (WHERE status = 'expired') AS expired_vouchers,
                COUNT(*) FILTER (WHERE status = 'refunded') AS refunded_vouchers,
                COALESCE(SUM(purchase_price), 0) AS total_revenue,
                COUNT(DISTINCT user_id) AS unique_customers
            FROM vouchers
            WHERE created_at >= $1 AND ($2::uuid IS NULL OR {column} = $2)
            "#
        ))
        .bind(since)
        .bind(scope_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    async fn find_payment(&self, id: Uuid) -> StoreResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(payment)
    }

    async fn find_payment_by_external_id(
        &self,
        external_id: &str,
    ) -> StoreResult<Option<Payment>> {
        let payment =
            sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE external_payment_id = $1")
                .bind(external_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(payment)
    }

    async fn list_payments(&self, filter: PaymentFilter) -> StoreResult<Page<Payment>> {
        let items = sqlx::query_as::<_, Payment>(&format!(
            "SELECT * FROM payments WHERE {PAYMENT_WHERE} \
             ORDER BY created_at DESC LIMIT $6 OFFSET $7"
        ))
        .bind(filter.user_id)
        .bind(filter.venue_id)
        .bind(filter.status)
        .bind(filter.created_after)
        .bind(filter.created_before)
        .bind(i64::from(filter.page.limit))
        .bind(filter.page.offset())
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM payments WHERE {PAYMENT_WHERE}"
        ))
        .bind(filter.user_id)
        .bind(filter.venue_id)
        .bind(filter.status)
        .bind(filter.created_after)
        .bind(filter.created_before)
        .fetch_one(&self.pool)
        .await?;

        Ok(Page::new(items, filter.page, total))
    }

    async fn payment_stats(
        &self,
        venue_id: Option<Uuid>,
        since: DateTime<Utc>,
    ) -> StoreResult<PaymentStats> {
        let stats = sqlx::query_as::<_, PaymentStats>(
            r#"
            SELECT
                COUNT(*) AS total_payments,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed_payments,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending_payments,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed_payments,
                COUNT(*) FILTER (WHERE status = 'refunded') AS refunded_payments,
                COALESCE(SUM(amount) FILTER (WHERE status = 'completed'), 0) AS total_revenue,
                COALESCE(AVG(amount) FILTER (WHERE status = 'completed'), 0) AS average_payment,
                COUNT(DISTINCT user_id) AS unique_customers
            FROM payments
            WHERE created_at >= $1 AND ($2::uuid IS NULL OR venue_id = $2)
            "#,
        )
        .bind(since)
        .bind(venue_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    async fn daily_revenue(
        &self,
        venue_id: Option<Uuid>,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<DailyRevenue>> {
        let days = sqlx::query_as::<_, DailyRevenue>(
            r#"
            SELECT
                (created_at AT TIME ZONE 'UTC')::date AS date,
                COUNT(*) AS payment_count,
                COALESCE(SUM(amount), 0) AS revenue
            FROM payments
            WHERE status = 'completed' AND created_at >= $1
              AND ($2::uuid IS NULL OR venue_id = $2)
            GROUP BY 1
            ORDER BY 1
            "#,
        )
        .bind(since)
        .bind(venue_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(days)
    }

    async fn transition_payment(
        &self,
        id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        metadata: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Payment>> {
        let mut tx = self.pool.begin().await?;

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = $3,
                updated_at = $5,
                processed_at = CASE WHEN $3 = 'completed'::payment_status THEN $5 ELSE processed_at END,
                payment_data = CASE
                    WHEN $4::jsonb IS NULL THEN payment_data
                    ELSE COALESCE(payment_data, '{}'::jsonb) || $4::jsonb
                END
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(metadata)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(payment) = payment else {
            return Ok(None);
        };

        if to.voids_vouchers() && !payment.voucher_ids.is_empty() {
            let flipped = sqlx::query(
                r#"
                UPDATE vouchers SET status = 'refunded', updated_at = $2
                WHERE id = ANY($1) AND status = 'active'
                "#,
            )
            .bind(&payment.voucher_ids)
            .bind(at)
            .execute(&mut *tx)
            .await?;
            debug!(payment_id = %payment.id, vouchers = flipped.rows_affected(), "Voided vouchers");
        } else if to.reinstates_vouchers(from) && !payment.voucher_ids.is_empty() {
            let restored = sqlx::query(
                r#"
                UPDATE vouchers SET status = 'active', updated_at = $2
                WHERE id = ANY($1) AND status = 'refunded'
                "#,
            )
            .bind(&payment.voucher_ids)
            .bind(at)
            .execute(&mut *tx)
            .await?;
            debug!(payment_id = %payment.id, vouchers = restored.rows_affected(), "Reinstated vouchers");
        }

        tx.commit().await?;
        Ok(Some(payment))
    }
}
