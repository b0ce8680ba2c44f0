//! Persistence boundary.
//!
//! Every mutation of deals, vouchers and payments goes through [`Store`].
//! Operations that must not interleave with concurrent requests are single
//! trait methods so each backend can make them atomic: voucher issuance
//! re-checks capacity under a per-deal lock, and every status change is a
//! compare-and-swap on the current status.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Deal, DealChanges, DealStatus, NewDeal, Payment, PaymentStatus, User, Venue, Voucher,
    VoucherStatus,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("unique constraint violated: {0}")]
    Duplicate(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One voucher row to be issued as part of a purchase.
#[derive(Debug, Clone)]
pub struct NewVoucher {
    pub id: Uuid,
    pub voucher_code: String,
    pub qr_code_data: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: String,
    pub external_payment_id: Option<String>,
    pub status: PaymentStatus,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Vouchers plus the payment that covers them, committed together or not at all.
#[derive(Debug, Clone)]
pub struct NewPurchase {
    pub user_id: Uuid,
    pub deal_id: Uuid,
    pub venue_id: Uuid,
    pub unit_price: Decimal,
    pub vouchers: Vec<NewVoucher>,
    pub payment: NewPayment,
}

impl NewPurchase {
    pub fn quantity(&self) -> i64 {
        self.vouchers.len() as i64
    }
}

/// Result of the capacity-guarded insert. Rejections carry the numbers that
/// were observed while holding the deal lock.
#[derive(Debug, Clone)]
pub enum PurchaseOutcome {
    Committed {
        vouchers: Vec<Voucher>,
        payment: Payment,
    },
    DealInactive,
    /// Active, but outside its sale window at commit time.
    DealUnavailable,
    SoldOut {
        remaining: i64,
    },
    LimitReached {
        limit: i32,
        current: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    pub const DEFAULT_LIMIT: u32 = 20;
    pub const MAX_LIMIT: u32 = 100;

    pub fn new(page: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            limit: limit
                .unwrap_or(Self::DEFAULT_LIMIT)
                .clamp(1, Self::MAX_LIMIT),
        }
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page - 1) * i64::from(self.limit)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: i64,
    pub pages: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub pagination: Pagination,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, request: PageRequest, total: i64) -> Self {
        let limit = i64::from(request.limit);
        Self {
            items,
            pagination: Pagination {
                page: request.page,
                limit: request.limit,
                total,
                pages: (total + limit - 1) / limit,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoucherOwner {
    User(Uuid),
    Venue(Uuid),
}

#[derive(Debug, Clone, Copy)]
pub struct VoucherFilter {
    pub owner: VoucherOwner,
    pub status: Option<VoucherStatus>,
    pub page: PageRequest,
}

/// Which vouchers a stats query covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsScope {
    All,
    Venue(Uuid),
    Deal(Uuid),
}

impl StatsScope {
    pub fn venue(venue_id: Option<Uuid>) -> Self {
        venue_id.map_or(StatsScope::All, StatsScope::Venue)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DealOrder {
    #[default]
    Newest,
    EndingSoon,
    BestSelling,
}

/// Browse filter over deals that are on sale: active, inside their sale
/// window at `now`, and at an active venue.
#[derive(Debug, Clone)]
pub struct DealFilter {
    pub now: DateTime<Utc>,
    pub city: Option<String>,
    pub venue_id: Option<Uuid>,
    /// Case-insensitive substring of title, description or venue name.
    pub search: Option<String>,
    /// Minimum discount, in percent of the original price.
    pub min_savings: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub ends_before: Option<DateTime<Utc>>,
    pub order: DealOrder,
    pub page: PageRequest,
}

impl DealFilter {
    pub fn on_sale(now: DateTime<Utc>, page: PageRequest) -> Self {
        Self {
            now,
            city: None,
            venue_id: None,
            search: None,
            min_savings: None,
            max_price: None,
            ends_before: None,
            order: DealOrder::default(),
            page,
        }
    }
}

/// A deal as shown in browse listings.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DealListing {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub deal: Deal,
    pub venue_name: String,
    pub venue_city: String,
    pub vouchers_sold: i64,
    pub vouchers_remaining: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PaymentFilter {
    pub user_id: Option<Uuid>,
    pub venue_id: Option<Uuid>,
    pub status: Option<PaymentStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub page: PageRequest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct PaymentStats {
    pub total_payments: i64,
    pub completed_payments: i64,
    pub pending_payments: i64,
    pub failed_payments: i64,
    pub refunded_payments: i64,
    /// Sum of completed payments.
    pub total_revenue: Decimal,
    pub average_payment: Decimal,
    pub unique_customers: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct DailyRevenue {
    pub date: NaiveDate,
    pub payment_count: i64,
    pub revenue: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct VoucherStats {
    pub total_vouchers: i64,
    pub active_vouchers: i64,
    pub redeemed_vouchers: i64,
    pub expired_vouchers: i64,
    pub refunded_vouchers: i64,
    pub total_revenue: Decimal,
    pub unique_customers: i64,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_user(&self, id: Uuid) -> StoreResult<Option<User>>;

    async fn find_venue(&self, id: Uuid) -> StoreResult<Option<Venue>>;

    async fn find_deal(&self, id: Uuid) -> StoreResult<Option<Deal>>;

    async fn insert_deal(&self, deal: NewDeal) -> StoreResult<Deal>;

    async fn list_venue_deals(
        &self,
        venue_id: Uuid,
        status: Option<DealStatus>,
    ) -> StoreResult<Vec<Deal>>;

    async fn list_deals(&self, filter: DealFilter) -> StoreResult<Page<DealListing>>;

    /// Overwrites the editable fields only while the deal is still in `status`.
    async fn update_deal(
        &self,
        id: Uuid,
        status: DealStatus,
        changes: DealChanges,
    ) -> StoreResult<Option<Deal>>;

    /// Moves the deal to `to` only while it is still in `from`.
    async fn update_deal_status(
        &self,
        id: Uuid,
        from: DealStatus,
        to: DealStatus,
    ) -> StoreResult<Option<Deal>>;

    /// Every voucher row ever issued against the deal, whatever its status.
    async fn count_vouchers_for_deal(&self, deal_id: Uuid) -> StoreResult<i64>;

    async fn count_vouchers_for_user_and_deal(
        &self,
        user_id: Uuid,
        deal_id: Uuid,
    ) -> StoreResult<i64>;

    /// Inserts the purchase's vouchers and payment in one unit, re-checking
    /// deal status, sale window, capacity and the per-customer cap while
    /// holding the deal.
    async fn insert_purchase(&self, purchase: NewPurchase) -> StoreResult<PurchaseOutcome>;

    async fn find_voucher(&self, id: Uuid) -> StoreResult<Option<Voucher>>;

    async fn find_voucher_by_code(&self, code: &str) -> StoreResult<Option<Voucher>>;

    async fn find_vouchers(&self, ids: &[Uuid]) -> StoreResult<Vec<Voucher>>;

    async fn list_vouchers(&self, filter: VoucherFilter) -> StoreResult<Page<Voucher>>;

    /// Compare-and-swap on voucher status. `redeemed_by` is recorded, together
    /// with `at` as the redemption time, only when moving to `redeemed`.
    async fn update_voucher_status(
        &self,
        id: Uuid,
        from: VoucherStatus,
        to: VoucherStatus,
        redeemed_by: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Voucher>>;

    /// Expires every active voucher whose `expires_at` is not after `now`.
    async fn sweep_expired_vouchers(&self, now: DateTime<Utc>) -> StoreResult<Vec<Voucher>>;

    /// Active vouchers expiring in `(now, until]`, soonest first.
    async fn list_expiring_vouchers(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<Voucher>>;

    async fn voucher_stats(&self, scope: StatsScope, since: DateTime<Utc>)
        -> StoreResult<VoucherStats>;

    async fn find_payment(&self, id: Uuid) -> StoreResult<Option<Payment>>;

    async fn find_payment_by_external_id(&self, external_id: &str)
        -> StoreResult<Option<Payment>>;

    /// Newest first.
    async fn list_payments(&self, filter: PaymentFilter) -> StoreResult<Page<Payment>>;

    async fn payment_stats(
        &self,
        venue_id: Option<Uuid>,
        since: DateTime<Utc>,
    ) -> StoreResult<PaymentStats>;

    /// Completed payments per UTC day, oldest first.
    async fn daily_revenue(
        &self,
        venue_id: Option<Uuid>,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<DailyRevenue>>;

    /// Compare-and-swap on payment status. `metadata` is merged into the
    /// payment's data. Moving to a status that voids vouchers also flips the
    /// payment's still-active vouchers to `refunded` in the same unit, and
    /// putting a failed payment back to pending flips its `refunded`
    /// vouchers back to `active`.
    async fn transition_payment(
        &self,
        id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        metadata: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Payment>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_request_clamps_and_offsets() {
        let request = PageRequest::new(Some(0), Some(500));
        assert_eq!(request.page, 1);
        assert_eq!(request.limit, PageRequest::MAX_LIMIT);
        assert_eq!(request.offset(), 0);

        let request = PageRequest::new(Some(3), Some(20));
        assert_eq!(request.offset(), 40);
    }

    #[test]
    fn page_counts_partial_last_page() {
        let page = Page::new(vec![1, 2, 3], PageRequest::new(Some(1), Some(20)), 41);
        assert_eq!(page.pagination.pages, 3);

        let empty: Page<i32> = Page::new(vec![], PageRequest::default(), 0);
        assert_eq!(empty.pagination.pages, 0);
    }
}
