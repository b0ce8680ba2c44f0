//! In-process [`Store`] backed by a single mutex.
//!
//! Every operation holds the lock from start to finish, so each trait method
//! is atomic with respect to every other.

use std::collections::{BTreeMap, HashMap, HashSet};
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{
    DailyRevenue, DealFilter, DealListing, DealOrder, NewPurchase, Page, PageRequest,
    PaymentFilter, PaymentStats, PurchaseOutcome, StatsScope, Store, StoreError, StoreResult,
    VoucherFilter, VoucherOwner, VoucherStats,
};
use crate::models::{
    Deal, DealChanges, DealStatus, NewDeal, Payment, PaymentStatus, User, Venue, Voucher,
    VoucherStatus,
};

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    venues: HashMap<Uuid, Venue>,
    deals: HashMap<Uuid, Deal>,
    vouchers: Vec<Voucher>,
    payments: Vec<Payment>,
}

impl Inner {
    fn voucher_mut(&mut self, id: Uuid) -> Option<&mut Voucher> {
        self.vouchers.iter_mut().find(|v| v.id == id)
    }

    fn sold(&self, deal_id: Uuid) -> i64 {
        self.vouchers.iter().filter(|v| v.deal_id == deal_id).count() as i64
    }

    fn listing(&self, deal: &Deal, venue: &Venue) -> DealListing {
        let vouchers_sold = self.sold(deal.id);
        DealListing {
            deal: deal.clone(),
            venue_name: venue.name.clone(),
            venue_city: venue.city.clone(),
            vouchers_sold,
            vouchers_remaining: (i64::from(deal.max_vouchers) - vouchers_sold).max(0),
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    #[cfg(test)]
    fail_voucher_lookups: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_user(&self, user: User) {
        self.state().users.insert(user.id, user);
    }

    pub fn insert_venue(&self, venue: Venue) {
        self.state().venues.insert(venue.id, venue);
    }

    /// Applies `change` to a stored voucher in place. Returns false when absent.
    pub fn modify_voucher(&self, id: Uuid, change: impl FnOnce(&mut Voucher)) -> bool {
        match self.state().voucher_mut(id) {
            Some(voucher) => {
                change(voucher);
                true
            }
            None => false,
        }
    }

    /// Applies `change` to a stored deal in place. Returns false when absent.
    pub fn modify_deal(&self, id: Uuid, change: impl FnOnce(&mut Deal)) -> bool {
        match self.state().deals.get_mut(&id) {
            Some(deal) => {
                change(deal);
                true
            }
            None => false,
        }
    }

    /// Makes `find_vouchers` fail as if the database were unreachable.
    #[cfg(test)]
    pub fn fail_voucher_lookups(&self, fail: bool) {
        self.fail_voucher_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn voucher_count(&self) -> usize {
        self.state().vouchers.len()
    }

    pub fn payment_count(&self) -> usize {
        self.state().payments.len()
    }
}

fn paginate<T>(items: Vec<T>, page: PageRequest) -> Page<T> {
    let total = items.len() as i64;
    let items = items
        .into_iter()
        .skip(page.offset() as usize)
        .take(page.limit as usize)
        .collect();
    Page::new(items, page, total)
}

fn matches_deal(filter: &DealFilter, deal: &Deal, venue: &Venue) -> bool {
    if deal.status != DealStatus::Active || !venue.is_active || !deal.is_on_sale_at(filter.now) {
        return false;
    }
    if let Some(city) = &filter.city {
        if !venue.city.eq_ignore_ascii_case(city) {
            return false;
        }
    }
    if filter.venue_id.is_some_and(|id| id != deal.venue_id) {
        return false;
    }
    if let Some(search) = &filter.search {
        let needle = search.to_lowercase();
        let found = deal.title.to_lowercase().contains(&needle)
            || venue.name.to_lowercase().contains(&needle)
            || deal
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&needle));
        if !found {
            return false;
        }
    }
    if filter.min_savings.is_some_and(|min| deal.savings_percent() < min) {
        return false;
    }
    if filter.max_price.is_some_and(|max| deal.deal_price > max) {
        return false;
    }
    filter.ends_before.map_or(true, |before| deal.end_date <= before)
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_user(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.state().users.get(&id).cloned())
    }

    async fn find_venue(&self, id: Uuid) -> StoreResult<Option<Venue>> {
        Ok(self.state().venues.get(&id).cloned())
    }

    async fn find_deal(&self, id: Uuid) -> StoreResult<Option<Deal>> {
        Ok(self.state().deals.get(&id).cloned())
    }

    async fn insert_deal(&self, deal: NewDeal) -> StoreResult<Deal> {
        let now = Utc::now();
        let deal = Deal {
            id: deal.id,
            venue_id: deal.venue_id,
            title: deal.title,
            description: deal.description,
            terms_and_conditions: deal.terms_and_conditions,
            original_price: deal.original_price,
            deal_price: deal.deal_price,
            max_vouchers: deal.max_vouchers,
            max_per_customer: deal.max_per_customer,
            start_date: deal.start_date,
            end_date: deal.end_date,
            requires_age_verification: deal.requires_age_verification,
            status: DealStatus::Draft,
            created_at: now,
            updated_at: now,
        };

        let mut state = self.state();
        if state.deals.contains_key(&deal.id) {
            return Err(StoreError::Duplicate(format!("deal {}", deal.id)));
        }
        state.deals.insert(deal.id, deal.clone());
        Ok(deal)
    }

    async fn list_venue_deals(
        &self,
        venue_id: Uuid,
        status: Option<DealStatus>,
    ) -> StoreResult<Vec<Deal>> {
        let mut deals: Vec<Deal> = self
            .state()
            .deals
            .values()
            .filter(|d| d.venue_id == venue_id)
            .filter(|d| status.map_or(true, |s| d.status == s))
            .cloned()
            .collect();
        deals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(deals)
    }

    async fn list_deals(&self, filter: DealFilter) -> StoreResult<Page<DealListing>> {
        let state = self.state();
        let mut listings: Vec<DealListing> = state
            .deals
            .values()
            .filter_map(|deal| {
                let venue = state.venues.get(&deal.venue_id)?;
                matches_deal(&filter, deal, venue).then(|| state.listing(deal, venue))
            })
            .collect();

        match filter.order {
            DealOrder::Newest => listings.sort_by(|a, b| b.deal.created_at.cmp(&a.deal.created_at)),
            DealOrder::EndingSoon => listings.sort_by_key(|l| l.deal.end_date),
            DealOrder::BestSelling => listings.sort_by(|a, b| b.vouchers_sold.cmp(&a.vouchers_sold)),
        }
        Ok(paginate(listings, filter.page))
    }

    async fn update_deal(
        &self,
        id: Uuid,
        status: DealStatus,
        changes: DealChanges,
    ) -> StoreResult<Option<Deal>> {
        let mut state = self.state();
        Ok(match state.deals.get_mut(&id) {
            Some(deal) if deal.status == status => {
                deal.title = changes.title;
                deal.description = changes.description;
                deal.terms_and_conditions = changes.terms_and_conditions;
                deal.original_price = changes.original_price;
                deal.deal_price = changes.deal_price;
                deal.max_vouchers = changes.max_vouchers;
                deal.max_per_customer = changes.max_per_customer;
                deal.start_date = changes.start_date;
                deal.end_date = changes.end_date;
                deal.requires_age_verification = changes.requires_age_verification;
                deal.updated_at = Utc::now();
                Some(deal.clone())
            }
            _ => None,
        })
    }

    async fn update_deal_status(
        &self,
        id: Uuid,
        from: DealStatus,
        to: DealStatus,
    ) -> StoreResult<Option<Deal>> {
        let mut state = self.state();
        Ok(match state.deals.get_mut(&id) {
            Some(deal) if deal.status == from => {
                deal.status = to;
                deal.updated_at = Utc::now();
                Some(deal.clone())
            }
            _ => None,
        })
    }

    async fn count_vouchers_for_deal(&self, deal_id: Uuid) -> StoreResult<i64> {
        Ok(self.state().sold(deal_id))
    }

    async fn count_vouchers_for_user_and_deal(
        &self,
        user_id: Uuid,
        deal_id: Uuid,
    ) -> StoreResult<i64> {
        let state = self.state();
        Ok(state
            .vouchers
            .iter()
            .filter(|v| v.user_id == user_id && v.deal_id == deal_id)
            .count() as i64)
    }

    async fn insert_purchase(&self, purchase: NewPurchase) -> StoreResult<PurchaseOutcome> {
        let mut state = self.state();

        let (max_vouchers, max_per_customer) = match state.deals.get(&purchase.deal_id) {
            Some(deal) if deal.status == DealStatus::Active => {
                if !deal.is_on_sale_at(Utc::now()) {
                    return Ok(PurchaseOutcome::DealUnavailable);
                }
                (deal.max_vouchers, deal.max_per_customer)
            }
            _ => return Ok(PurchaseOutcome::DealInactive),
        };

        let issued = state.sold(purchase.deal_id);
        let remaining = (i64::from(max_vouchers) - issued).max(0);
        if remaining < purchase.quantity() {
            return Ok(PurchaseOutcome::SoldOut { remaining });
        }

        let held = state
            .vouchers
            .iter()
            .filter(|v| v.deal_id == purchase.deal_id && v.user_id == purchase.user_id)
            .count() as i64;
        if held + purchase.quantity() > i64::from(max_per_customer) {
            return Ok(PurchaseOutcome::LimitReached {
                limit: max_per_customer,
                current: held,
            });
        }

        let existing_codes: HashSet<&str> =
            state.vouchers.iter().map(|v| v.voucher_code.as_str()).collect();
        if let Some(clash) = purchase
            .vouchers
            .iter()
            .find(|v| existing_codes.contains(v.voucher_code.as_str()))
        {
            return Err(StoreError::Duplicate(format!(
                "voucher code {}",
                clash.voucher_code
            )));
        }

        let now = Utc::now();
        let vouchers: Vec<Voucher> = purchase
            .vouchers
            .iter()
            .map(|v| Voucher {
                id: v.id,
                user_id: purchase.user_id,
                deal_id: purchase.deal_id,
                venue_id: purchase.venue_id,
                voucher_code: v.voucher_code.clone(),
                qr_code_data: v.qr_code_data.clone(),
                purchase_price: purchase.unit_price,
                quantity: 1,
                expires_at: v.expires_at,
                status: VoucherStatus::Active,
                redeemed_at: None,
                redeemed_by: None,
                created_at: now,
                updated_at: now,
            })
            .collect();

        let payment = Payment {
            id: purchase.payment.id,
            user_id: purchase.user_id,
            deal_id: purchase.deal_id,
            venue_id: purchase.venue_id,
            amount: purchase.payment.amount,
            currency: purchase.payment.currency,
            payment_method: purchase.payment.payment_method,
            external_payment_id: purchase.payment.external_payment_id,
            voucher_ids: vouchers.iter().map(|v| v.id).collect(),
            status: purchase.payment.status,
            payment_data: None,
            processed_at: purchase.payment.processed_at,
            created_at: now,
            updated_at: now,
        };

        state.vouchers.extend(vouchers.iter().cloned());
        state.payments.push(payment.clone());

        Ok(PurchaseOutcome::Committed { vouchers, payment })
    }

    async fn find_voucher(&self, id: Uuid) -> StoreResult<Option<Voucher>> {
        Ok(self.state().vouchers.iter().find(|v| v.id == id).cloned())
    }

    async fn find_voucher_by_code(&self, code: &str) -> StoreResult<Option<Voucher>> {
        Ok(self
            .state()
            .vouchers
            .iter()
            .find(|v| v.voucher_code == code)
            .cloned())
    }

    async fn find_vouchers(&self, ids: &[Uuid]) -> StoreResult<Vec<Voucher>> {
        #[cfg(test)]
        if self.fail_voucher_lookups.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(self
            .state()
            .vouchers
            .iter()
            .filter(|v| ids.contains(&v.id))
            .cloned()
            .collect())
    }

    async fn list_vouchers(&self, filter: VoucherFilter) -> StoreResult<Page<Voucher>> {
        let mut vouchers: Vec<Voucher> = self
            .state()
            .vouchers
            .iter()
            .filter(|v| match filter.owner {
                VoucherOwner::User(id) => v.user_id == id,
                VoucherOwner::Venue(id) => v.venue_id == id,
            })
            .filter(|v| filter.status.map_or(true, |s| v.status == s))
            .cloned()
            .collect();
        vouchers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(vouchers, filter.page))
    }

    async fn update_voucher_status(
        &self,
        id: Uuid,
        from: VoucherStatus,
        to: VoucherStatus,
        redeemed_by: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Voucher>> {
        let mut state = self.state();
        Ok(match state.voucher_mut(id) {
            Some(voucher) if voucher.status == from => {
                voucher.status = to;
                voucher.updated_at = at;
                if to == VoucherStatus::Redeemed {
                    voucher.redeemed_at = Some(at);
                    voucher.redeemed_by = redeemed_by;
                }
                Some(voucher.clone())
            }
            _ => None,
        })
    }

    async fn sweep_expired_vouchers(&self, now: DateTime<Utc>) -> StoreResult<Vec<Voucher>> {
        let mut state = self.state();
        let mut expired = Vec::new();
        for voucher in state
            .vouchers
            .iter_mut()
            .filter(|v| v.status == VoucherStatus::Active && v.expires_at <= now)
        {
            voucher.status = VoucherStatus::Expired;
            voucher.updated_at = now;
            expired.push(voucher.clone());
        }
        Ok(expired)
    }

    async fn list_expiring_vouchers(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<Voucher>> {
        let mut vouchers: Vec<Voucher> = self
            .state()
            .vouchers
            .iter()
            .filter(|v| v.status == VoucherStatus::Active)
            .filter(|v| v.expires_at > now && v.expires_at <= until)
            .cloned()
            .collect();
        vouchers.sort_by_key(|v| v.expires_at);
        Ok(vouchers)
    }

    async fn voucher_stats(
        &self,
        scope: StatsScope,
        since: DateTime<Utc>,
    ) -> StoreResult<VoucherStats> {
        let state = self.state();
        let scoped: Vec<&Voucher> = state
            .vouchers
            .iter()
            .filter(|v| v.created_at >= since)
            .filter(|v| match scope {
                StatsScope::All => true,
                StatsScope::Venue(id) => v.venue_id == id,
                StatsScope::Deal(id) => v.deal_id == id,
            })
            .collect();

        let count = |status: VoucherStatus| {
            scoped.iter().filter(|v| v.status == status).count() as i64
        };
        let customers: HashSet<Uuid> = scoped.iter().map(|v| v.user_id).collect();

        Ok(VoucherStats {
            total_vouchers: scoped.len() as i64,
            active_vouchers: count(VoucherStatus::Active),
            redeemed_vouchers: count(VoucherStatus::Redeemed),
            expired_vouchers: count(VoucherStatus::Expired),
            refunded_vouchers: count(VoucherStatus::Refunded),
            total_revenue: scoped.iter().map(|v| v.purchase_price).sum::<Decimal>(),
            unique_customers: customers.len() as i64,
        })
    }

    async fn find_payment(&self, id: Uuid) -> StoreResult<Option<Payment>> {
        Ok(self.state().payments.iter().find(|p| p.id == id).cloned())
    }

    async fn find_payment_by_external_id(
        &self,
        external_id: &str,
    ) -> StoreResult<Option<Payment>> {
        Ok(self
            .state()
            .payments
            .iter()
            .find(|p| p.external_payment_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn list_payments(&self, filter: PaymentFilter) -> StoreResult<Page<Payment>> {
        let mut payments: Vec<Payment> = self
            .state()
            .payments
            .iter()
            .filter(|p| filter.user_id.map_or(true, |id| p.user_id == id))
            .filter(|p| filter.venue_id.map_or(true, |id| p.venue_id == id))
            .filter(|p| filter.status.map_or(true, |s| p.status == s))
            .filter(|p| filter.created_after.map_or(true, |at| p.created_at >= at))
            .filter(|p| filter.created_before.map_or(true, |at| p.created_at <= at))
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(payments, filter.page))
    }

    async fn payment_stats(
        &self,
        venue_id: Option<Uuid>,
        since: DateTime<Utc>,
    ) -> StoreResult<PaymentStats> {
        let state = self.state();
        let scoped: Vec<&Payment> = state
            .payments
            .iter()
            .filter(|p| p.created_at >= since)
            .filter(|p| venue_id.map_or(true, |id| p.venue_id == id))
            .collect();

        let count = |status: PaymentStatus| {
            scoped.iter().filter(|p| p.status == status).count() as i64
        };
        let completed: Vec<Decimal> = scoped
            .iter()
            .filter(|p| p.status == PaymentStatus::Completed)
            .map(|p| p.amount)
            .collect();
        let total_revenue: Decimal = completed.iter().sum();
        let average_payment = if completed.is_empty() {
            Decimal::ZERO
        } else {
            total_revenue / Decimal::from(completed.len() as i64)
        };
        let customers: HashSet<Uuid> = scoped.iter().map(|p| p.user_id).collect();

        Ok(PaymentStats {
            total_payments: scoped.len() as i64,
            completed_payments: count(PaymentStatus::Completed),
            pending_payments: count(PaymentStatus::Pending),
            failed_payments: count(PaymentStatus::Failed),
            refunded_payments: count(PaymentStatus::Refunded),
            total_revenue,
            average_payment,
            unique_customers: customers.len() as i64,
        })
    }

    async fn daily_revenue(
        &self,
        venue_id: Option<Uuid>,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<DailyRevenue>> {
        let state = self.state();
        let mut days: BTreeMap<NaiveDate, (i64, Decimal)> = BTreeMap::new();
        for payment in state
            .payments
            .iter()
            .filter(|p| p.status == PaymentStatus::Completed && p.created_at >= since)
            .filter(|p| venue_id.map_or(true, |id| p.venue_id == id))
        {
            let day = days.entry(payment.created_at.date_naive()).or_default();
            day.0 += 1;
            day.1 += payment.amount;
        }
        Ok(days
            .into_iter()
            .map(|(date, (payment_count, revenue))| DailyRevenue {
                date,
                payment_count,
                revenue,
            })
            .collect())
    }

    async fn transition_payment(
        &self,
        id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        metadata: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Payment>> {
        let mut state = self.state();

        let payment = match state.payments.iter_mut().find(|p| p.id == id) {
            Some(payment) if payment.status == from => payment,
            _ => return Ok(None),
        };

        payment.status = to;
        payment.updated_at = at;
        if to == PaymentStatus::Completed {
            payment.processed_at = Some(at);
        }
        if let Some(serde_json::Value::Object(extra)) = metadata {
            let mut data = match payment.payment_data.take() {
                Some(serde_json::Value::Object(existing)) => existing,
                _ => serde_json::Map::new(),
            };
            data.extend(extra);
            payment.payment_data = Some(serde_json::Value::Object(data));
        }
        let payment = payment.clone();

        let flip = if to.voids_vouchers() {
            Some((VoucherStatus::Active, VoucherStatus::Refunded))
        } else if to.reinstates_vouchers(from) {
            Some((VoucherStatus::Refunded, VoucherStatus::Active))
        } else {
            None
        };
        if let Some((old, new)) = flip {
            for voucher in state
                .vouchers
                .iter_mut()
                .filter(|v| payment.voucher_ids.contains(&v.id))
                .filter(|v| v.status == old)
            {
                voucher.status = new;
                voucher.updated_at = at;
            }
        }

        Ok(Some(payment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{active_deal, customer, seeded_store};
    use crate::store::{NewPayment, NewVoucher};
    use chrono::Duration;

    fn purchase_of(deal: &Deal, user_id: Uuid, codes: &[&str]) -> NewPurchase {
        NewPurchase {
            user_id,
            deal_id: deal.id,
            venue_id: deal.venue_id,
            unit_price: deal.deal_price,
            vouchers: codes
                .iter()
                .map(|code| NewVoucher {
                    id: Uuid::new_v4(),
                    voucher_code: code.to_string(),
                    qr_code_data: format!("qr-{code}"),
                    expires_at: Utc::now() + Duration::days(90),
                })
                .collect(),
            payment: NewPayment {
                id: Uuid::new_v4(),
                amount: deal.deal_price * Decimal::from(codes.len() as i64),
                currency: "ZAR".to_string(),
                payment_method: "direct".to_string(),
                external_payment_id: None,
                status: PaymentStatus::Completed,
                processed_at: Some(Utc::now()),
            },
        }
    }

    #[tokio::test]
    async fn test_insert_purchase_rejects_over_capacity() {
        let store = seeded_store();
        let user = customer(&store, None);
        let deal = active_deal(&store, |d| d.max_vouchers = 2).await;

        let outcome = store
            .insert_purchase(purchase_of(&deal, user.id, &["A", "B", "C"]))
            .await
            .unwrap();

        assert!(matches!(outcome, PurchaseOutcome::SoldOut { remaining: 2 }));
        assert_eq!(store.voucher_count(), 0);
        assert_eq!(store.payment_count(), 0);
    }

    #[tokio::test]
    async fn test_insert_purchase_rejects_duplicate_code() {
        let store = seeded_store();
        let user = customer(&store, None);
        let deal = active_deal(&store, |_| {}).await;

        store
            .insert_purchase(purchase_of(&deal, user.id, &["SAME"]))
            .await
            .unwrap();
        let err = store
            .insert_purchase(purchase_of(&deal, user.id, &["SAME"]))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Duplicate(_)));
        assert_eq!(store.voucher_count(), 1);
    }

    #[tokio::test]
    async fn test_voucher_status_swap_only_from_expected_state() {
        let store = seeded_store();
        let user = customer(&store, None);
        let deal = active_deal(&store, |_| {}).await;
        let PurchaseOutcome::Committed { vouchers, .. } = store
            .insert_purchase(purchase_of(&deal, user.id, &["X1"]))
            .await
            .unwrap()
        else {
            panic!("purchase should commit");
        };
        let id = vouchers[0].id;
        let now = Utc::now();

        let redeemed = store
            .update_voucher_status(id, VoucherStatus::Active, VoucherStatus::Redeemed, Some(user.id), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redeemed.redeemed_by, Some(user.id));
        assert_eq!(redeemed.redeemed_at, Some(now));

        let second = store
            .update_voucher_status(id, VoucherStatus::Active, VoucherStatus::Redeemed, Some(user.id), now)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_refund_transition_leaves_redeemed_vouchers() {
        let store = seeded_store();
        let user = customer(&store, None);
        let deal = active_deal(&store, |_| {}).await;
        let PurchaseOutcome::Committed { vouchers, payment } = store
            .insert_purchase(purchase_of(&deal, user.id, &["R1", "R2"]))
            .await
            .unwrap()
        else {
            panic!("purchase should commit");
        };
        let now = Utc::now();
        store
            .update_voucher_status(vouchers[0].id, VoucherStatus::Active, VoucherStatus::Redeemed, None, now)
            .await
            .unwrap();

        let refunded = store
            .transition_payment(
                payment.id,
                PaymentStatus::Completed,
                PaymentStatus::Refunded,
                Some(serde_json::json!({ "refund_reason": "duplicate" })),
                now,
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(refunded.status, PaymentStatus::Refunded);
        assert_eq!(refunded.payment_data.unwrap()["refund_reason"], "duplicate");
        let first = store.find_voucher(vouchers[0].id).await.unwrap().unwrap();
        let second = store.find_voucher(vouchers[1].id).await.unwrap().unwrap();
        assert_eq!(first.status, VoucherStatus::Redeemed);
        assert_eq!(second.status, VoucherStatus::Refunded);
    }

    #[tokio::test]
    async fn test_insert_purchase_rejects_closed_sale_window() {
        let store = seeded_store();
        let user = customer(&store, None);
        let deal = active_deal(&store, |d| {
            d.start_date = Utc::now() - Duration::days(5);
            d.end_date = Utc::now() - Duration::minutes(1);
        })
        .await;

        let outcome = store
            .insert_purchase(purchase_of(&deal, user.id, &["LATE"]))
            .await
            .unwrap();

        assert!(matches!(outcome, PurchaseOutcome::DealUnavailable));
        assert_eq!(store.voucher_count(), 0);
        assert_eq!(store.payment_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_payment_back_to_pending_reinstates_vouchers() {
        let store = seeded_store();
        let user = customer(&store, None);
        let deal = active_deal(&store, |_| {}).await;
        let mut purchase = purchase_of(&deal, user.id, &["F1", "F2"]);
        purchase.payment.status = PaymentStatus::Pending;
        purchase.payment.processed_at = None;
        let PurchaseOutcome::Committed { vouchers, payment } =
            store.insert_purchase(purchase).await.unwrap()
        else {
            panic!("purchase should commit");
        };
        let now = Utc::now();

        store
            .transition_payment(payment.id, PaymentStatus::Pending, PaymentStatus::Failed, None, now)
            .await
            .unwrap()
            .unwrap();
        for voucher in store.find_vouchers(&payment.voucher_ids).await.unwrap() {
            assert_eq!(voucher.status, VoucherStatus::Refunded);
        }

        store
            .transition_payment(payment.id, PaymentStatus::Failed, PaymentStatus::Pending, None, now)
            .await
            .unwrap()
            .unwrap();
        for voucher in &vouchers {
            let stored = store.find_voucher(voucher.id).await.unwrap().unwrap();
            assert_eq!(stored.status, VoucherStatus::Active);
        }
    }

    #[tokio::test]
    async fn test_list_deals_only_shows_deals_on_sale() {
        let store = seeded_store();
        let user = customer(&store, None);
        let bistro = active_deal(&store, |d| d.title = "Bistro brunch".to_string()).await;
        let cheap = active_deal(&store, |d| {
            d.title = "Coffee and cake".to_string();
            d.original_price = Decimal::new(10000, 2);
            d.deal_price = Decimal::new(8000, 2);
        })
        .await;
        active_deal(&store, |d| d.status = DealStatus::Paused).await;
        active_deal(&store, |d| d.start_date = Utc::now() + Duration::days(2)).await;
        store
            .insert_purchase(purchase_of(&bistro, user.id, &["S1", "S2"]))
            .await
            .unwrap();

        let now = Utc::now();
        let all = store
            .list_deals(DealFilter::on_sale(now, PageRequest::default()))
            .await
            .unwrap();
        assert_eq!(all.pagination.total, 2);

        let mut filter = DealFilter::on_sale(now, PageRequest::default());
        filter.city = Some("cape town".to_string());
        filter.search = Some("BRUNCH".to_string());
        let found = store.list_deals(filter).await.unwrap();
        assert_eq!(found.items.len(), 1);
        assert_eq!(found.items[0].deal.id, bistro.id);
        assert_eq!(found.items[0].vouchers_sold, 2);
        assert_eq!(found.items[0].venue_name, "The Corner Bistro");

        let mut filter = DealFilter::on_sale(now, PageRequest::default());
        filter.min_savings = Some(Decimal::from(40));
        let big_savings = store.list_deals(filter).await.unwrap();
        assert!(big_savings.items.iter().all(|l| l.deal.id != cheap.id));

        let mut filter = DealFilter::on_sale(now, PageRequest::default());
        filter.max_price = Some(Decimal::from(100));
        let affordable = store.list_deals(filter).await.unwrap();
        assert_eq!(affordable.items.len(), 1);
        assert_eq!(affordable.items[0].deal.id, cheap.id);

        let mut filter = DealFilter::on_sale(now, PageRequest::default());
        filter.city = Some("Durban".to_string());
        assert_eq!(store.list_deals(filter).await.unwrap().pagination.total, 0);
    }
}
