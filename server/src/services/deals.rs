use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::error::{RuleViolation, ServiceError, ServiceResult};
use super::{authorize_venue, rate, Actor};
use crate::models::{Deal, DealChanges, DealStatus, NewDeal};
use crate::store::{
    DealFilter, DealListing, DealOrder, Page, PageRequest, StatsScope, Store, VoucherStats,
};

pub const DEFAULT_MAX_VOUCHERS: i32 = 1000;
pub const DEFAULT_MAX_PER_CUSTOMER: i32 = 10;
pub const DEFAULT_TRENDING_LIMIT: usize = 10;
pub const DEFAULT_EXPIRING_DEALS_DAYS: i64 = 7;
const MAX_TITLE_LEN: usize = 255;
/// How many best sellers are considered before dropping unsold deals.
const TRENDING_POOL: u32 = 50;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDeal {
    pub venue_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub terms_and_conditions: String,
    pub original_price: Decimal,
    pub deal_price: Decimal,
    pub max_vouchers: Option<i32>,
    pub max_per_customer: Option<i32>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub requires_age_verification: bool,
}

impl CreateDeal {
    fn validate(self, now: DateTime<Utc>) -> ServiceResult<NewDeal> {
        let changes = validate_changes(DealChanges {
            title: self.title,
            description: self.description,
            terms_and_conditions: self.terms_and_conditions,
            original_price: self.original_price,
            deal_price: self.deal_price,
            max_vouchers: self.max_vouchers.unwrap_or(DEFAULT_MAX_VOUCHERS),
            max_per_customer: self.max_per_customer.unwrap_or(DEFAULT_MAX_PER_CUSTOMER),
            start_date: self.start_date,
            end_date: self.end_date,
            requires_age_verification: self.requires_age_verification,
        })?;
        if changes.start_date < now {
            return Err(invalid("Start date cannot be in the past"));
        }

        Ok(NewDeal {
            id: Uuid::new_v4(),
            venue_id: self.venue_id,
            title: changes.title,
            description: changes.description,
            terms_and_conditions: changes.terms_and_conditions,
            original_price: changes.original_price,
            deal_price: changes.deal_price,
            max_vouchers: changes.max_vouchers,
            max_per_customer: changes.max_per_customer,
            start_date: changes.start_date,
            end_date: changes.end_date,
            requires_age_verification: changes.requires_age_verification,
        })
    }
}

/// Partial edit of a deal. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateDeal {
    pub title: Option<String>,
    pub description: Option<String>,
    pub terms_and_conditions: Option<String>,
    pub original_price: Option<Decimal>,
    pub deal_price: Option<Decimal>,
    pub max_vouchers: Option<i32>,
    pub max_per_customer: Option<i32>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub requires_age_verification: Option<bool>,
}

impl UpdateDeal {
    fn apply(self, deal: &Deal) -> DealChanges {
        let current = deal.changes();
        DealChanges {
            title: self.title.unwrap_or(current.title),
            description: self.description.or(current.description),
            terms_and_conditions: self
                .terms_and_conditions
                .unwrap_or(current.terms_and_conditions),
            original_price: self.original_price.unwrap_or(current.original_price),
            deal_price: self.deal_price.unwrap_or(current.deal_price),
            max_vouchers: self.max_vouchers.unwrap_or(current.max_vouchers),
            max_per_customer: self.max_per_customer.unwrap_or(current.max_per_customer),
            start_date: self.start_date.unwrap_or(current.start_date),
            end_date: self.end_date.unwrap_or(current.end_date),
            requires_age_verification: self
                .requires_age_verification
                .unwrap_or(current.requires_age_verification),
        }
    }
}

/// Trims text fields, rounds prices and checks the rules every deal obeys.
fn validate_changes(changes: DealChanges) -> ServiceResult<DealChanges> {
    let title = changes.title.trim().to_string();
    if title.is_empty() || title.len() > MAX_TITLE_LEN {
        return Err(invalid(format!(
            "Title is required and must be at most {MAX_TITLE_LEN} characters"
        )));
    }
    let terms = changes.terms_and_conditions.trim().to_string();
    if terms.is_empty() {
        return Err(invalid("Terms and conditions are required"));
    }
    if changes.original_price <= Decimal::ZERO || changes.deal_price <= Decimal::ZERO {
        return Err(invalid("Prices must be positive"));
    }
    if changes.deal_price >= changes.original_price {
        return Err(invalid("Deal price must be less than original price"));
    }
    if changes.start_date >= changes.end_date {
        return Err(invalid("End date must be after start date"));
    }
    if changes.max_vouchers < 1 || changes.max_per_customer < 1 {
        return Err(invalid("Voucher limits must be at least 1"));
    }

    Ok(DealChanges {
        title,
        description: changes
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty()),
        terms_and_conditions: terms,
        original_price: changes.original_price.round_dp(2),
        deal_price: changes.deal_price.round_dp(2),
        ..changes
    })
}

fn invalid(message: impl Into<String>) -> ServiceError {
    ServiceError::Validation(message.into())
}

/// Query string of the public deal listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DealQuery {
    pub city: Option<String>,
    pub venue_id: Option<Uuid>,
    #[serde(alias = "q")]
    pub search: Option<String>,
    pub min_savings: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl DealQuery {
    fn filter(self, now: DateTime<Utc>) -> DealFilter {
        let mut filter = DealFilter::on_sale(now, PageRequest::new(self.page, self.limit));
        filter.city = self.city.map(|c| c.trim().to_string()).filter(|c| !c.is_empty());
        filter.venue_id = self.venue_id;
        filter.search = self
            .search
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        filter.min_savings = self.min_savings;
        filter.max_price = self.max_price;
        filter
    }
}

/// A deal together with its sales so far.
#[derive(Debug, Clone, Serialize)]
pub struct DealView {
    #[serde(flatten)]
    pub deal: Deal,
    pub vouchers_sold: i64,
    pub vouchers_remaining: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DealSummary {
    pub id: Uuid,
    pub title: String,
    pub venue_name: String,
    pub status: DealStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct DealAnalytics {
    pub deal_info: DealSummary,
    pub analytics: VoucherStats,
    pub redemption_rate: f64,
    pub period_days: i64,
}

#[derive(Clone)]
pub struct DealService {
    store: Arc<dyn Store>,
}

impl DealService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn create_deal(&self, payload: CreateDeal, actor: &Actor) -> ServiceResult<Deal> {
        let new_deal = payload.validate(Utc::now())?;
        authorize_venue(self.store.as_ref(), new_deal.venue_id, actor).await?;

        let deal = self.store.insert_deal(new_deal).await?;
        info!(deal_id = %deal.id, venue_id = %deal.venue_id, "Deal created");
        Ok(deal)
    }

    async fn load(&self, id: Uuid) -> ServiceResult<Deal> {
        self.store
            .find_deal(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Deal"))
    }

    /// Loads a deal the actor's venue may change.
    async fn load_managed(&self, id: Uuid, actor: &Actor) -> ServiceResult<Deal> {
        let deal = self.load(id).await?;
        authorize_venue(self.store.as_ref(), deal.venue_id, actor).await?;
        Ok(deal)
    }

    async fn with_sales(&self, deal: Deal) -> ServiceResult<DealView> {
        let vouchers_sold = self.store.count_vouchers_for_deal(deal.id).await?;
        Ok(DealView {
            vouchers_remaining: (i64::from(deal.max_vouchers) - vouchers_sold).max(0),
            vouchers_sold,
            deal,
        })
    }

    pub async fn get_deal(&self, id: Uuid) -> ServiceResult<DealView> {
        let deal = self.load(id).await?;
        self.with_sales(deal).await
    }

    pub async fn list_venue_deals(
        &self,
        venue_id: Uuid,
        status: Option<DealStatus>,
    ) -> ServiceResult<Vec<DealView>> {
        let deals = self.store.list_venue_deals(venue_id, status).await?;
        let mut views = Vec::with_capacity(deals.len());
        for deal in deals {
            views.push(self.with_sales(deal).await?);
        }
        Ok(views)
    }

    /// Deals on sale right now, newest first.
    pub async fn list_deals(&self, query: DealQuery) -> ServiceResult<Page<DealListing>> {
        Ok(self.store.list_deals(query.filter(Utc::now())).await?)
    }

    pub async fn search_deals(&self, query: DealQuery) -> ServiceResult<Page<DealListing>> {
        if query.search.as_deref().map_or(true, |s| s.trim().is_empty()) {
            return Err(invalid("Search query is required"));
        }
        self.list_deals(query).await
    }

    /// Best sellers among the deals on sale. Deals with no sales are left out.
    pub async fn trending_deals(&self, limit: usize) -> ServiceResult<Vec<DealListing>> {
        if !(1..=TRENDING_POOL as usize).contains(&limit) {
            return Err(invalid(format!("limit must be between 1 and {TRENDING_POOL}")));
        }
        let mut filter = DealFilter::on_sale(Utc::now(), PageRequest::new(Some(1), Some(TRENDING_POOL)));
        filter.order = DealOrder::BestSelling;

        let page = self.store.list_deals(filter).await?;
        Ok(page
            .items
            .into_iter()
            .filter(|listing| listing.vouchers_sold > 0)
            .take(limit)
            .collect())
    }

    /// Deals on sale whose sale window closes within `days_ahead` days, soonest first.
    pub async fn expiring_deals(&self, days_ahead: i64) -> ServiceResult<Vec<DealListing>> {
        if !(1..=90).contains(&days_ahead) {
            return Err(invalid("days must be between 1 and 90"));
        }
        let now = Utc::now();
        let mut filter = DealFilter::on_sale(now, PageRequest::new(Some(1), Some(PageRequest::MAX_LIMIT)));
        filter.ends_before = Some(now + Duration::days(days_ahead));
        filter.order = DealOrder::EndingSoon;
        Ok(self.store.list_deals(filter).await?.items)
    }

    pub async fn update_deal(
        &self,
        id: Uuid,
        actor: &Actor,
        update: UpdateDeal,
    ) -> ServiceResult<Deal> {
        let deal = self.load_managed(id, actor).await?;
        if deal.status == DealStatus::Ended {
            return Err(RuleViolation::DealNotEditable.into());
        }

        let start_changed = update.start_date.is_some_and(|start| start != deal.start_date);
        let changes = validate_changes(update.apply(&deal))?;
        if start_changed && changes.start_date < Utc::now() {
            return Err(invalid("Start date cannot be in the past"));
        }
        let sold = self.store.count_vouchers_for_deal(deal.id).await?;
        if i64::from(changes.max_vouchers) < sold {
            return Err(invalid(format!(
                "Voucher limit cannot be below the {sold} vouchers already sold"
            )));
        }

        let updated = self
            .store
            .update_deal(deal.id, deal.status, changes)
            .await?
            .ok_or_else(|| {
                ServiceError::Conflict("Deal status changed by another request".to_string())
            })?;
        info!(deal_id = %updated.id, "Deal updated");
        Ok(updated)
    }

    pub async fn deal_analytics(
        &self,
        id: Uuid,
        actor: &Actor,
        period_days: i64,
    ) -> ServiceResult<DealAnalytics> {
        if !(1..=365).contains(&period_days) {
            return Err(invalid("period must be between 1 and 365 days"));
        }
        let deal = self.load(id).await?;
        let venue = authorize_venue(self.store.as_ref(), deal.venue_id, actor).await?;

        let since = Utc::now() - Duration::days(period_days);
        let analytics = self
            .store
            .voucher_stats(StatsScope::Deal(deal.id), since)
            .await?;

        Ok(DealAnalytics {
            deal_info: DealSummary {
                id: deal.id,
                title: deal.title,
                venue_name: venue.name,
                status: deal.status,
            },
            redemption_rate: rate(analytics.redeemed_vouchers, analytics.total_vouchers),
            analytics,
            period_days,
        })
    }

    pub async fn activate_deal(&self, id: Uuid, actor: &Actor) -> ServiceResult<Deal> {
        let deal = self.load_managed(id, actor).await?;
        if deal.status != DealStatus::Draft {
            return Err(RuleViolation::DealNotDraft.into());
        }
        if deal.end_date <= Utc::now() {
            return Err(RuleViolation::DealAlreadyOver.into());
        }
        self.transition(deal, DealStatus::Active).await
    }

    pub async fn pause_deal(&self, id: Uuid, actor: &Actor) -> ServiceResult<Deal> {
        let deal = self.load_managed(id, actor).await?;
        if deal.status != DealStatus::Active {
            return Err(RuleViolation::DealNotPausable.into());
        }
        self.transition(deal, DealStatus::Paused).await
    }

    /// Ends the deal for good. The row stays so issued vouchers keep their deal.
    pub async fn end_deal(&self, id: Uuid, actor: &Actor) -> ServiceResult<Deal> {
        let deal = self.load_managed(id, actor).await?;
        if !matches!(deal.status, DealStatus::Active | DealStatus::Paused) {
            return Err(RuleViolation::DealNotEndable.into());
        }
        self.transition(deal, DealStatus::Ended).await
    }

    async fn transition(&self, deal: Deal, to: DealStatus) -> ServiceResult<Deal> {
        let updated = self
            .store
            .update_deal_status(deal.id, deal.status, to)
            .await?
            .ok_or_else(|| {
                ServiceError::Conflict("Deal status changed by another request".to_string())
            })?;
        info!(deal_id = %updated.id, from = %deal.status, to = %updated.status, "Deal status changed");
        Ok(updated)
    }
}
