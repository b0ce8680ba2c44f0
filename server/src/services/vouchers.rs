//! Voucher purchase, redemption and expiry.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::checks;
use super::codes::{generate_voucher_code, normalize_code, QrPayload, QrSigner};
use super::error::{RuleViolation, ServiceError, ServiceResult};
use super::notifications::Notifier;
use super::{authorize_venue, rate, Actor};
use crate::models::{Deal, Payment, PaymentStatus, Voucher, VoucherStatus};
use crate::store::{
    NewPayment, NewPurchase, NewVoucher, Page, PageRequest, PurchaseOutcome, StatsScope, Store,
    StoreError, VoucherFilter, VoucherOwner, VoucherStats,
};

pub const VOUCHER_VALIDITY_DAYS: i64 = 90;
pub const MAX_QUANTITY: i64 = 10;
pub const DEFAULT_EXPIRING_WINDOW_DAYS: i64 = 7;
pub const DEFAULT_ANALYTICS_PERIOD_DAYS: i64 = 30;
/// Fresh codes are drawn this many times before a purchase gives up.
const CODE_ATTEMPTS: u32 = 3;

/// Produces a voucher code for the given purchase time.
pub type CodeSource = Arc<dyn Fn(DateTime<Utc>) -> String + Send + Sync>;

/// How the purchase is paid for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentMode {
    /// Settled immediately; the payment is recorded as completed.
    Direct,
    /// Settled later by the gateway webhook; the payment starts pending.
    Gateway { payment_method: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Availability {
    pub deal_id: Uuid,
    pub quantity: i64,
    pub available: bool,
    pub vouchers_remaining: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseReceipt {
    pub vouchers: Vec<Voucher>,
    pub payment_id: Uuid,
    pub total_amount: Decimal,
    #[serde(skip)]
    pub payment: Payment,
}

#[derive(Debug, Clone, Serialize)]
pub struct CustomerInfo {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DealInfo {
    pub title: String,
    pub terms_and_conditions: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Redemption {
    pub voucher: Voucher,
    pub customer_info: CustomerInfo,
    pub deal_info: DealInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoucherQr {
    pub voucher_code: String,
    pub qr_code_data: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoucherAnalytics {
    pub period_days: i64,
    #[serde(flatten)]
    pub stats: VoucherStats,
    pub redemption_rate: f64,
    pub expiry_rate: f64,
}

#[derive(Clone)]
pub struct VoucherService {
    store: Arc<dyn Store>,
    signer: QrSigner,
    notifier: Notifier,
    currency: String,
    codes: CodeSource,
}

impl VoucherService {
    pub fn new(
        store: Arc<dyn Store>,
        signer: QrSigner,
        notifier: Notifier,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            store,
            signer,
            notifier,
            currency: currency.into(),
            codes: Arc::new(generate_voucher_code),
        }
    }

    /// Replaces the voucher code generator.
    pub fn with_code_source(mut self, codes: CodeSource) -> Self {
        self.codes = codes;
        self
    }

    async fn load_deal(&self, deal_id: Uuid) -> ServiceResult<Deal> {
        self.store
            .find_deal(deal_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Deal"))
    }

    async fn availability_at(
        &self,
        deal: &Deal,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> ServiceResult<i64> {
        let issued = self.store.count_vouchers_for_deal(deal.id).await?;
        Ok(checks::check_availability(deal, issued, quantity, now)?)
    }

    /// Whether `quantity` vouchers could be bought right now. Broken rules
    /// come back as `available: false` with the reason, not as errors.
    pub async fn check_availability(
        &self,
        deal_id: Uuid,
        quantity: i64,
    ) -> ServiceResult<Availability> {
        validate_quantity(quantity)?;
        let deal = self.load_deal(deal_id).await?;
        let issued = self.store.count_vouchers_for_deal(deal.id).await?;

        let (available, vouchers_remaining, reason) =
            match checks::check_availability(&deal, issued, quantity, Utc::now()) {
                Ok(remaining) => (true, remaining, None),
                Err(rule) => (
                    false,
                    (i64::from(deal.max_vouchers) - issued).max(0),
                    Some(rule.to_string()),
                ),
            };
        Ok(Availability {
            deal_id,
            quantity,
            available,
            vouchers_remaining,
            reason,
        })
    }

    pub async fn check_purchase_limit(
        &self,
        user_id: Uuid,
        deal: &Deal,
        quantity: i64,
    ) -> ServiceResult<()> {
        let held = self
            .store
            .count_vouchers_for_user_and_deal(user_id, deal.id)
            .await?;
        Ok(checks::check_purchase_limit(deal, held, quantity)?)
    }

    /// Issues `quantity` vouchers and the payment covering them.
    ///
    /// The checks run up front for precise errors and are repeated by the
    /// store under the deal lock, so concurrent buyers cannot oversell.
    /// A code that collides with an existing voucher is redrawn.
    pub async fn purchase(
        &self,
        user_id: Uuid,
        deal_id: Uuid,
        quantity: i64,
        mode: PaymentMode,
    ) -> ServiceResult<PurchaseReceipt> {
        validate_quantity(quantity)?;

        let now = Utc::now();
        let deal = self.load_deal(deal_id).await?;
        self.availability_at(&deal, quantity, now).await?;
        self.check_purchase_limit(user_id, &deal, quantity).await?;

        let user = self
            .store
            .find_user(user_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("User"))?;
        if deal.requires_age_verification {
            checks::check_age(user.date_of_birth, now)?;
        }

        let mut attempt = 1;
        let outcome = loop {
            let purchase = self.new_purchase(user_id, &deal, quantity, &mode, now)?;
            match self.store.insert_purchase(purchase).await {
                Err(StoreError::Duplicate(detail)) if attempt < CODE_ATTEMPTS => {
                    warn!(deal_id = %deal.id, attempt, %detail, "Voucher code collision, retrying");
                    attempt += 1;
                }
                result => break result?,
            }
        };

        let (vouchers, payment) = match outcome {
            PurchaseOutcome::Committed { vouchers, payment } => (vouchers, payment),
            PurchaseOutcome::DealInactive => return Err(RuleViolation::DealNotActive.into()),
            PurchaseOutcome::DealUnavailable => {
                return Err(RuleViolation::DealNotAvailable.into())
            }
            PurchaseOutcome::SoldOut { remaining } => {
                return Err(RuleViolation::InsufficientVouchers { remaining }.into())
            }
            PurchaseOutcome::LimitReached { limit, current } => {
                return Err(RuleViolation::PurchaseLimitExceeded { limit, current }.into())
            }
        };

        info!(
            user_id = %user_id,
            deal_id = %deal.id,
            payment_id = %payment.id,
            quantity,
            status = %payment.status,
            "Vouchers purchased"
        );

        if payment.status == PaymentStatus::Completed {
            self.notifier
                .purchase_completed(&user, &deal, &payment, &vouchers)
                .await;
        }

        Ok(PurchaseReceipt {
            payment_id: payment.id,
            total_amount: payment.amount,
            vouchers,
            payment,
        })
    }

    fn new_purchase(
        &self,
        user_id: Uuid,
        deal: &Deal,
        quantity: i64,
        mode: &PaymentMode,
        now: DateTime<Utc>,
    ) -> ServiceResult<NewPurchase> {
        let vouchers = self.new_vouchers(deal, quantity, now)?;
        let total_amount = deal.deal_price * Decimal::from(quantity);
        let payment = match mode {
            PaymentMode::Direct => NewPayment {
                id: Uuid::new_v4(),
                amount: total_amount,
                currency: self.currency.clone(),
                payment_method: "direct".to_string(),
                external_payment_id: None,
                status: PaymentStatus::Completed,
                processed_at: Some(now),
            },
            PaymentMode::Gateway { payment_method } => NewPayment {
                id: Uuid::new_v4(),
                amount: total_amount,
                currency: self.currency.clone(),
                payment_method: payment_method.clone(),
                external_payment_id: Some(format!(
                    "PAY-{}",
                    Uuid::new_v4().simple().to_string().to_uppercase()
                )),
                status: PaymentStatus::Pending,
                processed_at: None,
            },
        };

        Ok(NewPurchase {
            user_id,
            deal_id: deal.id,
            venue_id: deal.venue_id,
            unit_price: deal.deal_price,
            vouchers,
            payment,
        })
    }

    fn new_vouchers(
        &self,
        deal: &Deal,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> ServiceResult<Vec<NewVoucher>> {
        let expires_at = now + Duration::days(VOUCHER_VALIDITY_DAYS);
        let mut codes = HashSet::new();
        let mut vouchers = Vec::new();

        while (vouchers.len() as i64) < quantity {
            let voucher_code = (self.codes)(now);
            if !codes.insert(voucher_code.clone()) {
                continue;
            }
            let id = Uuid::new_v4();
            let qr_code_data = self
                .signer
                .sign(&QrPayload {
                    voucher_id: id,
                    deal_id: deal.id,
                    venue_id: deal.venue_id,
                    voucher_code: voucher_code.clone(),
                })
                .map_err(|e| ServiceError::Validation(format!("Unable to encode QR data: {e}")))?;
            vouchers.push(NewVoucher {
                id,
                voucher_code,
                qr_code_data,
                expires_at,
            });
        }
        Ok(vouchers)
    }

    /// Redeems the voucher with the code typed in by venue staff.
    pub async fn redeem(&self, voucher_code: &str, staff: &Actor) -> ServiceResult<Redemption> {
        let code = normalize_code(voucher_code);
        if code.is_empty() {
            return Err(ServiceError::Validation("Voucher code is required".to_string()));
        }
        let voucher = self
            .store
            .find_voucher_by_code(&code)
            .await?
            .ok_or_else(invalid_code)?;
        self.redeem_voucher(voucher, staff).await
    }

    /// Redeems the voucher named by a scanned QR payload.
    pub async fn redeem_qr(&self, qr_code_data: &str, staff: &Actor) -> ServiceResult<Redemption> {
        let payload = self.signer.verify(qr_code_data).ok_or_else(invalid_code)?;
        let voucher = self
            .store
            .find_voucher_by_code(&payload.voucher_code)
            .await?
            .filter(|v| v.id == payload.voucher_id)
            .ok_or_else(invalid_code)?;
        self.redeem_voucher(voucher, staff).await
    }

    async fn redeem_voucher(&self, voucher: Voucher, staff: &Actor) -> ServiceResult<Redemption> {
        authorize_venue(self.store.as_ref(), voucher.venue_id, staff).await?;
        if voucher.status != VoucherStatus::Active {
            return Err(RuleViolation::VoucherNotActive {
                status: voucher.status,
            }
            .into());
        }

        let redeemed_by = staff.user_id;
        let now = Utc::now();
        if voucher.is_past_expiry(now) {
            let expired = self
                .store
                .update_voucher_status(
                    voucher.id,
                    VoucherStatus::Active,
                    VoucherStatus::Expired,
                    None,
                    now,
                )
                .await?;
            if expired.is_none() {
                self.report_current_status(voucher.id, VoucherStatus::Expired)
                    .await?;
            }
            info!(voucher_id = %voucher.id, "Voucher expired on redemption attempt");
            return Err(RuleViolation::VoucherExpired.into());
        }

        let redeemed = match self
            .store
            .update_voucher_status(
                voucher.id,
                VoucherStatus::Active,
                VoucherStatus::Redeemed,
                Some(redeemed_by),
                now,
            )
            .await?
        {
            Some(redeemed) => redeemed,
            None => {
                self.report_current_status(voucher.id, VoucherStatus::Redeemed)
                    .await?;
                return Err(RuleViolation::VoucherNotActive {
                    status: VoucherStatus::Redeemed,
                }
                .into());
            }
        };

        info!(
            voucher_id = %redeemed.id,
            redeemed_by = %redeemed_by,
            "Voucher redeemed"
        );

        let customer = self
            .store
            .find_user(redeemed.user_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("User"))?;
        let deal = self.load_deal(redeemed.deal_id).await?;

        Ok(Redemption {
            customer_info: CustomerInfo {
                name: customer.full_name(),
                email: customer.email,
            },
            deal_info: DealInfo {
                title: deal.title,
                terms_and_conditions: deal.terms_and_conditions,
            },
            voucher: redeemed,
        })
    }

    /// Called after losing a status swap. Fails with whatever status won,
    /// unless it is the one this caller was trying to reach.
    async fn report_current_status(&self, id: Uuid, wanted: VoucherStatus) -> ServiceResult<()> {
        let current = self
            .store
            .find_voucher(id)
            .await?
            .ok_or_else(invalid_code)?;
        if current.status == wanted {
            return Ok(());
        }
        Err(RuleViolation::VoucherNotActive {
            status: current.status,
        }
        .into())
    }

    pub async fn expire_vouchers(&self) -> ServiceResult<Vec<Voucher>> {
        let expired = self.store.sweep_expired_vouchers(Utc::now()).await?;
        info!(count = expired.len(), "Expired vouchers");
        Ok(expired)
    }

    pub async fn list_user_vouchers(
        &self,
        user_id: Uuid,
        status: Option<VoucherStatus>,
        page: PageRequest,
    ) -> ServiceResult<Page<Voucher>> {
        Ok(self
            .store
            .list_vouchers(VoucherFilter {
                owner: VoucherOwner::User(user_id),
                status,
                page,
            })
            .await?)
    }

    pub async fn list_venue_vouchers(
        &self,
        venue_id: Uuid,
        actor: &Actor,
        status: Option<VoucherStatus>,
        page: PageRequest,
    ) -> ServiceResult<Page<Voucher>> {
        authorize_venue(self.store.as_ref(), venue_id, actor).await?;
        Ok(self
            .store
            .list_vouchers(VoucherFilter {
                owner: VoucherOwner::Venue(venue_id),
                status,
                page,
            })
            .await?)
    }

    pub async fn get_voucher(&self, id: Uuid, actor: &Actor) -> ServiceResult<Voucher> {
        self.store
            .find_voucher(id)
            .await?
            .filter(|v| actor.can_view(v.user_id))
            .ok_or_else(|| ServiceError::not_found("Voucher"))
    }

    pub async fn get_voucher_qr(&self, id: Uuid, actor: &Actor) -> ServiceResult<VoucherQr> {
        let voucher = self.get_voucher(id, actor).await?;
        if voucher.status != VoucherStatus::Active {
            return Err(RuleViolation::QrUnavailable.into());
        }
        Ok(VoucherQr {
            voucher_code: voucher.voucher_code,
            qr_code_data: voucher.qr_code_data,
        })
    }

    pub async fn expiring_vouchers(&self, days_ahead: i64) -> ServiceResult<Vec<Voucher>> {
        if !(1..=365).contains(&days_ahead) {
            return Err(ServiceError::Validation(
                "days must be between 1 and 365".to_string(),
            ));
        }
        let now = Utc::now();
        Ok(self
            .store
            .list_expiring_vouchers(now, now + Duration::days(days_ahead))
            .await?)
    }

    pub async fn analytics(
        &self,
        venue_id: Option<Uuid>,
        period_days: i64,
    ) -> ServiceResult<VoucherAnalytics> {
        if !(1..=365).contains(&period_days) {
            return Err(ServiceError::Validation(
                "period must be between 1 and 365 days".to_string(),
            ));
        }
        let since = Utc::now() - Duration::days(period_days);
        let stats = self
            .store
            .voucher_stats(StatsScope::venue(venue_id), since)
            .await?;
        if stats.total_vouchers == 0 {
            warn!(?venue_id, period_days, "No vouchers in analytics period");
        }

        Ok(VoucherAnalytics {
            period_days,
            redemption_rate: rate(stats.redeemed_vouchers, stats.total_vouchers),
            expiry_rate: rate(stats.expired_vouchers, stats.total_vouchers),
            stats,
        })
    }

    pub async fn venue_analytics(
        &self,
        venue_id: Uuid,
        actor: &Actor,
        period_days: i64,
    ) -> ServiceResult<VoucherAnalytics> {
        authorize_venue(self.store.as_ref(), venue_id, actor).await?;
        self.analytics(Some(venue_id), period_days).await
    }
}

fn validate_quantity(quantity: i64) -> ServiceResult<()> {
    if !(1..=MAX_QUANTITY).contains(&quantity) {
        return Err(ServiceError::Validation(format!(
            "Quantity must be between 1 and {MAX_QUANTITY}"
        )));
    }
    Ok(())
}

fn invalid_code() -> ServiceError {
    ServiceError::NotFound("Invalid voucher code".to_string())
}
