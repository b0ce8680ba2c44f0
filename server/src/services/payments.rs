//! Gateway checkout, webhook settlement, refunds and retries.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::codes::HmacSigner;
use super::error::{RuleViolation, ServiceError, ServiceResult};
use super::notifications::Notifier;
use super::vouchers::{PaymentMode, VoucherService};
use super::{authorize_venue, rate, Actor};
use crate::models::{Payment, PaymentStatus, Voucher};
use crate::store::{
    DailyRevenue, Page, PageRequest, PaymentFilter, PaymentStats, Store, StoreError,
};

pub const SIGNATURE_HEADER: &str = "x-gateway-signature";
pub const DEFAULT_FAILED_WINDOW_HOURS: i64 = 24;
pub const DEFAULT_STALE_PENDING_HOURS: i64 = 2;

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub gateway_url: String,
    pub merchant_id: String,
    pub frontend_url: String,
    pub api_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Checkout {
    pub payment_id: Uuid,
    pub external_payment_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub redirect_url: String,
    pub vouchers: Vec<Voucher>,
}

/// Body of a gateway status notification.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayNotification {
    pub payment_id: String,
    pub payment_status: String,
    pub amount_gross: Option<Decimal>,
    pub amount_fee: Option<Decimal>,
    pub amount_net: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentAnalytics {
    pub period_days: i64,
    #[serde(flatten)]
    pub stats: PaymentStats,
    pub success_rate: f64,
    pub daily_revenue: Vec<DailyRevenue>,
}

fn gateway_status(raw: &str) -> PaymentStatus {
    match raw.trim().to_ascii_uppercase().as_str() {
        "COMPLETE" => PaymentStatus::Completed,
        "FAILED" | "CANCELLED" => PaymentStatus::Failed,
        _ => PaymentStatus::Pending,
    }
}

#[derive(Clone)]
pub struct PaymentService {
    store: Arc<dyn Store>,
    vouchers: VoucherService,
    notifier: Notifier,
    webhook_signer: HmacSigner,
    gateway: GatewaySettings,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn Store>,
        vouchers: VoucherService,
        notifier: Notifier,
        webhook_signer: HmacSigner,
        gateway: GatewaySettings,
    ) -> Self {
        Self {
            store,
            vouchers,
            notifier,
            webhook_signer,
            gateway,
        }
    }

    /// Reserves the vouchers behind a pending payment and returns the
    /// gateway URL the customer should be sent to.
    pub async fn checkout(
        &self,
        user_id: Uuid,
        deal_id: Uuid,
        quantity: i64,
        payment_method: Option<String>,
    ) -> ServiceResult<Checkout> {
        let receipt = self
            .vouchers
            .purchase(
                user_id,
                deal_id,
                quantity,
                PaymentMode::Gateway {
                    payment_method: payment_method.unwrap_or_else(|| "card".to_string()),
                },
            )
            .await?;

        let payment = receipt.payment;
        let external_payment_id = payment.external_payment_id.clone().unwrap_or_default();
        let deal = self
            .store
            .find_deal(deal_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Deal"))?;

        let redirect_url = self.redirect_url(&payment, &external_payment_id, &deal.title);
        info!(payment_id = %payment.id, %external_payment_id, "Checkout started");

        Ok(Checkout {
            payment_id: payment.id,
            external_payment_id,
            amount: payment.amount,
            currency: payment.currency,
            redirect_url,
            vouchers: receipt.vouchers,
        })
    }

    fn redirect_url(&self, payment: &Payment, reference: &str, item_name: &str) -> String {
        let frontend = self.gateway.frontend_url.trim_end_matches('/');
        let api = self.gateway.api_url.trim_end_matches('/');
        let params = [
            ("merchant_id", self.gateway.merchant_id.clone()),
            ("amount", format!("{:.2}", payment.amount.round_dp(2))),
            ("item_name", item_name.to_string()),
            (
                "return_url",
                format!("{frontend}/payment/success?payment={}", payment.id),
            ),
            (
                "cancel_url",
                format!("{frontend}/payment/cancelled?payment={}", payment.id),
            ),
            ("notify_url", format!("{api}/api/payments/webhook")),
            ("m_payment_id", reference.to_string()),
        ];

        let query: Vec<String> = params
            .iter()
            .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
            .collect();
        format!("{}?{}", self.gateway.gateway_url, query.join("&"))
    }

    /// Applies a signed gateway notification. Replays and unknown statuses
    /// leave the payment as it is.
    pub async fn process_webhook(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> ServiceResult<Payment> {
        let signature = signature.unwrap_or_default();
        if !self.webhook_signer.verify_hex(body, signature) {
            warn!("Rejected webhook with invalid signature");
            return Err(ServiceError::Unauthorized(
                "Invalid webhook signature".to_string(),
            ));
        }

        let notification: GatewayNotification = serde_json::from_slice(body)
            .map_err(|e| ServiceError::Validation(format!("Malformed webhook payload: {e}")))?;

        let payment = self
            .store
            .find_payment_by_external_id(&notification.payment_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Payment"))?;

        let target = gateway_status(&notification.payment_status);
        if target == PaymentStatus::Pending || payment.status != PaymentStatus::Pending {
            info!(
                payment_id = %payment.id,
                current = %payment.status,
                gateway_status = %notification.payment_status,
                "Webhook left payment unchanged"
            );
            return Ok(payment);
        }

        let metadata = json!({
            "gateway_status": notification.payment_status,
            "amount_gross": notification.amount_gross,
            "amount_fee": notification.amount_fee,
            "amount_net": notification.amount_net,
        });

        let Some(updated) = self
            .store
            .transition_payment(payment.id, PaymentStatus::Pending, target, Some(metadata), Utc::now())
            .await?
        else {
            // Another delivery of the same notification won the race.
            return self
                .store
                .find_payment(payment.id)
                .await?
                .ok_or_else(|| ServiceError::not_found("Payment"));
        };

        info!(payment_id = %updated.id, status = %updated.status, "Payment settled by gateway");

        if updated.status == PaymentStatus::Completed {
            self.notify_completed(&updated).await;
        }
        Ok(updated)
    }

    /// Sends the purchase emails. The payment is already settled, so lookup
    /// failures are logged and never reach the gateway.
    async fn notify_completed(&self, payment: &Payment) {
        let lookups = async {
            let user = self.store.find_user(payment.user_id).await?;
            let deal = self.store.find_deal(payment.deal_id).await?;
            let vouchers = self.store.find_vouchers(&payment.voucher_ids).await?;
            Ok::<_, StoreError>((user, deal, vouchers))
        };

        match lookups.await {
            Ok((Some(user), Some(deal), vouchers)) => {
                self.notifier
                    .purchase_completed(&user, &deal, payment, &vouchers)
                    .await;
            }
            Ok(_) => {
                warn!(payment_id = %payment.id, "Skipping purchase emails, user or deal missing");
            }
            Err(e) => {
                warn!(payment_id = %payment.id, error = %e, "Skipping purchase emails, lookup failed");
            }
        }
    }

    pub async fn get_payment(&self, id: Uuid, actor: &Actor) -> ServiceResult<Payment> {
        self.store
            .find_payment(id)
            .await?
            .filter(|p| actor.can_view(p.user_id))
            .ok_or_else(|| ServiceError::not_found("Payment"))
    }

    pub async fn list_user_payments(
        &self,
        user_id: Uuid,
        status: Option<PaymentStatus>,
        page: PageRequest,
    ) -> ServiceResult<Page<Payment>> {
        Ok(self
            .store
            .list_payments(PaymentFilter {
                user_id: Some(user_id),
                status,
                page,
                ..Default::default()
            })
            .await?)
    }

    pub async fn list_venue_payments(
        &self,
        venue_id: Uuid,
        actor: &Actor,
        status: Option<PaymentStatus>,
        page: PageRequest,
    ) -> ServiceResult<Page<Payment>> {
        authorize_venue(self.store.as_ref(), venue_id, actor).await?;
        Ok(self
            .store
            .list_payments(PaymentFilter {
                venue_id: Some(venue_id),
                status,
                page,
                ..Default::default()
            })
            .await?)
    }

    /// Payment counts, revenue and per-day revenue over the last
    /// `period_days`, for one venue or the whole platform.
    pub async fn payment_analytics(
        &self,
        venue_id: Option<Uuid>,
        period_days: i64,
    ) -> ServiceResult<PaymentAnalytics> {
        if !(1..=365).contains(&period_days) {
            return Err(ServiceError::Validation(
                "period must be between 1 and 365 days".to_string(),
            ));
        }
        let since = Utc::now() - Duration::days(period_days);
        let mut stats = self.store.payment_stats(venue_id, since).await?;
        stats.average_payment = stats.average_payment.round_dp(2);
        let daily_revenue = self.store.daily_revenue(venue_id, since).await?;

        Ok(PaymentAnalytics {
            period_days,
            success_rate: rate(stats.completed_payments, stats.total_payments),
            stats,
            daily_revenue,
        })
    }

    pub async fn venue_payment_analytics(
        &self,
        venue_id: Uuid,
        actor: &Actor,
        period_days: i64,
    ) -> ServiceResult<PaymentAnalytics> {
        authorize_venue(self.store.as_ref(), venue_id, actor).await?;
        self.payment_analytics(Some(venue_id), period_days).await
    }

    /// Payments that failed within the last `hours`.
    pub async fn failed_payments(&self, hours: i64, page: PageRequest) -> ServiceResult<Page<Payment>> {
        let since = Utc::now() - hours_window(hours)?;
        Ok(self
            .store
            .list_payments(PaymentFilter {
                status: Some(PaymentStatus::Failed),
                created_after: Some(since),
                page,
                ..Default::default()
            })
            .await?)
    }

    /// Payments still pending after `hours`, most likely abandoned checkouts.
    pub async fn pending_payments(&self, hours: i64, page: PageRequest) -> ServiceResult<Page<Payment>> {
        let before = Utc::now() - hours_window(hours)?;
        Ok(self
            .store
            .list_payments(PaymentFilter {
                status: Some(PaymentStatus::Pending),
                created_before: Some(before),
                page,
                ..Default::default()
            })
            .await?)
    }

    /// Refunds a completed payment and voids its unredeemed vouchers.
    pub async fn refund_payment(&self, id: Uuid, reason: Option<String>) -> ServiceResult<Payment> {
        let payment = self
            .store
            .find_payment(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Payment"))?;
        if payment.status != PaymentStatus::Completed {
            return Err(RuleViolation::PaymentNotRefundable.into());
        }

        let now = Utc::now();
        let metadata = json!({
            "refund_reason": reason.unwrap_or_else(|| "Requested by administrator".to_string()),
            "refunded_at": now,
        });
        let refunded = self
            .store
            .transition_payment(id, PaymentStatus::Completed, PaymentStatus::Refunded, Some(metadata), now)
            .await?
            .ok_or_else(|| ServiceError::Conflict("Payment status changed by another request".to_string()))?;

        info!(payment_id = %id, "Payment refunded");
        Ok(refunded)
    }

    /// Puts a failed payment back to pending so the customer can pay again.
    pub async fn retry_failed_payment(&self, id: Uuid, actor: &Actor) -> ServiceResult<Payment> {
        let payment = self.get_payment(id, actor).await?;
        if payment.status != PaymentStatus::Failed {
            return Err(RuleViolation::PaymentNotRetryable.into());
        }

        let retried = self
            .store
            .transition_payment(
                id,
                PaymentStatus::Failed,
                PaymentStatus::Pending,
                Some(json!({ "retried_at": Utc::now() })),
                Utc::now(),
            )
            .await?
            .ok_or_else(|| ServiceError::Conflict("Payment status changed by another request".to_string()))?;

        info!(payment_id = %id, "Payment retry requested");
        Ok(retried)
    }
}

fn hours_window(hours: i64) -> ServiceResult<Duration> {
    if !(0..=24 * 30).contains(&hours) {
        return Err(ServiceError::Validation(
            "hours must be between 0 and 720".to_string(),
        ));
    }
    Ok(Duration::hours(hours))
}
