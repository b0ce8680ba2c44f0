use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Identity;
use crate::models::{PaymentStatus, UserRole};
use crate::services::payments::{
    DEFAULT_FAILED_WINDOW_HOURS, DEFAULT_STALE_PENDING_HOURS, SIGNATURE_HEADER,
};
use crate::services::vouchers::DEFAULT_ANALYTICS_PERIOD_DAYS;
use crate::state::AppState;
use crate::store::PageRequest;
use crate::utils::error::AppError;
use crate::utils::response::{created, success};

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub deal_id: Uuid,
    pub quantity: Option<i64>,
    pub payment_method: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentListQuery {
    pub status: Option<PaymentStatus>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl PaymentListQuery {
    fn page(&self) -> PageRequest {
        PageRequest::new(self.page, self.limit)
    }
}

#[derive(Debug, Deserialize)]
pub struct AgeQuery {
    pub hours: Option<i64>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentAnalyticsQuery {
    pub period: Option<i64>,
    pub venue_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub reason: Option<String>,
}

#[derive(Serialize)]
struct WebhookAck {
    payment_id: Uuid,
    status: PaymentStatus,
}

pub async fn checkout(
    State(state): State<AppState>,
    identity: Identity,
    payload: Result<Json<CheckoutRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    identity.require(UserRole::Customer)?;
    let Json(payload) = payload?;

    let checkout = state
        .payments
        .checkout(
            identity.user_id,
            payload.deal_id,
            payload.quantity.unwrap_or(1),
            payload.payment_method,
        )
        .await?;
    Ok(created(checkout, "Checkout created successfully").into_response())
}

/// Gateway callback. Authenticated by the body signature, not a bearer token.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let payment = state.payments.process_webhook(&body, signature).await?;
    let ack = WebhookAck {
        payment_id: payment.id,
        status: payment.status,
    };
    Ok(success(ack, "Webhook processed").into_response())
}

pub async fn list_payments(
    State(state): State<AppState>,
    identity: Identity,
    query: Result<Query<PaymentListQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query?;
    let page = state
        .payments
        .list_user_payments(identity.user_id, query.status, query.page())
        .await?;
    Ok(success(page, "Payments retrieved successfully").into_response())
}

pub async fn list_venue_payments(
    State(state): State<AppState>,
    identity: Identity,
    Path(venue_id): Path<Uuid>,
    query: Result<Query<PaymentListQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    identity.require(UserRole::Venue)?;
    let Query(query) = query?;

    let page = state
        .payments
        .list_venue_payments(venue_id, &identity.actor(), query.status, query.page())
        .await?;
    Ok(success(page, "Venue payments retrieved successfully").into_response())
}

pub async fn venue_payment_analytics(
    State(state): State<AppState>,
    identity: Identity,
    Path(venue_id): Path<Uuid>,
    query: Result<Query<PaymentAnalyticsQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    identity.require(UserRole::Venue)?;
    let Query(query) = query?;

    let analytics = state
        .payments
        .venue_payment_analytics(
            venue_id,
            &identity.actor(),
            query.period.unwrap_or(DEFAULT_ANALYTICS_PERIOD_DAYS),
        )
        .await?;
    Ok(success(analytics, "Payment analytics retrieved successfully").into_response())
}

pub async fn failed_payments(
    State(state): State<AppState>,
    identity: Identity,
    query: Result<Query<AgeQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    identity.require(UserRole::Admin)?;
    let Query(query) = query?;

    let page = state
        .payments
        .failed_payments(
            query.hours.unwrap_or(DEFAULT_FAILED_WINDOW_HOURS),
            PageRequest::new(query.page, query.limit),
        )
        .await?;
    Ok(success(page, "Failed payments retrieved successfully").into_response())
}

pub async fn pending_payments(
    State(state): State<AppState>,
    identity: Identity,
    query: Result<Query<AgeQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    identity.require(UserRole::Admin)?;
    let Query(query) = query?;

    let page = state
        .payments
        .pending_payments(
            query.hours.unwrap_or(DEFAULT_STALE_PENDING_HOURS),
            PageRequest::new(query.page, query.limit),
        )
        .await?;
    Ok(success(page, "Pending payments retrieved successfully").into_response())
}

pub async fn admin_payment_analytics(
    State(state): State<AppState>,
    identity: Identity,
    query: Result<Query<PaymentAnalyticsQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    identity.require(UserRole::Admin)?;
    let Query(query) = query?;

    let analytics = state
        .payments
        .payment_analytics(
            query.venue_id,
            query.period.unwrap_or(DEFAULT_ANALYTICS_PERIOD_DAYS),
        )
        .await?;
    Ok(success(analytics, "Payment analytics retrieved successfully").into_response())
}

pub async fn get_payment(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let payment = state.payments.get_payment(id, &identity.actor()).await?;
    Ok(success(payment, "Payment retrieved successfully").into_response())
}

pub async fn refund_payment(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
    payload: Option<Json<RefundRequest>>,
) -> Result<Response, AppError> {
    identity.require(UserRole::Admin)?;
    let reason = payload.and_then(|Json(payload)| payload.reason);

    let payment = state.payments.refund_payment(id, reason).await?;
    Ok(success(payment, "Payment refunded successfully").into_response())
}

pub async fn retry_payment(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let payment = state
        .payments
        .retry_failed_payment(id, &identity.actor())
        .await?;
    Ok(success(payment, "Payment retry initiated").into_response())
}
