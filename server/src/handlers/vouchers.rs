use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Identity;
use crate::models::{UserRole, Voucher, VoucherStatus};
use crate::services::vouchers::{DEFAULT_ANALYTICS_PERIOD_DAYS, DEFAULT_EXPIRING_WINDOW_DAYS};
use crate::services::PaymentMode;
use crate::state::AppState;
use crate::store::PageRequest;
use crate::utils::error::AppError;
use crate::utils::response::{created, success};

#[derive(Debug, Deserialize)]
pub struct VoucherListQuery {
    pub status: Option<VoucherStatus>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl VoucherListQuery {
    fn page(&self) -> PageRequest {
        PageRequest::new(self.page, self.limit)
    }
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub deal_id: Uuid,
    pub quantity: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub voucher_code: String,
}

#[derive(Debug, Deserialize)]
pub struct RedeemQrRequest {
    pub qr_code_data: String,
}

#[derive(Debug, Deserialize)]
pub struct ExpiringQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsQuery {
    pub period: Option<i64>,
    pub venue_id: Option<Uuid>,
}

#[derive(Serialize)]
struct ExpiredPayload {
    expired_count: usize,
    vouchers: Vec<Voucher>,
}

pub async fn list_my_vouchers(
    State(state): State<AppState>,
    identity: Identity,
    query: Result<Query<VoucherListQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query?;
    let page = state
        .vouchers
        .list_user_vouchers(identity.user_id, query.status, query.page())
        .await?;
    Ok(success(page, "Vouchers retrieved successfully").into_response())
}

pub async fn get_voucher(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let voucher = state.vouchers.get_voucher(id, &identity.actor()).await?;
    Ok(success(voucher, "Voucher retrieved successfully").into_response())
}

pub async fn get_voucher_qr(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let qr = state.vouchers.get_voucher_qr(id, &identity.actor()).await?;
    Ok(success(qr, "QR code retrieved successfully").into_response())
}

pub async fn purchase(
    State(state): State<AppState>,
    identity: Identity,
    payload: Result<Json<PurchaseRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    identity.require(UserRole::Customer)?;
    let Json(payload) = payload?;

    let receipt = state
        .vouchers
        .purchase(
            identity.user_id,
            payload.deal_id,
            payload.quantity.unwrap_or(1),
            PaymentMode::Direct,
        )
        .await?;
    Ok(created(receipt, "Vouchers purchased successfully").into_response())
}

pub async fn redeem(
    State(state): State<AppState>,
    identity: Identity,
    payload: Result<Json<RedeemRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    identity.require(UserRole::Venue)?;
    let Json(payload) = payload?;

    let redemption = state
        .vouchers
        .redeem(&payload.voucher_code, &identity.actor())
        .await?;
    Ok(success(redemption, "Voucher redeemed successfully").into_response())
}

pub async fn redeem_qr(
    State(state): State<AppState>,
    identity: Identity,
    payload: Result<Json<RedeemQrRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    identity.require(UserRole::Venue)?;
    let Json(payload) = payload?;

    let redemption = state
        .vouchers
        .redeem_qr(&payload.qr_code_data, &identity.actor())
        .await?;
    Ok(success(redemption, "Voucher redeemed successfully").into_response())
}

pub async fn list_venue_vouchers(
    State(state): State<AppState>,
    identity: Identity,
    Path(venue_id): Path<Uuid>,
    query: Result<Query<VoucherListQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    identity.require(UserRole::Venue)?;
    let Query(query) = query?;

    let page = state
        .vouchers
        .list_venue_vouchers(venue_id, &identity.actor(), query.status, query.page())
        .await?;
    Ok(success(page, "Venue vouchers retrieved successfully").into_response())
}

pub async fn venue_analytics(
    State(state): State<AppState>,
    identity: Identity,
    Path(venue_id): Path<Uuid>,
    query: Result<Query<AnalyticsQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    identity.require(UserRole::Venue)?;
    let Query(query) = query?;

    let analytics = state
        .vouchers
        .venue_analytics(
            venue_id,
            &identity.actor(),
            query.period.unwrap_or(DEFAULT_ANALYTICS_PERIOD_DAYS),
        )
        .await?;
    Ok(success(analytics, "Voucher analytics retrieved successfully").into_response())
}

pub async fn expiring_vouchers(
    State(state): State<AppState>,
    identity: Identity,
    query: Result<Query<ExpiringQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    identity.require(UserRole::Admin)?;
    let Query(query) = query?;

    let vouchers = state
        .vouchers
        .expiring_vouchers(query.days.unwrap_or(DEFAULT_EXPIRING_WINDOW_DAYS))
        .await?;
    Ok(success(vouchers, "Expiring vouchers retrieved successfully").into_response())
}

pub async fn expire_vouchers(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<Response, AppError> {
    identity.require(UserRole::Admin)?;

    let vouchers = state.vouchers.expire_vouchers().await?;
    let payload = ExpiredPayload {
        expired_count: vouchers.len(),
        vouchers,
    };
    Ok(success(payload, "Expired vouchers processed").into_response())
}

pub async fn admin_analytics(
    State(state): State<AppState>,
    identity: Identity,
    query: Result<Query<AnalyticsQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    identity.require(UserRole::Admin)?;
    let Query(query) = query?;

    let analytics = state
        .vouchers
        .analytics(
            query.venue_id,
            query.period.unwrap_or(DEFAULT_ANALYTICS_PERIOD_DAYS),
        )
        .await?;
    Ok(success(analytics, "Voucher analytics retrieved successfully").into_response())
}
