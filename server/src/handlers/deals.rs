use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::Identity;
use crate::models::{DealStatus, UserRole};
use crate::services::deals::{DealQuery, DEFAULT_EXPIRING_DEALS_DAYS, DEFAULT_TRENDING_LIMIT};
use crate::services::vouchers::DEFAULT_ANALYTICS_PERIOD_DAYS;
use crate::services::{CreateDeal, UpdateDeal};
use crate::state::AppState;
use crate::utils::error::AppError;
use crate::utils::response::{created, success};

#[derive(Debug, Deserialize)]
pub struct DealListQuery {
    pub status: Option<DealStatus>,
}

#[derive(Debug, Deserialize)]
pub struct TrendingQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ExpiringDealsQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub quantity: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PeriodQuery {
    pub period: Option<i64>,
}

pub async fn list_deals(
    State(state): State<AppState>,
    query: Result<Query<DealQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query?;
    let deals = state.deals.list_deals(query).await?;
    Ok(success(deals, "Deals retrieved successfully").into_response())
}

pub async fn search_deals(
    State(state): State<AppState>,
    query: Result<Query<DealQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query?;
    let deals = state.deals.search_deals(query).await?;
    Ok(success(deals, "Search results retrieved successfully").into_response())
}

pub async fn trending_deals(
    State(state): State<AppState>,
    query: Result<Query<TrendingQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query?;
    let deals = state
        .deals
        .trending_deals(query.limit.unwrap_or(DEFAULT_TRENDING_LIMIT))
        .await?;
    Ok(success(deals, "Trending deals retrieved successfully").into_response())
}

pub async fn expiring_deals(
    State(state): State<AppState>,
    query: Result<Query<ExpiringDealsQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query?;
    let deals = state
        .deals
        .expiring_deals(query.days.unwrap_or(DEFAULT_EXPIRING_DEALS_DAYS))
        .await?;
    Ok(success(deals, "Expiring deals retrieved successfully").into_response())
}

pub async fn check_availability(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    query: Result<Query<AvailabilityQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query?;
    let availability = state
        .vouchers
        .check_availability(id, query.quantity.unwrap_or(1))
        .await?;
    Ok(success(availability, "Availability checked").into_response())
}

pub async fn create_deal(
    State(state): State<AppState>,
    identity: Identity,
    payload: Result<Json<CreateDeal>, JsonRejection>,
) -> Result<Response, AppError> {
    identity.require(UserRole::Venue)?;
    let Json(payload) = payload?;

    let deal = state.deals.create_deal(payload, &identity.actor()).await?;
    Ok(created(deal, "Deal created successfully").into_response())
}

pub async fn get_deal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let deal = state.deals.get_deal(id).await?;
    Ok(success(deal, "Deal retrieved successfully").into_response())
}

pub async fn update_deal(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
    payload: Result<Json<UpdateDeal>, JsonRejection>,
) -> Result<Response, AppError> {
    identity.require(UserRole::Venue)?;
    let Json(payload) = payload?;

    let deal = state
        .deals
        .update_deal(id, &identity.actor(), payload)
        .await?;
    Ok(success(deal, "Deal updated successfully").into_response())
}

pub async fn deal_analytics(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
    query: Result<Query<PeriodQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    identity.require(UserRole::Venue)?;
    let Query(query) = query?;

    let analytics = state
        .deals
        .deal_analytics(
            id,
            &identity.actor(),
            query.period.unwrap_or(DEFAULT_ANALYTICS_PERIOD_DAYS),
        )
        .await?;
    Ok(success(analytics, "Deal analytics retrieved successfully").into_response())
}

pub async fn list_venue_deals(
    State(state): State<AppState>,
    Path(venue_id): Path<Uuid>,
    query: Result<Query<DealListQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query?;
    let deals = state.deals.list_venue_deals(venue_id, query.status).await?;
    Ok(success(deals, "Deals retrieved successfully").into_response())
}

pub async fn activate_deal(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    identity.require(UserRole::Venue)?;
    let deal = state.deals.activate_deal(id, &identity.actor()).await?;
    Ok(success(deal, "Deal activated successfully").into_response())
}

pub async fn pause_deal(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    identity.require(UserRole::Venue)?;
    let deal = state.deals.pause_deal(id, &identity.actor()).await?;
    Ok(success(deal, "Deal paused successfully").into_response())
}

pub async fn end_deal(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    identity.require(UserRole::Venue)?;
    let deal = state.deals.end_deal(id, &identity.actor()).await?;
    Ok(success(deal, "Deal ended successfully").into_response())
}
