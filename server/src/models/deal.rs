use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "deal_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DealStatus {
    Draft,
    Active,
    Paused,
    Ended,
}

impl DealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealStatus::Draft => "draft",
            DealStatus::Active => "active",
            DealStatus::Paused => "paused",
            DealStatus::Ended => "ended",
        }
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Deal {
    pub id: Uuid,
    pub venue_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub terms_and_conditions: String,
    pub original_price: Decimal,
    pub deal_price: Decimal,
    pub max_vouchers: i32,
    pub max_per_customer: i32,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub requires_age_verification: bool,
    pub status: DealStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deal {
    /// Whether `at` falls inside the deal's sale window (both ends inclusive).
    pub fn is_on_sale_at(&self, at: DateTime<Utc>) -> bool {
        self.start_date <= at && at <= self.end_date
    }

    /// Discount off the original price, in percent.
    pub fn savings_percent(&self) -> Decimal {
        if self.original_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.original_price - self.deal_price) / self.original_price * Decimal::ONE_HUNDRED
    }

    /// The editable fields as they currently stand.
    pub fn changes(&self) -> DealChanges {
        DealChanges {
            title: self.title.clone(),
            description: self.description.clone(),
            terms_and_conditions: self.terms_and_conditions.clone(),
            original_price: self.original_price,
            deal_price: self.deal_price,
            max_vouchers: self.max_vouchers,
            max_per_customer: self.max_per_customer,
            start_date: self.start_date,
            end_date: self.end_date,
            requires_age_verification: self.requires_age_verification,
        }
    }
}

/// Every field a venue may edit after creation, already validated.
#[derive(Debug, Clone, PartialEq)]
pub struct DealChanges {
    pub title: String,
    pub description: Option<String>,
    pub terms_and_conditions: String,
    pub original_price: Decimal,
    pub deal_price: Decimal,
    pub max_vouchers: i32,
    pub max_per_customer: i32,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub requires_age_verification: bool,
}

/// A validated deal ready to be inserted in `draft` status.
#[derive(Debug, Clone)]
pub struct NewDeal {
    pub id: Uuid,
    pub venue_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub terms_and_conditions: String,
    pub original_price: Decimal,
    pub deal_price: Decimal,
    pub max_vouchers: i32,
    pub max_per_customer: i32,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub requires_age_verification: bool,
}
