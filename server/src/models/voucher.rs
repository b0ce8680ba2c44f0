use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "voucher_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VoucherStatus {
    Active,
    Redeemed,
    Expired,
    Refunded,
}

impl VoucherStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoucherStatus::Active => "active",
            VoucherStatus::Redeemed => "redeemed",
            VoucherStatus::Expired => "expired",
            VoucherStatus::Refunded => "refunded",
        }
    }
}

impl fmt::Display for VoucherStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Voucher {
    pub id: Uuid,
    pub user_id: Uuid,
    pub deal_id: Uuid,
    pub venue_id: Uuid,
    pub voucher_code: String,
    #[serde(skip_serializing)]
    pub qr_code_data: String,
    pub purchase_price: Decimal,
    pub quantity: i32,
    pub expires_at: DateTime<Utc>,
    pub status: VoucherStatus,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub redeemed_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Voucher {
    pub fn is_past_expiry(&self, at: DateTime<Utc>) -> bool {
        self.expires_at < at
    }
}
