use thiserror::Error;

use crate::models::VoucherStatus;
use crate::store::StoreError;

/// Business rules a request can break. Each variant carries the numbers the
/// caller needs and renders the message shown to the end user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleViolation {
    #[error("Deal not active")]
    DealNotActive,

    #[error("Deal not available")]
    DealNotAvailable,

    #[error("Only {remaining} vouchers remaining")]
    InsufficientVouchers { remaining: i64 },

    #[error("Maximum {limit} vouchers per customer. You have {current}.")]
    PurchaseLimitExceeded { limit: i32, current: i64 },

    #[error("Age verification required. Please update your date of birth.")]
    AgeVerificationRequired,

    #[error("You must be 18 or older to purchase this deal")]
    Underage,

    #[error("This voucher has been {status}")]
    VoucherNotActive { status: VoucherStatus },

    #[error("This voucher has expired")]
    VoucherExpired,

    #[error("QR code only available for active vouchers")]
    QrUnavailable,

    #[error("Only draft deals can be activated")]
    DealNotDraft,

    #[error("Cannot activate deal that has already ended")]
    DealAlreadyOver,

    #[error("Only active deals can be paused")]
    DealNotPausable,

    #[error("Only active or paused deals can be ended")]
    DealNotEndable,

    #[error("Ended deals cannot be edited")]
    DealNotEditable,

    #[error("Only completed payments can be refunded")]
    PaymentNotRefundable,

    #[error("Only failed payments can be retried")]
    PaymentNotRetryable,
}

impl RuleViolation {
    pub fn code(&self) -> &'static str {
        match self {
            RuleViolation::DealNotActive => "DEAL_NOT_ACTIVE",
            RuleViolation::DealNotAvailable => "DEAL_NOT_AVAILABLE",
            RuleViolation::InsufficientVouchers { .. } => "INSUFFICIENT_VOUCHERS",
            RuleViolation::PurchaseLimitExceeded { .. } => "PURCHASE_LIMIT_EXCEEDED",
            RuleViolation::AgeVerificationRequired => "AGE_VERIFICATION_REQUIRED",
            RuleViolation::Underage => "UNDERAGE",
            RuleViolation::VoucherNotActive { .. } => "VOUCHER_NOT_ACTIVE",
            RuleViolation::VoucherExpired => "VOUCHER_EXPIRED",
            RuleViolation::QrUnavailable => "QR_UNAVAILABLE",
            RuleViolation::DealNotDraft
            | RuleViolation::DealAlreadyOver
            | RuleViolation::DealNotPausable
            | RuleViolation::DealNotEndable => "INVALID_DEAL_TRANSITION",
            RuleViolation::DealNotEditable => "DEAL_NOT_EDITABLE",
            RuleViolation::PaymentNotRefundable | RuleViolation::PaymentNotRetryable => {
                "INVALID_PAYMENT_TRANSITION"
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Rule(#[from] RuleViolation),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn not_found(what: &str) -> Self {
        ServiceError::NotFound(format!("{what} not found"))
    }

    /// The rule that was broken, if any.
    pub fn rule(&self) -> Option<&RuleViolation> {
        match self {
            ServiceError::Rule(rule) => Some(rule),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_messages_carry_their_numbers() {
        assert_eq!(
            RuleViolation::InsufficientVouchers { remaining: 5 }.to_string(),
            "Only 5 vouchers remaining"
        );
        assert_eq!(
            RuleViolation::PurchaseLimitExceeded { limit: 2, current: 1 }.to_string(),
            "Maximum 2 vouchers per customer. You have 1."
        );
        assert_eq!(
            RuleViolation::VoucherNotActive {
                status: VoucherStatus::Redeemed
            }
            .to_string(),
            "This voucher has been redeemed"
        );
    }

    #[test]
    fn test_service_error_displays_rule_message() {
        let err = ServiceError::from(RuleViolation::DealNotActive);
        assert_eq!(err.to_string(), "Deal not active");
        assert_eq!(err.rule().map(RuleViolation::code), Some("DEAL_NOT_ACTIVE"));
    }
}
