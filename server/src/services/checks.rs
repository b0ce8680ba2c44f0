//! Purchase preconditions. Pure functions over already-loaded rows so the
//! same checks run before issuance and are trivially testable.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

use super::error::RuleViolation;
use crate::models::{Deal, DealStatus};

pub const MINIMUM_AGE: i64 = 18;

/// 365.25 days.
const SECONDS_PER_YEAR: i64 = 31_557_600;

/// Returns the vouchers still available when `quantity` more can be issued.
///
/// Checked in order: deal status, sale window, remaining capacity. `issued`
/// is every voucher row ever created for the deal.
pub fn check_availability(
    deal: &Deal,
    issued: i64,
    quantity: i64,
    now: DateTime<Utc>,
) -> Result<i64, RuleViolation> {
    if deal.status != DealStatus::Active {
        return Err(RuleViolation::DealNotActive);
    }
    if !deal.is_on_sale_at(now) {
        return Err(RuleViolation::DealNotAvailable);
    }

    let remaining = (i64::from(deal.max_vouchers) - issued).max(0);
    if remaining < quantity {
        return Err(RuleViolation::InsufficientVouchers { remaining });
    }
    Ok(remaining)
}

pub fn check_purchase_limit(deal: &Deal, held: i64, quantity: i64) -> Result<(), RuleViolation> {
    if held + quantity > i64::from(deal.max_per_customer) {
        return Err(RuleViolation::PurchaseLimitExceeded {
            limit: deal.max_per_customer,
            current: held,
        });
    }
    Ok(())
}

/// Whole years between midnight UTC on `date_of_birth` and `now`.
pub fn age_in_years(date_of_birth: NaiveDate, now: DateTime<Utc>) -> i64 {
    let born = date_of_birth.and_time(NaiveTime::MIN).and_utc();
    (now - born).num_seconds().div_euclid(SECONDS_PER_YEAR)
}

pub fn check_age(date_of_birth: Option<NaiveDate>, now: DateTime<Utc>) -> Result<(), RuleViolation> {
    let date_of_birth = date_of_birth.ok_or(RuleViolation::AgeVerificationRequired)?;
    if age_in_years(date_of_birth, now) < MINIMUM_AGE {
        return Err(RuleViolation::Underage);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 15, 12, 0, 0).unwrap()
    }

    fn deal(max_vouchers: i32, max_per_customer: i32) -> Deal {
        Deal {
            id: Uuid::new_v4(),
            venue_id: Uuid::new_v4(),
            title: "Two for one".to_string(),
            description: None,
            terms_and_conditions: "Weekdays only".to_string(),
            original_price: Decimal::new(20000, 2),
            deal_price: Decimal::new(10000, 2),
            max_vouchers,
            max_per_customer,
            start_date: now() - Duration::days(1),
            end_date: now() + Duration::days(30),
            requires_age_verification: false,
            status: DealStatus::Active,
            created_at: now(),
            updated_at: now(),
        }
    }

    #[test]
    fn test_availability_reports_remaining() {
        assert_eq!(check_availability(&deal(10, 5), 4, 2, now()), Ok(6));
    }

    #[test]
    fn test_availability_rejects_more_than_remaining() {
        assert_eq!(
            check_availability(&deal(5, 10), 0, 6, now()),
            Err(RuleViolation::InsufficientVouchers { remaining: 5 })
        );
    }

    #[test]
    fn test_availability_checks_status_before_window() {
        let mut paused = deal(5, 5);
        paused.status = DealStatus::Paused;
        paused.end_date = now() - Duration::days(1);
        assert_eq!(
            check_availability(&paused, 0, 1, now()),
            Err(RuleViolation::DealNotActive)
        );
    }

    #[test]
    fn test_availability_outside_window() {
        let mut future = deal(5, 5);
        future.start_date = now() + Duration::hours(1);
        assert_eq!(
            check_availability(&future, 0, 1, now()),
            Err(RuleViolation::DealNotAvailable)
        );
    }

    #[test]
    fn test_oversold_deal_reports_zero_remaining() {
        assert_eq!(
            check_availability(&deal(3, 5), 7, 1, now()),
            Err(RuleViolation::InsufficientVouchers { remaining: 0 })
        );
    }

    #[test]
    fn test_purchase_limit() {
        let d = deal(100, 3);
        assert!(check_purchase_limit(&d, 1, 2).is_ok());
        assert_eq!(
            check_purchase_limit(&d, 2, 2),
            Err(RuleViolation::PurchaseLimitExceeded {
                limit: 3,
                current: 2
            })
        );
    }

    #[test]
    fn test_age_requires_date_of_birth() {
        assert_eq!(check_age(None, now()), Err(RuleViolation::AgeVerificationRequired));
    }

    #[test]
    fn test_age_boundaries() {
        let today = now().date_naive();
        let eighteen = today - Duration::days(6575);
        let seventeen = today - Duration::days(6400);

        assert_eq!(age_in_years(eighteen, now()), 18);
        assert_eq!(age_in_years(seventeen, now()), 17);
        assert!(check_age(Some(eighteen), now()).is_ok());
        assert_eq!(check_age(Some(seventeen), now()), Err(RuleViolation::Underage));
    }
}
