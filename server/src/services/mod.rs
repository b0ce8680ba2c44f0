//! Business logic over the [`Store`](crate::store::Store).

use uuid::Uuid;

use crate::models::{UserRole, Venue};
use crate::store::Store;

pub mod checks;
pub mod codes;
pub mod deals;
pub mod error;
pub mod notifications;
pub mod payments;
pub mod vouchers;

pub use codes::{HmacSigner, QrPayload, QrSigner};
pub use deals::{CreateDeal, DealService, DealView, UpdateDeal};
pub use error::{RuleViolation, ServiceError, ServiceResult};
pub use notifications::Notifier;
pub use payments::{Checkout, GatewaySettings, PaymentAnalytics, PaymentService};
pub use vouchers::{PaymentMode, PurchaseReceipt, Redemption, VoucherService};

/// The authenticated caller on whose behalf a service acts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: UserRole,
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    /// Admins may read anyone's records.
    pub fn can_view(&self, owner_id: Uuid) -> bool {
        self.is_admin() || self.user_id == owner_id
    }

    pub fn can_manage(&self, venue: &Venue) -> bool {
        self.is_admin() || venue.owner_id == self.user_id
    }
}

/// Loads the venue and fails unless `actor` owns it or is an admin.
pub(crate) async fn authorize_venue(
    store: &dyn Store,
    venue_id: Uuid,
    actor: &Actor,
) -> ServiceResult<Venue> {
    let venue = store
        .find_venue(venue_id)
        .await?
        .ok_or_else(|| ServiceError::not_found("Venue"))?;
    if !actor.can_manage(&venue) {
        return Err(ServiceError::Forbidden(
            "You do not have access to this venue".to_string(),
        ));
    }
    Ok(venue)
}

/// Percentage of `part` in `total`, rounded to two decimals.
pub(crate) fn rate(part: i64, total: i64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let percent = part as f64 / total as f64 * 100.0;
    (percent * 100.0).round() / 100.0
}


#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, Mutex};

    use chrono::{Duration, NaiveDate, Utc};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use super::*;
    use crate::mail::{DynMailClient, EmailMessage, MailClient, MailError};
    use crate::models::{Deal, DealStatus, NewDeal, User, Venue};
    use crate::store::{MemoryStore, Store};

    pub const VENUE_ID: Uuid = Uuid::from_u128(0x5e11_0000_0000_4000_8000_0000_0000_0001);
    pub const VENUE_OWNER_ID: Uuid = Uuid::from_u128(0x0a11_0000_0000_4000_8000_0000_0000_0001);
    pub const QR_SECRET: &[u8] = b"test-voucher-secret";
    pub const WEBHOOK_SECRET: &[u8] = b"test-webhook-secret";

    /// The venue-role user who owns the seeded venue.
    pub fn venue_owner() -> User {
        let now = Utc::now();
        User {
            id: VENUE_OWNER_ID,
            email: "owner@cornerbistro.example".to_string(),
            password_hash: "hash".to_string(),
            first_name: "Sipho".to_string(),
            last_name: "Dlamini".to_string(),
            phone: None,
            role: UserRole::Venue,
            is_active: true,
            date_of_birth: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store.insert_user(venue_owner());
        store.insert_venue(Venue {
            id: VENUE_ID,
            owner_id: VENUE_OWNER_ID,
            name: "The Corner Bistro".to_string(),
            address: "1 Long Street".to_string(),
            city: "Cape Town".to_string(),
            is_active: true,
            created_at: now,
            updated_at: now,
        });
        store
    }

    pub fn user_with_role(store: &MemoryStore, role: UserRole) -> User {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let user = User {
            id,
            email: format!("{}@example.com", id.simple()),
            password_hash: "hash".to_string(),
            first_name: "Thandi".to_string(),
            last_name: "Nkosi".to_string(),
            phone: None,
            role,
            is_active: true,
            date_of_birth: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_user(user.clone());
        user
    }

    pub fn customer(store: &MemoryStore, date_of_birth: Option<NaiveDate>) -> User {
        let mut user = user_with_role(store, UserRole::Customer);
        user.date_of_birth = date_of_birth;
        store.insert_user(user.clone());
        user
    }

    pub fn actor(user: &User) -> Actor {
        Actor {
            user_id: user.id,
            role: user.role,
        }
    }

    pub fn new_deal() -> NewDeal {
        let now = Utc::now();
        NewDeal {
            id: Uuid::new_v4(),
            venue_id: VENUE_ID,
            title: "Half-price tasting menu".to_string(),
            description: Some("Five courses".to_string()),
            terms_and_conditions: "Bookings essential".to_string(),
            original_price: Decimal::new(50000, 2),
            deal_price: Decimal::new(25000, 2),
            max_vouchers: 1000,
            max_per_customer: 10,
            start_date: now - Duration::days(1),
            end_date: now + Duration::days(30),
            requires_age_verification: false,
        }
    }

    /// Inserts an on-sale deal, letting `tweak` adjust it after activation.
    pub async fn active_deal(store: &MemoryStore, tweak: impl FnOnce(&mut Deal)) -> Deal {
        let deal = store.insert_deal(new_deal()).await.unwrap();
        store.modify_deal(deal.id, |d| {
            d.status = DealStatus::Active;
            tweak(d);
        });
        store.find_deal(deal.id).await.unwrap().unwrap()
    }

    #[derive(Default)]
    pub struct RecordingMailClient {
        pub sent: Mutex<Vec<EmailMessage>>,
        pub fail: bool,
    }

    impl RecordingMailClient {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn sent(&self) -> Vec<EmailMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl MailClient for RecordingMailClient {
        async fn send(&self, message: EmailMessage) -> Result<(), MailError> {
            if self.fail {
                return Err(MailError::Transport("connection refused".to_string()));
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn from_address(&self) -> &str {
            "test@example.com"
        }
    }

    pub fn voucher_service_with_mail(
        store: Arc<MemoryStore>,
        mail: Arc<RecordingMailClient>,
    ) -> VoucherService {
        let mail: DynMailClient = mail;
        let store: Arc<dyn Store> = store;
        VoucherService::new(
            store,
            QrSigner::new(QR_SECRET).unwrap(),
            Notifier::new(mail, "http://localhost:3000"),
            "ZAR",
        )
    }

    pub fn voucher_service(store: Arc<MemoryStore>) -> (VoucherService, Arc<RecordingMailClient>) {
        let mail = Arc::new(RecordingMailClient::default());
        (voucher_service_with_mail(store, mail.clone()), mail)
    }

    pub fn gateway_settings() -> GatewaySettings {
        GatewaySettings {
            gateway_url: "https://gateway.test/process".to_string(),
            merchant_id: "M-100".to_string(),
            frontend_url: "http://localhost:3000".to_string(),
            api_url: "http://localhost:3001".to_string(),
        }
    }

    pub fn payment_service(
        store: Arc<MemoryStore>,
    ) -> (PaymentService, VoucherService, Arc<RecordingMailClient>) {
        let (vouchers, mail) = voucher_service(store.clone());
        let dyn_mail: DynMailClient = mail.clone();
        let dyn_store: Arc<dyn Store> = store;
        let payments = PaymentService::new(
            dyn_store,
            vouchers.clone(),
            Notifier::new(dyn_mail, "http://localhost:3000"),
            HmacSigner::new(WEBHOOK_SECRET).unwrap(),
            gateway_settings(),
        );
        (payments, vouchers, mail)
    }
}
