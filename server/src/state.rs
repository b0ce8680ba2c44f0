use std::sync::Arc;

use hmac::digest::InvalidLength;

use crate::auth::TokenKeys;
use crate::config::Config;
use crate::mail::DynMailClient;
use crate::rate_limit::{CounterStore, RateLimiter};
use crate::services::{
    DealService, GatewaySettings, HmacSigner, Notifier, PaymentService, QrSigner, VoucherService,
};
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub tokens: TokenKeys,
    pub vouchers: VoucherService,
    pub deals: DealService,
    pub payments: PaymentService,
    pub general_limiter: RateLimiter,
    pub payment_limiter: RateLimiter,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        mail: DynMailClient,
        counters: Arc<dyn CounterStore>,
    ) -> Result<Self, InvalidLength> {
        let notifier = Notifier::new(mail, config.frontend_url.clone());

        let vouchers = VoucherService::new(
            store.clone(),
            QrSigner::new(config.voucher_signing_secret.as_bytes())?,
            notifier.clone(),
            config.default_currency.clone(),
        );
        let payments = PaymentService::new(
            store.clone(),
            vouchers.clone(),
            notifier,
            HmacSigner::new(config.payment_webhook_secret.as_bytes())?,
            GatewaySettings {
                gateway_url: config.payment_gateway_url.clone(),
                merchant_id: config.payment_merchant_id.clone(),
                frontend_url: config.frontend_url.clone(),
                api_url: config.api_url.clone(),
            },
        );

        Ok(Self {
            tokens: TokenKeys::new(&config.jwt_secret),
            deals: DealService::new(store.clone()),
            general_limiter: RateLimiter::new("general", config.rate_limit, counters.clone()),
            payment_limiter: RateLimiter::new("payment", config.payment_rate_limit, counters),
            config: Arc::new(config),
            store,
            vouchers,
            payments,
        })
    }
}
