use std::{env, fmt::Display, str::FromStr, time::Duration};

use tracing::{info, warn};

pub mod cors;

pub use cors::create_cors_layer;

const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://localhost:5173";

#[derive(Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub max_requests: u64,
    pub window: Duration,
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub redis_url: Option<String>,
    pub jwt_secret: String,
    pub voucher_signing_secret: String,
    pub payment_webhook_secret: String,
    pub cors_allowed_origins: Vec<String>,
    pub rate_limit: RateLimitSettings,
    pub payment_rate_limit: RateLimitSettings,
    pub smtp: Option<SmtpSettings>,
    pub mail_from: String,
    pub frontend_url: String,
    pub api_url: String,
    pub payment_gateway_url: String,
    pub payment_merchant_id: String,
    pub default_currency: String,
}

impl Config {
    pub fn from_env() -> Self {
        let smtp = optional("SMTP_HOST").map(|host| SmtpSettings {
            host,
            port: parsed("SMTP_PORT", 587),
            username: string("SMTP_USERNAME", ""),
            password: string("SMTP_PASSWORD", ""),
        });

        Self {
            database_url: string("DATABASE_URL", "postgres://localhost/vouchers"),
            port: parsed("PORT", 3001),
            redis_url: optional("REDIS_URL"),
            jwt_secret: string("JWT_SECRET", "development-jwt-secret"),
            voucher_signing_secret: string("VOUCHER_SIGNING_SECRET", "development-voucher-secret"),
            payment_webhook_secret: string("PAYMENT_WEBHOOK_SECRET", "development-webhook-secret"),
            cors_allowed_origins: split_origins(&string(
                "CORS_ALLOWED_ORIGINS",
                DEFAULT_ALLOWED_ORIGINS,
            )),
            rate_limit: RateLimitSettings {
                max_requests: parsed("RATE_LIMIT_MAX_REQUESTS", 100),
                window: Duration::from_secs(parsed("RATE_LIMIT_WINDOW_SECS", 900)),
            },
            payment_rate_limit: RateLimitSettings {
                max_requests: parsed("PAYMENT_RATE_LIMIT_MAX_REQUESTS", 5),
                window: Duration::from_secs(parsed("PAYMENT_RATE_LIMIT_WINDOW_SECS", 600)),
            },
            smtp,
            mail_from: string("MAIL_FROM", "Vouchers <noreply@localhost>"),
            frontend_url: string("FRONTEND_URL", "http://localhost:3000"),
            api_url: string("API_URL", "http://localhost:3001"),
            payment_gateway_url: string(
                "PAYMENT_GATEWAY_URL",
                "https://sandbox.payfast.co.za/eng/process",
            ),
            payment_merchant_id: string("PAYMENT_MERCHANT_ID", "10000100"),
            default_currency: string("DEFAULT_CURRENCY", "ZAR"),
        }
    }
}

impl Default for Config {
    /// Development settings with every optional integration switched off.
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/vouchers".to_string(),
            port: 3001,
            redis_url: None,
            jwt_secret: "development-jwt-secret".to_string(),
            voucher_signing_secret: "development-voucher-secret".to_string(),
            payment_webhook_secret: "development-webhook-secret".to_string(),
            cors_allowed_origins: split_origins(DEFAULT_ALLOWED_ORIGINS),
            rate_limit: RateLimitSettings {
                max_requests: 100,
                window: Duration::from_secs(900),
            },
            payment_rate_limit: RateLimitSettings {
                max_requests: 5,
                window: Duration::from_secs(600),
            },
            smtp: None,
            mail_from: "Vouchers <noreply@localhost>".to_string(),
            frontend_url: "http://localhost:3000".to_string(),
            api_url: "http://localhost:3001".to_string(),
            payment_gateway_url: "https://sandbox.payfast.co.za/eng/process".to_string(),
            payment_merchant_id: "10000100".to_string(),
            default_currency: "ZAR".to_string(),
        }
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn string(key: &str, default: &str) -> String {
    optional(key).unwrap_or_else(|| {
        info!("{key} not set, using default");
        default.to_string()
    })
}

fn parsed<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match optional(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!("Invalid {key} value '{raw}': {e}, using default: {default}");
            default
        }),
        None => {
            info!("{key} not set, using default: {default}");
            default
        }
    }
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_origins_skips_blanks() {
        let origins = split_origins(" http://a.test , ,http://b.test,");
        assert_eq!(origins, vec!["http://a.test", "http://b.test"]);
    }

    #[test]
    fn test_default_limits() {
        let config = Config::default();
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.rate_limit.window, Duration::from_secs(900));
        assert_eq!(config.payment_rate_limit.max_requests, 5);
        assert_eq!(config.default_currency, "ZAR");
        assert!(config.smtp.is_none());
    }
}
