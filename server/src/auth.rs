//! Bearer-token identity and role guards.

use axum::extract::FromRequestParts;
use axum::http::{header::AUTHORIZATION, request::Parts};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::UserRole;
use crate::services::Actor;
use crate::state::AppState;
use crate::utils::error::AppError;

const TOKEN_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub role: UserRole,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn issue(&self, user_id: Uuid, role: UserRole) -> Result<String, AppError> {
        let now = Utc::now();
        let claims = Claims {
            user_id,
            role,
            iat: now.timestamp(),
            exp: (now + Duration::hours(TOKEN_TTL_HOURS)).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AppError::InternalServerError(format!("failed to sign token: {e}")))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AppError> {
        decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AppError::AuthError("Token expired".to_string()),
                _ => AppError::AuthError("Invalid token".to_string()),
            })
    }
}

/// The caller behind a verified bearer token, resolved against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: UserRole,
}

impl Identity {
    pub fn actor(&self) -> Actor {
        Actor {
            user_id: self.user_id,
            role: self.role,
        }
    }

    /// Admins pass every guard; everyone else needs the exact role.
    pub fn require(&self, role: UserRole) -> Result<(), AppError> {
        if self.role == UserRole::Admin || self.role == role {
            return Ok(());
        }
        Err(AppError::Forbidden(format!(
            "This action requires {role} role. You have {} role.",
            self.role
        )))
    }
}

fn bearer_token(parts: &Parts) -> Result<&str, AppError> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AppError::AuthError("Access token required".to_string()))
}

#[axum::async_trait]
impl FromRequestParts<AppState> for Identity {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let claims = state.tokens.verify(bearer_token(parts)?)?;

        let user = state
            .store
            .find_user(claims.user_id)
            .await?
            .filter(|user| user.is_active)
            .ok_or_else(|| AppError::AuthError("User not found or inactive".to_string()))?;

        Ok(Identity {
            user_id: user.id,
            role: user.role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip() {
        let keys = TokenKeys::new("secret");
        let user_id = Uuid::new_v4();
        let token = keys.issue(user_id, UserRole::Venue).unwrap();

        let claims = keys.verify(&token).unwrap();
        assert_eq!(claims.user_id, user_id);
        assert_eq!(claims.role, UserRole::Venue);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_token_from_other_secret_is_invalid() {
        let token = TokenKeys::new("one").issue(Uuid::new_v4(), UserRole::Customer).unwrap();
        let err = TokenKeys::new("two").verify(&token).unwrap_err();
        assert_eq!(err.to_string(), "Authentication error: Invalid token");
    }

    #[test]
    fn test_expired_token() {
        let keys = TokenKeys::new("secret");
        let past = Utc::now() - Duration::hours(2);
        let claims = Claims {
            user_id: Uuid::new_v4(),
            role: UserRole::Customer,
            iat: past.timestamp(),
            exp: (past + Duration::minutes(5)).timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding).unwrap();

        let err = keys.verify(&token).unwrap_err();
        assert_eq!(err.to_string(), "Authentication error: Token expired");
    }

    #[test]
    fn test_role_guard() {
        let venue = Identity {
            user_id: Uuid::new_v4(),
            role: UserRole::Venue,
        };
        let admin = Identity {
            user_id: Uuid::new_v4(),
            role: UserRole::Admin,
        };

        assert!(venue.require(UserRole::Venue).is_ok());
        assert!(admin.require(UserRole::Venue).is_ok());
        let err = venue.require(UserRole::Admin).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Forbidden: This action requires admin role. You have venue role."
        );
    }
}
