//! Bearer token issuance and verification.
//!
//! Tokens are tenant-scoped: the claim carries the tenant key the token was
//! issued for, and validation in the pipeline requires it to match the bound
//! tenant. A token minted under one tenant never validates under another.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Tenant key the token was issued for.
    pub tenant: String,
    /// Subject user id inside that tenant's schema.
    pub sub: Uuid,
    pub email: String,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn new(tenant: String, sub: Uuid, email: String, ttl_hours: i64) -> Self {
        let now = Utc::now();
        Self {
            tenant,
            sub,
            email,
            exp: (now + Duration::hours(ttl_hours)).timestamp(),
            iat: now.timestamp(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token secret not configured")]
    MissingSecret,

    #[error("token rejected: {0}")]
    Invalid(String),
}

pub fn issue_token(claims: &Claims, secret: &str) -> Result<String, TokenError> {
    if secret.is_empty() {
        return Err(TokenError::MissingSecret);
    }
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| TokenError::Invalid(e.to_string()))
}

pub fn verify_token(token: &str, secret: &str) -> Result<Claims, TokenError> {
    if secret.is_empty() {
        return Err(TokenError::MissingSecret);
    }
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| TokenError::Invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips() {
        let claims = Claims::new("pepita".to_string(), Uuid::new_v4(), "a@p.com".to_string(), 4);
        let token = issue_token(&claims, "secret").unwrap();
        let verified = verify_token(&token, "secret").unwrap();
        assert_eq!(verified.tenant, "pepita");
        assert_eq!(verified.sub, claims.sub);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let claims = Claims::new("pepita".to_string(), Uuid::new_v4(), "a@p.com".to_string(), 4);
        let token = issue_token(&claims, "secret").unwrap();
        assert!(verify_token(&token, "other").is_err());
    }

    #[test]
    fn empty_secret_is_refused() {
        let claims = Claims::new("pepita".to_string(), Uuid::new_v4(), "a@p.com".to_string(), 4);
        assert!(matches!(
            issue_token(&claims, ""),
            Err(TokenError::MissingSecret)
        ));
    }
}
