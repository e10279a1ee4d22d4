use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::{domain::UserId, error::ApiError};

#[derive(Debug, Clone)]
pub struct SessionKeys {
    pub secret: String,
    pub ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// Mints an HS256 session token whose subject is `user:<id>`.
pub fn issue_session_token(
    keys: &SessionKeys,
    user_id: UserId,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = Claims {
        sub: format!("user:{}", user_id.0),
        iat: now.timestamp(),
        exp: (now + Duration::seconds(keys.ttl_seconds)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(keys.secret.as_bytes()),
    )
}

pub fn verify_session_token(keys: &SessionKeys, token: &str) -> Result<UserId, ApiError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(keys.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|err| ApiError::unauthorized(format!("invalid session token: {err}")))?;

    data.claims
        .sub
        .strip_prefix("user:")
        .and_then(|raw| raw.parse::<i64>().ok())
        .map(UserId)
        .ok_or_else(|| ApiError::unauthorized("session token has no user subject"))
}
