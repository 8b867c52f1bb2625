//! JWT authentication and credential resolution.
//!
//! Provides JWT encoding/decoding, the `TokenValidator` seam, and an
//! `AuthUser` Axum extractor. The extractor looks for a credential in
//! priority order: the `access_token` cookie, the `Authorization: Bearer`
//! header, then the deprecated `token` query parameter.

use axum::extract::{FromRequestParts, Query};
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use relay_common::error::AppError;
use relay_common::types::UserId;

use crate::state::AppState;

/// Name of the HTTP-only cookie carrying the access token.
pub const ACCESS_TOKEN_COOKIE: &str = "access_token";

/// Legacy query parameter. Tokens in URLs end up in proxy logs.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// JWT claims stored in the token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject — the user's UUID
    pub sub: String,
    /// Expiration time (UNIX timestamp)
    pub exp: i64,
    /// Issued at (UNIX timestamp)
    pub iat: i64,
}

/// Where the credential of a request was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Cookie,
    Header,
    /// Deprecated; scheduled for removal.
    Query,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub source: CredentialSource,
}

/// Turns a bearer token into a user id.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<UserId, AppError>;
}

/// HMAC-signed JWT validator.
#[derive(Clone)]
pub struct JwtValidator {
    secret: String,
}

impl JwtValidator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl TokenValidator for JwtValidator {
    fn validate(&self, token: &str) -> Result<UserId, AppError> {
        let claims = decode_jwt(token, &self.secret)?;
        Uuid::parse_str(&claims.sub)
            .map_err(|_| AppError::InvalidCredential("Invalid user ID in token".to_string()))
    }
}

/// Authenticated user extracted from the upgrade request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: UserId,
    pub source: CredentialSource,
}

/// Encode a JWT token for a user.
pub fn encode_jwt(user_id: Uuid, secret: &str, expiry_hours: u64) -> Result<String, AppError> {
    let now = Utc::now();
    let exp = now + Duration::hours(expiry_hours as i64);

    let claims = Claims {
        sub: user_id.to_string(),
        exp: exp.timestamp(),
        iat: now.timestamp(),
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("Failed to encode JWT: {}", e)))?;

    Ok(token)
}

/// Decode and validate a JWT token.
pub fn decode_jwt(token: &str, secret: &str) -> Result<Claims, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| AppError::InvalidCredential(e.to_string()))?;

    Ok(token_data.claims)
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Find the request's credential, honoring cookie > header > query.
/// Empty values count as absent.
pub fn resolve_credential(parts: &Parts) -> Option<Credential> {
    let from_cookie = parts
        .headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == ACCESS_TOKEN_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string());
    if let Some(token) = from_cookie {
        return Some(Credential {
            token,
            source: CredentialSource::Cookie,
        });
    }

    let from_header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());
    if let Some(token) = from_header {
        return Some(Credential {
            token: token.to_string(),
            source: CredentialSource::Header,
        });
    }

    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(query)| query.token)
        .filter(|token| !token.is_empty())
        .map(|token| Credential {
            token,
            source: CredentialSource::Query,
        })
}

/// Resolve and validate the request's credential.
pub fn authenticate(parts: &Parts, validator: &dyn TokenValidator) -> Result<AuthUser, AppError> {
    let credential = resolve_credential(parts).ok_or(AppError::Unauthenticated)?;

    if credential.source == CredentialSource::Query {
        tracing::warn!(
            param = TOKEN_QUERY_PARAM,
            "Credential supplied via deprecated query parameter"
        );
    }

    let user_id = validator.validate(&credential.token)?;
    Ok(AuthUser {
        user_id,
        source: credential.source,
    })
}

/// Axum `FromRequestParts` implementation for `AuthUser`.
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let result = authenticate(parts, state.validator.as_ref());
        async move { result }
    }
}
