//! Bearer token authentication.

use crate::error::ApiError;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Permission bits carried in the `perm` claim
pub mod permissions {
    pub const CREATE_EMOTE: i64 = 1 << 0;
}

/// Claims of a user access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub u: String,
    /// Token version
    #[serde(default)]
    pub v: i64,
    /// Permission bitset
    #[serde(default)]
    pub perm: i64,
    pub exp: i64,
}

/// The authenticated user making a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub permissions: i64,
}

impl Actor {
    pub fn has_permission(&self, permission: i64) -> bool {
        self.permissions & permission == permission
    }
}

/// Verifies HS256 access tokens
pub struct Authenticator {
    key: DecodingKey,
    validation: Validation,
}

impl Authenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Verify `token` and return the actor it names
    pub fn verify(&self, token: &str) -> Result<Actor, jsonwebtoken::errors::Error> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(Actor {
            id: data.claims.u,
            permissions: data.claims.perm,
        })
    }
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Middleware rejecting requests without a valid bearer token.
/// Puts the [`Actor`] into request extensions.
pub async fn require_actor(
    State(authenticator): State<Arc<Authenticator>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(&request).ok_or(ApiError::Unauthorized)?;
    let actor = authenticator.verify(token).map_err(|e| {
        debug!(error = %e, "Rejected access token");
        ApiError::Unauthorized
    })?;

    request.extensions_mut().insert(actor);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, perm: i64, exp: i64) -> String {
        let claims = Claims {
            u: "user-1".to_string(),
            v: 0,
            perm,
            exp,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn in_an_hour() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn test_verify_valid_token() {
        let authenticator = Authenticator::new("secret");
        let actor = authenticator
            .verify(&token("secret", permissions::CREATE_EMOTE, in_an_hour()))
            .unwrap();
        assert_eq!(actor.id, "user-1");
        assert!(actor.has_permission(permissions::CREATE_EMOTE));
    }

    #[test]
    fn test_verify_rejects_wrong_secret_and_expired() {
        let authenticator = Authenticator::new("secret");
        assert!(authenticator.verify(&token("other", 1, in_an_hour())).is_err());
        assert!(authenticator.verify(&token("secret", 1, 1_000)).is_err());
        assert!(authenticator.verify("garbage").is_err());
    }

    #[test]
    fn test_permission_check() {
        let actor = Actor {
            id: "a".to_string(),
            permissions: 0b110,
        };
        assert!(!actor.has_permission(permissions::CREATE_EMOTE));
    }
}
