//! Authentication: JWT sessions for the operators listed in config.
//!
//! There is no user database: accounts are `(username, argon2 hash)` pairs
//! from the `auth.users` config section.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use camrelay_common::config::AuthConfig;
use camrelay_common::error::{ApiError, ApiResult};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// JWT claims embedded in session tokens.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (username)
    pub sub: String,
    /// Issued at
    pub iat: i64,
    /// Expiration
    pub exp: i64,
    pub authorized: bool,
}

/// Hash a password using Argon2id.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a password against an Argon2 PHC string.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, argon2::password_hash::Error> {
    let parsed_hash = PasswordHash::new(hash)?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Checks credentials and issues/validates tokens.
pub struct Authorizer {
    secret: String,
    ttl_secs: u64,
    /// username → password hash
    users: HashMap<String, String>,
}

impl Authorizer {
    pub fn new(
        secret: impl Into<String>,
        ttl_secs: u64,
        users: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self {
            secret: secret.into(),
            ttl_secs,
            users: users.into_iter().collect(),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            config.jwt_secret.clone(),
            config.expiration_secs,
            config
                .users
                .iter()
                .map(|u| (u.username.clone(), u.hashed_password.clone())),
        )
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Check a username/password pair against the configured accounts.
    pub fn authorize_user(&self, username: &str, password: &str) -> ApiResult<()> {
        let hash = self
            .users
            .get(username)
            .ok_or(ApiError::InvalidCredentials)?;

        let valid = verify_password(password, hash).map_err(|e| {
            tracing::warn!(username, error = %e, "Stored password hash is malformed");
            ApiError::InvalidCredentials
        })?;

        if valid {
            Ok(())
        } else {
            Err(ApiError::InvalidCredentials)
        }
    }

    pub fn issue_token(&self, username: &str) -> ApiResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: username.to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(self.ttl_secs as i64)).timestamp(),
            authorized: true,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| ApiError::Internal(e.into()))
    }

    /// Validate and decode a token. Tokens not marked authorized are rejected.
    pub fn verify_token(&self, token: &str) -> ApiResult<Claims> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )?;
        if !data.claims.authorized {
            return Err(ApiError::InvalidToken);
        }
        Ok(data.claims)
    }
}
