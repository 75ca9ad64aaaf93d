//! Bearer-token authentication for proxied routes.
//!
//! Tokens are HS256 JWTs. The subject becomes the principal used for the
//! per-user rate limit; the optional `tenant` claim feeds override lookup when
//! the caller sends no `X-Tenant-Id` header.

use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::GatewayError;

/// Paths that never require a token.
pub const DEFAULT_PUBLIC_PREFIXES: &[&str] = &[
    "/health/",
    "/q/health/",
    "/metrics",
    "/api/v1/identity/auth/",
];

pub const TENANT_HEADER: &str = "X-Tenant-Id";

/// JWT claims structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: usize,
    /// Issued at (Unix timestamp)
    pub iat: usize,
    /// User roles
    #[serde(default)]
    pub roles: Vec<String>,
    /// Tenant the user belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

/// Authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub roles: Vec<String>,
    pub tenant: Option<String>,
}

impl AuthUser {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Authentication state shared across requests.
#[derive(Clone)]
pub struct AuthState {
    jwt_secret: Option<Arc<String>>,
    public_prefixes: Arc<Vec<String>>,
}

impl AuthState {
    /// Create auth state. Without a secret every protected route rejects.
    pub fn new(jwt_secret: Option<String>, extra_public_prefixes: &[String]) -> Self {
        let mut prefixes: Vec<String> = DEFAULT_PUBLIC_PREFIXES
            .iter()
            .map(|p| p.to_string())
            .collect();
        prefixes.extend(extra_public_prefixes.iter().cloned());

        Self {
            jwt_secret: jwt_secret.filter(|s| !s.is_empty()).map(Arc::new),
            public_prefixes: Arc::new(prefixes),
        }
    }

    pub fn is_public(&self, path: &str) -> bool {
        self.public_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Issue a token. Used by tests and tooling; the identity service is the
    /// real issuer.
    pub fn generate_token(
        &self,
        user_id: &str,
        roles: Vec<String>,
        tenant: Option<String>,
        ttl_secs: u64,
    ) -> Result<String, GatewayError> {
        let secret = self.secret()?;
        let now = chrono::Utc::now().timestamp() as usize;
        let claims = Claims {
            sub: user_id.to_string(),
            exp: now + ttl_secs as usize,
            iat: now,
            roles,
            tenant,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| GatewayError::Internal(format!("failed to sign token: {e}")))
    }

    /// Validate a JWT token and return the claims.
    pub fn validate_token(&self, token: &str) -> Result<Claims, GatewayError> {
        let secret = self.secret().map_err(|_| GatewayError::Unauthorized)?;
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| {
            tracing::debug!(error = %e, "Rejected bearer token");
            GatewayError::Unauthorized
        })?;

        Ok(token_data.claims)
    }

    /// Authenticate from request headers, if a bearer token is present.
    ///
    /// `Ok(None)` means no token was sent; an invalid token is an error.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Option<AuthUser>, GatewayError> {
        let Some(value) = headers.get(header::AUTHORIZATION) else {
            return Ok(None);
        };
        let token = value
            .to_str()
            .ok()
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(GatewayError::Unauthorized)?;

        let claims = self.validate_token(token)?;
        Ok(Some(AuthUser {
            user_id: claims.sub,
            roles: claims.roles,
            tenant: claims.tenant,
        }))
    }

    fn secret(&self) -> Result<&str, GatewayError> {
        self.jwt_secret
            .as_deref()
            .map(String::as_str)
            .ok_or_else(|| GatewayError::Internal("JWT secret not configured".into()))
    }
}

/// Tenant for override lookup: `X-Tenant-Id`, then the token claim, then `default`.
pub fn tenant_of(headers: &HeaderMap, user: Option<&AuthUser>) -> String {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .or_else(|| user.and_then(|u| u.tenant.clone()))
        .unwrap_or_else(|| "default".to_string())
}
