use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::config::AppConfig;

/// JWT claims carried by inbound bearer tokens.
///
/// Token issuance lives in the account service; this API only validates
/// tokens and consumes the authenticated user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authorization header")]
    MissingAuth,
    #[error("Invalid token: {0}")]
    InvalidToken(String),
    #[error("Insufficient permissions")]
    Forbidden,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::MissingAuth | AuthError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden => StatusCode::FORBIDDEN,
        };
        let body = json!({
            "error": status.canonical_reason().unwrap_or("Error"),
            "message": self.to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        (status, Json(body)).into_response()
    }
}

/// The authenticated caller, extracted from a validated bearer token.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub roles: Vec<String>,
}

impl AuthenticatedUser {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == "admin")
    }

    /// Admin-gated endpoints call this before acting.
    pub fn require_admin(&self) -> Result<(), AuthError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AuthError::Forbidden)
        }
    }
}

/// Validates a bearer token against the configured secret, issuer and
/// audience and returns its claims.
pub fn decode_claims(token: &str, config: &AppConfig) -> Result<Claims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[config.auth_issuer.as_str()]);
    validation.set_audience(&[config.auth_audience.as_str()]);

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

    Ok(data.claims)
}

#[async_trait]
impl FromRequestParts<crate::AppState> for AuthenticatedUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &crate::AppState,
    ) -> Result<Self, Self::Rejection> {
        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::MissingAuth)?;

        let token = header_value
            .strip_prefix("Bearer ")
            .map(str::trim)
            .ok_or(AuthError::MissingAuth)?;

        let claims = decode_claims(token, &state.config)?;

        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| AuthError::InvalidToken("subject is not a user id".to_string()))?;

        Ok(AuthenticatedUser {
            user_id,
            email: claims.email,
            roles: claims.roles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn test_config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:".to_string(),
            "redis://127.0.0.1:6379".to_string(),
            "test_secret_key_for_testing_purposes_only_with_sixty_four_chars!".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        )
    }

    fn mint(claims: &Claims, config: &AppConfig) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
        )
        .expect("encode token")
    }

    fn base_claims(config: &AppConfig) -> Claims {
        let now = chrono::Utc::now();
        Claims {
            sub: Uuid::new_v4().to_string(),
            email: Some("viewer@example.com".to_string()),
            roles: vec!["user".to_string()],
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: (now + chrono::Duration::hours(1)).timestamp(),
            iss: config.auth_issuer.clone(),
            aud: config.auth_audience.clone(),
        }
    }

    #[test]
    fn valid_token_round_trips() {
        let config = test_config();
        let claims = base_claims(&config);
        let token = mint(&claims, &config);

        let decoded = decode_claims(&token, &config).expect("valid token");
        assert_eq!(decoded.sub, claims.sub);
        assert_eq!(decoded.roles, vec!["user".to_string()]);
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let config = test_config();
        let mut claims = base_claims(&config);
        claims.iss = "someone-else".to_string();
        let token = mint(&claims, &config);

        assert!(decode_claims(&token, &config).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let config = test_config();
        let mut claims = base_claims(&config);
        claims.exp = (chrono::Utc::now() - chrono::Duration::hours(2)).timestamp();
        let token = mint(&claims, &config);

        assert!(decode_claims(&token, &config).is_err());
    }

    #[test]
    fn admin_check() {
        let user = AuthenticatedUser {
            user_id: Uuid::new_v4(),
            email: None,
            roles: vec!["admin".to_string()],
        };
        assert!(user.require_admin().is_ok());

        let viewer = AuthenticatedUser {
            user_id: Uuid::new_v4(),
            email: None,
            roles: vec!["user".to_string()],
        };
        assert!(viewer.require_admin().is_err());
    }
}
