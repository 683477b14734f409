use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::Config;

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_COOKIE_NAME: &str = "agentlearn_session";
const TOKEN_VERSION: &str = "v1";

/// Claims carried by an access token. Role and tier are deliberately absent:
/// both are re-read from the entitlement store on every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("session signing key is not configured")]
    Unavailable,
    #[error("access token is malformed")]
    Malformed,
    #[error("access token signature is invalid")]
    BadSignature,
    #[error("access token has expired")]
    Expired,
}

/// Signs and verifies `v1.<claims>.<mac>` access tokens, both segments
/// base64url without padding.
#[derive(Debug, Clone)]
pub struct SessionTokenCodec {
    signing_key: Option<String>,
}

impl SessionTokenCodec {
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.session_signing_key.clone())
    }

    pub fn new(signing_key: Option<String>) -> Self {
        Self {
            signing_key: signing_key
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
        }
    }

    pub fn issue(
        &self,
        user_id: &str,
        email: &str,
        name: Option<&str>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, IdentityError> {
        let claims = SessionClaims {
            sub: user_id.trim().to_string(),
            email: email.trim().to_lowercase(),
            name: name
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string),
            exp: (now + ttl).timestamp(),
        };
        if claims.sub.is_empty() || claims.email.is_empty() {
            return Err(IdentityError::Malformed);
        }

        let claims_bytes = serde_json::to_vec(&claims).map_err(|_| IdentityError::Malformed)?;
        let signing_input = format!("{TOKEN_VERSION}.{}", URL_SAFE_NO_PAD.encode(claims_bytes));
        let signature = URL_SAFE_NO_PAD.encode(self.mac(&signing_input)?.finalize().into_bytes());
        Ok(format!("{signing_input}.{signature}"))
    }

    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<SessionClaims, IdentityError> {
        let mut segments = token.trim().split('.');
        let (Some(version), Some(claims_segment), Some(signature_segment), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(IdentityError::Malformed);
        };
        if version != TOKEN_VERSION {
            return Err(IdentityError::Malformed);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_segment)
            .map_err(|_| IdentityError::Malformed)?;
        self.mac(&format!("{version}.{claims_segment}"))?
            .verify_slice(&signature)
            .map_err(|_| IdentityError::BadSignature)?;

        let claims_bytes = URL_SAFE_NO_PAD
            .decode(claims_segment)
            .map_err(|_| IdentityError::Malformed)?;
        let claims: SessionClaims =
            serde_json::from_slice(&claims_bytes).map_err(|_| IdentityError::Malformed)?;
        if claims.sub.trim().is_empty() || claims.email.trim().is_empty() {
            return Err(IdentityError::Malformed);
        }
        if claims.exp <= now.timestamp() {
            return Err(IdentityError::Expired);
        }
        Ok(claims)
    }

    fn mac(&self, signing_input: &str) -> Result<HmacSha256, IdentityError> {
        let key = self.signing_key.as_ref().ok_or(IdentityError::Unavailable)?;
        let mut mac =
            HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| IdentityError::Unavailable)?;
        mac.update(signing_input.as_bytes());
        Ok(mac)
    }
}

pub fn access_token_from_headers(headers: &HeaderMap) -> Option<String> {
    bearer_token(headers).or_else(|| extract_cookie_value(headers, SESSION_COOKIE_NAME))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let authorization = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let token = authorization.strip_prefix("Bearer ")?.trim();
    non_empty(token)
}

fn extract_cookie_value(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let raw = headers.get(COOKIE)?.to_str().ok()?;
    for part in raw.split(';') {
        let mut pieces = part.trim().splitn(2, '=');
        let key = pieces.next()?.trim();
        let value = pieces.next()?.trim();

        if key == cookie_name {
            return non_empty(value);
        }
    }

    None
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn codec() -> SessionTokenCodec {
        SessionTokenCodec::new(Some("session-test-signing-key".to_string()))
    }

    #[test]
    fn issued_token_verifies_until_expiry() {
        let now = Utc::now();
        let token = codec()
            .issue("usr_1", "Reader@AgentLearn.test", Some("Reader"), Duration::hours(1), now)
            .expect("issue token");

        let claims = codec().verify(&token, now).expect("verify token");
        assert_eq!(claims.sub, "usr_1");
        assert_eq!(claims.email, "reader@agentlearn.test");
        assert_eq!(claims.name.as_deref(), Some("Reader"));

        assert_eq!(
            codec().verify(&token, now + Duration::hours(2)),
            Err(IdentityError::Expired)
        );
    }

    #[test]
    fn tampered_or_foreign_tokens_are_rejected() {
        let now = Utc::now();
        let token = codec()
            .issue("usr_1", "reader@agentlearn.test", None, Duration::hours(1), now)
            .expect("issue token");

        let foreign = SessionTokenCodec::new(Some("other-key".to_string()));
        assert_eq!(foreign.verify(&token, now), Err(IdentityError::BadSignature));

        let forged_claims = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&SessionClaims {
                sub: "usr_admin".to_string(),
                email: "admin@agentlearn.test".to_string(),
                name: None,
                exp: (now + Duration::hours(1)).timestamp(),
            })
            .expect("encode claims"),
        );
        let signature = token.rsplit('.').next().unwrap_or_default();
        let forged = format!("v1.{forged_claims}.{signature}");
        assert_eq!(codec().verify(&forged, now), Err(IdentityError::BadSignature));

        assert_eq!(codec().verify("not-a-token", now), Err(IdentityError::Malformed));
        assert_eq!(
            SessionTokenCodec::new(None).verify(&token, now),
            Err(IdentityError::Unavailable)
        );
    }

    #[test]
    fn token_is_read_from_bearer_then_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; agentlearn_session=cookie-token"),
        );
        assert_eq!(
            access_token_from_headers(&headers).as_deref(),
            Some("cookie-token")
        );

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer bearer-token"));
        assert_eq!(
            access_token_from_headers(&headers).as_deref(),
            Some("bearer-token")
        );
    }
}
