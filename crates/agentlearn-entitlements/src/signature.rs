//! Webhook signature verification for billing events.
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac>[,v1=<hex hmac>...]`, where the
//! HMAC-SHA256 is computed over `"{t}.{raw body}"` with the endpoint secret as
//! the key. More than one `v1` entry may be present while a secret is being
//! rotated; any match is accepted. Verification works on raw bytes and never
//! parses the body.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_SCHEME: &str = "v1";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("signature header is missing")]
    MissingHeader,
    #[error("signature header is malformed")]
    MalformedHeader,
    #[error("signature timestamp is outside the tolerance window")]
    StaleTimestamp,
    #[error("no signature matched the payload")]
    Mismatch,
    #[error("webhook secret is not usable")]
    InvalidSecret,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

fn parse_header(header: &str) -> Result<ParsedHeader, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key.trim() {
            "t" => {
                timestamp = Some(
                    value
                        .trim()
                        .parse::<i64>()
                        .map_err(|_| SignatureError::MalformedHeader)?,
                );
            }
            SIGNATURE_SCHEME => {
                // Entries that are not hex can never match; skip them.
                if let Ok(bytes) = hex::decode(value.trim()) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::MalformedHeader)?;
    if signatures.is_empty() {
        return Err(SignatureError::Mismatch);
    }

    Ok(ParsedHeader {
        timestamp,
        signatures,
    })
}

fn mac_for(secret: &str, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Verifies `header` against `payload` and returns the signed timestamp.
pub fn verify_signature(
    payload: &[u8],
    header: Option<&str>,
    secret: &str,
    now_epoch: i64,
    tolerance_seconds: u64,
) -> Result<i64, SignatureError> {
    if secret.trim().is_empty() {
        return Err(SignatureError::InvalidSecret);
    }
    let header = header
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(SignatureError::MissingHeader)?;
    let parsed = parse_header(header)?;

    let tolerance = i64::try_from(tolerance_seconds).unwrap_or(i64::MAX);
    if now_epoch.saturating_sub(parsed.timestamp).abs() > tolerance {
        return Err(SignatureError::StaleTimestamp);
    }

    let matched = parsed.signatures.iter().any(|candidate| {
        mac_for(secret, parsed.timestamp, payload)
            .map(|mac| mac.verify_slice(candidate).is_ok())
            .unwrap_or(false)
    });
    if !matched {
        return Err(SignatureError::Mismatch);
    }

    Ok(parsed.timestamp)
}

/// Builds a header value for `payload`. Used by operator tooling and tests to
/// produce deliveries the verifier accepts.
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> Result<String, SignatureError> {
    let mac = mac_for(secret, timestamp, payload)?;
    let signature = hex::encode(mac.finalize().into_bytes());
    Ok(format!("t={timestamp},{SIGNATURE_SCHEME}={signature}"))
}
