use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{AppError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const DIGEST_LEN: usize = 32;

fn rejected(detail: impl Into<String>) -> AppError {
    AppError::WebhookVerification(detail.into())
}

/// Decode a `sha256=<hex>` header value into the raw digest.
fn parse_signature(value: &str) -> Result<Vec<u8>> {
    let hex_digest = value
        .trim()
        .strip_prefix("sha256=")
        .ok_or_else(|| rejected("signature is not sha256"))?;
    let digest = hex::decode(hex_digest).map_err(|e| rejected(format!("bad hex: {e}")))?;
    if digest.len() != DIGEST_LEN {
        return Err(rejected(format!(
            "digest is {} bytes, expected {DIGEST_LEN}",
            digest.len()
        )));
    }
    Ok(digest)
}

/// Check a delivery body against its `X-Hub-Signature-256` header.
pub fn verify_delivery(secret: &str, headers: &HeaderMap, body: &[u8]) -> Result<()> {
    if secret.is_empty() {
        return Err(AppError::Config("webhook secret is not configured".to_string()));
    }
    let value = headers
        .get(SIGNATURE_HEADER)
        .ok_or_else(|| rejected("missing signature header"))?
        .to_str()
        .map_err(|_| rejected("signature header is not ASCII"))?;
    let digest = parse_signature(value)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Config(format!("unusable webhook secret: {e}")))?;
    mac.update(body);
    // Constant-time comparison.
    mac.verify_slice(&digest)
        .map_err(|_| rejected("signature does not match body"))
}
