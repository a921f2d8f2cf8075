use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;
use std::path::Path;

use crate::error::{AppError, Result};

#[derive(Debug, Serialize)]
struct JwtClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// Generate a JWT for GitHub App authentication from the key on disk.
pub fn generate_app_jwt(app_id: u64, private_key_path: &Path) -> Result<String> {
    let key_pem = std::fs::read(private_key_path).map_err(|e| {
        AppError::Config(format!(
            "Failed to read private key at {}: {e}",
            private_key_path.display()
        ))
    })?;
    sign_app_jwt(app_id, &key_pem, chrono::Utc::now().timestamp())
}

fn sign_app_jwt(app_id: u64, key_pem: &[u8], now: i64) -> Result<String> {
    let encoding_key = EncodingKey::from_rsa_pem(key_pem)
        .map_err(|e| AppError::Config(format!("Invalid RSA private key: {e}")))?;

    let claims = JwtClaims {
        iat: now - 60,      // clock drift
        exp: now + 10 * 60, // GitHub's maximum
        iss: app_id.to_string(),
    };

    encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
        .map_err(|e| AppError::Config(format!("Failed to generate JWT: {e}")))
}
