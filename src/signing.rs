//! HMAC-SHA256 helpers shared by webhook delivery and presigned blob URLs.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of the signature header value, GitHub style.
pub const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Error, Debug)]
pub enum SigningError {
    #[error("Invalid signing key")]
    InvalidKey,
}

fn mac_bytes(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SigningError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SigningError::InvalidKey)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn hmac_hex(key: &[u8], data: &[u8]) -> Result<String, SigningError> {
    Ok(hex::encode(mac_bytes(key, data)?))
}

/// Header value for a rendered body: `sha256=<hex digest>`.
pub fn sign_body(secret: &str, body: &[u8]) -> Result<String, SigningError> {
    Ok(format!("{SIGNATURE_PREFIX}{}", hmac_hex(secret.as_bytes(), body)?))
}

/// Constant-time check of a received signature header against the body.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(provided_hex) = header.trim().strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(provided) = hex::decode(provided_hex) else {
        return false;
    };
    match mac_bytes(secret.as_bytes(), body) {
        Ok(expected) => expected.ct_eq(&provided).into(),
        Err(_) => false,
    }
}

/// Constant-time comparison of two hex tokens.
pub fn tokens_match(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}
