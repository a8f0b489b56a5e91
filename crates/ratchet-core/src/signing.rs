//! Webhook and event-envelope signatures.
//!
//! Every queue publish and bus envelope carries an HMAC-SHA256 over
//! `<timestamp>.<body>` in the `hmac-signature` / `hmac-timestamp`
//! headers. Consumers reject signatures older than five minutes and verify
//! against the current key first, then the next key during rotation.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex-encoded signature.
pub const SIGNATURE_HEADER: &str = "hmac-signature";

/// Header carrying the unix-seconds timestamp the signature covers.
pub const TIMESTAMP_HEADER: &str = "hmac-timestamp";

/// Maximum accepted signature age in seconds.
pub const MAX_SIGNATURE_AGE_SECS: i64 = 300;

/// Errors that can occur validating a signed payload.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("signature expired: {age_secs}s old")]
    Expired { age_secs: i64 },

    #[error("invalid signature encoding: {0}")]
    InvalidEncoding(String),

    #[error("signature verification failed")]
    Mismatch,
}

/// Current and (during rotation) next signing key.
#[derive(Debug, Clone)]
pub struct SigningKeys {
    current: Vec<u8>,
    next: Option<Vec<u8>>,
}

impl SigningKeys {
    pub fn new(current: impl Into<Vec<u8>>, next: Option<Vec<u8>>) -> Self {
        Self {
            current: current.into(),
            next,
        }
    }

    /// Build from hex-encoded key material; non-hex input is used as raw
    /// bytes so operator-supplied passphrases still work.
    pub fn from_hex(current: &str, next: Option<&str>) -> Self {
        let decode = |s: &str| hex::decode(s).unwrap_or_else(|_| s.as_bytes().to_vec());
        Self {
            current: decode(current),
            next: next.map(decode),
        }
    }
}

/// Sign `body` at `timestamp`. Returns the hex signature.
pub fn sign(key: &[u8], timestamp: i64, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Produce the `(hmac-timestamp, hmac-signature)` header values for `body`
/// as of now, using the current key.
pub fn signature_headers(keys: &SigningKeys, body: &[u8]) -> (String, String) {
    let timestamp = Utc::now().timestamp();
    let signature = sign(&keys.current, timestamp, body);
    (timestamp.to_string(), signature)
}

/// Verify a signed payload.
///
/// Checks the timestamp window first, then the signature against the
/// current key and, failing that, the next key. Comparison is
/// constant-time via the `hmac` crate's `verify_slice`.
pub fn verify(
    keys: &SigningKeys,
    timestamp: &str,
    signature_hex: &str,
    body: &[u8],
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let ts: i64 = timestamp
        .parse()
        .map_err(|_| SignatureError::InvalidTimestamp(timestamp.to_owned()))?;

    let age_secs = (now.timestamp() - ts).abs();
    if age_secs > MAX_SIGNATURE_AGE_SECS {
        return Err(SignatureError::Expired { age_secs });
    }

    let provided =
        hex::decode(signature_hex).map_err(|e| SignatureError::InvalidEncoding(e.to_string()))?;

    if verify_with_key(&keys.current, ts, body, &provided).is_ok() {
        return Ok(());
    }
    if let Some(next) = &keys.next {
        return verify_with_key(next, ts, body, &provided);
    }
    Err(SignatureError::Mismatch)
}

fn verify_with_key(
    key: &[u8],
    timestamp: i64,
    body: &[u8],
    expected: &[u8],
) -> Result<(), SignatureError> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.verify_slice(expected)
        .map_err(|_| SignatureError::Mismatch)
}
