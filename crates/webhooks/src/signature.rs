//! Webhook signature verification using HMAC-SHA256.
//!
//! Providers sign webhook payloads with a shared secret; the signature
//! arrives in a header as `sha256=<hex>` alongside a unix-seconds timestamp
//! header. Verification is the first step in webhook processing and is a
//! pure check: an event that fails it is dropped, never queued.
//!
//! The timestamp is checked against a bounded freshness window (replay
//! protection) independently of signature correctness.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Why a webhook was rejected at the trust boundary.
///
/// None of these variants are retried: an event we cannot authenticate
/// cannot be trusted on a second look either.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header missing")]
    MissingSignature,

    #[error("timestamp header missing")]
    MissingTimestamp,

    #[error("signature header malformed")]
    MalformedSignature,

    #[error("timestamp header malformed")]
    MalformedTimestamp,

    #[error("signature does not match payload")]
    InvalidSignature,

    #[error("timestamp outside freshness window (age {age_secs}s)")]
    StaleTimestamp { age_secs: i64 },
}

/// Freshness policy for the timestamp header.
///
/// These are policy parameters, not structural ones; deployments tune them
/// via configuration.
#[derive(Debug, Clone, Copy)]
pub struct VerifierConfig {
    /// Maximum accepted age of the timestamp header.
    pub freshness_window: Duration,
    /// Maximum accepted clock skew into the future.
    pub max_future_skew: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(300),
            max_future_skew: Duration::from_secs(60),
        }
    }
}

/// Parses a signature header (e.g. `sha256=abc123...`) into raw bytes.
///
/// Returns `None` for malformed headers (missing prefix, invalid hex).
/// Never panics.
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let hex_sig = header.strip_prefix("sha256=")?;
    hex::decode(hex_sig).ok()
}

/// Computes the HMAC-SHA256 signature of a payload with the given secret.
///
/// Exposed so tests (and provider simulators) can produce valid signatures.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Formats a raw signature as a `sha256=<hex>` header value.
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Verifier for one provider's shared secret.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
    config: VerifierConfig,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<Vec<u8>>, config: VerifierConfig) -> Self {
        Self {
            secret: secret.into(),
            config,
        }
    }

    /// Verify raw request bytes against the signature and timestamp headers.
    ///
    /// Headers are passed as `Option` so a missing header is distinguishable
    /// from a malformed one. Uses constant-time comparison (via the HMAC
    /// library) for the signature check. The timestamp check runs first and
    /// rejects stale events regardless of signature correctness.
    pub fn verify(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
        timestamp_header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let timestamp = timestamp_header.ok_or(SignatureError::MissingTimestamp)?;
        let signature = signature_header.ok_or(SignatureError::MissingSignature)?;

        let ts_secs: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| SignatureError::MalformedTimestamp)?;
        let age_secs = now.timestamp() - ts_secs;
        if age_secs > self.config.freshness_window.as_secs() as i64
            || -age_secs > self.config.max_future_skew.as_secs() as i64
        {
            return Err(SignatureError::StaleTimestamp { age_secs });
        }

        let expected =
            parse_signature_header(signature).ok_or(SignatureError::MalformedSignature)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| SignatureError::InvalidSignature)?;
        mac.update(payload);
        mac.verify_slice(&expected)
            .map_err(|_| SignatureError::InvalidSignature)
    }

    /// Age of the timestamp header relative to `now`, for observability
    /// logging at the call site. `None` when the header is absent/malformed.
    pub fn timestamp_age(timestamp_header: Option<&str>, now: DateTime<Utc>) -> Option<i64> {
        let ts: i64 = timestamp_header?.trim().parse().ok()?;
        Some(now.timestamp() - ts)
    }
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret.
        f.debug_struct("SignatureVerifier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
