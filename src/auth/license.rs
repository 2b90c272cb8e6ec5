//! Offline license key validation.
//!
//! A license key is `base64url(payload) "." base64url(signature)` where the
//! payload is a JSON document and the signature is RSA-PSS over the raw
//! payload bytes with SHA-256. The public half of the signing key is
//! embedded at build time; validation never touches the network.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rsa::RsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::pss::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;
use thiserror::Error;

/// PEM of the license signing public key, embedded at build time.
const LICENSE_PUBKEY_PEM: &str = include_str!("license_pubkey.pem");

static VERIFYING_KEY: LazyLock<VerifyingKey<Sha256>> = LazyLock::new(|| {
    #[expect(clippy::expect_used, reason = "embedded key is validated at build time")]
    let key = RsaPublicKey::from_public_key_pem(LICENSE_PUBKEY_PEM)
        .expect("embedded license public key must parse");
    VerifyingKey::new(key)
});

/// Signed contents of a license key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicensePayload {
    pub email: String,
    pub plan: String,
    pub max_sessions: u32,
    pub expires_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
}

/// Why a license key was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LicenseError {
    /// Not two dot-separated base64url parts, or the payload is not the
    /// expected JSON document.
    #[error("malformed license key")]
    BadFormat,

    /// The signature does not verify against the embedded public key.
    #[error("license signature invalid")]
    BadSignature,

    /// The key verified but `expiresAt` is in the past.
    #[error("license expired at {0}")]
    Expired(DateTime<Utc>),
}

/// Decode and verify a license key, checking expiry against `now`.
///
/// # Errors
///
/// Returns [`LicenseError`] describing the first failed check.
pub fn validate(key: &str) -> Result<LicensePayload, LicenseError> {
    let (payload_bytes, signature_bytes) = decode(key)?;

    let signature =
        Signature::try_from(signature_bytes.as_slice()).map_err(|_| LicenseError::BadSignature)?;
    VERIFYING_KEY
        .verify(&payload_bytes, &signature)
        .map_err(|_| LicenseError::BadSignature)?;

    let payload: LicensePayload =
        serde_json::from_slice(&payload_bytes).map_err(|_| LicenseError::BadFormat)?;
    check_expiry(&payload, Utc::now())?;
    Ok(payload)
}

/// Split a key into its payload and signature bytes.
pub(crate) fn decode(key: &str) -> Result<(Vec<u8>, Vec<u8>), LicenseError> {
    let mut parts = key.trim().splitn(2, '.');
    let payload_part = parts.next().ok_or(LicenseError::BadFormat)?;
    let signature_part = parts.next().ok_or(LicenseError::BadFormat)?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload_part)
        .map_err(|_| LicenseError::BadFormat)?;
    let signature = URL_SAFE_NO_PAD
        .decode(signature_part)
        .map_err(|_| LicenseError::BadFormat)?;
    Ok((payload, signature))
}

pub(crate) fn check_expiry(
    payload: &LicensePayload,
    now: DateTime<Utc>,
) -> Result<(), LicenseError> {
    if payload.expires_at <= now {
        return Err(LicenseError::Expired(payload.expires_at));
    }
    Ok(())
}

/// SHA-256 of the whole key string, hex encoded, for persistence in the
/// auth-config row.
#[must_use]
pub fn key_hash(key: &str) -> String {
    hex::encode(Sha256::digest(key.trim().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn payload(expires_in: Duration) -> LicensePayload {
        let now = Utc::now();
        LicensePayload {
            email: "dev@example.com".to_owned(),
            plan: "pro".to_owned(),
            max_sessions: 8,
            expires_at: now + expires_in,
            issued_at: now,
        }
    }

    #[test]
    fn missing_dot_is_bad_format() {
        let err = validate("notakey").expect_err("must fail");
        assert_eq!(err, LicenseError::BadFormat);
    }

    #[test]
    fn invalid_base64_is_bad_format() {
        let err = validate("!!!.???").expect_err("must fail");
        assert_eq!(err, LicenseError::BadFormat);
    }

    #[test]
    fn garbage_signature_is_rejected() {
        let body = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&payload(Duration::days(30))).expect("serialize"),
        );
        let sig = URL_SAFE_NO_PAD.encode([0u8; 256]);
        let err = validate(&format!("{body}.{sig}")).expect_err("must fail");
        assert_eq!(err, LicenseError::BadSignature);
    }

    #[test]
    fn expiry_check_rejects_past_dates() {
        let expired = payload(Duration::days(-1));
        let err = check_expiry(&expired, Utc::now()).expect_err("must fail");
        assert!(matches!(err, LicenseError::Expired(_)));

        let valid = payload(Duration::days(1));
        check_expiry(&valid, Utc::now()).expect("future expiry passes");
    }

    #[test]
    fn key_hash_ignores_surrounding_whitespace() {
        assert_eq!(key_hash("abc.def"), key_hash("  abc.def\n"));
    }

    #[test]
    fn payload_uses_wire_field_names() {
        let json = serde_json::to_value(payload(Duration::days(1))).expect("serialize");
        assert!(json.get("maxSessions").is_some(), "camelCase wire names");
        assert!(json.get("expiresAt").is_some(), "camelCase wire names");
    }
}
