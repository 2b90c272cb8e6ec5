//! JWT minting and verification for the session cookie.

use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::license::LicensePayload;

/// Cookie lifetime: 30 days.
pub const COOKIE_MAX_AGE_SECS: i64 = 30 * 24 * 60 * 60;

/// Claims carried by the `agentide_session` cookie.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub email: String,
    pub plan: String,
    /// License expiry as a unix timestamp; checked on every verification in
    /// addition to the token's own `exp`.
    #[serde(rename = "licenseExpiresAt")]
    pub license_expires_at: i64,
    pub iat: i64,
    pub exp: i64,
}

/// Encoding/decoding keys derived once from the store's hex JWT secret.
#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for JwtKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtKeys").finish_non_exhaustive()
    }
}

impl JwtKeys {
    /// Build keys from the hex-encoded secret in the auth-config row.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret is not valid hex.
    pub fn from_hex_secret(secret: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(secret)?;
        Ok(Self {
            encoding: EncodingKey::from_secret(&bytes),
            decoding: DecodingKey::from_secret(&bytes),
        })
    }

    /// Mint a 30-day token for an activated license.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn mint(&self, license: &LicensePayload) -> anyhow::Result<String> {
        self.mint_at(license, Utc::now())
    }

    fn mint_at(&self, license: &LicensePayload, now: DateTime<Utc>) -> anyhow::Result<String> {
        let iat = now.timestamp();
        let claims = Claims {
            email: license.email.clone(),
            plan: license.plan.clone(),
            license_expires_at: license.expires_at.timestamp(),
            iat,
            exp: iat + COOKIE_MAX_AGE_SECS,
        };
        Ok(jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &self.encoding,
        )?)
    }

    /// Verify a token, additionally rejecting tokens whose embedded license
    /// expiry has passed even when the token itself is still fresh.
    ///
    /// # Errors
    ///
    /// Returns an error for bad signatures, expired tokens and expired
    /// licenses.
    pub fn verify(&self, token: &str) -> anyhow::Result<Claims> {
        let data =
            jsonwebtoken::decode::<Claims>(token, &self.decoding, &Validation::default())?;
        let claims = data.claims;
        if claims.license_expires_at < Utc::now().timestamp() {
            anyhow::bail!("license expired");
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn keys() -> JwtKeys {
        JwtKeys::from_hex_secret(&hex::encode([7u8; 32])).expect("keys")
    }

    fn license(expires_in: Duration) -> LicensePayload {
        let now = Utc::now();
        LicensePayload {
            email: "dev@example.com".to_owned(),
            plan: "pro".to_owned(),
            max_sessions: 4,
            expires_at: now + expires_in,
            issued_at: now,
        }
    }

    #[test]
    fn mint_and_verify_round_trip() {
        let keys = keys();
        let token = keys.mint(&license(Duration::days(365))).expect("mint");
        let claims = keys.verify(&token).expect("verify");
        assert_eq!(claims.email, "dev@example.com");
        assert_eq!(claims.plan, "pro");
        assert_eq!(claims.exp - claims.iat, COOKIE_MAX_AGE_SECS);
    }

    #[test]
    fn token_with_wrong_secret_is_rejected() {
        let token = keys().mint(&license(Duration::days(365))).expect("mint");
        let other = JwtKeys::from_hex_secret(&hex::encode([9u8; 32])).expect("keys");
        assert!(other.verify(&token).is_err(), "wrong secret must fail");
    }

    #[test]
    fn fresh_token_for_expired_license_is_rejected() {
        let keys = keys();
        let token = keys.mint(&license(Duration::hours(-1))).expect("mint");
        assert!(
            keys.verify(&token).is_err(),
            "token validity must not outlive the license"
        );
    }
}
