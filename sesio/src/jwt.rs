//! Advisory inspection of access-token claims
//!
//! The payload segment of the compact JWT is decoded without signature
//! verification: the key material lives server-side and all real
//! authorization is enforced there. The decoded claims only drive local
//! expiry checks and session-user construction, and the check **fails
//! closed** — a token that cannot be decoded, or that carries no expiry
//! claim, is treated as expired and never trusted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;

use crate::braids::{AccessTokenRef, Email};
use crate::clock::{Clock, System, UnixMillis};
use crate::state::Role;

/// Claims of interest extracted from an access token's payload segment
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    /// The subject (user identifier), if present
    #[serde(default)]
    pub sub: Option<String>,

    /// The user's email, if present
    #[serde(default)]
    pub email: Option<Email>,

    /// The user's role, if present and recognized
    #[serde(default, deserialize_with = "lenient_role")]
    pub role: Option<Role>,

    /// The expiry claim, in epoch seconds
    #[serde(default)]
    pub exp: Option<u64>,
}

impl Claims {
    /// The expiry instant declared by the token, if any
    pub fn expiry(&self) -> Option<UnixMillis> {
        self.exp.map(|secs| UnixMillis(secs.saturating_mul(1_000)))
    }
}

// An unrecognized role value must not poison the rest of the claims; the
// expiry check in particular has to keep working against tokens minted for
// roles this client does not know about.
fn lenient_role<'de, D>(deserializer: D) -> Result<Option<Role>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Decodes the claims embedded in an access token's payload segment
///
/// Returns `None` if the token is not a three-segment compact JWT, the
/// payload is not valid base64url, or the decoded payload is not a JSON
/// claims object.
pub fn decode_claims(token: &AccessTokenRef) -> Option<Claims> {
    let payload = token.as_str().split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Reports whether the token's declared expiry has passed as of `now`
///
/// Fails closed: an undecodable token or a missing expiry claim reports
/// expired.
pub fn is_expired_at(token: &AccessTokenRef, now: UnixMillis) -> bool {
    match decode_claims(token).and_then(|claims| claims.expiry()) {
        Some(expiry) => expiry <= now,
        None => true,
    }
}

/// Reports whether the token's declared expiry has passed
pub fn is_expired(token: &AccessTokenRef) -> bool {
    is_expired_at(token, System.now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::braids::AccessToken;

    fn jwt_with_payload(payload: &str) -> AccessToken {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(payload);
        AccessToken::from(format!("{header}.{payload}.sig"))
    }

    #[test]
    fn decodes_identity_claims() {
        let token = jwt_with_payload(
            r#"{"sub":"42","email":"a@b.com","role":"ADMIN","exp":1700000000}"#,
        );
        let claims = decode_claims(&token).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("42"));
        assert_eq!(claims.email.as_deref().map(|e| e.as_str()), Some("a@b.com"));
        assert_eq!(claims.role, Some(Role::Admin));
        assert_eq!(claims.expiry(), Some(UnixMillis(1_700_000_000_000)));
    }

    #[test]
    fn unknown_role_does_not_poison_other_claims() {
        let token = jwt_with_payload(r#"{"role":"VIEWER","exp":9999999999}"#);
        let claims = decode_claims(&token).unwrap();
        assert_eq!(claims.role, None);
        assert!(!is_expired_at(&token, UnixMillis(0)));
    }

    #[test]
    fn past_expiry_claim_is_expired_even_when_decode_succeeds() {
        let token = jwt_with_payload(r#"{"exp":1000}"#);
        assert!(is_expired_at(&token, UnixMillis(1_000_001)));
        assert!(is_expired_at(&token, UnixMillis(1_000_000)));
        assert!(!is_expired_at(&token, UnixMillis(999_999)));
    }

    #[test]
    fn malformed_tokens_are_expired() {
        for raw in [
            "not-a-jwt",
            "two.segments",
            "a.!!!not-base64!!!.c",
            "a.bm90LWpzb24.c",
        ] {
            let token = AccessToken::from_static(raw);
            assert!(is_expired_at(&token, UnixMillis(0)), "token {raw:?}");
        }
    }

    #[test]
    fn missing_expiry_claim_is_expired() {
        let token = jwt_with_payload(r#"{"sub":"42"}"#);
        assert!(is_expired_at(&token, UnixMillis(0)));
    }
}
