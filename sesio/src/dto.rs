//! Wire types for the backend auth endpoints
//!
//! All bodies are JSON with camelCase members, matching the backend
//! contract: `POST /auth/login`, `POST /auth/logout`, `POST /auth/refresh`.

use serde::{Deserialize, Serialize};

use crate::braids::{AccessToken, Email, Password, RefreshToken, RefreshTokenRef};
use crate::clock::DurationMillis;
use crate::state::SessionUser;

/// Credentials submitted to the login endpoint
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    /// The account email
    pub email: Email,

    /// The account password
    pub password: Password,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefreshRequest<'a> {
    pub refresh_token: &'a RefreshTokenRef,
}

/// The token payload returned by the login and refresh endpoints
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TokenResponse {
    pub access_token: AccessToken,
    pub refresh_token: RefreshToken,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Token lifetime in milliseconds
    pub expires_in: DurationMillis,
    /// The authenticated user's record
    ///
    /// The deployed backend does not send this yet (it returns no identity
    /// or role information on login); when absent, identity is derived from
    /// the signed token's claims instead.
    #[serde(default)]
    pub user: Option<SessionUser>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_request_matches_backend_contract() {
        let body = serde_json::to_value(LoginRequest {
            email: Email::from_static("a@b.com"),
            password: Password::from_static("x"),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"email": "a@b.com", "password": "x"}));
    }

    #[test]
    fn refresh_request_matches_backend_contract() {
        let token = RefreshToken::from_static("r1");
        let body = serde_json::to_value(RefreshRequest {
            refresh_token: &token,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"refreshToken": "r1"}));
    }

    #[test]
    fn token_response_tolerates_missing_optional_members() {
        let resp: TokenResponse = serde_json::from_value(serde_json::json!({
            "accessToken": "t1",
            "refreshToken": "r1",
            "tokenType": "Bearer",
            "expiresIn": 3_600_000u64,
        }))
        .unwrap();
        assert_eq!(resp.access_token.as_str(), "t1");
        assert_eq!(resp.refresh_token.as_str(), "r1");
        assert_eq!(resp.token_type.as_deref(), Some("Bearer"));
        assert_eq!(resp.expires_in, DurationMillis(3_600_000));
        assert!(resp.user.is_none());
    }
}
