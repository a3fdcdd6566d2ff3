use serde::{Deserialize, Serialize};

use crate::braids::{AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef};
use crate::clock::{Clock, DurationMillis, UnixMillis};

/// The credential pair issued by the backend together with the access
/// token's computed expiry instant
///
/// The expiry is computed once, at issue time, from the server-supplied
/// lifetime. It backs the local expiry checks that avoid a network round
/// trip; the backend's 401 remains the authoritative signal.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSet {
    access_token: Box<AccessTokenRef>,
    refresh_token: Box<RefreshTokenRef>,
    token_expiry: UnixMillis,
}

/// A token's lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token has not yet reached its expiry instant
    Valid,
    /// The token is no longer valid
    Expired,
}

impl TokenSet {
    /// Constructs a token set, computing the expiry from the issuing
    /// authority's declared lifetime
    pub fn issue<C: Clock>(
        access_token: AccessToken,
        refresh_token: RefreshToken,
        lifetime: DurationMillis,
        clock: &C,
    ) -> Self {
        Self {
            access_token: access_token.into_boxed_ref(),
            refresh_token: refresh_token.into_boxed_ref(),
            token_expiry: clock.now() + lifetime,
        }
    }

    pub(crate) fn clone_it(&self) -> Self {
        Self {
            access_token: self.access_token.to_owned().into_boxed_ref(),
            refresh_token: self.refresh_token.to_owned().into_boxed_ref(),
            token_expiry: self.token_expiry,
        }
    }

    /// Gets the current access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the current refresh token
    #[inline]
    pub fn refresh_token(&self) -> &RefreshTokenRef {
        &self.refresh_token
    }

    /// Gets the time that the access token will expire
    #[inline]
    pub fn expiry(&self) -> UnixMillis {
        self.token_expiry
    }

    /// Gets the token's lifecycle status as of the provided time
    #[inline]
    pub fn status_at(&self, time: UnixMillis) -> TokenStatus {
        if time < self.token_expiry {
            TokenStatus::Valid
        } else {
            TokenStatus::Expired
        }
    }
}
