use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;

/// A failure while exchanging messages with the backend
#[derive(Debug, Error)]
pub enum ApiError {
    /// The backend answered with an error status
    #[error("error response from backend ({status}): {body}")]
    ErrorWithBody {
        /// The response status
        status: StatusCode,
        /// The body of the error response
        body: String,
        /// The underlying request error
        source: reqwest::Error,
    },
    /// Unable to deserialize the response body
    #[error("error deserializing response body from backend")]
    ResponseBody(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyRead(#[source] reqwest::Error),
    /// Unable to send the request to the backend
    #[error("error sending request to backend")]
    RequestSend(#[source] reqwest::Error),
}

/// A login failure
#[derive(Debug, Error)]
pub enum LoginError {
    /// The backend rejected the submitted credentials
    ///
    /// Recovered locally: session state is unchanged and the caller surfaces
    /// a user-facing message.
    #[error("credentials rejected by the backend")]
    CredentialsRejected,
    /// The exchange failed before the credentials could be judged
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// A failure of the best-effort backend logout call
///
/// Local session state is already cleared by the time this is returned.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct LogoutError(#[from] ApiError);

/// A refresh failure
///
/// Cloneable so a single episode's outcome can be shared with every caller
/// that coalesced onto it.
#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    /// No refresh token is available
    #[error("no refresh token available")]
    NoRefreshToken,
    /// The backend rejected the refresh token; the session cannot be
    /// recovered and a forced logout is warranted
    #[error("refresh token rejected by the backend ({status})")]
    Rejected {
        /// The response status
        status: StatusCode,
        /// The body of the rejection response
        body: String,
    },
    /// The session was terminated while the refresh was in flight; the new
    /// tokens were discarded
    #[error("session was terminated while the refresh was in flight")]
    SessionRevoked,
    /// The in-flight refresh was dropped before it settled
    #[error("in-flight refresh was abandoned before settling")]
    Interrupted,
    /// The exchange failed at the transport layer; surfaced uninterpreted
    /// and without any session-state change
    #[error(transparent)]
    Api(Arc<ApiError>),
}

impl From<ApiError> for RefreshError {
    fn from(error: ApiError) -> Self {
        Self::Api(Arc::new(error))
    }
}

impl RefreshError {
    /// True when the failure is a definitive rejection of the session,
    /// the one case that propagates into a forced logout
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::SessionRevoked)
    }
}

/// Refusal from a route guard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NotAuthorized {
    /// No live authenticated session
    #[error("not authenticated")]
    NotAuthenticated,
    /// The session lacks the required role
    #[error("missing required role")]
    MissingRole,
}
