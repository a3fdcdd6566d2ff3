use serde::{Deserialize, Serialize};

use crate::braids::Email;

/// The authorization role assigned to a user by the backend
///
/// Role is the sole authorization dimension the rest of the application
/// consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    /// Full administrative access
    Admin,
    /// Content editing access
    Editor,
}

/// A user record as observed by authorization-aware consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    /// The backend's identifier for the user
    pub id: String,

    /// The account email
    pub email: Email,

    /// The user's role
    ///
    /// Present only when the backend supplied it, either in the login
    /// response body or as a claim in the signed access token. It is never
    /// invented locally.
    #[serde(default)]
    pub role: Option<Role>,

    /// Whether the account is active
    pub is_active: bool,

    /// Audit field
    #[serde(default)]
    pub created_date: Option<String>,
    /// Audit field
    #[serde(default)]
    pub updated_date: Option<String>,
    /// Audit field
    #[serde(default)]
    pub created_by: Option<String>,
    /// Audit field
    #[serde(default)]
    pub updated_by: Option<String>,
}

/// The single observable value describing who, if anyone, is signed in
///
/// Mutated only by the session manager; consumers subscribe via
/// [`SessionManager::subscribe`][crate::SessionManager::subscribe].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No user is signed in
    Anonymous,
    /// A user is signed in
    Authenticated(SessionUser),
}

impl SessionState {
    /// The signed-in user, if any
    pub fn user(&self) -> Option<&SessionUser> {
        match self {
            Self::Anonymous => None,
            Self::Authenticated(user) => Some(user),
        }
    }

    /// True when a user is signed in
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }

    /// The signed-in user's role, if known
    pub fn role(&self) -> Option<Role> {
        self.user().and_then(|user| user.role)
    }
}
