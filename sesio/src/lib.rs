//! Client-side session management for backends issuing short-lived access
//! tokens and longer-lived refresh tokens
//!
//! This library keeps the token machinery out of sight of the rest of an
//! application: it signs in, persists the resulting credentials durably,
//! exposes "who is signed in" as an observable value, and hands fresh
//! access tokens to whichever layer attaches them to outgoing requests.
//! Refreshes are single-flight — concurrent discoveries of an expired
//! token coalesce onto one backend call and share its outcome — and an
//! unrecoverable refresh forces a clean local logout that no straggling
//! response can undo.
//!
//! The companion `sesio_reqwest` crate provides the request interceptor
//! that drives the 401 → refresh → retry protocol over this manager.
//!
//! # General flow
//!
//! On start-up, build a [`TokenStore`] over a durable cache, wrap it in a
//! [`SessionManager`], and restore any session a previous process left
//! behind:
//!
//! ```no_run
//! use sesio::store::FileSessionCache;
//! use sesio::{Email, LoginRequest, Password, SessionManager, TokenStore};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let api_url: reqwest::Url = "http://localhost:8078/api/v1".parse()?;
//! let store = TokenStore::new(FileSessionCache::new(".session.json".into()));
//! let manager = SessionManager::new(reqwest::Client::new(), api_url, store)?;
//!
//! manager.restore_session().await;
//!
//! if !manager.is_authenticated() {
//!     let user = manager
//!         .login(LoginRequest {
//!             email: Email::from_static("a@b.com"),
//!             password: Password::from_static("hunter2"),
//!         })
//!         .await?;
//!     tracing::info!(user.id = %user.id, "signed in");
//! }
//!
//! let mut sessions = manager.subscribe();
//! tokio::spawn(async move {
//!     while sessions.changed().await.is_ok() {
//!         if !sessions.borrow().is_authenticated() {
//!             // route back to the login view
//!         }
//!     }
//! });
//! # Ok(()) }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod clock;
pub mod dto;
mod error;
pub mod jwt;
mod manager;
mod state;
pub mod store;
mod tokens;

pub use braids::*;
pub use dto::LoginRequest;
pub use error::{ApiError, LoginError, LogoutError, NotAuthorized, RefreshError};
pub use manager::SessionManager;
pub use state::{Role, SessionState, SessionUser};
pub use store::TokenStore;
pub use tokens::{TokenSet, TokenStatus};
