//! Session orchestration: login, logout, and single-flight token refresh

use std::sync::{Mutex, PoisonError};

use reqwest::{StatusCode, Url};
use tokio::sync::watch;

use crate::braids::{AccessToken, AccessTokenRef, EmailRef};
use crate::clock::System;
use crate::dto::{LoginRequest, RefreshRequest, TokenResponse};
use crate::error::{ApiError, LoginError, LogoutError, NotAuthorized, RefreshError};
use crate::jwt;
use crate::state::{Role, SessionState, SessionUser};
use crate::store::TokenStore;
use crate::tokens::TokenSet;

type EpisodeOutcome = Option<Result<AccessToken, RefreshError>>;

/// Orchestrates the session lifecycle against the backend auth endpoints
///
/// The manager is the only writer of [`SessionState`] and of the
/// [`TokenStore`]; it is an injectable instance rather than ambient state,
/// and every authorization-aware consumer observes it through
/// [`subscribe`][Self::subscribe] or the synchronous queries.
///
/// Refreshes are single-flight: however many callers discover an expired
/// token concurrently, only one refresh request reaches the backend, and
/// every caller resolves with that one episode's outcome.
#[derive(Debug)]
pub struct SessionManager {
    client: reqwest::Client,
    api_url: Url,
    login_url: Url,
    logout_url: Url,
    refresh_url: Url,
    store: TokenStore,
    state: watch::Sender<SessionState>,
    pending_refresh: Mutex<Option<watch::Receiver<EpisodeOutcome>>>,
}

enum Episode {
    Leader(watch::Sender<EpisodeOutcome>),
    Follower(watch::Receiver<EpisodeOutcome>),
}

/// Clears the pending-episode handle even if the leader is dropped at an
/// await point, so later failures cannot strand followers on a dead episode.
struct ClearPending<'a> {
    manager: &'a SessionManager,
}

impl Drop for ClearPending<'_> {
    fn drop(&mut self) {
        *self
            .manager
            .pending_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl SessionManager {
    /// Constructs a session manager rooted at `api_url`
    /// (e.g. `http://localhost:8078/api/v1`)
    pub fn new(
        client: reqwest::Client,
        api_url: Url,
        store: TokenStore,
    ) -> Result<Self, url::ParseError> {
        let base = with_trailing_slash(api_url.clone());
        let login_url = base.join("auth/login")?;
        let logout_url = base.join("auth/logout")?;
        let refresh_url = base.join("auth/refresh")?;
        let (state, _) = watch::channel(SessionState::Anonymous);

        Ok(Self {
            client,
            api_url,
            login_url,
            logout_url,
            refresh_url,
            store,
            state,
            pending_refresh: Mutex::new(None),
        })
    }

    /// The API base URL this manager authenticates against
    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    /// The token store owned by this manager
    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// True when `url` targets one of this manager's auth endpoints
    ///
    /// Auth traffic must never be subject to the refresh-and-retry
    /// protocol; a failing refresh triggering another refresh would recurse
    /// without bound.
    pub fn is_auth_endpoint(&self, url: &Url) -> bool {
        [&self.login_url, &self.logout_url, &self.refresh_url]
            .into_iter()
            .any(|endpoint| same_endpoint(url, endpoint))
    }

    /// Subscribes to the observable session state
    ///
    /// The receiver always reports the latest state; `Anonymous` stands in
    /// for "no user".
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// The current session state
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// The signed-in user, if any
    pub fn current_user(&self) -> Option<SessionUser> {
        self.state.borrow().user().cloned()
    }

    /// True iff an access token is present and its advisory expiry has not
    /// passed
    ///
    /// Synchronous and in-memory; never re-validated against the backend.
    pub fn is_authenticated(&self) -> bool {
        self.store
            .access_token()
            .is_some_and(|token| !jwt::is_expired(&token))
    }

    /// True when the signed-in user holds `role`; false when anonymous or
    /// when the backend never disclosed a role
    pub fn has_role(&self, role: Role) -> bool {
        self.state.borrow().role() == Some(role)
    }

    /// Route-guard hook: permits navigation only with a live session
    pub fn require_authenticated(&self) -> Result<(), NotAuthorized> {
        if self.is_authenticated() {
            Ok(())
        } else {
            Err(NotAuthorized::NotAuthenticated)
        }
    }

    /// Route-guard hook: permits navigation only with a live session
    /// holding `role`
    pub fn require_role(&self, role: Role) -> Result<(), NotAuthorized> {
        self.require_authenticated()?;
        if self.has_role(role) {
            Ok(())
        } else {
            Err(NotAuthorized::MissingRole)
        }
    }

    /// The current access token, if any
    pub fn access_token(&self) -> Option<AccessToken> {
        self.store.access_token()
    }

    /// True when a refresh token is available to attempt recovery with
    pub fn has_refresh_token(&self) -> bool {
        self.store.refresh_token().is_some()
    }

    /// Reads any session persisted by a previous process
    ///
    /// Broadcasts `Authenticated` only when a stored user record exists and
    /// the stored access token has not expired; an expired access token
    /// leaves the state `Anonymous` while the refresh token stays in the
    /// store, so the first 401 can still recover the session.
    pub async fn restore_session(&self) -> SessionState {
        let Some(snapshot) = self.store.restore().await else {
            return SessionState::Anonymous;
        };

        match snapshot.current_user() {
            Some(user) if !jwt::is_expired(snapshot.tokens().access_token()) => {
                let state = SessionState::Authenticated(user.clone());
                self.state.send_replace(state.clone());
                tracing::info!("restored persisted session");
                state
            }
            _ => {
                tracing::debug!(
                    "persisted session has an expired access token or no user record, staying anonymous"
                );
                SessionState::Anonymous
            }
        }
    }

    /// Signs in with the given credentials
    ///
    /// On success the token store and the session state are updated
    /// together and exactly one `Authenticated` event is emitted. On
    /// rejection the state remains `Anonymous`.
    #[tracing::instrument(err, skip_all, fields(email = %credentials.email))]
    pub async fn login(&self, credentials: LoginRequest) -> Result<SessionUser, LoginError> {
        let resp = match self
            .token_exchange(self.login_url.clone(), &credentials)
            .await
        {
            Ok(resp) => resp,
            Err(ApiError::ErrorWithBody { status, .. })
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN =>
            {
                tracing::debug!("backend rejected the submitted credentials");
                return Err(LoginError::CredentialsRejected);
            }
            Err(error) => return Err(error.into()),
        };

        let tokens = TokenSet::issue(
            resp.access_token,
            resp.refresh_token,
            resp.expires_in,
            &System,
        );
        let user = resp
            .user
            .unwrap_or_else(|| user_from_token(tokens.access_token(), &credentials.email));

        self.store.set_session(tokens, Some(user.clone())).await;
        self.state
            .send_replace(SessionState::Authenticated(user.clone()));

        tracing::info!(user.id = %user.id, role = ?user.role, "session established");
        Ok(user)
    }

    /// Terminates the session
    ///
    /// Local state is cleared before the network call, so the logout is
    /// effective immediately and unconditionally; the backend call is
    /// best-effort and its failure cannot restore the session. A no-op when
    /// there is no session to terminate.
    #[tracing::instrument(skip(self))]
    pub async fn logout(&self) -> Result<(), LogoutError> {
        let access_token = self.store.access_token();
        if access_token.is_none() && !self.has_refresh_token() {
            return Ok(());
        }

        self.store.clear().await;
        self.state.send_replace(SessionState::Anonymous);
        tracing::info!("session cleared");

        let mut req = self
            .client
            .post(self.logout_url.clone())
            .json(&serde_json::json!({}));
        if let Some(token) = &access_token {
            req = req.bearer_auth(token.as_str());
        }

        let resp = req.send().await.map_err(ApiError::RequestSend)?;
        if let Err(error) = resp.error_for_status_ref() {
            let status = resp.status();
            let body = resp.text().await.map_err(ApiError::BodyRead)?;
            tracing::debug!(
                response.status = status.as_u16(),
                "best-effort backend logout failed"
            );
            return Err(ApiError::ErrorWithBody {
                status,
                body,
                source: error,
            }
            .into());
        }
        Ok(())
    }

    /// Obtains a fresh token pair, coalescing concurrent callers onto a
    /// single in-flight episode
    ///
    /// The first caller performs the backend exchange; callers arriving
    /// while it is in flight await the same outcome. The manager never
    /// forces a logout on failure here; that policy belongs to the request
    /// interceptor.
    pub async fn refresh(&self) -> Result<AccessToken, RefreshError> {
        let episode = {
            let mut pending = self
                .pending_refresh
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match pending.as_ref() {
                Some(rx) => Episode::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *pending = Some(rx);
                    Episode::Leader(tx)
                }
            }
        };

        match episode {
            Episode::Follower(rx) => {
                tracing::debug!("refresh already in flight, awaiting its outcome");
                await_episode(rx).await
            }
            Episode::Leader(tx) => {
                let outcome = {
                    let _clear = ClearPending { manager: self };
                    self.perform_refresh().await
                };
                tx.send_replace(Some(outcome.clone()));
                outcome
            }
        }
    }

    #[tracing::instrument(err, skip(self))]
    async fn perform_refresh(&self) -> Result<AccessToken, RefreshError> {
        let refresh_token = self
            .store
            .refresh_token()
            .ok_or(RefreshError::NoRefreshToken)?;
        let generation = self.store.generation();

        tracing::debug!("requesting fresh tokens from backend");
        let resp = match self
            .token_exchange(
                self.refresh_url.clone(),
                &RefreshRequest {
                    refresh_token: &refresh_token,
                },
            )
            .await
        {
            Ok(resp) => resp,
            Err(ApiError::ErrorWithBody { status, body, .. }) if status.is_client_error() => {
                tracing::warn!(
                    response.status = status.as_u16(),
                    "backend rejected the refresh token"
                );
                return Err(RefreshError::Rejected { status, body });
            }
            Err(error) => return Err(error.into()),
        };

        let tokens = TokenSet::issue(
            resp.access_token,
            resp.refresh_token,
            resp.expires_in,
            &System,
        );
        let access_token = tokens.access_token().to_owned();

        if !self.store.set_tokens_if_current(tokens, generation).await {
            tracing::warn!("session was terminated mid-refresh, discarding new tokens");
            return Err(RefreshError::SessionRevoked);
        }

        tracing::info!("access token refreshed");
        Ok(access_token)
    }

    async fn token_exchange<B: serde::Serialize>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<TokenResponse, ApiError> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(ApiError::RequestSend)?;

        tracing::debug!(
            response.status = resp.status().as_u16(),
            "received token response from backend"
        );

        if let Err(error) = resp.error_for_status_ref() {
            let status = resp.status();
            let body = resp.text().await.map_err(ApiError::BodyRead)?;
            return Err(ApiError::ErrorWithBody {
                status,
                body,
                source: error,
            });
        }

        let bytes = resp.bytes().await.map_err(ApiError::BodyRead)?;
        let resp: TokenResponse = serde_json::from_slice(&bytes)?;

        tracing::trace!(
            token_type = resp.token_type.as_deref().unwrap_or("Bearer"),
            lifetime_ms = resp.expires_in.0,
            "received new tokens"
        );

        Ok(resp)
    }
}

async fn await_episode(mut rx: watch::Receiver<EpisodeOutcome>) -> Result<AccessToken, RefreshError> {
    match rx.wait_for(|outcome| outcome.is_some()).await {
        Ok(outcome) => outcome
            .clone()
            .unwrap_or(Err(RefreshError::Interrupted)),
        Err(_) => Err(RefreshError::Interrupted),
    }
}

/// Builds the session user from backend-issued facts only
///
/// When the login body carries no user record, identity falls back to the
/// claims of the backend-signed access token. The role is never invented
/// locally: absent from both the body and the claims, it stays `None`.
fn user_from_token(access_token: &AccessTokenRef, submitted_email: &EmailRef) -> SessionUser {
    let claims = jwt::decode_claims(access_token);
    let email = claims
        .as_ref()
        .and_then(|c| c.email.clone())
        .unwrap_or_else(|| submitted_email.to_owned());
    let id = claims
        .as_ref()
        .and_then(|c| c.sub.clone())
        .unwrap_or_else(|| email.as_str().to_owned());

    SessionUser {
        id,
        email,
        role: claims.and_then(|c| c.role),
        is_active: true,
        created_date: None,
        updated_date: None,
        created_by: None,
        updated_by: None,
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn same_endpoint(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
        && a.path() == b.path()
}
