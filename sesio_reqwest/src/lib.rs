//! Middleware that makes bearer-token attachment and 401 recovery
//! transparent to every caller of the backend API
//!
//! Include the [`SessionMiddleware`] in a
//! [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware) stack
//! and requests aimed at the session manager's API are sent with the
//! current access token attached. When such a request comes back `401`,
//! the middleware asks the manager for a refresh — concurrent failures
//! coalesce onto the manager's single in-flight episode — and resends the
//! original request exactly once with the new token. A definitive refresh
//! rejection forces a local logout and surfaces the refresh error, not the
//! original 401.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! use sesio::{SessionManager, TokenStore};
//! use sesio_reqwest::SessionMiddleware;
//!
//! # fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let api_url: reqwest::Url = "http://localhost:8078/api/v1".parse()?;
//! let session = Arc::new(SessionManager::new(
//!     Client::new(),
//!     api_url,
//!     TokenStore::in_memory(),
//! )?);
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(SessionMiddleware::new(session))
//!     .build();
//! # Ok(()) }
//! ```
//!
//! The scoping predicate decides which requests get the token at all. By
//! default that is [`ApiHostMatch`] derived from the manager's API URL, so
//! a fixed discovery or search service on another host or port is never
//! decorated. Predicates compose, so stricter requirements can be layered
//! on:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use sesio::{SessionManager, TokenStore};
//! use predicates::prelude::PredicateBooleanExt;
//! use sesio_reqwest::{ApiHostMatch, HttpsOnly, SessionMiddleware};
//!
//! # fn demo(session: Arc<SessionManager>) {
//! SessionMiddleware::new(session)
//!     .with_predicate(HttpsOnly.and(ApiHostMatch::new("example.com", Some(443))));
//! # }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response, StatusCode};
use reqwest_middleware::{Middleware, Next, Result};
use sesio::{AccessTokenRef, SessionManager};

/// A middleware that attaches the current access token to
/// authorization-scoped requests and drives the bounded
/// refresh-and-retry protocol on 401
#[derive(Clone, Debug)]
pub struct SessionMiddleware<P = ApiHostMatch> {
    session: Arc<SessionManager>,
    predicate: P,
}

impl SessionMiddleware<ApiHostMatch> {
    /// Constructs the middleware, scoped to the host and port of the
    /// session manager's API URL
    pub fn new(session: Arc<SessionManager>) -> Self {
        let predicate = ApiHostMatch::from_url(session.api_url());
        Self { session, predicate }
    }

    /// Replaces the default scoping predicate with a custom one
    pub fn with_predicate<P>(self, predicate: P) -> SessionMiddleware<P> {
        SessionMiddleware {
            session: self.session,
            predicate,
        }
    }
}

fn bearer_header(token: &AccessTokenRef) -> header::HeaderValue {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());
    let mut value =
        header::HeaderValue::from_maybe_shared(header_value).expect("only valid header bytes");
    value.set_sensitive(true);
    value
}

#[async_trait::async_trait]
impl<P> Middleware for SessionMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) {
            return next.run(req, extensions).await;
        }

        if let Some(token) = self.session.access_token() {
            req.headers_mut()
                .entry(header::AUTHORIZATION)
                .or_insert_with(|| bearer_header(&token));
        }

        // Auth traffic is exempt from the retry protocol, and a streaming
        // body cannot be replayed. `None` here means "never retry".
        let retry_req = if self.session.is_auth_endpoint(req.url()) {
            None
        } else {
            req.try_clone()
        };

        let response = next.clone().run(req, extensions).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(mut retry_req) = retry_req else {
            return Ok(response);
        };

        if !self.session.has_refresh_token() {
            tracing::debug!("got 401 with no refresh token available, passing it through");
            return Ok(response);
        }

        match self.session.refresh().await {
            Ok(token) => {
                tracing::debug!("retrying request with the refreshed access token");
                retry_req
                    .headers_mut()
                    .insert(header::AUTHORIZATION, bearer_header(&token));
                next.run(retry_req, extensions).await
            }
            Err(error) => {
                if error.is_rejection() {
                    {
                        let error_dyn: &dyn std::error::Error = &error;
                        tracing::warn!(error = error_dyn, "refresh rejected, forcing logout");
                    }
                    if let Err(logout_error) = self.session.logout().await {
                        let logout_error_dyn: &dyn std::error::Error = &logout_error;
                        tracing::debug!(
                            error = logout_error_dyn,
                            "best-effort backend logout failed"
                        );
                    }
                }
                Err(reqwest_middleware::Error::Middleware(error.into()))
            }
        }
    }
}

/// Matches requests aimed at a specific host and port
///
/// Host alone is not enough when several services share a hostname on
/// different ports; the default instance takes both from the session
/// manager's API URL.
#[derive(Clone, Debug)]
pub struct ApiHostMatch {
    host: String,
    port: Option<u16>,
}

impl ApiHostMatch {
    /// Constructs a predicate from an explicit host and port
    pub fn new<S>(host: S, port: Option<u16>) -> Self
    where
        S: ToString,
    {
        Self {
            host: host.to_string(),
            port,
        }
    }

    /// Constructs a predicate scoped to the host and port of `url`
    pub fn from_url(url: &reqwest::Url) -> Self {
        Self {
            host: url.host_str().unwrap_or_default().to_owned(),
            port: url.port_or_known_default(),
        }
    }
}

impl Predicate<Request> for ApiHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(self.host.as_str())
            && req.url().port_or_known_default() == self.port
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "host",
                    req.url()
                        .host_str()
                        .unwrap_or("<value not valid utf-8>")
                        .to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for ApiHostMatch {}
impl fmt::Display for ApiHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host == {}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

/// Only attach an access token if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "scheme",
                    req.url().scheme().to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use reqwest::Client;
    use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
    use sesio::clock::{DurationMillis, System};
    use sesio::{
        AccessToken, RefreshError, RefreshToken, SessionState, TokenSet, TokenStore,
    };
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn live_jwt() -> String {
        let exp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 3_600;
        let head = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD
            .encode(serde_json::json!({"sub": "42", "email": "a@b.com", "exp": exp}).to_string());
        format!("{head}.{payload}.sig")
    }

    async fn session_with_tokens(
        server: &MockServer,
        access: &str,
        refresh: &str,
    ) -> Arc<SessionManager> {
        let store = TokenStore::in_memory();
        store
            .set_session(
                TokenSet::issue(
                    AccessToken::from(access.to_owned()),
                    RefreshToken::from(refresh.to_owned()),
                    DurationMillis(3_600_000),
                    &System,
                ),
                None,
            )
            .await;

        let api_url: reqwest::Url = format!("{}/api/v1", server.uri()).parse().unwrap();
        Arc::new(SessionManager::new(Client::new(), api_url, store).unwrap())
    }

    fn client_for(session: Arc<SessionManager>) -> ClientWithMiddleware {
        ClientBuilder::new(Client::default())
            .with(SessionMiddleware::new(session))
            .build()
    }

    async fn mount_refresh(server: &MockServer, old_refresh: &str, access: &str, expected: u64) {
        Mock::given(method("POST"))
            .and(path("/api/v1/auth/refresh"))
            .and(body_json(serde_json::json!({"refreshToken": old_refresh})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(100))
                    .set_body_json(serde_json::json!({
                        "accessToken": access,
                        "refreshToken": "r2",
                        "tokenType": "Bearer",
                        "expiresIn": 3_600_000u64,
                    })),
            )
            .expect(expected)
            .mount(server)
            .await;
    }

    mod when_the_request_targets_the_api {
        use super::*;

        #[tokio::test]
        async fn the_current_token_is_attached() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/v1/shows"))
                .and(header("authorization", "Bearer t1"))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;

            let session = session_with_tokens(&server, "t1", "r1").await;
            let client = client_for(session);

            let resp = client
                .get(format!("{}/api/v1/shows", server.uri()))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            server.verify().await;
        }

        #[tokio::test]
        async fn an_explicit_authorization_header_wins() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/v1/shows"))
                .and(header("authorization", "Bearer overridden"))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;

            let session = session_with_tokens(&server, "t1", "r1").await;
            let client = client_for(session);

            let resp = client
                .get(format!("{}/api/v1/shows", server.uri()))
                .bearer_auth("overridden")
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            server.verify().await;
        }

        #[tokio::test]
        async fn non_401_errors_pass_through_untouched() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/v1/shows"))
                .respond_with(ResponseTemplate::new(500))
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/api/v1/auth/refresh"))
                .respond_with(ResponseTemplate::new(200))
                .expect(0)
                .mount(&server)
                .await;

            let session = session_with_tokens(&server, "t1", "r1").await;
            let client = client_for(session);

            let resp = client
                .get(format!("{}/api/v1/shows", server.uri()))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
            server.verify().await;
        }
    }

    mod when_the_request_targets_another_service {
        use super::*;

        #[tokio::test]
        async fn no_token_is_attached() {
            let api = MockServer::start().await;
            let discovery = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200))
                .mount(&discovery)
                .await;

            let session = session_with_tokens(&api, "t1", "r1").await;
            let client = client_for(session);

            let resp = client
                .get(format!("{}/search", discovery.uri()))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);

            let requests = discovery.received_requests().await.unwrap();
            assert_eq!(requests.len(), 1);
            assert!(requests[0].headers.get("authorization").is_none());
        }
    }

    mod when_a_protected_request_receives_401 {
        use super::*;

        #[tokio::test]
        async fn it_is_retried_once_with_the_refreshed_token() {
            let server = MockServer::start().await;
            let t2 = live_jwt();
            Mock::given(method("GET"))
                .and(path("/api/v1/shows"))
                .and(header("authorization", "Bearer t1"))
                .respond_with(ResponseTemplate::new(401))
                .expect(1)
                .mount(&server)
                .await;
            mount_refresh(&server, "r1", &t2, 1).await;
            Mock::given(method("GET"))
                .and(path("/api/v1/shows"))
                .and(header("authorization", format!("Bearer {t2}").as_str()))
                .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
                .expect(1)
                .mount(&server)
                .await;

            let session = session_with_tokens(&server, "t1", "r1").await;
            let client = client_for(Arc::clone(&session));

            let resp = client
                .get(format!("{}/api/v1/shows", server.uri()))
                .send()
                .await
                .unwrap();

            // The caller sees the retried response, not the 401.
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(resp.text().await.unwrap(), "ok");
            assert_eq!(session.access_token().unwrap().as_str(), t2);
            server.verify().await;
        }

        #[tokio::test]
        async fn without_a_refresh_token_the_401_passes_through() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/v1/shows"))
                .respond_with(ResponseTemplate::new(401))
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/api/v1/auth/refresh"))
                .respond_with(ResponseTemplate::new(200))
                .expect(0)
                .mount(&server)
                .await;

            let api_url: reqwest::Url = format!("{}/api/v1", server.uri()).parse().unwrap();
            let session = Arc::new(
                SessionManager::new(Client::new(), api_url, TokenStore::in_memory()).unwrap(),
            );
            let client = client_for(session);

            let resp = client
                .get(format!("{}/api/v1/shows", server.uri()))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            server.verify().await;
        }

        #[tokio::test]
        async fn a_rejected_refresh_forces_logout_and_surfaces_the_refresh_error() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/v1/shows"))
                .respond_with(ResponseTemplate::new(401))
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/api/v1/auth/refresh"))
                .respond_with(ResponseTemplate::new(401))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/api/v1/auth/logout"))
                .respond_with(ResponseTemplate::new(200))
                .mount(&server)
                .await;

            let session = session_with_tokens(&server, "t1", "r1").await;
            let client = client_for(Arc::clone(&session));

            let error = client
                .get(format!("{}/api/v1/shows", server.uri()))
                .send()
                .await
                .unwrap_err();

            match error {
                reqwest_middleware::Error::Middleware(inner) => {
                    let refresh_error = inner.downcast_ref::<RefreshError>().unwrap();
                    assert!(matches!(refresh_error, RefreshError::Rejected { .. }));
                }
                other => panic!("expected a middleware error, got {other:?}"),
            }

            assert!(!session.is_authenticated());
            assert!(session.access_token().is_none());
            assert!(!session.has_refresh_token());
            assert_eq!(session.state(), SessionState::Anonymous);
            server.verify().await;
        }

        #[tokio::test]
        async fn concurrent_401s_share_a_single_refresh() {
            let server = MockServer::start().await;
            let t2 = live_jwt();
            Mock::given(method("GET"))
                .and(path("/api/v1/shows"))
                .and(header("authorization", "Bearer t1"))
                .respond_with(ResponseTemplate::new(401))
                .expect(2)
                .mount(&server)
                .await;
            mount_refresh(&server, "r1", &t2, 1).await;
            Mock::given(method("GET"))
                .and(path("/api/v1/shows"))
                .and(header("authorization", format!("Bearer {t2}").as_str()))
                .respond_with(ResponseTemplate::new(200))
                .expect(2)
                .mount(&server)
                .await;

            let session = session_with_tokens(&server, "t1", "r1").await;
            let client = client_for(session);

            let url = format!("{}/api/v1/shows", server.uri());
            let (first, second) =
                tokio::join!(client.get(&url).send(), client.get(&url).send());

            assert_eq!(first.unwrap().status(), StatusCode::OK);
            assert_eq!(second.unwrap().status(), StatusCode::OK);
            server.verify().await;
        }
    }

    mod when_the_request_targets_an_auth_endpoint {
        use super::*;

        #[tokio::test]
        async fn a_401_is_never_retried() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/api/v1/auth/login"))
                .respond_with(ResponseTemplate::new(401))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/api/v1/auth/refresh"))
                .respond_with(ResponseTemplate::new(200))
                .expect(0)
                .mount(&server)
                .await;

            let session = session_with_tokens(&server, "t1", "r1").await;
            let client = client_for(session);

            let resp = client
                .post(format!("{}/api/v1/auth/login", server.uri()))
                .json(&serde_json::json!({"email": "a@b.com", "password": "wrong"}))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            server.verify().await;
        }
    }

    mod scoping_predicates {
        use super::*;

        #[test]
        fn api_host_match_requires_host_and_port() {
            let predicate = ApiHostMatch::new("localhost", Some(8078));

            let same = Request::new(
                reqwest::Method::GET,
                "http://localhost:8078/api/v1/shows".parse().unwrap(),
            );
            assert!(predicate.eval(&same));

            let other_port = Request::new(
                reqwest::Method::GET,
                "http://localhost:8077/api/v1/shows".parse().unwrap(),
            );
            assert!(!predicate.eval(&other_port));

            let other_host = Request::new(
                reqwest::Method::GET,
                "http://example.com:8078/".parse().unwrap(),
            );
            assert!(!predicate.eval(&other_host));
        }

        #[test]
        fn https_only_matches_scheme() {
            let https =
                Request::new(reqwest::Method::GET, "https://example.com".parse().unwrap());
            assert!(HttpsOnly.eval(&https));

            let http = Request::new(reqwest::Method::GET, "http://example.com".parse().unwrap());
            assert!(!HttpsOnly.eval(&http));
        }
    }
}
