//! Durable session storage
//!
//! The [`TokenStore`] owns the current credentials in memory and mirrors
//! them into an [`AsyncSessionCache`] so a session survives process
//! restarts. All four persisted values (`accessToken`, `refreshToken`,
//! `tokenExpiry`, `currentUser`) are written and cleared together; readers
//! never observe a token without its matching expiry or a user without its
//! tokens.

use std::{
    error, fmt, io,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;

use crate::braids::{AccessToken, RefreshToken};
use crate::clock::UnixMillis;
use crate::state::SessionUser;
use crate::tokens::TokenSet;

type CacheError = Box<dyn error::Error + Send + Sync + 'static>;

/// The full persisted session record
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    #[serde(flatten)]
    tokens: TokenSet,
    #[serde(default)]
    current_user: Option<SessionUser>,
}

impl SessionSnapshot {
    /// Bundles a token set with the user it belongs to
    pub fn new(tokens: TokenSet, current_user: Option<SessionUser>) -> Self {
        Self {
            tokens,
            current_user,
        }
    }

    /// The stored token set
    pub fn tokens(&self) -> &TokenSet {
        &self.tokens
    }

    /// The stored user record, if any
    pub fn current_user(&self) -> Option<&SessionUser> {
        self.current_user.as_ref()
    }

    pub(crate) fn clone_it(&self) -> Self {
        Self {
            tokens: self.tokens.clone_it(),
            current_user: self.current_user.clone(),
        }
    }
}

/// An asynchronous durable layer backing the token store
#[async_trait]
pub trait AsyncSessionCache: Send + Sync {
    /// Loads the persisted snapshot, if one exists
    async fn load(&mut self) -> Result<Option<SessionSnapshot>, CacheError>;

    /// Persists a snapshot, replacing any previous one
    async fn persist(&mut self, snapshot: &SessionSnapshot) -> Result<(), CacheError>;

    /// Removes any persisted snapshot
    async fn clear(&mut self) -> Result<(), CacheError>;
}

/// A session cache backed by a local file
#[derive(Debug)]
pub struct FileSessionCache {
    path: PathBuf,
}

impl FileSessionCache {
    /// Constructs a new file-backed session cache
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn read_snapshot(&self) -> Result<Option<SessionSnapshot>, io::Error> {
        use tokio::io::AsyncReadExt;

        let mut file = match OpenOptions::new().read(true).open(&self.path).await {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error),
        };
        let mut data = String::new();
        file.read_to_string(&mut data).await?;
        let snapshot = serde_json::from_str(&data)?;
        Ok(Some(snapshot))
    }

    async fn write_snapshot(&self, snapshot: &SessionSnapshot) -> Result<(), io::Error> {
        use tokio::io::AsyncWriteExt;

        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(&self.path).await?;
        let data = serde_json::to_string_pretty(&snapshot)?;
        file.write_all(data.as_bytes()).await?;
        Ok(())
    }

    async fn remove_snapshot(&self) -> Result<(), io::Error> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error),
        }
    }
}

#[async_trait]
impl AsyncSessionCache for FileSessionCache {
    async fn load(&mut self) -> Result<Option<SessionSnapshot>, CacheError> {
        Ok(self.read_snapshot().await?)
    }

    async fn persist(&mut self, snapshot: &SessionSnapshot) -> Result<(), CacheError> {
        Ok(self.write_snapshot(snapshot).await?)
    }

    async fn clear(&mut self) -> Result<(), CacheError> {
        Ok(self.remove_snapshot().await?)
    }
}

/// An in-memory session cache
///
/// Sessions stored here do not survive a restart; useful for tests and for
/// deployments that must not write credentials to disk.
#[derive(Default, Debug)]
pub struct InMemorySessionCache {
    snapshot: Option<SessionSnapshot>,
}

impl InMemorySessionCache {
    /// Constructs a new in-memory session cache
    pub const fn new() -> Self {
        Self { snapshot: None }
    }
}

#[async_trait]
impl AsyncSessionCache for InMemorySessionCache {
    async fn load(&mut self) -> Result<Option<SessionSnapshot>, CacheError> {
        Ok(self.snapshot.as_ref().map(SessionSnapshot::clone_it))
    }

    async fn persist(&mut self, snapshot: &SessionSnapshot) -> Result<(), CacheError> {
        self.snapshot = Some(snapshot.clone_it());
        Ok(())
    }

    async fn clear(&mut self) -> Result<(), CacheError> {
        self.snapshot = None;
        Ok(())
    }
}

/// Owns the current session credentials and their durable persistence
///
/// Writes replace the whole snapshot under a lock, so no reader can observe
/// a partial update. The generation counter is bumped on every clear; a
/// refresh that settles after a logout presents a stale generation and its
/// tokens are discarded rather than resurrecting the session.
pub struct TokenStore {
    current: Mutex<Option<SessionSnapshot>>,
    cache: tokio::sync::Mutex<Box<dyn AsyncSessionCache>>,
    generation: AtomicU64,
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenStore")
            .field("current", &self.lock_current())
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish()
    }
}

impl TokenStore {
    /// Constructs a token store over the given durable layer
    pub fn new(cache: impl AsyncSessionCache + 'static) -> Self {
        Self {
            current: Mutex::new(None),
            cache: tokio::sync::Mutex::new(Box::new(cache)),
            generation: AtomicU64::new(0),
        }
    }

    /// Constructs a token store with no durable persistence
    pub fn in_memory() -> Self {
        Self::new(InMemorySessionCache::new())
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<SessionSnapshot>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current access token, if any
    pub fn access_token(&self) -> Option<AccessToken> {
        self.lock_current()
            .as_ref()
            .map(|s| s.tokens().access_token().to_owned())
    }

    /// The current refresh token, if any
    pub fn refresh_token(&self) -> Option<RefreshToken> {
        self.lock_current()
            .as_ref()
            .map(|s| s.tokens().refresh_token().to_owned())
    }

    /// The current access token's computed expiry, if any
    pub fn token_expiry(&self) -> Option<UnixMillis> {
        self.lock_current().as_ref().map(|s| s.tokens().expiry())
    }

    /// The persisted user record, if any
    pub fn current_user(&self) -> Option<SessionUser> {
        self.lock_current()
            .as_ref()
            .and_then(|s| s.current_user().cloned())
    }

    /// The store's current generation; bumped on every clear
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Loads any persisted snapshot into memory and returns a copy
    pub async fn restore(&self) -> Option<SessionSnapshot> {
        let mut cache = self.cache.lock().await;
        match cache.load().await {
            Ok(Some(snapshot)) => {
                let copy = snapshot.clone_it();
                *self.lock_current() = Some(snapshot);
                Some(copy)
            }
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(
                    error = (&*error as &dyn error::Error),
                    "unable to load persisted session"
                );
                None
            }
        }
    }

    /// Replaces the stored session
    ///
    /// Passing `None` for `user` retains any previously stored user record,
    /// which is what a token refresh wants.
    pub async fn set_session(&self, tokens: TokenSet, user: Option<SessionUser>) {
        let mut cache = self.cache.lock().await;
        let snapshot = {
            let mut current = self.lock_current();
            let user = user.or_else(|| current.as_ref().and_then(|s| s.current_user().cloned()));
            let snapshot = SessionSnapshot::new(tokens, user);
            *current = Some(snapshot.clone_it());
            snapshot
        };
        if let Err(error) = cache.persist(&snapshot).await {
            tracing::warn!(
                error = (&*error as &dyn error::Error),
                "unable to persist session snapshot"
            );
        }
    }

    /// Replaces the stored tokens only if no clear has intervened since
    /// `generation` was observed
    ///
    /// Returns `false`, leaving the store untouched, when the session was
    /// terminated in the meantime.
    pub async fn set_tokens_if_current(&self, tokens: TokenSet, generation: u64) -> bool {
        let mut cache = self.cache.lock().await;
        let snapshot = {
            let mut current = self.lock_current();
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            let user = current.as_ref().and_then(|s| s.current_user().cloned());
            let snapshot = SessionSnapshot::new(tokens, user);
            *current = Some(snapshot.clone_it());
            snapshot
        };
        if let Err(error) = cache.persist(&snapshot).await {
            tracing::warn!(
                error = (&*error as &dyn error::Error),
                "unable to persist session snapshot"
            );
        }
        true
    }

    /// Removes the stored session from memory and from the durable layer
    pub async fn clear(&self) {
        let mut cache = self.cache.lock().await;
        {
            let mut current = self.lock_current();
            self.generation.fetch_add(1, Ordering::SeqCst);
            *current = None;
        }
        if let Err(error) = cache.clear().await {
            tracing::warn!(
                error = (&*error as &dyn error::Error),
                "unable to clear persisted session"
            );
        }
    }
}
