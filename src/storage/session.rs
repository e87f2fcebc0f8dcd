use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::SessionStore;
use crate::sync::models::{Session, UserProfile, DEFAULT_TOKEN_TYPE};

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const USER_KEY: &str = "user";

const SESSION_KEYS: [&str; 3] = [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY];

/// Typed session persistence over any [`SessionStore`].
///
/// Token writes and reads of the token pair go through one lock, so a
/// reader never observes a half-written session.
#[derive(Clone)]
pub struct SessionStorage {
    store: Arc<dyn SessionStore>,
    txn: Arc<Mutex<()>>,
}

impl SessionStorage {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            txn: Arc::new(Mutex::new(())),
        }
    }

    fn with_txn<T>(&self, f: impl FnOnce(&dyn SessionStore) -> T) -> T {
        // A poisoned lock only means another writer panicked; the store itself is still usable
        let _guard = self.txn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(self.store.as_ref())
    }

    pub fn access_token(&self) -> Option<String> {
        self.with_txn(|store| store.get(ACCESS_TOKEN_KEY))
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.with_txn(|store| store.get(REFRESH_TOKEN_KEY))
    }

    /// Access and refresh token, only when both are present
    pub fn tokens(&self) -> Option<(String, String)> {
        self.with_txn(|store| Some((store.get(ACCESS_TOKEN_KEY)?, store.get(REFRESH_TOKEN_KEY)?)))
    }

    pub fn user(&self) -> Option<UserProfile> {
        let raw = self.with_txn(|store| store.get(USER_KEY))?;
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!("Discarding unreadable user record: {}", e);
                None
            }
        }
    }

    /// Rebuild the persisted session, if a complete one exists.
    ///
    /// The token type is not one of the persisted keys, so a restored
    /// session always reports `Bearer`; the transport only sends bearer
    /// credentials anyway.
    pub fn session(&self) -> Option<Session> {
        let (access_token, refresh_token) = self.tokens()?;
        let user = self.user()?;
        Some(Session::from_parts(
            access_token,
            refresh_token,
            DEFAULT_TOKEN_TYPE.to_string(),
            &user,
        ))
    }

    /// Persist a whole session: both tokens and the user record
    pub fn save_session(&self, session: &Session) {
        let user = match serde_json::to_string(&session.profile()) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize user record: {}", e);
                return;
            }
        };

        self.with_txn(|store| {
            store.put_all(&[
                (ACCESS_TOKEN_KEY, session.access_token.as_str()),
                (REFRESH_TOKEN_KEY, session.refresh_token.as_str()),
                (USER_KEY, user.as_str()),
            ])
        });
        debug!("Session saved for user {}", session.username);
    }

    /// Store a refreshed access token, rotating the refresh token if the server issued one
    pub fn update_tokens(&self, access_token: &str, refresh_token: Option<&str>) {
        self.with_txn(|store| match refresh_token {
            Some(refresh) => store.put_all(&[(ACCESS_TOKEN_KEY, access_token), (REFRESH_TOKEN_KEY, refresh)]),
            None => store.put(ACCESS_TOKEN_KEY, access_token),
        });
    }

    /// Remove every session key
    pub fn clear(&self) {
        self.with_txn(|store| store.clear(&SESSION_KEYS));
        debug!("Session cleared");
    }
}
