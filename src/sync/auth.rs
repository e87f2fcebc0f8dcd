use tracing::{debug, info, warn};

use super::models::{AuthResponse, LoginRequest, RegisterProfile, ServerAck, Session, UserProfile};
use super::transport::{path_with_segment, ApiRequest, TransportClient};
use crate::error::{field_errors, server_message, Result, SyncError};

pub const LOGIN_PATH: &str = "/api/auth/login";
pub const REGISTER_PATH: &str = "/api/auth/register";
pub const LOGOUT_PATH: &str = "/api/auth/logout";
pub const PROFILE_PATH: &str = "/api/user/profile";

/// Login, registration and token lifecycle on top of the shared transport
#[derive(Clone)]
pub struct AuthManager {
    transport: TransportClient,
}

impl AuthManager {
    pub fn new(transport: TransportClient) -> Self {
        Self { transport }
    }

    /// Restore a persisted session at startup.
    ///
    /// Leftovers of a partial session are cleared so the store never holds
    /// one token without the other.
    pub fn init(&self) -> Option<Session> {
        let storage = self.transport.storage();
        match storage.session() {
            Some(session) => {
                info!("Restored session for {}", session.username);
                Some(session)
            }
            None => {
                if storage.access_token().is_some() || storage.refresh_token().is_some() || storage.user().is_some() {
                    warn!("Discarding incomplete stored session");
                    storage.clear();
                } else {
                    debug!("No stored session found");
                }
                None
            }
        }
    }

    /// Sign in and persist the resulting session
    pub async fn login(&self, username: &str, password: &str) -> Result<Session> {
        let request = ApiRequest::post(LOGIN_PATH, &LoginRequest { username, password })?.without_refresh();

        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(SyncError::Http { status, message }) if (400..500).contains(&status) => {
                return Err(SyncError::Auth(message));
            }
            Err(e) => return Err(e),
        };

        let auth: AuthResponse = response.json()?;
        let session = session_from_login(&auth)?;

        self.transport.storage().save_session(&session);
        info!("Logged in as {}", session.username);
        Ok(session)
    }

    /// Create an account. Does not sign in.
    pub async fn register(&self, profile: &RegisterProfile) -> Result<ServerAck> {
        let request = ApiRequest::post(REGISTER_PATH, profile)?.without_refresh();
        let response = self.transport.exchange(request).await?;

        match response.status {
            200..=299 => {
                info!("Registered account {}", profile.username);
                Ok(ServerAck {
                    message: server_message(&response.body).unwrap_or_else(|| "registered".to_string()),
                })
            }
            400 | 409 | 422 => Err(SyncError::Validation {
                message: server_message(&response.body).unwrap_or_else(|| "registration rejected".to_string()),
                fields: field_errors(&response.body),
            }),
            status => Err(SyncError::Http {
                status,
                message: server_message(&response.body).unwrap_or_else(|| "registration failed".to_string()),
            }),
        }
    }

    /// Exchange a refresh token for a new access token.
    ///
    /// Shares any refresh already in flight. On failure the session is gone.
    pub async fn refresh(&self, refresh_token: &str) -> Result<Session> {
        let tokens = self.transport.refresh_session(Some(refresh_token.to_string())).await?;
        let storage = self.transport.storage();

        let user = tokens
            .profile
            .clone()
            .or_else(|| storage.user())
            .ok_or_else(|| SyncError::Auth("no user record for refreshed session".to_string()))?;

        let session = Session::from_parts(tokens.access_token, tokens.refresh_token, tokens.token_type, &user);
        if tokens.profile.is_some() {
            storage.save_session(&session);
        }
        Ok(session)
    }

    /// Drop the local session and tell the server, best effort
    pub async fn logout(&self) {
        let storage = self.transport.storage();
        let token = storage.access_token();
        storage.clear();
        info!("Logged out");

        if token.is_some() {
            // Storage is already empty, so the token has to be passed explicitly
            let request = ApiRequest::post_empty(LOGOUT_PATH);
            if let Err(e) = self.transport.send_with_bearer(request, token).await {
                debug!("Server-side logout failed: {}", e);
            }
        }
    }

    /// Local check only; the token may still be expired server-side
    pub fn is_authenticated(&self) -> bool {
        self.transport.storage().user().is_some()
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.transport.storage().user()
    }

    pub fn access_token(&self) -> Option<String> {
        self.transport.storage().access_token()
    }

    /// Profile of the signed-in user as the server sees it
    pub async fn profile(&self) -> Result<UserProfile> {
        self.transport.get_json(PROFILE_PATH).await
    }

    pub async fn profile_of(&self, username: &str) -> Result<UserProfile> {
        self.transport.get_json(&path_with_segment(PROFILE_PATH, username)).await
    }
}

fn session_from_login(auth: &AuthResponse) -> Result<Session> {
    let access_token = auth
        .access_token()
        .ok_or_else(|| SyncError::Auth("login response carries no access token".to_string()))?;
    let refresh_token = auth
        .refresh_token()
        .ok_or_else(|| SyncError::Decode("login response carries no refresh token".to_string()))?;
    let user = auth
        .profile()
        .ok_or_else(|| SyncError::Decode("login response carries no user profile".to_string()))?;

    Ok(Session::from_parts(
        access_token.to_string(),
        refresh_token.to_string(),
        auth.token_type(),
        &user,
    ))
}
