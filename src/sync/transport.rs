use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::models::{AuthResponse, RefreshRequest, UserProfile};
use crate::config::ClientConfig;
use crate::error::{server_message, Result, SyncError};
use crate::storage::SessionStorage;

pub const REFRESH_PATH: &str = "/api/auth/refreshtoken";

/// A request as issued by the services, before credentials are attached
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    /// Whether a 401 should trigger the refresh-and-retry protocol
    pub refresh_on_unauthorized: bool,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
            refresh_on_unauthorized: true,
        }
    }

    pub fn post<B: Serialize>(path: impl Into<String>, body: &B) -> Result<Self> {
        Ok(Self {
            method: Method::POST,
            path: path.into(),
            body: Some(serde_json::to_value(body)?),
            refresh_on_unauthorized: true,
        })
    }

    pub fn post_empty(path: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: None,
            refresh_on_unauthorized: true,
        }
    }

    /// Credential endpoints: a 401 means bad credentials, not an expired token
    pub fn without_refresh(mut self) -> Self {
        self.refresh_on_unauthorized = false;
        self
    }
}

/// The request as it goes over the wire
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub method: Method,
    pub path: String,
    pub bearer: Option<String>,
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(SyncError::from)
    }

    fn message_or(&self, fallback: &str) -> String {
        server_message(&self.body).unwrap_or_else(|| fallback.to_string())
    }
}

/// Raw HTTP exchange. Implementations must not interpret status codes.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn execute(&self, request: &OutboundRequest) -> Result<ApiResponse>;
}

/// Production backend on top of `reqwest`
pub struct ReqwestBackend {
    client: Client,
    config: ClientConfig,
}

impl ReqwestBackend {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(&self, request: &OutboundRequest) -> Result<ApiResponse> {
        let url = self.config.api_url(&request.path);
        let mut builder = self.client.request(request.method.clone(), &url);

        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        debug!("{} {} -> {}", request.method, request.path, status);
        Ok(ApiResponse { status, body })
    }
}

/// Tokens obtained from a successful refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub profile: Option<UserProfile>,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<RefreshedTokens>>>;

#[derive(Default)]
struct RefreshSlot {
    generation: u64,
    inflight: Option<(u64, RefreshFuture)>,
}

/// Shared HTTP transport.
///
/// Attaches the stored access token to every request and, on a 401,
/// refreshes the token once and re-issues the request once. Concurrent
/// refreshes collapse into a single call that every waiter shares.
#[derive(Clone)]
pub struct TransportClient {
    backend: Arc<dyn HttpBackend>,
    storage: SessionStorage,
    refresh: Arc<Mutex<RefreshSlot>>,
}

impl TransportClient {
    pub fn new(backend: Arc<dyn HttpBackend>, storage: SessionStorage) -> Self {
        Self {
            backend,
            storage,
            refresh: Arc::new(Mutex::new(RefreshSlot::default())),
        }
    }

    pub fn storage(&self) -> &SessionStorage {
        &self.storage
    }

    /// Issue a request, returning the successful response or the mapped error
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        check_status(self.exchange(request).await?)
    }

    /// Issue a request through the refresh-and-retry protocol without
    /// interpreting the final status, except that a 401 after a refresh is
    /// terminal for the session.
    pub async fn exchange(&self, request: ApiRequest) -> Result<ApiResponse> {
        let token = self.storage.access_token();
        let response = self.dispatch(&request, token.clone()).await?;

        if response.status != 401 || !request.refresh_on_unauthorized {
            return Ok(response);
        }

        debug!("{} {} unauthorized, refreshing access token", request.method, request.path);

        // Another request may have refreshed while this one was in flight
        let fresh = match self.storage.access_token() {
            Some(current) if token.as_deref() != Some(current.as_str()) => current,
            _ => self.refresh_session(None).await?.access_token,
        };

        let retried = self.dispatch(&request, Some(fresh)).await?;
        if retried.status == 401 {
            warn!("{} {} rejected after token refresh, clearing session", request.method, request.path);
            self.storage.clear();
            return Err(SyncError::Auth(retried.message_or("session expired")));
        }

        Ok(retried)
    }

    /// Issue a request with an explicit credential, bypassing the stored
    /// token and the refresh protocol
    pub async fn send_with_bearer(&self, request: ApiRequest, bearer: Option<String>) -> Result<ApiResponse> {
        check_status(self.dispatch(&request, bearer).await?)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.send(ApiRequest::post(path, body)?).await?.json()
    }

    async fn dispatch(&self, request: &ApiRequest, bearer: Option<String>) -> Result<ApiResponse> {
        let outbound = OutboundRequest {
            method: request.method.clone(),
            path: request.path.clone(),
            bearer,
            body: request.body.clone(),
        };
        self.backend.execute(&outbound).await
    }

    /// Refresh the access token, joining a refresh already in flight.
    ///
    /// `refresh_token` overrides the stored one when starting a new refresh.
    /// Any failure clears the session.
    pub async fn refresh_session(&self, refresh_token: Option<String>) -> Result<RefreshedTokens> {
        let (generation, refresh) = {
            let mut slot = self.refresh.lock().unwrap_or_else(|p| p.into_inner());
            match &slot.inflight {
                Some((generation, refresh)) => {
                    debug!("Joining in-flight token refresh");
                    (*generation, refresh.clone())
                }
                None => {
                    slot.generation += 1;
                    let generation = slot.generation;
                    let refresh = refresh_tokens(self.backend.clone(), self.storage.clone(), refresh_token)
                        .boxed()
                        .shared();
                    slot.inflight = Some((generation, refresh.clone()));
                    (generation, refresh)
                }
            }
        };

        let outcome = refresh.await;

        let mut slot = self.refresh.lock().unwrap_or_else(|p| p.into_inner());
        if matches!(&slot.inflight, Some((current, _)) if *current == generation) {
            slot.inflight = None;
        }

        outcome
    }
}

/// Append one percent-encoded path segment to an API path
pub fn path_with_segment(prefix: &str, segment: &str) -> String {
    let fallback = || format!("{}/{}", prefix.trim_end_matches('/'), segment);
    let Ok(mut url) = url::Url::parse("http://localhost") else {
        return fallback();
    };
    match url.path_segments_mut() {
        Ok(mut segments) => {
            segments
                .pop_if_empty()
                .extend(prefix.split('/').filter(|s| !s.is_empty()))
                .push(segment);
        }
        Err(()) => return fallback(),
    }
    url.path().to_string()
}

fn check_status(response: ApiResponse) -> Result<ApiResponse> {
    match response.status {
        200..=299 => Ok(response),
        401 => Err(SyncError::Auth(response.message_or("unauthorized"))),
        status => Err(SyncError::Http {
            status,
            message: response.message_or("request failed"),
        }),
    }
}

async fn refresh_tokens(
    backend: Arc<dyn HttpBackend>,
    storage: SessionStorage,
    refresh_token: Option<String>,
) -> Result<RefreshedTokens> {
    let result = request_refresh(backend.as_ref(), &storage, refresh_token).await;
    match &result {
        Ok(tokens) => {
            storage.update_tokens(&tokens.access_token, Some(&tokens.refresh_token));
            info!("Access token refreshed");
        }
        Err(e) => {
            warn!("Token refresh failed, clearing session: {}", e);
            storage.clear();
        }
    }
    result
}

async fn request_refresh(
    backend: &dyn HttpBackend,
    storage: &SessionStorage,
    refresh_token: Option<String>,
) -> Result<RefreshedTokens> {
    let refresh_token = refresh_token
        .or_else(|| storage.refresh_token())
        .ok_or_else(|| SyncError::Auth("no refresh token available".to_string()))?;

    let outbound = OutboundRequest {
        method: Method::POST,
        path: REFRESH_PATH.to_string(),
        bearer: storage.access_token(),
        body: Some(serde_json::to_value(RefreshRequest {
            refresh_token: &refresh_token,
        })?),
    };

    let response = backend.execute(&outbound).await?;
    if !response.is_success() {
        return Err(SyncError::Auth(response.message_or("refresh token rejected")));
    }

    let auth: AuthResponse = response.json()?;
    let access_token = auth
        .access_token()
        .ok_or_else(|| SyncError::Decode("refresh response carries no access token".to_string()))?
        .to_string();

    Ok(RefreshedTokens {
        access_token,
        // Rotation is optional; keep the old refresh token otherwise
        refresh_token: auth.refresh_token().map(str::to_string).unwrap_or(refresh_token),
        token_type: auth.token_type(),
        profile: auth.profile(),
    })
}
