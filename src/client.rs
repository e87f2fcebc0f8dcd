use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::error::{Result, SyncError};
use crate::storage::{SessionStorage, SessionStore};
use crate::sync::{
    AuthManager, ChatApi, ConnectionState, HttpBackend, MessageSync, PushConnectionManager, PushSettings,
    ReqwestBackend, TransportClient,
};

/// Everything a chat front end needs, wired together with one session store
pub struct ChatClient {
    config: ClientConfig,
    auth: AuthManager,
    api: ChatApi,
    push: Arc<PushConnectionManager>,
    sync: Arc<MessageSync>,
    live_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    pub fn new(config: ClientConfig, store: Arc<dyn SessionStore>) -> Result<Self> {
        let backend = Arc::new(ReqwestBackend::new(&config)?);
        Ok(Self::with_backend(config, store, backend, None))
    }

    /// Build on a custom HTTP backend, optionally scoped to one room
    pub fn with_backend(
        config: ClientConfig,
        store: Arc<dyn SessionStore>,
        backend: Arc<dyn HttpBackend>,
        room: Option<String>,
    ) -> Self {
        let transport = TransportClient::new(backend, SessionStorage::new(store));
        let auth = AuthManager::new(transport.clone());
        let api = ChatApi::new(transport);
        let push = Arc::new(PushConnectionManager::new(PushSettings::from_config(&config)));
        let sync = Arc::new(MessageSync::new(api.clone(), push.clone(), room));

        Self {
            config,
            auth,
            api,
            push,
            sync,
            live_task: Mutex::new(None),
        }
    }

    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    pub fn api(&self) -> &ChatApi {
        &self.api
    }

    pub fn messages(&self) -> &Arc<MessageSync> {
        &self.sync
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.push.subscribe_state()
    }

    /// Open the push channel with the current access token and start
    /// feeding live messages into the view
    pub async fn connect_live(&self) -> Result<()> {
        let token = self
            .auth
            .access_token()
            .ok_or_else(|| SyncError::Auth("not logged in".to_string()))?;

        let mut live_task = self.live_task.lock().await;
        if live_task.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("Live updates already running");
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(self.config.live_buffer.max(1));
        self.push.connect(token, tx);
        *live_task = Some(self.sync.clone().run_live(rx));
        info!("Live updates started");
        Ok(())
    }

    /// Close the push channel and stop the live consumer
    pub async fn shutdown(&self) {
        self.push.disconnect().await;
        if let Some(task) = self.live_task.lock().await.take() {
            // The worker owned the sender, so the consumer drains and exits
            let _ = task.await;
        }
        info!("Chat client shut down");
    }

    /// Log out locally and on the server, closing the push channel first
    pub async fn logout(&self) {
        self.shutdown().await;
        self.auth.logout().await;
    }
}
