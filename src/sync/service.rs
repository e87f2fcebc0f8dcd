use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::api::ChatApi;
use super::models::Message;
use super::view::MessageView;
use super::websocket::{PushChannel, SEND_DESTINATION};
use crate::error::{Result, SyncError};

/// Which path a send went out on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPath {
    /// Published on the push channel; the server echo will show up live
    Push,
    /// Posted over HTTP, followed by a history reload
    HttpFallback,
}

/// Keeps the message view in step with the server.
///
/// History loads and live deliveries both merge into one view keyed by
/// message id. The live channel has exactly one consumer, started with
/// [`MessageSync::run_live`].
pub struct MessageSync {
    api: ChatApi,
    push: Arc<dyn PushChannel>,
    room: Option<String>,
    view: Arc<RwLock<MessageView>>,
    last_error: Arc<RwLock<Option<String>>>,
}

impl MessageSync {
    pub fn new(api: ChatApi, push: Arc<dyn PushChannel>, room: Option<String>) -> Self {
        Self {
            api,
            push,
            room,
            view: Arc::new(RwLock::new(MessageView::new())),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    /// Load history and merge it under any live messages already applied
    pub async fn activate(&self) -> Result<()> {
        let history = self.load_history().await?;
        info!("Loaded {} messages", history.len());
        self.view.write().await.seed(history);
        Ok(())
    }

    /// Reload history and merge it into the view
    pub async fn reload(&self) -> Result<()> {
        let history = self.load_history().await?;
        debug!("Reconciling {} messages from history", history.len());
        self.view.write().await.reconcile(history);
        Ok(())
    }

    /// Consume live deliveries until the push side drops the channel
    pub fn run_live(self: Arc<Self>, mut live: mpsc::Receiver<Message>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = live.recv().await {
                let id = message.id;
                if self.view.write().await.apply_live(message) {
                    debug!("Applied live message {}", id);
                } else {
                    debug!("Skipped duplicate live message {}", id);
                }
            }
            debug!("Live message channel closed");
        })
    }

    /// Snapshot of the current view
    pub async fn messages(&self) -> Vec<Message> {
        self.view.read().await.messages().to_vec()
    }

    /// Most recent load or send failure, for inline display
    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    /// Send a message, over push when connected and over HTTP otherwise.
    ///
    /// Nothing is inserted locally on the push path; the message appears
    /// when the server echoes it back.
    pub async fn send_message(&self, content: &str) -> Result<SendPath> {
        if content.trim().is_empty() {
            return Err(SyncError::validation("message content is empty"));
        }

        if self.push.state().is_connected() {
            match self.push.send(SEND_DESTINATION, &json!({ "content": content })) {
                Ok(()) => {
                    debug!("Message published on push channel");
                    self.set_error(None).await;
                    return Ok(SendPath::Push);
                }
                Err(SyncError::NotConnected) => {
                    warn!("Push channel dropped before send, falling back to HTTP");
                }
                Err(e) => {
                    self.set_error(Some(e.to_string())).await;
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.api.send_message(content).await {
            error!("HTTP send failed: {}", e);
            self.set_error(Some(e.to_string())).await;
            return Err(e);
        }
        info!("Message sent over HTTP");
        self.set_error(None).await;

        // The send went through; a failed reload only leaves the view stale
        if let Err(e) = self.reload().await {
            warn!("Reload after HTTP send failed: {}", e);
        }

        Ok(SendPath::HttpFallback)
    }

    async fn load_history(&self) -> Result<Vec<Message>> {
        match self.api.get_history(self.room.as_deref()).await {
            Ok(history) => Ok(history),
            Err(e) => {
                error!("Failed to load history: {}", e);
                self.set_error(Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn set_error(&self, message: Option<String>) {
        *self.last_error.write().await = message;
    }
}
