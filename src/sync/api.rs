use tracing::debug;

use super::models::{Message, MessageResponse, SendMessageRequest};
use super::transport::{path_with_segment, TransportClient};
use crate::error::Result;

pub const MESSAGES_PATH: &str = "/api/chat/messages";
pub const HISTORY_PATH: &str = "/api/chat/history";
pub const SEND_PATH: &str = "/api/chat/send";

/// Chat REST endpoints
#[derive(Clone)]
pub struct ChatApi {
    transport: TransportClient,
}

impl ChatApi {
    pub fn new(transport: TransportClient) -> Self {
        Self { transport }
    }

    /// All messages visible to the user
    pub async fn get_messages(&self) -> Result<Vec<Message>> {
        let messages: Vec<Message> = self.transport.get_json(MESSAGES_PATH).await?;
        debug!("Fetched {} messages", messages.len());
        Ok(messages)
    }

    /// Message history, optionally scoped to one room
    pub async fn get_history(&self, room_id: Option<&str>) -> Result<Vec<Message>> {
        let path = match room_id {
            Some(room) => path_with_segment(HISTORY_PATH, room),
            None => HISTORY_PATH.to_string(),
        };
        let messages: Vec<Message> = self.transport.get_json(&path).await?;
        debug!("Fetched {} history messages from {}", messages.len(), path);
        Ok(messages)
    }

    /// Send over HTTP, used when the push channel is down
    pub async fn send_message(&self, content: &str) -> Result<MessageResponse> {
        self.transport
            .post_json(SEND_PATH, &SendMessageRequest { content })
            .await
    }
}
