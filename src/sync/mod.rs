pub mod api;
pub mod auth;
pub mod models;
pub mod service;
pub mod stomp;
pub mod transport;
pub mod view;
pub mod websocket;

pub use api::ChatApi;
pub use auth::AuthManager;
pub use models::{Message, RegisterProfile, Session, UserProfile};
pub use service::{MessageSync, SendPath};
pub use transport::{HttpBackend, ReqwestBackend, TransportClient};
pub use view::MessageView;
pub use websocket::{ConnectionState, PushChannel, PushConnectionManager, PushSettings};
