//! Client-side session and message synchronization for the SChat service.
//!
//! [`client::ChatClient`] wires the pieces together: persisted session
//! storage, an HTTP transport that refreshes expired tokens, the auth
//! manager, the STOMP push connection and the message sync core.

pub mod client;
pub mod config;
pub mod error;
pub mod storage;
pub mod sync;

pub use client::ChatClient;
pub use config::ClientConfig;
pub use error::{Result, SyncError};
