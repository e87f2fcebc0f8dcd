use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use schat::storage::{FileStore, MemoryStore, SessionStore};
use schat::sync::ConnectionState;
use schat::{ChatClient, ClientConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("schat=info")),
        )
        .init();

    info!("Starting SChat client...");

    let config = ClientConfig::from_env().context("failed to load configuration")?;

    let store: Arc<dyn SessionStore> = match &config.data_dir {
        Some(dir) => Arc::new(FileStore::open(dir).context("failed to open session store")?),
        None => {
            warn!("No data directory available, session will not persist");
            Arc::new(MemoryStore::new())
        }
    };

    let client = ChatClient::new(config, store)?;

    if client.auth().init().is_none() {
        let username = std::env::var("SCHAT_USERNAME").context("SCHAT_USERNAME is not set and no session is stored")?;
        let password = std::env::var("SCHAT_PASSWORD").context("SCHAT_PASSWORD is not set")?;
        client.auth().login(&username, &password).await?;
    }

    client.messages().activate().await?;
    for message in client.messages().messages().await {
        println!("[{}] {}: {}", message.timestamp.format("%H:%M:%S"), message.sender, message.content);
    }

    client.connect_live().await?;

    let mut state = client.connection_state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow();
            match current {
                ConnectionState::Connected => info!("Live updates connected"),
                ConnectionState::Errored | ConnectionState::Disconnected => warn!("Live updates {:?}", current),
                ConnectionState::Connecting => {}
            }
        }
    });

    // Each stdin line is sent as a message; an empty line prints the view
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            for message in client.messages().messages().await {
                println!("[{}] {}: {}", message.timestamp.format("%H:%M:%S"), message.sender, message.content);
            }
            continue;
        }
        match client.messages().send_message(&line).await {
            Ok(path) => info!("Sent via {:?}", path),
            Err(e) => eprintln!("Send failed: {}", e),
        }
    }

    client.shutdown().await;
    Ok(())
}
