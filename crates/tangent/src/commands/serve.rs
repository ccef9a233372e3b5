use async_trait::async_trait;
use eyre::{Result, eyre};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::Command;
use crate::server::router;
use tangent_core::api::InMemoryConversationStore;

pub struct ServeCommand {
    pub bind: SocketAddr,
    /// `None` keeps the store in memory only.
    pub data: Option<PathBuf>,
}

#[async_trait]
impl Command for ServeCommand {
    async fn execute(&self) -> Result<()> {
        let store = match &self.data {
            Some(path) => InMemoryConversationStore::open(path.clone())
                .await
                .map_err(|e| eyre!("Failed to open {}: {}", path.display(), e))?,
            None => InMemoryConversationStore::new(),
        };

        let listener = tokio::net::TcpListener::bind(self.bind)
            .await
            .map_err(|e| eyre!("Failed to bind {}: {}", self.bind, e))?;
        let addr = listener.local_addr()?;

        info!(%addr, data = ?self.data, "Starting conversation server");
        let mut stdout = std::io::stdout();
        writeln!(stdout, "Server listening on http://{addr}")?;
        writeln!(stdout, "Press Ctrl+C to shutdown")?;

        axum::serve(listener, router(Arc::new(store)))
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutdown signal received");
            })
            .await?;

        info!("Server shutdown complete");
        Ok(())
    }
}
