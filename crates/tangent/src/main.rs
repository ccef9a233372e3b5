use clap::Parser;
use eyre::{Result, eyre};
use tracing::debug;
use url::Url;

use tangent::cli::{Cli, Commands};
use tangent::commands::{
    Command, chat::ChatCommand, config::ShowConfigCommand, serve::ServeCommand, tree::TreeCommand,
};
use tangent_core::config::load_config;
use tangent_core::utils::paths::AppPaths;

#[tokio::main]
async fn main() -> Result<()> {
    // Install color-eyre for better error reports
    color_eyre::install()?;

    let cli = Cli::parse();

    // Load .env file if it exists
    tangent::cli::config::load_env()?;

    let loaded = load_config(cli.config.as_deref()).await?;

    // Held for the life of the process so buffered file logs get flushed
    let _log_guard = tangent_core::utils::tracing::init_tracing(&loaded.config.logging)?;
    debug!(source = ?loaded.source, "Configuration loaded");

    match cli.command {
        Commands::Serve {
            bind,
            data,
            ephemeral,
        } => {
            let data = if ephemeral {
                None
            } else {
                Some(data.unwrap_or_else(AppPaths::server_snapshot))
            };
            ServeCommand {
                bind: bind.unwrap_or(loaded.config.server.bind),
                data,
            }
            .execute()
            .await
        }
        Commands::Chat {
            server,
            conversation,
        } => {
            let server = match server {
                Some(url) => {
                    Url::parse(&url).map_err(|e| eyre!("Invalid server URL '{}': {}", url, e))?
                }
                None => loaded.config.server_url()?,
            };
            ChatCommand {
                server,
                conversation,
                config: loaded.config,
            }
            .execute()
            .await
        }
        Commands::Tree { data, conversation } => {
            TreeCommand {
                data: data.unwrap_or_else(AppPaths::server_snapshot),
                conversation,
            }
            .execute()
            .await
        }
        Commands::Config => ShowConfigCommand { loaded }.execute().await,
    }
}
