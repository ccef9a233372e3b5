use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Branching conversations: a persistence server and a line-oriented client.
#[derive(Parser)]
#[command(version, about, long_about = None, author)]
pub struct Cli {
    /// Path to a TOML config file (defaults to ./.tangent/config.toml, then the user config)
    #[arg(long, env = "TANGENT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// Serve the conversation store over HTTP
    Serve {
        /// Address to listen on (overrides server.bind)
        #[arg(long)]
        bind: Option<SocketAddr>,
        /// JSON snapshot the store is loaded from and written back to
        #[arg(long, env = "TANGENT_DATA")]
        data: Option<PathBuf>,
        /// Keep everything in memory and write nothing
        #[arg(long, conflicts_with = "data")]
        ephemeral: bool,
    },
    /// Chat with the scripted persona through a running server
    Chat {
        /// Server base URL (overrides server.url)
        #[arg(long, env = "TANGENT_SERVER")]
        server: Option<String>,
        /// Resume this conversation instead of creating a new one
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Print the stored tree of one conversation, or list conversations
    Tree {
        /// JSON snapshot written by `tangent serve`
        #[arg(long, env = "TANGENT_DATA")]
        data: Option<PathBuf>,
        /// Conversation to print; lists all conversations when omitted
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Show the resolved configuration
    Config,
}
