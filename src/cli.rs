use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Copilot Gateway: OpenAI-compatible chat completions over a GitHub Copilot login
#[derive(Parser)]
#[command(name = "copilot-gateway", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server (default)
    Serve {
        /// Address to bind
        #[arg(short, long, env = "COPILOT_GATEWAY_LISTEN")]
        listen: Option<SocketAddr>,
        /// Token persistence file
        #[arg(long, env = "COPILOT_GATEWAY_TOKEN_FILE")]
        token_file: Option<PathBuf>,
    },

    /// Show which persisted credentials still hold a usable Copilot token
    Status {
        /// Token persistence file
        #[arg(long, env = "COPILOT_GATEWAY_TOKEN_FILE")]
        token_file: Option<PathBuf>,
        /// Do not contact GitHub to verify a credential
        #[arg(long)]
        offline: bool,
    },
}
