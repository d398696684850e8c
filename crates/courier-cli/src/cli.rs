//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::ConfigOverrides;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path (defaults to ./courier.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Signed-in user id
    #[arg(short, long)]
    pub user: Option<String>,

    /// Server event stream URL
    #[arg(long)]
    pub server: Option<String>,

    /// Bearer token for the server
    #[arg(long, env = "COURIER_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Data directory for local peer histories
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start interactive chat mode
    Chat,
    /// Send a single message and wait for the server to confirm it
    Send {
        /// Conversation id
        #[arg(short, long)]
        conversation: String,
        /// Recipient user id
        #[arg(short, long)]
        to: String,
        /// Message text
        message: String,
    },
    /// Connect, sync and print the conversation list
    Status,
    /// Print an example configuration file
    Config {
        /// Save the effective configuration to this path instead
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

impl Cli {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            config_file: self.config.clone(),
            user_id: self.user.clone(),
            ws_url: self.server.clone(),
            token: self.token.clone(),
            data_dir: self.data_dir.clone(),
            verbose: self.verbose,
        }
    }
}
