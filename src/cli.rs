//! Command-line interface definition for mcpconn
//!
//! This module defines the CLI structure using clap's derive API. Every
//! command connects to the configured tool servers through the connection
//! registry and reports per-server outcomes.

use clap::{Parser, Subcommand};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/mcpconn.yaml";

/// mcpconn - MCP tool-server connection manager
///
/// Connects to the tool servers listed in the configuration file over
/// stdio, WebSocket, SSE or streamable HTTP and queries them.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcpconn")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "MCPCONN_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: Option<String>,

    /// Connect as this user (per-user connections, `{{USER_ID}}` substitution)
    #[arg(short, long, env = "MCPCONN_USER")]
    pub user: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Override the connect timeout, in seconds
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for mcpconn
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Connect to every server and show its state
    Servers,

    /// List tools
    Tools {
        /// Only this server
        #[arg(short, long)]
        server: Option<String>,
    },

    /// List resources
    Resources {
        /// Only this server
        #[arg(short, long)]
        server: Option<String>,
    },

    /// List prompts
    Prompts {
        /// Only this server
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Check liveness of each server
    Ping {
        /// Only this server
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Invoke a tool
    Call {
        /// Server offering the tool
        #[arg(short, long)]
        server: String,

        /// Tool name
        #[arg(short, long)]
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Configuration path, falling back to [`DEFAULT_CONFIG_PATH`].
    pub fn config_path(&self) -> &str {
        self.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH)
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some(DEFAULT_CONFIG_PATH.to_string()),
            user: None,
            json_logs: false,
            verbose: false,
            connect_timeout: None,
            command: Commands::Servers,
        }
    }
}
