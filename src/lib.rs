//! mcpconn - MCP tool-server connection manager
//!
//! Establishes, supervises and recovers connections to MCP tool servers over
//! stdio, WebSocket, Server-Sent Events and streamable HTTP, and exposes a
//! uniform RPC surface over all of them.
//!
//! # Architecture
//!
//! - `mcp`: transports, JSON-RPC client, connection state machine, registry
//! - `config`: configuration loading, placeholder substitution, validation
//! - `error`: error taxonomy and result alias
//! - `logging`: tracing subscriber setup
//! - `cli` / `commands`: command-line interface
//!
//! # Example
//!
//! ```no_run
//! use mcpconn::{Config, ConnectionRegistry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config/mcpconn.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     let registry = ConnectionRegistry::from_config(&config)?;
//!     let outcomes = registry.connect_global(&config.servers).await;
//!     for (server, outcome) in outcomes {
//!         println!("{server}: {outcome:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod mcp;

// Re-export commonly used types
pub use config::{Config, ServerConfig};
pub use error::{McpConnError, Result};
pub use mcp::{Connection, ConnectionEvent, ConnectionRegistry, ConnectionState};
