//! MCP tool-server connections
//!
//! The client offers protocol revision **2025-03-26** and accepts any
//! version in `types::SUPPORTED_PROTOCOL_VERSIONS` selected by the server.
//!
//! # Module Layout
//!
//! - `types`      -- JSON-RPC primitives and the MCP messages used here
//! - `client`     -- transport-agnostic async JSON-RPC 2.0 client
//! - `protocol`   -- initialize handshake and typed list/call/ping session
//! - `transport`  -- `Transport` trait, factory and the four adapters
//! - `auth`       -- connector tokens, refresh policy and the OAuth signal
//! - `events`     -- connection states and lifecycle events
//! - `connection` -- the supervised `Connection` state machine
//! - `registry`   -- global and per-user connection registry

pub mod auth;
pub mod client;
pub mod connection;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod types;

pub use connection::{Connection, ConnectionDeps, ConnectionOptions};
pub use events::{ConnectionEvent, ConnectionState, OAuthRequiredEvent};
pub use registry::{ConnectionRegistry, RegistryEvent};
