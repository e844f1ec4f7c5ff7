//! Connector tokens and OAuth challenge handling
//!
//! Authorization applies only to the network transports; stdio servers get
//! credentials through their environment.
//!
//! # Module Layout
//!
//! - [`token`]    -- token record, provider trait, refresh policy, connector
//!   host matching
//! - [`provider`] -- client-credentials provider for the connector platform
//! - [`oauth`]    -- single-shot OAuth completion signal

pub mod oauth;
pub mod provider;
pub mod token;
