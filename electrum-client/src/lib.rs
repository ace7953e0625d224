//! # electrum-client
//!
//! Async client for Electrum JSON-RPC servers.
//!
//! This crate provides:
//! - Plain TCP and TLS transports with buffered socket settings
//! - Single and batched requests correlated by id
//! - Notification routing to callbacks or channels
//! - Connection lifecycle with per-connection request draining
//! - YAML and environment configuration

pub mod client;
pub mod config;
pub mod error;
pub mod listeners;
pub mod registry;
pub mod session;
pub mod stream;
pub mod tls;
pub mod transport;

pub use client::{BatchItem, Client, ConnectionState};
pub use config::{ClientConfig, ConfigError, PersistenceConfig, Protocol, SocketConfig, TlsOptions};
pub use error::ClientError;
pub use session::ErrorHook;
pub use transport::{Link, LinkHandle, Transport, TransportEvent};
