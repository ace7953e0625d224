//! # electrum-protocol
//!
//! Wire protocol implementation for Electrum JSON-RPC servers.
//!
//! This crate provides:
//! - Stream framing of raw bytes into complete JSON documents
//! - Request and batch encoding with deterministic key order
//! - Classification of inbound documents into responses and notifications
//! - Error types and protocol constants

pub mod codec;
pub mod error;
pub mod framer;
pub mod message;

pub use codec::{encode_line, make_batch, make_request, BatchEntry, BatchRequest, IdGenerator};
pub use error::ProtocolError;
pub use framer::{Frame, Framer, TextEncoding};
pub use message::{element_id, parse_id, InboundMessage, Response, RpcError};

/// JSON-RPC version string written into every request.
pub const JSONRPC_VERSION: &str = "2.0";

/// Default port for plain TCP Electrum servers.
pub const DEFAULT_TCP_PORT: u16 = 50001;

/// Default port for TLS Electrum servers.
pub const DEFAULT_TLS_PORT: u16 = 50002;

/// Maximum size of a single buffered JSON document (16 MiB).
pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;
