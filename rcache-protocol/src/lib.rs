//! # rcache-protocol
//!
//! Wire protocol for the rcache replication engine.
//!
//! This crate provides:
//! - Fixed-layout binary header encode/decode
//! - The replication status taxonomy
//! - Request/Reply message types with payload parsing and buffer assembly
//! - Deflate compression helpers for cache payloads

pub mod compress;
pub mod error;
pub mod header;
pub mod message;

pub use compress::{deflate, inflate};
pub use error::ProtocolError;
pub use header::{Header, StatusType, HEADER_SIZE};
pub use message::{Deflated, Reply, Request};

/// Default port for an rcache master.
pub const DEFAULT_PORT: u16 = 7411;

/// Maximum request/reply payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
