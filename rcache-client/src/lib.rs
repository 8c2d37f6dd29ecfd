//! # rcache-client
//!
//! Satellite side of the rcache replication engine: fetches compressed
//! cache entries from a master instead of querying the database directly.
//! A fetch either yields the entry's bytes or an explicit fallback signal
//! telling the caller to go to its own database.

pub mod client;
pub mod error;

pub use client::{ClientConfig, FetchOutcome, RemoteCacheClient};
pub use error::ClientError;
