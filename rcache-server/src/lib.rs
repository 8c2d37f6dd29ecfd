//! # rcache-server
//!
//! Master side of the rcache replication engine: a TCP server that lets
//! satellite pricing nodes fetch compressed cache entries instead of
//! hitting the database themselves.
//!
//! The engine is embedded, not standalone. The host process registers a
//! [`CacheControl`] per replicated table, supplies a [`PoolCounts`] view
//! of its database connection pool, keeps [`CurrentDatabase`] up to date,
//! and runs a [`ReplicationServer`].

pub mod config;
pub mod currentdb;
pub mod error;
pub mod handler;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;

pub use config::{Config, MetricsConfig, NetworkConfig, ReplicationConfig};
pub use currentdb::CurrentDatabase;
pub use error::ServerError;
pub use handler::{RequestHandler, ServerContext};
pub use registry::{CacheControl, CacheRegistry, FetchResult, PoolCounts};
pub use server::{ReplicationServer, ServerStats};
pub use session::{Session, SessionState};
pub use stats::{run_stats_server, ReplicationStats};
