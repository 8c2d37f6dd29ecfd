//! Cache controller registry.
//!
//! The replication engine never owns cache storage. The embedding process
//! registers one [`CacheControl`] per replicated table and stamps the
//! registry heartbeat on every cache refresh cycle; the engine only looks
//! controllers up by name and asks them for compressed entries.

use crate::error::ServerError;
use dashmap::DashMap;
use parking_lot::Mutex;
use rcache_protocol::{Deflated, StatusType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of a cache fetch.
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Status to report: a value status, or whatever the cache decided.
    pub status: StatusType,
    /// Compressed entry, when `status` is `RC_COMPRESSED_VALUE`.
    pub deflated: Option<Deflated>,
    /// Raw entry, when `status` is `RC_UNCOMPRESSED_VALUE` (small or
    /// incompressible entries skip the deflate pass).
    pub payload: Vec<u8>,
    /// Whether the value came from a live database query rather than a
    /// cache hit.
    pub from_query: bool,
}

impl FetchResult {
    /// A compressed-value result.
    pub fn compressed(deflated: Deflated, from_query: bool) -> Self {
        Self {
            status: StatusType::CompressedValue,
            deflated: Some(deflated),
            payload: Vec::new(),
            from_query,
        }
    }

    /// An uncompressed-value result.
    pub fn uncompressed(payload: Vec<u8>, from_query: bool) -> Self {
        Self {
            status: StatusType::UncompressedValue,
            deflated: None,
            payload,
            from_query,
        }
    }

    /// A valueless result carrying a pass-through status.
    pub fn status(status: StatusType) -> Self {
        Self {
            status,
            deflated: None,
            payload: Vec::new(),
            from_query: false,
        }
    }
}

/// One cache controller per replicated table.
pub trait CacheControl: Send + Sync {
    /// The table's schema (DAO) version; must match the client's for
    /// binary compatibility of cached entries.
    fn dao_version(&self) -> u32;

    /// Produces the entry for an opaque cache key, compressed when
    /// worthwhile.
    fn get_compressed(&self, key: &[u8]) -> Result<FetchResult, ServerError>;
}

/// Live connection-pool view: active connection counts per database name.
pub trait PoolCounts: Send + Sync {
    fn active_connections_by_database(&self) -> HashMap<String, i64>;
}

/// Name-to-controller registry with a cache-refresh heartbeat.
pub struct CacheRegistry {
    /// Keys are stored uppercased; lookups are case-insensitive.
    controllers: DashMap<String, Arc<dyn CacheControl>>,
    /// Stamped by the embedding cache loader on every refresh cycle.
    last_cache_update: Mutex<Instant>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self {
            controllers: DashMap::new(),
            last_cache_update: Mutex::new(Instant::now()),
        }
    }

    /// Registers a controller under a table name.
    pub fn register(&self, name: impl Into<String>, controller: Arc<dyn CacheControl>) {
        self.controllers
            .insert(name.into().to_uppercase(), controller);
    }

    /// Looks up a controller by table name, case-insensitively.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn CacheControl>> {
        self.controllers
            .get(&name.to_uppercase())
            .map(|entry| entry.value().clone())
    }

    /// Returns the registered table names.
    pub fn names(&self) -> Vec<String> {
        self.controllers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Records a cache refresh heartbeat.
    pub fn record_cache_update(&self) {
        *self.last_cache_update.lock() = Instant::now();
    }

    /// Age of the most recent cache refresh heartbeat.
    pub fn cache_update_age(&self) -> Duration {
        self.last_cache_update.lock().elapsed()
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct StaticControl {
        version: u32,
    }

    impl CacheControl for StaticControl {
        fn dao_version(&self) -> u32 {
            self.version
        }

        fn get_compressed(&self, _key: &[u8]) -> Result<FetchResult, ServerError> {
            Ok(FetchResult::compressed(
                Deflated {
                    bytes: Bytes::from_static(b"x"),
                    inflated_size: 1,
                },
                false,
            ))
        }
    }

    #[test]
    fn test_lookup_case_insensitive() {
        let registry = CacheRegistry::new();
        registry.register("TaxCode", Arc::new(StaticControl { version: 3 }));

        assert!(registry.lookup("TAXCODE").is_some());
        assert!(registry.lookup("taxcode").is_some());
        assert!(registry.lookup("TaxCode").is_some());
        assert!(registry.lookup("FARECLASS").is_none());

        assert_eq!(registry.lookup("taxcode").unwrap().dao_version(), 3);
    }

    #[test]
    fn test_names_uppercased() {
        let registry = CacheRegistry::new();
        registry.register("currency", Arc::new(StaticControl { version: 1 }));
        assert_eq!(registry.names(), vec!["CURRENCY".to_string()]);
    }

    #[test]
    fn test_heartbeat_resets_age() {
        let registry = CacheRegistry::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(registry.cache_update_age() >= Duration::from_millis(20));

        registry.record_cache_update();
        assert!(registry.cache_update_age() < Duration::from_millis(20));
    }
}
