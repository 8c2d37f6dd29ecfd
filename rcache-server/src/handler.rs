//! Request validation and dispatch.
//!
//! [`RequestHandler::handle`] is the whole master-side decision pipeline:
//! a stateless sequence of consistency checks where the first failing
//! check wins, followed by the cache fetch. Every outcome, success or
//! failure, produces exactly one status, is registered with the
//! statistics sink, and never propagates an error to the session.

use crate::config::ReplicationConfig;
use crate::currentdb::CurrentDatabase;
use crate::error::ServerError;
use crate::registry::{CacheRegistry, PoolCounts};
use crate::stats::ReplicationStats;
use bytes::Bytes;
use rcache_protocol::{Reply, Request, StatusType};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Everything the handler consults at runtime, constructed once at startup
/// by the embedding process and shared by all sessions.
pub struct ServerContext {
    /// Replication policy knobs.
    pub replication: ReplicationConfig,
    /// This build's baseline label.
    pub baseline: String,
    /// Host identity for the self-request guard.
    pub local_host: IpAddr,
    /// Table-name to cache-controller registry.
    pub registry: Arc<CacheRegistry>,
    /// Active-database registry.
    pub current_db: Arc<CurrentDatabase>,
    /// Live connection-pool view.
    pub pool: Arc<dyn PoolCounts>,
    /// Call-metrics sink.
    pub stats: Arc<ReplicationStats>,
}

/// Stateless validation-and-dispatch pipeline.
pub struct RequestHandler {
    context: Arc<ServerContext>,
}

impl RequestHandler {
    pub fn new(context: Arc<ServerContext>) -> Self {
        Self { context }
    }

    /// Produces the reply for one request.
    ///
    /// Always registers a statistics record, whatever the outcome.
    pub fn handle(&self, peer: SocketAddr, request: &Request) -> Reply {
        let mut reply = Reply::new(request.header.request_id);
        let from_query = self.run_pipeline(peer, request, &mut reply);

        self.context.stats.register_server_call(
            &peer.ip().to_string(),
            &request.data_type,
            &reply,
            from_query,
        );
        reply
    }

    /// Runs the ordered checks; returns whether the value came from a live
    /// query.
    fn run_pipeline(&self, peer: SocketAddr, request: &Request, reply: &mut Reply) -> bool {
        let cfg = &self.context.replication;

        // 1. Cache-update staleness.
        if let Some(interval) = cfg.cache_update_detection_interval() {
            let age = self.context.registry.cache_update_age();
            if age > interval {
                tracing::warn!(
                    age_secs = age.as_secs(),
                    "cache updates stalled, refusing replication"
                );
                reply.stock(StatusType::MasterCacheUpdateStopped);
                return false;
            }
        }

        // 2. Persistence-mode compatibility.
        if request.persistent != cfg.persistent_connections {
            reply.stock(StatusType::IncompatibleMode);
            return false;
        }

        // 3. Build baseline.
        if cfg.check_baseline && !request.baseline.eq_ignore_ascii_case(&self.context.baseline) {
            tracing::debug!(
                client_baseline = %request.baseline,
                server_baseline = %self.context.baseline,
                "baseline mismatch"
            );
            reply.stock(StatusType::BaselineMismatch);
            return false;
        }

        // 4. Self-request guard.
        if is_self_request(peer.ip(), self.context.local_host) {
            tracing::warn!(peer = %peer, "refusing replication request from own host");
            reply.stock(StatusType::RequestFromSameHost);
            return false;
        }

        // 5. Table resolution.
        let Some(controller) = self.context.registry.lookup(&request.data_type) else {
            reply.stock(StatusType::NotFound);
            return false;
        };

        // 6. Schema/DAO version. The reply carries the server's
        // authoritative version so the client can react without a second
        // round trip.
        let server_version = controller.dao_version();
        if server_version != request.header.dao_version {
            reply.stock(StatusType::DaoVersionMismatch);
            reply.header.dao_version = server_version;
            return false;
        }

        // 7. Historical-mode capability.
        if request.historical && !cfg.historical_enabled {
            reply.stock(StatusType::MasterNonhistorical);
            return false;
        }

        // 8. Database identity.
        let (database, in_transition) = self
            .context
            .current_db
            .current(request.historical, self.context.pool.as_ref());
        if in_transition {
            tracing::debug!(database = %database, "multiple databases active");
        }
        if !cfg.ignore_database_mismatch && !database.eq_ignore_ascii_case(&request.database) {
            tracing::debug!(
                client_database = %request.database,
                server_database = %database,
                "database mismatch"
            );
            reply.stock(StatusType::DatabaseMismatch);
            return false;
        }

        // 9/10. Fetch, with every failure contained here.
        match controller.get_compressed(&request.key) {
            Ok(result) => {
                match result.status {
                    StatusType::CompressedValue => match result.deflated {
                        Some(deflated) => {
                            reply.header.status = StatusType::CompressedValue;
                            reply.set_deflated(deflated);
                        }
                        None => {
                            tracing::error!(
                                table = %request.data_type,
                                "controller reported a compressed value without a payload"
                            );
                            reply.stock(StatusType::ServerError);
                        }
                    },
                    StatusType::UncompressedValue => {
                        reply.header.status = StatusType::UncompressedValue;
                        reply.set_payload(Bytes::from(result.payload));
                    }
                    other => {
                        tracing::debug!(
                            table = %request.data_type,
                            status = %other,
                            "cache returned a non-value status"
                        );
                        reply.stock(other);
                    }
                }
                result.from_query
            }
            Err(ServerError::Fetch(message)) => {
                tracing::error!(
                    client = %peer,
                    table = %request.data_type,
                    error = %message,
                    "cache fetch failed"
                );
                reply.stock(StatusType::ServerError);
                false
            }
            Err(e) => {
                tracing::error!(
                    client = %peer,
                    table = %request.data_type,
                    error = %e,
                    "unexpected error during fetch"
                );
                reply.stock(StatusType::UnknownError);
                false
            }
        }
    }
}

/// A node must not "replicate" from itself over its own host address.
/// Loopback peers are distinct local processes and stay allowed.
fn is_self_request(peer: IpAddr, local_host: IpAddr) -> bool {
    !peer.is_loopback() && peer == local_host
}
