//! Replication call statistics.
//!
//! Every request outcome — success or failure — is registered here. The
//! aggregation is Prometheus-backed and can be exposed over HTTP at
//! `/metrics`.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request as HttpRequest, Response as HttpResponse, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use rcache_protocol::{Reply, Request, HEADER_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Reply latency histogram buckets (in seconds).
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0];

/// Call-metrics aggregator for the replication engine.
#[derive(Clone)]
pub struct ReplicationStats {
    registry: Registry,
    /// Server-side calls by status and value origin.
    pub server_calls_total: CounterVec,
    /// Server-side calls by requested table.
    pub server_calls_by_table_total: CounterVec,
    /// Reply latency by status.
    pub reply_latency: HistogramVec,
    /// Total reply bytes shipped to clients.
    pub server_bytes_total: Counter,
    /// Client-side calls by master address.
    pub client_calls_total: CounterVec,
}

impl ReplicationStats {
    /// Creates a new stats instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let server_calls_total = CounterVec::new(
            Opts::new(
                "rcache_server_calls_total",
                "Replication requests served by status and value origin",
            ),
            &["status", "from"],
        )?;
        registry.register(Box::new(server_calls_total.clone()))?;

        let server_calls_by_table_total = CounterVec::new(
            Opts::new(
                "rcache_server_calls_by_table_total",
                "Replication requests served by table name",
            ),
            &["table"],
        )?;
        registry.register(Box::new(server_calls_by_table_total.clone()))?;

        let reply_latency = HistogramVec::new(
            HistogramOpts::new(
                "rcache_reply_latency_seconds",
                "Reply latency in seconds by status",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["status"],
        )?;
        registry.register(Box::new(reply_latency.clone()))?;

        let server_bytes_total = Counter::with_opts(Opts::new(
            "rcache_server_bytes_total",
            "Total reply bytes shipped to clients",
        ))?;
        registry.register(Box::new(server_bytes_total.clone()))?;

        let client_calls_total = CounterVec::new(
            Opts::new(
                "rcache_client_calls_total",
                "Replication requests issued by master address",
            ),
            &["server"],
        )?;
        registry.register(Box::new(client_calls_total.clone()))?;

        Ok(Self {
            registry,
            server_calls_total,
            server_calls_by_table_total,
            reply_latency,
            server_bytes_total,
            client_calls_total,
        })
    }

    /// Registers one served call, success or failure.
    pub fn register_server_call(
        &self,
        client: &str,
        data_type: &str,
        reply: &Reply,
        from_query: bool,
    ) {
        let status = reply.header.status.to_string();
        let from = if from_query { "query" } else { "cache" };

        self.server_calls_total
            .with_label_values(&[&status, from])
            .inc();
        self.server_calls_by_table_total
            .with_label_values(&[data_type])
            .inc();
        self.reply_latency
            .with_label_values(&[&status])
            .observe(reply.elapsed().as_secs_f64());
        self.server_bytes_total
            .inc_by((HEADER_SIZE + reply.header.payload_size as usize) as f64);

        tracing::trace!(
            client,
            table = data_type,
            status = %reply.header.status,
            from,
            "registered server call"
        );
    }

    /// Registers one issued call on the client side.
    pub fn register_client_call(&self, server: &str, request: &Request) {
        self.client_calls_total.with_label_values(&[server]).inc();
        tracing::trace!(server, table = %request.data_type, "registered client call");
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer).unwrap_or(());
        buffer
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP stats server, serving metrics at `/metrics`.
pub async fn run_stats_server(
    addr: SocketAddr,
    stats: Arc<ReplicationStats>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Stats server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let stats = stats.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let stats = stats.clone();
                                async move { handle_http_request(req, stats).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Stats connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Stats server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Stats server shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Handles an HTTP request to the stats server.
async fn handle_http_request(
    req: HttpRequest<hyper::body::Incoming>,
    stats: Arc<ReplicationStats>,
) -> Result<HttpResponse<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => {
            let body = stats.encode();
            HttpResponse::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .unwrap()
        }
        "/health" | "/healthz" => HttpResponse::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("OK")))
            .unwrap(),
        _ => HttpResponse::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .unwrap(),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcache_protocol::{Header, StatusType};

    #[test]
    fn test_register_server_call() {
        let stats = ReplicationStats::new().unwrap();

        let mut reply = Reply::new(1);
        reply.stock(StatusType::NotFound);
        stats.register_server_call("10.1.2.3", "NOSUCHTABLE", &reply, false);

        let encoded = String::from_utf8(stats.encode()).unwrap();
        assert!(encoded.contains("rcache_server_calls_total"));
        assert!(encoded.contains("RC_NOT_FOUND"));
        assert!(encoded.contains("NOSUCHTABLE"));
    }

    #[test]
    fn test_register_client_call() {
        let stats = ReplicationStats::new().unwrap();

        let request = Request::parse(
            Header::request(1, 3),
            {
                let req = Request {
                    header: Header::request(1, 3),
                    persistent: false,
                    baseline: "B1".to_string(),
                    data_type: "CURRENCY".to_string(),
                    historical: false,
                    database: "FUNC".to_string(),
                    key: Bytes::new(),
                };
                req.encode_payload().freeze()
            },
        )
        .unwrap();

        stats.register_client_call("master:7411", &request);
        let encoded = String::from_utf8(stats.encode()).unwrap();
        assert!(encoded.contains("rcache_client_calls_total"));
        assert!(encoded.contains("master:7411"));
    }

    #[test]
    fn test_latency_and_bytes_recorded() {
        let stats = ReplicationStats::new().unwrap();

        let mut reply = Reply::new(1);
        reply.stock(StatusType::CompressedValue);
        stats.register_server_call("10.1.2.3", "TAXCODE", &reply, true);

        let encoded = String::from_utf8(stats.encode()).unwrap();
        assert!(encoded.contains("rcache_reply_latency_seconds"));
        assert!(encoded.contains("rcache_server_bytes_total"));
        assert!(encoded.contains(r#"from="query""#));
    }
}
