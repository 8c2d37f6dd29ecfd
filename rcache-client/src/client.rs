//! Replication client.
//!
//! A [`RemoteCacheClient`] speaks the rcache wire protocol to one master.
//! Every fetch is a single request/reply exchange; in persistent mode the
//! connection is reused across fetches, otherwise each fetch dials, talks,
//! and hangs up. Any failed status is surfaced as a [`FetchOutcome::Fallback`]
//! so the caller can decide to query its own database instead.

use crate::error::ClientError;
use bytes::Bytes;
use rcache_protocol::{inflate, Header, Request, StatusType, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Master address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Per-exchange timeout.
    pub request_timeout: Duration,
    /// Keep the connection open across fetches.
    pub persistent: bool,
    /// This build's baseline label, sent with every request.
    pub baseline: String,
    /// This node's current database identity, sent with every request.
    pub database: String,
    /// Request historical ("as of" a past date) data.
    pub historical: bool,
}

impl ClientConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            persistent: true,
            baseline: String::new(),
            database: String::new(),
            historical: false,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_baseline(mut self, baseline: impl Into<String>) -> Self {
        self.baseline = baseline.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_historical(mut self, historical: bool) -> Self {
        self.historical = historical;
        self
    }
}

/// Outcome of one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The master produced the cache entry, already inflated.
    Value(Bytes),
    /// The master declined; the caller should fall back to its own
    /// database.
    Fallback {
        /// The status the master reported.
        status: StatusType,
        /// The master's DAO version, meaningful on
        /// `RC_DAO_VERSION_MISMATCH`.
        server_dao_version: u32,
    },
}

impl FetchOutcome {
    pub fn is_value(&self) -> bool {
        matches!(self, FetchOutcome::Value(_))
    }
}

/// Client for fetching cache entries from an rcache master.
pub struct RemoteCacheClient {
    config: ClientConfig,
    stream: Mutex<Option<TcpStream>>,
    next_request_id: AtomicU64,
}

impl RemoteCacheClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            stream: Mutex::new(None),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Dials the master eagerly. Optional: `fetch` connects on demand.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.dial().await?);
        }
        Ok(())
    }

    /// Returns whether a connection is currently open.
    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Closes the connection, if open.
    pub async fn close(&self) {
        let mut guard = self.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            let _ = stream.shutdown().await;
        }
    }

    /// Fetches one cache entry from the master.
    ///
    /// On a value status the returned bytes are the entry, inflated if the
    /// master sent it compressed. Any non-value status becomes a
    /// [`FetchOutcome::Fallback`]. I/O and protocol failures drop the
    /// connection so the next fetch redials.
    pub async fn fetch(
        &self,
        data_type: &str,
        dao_version: u32,
        key: &[u8],
    ) -> Result<FetchOutcome, ClientError> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.dial().await?);
        }
        let stream = guard.as_mut().ok_or(ClientError::NotConnected)?;

        let request = self.build_request(data_type, dao_version, key);
        tracing::debug!(
            server = %self.config.addr,
            request_id = request.header.request_id,
            table = data_type,
            "fetching"
        );

        let result = timeout(self.config.request_timeout, exchange(stream, &request))
            .await
            .unwrap_or(Err(ClientError::Timeout));

        match result {
            Ok(outcome) => {
                if !self.config.persistent {
                    if let Some(mut stream) = guard.take() {
                        let _ = stream.shutdown().await;
                    }
                }
                Ok(outcome)
            }
            Err(e) => {
                // The stream may hold a half-read reply; never reuse it.
                *guard = None;
                Err(e)
            }
        }
    }

    async fn dial(&self) -> Result<TcpStream, ClientError> {
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(self.config.addr))
            .await
            .map_err(|_| ClientError::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn build_request(&self, data_type: &str, dao_version: u32, key: &[u8]) -> Request {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        Request {
            header: Header::request(request_id, dao_version),
            persistent: self.config.persistent,
            baseline: self.config.baseline.clone(),
            data_type: data_type.to_string(),
            historical: self.config.historical,
            database: self.config.database.clone(),
            key: Bytes::copy_from_slice(key),
        }
    }
}

/// One request/reply exchange over an open stream.
async fn exchange(stream: &mut TcpStream, request: &Request) -> Result<FetchOutcome, ClientError> {
    let payload = request.encode_payload();
    let mut header = request.header;
    header.payload_size = payload.len() as u32;

    let wire = header.encode_to_vec();
    stream.write_all(&wire).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;

    let mut header_buf = [0u8; HEADER_SIZE];
    let n = stream.read(&mut header_buf[..1]).await?;
    if n == 0 {
        return Err(ClientError::ConnectionClosed);
    }
    stream.read_exact(&mut header_buf[1..]).await?;
    let reply_header = Header::decode(&header_buf)?;

    if reply_header.request_id != request.header.request_id {
        return Err(ClientError::RequestIdMismatch {
            expected: request.header.request_id,
            actual: reply_header.request_id,
        });
    }
    if reply_header.payload_size > MAX_PAYLOAD_SIZE {
        return Err(rcache_protocol::ProtocolError::PayloadTooLarge {
            size: reply_header.payload_size,
            max: MAX_PAYLOAD_SIZE,
        }
        .into());
    }

    let mut payload = vec![0u8; reply_header.payload_size as usize];
    stream.read_exact(&mut payload).await?;

    match reply_header.status {
        StatusType::CompressedValue => {
            let inflated = inflate(&payload, reply_header.inflated_size)?;
            Ok(FetchOutcome::Value(Bytes::from(inflated)))
        }
        StatusType::UncompressedValue => Ok(FetchOutcome::Value(Bytes::from(payload))),
        status => {
            tracing::debug!(
                request_id = reply_header.request_id,
                status = %status,
                "master declined, falling back"
            );
            Ok(FetchOutcome::Fallback {
                status,
                server_dao_version: reply_header.dao_version,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcache_protocol::{deflate, Deflated, Reply};
    use tokio::net::TcpListener;

    fn test_config(addr: SocketAddr) -> ClientConfig {
        ClientConfig::new(addr)
            .with_baseline("ATSEV2.2024.01")
            .with_database("FUNC")
            .with_persistent(false)
            .with_request_timeout(Duration::from_secs(5))
    }

    /// One-shot stub master: reads a full request off the socket and
    /// answers with whatever the closure produces.
    async fn stub_master<F>(make_reply: F) -> SocketAddr
    where
        F: FnOnce(Request) -> Reply + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut header_buf = [0u8; HEADER_SIZE];
            stream.read_exact(&mut header_buf).await.unwrap();
            let header = Header::decode(&header_buf).unwrap();
            let mut payload = vec![0u8; header.payload_size as usize];
            stream.read_exact(&mut payload).await.unwrap();
            let request = Request::parse(header, Bytes::from(payload)).unwrap();

            let reply = make_reply(request);
            let (buffers, _) = reply.to_buffers();
            for buffer in &buffers {
                stream.write_all(buffer).await.unwrap();
            }
            stream.flush().await.unwrap();
        });

        addr
    }

    #[test]
    fn test_build_request_fields_and_monotonic_ids() {
        let client = RemoteCacheClient::new(
            test_config("127.0.0.1:7411".parse().unwrap()).with_historical(true),
        );

        let first = client.build_request("TAXCODE", 3, b"nation=US");
        let second = client.build_request("CURRENCY", 4, b"cur=EUR");

        assert_eq!(first.header.request_id, 1);
        assert_eq!(second.header.request_id, 2);
        assert_eq!(first.header.dao_version, 3);
        assert_eq!(first.baseline, "ATSEV2.2024.01");
        assert_eq!(first.database, "FUNC");
        assert!(!first.persistent);
        assert!(first.historical);
        assert_eq!(first.key.as_ref(), b"nation=US");
    }

    #[tokio::test]
    async fn test_fetch_inflates_compressed_value() {
        let entry = b"TAXCODE US1 row data".to_vec();
        let deflated = deflate(&entry).unwrap();
        let inflated_size = entry.len() as u32;

        let addr = stub_master(move |request| {
            let mut reply = Reply::new(request.header.request_id);
            reply.header.status = StatusType::CompressedValue;
            reply.set_deflated(Deflated {
                bytes: Bytes::from(deflated),
                inflated_size,
            });
            reply
        })
        .await;

        let client = RemoteCacheClient::new(test_config(addr));
        let outcome = client.fetch("TAXCODE", 3, b"nation=US").await.unwrap();

        assert_eq!(outcome, FetchOutcome::Value(Bytes::from(entry)));
        // Non-persistent: the connection is gone after the exchange.
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_fetch_fallback_carries_server_version() {
        let addr = stub_master(|request| {
            let mut reply = Reply::new(request.header.request_id);
            reply.stock(StatusType::DaoVersionMismatch);
            reply.header.dao_version = 7;
            reply
        })
        .await;

        let client = RemoteCacheClient::new(test_config(addr));
        let outcome = client.fetch("TAXCODE", 3, b"nation=US").await.unwrap();

        assert_eq!(
            outcome,
            FetchOutcome::Fallback {
                status: StatusType::DaoVersionMismatch,
                server_dao_version: 7,
            }
        );
        assert!(!outcome.is_value());
    }

    #[tokio::test]
    async fn test_mismatched_correlation_id_rejected() {
        let addr = stub_master(|_| {
            let mut reply = Reply::new(999);
            reply.stock(StatusType::NotFound);
            reply
        })
        .await;

        let client = RemoteCacheClient::new(test_config(addr));
        let result = client.fetch("TAXCODE", 3, b"nation=US").await;

        assert!(matches!(
            result,
            Err(ClientError::RequestIdMismatch {
                expected: 1,
                actual: 999
            })
        ));
    }

    #[tokio::test]
    async fn test_server_hangup_is_connection_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let client = RemoteCacheClient::new(test_config(addr));
        let result = client.fetch("TAXCODE", 3, b"x").await;
        assert!(matches!(
            result,
            Err(ClientError::ConnectionClosed) | Err(ClientError::Io(_))
        ));
        assert!(!client.is_connected().await);
    }
}
