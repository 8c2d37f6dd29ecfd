//! Per-connection session state machine.
//!
//! A session owns one client connection and drives it through a strict
//! request/reply cycle: read a header, read the payload it announces,
//! produce exactly one reply, write it, and either wait for the next
//! request (persistent mode) or close. Three timeout classes bound each
//! phase: an idle timeout while waiting for the first header byte, a
//! receive timeout once a request has started arriving, and a send
//! timeout while the reply drains.

use crate::config::NetworkConfig;
use crate::error::ServerError;
use crate::handler::RequestHandler;
use bytes::Bytes;
use rcache_protocol::{Header, Request, HEADER_SIZE};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::timeout;
use uuid::Uuid;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the first byte of the next request.
    Idle,
    /// A request has started arriving; reading the header.
    ReadingHeader,
    /// Header complete; reading the announced payload.
    ReadingPayload,
    /// Full request received; the handler is producing the reply.
    Processing,
    /// Writing the reply back to the client.
    Writing,
    /// Terminal state; the connection is gone or going.
    Stopped,
}

/// One client connection.
pub struct Session {
    /// Unique session ID.
    pub id: String,
    /// Remote address.
    pub remote_addr: SocketAddr,
    state: parking_lot::Mutex<SessionState>,
    stopped: AtomicBool,
    request_count: AtomicU64,
    created_at: Instant,
}

impl Session {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            remote_addr,
            state: parking_lot::Mutex::new(SessionState::Idle),
            stopped: AtomicBool::new(false),
            request_count: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    /// Requests the session to stop. Idempotent: only the first call
    /// reports having done the stop.
    pub fn stop(&self) -> bool {
        let first = !self.stopped.swap(true, Ordering::SeqCst);
        if first {
            self.set_state(SessionState::Stopped);
        }
        first
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Drives the connection until the client disconnects, a timeout
    /// fires, the session is stopped, or (in non-persistent mode) one
    /// exchange completes. Every exit path lands in `Stopped`.
    pub async fn run<S>(
        &self,
        stream: S,
        handler: Arc<RequestHandler>,
        config: &NetworkConfig,
        persistent: bool,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let result = self
            .drive(stream, handler, config, persistent, shutdown)
            .await;
        self.stop();
        result
    }

    async fn drive<S>(
        &self,
        mut stream: S,
        handler: Arc<RequestHandler>,
        config: &NetworkConfig,
        persistent: bool,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            if self.is_stopped() {
                return Ok(());
            }

            self.set_state(SessionState::Idle);
            let mut header_buf = [0u8; HEADER_SIZE];

            // First byte under the idle timeout; a quiet persistent client
            // is normal up to this point.
            tokio::select! {
                result = timeout(config.idle_timeout(), stream.read(&mut header_buf[..1])) => {
                    match result {
                        Err(_) => {
                            tracing::debug!(session = %self.id, peer = %self.remote_addr, "idle timeout");
                            self.stop();
                            return Ok(());
                        }
                        Ok(Ok(0)) => {
                            tracing::debug!(session = %self.id, peer = %self.remote_addr, "client disconnected");
                            self.stop();
                            return Ok(());
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            self.stop();
                            return Err(ServerError::Io(e));
                        }
                    }
                }
                _ = shutdown.recv() => {
                    self.stop();
                    return Err(ServerError::ShuttingDown);
                }
            }

            // The request has started; the rest must arrive promptly.
            self.set_state(SessionState::ReadingHeader);
            timeout(
                config.receive_timeout(),
                stream.read_exact(&mut header_buf[1..]),
            )
            .await
            .map_err(|_| timed_out("header receive"))??;

            let header = Header::decode(&header_buf)?;

            self.set_state(SessionState::ReadingPayload);
            let mut payload = vec![0u8; header.payload_size as usize];
            timeout(config.receive_timeout(), stream.read_exact(&mut payload))
                .await
                .map_err(|_| timed_out("payload receive"))??;

            let request = Request::parse(header, Bytes::from(payload))?;
            self.request_count.fetch_add(1, Ordering::Relaxed);

            self.set_state(SessionState::Processing);
            tracing::debug!(
                session = %self.id,
                peer = %self.remote_addr,
                request_id = request.header.request_id,
                table = %request.data_type,
                "request received"
            );
            let reply = handler.handle(self.remote_addr, &request);

            self.set_state(SessionState::Writing);
            let (buffers, total) = reply.to_buffers();
            timeout(config.send_timeout(), async {
                for buffer in &buffers {
                    stream.write_all(buffer).await?;
                }
                stream.flush().await
            })
            .await
            .map_err(|_| timed_out("reply send"))??;

            tracing::debug!(
                session = %self.id,
                request_id = reply.header.request_id,
                status = %reply.header.status,
                bytes = total,
                "reply sent"
            );

            if !persistent {
                self.stop();
                return Ok(());
            }
        }
    }
}

fn timed_out(what: &str) -> ServerError {
    ServerError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, what))
}
