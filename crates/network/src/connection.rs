//! Peer connection
//!
//! A [`PeerConnection`] owns one TCP (or any duplex) stream to a remote node.
//! A single read-loop task parses frames in wire order and either routes them
//! to the request waiting on their correlation id or hands them to the
//! controller as unsolicited traffic. Any number of tasks may send; each frame
//! is written whole under the writer lock. A [`Pinger`] task watches liveness.
//!
//! Lifecycle: `Pending` → `Connected` → `Closed`. The transition to `Closed`
//! happens exactly once, from [`PeerConnection::close`], a fatal read-loop
//! error or repeated ping failure.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, MAGIC_LENGTH};
use crate::context::PeerContext;
use crate::error::{ConnectionError, Result};
use crate::metrics::{ConnectionMetrics, ConnectionMetricsSnapshot};
use crate::pinger::Pinger;
use crate::protocol::Message;
use crate::registry::{CorrelationRegistry, PendingResponse};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Connection state for a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Pending,
    Connected,
    Closed,
}

/// Why the read loop stopped
enum ReadLoopExit {
    Closed,
    ProtocolViolation,
    Failed(ConnectionError),
}

/// A single connection to a remote node
pub struct PeerConnection {
    address: IpAddr,
    is_outbound: bool,
    config: ConnectionConfig,
    context: PeerContext,
    state: Mutex<ConnectionState>,
    writer: AsyncMutex<Option<BoxedWriter>>,
    pending_requests: CorrelationRegistry,
    pinger: Mutex<Option<Pinger>>,
    ping_failures: AtomicU32,
    established_at_us: AtomicI64,
    close_signal: watch::Sender<bool>,
    close_watch: watch::Receiver<bool>,
    metrics: ConnectionMetrics,
}

impl PeerConnection {
    fn new(address: IpAddr, is_outbound: bool, config: ConnectionConfig, context: PeerContext) -> Self {
        let (close_signal, close_watch) = watch::channel(false);
        Self {
            address,
            is_outbound,
            config,
            context,
            state: Mutex::new(ConnectionState::Pending),
            writer: AsyncMutex::new(None),
            pending_requests: CorrelationRegistry::new(),
            pinger: Mutex::new(None),
            ping_failures: AtomicU32::new(0),
            established_at_us: AtomicI64::new(0),
            close_signal,
            close_watch,
            metrics: ConnectionMetrics::new(),
        }
    }

    /// A connection we will dial; call [`PeerConnection::connect`] to open it.
    pub fn outbound(address: IpAddr, config: ConnectionConfig, context: PeerContext) -> Arc<Self> {
        Arc::new(Self::new(address, true, config, context))
    }

    /// Take over a stream opened by the remote side.
    ///
    /// Failures are logged; the returned connection then stays `Pending` and
    /// `on_connect` is never called.
    pub async fn accept<S>(
        address: IpAddr,
        stream: S,
        config: ConnectionConfig,
        context: PeerContext,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = Arc::new(Self::new(address, false, config, context));
        if let Err(e) = peer.start(stream).await {
            debug!("Failed to start inbound connection from {}: {}", address, e);
            info!("Failed to accept connection from {}", address);
        }
        peer
    }

    /// Accept a socket handed over by the listener.
    pub async fn accept_tcp(
        stream: TcpStream,
        config: ConnectionConfig,
        context: PeerContext,
    ) -> Option<Arc<Self>> {
        let remote = match stream.peer_addr() {
            Ok(remote) => remote,
            Err(e) => {
                debug!("Dropping inbound socket without peer address: {}", e);
                return None;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", remote, e);
        }
        Some(Self::accept(remote.ip(), stream, config, context).await)
    }

    /// Dial the peer on the configured port.
    ///
    /// Does nothing while networking is shutting down. Failures are logged and
    /// swallowed; the caller notices them only through the absence of
    /// `on_connect`.
    pub async fn connect(self: &Arc<Self>) {
        match self.try_connect().await {
            Ok(()) => {}
            Err(ConnectionError::ShuttingDown) => {
                debug!("Not connecting to {}: networking is shutting down", self.address);
            }
            Err(e) => {
                debug!("Connection attempt to {} failed: {}", self.address, e);
                info!("Failed to connect to {}", self.address);
            }
        }
    }

    async fn try_connect(self: &Arc<Self>) -> Result<()> {
        if self.context.shutdown.is_shutting_down() {
            return Err(ConnectionError::ShuttingDown);
        }

        let current = self.state();
        if current != ConnectionState::Pending {
            return Err(ConnectionError::InvalidState { current });
        }

        let target = SocketAddr::new(self.address, self.config.port);
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| ConnectionError::ConnectTimeout(target))??;
        stream.set_nodelay(true)?;

        self.start(stream).await
    }

    async fn start<S>(self: &Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.config.validate()?;

        let (reader, writer) = tokio::io::split(stream);
        {
            let mut guard = self.writer.lock().await;
            let mut state = self.state.lock();
            if *state != ConnectionState::Pending {
                return Err(ConnectionError::InvalidState { current: *state });
            }
            *guard = Some(Box::new(writer));
            self.established_at_us
                .store(self.context.clock.now_us(), Ordering::SeqCst);
            *state = ConnectionState::Connected;
        }

        tokio::spawn(Arc::clone(self).read_loop(Box::new(reader), self.close_watch.clone()));

        let pinger = Pinger::start(
            Arc::downgrade(self),
            self.config.ping_interval,
            self.config.ping_failure_threshold,
        );
        *self.pinger.lock() = Some(pinger);

        info!(
            "Connected to peer {} ({})",
            self.address,
            if self.is_outbound { "outbound" } else { "inbound" }
        );
        self.context.callback.on_connect(self);
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut reader: BoxedReader, mut close_watch: watch::Receiver<bool>) {
        let exit = loop {
            let frame = tokio::select! {
                biased;
                _ = close_watch.changed() => break ReadLoopExit::Closed,
                frame = self.read_frame(&mut reader) => frame,
            };
            match frame {
                Ok(message) => self.dispatch(message),
                Err(ConnectionError::WrongMagic) => break ReadLoopExit::ProtocolViolation,
                Err(e) => break ReadLoopExit::Failed(e),
            }
        };

        match exit {
            ReadLoopExit::Closed => {
                debug!("Read loop for {} stopped by close", self.address);
            }
            ReadLoopExit::ProtocolViolation => {
                warn!("Peer {} sent a frame with the wrong magic", self.address);
                self.context
                    .callback
                    .on_error(&self, &ConnectionError::WrongMagic.to_string());
                self.terminate().await;
            }
            ReadLoopExit::Failed(e) => {
                debug!("Read loop for {} failed: {}", self.address, e);
                if self.terminate().await {
                    self.context.callback.on_disconnect(&self);
                }
            }
        }
    }

    /// Read one frame, bounded by the idle timeout.
    async fn read_frame(&self, reader: &mut BoxedReader) -> Result<Message> {
        let idle = self.config.idle_timeout;
        timeout(idle, async {
            let mut magic = [0u8; MAGIC_LENGTH];
            reader.read_exact(&mut magic).await?;
            if magic != self.config.magic {
                return Err(ConnectionError::WrongMagic);
            }
            Ok(self.context.codec.decode(&mut **reader).await?)
        })
        .await
        .map_err(|_| ConnectionError::IdleTimeout(idle))?
    }

    fn dispatch(self: &Arc<Self>, message: Message) {
        self.metrics.record_message_received(message.payload().len());
        match self.pending_requests.route(message) {
            None => self.metrics.record_response_routed(),
            Some(message) => {
                self.metrics.record_unsolicited();
                self.context.callback.on_message(self, message);
            }
        }
    }

    /// Write `message` as one frame.
    ///
    /// Returns false and reports `on_error` when the socket is not connected
    /// or the write fails; a failed write does not close the connection.
    /// Dropping the future never truncates a frame: once started, the write
    /// runs to completion on its own task.
    pub async fn send_message(self: &Arc<Self>, message: &Message) -> bool {
        match self.write_frame(message).await {
            Ok(written) => {
                self.metrics.record_message_sent(written);
                true
            }
            Err(e) => {
                debug!("Failed to send message to {}: {}", self.address, e);
                self.metrics.record_send_failure();
                self.context.callback.on_error(self, &e.to_string());
                false
            }
        }
    }

    async fn write_frame(self: &Arc<Self>, message: &Message) -> Result<usize> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }

        let body = self.context.codec.encode(message)?;
        let mut frame = Vec::with_capacity(MAGIC_LENGTH + body.len());
        frame.extend_from_slice(&self.config.magic);
        frame.extend_from_slice(&body);

        let peer = Arc::clone(self);
        tokio::spawn(async move { peer.write_locked(frame).await })
            .await
            .map_err(|e| ConnectionError::Io(io::Error::other(e)))?
    }

    async fn write_locked(&self, frame: Vec<u8>) -> Result<usize> {
        let mut guard = self.writer.lock().await;
        // teardown marks the state before it waits for this lock
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let writer = guard.as_mut().ok_or(ConnectionError::NotConnected)?;
        let write = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match timeout(self.config.write_timeout, write).await {
            Ok(Ok(())) => Ok(frame.len()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                // the stream now ends mid-frame and cannot carry another one
                *guard = None;
                Err(ConnectionError::WriteTimeout(self.config.write_timeout))
            }
        }
    }

    /// Register a correlation id for `message`, stamp it and send it.
    pub(crate) async fn dispatch_request(self: &Arc<Self>, mut message: Message) -> Option<PendingResponse<'_>> {
        let pending = self.pending_requests.register();
        message.set_id(pending.id());
        if self.send_message(&message).await {
            Some(pending)
        } else {
            info!("Failed to send request to peer {}", self.address);
            None
        }
    }

    /// Send `message` and wait for the response carrying the same id.
    ///
    /// Returns `None` when the send fails or nothing arrives within the
    /// request timeout. Cancelling the returned future deregisters the id;
    /// a frame already being written still goes out whole.
    pub async fn send_request(self: &Arc<Self>, message: Message) -> Option<Message> {
        let pending = self.dispatch_request(message).await?;
        let id = pending.id();
        let response = pending.wait(self.config.request_timeout).await;
        if response.is_none() {
            self.metrics.record_request_timeout();
            info!(
                "Timed out while waiting for response {} from peer {}",
                id, self.address
            );
        }
        response
    }

    pub(crate) fn record_ping_success(&self, latency: Duration) {
        self.ping_failures.store(0, Ordering::SeqCst);
        self.metrics.record_ping(latency);
    }

    /// Returns the number of consecutive failures including this one.
    pub(crate) fn record_ping_failure(&self) -> u32 {
        self.metrics.record_ping_failure();
        self.ping_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) async fn handle_ping_failure(self: &Arc<Self>) {
        warn!(
            "Peer {} failed {} consecutive pings",
            self.address,
            self.ping_failure_count()
        );
        if self.terminate().await {
            self.context.callback.on_disconnect(self);
        }
    }

    /// Stop the pinger; no ping is sent once this returns.
    pub async fn stop_ping(&self) {
        let pinger = self.pinger.lock().take();
        if let Some(pinger) = pinger {
            pinger.stop().await;
        }
    }

    /// Move to `Closed`; true if the connection was open until now.
    fn mark_closed(&self) -> bool {
        let mut state = self.state.lock();
        let was_connected = *state == ConnectionState::Connected;
        *state = ConnectionState::Closed;
        was_connected
    }

    /// Teardown after a failure inside the connection's own tasks.
    async fn terminate(&self) -> bool {
        if !self.mark_closed() {
            return false;
        }
        self.close_signal.send_replace(true);
        // may be running on the ping task itself, so only signal it
        let pinger = self.pinger.lock().take();
        if let Some(pinger) = pinger {
            pinger.cancel();
        }
        self.release_writer().await;
        true
    }

    async fn release_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("Error while closing connection to {}: {}", self.address, e);
            }
        }
    }

    /// Idempotent teardown. Never fails; errors while closing are logged.
    ///
    /// Requests still waiting resolve to `None` through their own timeout.
    pub async fn close(&self) {
        self.stop_ping().await;
        let was_connected = self.mark_closed();
        self.close_signal.send_replace(true);
        self.release_writer().await;
        if was_connected {
            info!("Closed connection to {}", self.address);
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// True for peers we dialed.
    pub fn is_outbound(&self) -> bool {
        self.is_outbound
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Network time (microseconds) at which the socket was established, 0 before that.
    pub fn connection_established_at(&self) -> i64 {
        self.established_at_us.load(Ordering::SeqCst)
    }

    pub fn ping_failure_count(&self) -> u32 {
        self.ping_failures.load(Ordering::SeqCst)
    }

    /// Round trip of the last successful ping
    pub fn ping_latency(&self) -> Option<Duration> {
        self.metrics.last_ping()
    }

    pub fn has_pinger(&self) -> bool {
        self.pinger.lock().is_some()
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending_requests.len()
    }

    /// Whether the node's blacklist flags this peer
    pub fn is_bad(&self) -> bool {
        self.context.reputation.is_bad(&self.address)
    }

    pub fn stats(&self) -> ConnectionMetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("address", &self.address)
            .field("is_outbound", &self.is_outbound)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::ConnectionCallback;
    use std::net::Ipv4Addr;

    struct Silent;

    impl ConnectionCallback for Silent {
        fn on_connect(&self, _peer: &Arc<PeerConnection>) {}
        fn on_message(&self, _peer: &Arc<PeerConnection>, _message: Message) {}
        fn on_disconnect(&self, _peer: &Arc<PeerConnection>) {}
        fn on_error(&self, _peer: &Arc<PeerConnection>, _reason: &str) {}
    }

    fn context() -> PeerContext {
        PeerContext::new(Arc::new(Silent))
    }

    #[test]
    fn outbound_connection_starts_pending() {
        let peer = PeerConnection::outbound(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            ConnectionConfig::default(),
            context(),
        );
        assert_eq!(peer.state(), ConnectionState::Pending);
        assert!(peer.is_outbound());
        assert!(!peer.has_pinger());
        assert_eq!(peer.connection_established_at(), 0);
        assert!(!peer.is_bad());
    }

    #[tokio::test]
    async fn accepted_stream_is_connected_and_inbound() {
        let (local, _remote) = tokio::io::duplex(1024);
        let peer = PeerConnection::accept(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            local,
            ConnectionConfig::default(),
            context(),
        )
        .await;
        assert!(peer.is_connected());
        assert!(!peer.is_outbound());
        assert!(peer.has_pinger());
        assert!(peer.connection_established_at() > 0);
        peer.close().await;
    }

    #[tokio::test]
    async fn invalid_config_leaves_connection_pending() {
        let (local, _remote) = tokio::io::duplex(1024);
        let config = ConnectionConfig {
            request_timeout: Duration::ZERO,
            ..Default::default()
        };
        let peer = PeerConnection::accept(IpAddr::V4(Ipv4Addr::LOCALHOST), local, config, context()).await;
        assert_eq!(peer.state(), ConnectionState::Pending);
        assert!(!peer.has_pinger());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (local, _remote) = tokio::io::duplex(1024);
        let peer = PeerConnection::accept(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            local,
            ConnectionConfig::default(),
            context(),
        )
        .await;
        peer.close().await;
        peer.close().await;
        assert_eq!(peer.state(), ConnectionState::Closed);
        assert!(!peer.has_pinger());
    }
}
