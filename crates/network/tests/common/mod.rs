#![allow(dead_code)]

use parking_lot::Mutex;
use peerwire_network::config::MAINNET_MAGIC;
use peerwire_network::{
    ConnectionCallback, ConnectionConfig, FrameCodec, Message, MessageCodec, MessageKind,
    PeerConnection, PeerContext,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect,
    Message(Message),
    Disconnect,
    Error(String),
}

/// Controller double that records every callback.
#[derive(Default)]
pub struct RecordingCallback {
    events: Mutex<Vec<Event>>,
    answer_pings: bool,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Also answers unsolicited pings, the way a node controller does.
    pub fn answering_pings() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            answer_pings: true,
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn connects(&self) -> usize {
        self.count(|e| matches!(e, Event::Connect))
    }

    pub fn disconnects(&self) -> usize {
        self.count(|e| matches!(e, Event::Disconnect))
    }

    pub fn errors(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Error(reason) => Some(reason.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Message(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl ConnectionCallback for RecordingCallback {
    fn on_connect(&self, _peer: &Arc<PeerConnection>) {
        self.events.lock().push(Event::Connect);
    }

    fn on_message(&self, peer: &Arc<PeerConnection>, message: Message) {
        if self.answer_pings && message.kind() == MessageKind::PING && message.has_id() {
            let reply = Message::response_to(&message, MessageKind::PING, Vec::new());
            let peer = Arc::clone(peer);
            tokio::spawn(async move {
                peer.send_message(&reply).await;
            });
        }
        self.events.lock().push(Event::Message(message));
    }

    fn on_disconnect(&self, _peer: &Arc<PeerConnection>) {
        self.events.lock().push(Event::Disconnect);
    }

    fn on_error(&self, _peer: &Arc<PeerConnection>, reason: &str) {
        self.events.lock().push(Event::Error(reason.to_string()));
    }
}

/// Route connection logs to the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn localhost() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Short request timeout, pinger effectively idle.
pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        request_timeout: Duration::from_millis(300),
        idle_timeout: Duration::from_secs(30),
        ping_interval: Duration::from_secs(60),
        ..Default::default()
    }
}

/// The far end of an in-memory connection, speaking the frame protocol.
pub struct RemotePeer {
    stream: DuplexStream,
    codec: FrameCodec,
}

impl RemotePeer {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            codec: FrameCodec::default(),
        }
    }

    /// Next message, or `None` once the connection side hung up.
    pub async fn recv(&mut self) -> Option<Message> {
        let mut magic = [0u8; 4];
        self.stream.read_exact(&mut magic).await.ok()?;
        assert_eq!(magic, MAINNET_MAGIC, "connection wrote a foreign magic");
        Some(
            self.codec
                .decode(&mut self.stream)
                .await
                .expect("connection wrote a malformed frame"),
        )
    }

    /// False once the connection side has gone away.
    pub async fn send(&mut self, message: &Message) -> bool {
        let mut frame = MAINNET_MAGIC.to_vec();
        frame.extend_from_slice(&self.codec.encode(message).unwrap());
        self.send_raw(&frame).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> bool {
        self.stream.write_all(bytes).await.is_ok() && self.stream.flush().await.is_ok()
    }
}

/// Accept one end of a duplex pipe and hand back the other end.
pub async fn connected_pair(
    config: ConnectionConfig,
    callback: Arc<RecordingCallback>,
) -> (Arc<PeerConnection>, RemotePeer) {
    init_tracing();
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let peer = PeerConnection::accept(localhost(), local, config, PeerContext::new(callback)).await;
    assert!(peer.is_connected());
    (peer, RemotePeer::new(remote))
}

/// Answer pings on `remote`, skipping the first `ignore_first`; counts every ping seen.
pub fn spawn_ping_responder(
    mut remote: RemotePeer,
    ignore_first: usize,
) -> (Arc<AtomicUsize>, JoinHandle<RemotePeer>) {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let task = tokio::spawn(async move {
        while let Some(message) = remote.recv().await {
            if message.kind() != MessageKind::PING {
                continue;
            }
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n >= ignore_first {
                let reply = Message::response_to(&message, MessageKind::PING, Vec::new());
                if !remote.send(&reply).await {
                    break;
                }
            }
        }
        remote
    });
    (seen, task)
}

pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}
