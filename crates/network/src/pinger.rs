//! Liveness monitoring for a single connection
//!
//! A half-open TCP connection never errors on read; the only way to notice it
//! is to ask the peer something. The pinger sends a correlated ping on every
//! interval and reports the peer disconnected after too many consecutive
//! failures.

use parking_lot::Mutex;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::connection::PeerConnection;
use crate::protocol::{Message, MessageKind};

/// Handle to a running ping task
#[derive(Debug)]
pub struct Pinger {
    stop_signal: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Pinger {
    pub(crate) fn start(peer: Weak<PeerConnection>, period: Duration, failure_threshold: u32) -> Self {
        let (stop_signal, stop_rx) = watch::channel(false);
        let task = tokio::spawn(ping_loop(peer, period, failure_threshold, stop_rx));
        Self {
            stop_signal,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_signal.borrow()
    }

    /// Ask the task to stop without waiting for it.
    pub(crate) fn cancel(&self) {
        self.stop_signal.send_replace(true);
    }

    /// Stop the task and wait for it to exit. No ping is sent after this returns.
    ///
    /// A ping frame already being written is allowed to finish so the stream
    /// never carries half a frame.
    pub async fn stop(&self) {
        self.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!("Ping task panicked: {}", e);
                }
            }
        }
    }
}

async fn ping_loop(
    peer: Weak<PeerConnection>,
    period: Duration,
    failure_threshold: u32,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }
        if *stop.borrow() {
            break;
        }

        let Some(peer) = peer.upgrade() else { break };
        if !peer.is_connected() {
            break;
        }

        let started = Instant::now();
        // the request write itself is not raced against `stop`
        let response = match peer.dispatch_request(Message::ping()).await {
            Some(pending) => tokio::select! {
                biased;
                _ = stop.changed() => break,
                response = pending.wait(peer.config().request_timeout) => response,
            },
            None => None,
        };

        match response {
            Some(reply) if reply.kind() == MessageKind::PING => {
                let latency = started.elapsed();
                debug!("Ping to {} took {:?}", peer.address(), latency);
                peer.record_ping_success(latency);
            }
            _ => {
                let failures = peer.record_ping_failure();
                debug!(
                    "Ping to {} failed ({}/{})",
                    peer.address(),
                    failures,
                    failure_threshold
                );
                if failures >= failure_threshold {
                    peer.handle_ping_failure().await;
                    break;
                }
            }
        }
    }
}
