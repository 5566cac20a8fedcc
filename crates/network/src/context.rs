//! Collaborators injected into every connection

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::callback::ConnectionCallback;
use crate::clock::{NetworkClock, SystemClock};
use crate::protocol::{FrameCodec, MessageCodec};
use crate::reputation::{PeerReputationStore, TrustAll};

/// Node-wide "networking is stopping" switch
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Capabilities a connection uses but does not own
#[derive(Clone)]
pub struct PeerContext {
    pub callback: Arc<dyn ConnectionCallback>,
    pub codec: Arc<dyn MessageCodec>,
    pub reputation: Arc<dyn PeerReputationStore>,
    pub clock: Arc<dyn NetworkClock>,
    pub shutdown: ShutdownFlag,
}

impl PeerContext {
    /// Context with the default frame codec, wall clock and no blacklist.
    pub fn new(callback: Arc<dyn ConnectionCallback>) -> Self {
        Self {
            callback,
            codec: Arc::new(FrameCodec::default()),
            reputation: Arc::new(TrustAll),
            clock: Arc::new(SystemClock),
            shutdown: ShutdownFlag::new(),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_reputation(mut self, reputation: Arc<dyn PeerReputationStore>) -> Self {
        self.reputation = reputation;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn NetworkClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownFlag) -> Self {
        self.shutdown = shutdown;
        self
    }
}

impl std::fmt::Debug for PeerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerContext")
            .field("shutting_down", &self.shutdown.is_shutting_down())
            .finish_non_exhaustive()
    }
}
