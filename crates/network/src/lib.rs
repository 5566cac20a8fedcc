//! Peerwire Network Core
//!
//! Owns a single framed connection to a remote node: parses inbound frames,
//! serializes outbound writes, correlates requests with their responses and
//! watches liveness with periodic pings.
//!
//! ## Modules
//! - `connection`: The peer connection, its read loop and send path
//! - `registry`: Correlation ids for in-flight requests
//! - `pinger`: Periodic liveness checks
//! - `protocol`: Messages and the wire frame codec
//! - `callback`: Controller hooks for lifecycle events
//! - `context`: Injected collaborators and the shutdown switch
//! - `reputation`: Read-only blacklist interface
//! - `clock`: Network-synchronized time
//! - `config`: Per-connection settings
//! - `metrics`: Per-connection statistics
//! - `error`: Error types

pub mod callback;
pub mod clock;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod metrics;
pub mod pinger;
pub mod protocol;
pub mod registry;
pub mod reputation;

// ------------------------------------------------------------
// Re-exports for workspace-wide use
// ------------------------------------------------------------

// Connection lifecycle
pub use callback::ConnectionCallback;
pub use connection::{ConnectionState, PeerConnection};
pub use context::{PeerContext, ShutdownFlag};
pub use pinger::Pinger;

// Messaging
pub use protocol::{CorrelationId, FrameCodec, Message, MessageCodec, MessageKind};
pub use registry::{CorrelationRegistry, PendingResponse};

// Collaborators & settings
pub use clock::{MedianClock, NetworkClock, SystemClock};
pub use config::{ConnectionConfig, MAGIC_LENGTH};
pub use reputation::{PeerReputationStore, TrustAll};

// Errors & metrics
pub use error::{CodecError, ConnectionError, Result};
pub use metrics::{ConnectionMetrics, ConnectionMetricsSnapshot};
