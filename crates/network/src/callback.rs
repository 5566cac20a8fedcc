use std::sync::Arc;

use crate::connection::PeerConnection;
use crate::protocol::Message;

/// Controller hooks for connection lifecycle events.
///
/// Methods are called from the connection's own tasks (read loop, pinger) as
/// well as from whichever task is sending, so implementations must not block
/// for long. Anything that needs to await, such as replying or closing, should
/// be spawned.
pub trait ConnectionCallback: Send + Sync {
    /// The socket is open and the read loop and pinger are running.
    fn on_connect(&self, peer: &Arc<PeerConnection>);

    /// An inbound message no pending request was waiting for.
    fn on_message(&self, peer: &Arc<PeerConnection>, message: Message);

    /// The connection failed or stopped answering pings.
    fn on_disconnect(&self, peer: &Arc<PeerConnection>);

    fn on_error(&self, peer: &Arc<PeerConnection>, reason: &str);
}
