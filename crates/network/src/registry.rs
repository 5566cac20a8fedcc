//! Request/response correlation
//!
//! A [`CorrelationRegistry`] maps in-flight correlation ids to single-slot
//! channels. Registration, delivery and deregistration all happen under one
//! lock, so a response racing its waiter's timeout is either handed to the
//! waiter or treated as unsolicited, never both.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::debug;

use crate::protocol::{CorrelationId, Message};

/// Ids wrap back to 1 after this value.
pub const MAX_CORRELATION_ID: CorrelationId = i32::MAX as CorrelationId;

#[derive(Debug)]
struct RegistryInner {
    next_id: CorrelationId,
    waiters: HashMap<CorrelationId, oneshot::Sender<Message>>,
}

impl RegistryInner {
    /// Next counter value not currently held by a pending request.
    fn next_free_id(&mut self) -> CorrelationId {
        loop {
            let candidate = self.next_id;
            self.next_id = if candidate >= MAX_CORRELATION_ID {
                1
            } else {
                candidate + 1
            };
            if !self.waiters.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

/// Pending requests of one connection
#[derive(Debug)]
pub struct CorrelationRegistry {
    inner: Mutex<RegistryInner>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    fn starting_at(first_id: CorrelationId) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                next_id: first_id.clamp(1, MAX_CORRELATION_ID),
                waiters: HashMap::new(),
            }),
        }
    }

    /// Reserve a fresh id and the slot its response will land in.
    ///
    /// Dropping the returned handle deregisters the id.
    pub fn register(&self) -> PendingResponse<'_> {
        let (sender, receiver) = oneshot::channel();
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_free_id();
            inner.waiters.insert(id, sender);
            id
        };
        PendingResponse {
            registry: self,
            id,
            receiver,
            settled: false,
        }
    }

    /// Hand `message` to the request waiting on its id.
    ///
    /// Returns the message back when nobody is waiting for it, so the caller
    /// can treat it as unsolicited.
    pub fn route(&self, message: Message) -> Option<Message> {
        let Some(id) = message.id() else {
            return Some(message);
        };

        let mut inner = self.inner.lock();
        match inner.waiters.remove(&id) {
            Some(sender) => {
                if sender.send(message).is_err() {
                    debug!("Discarded response {} for an abandoned request", id);
                }
                None
            }
            None => Some(message),
        }
    }

    /// Remove `id`, returning whether it was still pending.
    pub fn deregister(&self, id: CorrelationId) -> bool {
        self.inner.lock().waiters.remove(&id).is_some()
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.inner.lock().waiters.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered request awaiting its response
#[derive(Debug)]
pub struct PendingResponse<'a> {
    registry: &'a CorrelationRegistry,
    id: CorrelationId,
    receiver: oneshot::Receiver<Message>,
    settled: bool,
}

impl PendingResponse<'_> {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Wait up to `limit` for the response. The id is deregistered on return.
    pub async fn wait(mut self, limit: Duration) -> Option<Message> {
        let outcome = timeout(limit, &mut self.receiver).await;
        self.settled = true;
        match outcome {
            Ok(Ok(message)) => Some(message),
            Ok(Err(_)) => None,
            Err(_) => {
                if self.registry.deregister(self.id) {
                    None
                } else {
                    // routed between the deadline and deregistration
                    self.receiver.try_recv().ok()
                }
            }
        }
    }
}

impl Drop for PendingResponse<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.registry.deregister(self.id);
        }
    }
}
