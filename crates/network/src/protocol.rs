//! Wire protocol for peer connections
//!
//! Every frame on the wire starts with the network magic (see
//! [`crate::config::MAGIC_LENGTH`]). The connection checks the magic itself
//! and hands the rest of the frame to a [`MessageCodec`]. The default
//! [`FrameCodec`] lays out the remainder as:
//!
//! ```text
//! type: u32 BE | has_id: u8 | id: u32 BE (if has_id) | length: u32 BE
//!     | checksum: 4 bytes (if length > 0) | payload
//! ```
//!
//! The checksum is the first four bytes of the BLAKE3 hash of the payload.
//! Payload contents are opaque at this layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::CodecError;

/// Numeric tag routing a response back to the request that caused it.
pub type CorrelationId = u32;

/// Largest payload accepted by [`FrameCodec::default`].
pub const DEFAULT_MAX_PAYLOAD: usize = 10 * 1024 * 1024;

const CHECKSUM_LENGTH: usize = 4;

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKind(pub u32);

impl MessageKind {
    /// Liveness probe; answered with a message of the same kind and id.
    pub const PING: MessageKind = MessageKind(1);
}

/// A single protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    id: Option<CorrelationId>,
    payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            id: None,
            payload,
        }
    }

    pub fn ping() -> Self {
        Self::new(MessageKind::PING, Vec::new())
    }

    /// Build the answer to `request`, carrying its correlation id.
    pub fn response_to(request: &Message, kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            id: request.id,
            payload,
        }
    }

    pub fn with_id(mut self, id: CorrelationId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn has_id(&self) -> bool {
        self.id.is_some()
    }

    pub fn id(&self) -> Option<CorrelationId> {
        self.id
    }

    pub fn set_id(&mut self, id: CorrelationId) {
        self.id = Some(id);
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Turns messages into frame bodies and back.
///
/// `decode` is handed a reader positioned just after a validated magic marker
/// and must consume exactly one message.
#[async_trait]
pub trait MessageCodec: Send + Sync {
    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError>;

    async fn decode(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<Message, CodecError>;
}

/// Length-prefixed, checksummed frame body codec
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn check_length(&self, length: usize) -> Result<(), CodecError> {
        if length > self.max_payload || length > u32::MAX as usize {
            return Err(CodecError::FrameTooLarge {
                length,
                limit: self.max_payload,
            });
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LENGTH] {
    let hash = blake3::hash(payload);
    let mut out = [0u8; CHECKSUM_LENGTH];
    out.copy_from_slice(&hash.as_bytes()[..CHECKSUM_LENGTH]);
    out
}

#[async_trait]
impl MessageCodec for FrameCodec {
    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        let payload = message.payload();
        self.check_length(payload.len())?;

        let mut out = Vec::with_capacity(4 + 1 + 4 + 4 + CHECKSUM_LENGTH + payload.len());
        out.extend_from_slice(&message.kind().0.to_be_bytes());
        match message.id() {
            Some(id) => {
                out.push(1);
                out.extend_from_slice(&id.to_be_bytes());
            }
            None => out.push(0),
        }
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        if !payload.is_empty() {
            out.extend_from_slice(&checksum(payload));
            out.extend_from_slice(payload);
        }
        Ok(out)
    }

    async fn decode(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<Message, CodecError> {
        let kind = MessageKind(reader.read_u32().await?);
        let id = match reader.read_u8().await? {
            0 => None,
            1 => Some(reader.read_u32().await?),
            other => return Err(CodecError::InvalidIdFlag(other)),
        };

        let length = reader.read_u32().await? as usize;
        self.check_length(length)?;

        let mut payload = vec![0u8; length];
        if length > 0 {
            let mut expected = [0u8; CHECKSUM_LENGTH];
            reader.read_exact(&mut expected).await?;
            reader.read_exact(&mut payload).await?;
            if checksum(&payload) != expected {
                return Err(CodecError::ChecksumMismatch);
            }
        }

        Ok(Message { kind, id, payload })
    }
}
