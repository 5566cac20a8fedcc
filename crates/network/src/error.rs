//! Error types for peer connections

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::connection::ConnectionState;

/// Failures while turning a frame body into a [`crate::Message`] or back.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("frame payload of {length} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { length: usize, limit: usize },

    #[error("payload checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid correlation id flag: {0}")]
    InvalidIdFlag(u8),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("networking is shutting down")]
    ShuttingDown,

    #[error("connection is {current:?}")]
    InvalidState { current: ConnectionState },

    #[error("socket not connected")]
    NotConnected,

    #[error("timed out connecting to {0}")]
    ConnectTimeout(SocketAddr),

    #[error("no data received within {0:?}")]
    IdleTimeout(Duration),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("received message with wrong magic")]
    WrongMagic,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConnectionError>;
