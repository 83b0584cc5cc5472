use std::io;

use thiserror::Error;

use crate::crypto::CryptoError;

use super::MessageId;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed header or body. The stream position is undefined afterwards.
    #[error("Message load failure: {0}")]
    MessageLoad(String),

    #[error("Invalid protocol magic")]
    InvalidMagic,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u16),

    #[error("Message variant {0} is not registered")]
    UnregisteredMessage(&'static str),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl ProtocolError {
    pub fn load(message: impl Into<String>) -> Self {
        ProtocolError::MessageLoad(message.into())
    }

    /// True when the error means the peer closed the connection
    pub fn is_connection_reset(&self) -> bool {
        match self {
            ProtocolError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            return ProtocolError::Io(e.into());
        }
        ProtocolError::MessageLoad(e.to_string())
    }
}

/// Startup configuration errors. These are fatal and never recovered at runtime.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Message id {id:?} is already registered for {existing}, cannot register {requested}")]
    IdConflict {
        id: MessageId,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("Message variant {variant} is already registered as {existing:?}, cannot register as {requested:?}")]
    VariantConflict {
        variant: &'static str,
        existing: MessageId,
        requested: MessageId,
    },

    #[error("Algorithm not supported: {0}")]
    NotSupported(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
