use kssh_signer::wire::WireError;
use std::io;
use thiserror::Error;

/// A violation of the agent framing or message grammar. The offending
/// connection is closed; other connections are unaffected.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("empty frame")]
    EmptyFrame,
    #[error("unknown message type {0}")]
    UnknownMessage(u8),
    #[error("malformed message: {0}")]
    Malformed(#[from] WireError),
    #[error("{len} trailing bytes after message type {code}")]
    TrailingBytes { code: u8, len: usize },
}

impl From<ssh_encoding::Error> for ProtocolError {
    fn from(err: ssh_encoding::Error) -> Self {
        ProtocolError::Malformed(err.into())
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}
