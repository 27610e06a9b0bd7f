use crate::wire::WireError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("signing backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedDigestAlgorithm(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("encoding error: {0}")]
    Encoding(#[from] WireError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ssh_encoding::Error> for SigningError {
    fn from(err: ssh_encoding::Error) -> Self {
        SigningError::Encoding(err.into())
    }
}
