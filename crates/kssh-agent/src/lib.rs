//! SSH agent server backed by [`kssh_signer::RemoteSigner`] identities.

pub mod error;
pub mod keyring;
pub mod listener;
pub mod proto;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{AgentError, ProtocolError};
pub use keyring::{Identity, KeyRing, KeyRingError, ListedIdentity};
pub use listener::{AgentSocket, DEFAULT_SOCKET_PREFIX, SSH_AGENT_PID, SSH_AUTH_SOCK};
pub use server::{AgentServer, ServerLimits};
