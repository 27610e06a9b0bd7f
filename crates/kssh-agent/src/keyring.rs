//! In-memory identity registry shared by every agent connection.
//!
//! Mutations take the write half of a `parking_lot::RwLock`; listing and
//! signer lookup take the read half. The signer handle is cloned out of the
//! ring before a signature is requested, so a slow remote call never holds
//! the lock.

use bytes::Bytes;
use kssh_signer::{fingerprint, RemoteSigner, SignFlags, Signature, SigningError};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum KeyRingError {
    #[error("identity already present")]
    DuplicateIdentity,
    #[error("identity not found")]
    NotFound,
    #[error("no identity matches the requested key")]
    IdentityNotFound,
    #[error("agent is locked")]
    Locked,
    #[error("agent is not locked")]
    NotLocked,
    #[error("incorrect passphrase")]
    BadPassphrase,
    #[error(transparent)]
    Signing(#[from] SigningError),
}

#[derive(Clone)]
pub struct Identity {
    public_key: Bytes,
    comment: String,
    signer: Arc<dyn RemoteSigner>,
    expires_at: Option<Instant>,
}

impl Identity {
    pub fn new(signer: Arc<dyn RemoteSigner>, comment: impl Into<String>) -> Self {
        Self {
            public_key: Bytes::copy_from_slice(signer.public_key()),
            comment: comment.into(),
            signer,
            expires_at: None,
        }
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.expires_at = Some(Instant::now() + lifetime);
        self
    }

    pub fn public_key(&self) -> &Bytes {
        &self.public_key
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &fingerprint(&self.public_key))
            .field("comment", &self.comment)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// What `REQUEST_IDENTITIES` reports for one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListedIdentity {
    pub public_key: Bytes,
    pub comment: String,
}

#[derive(Default)]
struct State {
    identities: Vec<Identity>,
    lock_digest: Option<[u8; 32]>,
}

impl State {
    fn ensure_unlocked(&self) -> Result<(), KeyRingError> {
        if self.lock_digest.is_some() {
            Err(KeyRingError::Locked)
        } else {
            Ok(())
        }
    }

    fn prune(&mut self, now: Instant) {
        let before = self.identities.len();
        self.identities.retain(|i| !i.is_expired(now));
        let expired = before - self.identities.len();
        if expired > 0 {
            debug!(expired, "pruned expired identities");
        }
    }
}

#[derive(Default)]
pub struct KeyRing {
    state: RwLock<State>,
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("KeyRing")
            .field("identities", &state.identities)
            .field("locked", &state.lock_digest.is_some())
            .finish()
    }
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an identity; an equal public key already present is an error.
    pub fn add(&self, identity: Identity) -> Result<(), KeyRingError> {
        let mut state = self.state.write();
        state.ensure_unlocked()?;
        state.prune(Instant::now());
        if state
            .identities
            .iter()
            .any(|i| i.public_key == identity.public_key)
        {
            return Err(KeyRingError::DuplicateIdentity);
        }
        info!(
            fingerprint = %fingerprint(&identity.public_key),
            comment = %identity.comment,
            "identity added"
        );
        state.identities.push(identity);
        Ok(())
    }

    pub fn remove(&self, public_key: &[u8]) -> Result<(), KeyRingError> {
        let mut state = self.state.write();
        state.ensure_unlocked()?;
        state.prune(Instant::now());
        let pos = state
            .identities
            .iter()
            .position(|i| i.public_key.as_ref() == public_key)
            .ok_or(KeyRingError::NotFound)?;
        let removed = state.identities.remove(pos);
        info!(fingerprint = %fingerprint(&removed.public_key), "identity removed");
        Ok(())
    }

    /// Clears the ring and returns how many identities were dropped.
    pub fn remove_all(&self) -> Result<usize, KeyRingError> {
        let mut state = self.state.write();
        state.ensure_unlocked()?;
        let count = state.identities.len();
        state.identities.clear();
        info!(count, "all identities removed");
        Ok(count)
    }

    /// Snapshot in insertion order. A locked ring lists nothing.
    pub fn list(&self) -> Vec<ListedIdentity> {
        let state = self.state.read();
        if state.lock_digest.is_some() {
            return Vec::new();
        }
        let now = Instant::now();
        state
            .identities
            .iter()
            .filter(|i| !i.is_expired(now))
            .map(|i| ListedIdentity {
                public_key: i.public_key.clone(),
                comment: i.comment.clone(),
            })
            .collect()
    }

    pub async fn sign_with(
        &self,
        public_key: &[u8],
        data: &[u8],
        flags: SignFlags,
    ) -> Result<Signature, KeyRingError> {
        let signer = {
            let state = self.state.read();
            state.ensure_unlocked()?;
            let now = Instant::now();
            state
                .identities
                .iter()
                .find(|i| i.public_key.as_ref() == public_key && !i.is_expired(now))
                .map(|i| Arc::clone(&i.signer))
                .ok_or(KeyRingError::IdentityNotFound)?
        };
        Ok(signer.sign(data, flags).await?)
    }

    pub fn lock(&self, passphrase: &[u8]) -> Result<(), KeyRingError> {
        let mut state = self.state.write();
        state.ensure_unlocked()?;
        state.lock_digest = Some(Sha256::digest(passphrase).into());
        info!("agent locked");
        Ok(())
    }

    pub fn unlock(&self, passphrase: &[u8]) -> Result<(), KeyRingError> {
        let mut state = self.state.write();
        let expected = state.lock_digest.ok_or(KeyRingError::NotLocked)?;
        let offered: [u8; 32] = Sha256::digest(passphrase).into();
        if !bool::from(offered[..].ct_eq(&expected[..])) {
            return Err(KeyRingError::BadPassphrase);
        }
        state.lock_digest = None;
        info!("agent unlocked");
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.state.read().lock_digest.is_some()
    }

    pub fn len(&self) -> usize {
        self.state.read().identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
