use crate::keyring::Identity;
use async_trait::async_trait;
use bytes::Bytes;
use kssh_signer::{KeyAlgorithm, LocalSigner, RemoteSigner, SignFlags, Signature, SigningError};
use std::sync::Arc;
use tokio::sync::Notify;

pub(crate) fn p256_signer(seed: u8) -> LocalSigner {
    let key = p256::ecdsa::SigningKey::from_slice(&[seed; 32]).unwrap();
    LocalSigner::from_p256(key).unwrap()
}

pub(crate) fn p256_identity(seed: u8, comment: &str) -> Identity {
    Identity::new(Arc::new(p256_signer(seed)), comment)
}

#[derive(Debug)]
enum Behavior {
    Fail,
    Gated(Arc<Notify>),
    Panic,
}

#[derive(Debug)]
pub(crate) struct StubSigner {
    public_key: Vec<u8>,
    behavior: Behavior,
}

impl StubSigner {
    pub(crate) fn failing(public_key: &[u8]) -> Self {
        Self {
            public_key: public_key.to_vec(),
            behavior: Behavior::Fail,
        }
    }

    pub(crate) fn gated(public_key: &[u8], gate: Arc<Notify>) -> Self {
        Self {
            public_key: public_key.to_vec(),
            behavior: Behavior::Gated(gate),
        }
    }

    pub(crate) fn panicking(public_key: &[u8]) -> Self {
        Self {
            public_key: public_key.to_vec(),
            behavior: Behavior::Panic,
        }
    }
}

#[async_trait]
impl RemoteSigner for StubSigner {
    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn algorithm(&self) -> KeyAlgorithm {
        KeyAlgorithm::EcdsaP256
    }

    async fn sign(&self, _data: &[u8], _flags: SignFlags) -> Result<Signature, SigningError> {
        match &self.behavior {
            Behavior::Fail => Err(SigningError::Network("connection reset".to_string())),
            Behavior::Gated(gate) => {
                gate.notified().await;
                Ok(Signature::new("stub", Bytes::from_static(b"sig")))
            }
            Behavior::Panic => panic!("stub signer exploded"),
        }
    }
}
