//! Signing capabilities for kssh.
//!
//! A [`RemoteSigner`] turns data into an SSH signature without exposing the
//! private key to its caller. Keys either live in Google Cloud KMS
//! ([`KmsSigner`]) or in a local PKCS#8 file ([`LocalSigner`]); which one is
//! used is decided once from a [`KeySelector`].

pub mod ecdsa;
pub mod error;
pub mod keys;
pub mod kms;
pub mod local;
pub mod selector;
pub mod signer;
pub mod token;
pub mod wire;

pub use error::SigningError;
pub use keys::{authorized_key, fingerprint};
pub use kms::{KmsOptions, KmsSigner, DEFAULT_KMS_ENDPOINT};
pub use local::{KeyMaterial, LocalSigner};
pub use selector::{load_signer, BackendOptions, KeySelector};
pub use signer::{KeyAlgorithm, RemoteSigner, RsaHash, SignFlags, Signature};
pub use token::{TokenProvider, TokenSource};
