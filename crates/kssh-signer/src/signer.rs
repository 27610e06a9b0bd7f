use crate::error::SigningError;
use crate::wire::{CheckedSum, Encode, Writer};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// A signing capability whose private key may live behind a remote service.
///
/// Implementations never retry on their own: a failed call is reported once
/// and the caller decides what to do with it.
#[async_trait]
pub trait RemoteSigner: Send + Sync + fmt::Debug {
    /// SSH wire encoding of the public key.
    fn public_key(&self) -> &[u8];

    fn algorithm(&self) -> KeyAlgorithm;

    /// Signs `data`, hashing it as the key's algorithm (and `flags`) require.
    async fn sign(&self, data: &[u8], flags: SignFlags) -> Result<Signature, SigningError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyAlgorithm {
    EcdsaP256,
    Rsa { bits: usize },
}

impl KeyAlgorithm {
    pub fn ssh_name(&self) -> &'static str {
        match self {
            KeyAlgorithm::EcdsaP256 => "ecdsa-sha2-nistp256",
            KeyAlgorithm::Rsa { .. } => "ssh-rsa",
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::EcdsaP256 => f.write_str("ecdsa-p256"),
            KeyAlgorithm::Rsa { bits } => write!(f, "rsa-{bits}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RsaHash {
    Sha1,
    Sha256,
    Sha512,
}

impl RsaHash {
    pub fn signature_format(self) -> &'static str {
        match self {
            RsaHash::Sha1 => "ssh-rsa",
            RsaHash::Sha256 => "rsa-sha2-256",
            RsaHash::Sha512 => "rsa-sha2-512",
        }
    }
}

/// Flag word carried by an agent sign request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SignFlags(pub u32);

impl SignFlags {
    pub const RSA_SHA2_256: u32 = 0x02;
    pub const RSA_SHA2_512: u32 = 0x04;

    /// Hash an RSA key must use; SHA-256 wins when both bits are set.
    pub fn rsa_hash(self) -> RsaHash {
        if self.0 & Self::RSA_SHA2_256 != 0 {
            RsaHash::Sha256
        } else if self.0 & Self::RSA_SHA2_512 != 0 {
            RsaHash::Sha512
        } else {
            RsaHash::Sha1
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    pub format: String,
    pub blob: Bytes,
}

impl Signature {
    pub fn new(format: impl Into<String>, blob: impl Into<Bytes>) -> Self {
        Self {
            format: format.into(),
            blob: blob.into(),
        }
    }
}

/// `string format || string blob`, the body of an SSH signature.
impl Encode for Signature {
    fn encoded_len(&self) -> Result<usize, ssh_encoding::Error> {
        [self.format.encoded_len()?, self.blob.encoded_len()?].checked_sum()
    }

    fn encode(&self, writer: &mut impl Writer) -> Result<(), ssh_encoding::Error> {
        self.format.encode(writer)?;
        self.blob.encode(writer)
    }
}
