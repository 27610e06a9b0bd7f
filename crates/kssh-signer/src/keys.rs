use crate::ecdsa::ssh_signature_blob;
use crate::error::SigningError;
use crate::signer::{RsaHash, Signature};
use crate::wire::{encode_mpint, mpint_len, to_vec, CheckedSum, Encode, Writer};
use bytes::Bytes;
use ssh_key::public::{EcdsaPublicKey, KeyData};
use ssh_key::{HashAlg, PublicKey};

pub const ECDSA_P256: &str = "ecdsa-sha2-nistp256";
pub const NISTP256: &str = "nistp256";
pub const SSH_RSA: &str = "ssh-rsa";

/// Public key blob for `ecdsa-sha2-nistp256` from an uncompressed SEC1 point.
pub fn ecdsa_p256_public_blob(point: &[u8]) -> Result<Bytes, SigningError> {
    let key = EcdsaPublicKey::from_sec1_bytes(point)
        .map_err(|e| SigningError::InvalidKey(e.to_string()))?;
    let blob = PublicKey::from(KeyData::Ecdsa(key))
        .to_bytes()
        .map_err(|e| SigningError::InvalidKey(e.to_string()))?;
    Ok(blob.into())
}

struct RsaPublicBlob<'a> {
    e: &'a [u8],
    n: &'a [u8],
}

impl Encode for RsaPublicBlob<'_> {
    fn encoded_len(&self) -> Result<usize, ssh_encoding::Error> {
        [SSH_RSA.encoded_len()?, mpint_len(self.e), mpint_len(self.n)].checked_sum()
    }

    fn encode(&self, writer: &mut impl Writer) -> Result<(), ssh_encoding::Error> {
        SSH_RSA.encode(writer)?;
        encode_mpint(self.e, writer)?;
        encode_mpint(self.n, writer)
    }
}

/// Public key blob for `ssh-rsa` from big-endian `e` and `n`.
pub fn rsa_public_blob(e: &[u8], n: &[u8]) -> Result<Bytes, SigningError> {
    Ok(to_vec(&RsaPublicBlob { e, n })?.into())
}

pub fn ecdsa_p256_signature(fixed: &[u8]) -> Result<Signature, SigningError> {
    Ok(Signature::new(ECDSA_P256, ssh_signature_blob(fixed)?))
}

pub fn rsa_signature(hash: RsaHash, raw: Vec<u8>) -> Signature {
    Signature::new(hash.signature_format(), raw)
}

/// Renders a public key blob as an `authorized_keys` line.
pub fn authorized_key(blob: &[u8], comment: &str) -> Result<String, SigningError> {
    let key = PublicKey::from_bytes(blob).map_err(|e| SigningError::InvalidKey(e.to_string()))?;
    let line = key
        .to_openssh()
        .map_err(|e| SigningError::InvalidKey(e.to_string()))?;
    if comment.is_empty() {
        Ok(line)
    } else {
        Ok(format!("{} {}", line, comment))
    }
}

pub fn fingerprint(blob: &[u8]) -> String {
    match PublicKey::from_bytes(blob) {
        Ok(key) => key.fingerprint(HashAlg::Sha256).to_string(),
        Err(_) => "<unparsable key>".to_string(),
    }
}
