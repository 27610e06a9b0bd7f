//! ECDSA signature normalization.
//!
//! Remote backends hand back ASN.1 DER `SEQUENCE { INTEGER r, INTEGER s }`.
//! SSH wants the two scalars written as a pair of `mpint`s.

use crate::error::SigningError;
use crate::wire::{encode_mpint, mpint_len, strip_leading_zeros, to_vec, Encode, Writer};
use bytes::Bytes;

pub const P256_FIELD_BYTES: usize = 32;

/// Parses a DER P-256 signature into fixed-width `r || s`.
pub fn p256_der_to_fixed(der: &[u8]) -> Result<Vec<u8>, SigningError> {
    let sig = p256::ecdsa::Signature::from_der(der)
        .map_err(|e| SigningError::InvalidSignature(format!("der signature: {e}")))?;
    Ok(sig.to_bytes().to_vec())
}

/// Left-pads a big-endian scalar to `width` bytes, dropping redundant zeros.
pub fn left_pad(component: &[u8], width: usize) -> Result<Vec<u8>, SigningError> {
    let trimmed = strip_leading_zeros(component);
    if trimmed.len() > width {
        return Err(SigningError::InvalidSignature(
            "scalar wider than curve coordinate".to_string(),
        ));
    }
    let mut out = vec![0u8; width - trimmed.len()];
    out.extend_from_slice(trimmed);
    Ok(out)
}

/// `mpint r || mpint s` over a fixed-width `r || s`.
struct SignatureBlob<'a> {
    r: &'a [u8],
    s: &'a [u8],
}

impl Encode for SignatureBlob<'_> {
    fn encoded_len(&self) -> Result<usize, ssh_encoding::Error> {
        Ok(mpint_len(self.r) + mpint_len(self.s))
    }

    fn encode(&self, writer: &mut impl Writer) -> Result<(), ssh_encoding::Error> {
        encode_mpint(self.r, writer)?;
        encode_mpint(self.s, writer)
    }
}

/// Encodes fixed-width `r || s` as the SSH ECDSA signature blob.
pub fn ssh_signature_blob(fixed: &[u8]) -> Result<Bytes, SigningError> {
    let (r, s) = fixed.split_at(fixed.len() / 2);
    Ok(to_vec(&SignatureBlob { r, s })?.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode_mpint;
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::{Signature, SigningKey};

    fn der(r: &[u8], s: &[u8]) -> Vec<u8> {
        let mut body = vec![0x02, r.len() as u8];
        body.extend_from_slice(r);
        body.push(0x02);
        body.push(s.len() as u8);
        body.extend_from_slice(s);
        let mut out = vec![0x30, body.len() as u8];
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn full_width_components_pass_through() {
        let r = [0x11u8; 32];
        let s = [0x22u8; 32];
        let fixed = p256_der_to_fixed(&der(&r, &s)).unwrap();
        assert_eq!(fixed.len(), 64);
        assert_eq!(&fixed[..32], &r);
        assert_eq!(&fixed[32..], &s);
    }

    #[test]
    fn sign_byte_is_dropped() {
        let mut r = vec![0x00];
        r.extend_from_slice(&[0x80u8; 32]);
        let s = [0x7fu8; 32];
        let fixed = p256_der_to_fixed(&der(&r, &s)).unwrap();
        assert_eq!(fixed.len(), 64);
        assert_eq!(&fixed[..32], &[0x80u8; 32]);
    }

    #[test]
    fn short_components_are_left_padded() {
        let r = [0x01u8; 31];
        let s = [0x05u8];
        let fixed = p256_der_to_fixed(&der(&r, &s)).unwrap();
        assert_eq!(fixed.len(), 64);
        assert_eq!(fixed[0], 0);
        assert_eq!(&fixed[1..32], &r);
        assert!(fixed[32..63].iter().all(|b| *b == 0));
        assert_eq!(fixed[63], 0x05);
    }

    #[test]
    fn out_of_range_and_malformed_der_is_rejected() {
        assert!(p256_der_to_fixed(&der(&[0x01u8; 33], &[1])).is_err());
        // Zero is not a valid scalar.
        assert!(p256_der_to_fixed(&der(&[0], &[1])).is_err());
        assert!(p256_der_to_fixed(&[]).is_err());
        assert!(p256_der_to_fixed(&[0x31, 0x00]).is_err());
        let mut trailing = der(&[1], &[2]);
        trailing.push(0);
        assert!(p256_der_to_fixed(&trailing).is_err());
        let mut truncated = der(&[1, 2, 3], &[4]);
        truncated.truncate(truncated.len() - 1);
        assert!(p256_der_to_fixed(&truncated).is_err());
    }

    #[test]
    fn left_pad_widens_and_rejects_oversized() {
        assert_eq!(left_pad(&[0, 0, 1], 4).unwrap(), vec![0, 0, 0, 1]);
        assert_eq!(left_pad(&[], 2).unwrap(), vec![0, 0]);
        assert!(left_pad(&[1, 2, 3], 2).is_err());
    }

    #[test]
    fn short_r_from_a_real_signature_survives_the_round_trip() {
        let key = SigningKey::from_slice(&[0x42u8; 32]).unwrap();
        // RFC 6979 signing is deterministic, so the first message with a
        // short r is always the same one.
        let sig = (0u32..4096)
            .map(|i| -> Signature { key.sign(&i.to_be_bytes()) })
            .find(|sig| sig.to_bytes()[0] == 0)
            .unwrap();
        let der = sig.to_der();
        let fixed = p256_der_to_fixed(der.as_bytes()).unwrap();
        assert_eq!(fixed.as_slice(), sig.to_bytes().as_slice());

        let blob = ssh_signature_blob(&fixed).unwrap();
        let mut reader: &[u8] = &blob;
        let r = decode_mpint(&mut reader).unwrap();
        let s = decode_mpint(&mut reader).unwrap();
        assert!(r.len() < P256_FIELD_BYTES);
        assert_eq!(left_pad(&r, P256_FIELD_BYTES).unwrap(), &fixed[..32]);
        assert_eq!(left_pad(&s, P256_FIELD_BYTES).unwrap(), &fixed[32..]);
    }

    #[test]
    fn ssh_blob_holds_two_mpints() {
        let mut fixed = vec![0u8; 64];
        fixed[31] = 0x01;
        fixed[32] = 0xff;
        let blob = ssh_signature_blob(&fixed).unwrap();
        let mut reader: &[u8] = &blob;
        assert_eq!(decode_mpint(&mut reader).unwrap(), vec![0x01]);
        let s = decode_mpint(&mut reader).unwrap();
        assert_eq!(s.len(), 32);
        assert_eq!(s[0], 0xff);
        assert!(reader.is_empty());
    }
}
