//! Google Cloud KMS asymmetric signing over the REST API.

use crate::ecdsa::p256_der_to_fixed;
use crate::error::SigningError;
use crate::keys::{ecdsa_p256_public_blob, ecdsa_p256_signature, rsa_public_blob, rsa_signature};
use crate::signer::{KeyAlgorithm, RemoteSigner, RsaHash, SignFlags, Signature};
use crate::token::TokenSource;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use serde::Deserialize;
use sha2::{Digest, Sha256, Sha512};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_KMS_ENDPOINT: &str = "https://cloudkms.googleapis.com";

#[derive(Clone, Debug)]
pub struct KmsOptions {
    pub endpoint: String,
    pub timeout: Duration,
}

impl Default for KmsOptions {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_KMS_ENDPOINT.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KmsAlgorithm {
    EcP256Sha256,
    RsaPkcs1 { bits: usize, hash: RsaHash },
}

impl KmsAlgorithm {
    fn parse(name: &str) -> Result<Self, SigningError> {
        let alg = match name {
            "EC_SIGN_P256_SHA256" => KmsAlgorithm::EcP256Sha256,
            "RSA_SIGN_PKCS1_2048_SHA256" => KmsAlgorithm::RsaPkcs1 {
                bits: 2048,
                hash: RsaHash::Sha256,
            },
            "RSA_SIGN_PKCS1_3072_SHA256" => KmsAlgorithm::RsaPkcs1 {
                bits: 3072,
                hash: RsaHash::Sha256,
            },
            "RSA_SIGN_PKCS1_4096_SHA256" => KmsAlgorithm::RsaPkcs1 {
                bits: 4096,
                hash: RsaHash::Sha256,
            },
            "RSA_SIGN_PKCS1_4096_SHA512" => KmsAlgorithm::RsaPkcs1 {
                bits: 4096,
                hash: RsaHash::Sha512,
            },
            other => return Err(SigningError::UnsupportedAlgorithm(other.to_string())),
        };
        Ok(alg)
    }

    fn key_algorithm(self) -> KeyAlgorithm {
        match self {
            KmsAlgorithm::EcP256Sha256 => KeyAlgorithm::EcdsaP256,
            KmsAlgorithm::RsaPkcs1 { bits, .. } => KeyAlgorithm::Rsa { bits },
        }
    }

    fn public_blob(self, pem: &str) -> Result<Bytes, SigningError> {
        match self {
            KmsAlgorithm::EcP256Sha256 => {
                let key = p256::PublicKey::from_public_key_pem(pem)
                    .map_err(|e| SigningError::InvalidKey(e.to_string()))?;
                ecdsa_p256_public_blob(key.to_encoded_point(false).as_bytes())
            }
            KmsAlgorithm::RsaPkcs1 { bits, .. } => {
                let key = rsa::RsaPublicKey::from_public_key_pem(pem)
                    .map_err(|e| SigningError::InvalidKey(e.to_string()))?;
                if key.size() * 8 != bits {
                    return Err(SigningError::InvalidKey(format!(
                        "expected a {bits}-bit modulus, got {}",
                        key.size() * 8
                    )));
                }
                rsa_public_blob(&key.e().to_bytes_be(), &key.n().to_bytes_be())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct PublicKeyResponse {
    pem: String,
    algorithm: String,
}

#[derive(Debug, Deserialize)]
struct AsymmetricSignResponse {
    signature: String,
}

#[derive(Debug)]
pub struct KmsSigner {
    http: reqwest::Client,
    endpoint: String,
    resource: String,
    tokens: TokenSource,
    algorithm: KmsAlgorithm,
    public_key: Bytes,
}

impl KmsSigner {
    /// Resolves `resource` (a `cryptoKeyVersions/N` path) and fetches its public key.
    pub async fn connect(
        resource: &str,
        tokens: TokenSource,
        options: &KmsOptions,
    ) -> Result<Self, SigningError> {
        let http = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| SigningError::BackendUnavailable(e.to_string()))?;
        let endpoint = options.endpoint.trim_end_matches('/').to_string();

        let token = tokens.token(&http).await?;
        let url = format!("{}/v1/{}/publicKey", endpoint, resource);
        debug!(%url, "fetching kms public key");
        let resp = http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SigningError::BackendUnavailable(e.to_string()))?;
        let resp = check_status(resp, resource).await?;
        let body: PublicKeyResponse = resp
            .json()
            .await
            .map_err(|e| SigningError::BackendUnavailable(format!("public key response: {e}")))?;

        let algorithm = KmsAlgorithm::parse(&body.algorithm)?;
        let public_key = algorithm.public_blob(&body.pem)?;
        info!(resource, algorithm = %body.algorithm, "kms key loaded");

        Ok(Self {
            http,
            endpoint,
            resource: resource.to_string(),
            tokens,
            algorithm,
            public_key,
        })
    }
}

#[async_trait]
impl RemoteSigner for KmsSigner {
    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm.key_algorithm()
    }

    async fn sign(&self, data: &[u8], flags: SignFlags) -> Result<Signature, SigningError> {
        let (field, digest) = match self.algorithm {
            KmsAlgorithm::EcP256Sha256 => ("sha256", Sha256::digest(data).to_vec()),
            KmsAlgorithm::RsaPkcs1 { hash, .. } => {
                if flags.rsa_hash() != hash {
                    return Err(SigningError::UnsupportedDigestAlgorithm(format!(
                        "key signs with {}, client asked for {}",
                        hash.signature_format(),
                        flags.rsa_hash().signature_format()
                    )));
                }
                match hash {
                    RsaHash::Sha512 => ("sha512", Sha512::digest(data).to_vec()),
                    _ => ("sha256", Sha256::digest(data).to_vec()),
                }
            }
        };

        let mut digest_field = serde_json::Map::new();
        digest_field.insert(
            field.to_string(),
            serde_json::Value::String(STANDARD.encode(digest)),
        );
        let body = serde_json::json!({ "digest": digest_field });

        let token = self.tokens.token(&self.http).await?;
        let url = format!("{}/v1/{}:asymmetricSign", self.endpoint, self.resource);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SigningError::Network(e.to_string()))?;
        let resp = check_status(resp, &self.resource).await?;
        let body: AsymmetricSignResponse = resp
            .json()
            .await
            .map_err(|e| SigningError::Network(format!("sign response: {e}")))?;
        let raw = STANDARD
            .decode(body.signature.as_bytes())
            .map_err(|e| SigningError::InvalidSignature(e.to_string()))?;

        match self.algorithm {
            KmsAlgorithm::EcP256Sha256 => {
                let fixed = p256_der_to_fixed(&raw)?;
                ecdsa_p256_signature(&fixed)
            }
            KmsAlgorithm::RsaPkcs1 { hash, .. } => Ok(rsa_signature(hash, raw)),
        }
    }
}

async fn check_status(
    resp: reqwest::Response,
    resource: &str,
) -> Result<reqwest::Response, SigningError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let detail = resp.text().await.unwrap_or_default();
    Err(status_error(status.as_u16(), resource, detail.trim()))
}

fn status_error(status: u16, resource: &str, detail: &str) -> SigningError {
    match status {
        401 => SigningError::AuthenticationFailed(detail.to_string()),
        403 => SigningError::PermissionDenied(format!("{}: {}", resource, detail)),
        404 => SigningError::KeyNotFound(resource.to_string()),
        _ => SigningError::BackendUnavailable(format!("kms returned {}: {}", status, detail)),
    }
}
