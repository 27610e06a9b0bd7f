use crate::error::SigningError;
use crate::kms::{KmsOptions, KmsSigner};
use crate::local::LocalSigner;
use crate::signer::RemoteSigner;
use crate::token::TokenSource;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

const KMS_PREFIX: &str = "projects/";

/// Which key to load, decided once from the selector's shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeySelector {
    /// `projects/P/locations/L/keyRings/R/cryptoKeys/K/cryptoKeyVersions/V`
    Kms(String),
    /// PKCS#8 PEM file on local disk.
    File(PathBuf),
}

impl FromStr for KeySelector {
    type Err = SigningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(SigningError::InvalidKey("empty key selector".to_string()));
        }
        if s.starts_with(KMS_PREFIX) {
            Ok(KeySelector::Kms(s.trim_end_matches('/').to_string()))
        } else {
            Ok(KeySelector::File(PathBuf::from(s)))
        }
    }
}

impl fmt::Display for KeySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySelector::Kms(resource) => f.write_str(resource),
            KeySelector::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BackendOptions {
    pub kms: KmsOptions,
    pub access_token: Option<String>,
    pub credentials_file: Option<PathBuf>,
}

pub async fn load_signer(
    selector: &KeySelector,
    options: &BackendOptions,
) -> Result<Arc<dyn RemoteSigner>, SigningError> {
    match selector {
        KeySelector::Kms(resource) => {
            let tokens = TokenSource::discover(
                options.access_token.clone(),
                options.credentials_file.as_deref(),
            )?;
            let signer = KmsSigner::connect(resource, tokens, &options.kms).await?;
            Ok(Arc::new(signer))
        }
        KeySelector::File(path) => {
            let signer = LocalSigner::load(path)?;
            info!(path = %path.display(), algorithm = %signer.algorithm(), "local key loaded");
            Ok(Arc::new(signer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::KeyAlgorithm;

    #[test]
    fn selector_shape() {
        let kms: KeySelector = "projects/p/locations/global/keyRings/r/cryptoKeys/k/cryptoKeyVersions/1"
            .parse()
            .unwrap();
        assert!(matches!(kms, KeySelector::Kms(_)));
        let file: KeySelector = "/home/me/.ssh/id_rsa.pem".parse().unwrap();
        assert_eq!(file, KeySelector::File(PathBuf::from("/home/me/.ssh/id_rsa.pem")));
        assert!("  ".parse::<KeySelector>().is_err());
    }

    #[tokio::test]
    async fn file_selector_loads_local_signer() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("key.pem");
        std::fs::write(&path, include_str!("../testdata/p256_pkcs8.pem")).unwrap();
        let signer = load_signer(&KeySelector::File(path), &BackendOptions::default())
            .await
            .unwrap();
        assert_eq!(signer.algorithm(), KeyAlgorithm::EcdsaP256);
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let err = load_signer(
            &KeySelector::File(PathBuf::from("/nonexistent/kssh/key.pem")),
            &BackendOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SigningError::Io(_)));
    }
}
