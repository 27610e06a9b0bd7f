use crate::paths::AppPaths;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const ENV_KEY_PATH: &str = "KSSH_KEY_PATH";
pub const ENV_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";
pub const ENV_LOG: &str = "KSSH_LOG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml error in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("toml encode error: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("config file {0} does not exist")]
    Missing(PathBuf),
    #[error("platform config directories are unavailable")]
    NoProjectDirs,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub key: KeyConfig,
    pub agent: AgentConfig,
    pub ssh: SshDefaults,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct AppConfigLayer {
    pub key: Option<KeyConfigLayer>,
    pub agent: Option<AgentConfigLayer>,
    pub ssh: Option<SshDefaultsLayer>,
    pub logging: Option<LoggingConfigLayer>,
}

impl AppConfigLayer {
    pub fn apply_to(self, cfg: &mut AppConfig) {
        if let Some(layer) = self.key {
            cfg.key.apply(layer);
        }
        if let Some(layer) = self.agent {
            cfg.agent.apply(layer);
        }
        if let Some(layer) = self.ssh {
            cfg.ssh.apply(layer);
        }
        if let Some(layer) = self.logging {
            cfg.logging.apply(layer);
        }
    }

    pub fn from_env() -> Self {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Builds the environment layer from a lookup function; empty values
    /// count as unset.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let mut layer = Self::default();

        let selector = get(ENV_KEY_PATH);
        let credentials_file = get(ENV_CREDENTIALS).map(PathBuf::from);
        if selector.is_some() || credentials_file.is_some() {
            layer.key = Some(KeyConfigLayer {
                selector,
                credentials_file,
                ..Default::default()
            });
        }
        if let Some(level) = get(ENV_LOG) {
            layer.logging = Some(LoggingConfigLayer {
                level: Some(level),
                ..Default::default()
            });
        }
        layer
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyConfig {
    /// KMS key version resource name or path to a PKCS#8 PEM file.
    pub selector: Option<String>,
    pub comment: String,
    pub credentials_file: Option<PathBuf>,
    pub access_token: Option<String>,
    pub kms_endpoint: String,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            selector: None,
            comment: "kssh".to_string(),
            credentials_file: None,
            access_token: None,
            kms_endpoint: "https://cloudkms.googleapis.com".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct KeyConfigLayer {
    pub selector: Option<String>,
    pub comment: Option<String>,
    pub credentials_file: Option<PathBuf>,
    pub access_token: Option<String>,
    pub kms_endpoint: Option<String>,
}

impl KeyConfig {
    fn apply(&mut self, layer: KeyConfigLayer) {
        if layer.selector.is_some() {
            self.selector = layer.selector;
        }
        if let Some(v) = layer.comment {
            self.comment = v;
        }
        if layer.credentials_file.is_some() {
            self.credentials_file = layer.credentials_file;
        }
        if layer.access_token.is_some() {
            self.access_token = layer.access_token;
        }
        if let Some(v) = layer.kms_endpoint {
            self.kms_endpoint = v;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    pub max_connections: usize,
    pub sign_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub socket_prefix: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            sign_timeout_ms: 30_000,
            shutdown_grace_ms: 2_000,
            socket_prefix: "kssh-".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct AgentConfigLayer {
    pub max_connections: Option<usize>,
    pub sign_timeout_ms: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
    pub socket_prefix: Option<String>,
}

impl AgentConfig {
    fn apply(&mut self, layer: AgentConfigLayer) {
        if let Some(v) = layer.max_connections {
            self.max_connections = v;
        }
        if let Some(v) = layer.sign_timeout_ms {
            self.sign_timeout_ms = v;
        }
        if let Some(v) = layer.shutdown_grace_ms {
            self.shutdown_grace_ms = v;
        }
        if let Some(v) = layer.socket_prefix {
            self.socket_prefix = v;
        }
    }

    pub fn sign_timeout(&self) -> Duration {
        Duration::from_millis(self.sign_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SshDefaults {
    pub port: u16,
    pub username: Option<String>,
    pub connect_timeout_ms: u64,
    pub keepalive_interval_secs: u64,
    /// `SHA256:...` fingerprint the server host key must match.
    pub host_key_fingerprint: Option<String>,
}

impl Default for SshDefaults {
    fn default() -> Self {
        Self {
            port: 22,
            username: None,
            connect_timeout_ms: 5000,
            keepalive_interval_secs: 15,
            host_key_fingerprint: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct SshDefaultsLayer {
    pub port: Option<u16>,
    pub username: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub keepalive_interval_secs: Option<u64>,
    pub host_key_fingerprint: Option<String>,
}

impl SshDefaults {
    fn apply(&mut self, layer: SshDefaultsLayer) {
        if let Some(v) = layer.port {
            self.port = v;
        }
        if layer.username.is_some() {
            self.username = layer.username;
        }
        if let Some(v) = layer.connect_timeout_ms {
            self.connect_timeout_ms = v;
        }
        if let Some(v) = layer.keepalive_interval_secs {
            self.keepalive_interval_secs = v;
        }
        if layer.host_key_fingerprint.is_some() {
            self.host_key_fingerprint = layer.host_key_fingerprint;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    pub stderr: bool,
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            stderr: true,
            file: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct LoggingConfigLayer {
    pub level: Option<String>,
    pub json: Option<bool>,
    pub stderr: Option<bool>,
    pub file: Option<bool>,
}

impl LoggingConfig {
    fn apply(&mut self, layer: LoggingConfigLayer) {
        if let Some(v) = layer.level {
            self.level = v;
        }
        if let Some(v) = layer.json {
            self.json = v;
        }
        if let Some(v) = layer.stderr {
            self.stderr = v;
        }
        if let Some(v) = layer.file {
            self.file = v;
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConfigManager {
    pub paths: AppPaths,
}

impl ConfigManager {
    pub fn new(paths: AppPaths) -> Self {
        Self { paths }
    }

    /// Defaults, then the config file, then the environment, then `overrides`.
    ///
    /// An explicit `file` must exist; the default location is optional.
    pub fn load(
        &self,
        file: Option<&Path>,
        env: AppConfigLayer,
        overrides: Option<AppConfigLayer>,
    ) -> Result<AppConfig, ConfigError> {
        let mut cfg = AppConfig::default();

        match file {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::Missing(path.to_path_buf()));
                }
                Self::load_layer(path)?.apply_to(&mut cfg);
            }
            None => {
                if self.paths.config_file.exists() {
                    Self::load_layer(&self.paths.config_file)?.apply_to(&mut cfg);
                }
            }
        }

        env.apply_to(&mut cfg);
        if let Some(layer) = overrides {
            layer.apply_to(&mut cfg);
        }

        Ok(cfg)
    }

    pub fn load_layer(path: &Path) -> Result<AppConfigLayer, ConfigError> {
        debug!(path = %path.display(), "reading config file");
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_default(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.paths.config_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(&AppConfig::default())?;
        fs::write(&self.paths.config_file, content)?;
        Ok(())
    }
}
