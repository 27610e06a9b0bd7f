pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{
    AgentConfig, AgentConfigLayer, AppConfig, AppConfigLayer, ConfigError, ConfigManager, KeyConfig, KeyConfigLayer,
    LoggingConfig, LoggingConfigLayer, SshDefaults, SshDefaultsLayer,
};
