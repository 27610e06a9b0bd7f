use crate::settings::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub config_file: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self, ConfigError> {
        let proj = ProjectDirs::from("org", "kssh", "kssh").ok_or(ConfigError::NoProjectDirs)?;
        Ok(Self::from_dirs(proj.config_dir(), proj.data_dir()))
    }

    /// Everything below one directory; used when no home directory exists.
    pub fn under(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self::from_dirs(&base.join("config"), &base.join("data"))
    }

    fn from_dirs(config_dir: &Path, data_dir: &Path) -> Self {
        Self {
            config_dir: config_dir.to_path_buf(),
            data_dir: data_dir.to_path_buf(),
            log_dir: data_dir.join("logs"),
            config_file: config_dir.join("config.toml"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_under_base() {
        let paths = AppPaths::under("/tmp/kssh-home");
        assert_eq!(paths.config_file, PathBuf::from("/tmp/kssh-home/config/config.toml"));
        assert_eq!(paths.log_dir, PathBuf::from("/tmp/kssh-home/data/logs"));
    }
}
