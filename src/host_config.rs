use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Optional host settings, read from `$MODHOST_CONFIG`.
///
/// ```toml
/// modules_dir = "/opt/modhost/module"
/// log_filter = "modhost=debug"
/// start_modules = ["echo*"]
/// start_services = ["echoSvc"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct HostConfig {
    /// Directory scanned for `*.manifest` files
    pub modules_dir: Option<PathBuf>,
    /// tracing filter used when no env filter is set
    pub log_filter: Option<String>,
    /// Module name globs started after discovery
    #[serde(default)]
    pub start_modules: Vec<String>,
    /// Service ids / alias globs started after discovery
    #[serde(default)]
    pub start_services: Vec<String>,
}

impl HostConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(&crate::hostenv::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading host config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::trace!(modules_dir = ?config.modules_dir, start_modules = ?config.start_modules, "Host config loaded");
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        tracing::trace!(path = %path.display(), "Host config saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig::load_from(&dir.path().join("none.toml")).unwrap();
        assert_eq!(config, HostConfig::default());
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = HostConfig {
            modules_dir: Some(PathBuf::from("/opt/modules")),
            log_filter: Some("debug".into()),
            start_modules: vec!["echo*".into()],
            start_services: vec![],
        };
        config.save_to(&path).unwrap();
        assert_eq!(HostConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn malformed_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "start_modules = 5").unwrap();
        let err = HostConfig::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("config.toml"));
    }
}
