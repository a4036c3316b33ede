use std::path::PathBuf;

pub const MODULES_DIR_VAR: &str = "MODHOST_MODULES_DIR";
pub const CONFIG_VAR: &str = "MODHOST_CONFIG";
pub const LOG_VAR: &str = "MODHOST_LOG";
pub const RUST_LOG_VAR: &str = "RUST_LOG";

const FALLBACK_CONFIG_DIR: &str = "~/.config";
const MODHOST_SUBDIR: &str = "modhost";
const CONFIG_FILE: &str = "config.toml";
const DEFAULT_MODULES_DIR: &str = "../module";

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Modules directory ($MODHOST_MODULES_DIR or <cwd>/../module)
pub fn modules_dir() -> PathBuf {
    let dir = env_opt(MODULES_DIR_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(default_modules_dir);
    tracing::trace!(dir = %dir.display(), "Resolved modules directory");
    dir
}

fn default_modules_dir() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(DEFAULT_MODULES_DIR)
}

/// Config file ($MODHOST_CONFIG or ~/.config/modhost/config.toml)
pub fn config_path() -> PathBuf {
    let path = env_opt(CONFIG_VAR).map(PathBuf::from).unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
            .join(MODHOST_SUBDIR)
            .join(CONFIG_FILE)
    });
    tracing::trace!(path = %path.display(), "Resolved config path");
    path
}

/// Log filter ($MODHOST_LOG, then $RUST_LOG)
pub fn log_filter() -> Option<String> {
    env_opt(LOG_VAR).or_else(|| env_opt(RUST_LOG_VAR))
}
