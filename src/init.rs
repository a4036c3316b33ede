use std::path::PathBuf;

use modhost::host_config::HostConfig;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info";

fn resolve_log_filter(config: &HostConfig) -> String {
    if let Some(filter) = modhost::hostenv::log_filter() {
        return filter;
    }
    if let Some(filter) = &config.log_filter {
        return filter.clone();
    }
    DEFAULT_LOG_FILTER.to_string()
}

pub(crate) fn initialize_logging(config: &HostConfig) {
    let filter = resolve_log_filter(config);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::builder().parse_lossy(&filter))
        .with_target(true)
        .init();
    tracing::trace!(filter = %filter, "Logging initialized");
}

/// CLI flag, then $MODHOST_MODULES_DIR, then config file, then <cwd>/../module.
pub(crate) fn resolve_modules_dir(flag: Option<PathBuf>, config: &HostConfig) -> PathBuf {
    if let Some(dir) = flag {
        tracing::trace!(dir = %dir.display(), "Modules directory from --modules-dir");
        return dir;
    }
    if std::env::var_os(modhost::hostenv::MODULES_DIR_VAR).is_none() {
        if let Some(dir) = &config.modules_dir {
            tracing::trace!(dir = %dir.display(), "Modules directory from config file");
            return dir.clone();
        }
    }
    modhost::hostenv::modules_dir()
}
