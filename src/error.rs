use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum HostError {
    #[error("bad state: {0}")]
    BadState(String),

    #[error("run failed: {0}")]
    RunFailed(String),

    #[error("loading module \"{module}\": {reason}")]
    LoadFailed { module: String, reason: String },

    #[error("unable to create service: {0}")]
    UnableToCreateService(String),

    #[error("daemon run failed: {message}")]
    DaemonRunFailed {
        message: String,
        #[source]
        source: Option<Box<HostError>>,
    },

    #[error("daemon get failed: {0}")]
    DaemonGetFailed(String),

    #[error("daemon provides no service: {0}")]
    NoService(String),

    #[error("unable to parse module manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("bad daemon config: {0}")]
    Config(String),

    #[error("hook failed: {0}")]
    Hook(String),

    #[error("cancelled")]
    Cancelled,

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("io: {0}")]
    Io(Arc<std::io::Error>),

    #[error("toml: {0}")]
    Toml(String),
}

impl HostError {
    pub fn daemon_run(message: impl Into<String>) -> Self {
        Self::DaemonRunFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps `cause` into a daemon-run failure, keeping it as the source.
    pub fn daemon_run_caused(message: impl Into<String>, cause: HostError) -> Self {
        Self::DaemonRunFailed {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, HostError::Cancelled)
    }
}

impl From<std::io::Error> for HostError {
    fn from(e: std::io::Error) -> Self {
        HostError::Io(Arc::new(e))
    }
}

impl From<toml::de::Error> for HostError {
    fn from(e: toml::de::Error) -> Self {
        HostError::Toml(e.to_string())
    }
}

impl From<toml::ser::Error> for HostError {
    fn from(e: toml::ser::Error) -> Self {
        HostError::Toml(e.to_string())
    }
}

impl From<anyhow::Error> for HostError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<HostError>() {
            Ok(host) => host,
            Err(other) => HostError::Hook(format!("{:#}", other)),
        }
    }
}

impl From<tokio::task::JoinError> for HostError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            HostError::Cancelled
        } else {
            HostError::Panicked(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, HostError>;
