use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::daemon::Daemon;

/// Contract id every daemon-providing module answers to.
pub const DAEMON_SERVICE_ID: &str = "modhost.Daemon";

/// Opaque key identifying a capability a module can instantiate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn daemon() -> Self {
        Self::new(DAEMON_SERVICE_ID)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServiceId {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Clone)]
enum Payload {
    Value(Arc<dyn Any + Send + Sync>),
    Daemon(Daemon),
}

/// Opaque handle to a service instance created by a module.
///
/// Daemons travel as their own payload, so the host reaches them without a
/// `TypeId` comparison. A module binary carries its own copy of this crate,
/// and its types only compare equal to the host's when both come from the
/// same build.
#[derive(Clone)]
pub struct Service {
    id: ServiceId,
    payload: Payload,
}

impl Service {
    pub fn new<T: Any + Send + Sync>(id: ServiceId, value: Arc<T>) -> Self {
        Self {
            id,
            payload: Payload::Value(value),
        }
    }

    /// Handle answering the daemon contract id.
    pub fn daemon(daemon: Daemon) -> Self {
        Self {
            id: ServiceId::daemon(),
            payload: Payload::Daemon(daemon),
        }
    }

    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    /// The daemon behind a [`Service::daemon`] handle.
    pub fn as_daemon(&self) -> Option<Daemon> {
        match &self.payload {
            Payload::Daemon(daemon) => Some(daemon.clone()),
            Payload::Value(_) => None,
        }
    }

    /// Recovers the concrete handle, `None` if the service is of another type.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match &self.payload {
            Payload::Value(value) => Arc::clone(value).downcast::<T>().ok(),
            Payload::Daemon(_) => None,
        }
    }

    pub fn is<T: Any>(&self) -> bool {
        match &self.payload {
            Payload::Value(value) => value.is::<T>(),
            Payload::Daemon(_) => false,
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service").field("id", &self.id).finish_non_exhaustive()
    }
}
