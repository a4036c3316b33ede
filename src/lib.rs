pub mod daemon;
pub mod error;
pub mod host_config;
pub mod hostenv;
pub mod manager;
pub mod manifest;
pub mod matcher;
pub mod module;
pub mod service;
pub mod task;

pub use daemon::{Daemon, DaemonConfig, DaemonContext, DaemonEvent, DaemonState, ServiceHook, Workload};
pub use error::{HostError, Result};
pub use manager::{Manager, ManagerConfig, WorkState};
pub use manifest::{Manifest, ServiceDecl};
pub use module::{
    try_create_service, BinaryCache, BinaryLoader, Entry, EntryBase, Module, ModuleState,
    StaticLoader, StopFuture, StopGate, StopLocker,
};
pub use service::{Service, ServiceId, DAEMON_SERVICE_ID};
pub use task::{HostFuture, TaskScope};
