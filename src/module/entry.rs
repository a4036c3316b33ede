use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::error::HostError;
use crate::manager::Manager;
use crate::manifest::Manifest;
use crate::service::{Service, ServiceId};
use crate::task::{self, HostFuture};

use super::stop_locker::{StopFuture, StopGate, StopLocker};

/// State every entry carries: the manager it was started with and its stop gate.
pub struct EntryBase {
    manager: Mutex<Option<Arc<Manager>>>,
    stop_gate: StopGate,
}

impl EntryBase {
    pub fn new() -> Self {
        Self {
            manager: Mutex::new(None),
            stop_gate: StopGate::new(),
        }
    }

    /// Manager the entry was started with, `None` outside `start`..`stop`.
    pub fn manager(&self) -> Option<Arc<Manager>> {
        self.manager.lock().expect("EntryBase lock poisoned").clone()
    }

    pub(crate) fn set_manager(&self, manager: Option<Arc<Manager>>) {
        *self.manager.lock().expect("EntryBase lock poisoned") = manager;
    }

    pub fn stop_gate(&self) -> &StopGate {
        &self.stop_gate
    }

    pub fn stop_locker(&self) -> StopLocker {
        self.stop_gate.lock()
    }
}

impl Default for EntryBase {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability interface a module binary exposes to the host.
///
/// Only [`Entry::base`] and [`Entry::manifest`] are required; every hook has a
/// default. The host records the manager in [`EntryBase`] before `start` and
/// clears it after `stop`, so overrides don't need to.
pub trait Entry: Send + Sync + 'static {
    fn base(&self) -> &EntryBase;

    fn manifest(&self) -> Manifest;

    /// Binary-level initialization, run once per load.
    fn load(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn unload(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Service-level initialization. The manager may be used to create services
    /// of other modules.
    fn start(&self, _manager: &Arc<Manager>) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Resolves once every [`StopLocker`] taken from this entry is released.
    fn stop_request(&self) -> StopFuture {
        self.base().stop_gate().wait()
    }

    fn create_service(&self, id: &ServiceId) -> HostFuture<Service> {
        tracing::trace!(service = %id, "Entry has no service factory");
        task::ready(Err(HostError::UnableToCreateService(
            "not implemented".to_string(),
        )))
    }
}

/// Builds a service only when `requested` is the id this factory provides.
pub fn try_create_service<T, F>(provides: &str, requested: &ServiceId, make: F) -> Option<Service>
where
    T: Any + Send + Sync,
    F: FnOnce() -> Arc<T>,
{
    (requested.as_str() == provides).then(|| Service::new(requested.clone(), make()))
}

/// Exports the well-known entry symbol from a module `cdylib`.
///
/// The constructor runs once per process; reloading the binary reuses the same
/// entry object.
///
/// ```ignore
/// modhost::export_entry!(EchoEntry::new);
/// ```
#[macro_export]
macro_rules! export_entry {
    ($ctor:path) => {
        #[no_mangle]
        pub fn modhost_module_entry() -> ::std::sync::Arc<dyn $crate::Entry> {
            static ENTRY: ::std::sync::OnceLock<::std::sync::Arc<dyn $crate::Entry>> =
                ::std::sync::OnceLock::new();
            ::std::sync::Arc::clone(ENTRY.get_or_init(|| {
                ::std::sync::Arc::new($ctor()) as ::std::sync::Arc<dyn $crate::Entry>
            }))
        }
    };
}
