//! One discovered module and its lifecycle.
//!
//! ```text
//! null ──attach──> attached | attachError
//! attached ──load──> loading ──> loaded | loadError
//! loaded ──start──> starting ──> started | startError
//! started | startError ──stop──> stopping ──> loaded
//! loaded | loadError ──unload──> unloading ──> attached
//! attached | attachError ──detach──> null
//! ```
//!
//! Every operation returns `true` when its goal is (or already was) reached and
//! `false` when it cannot apply. Hook failures are logged here and never
//! propagate further.

mod binary;
mod entry;
mod stop_locker;

pub use binary::{
    read_manifest, BinaryCache, BinaryLoader, EntryFn, LoadedBinary, StaticLoader,
    MODHOST_ENTRY_SYMBOL,
};
pub use entry::{try_create_service, Entry, EntryBase};
pub use stop_locker::{StopFuture, StopGate, StopLocker};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::error::HostError;
use crate::manager::Manager;
use crate::manifest::Manifest;
use crate::service::{Service, ServiceId};
use crate::task::{self, HostFuture};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleState {
    Null,
    Attached,
    AttachError,
    Loading,
    Loaded,
    LoadError,
    Unloading,
    Starting,
    Started,
    StartError,
    Stopping,
}

impl ModuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Null => "null",
            ModuleState::Attached => "attached",
            ModuleState::AttachError => "attachError",
            ModuleState::Loading => "loading",
            ModuleState::Loaded => "loaded",
            ModuleState::LoadError => "loadError",
            ModuleState::Unloading => "unloading",
            ModuleState::Starting => "starting",
            ModuleState::Started => "started",
            ModuleState::StartError => "startError",
            ModuleState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Slot {
    state: ModuleState,
    manifest: Option<Manifest>,
    binary: Option<Arc<LoadedBinary>>,
    /// Set by `stop_request`, claimed by the `shutdown` that finishes the stop.
    stop_requested: bool,
}

impl Slot {
    fn entry(&self) -> Option<Arc<dyn Entry>> {
        self.binary.as_ref().map(|b| b.entry())
    }
}

pub struct Module {
    manager: Weak<Manager>,
    manifest_file: PathBuf,
    loader: Arc<dyn BinaryLoader>,
    slot: Mutex<Slot>,
}

impl Module {
    pub fn new(manager: Weak<Manager>, manifest_file: PathBuf, loader: Arc<dyn BinaryLoader>) -> Self {
        Self {
            manager,
            manifest_file,
            loader,
            slot: Mutex::new(Slot {
                state: ModuleState::Null,
                manifest: None,
                binary: None,
                stop_requested: false,
            }),
        }
    }

    pub fn manifest_file(&self) -> &Path {
        &self.manifest_file
    }

    pub fn state(&self) -> ModuleState {
        self.lock().state
    }

    pub fn manifest(&self) -> Option<Manifest> {
        self.lock().manifest.clone()
    }

    pub fn name(&self) -> Option<String> {
        self.lock().manifest.as_ref().map(|m| m.name.clone())
    }

    /// Entry of the loaded binary, `None` unless loaded.
    pub fn entry(&self) -> Option<Arc<dyn Entry>> {
        self.lock().entry()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().expect("Module lock poisoned")
    }

    fn label(&self) -> String {
        self.manifest_file.display().to_string()
    }

    pub fn attach(&self) -> bool {
        let mut slot = self.lock();
        match slot.state {
            ModuleState::Null | ModuleState::AttachError => {}
            _ => return true,
        }

        match Manifest::from_file(&self.manifest_file) {
            Ok(manifest) => {
                tracing::debug!(module = %manifest.name, path = %self.label(), "Module attached");
                slot.manifest = Some(manifest);
                slot.state = ModuleState::Attached;
                true
            }
            Err(e) => {
                tracing::error!(path = %self.label(), "Unable to attach module: {}", e);
                slot.manifest = None;
                slot.state = ModuleState::AttachError;
                false
            }
        }
    }

    pub fn detach(&self) -> bool {
        self.unload();

        let mut slot = self.lock();
        match slot.state {
            ModuleState::Null => true,
            ModuleState::Attached | ModuleState::AttachError => {
                slot.manifest = None;
                slot.state = ModuleState::Null;
                true
            }
            other => {
                tracing::error!(path = %self.label(), state = %other, "Unable to detach module");
                false
            }
        }
    }

    pub fn load(&self) -> bool {
        self.attach();

        let binary_path = {
            let mut slot = self.lock();
            match slot.state {
                ModuleState::Attached => {}
                ModuleState::Loaded
                | ModuleState::Starting
                | ModuleState::Started
                | ModuleState::StartError
                | ModuleState::Stopping => return true,
                _ => return false,
            }
            let Some(manifest) = slot.manifest.as_ref() else {
                return false;
            };
            let dir = self.manifest_file.parent().unwrap_or_else(|| Path::new("."));
            let path = dir.join(&manifest.main_binary);
            slot.state = ModuleState::Loading;
            path
        };

        let opened = self.loader.open(&binary_path).and_then(|binary| {
            binary.entry().load().map_err(|e| HostError::LoadFailed {
                module: binary_path.display().to_string(),
                reason: format!("{:#}", e),
            })?;
            Ok(binary)
        });

        let mut slot = self.lock();
        match opened {
            Ok(binary) => {
                tracing::debug!(path = %binary.path().display(), "Module loaded");
                slot.binary = Some(binary);
                slot.state = ModuleState::Loaded;
                true
            }
            Err(e) => {
                tracing::error!(path = %self.label(), "Unable to load module: {}", e);
                slot.binary = None;
                slot.state = ModuleState::LoadError;
                false
            }
        }
    }

    pub fn unload(&self) -> bool {
        self.stop();

        let binary = {
            let mut slot = self.lock();
            match slot.state {
                ModuleState::Null | ModuleState::Attached | ModuleState::AttachError => {
                    return true
                }
                ModuleState::Loaded | ModuleState::LoadError => {}
                other => {
                    tracing::error!(path = %self.label(), state = %other, "Unable to unload module");
                    return false;
                }
            }
            slot.state = ModuleState::Unloading;
            slot.binary.take()
        };

        if let Some(binary) = binary {
            if let Err(e) = binary.entry().unload() {
                tracing::error!(path = %self.label(), "Unload hook failed, ignored: {:#}", e);
            }
        }

        self.lock().state = ModuleState::Attached;
        tracing::debug!(path = %self.label(), "Module unloaded");
        true
    }

    pub fn start(&self) -> bool {
        self.load();

        let entry = {
            let mut slot = self.lock();
            match slot.state {
                ModuleState::Loaded => {}
                ModuleState::Started | ModuleState::StartError => return true,
                _ => return false,
            }
            slot.state = ModuleState::Starting;
            slot.entry()
        };

        let started = match (entry, self.manager.upgrade()) {
            (Some(entry), Some(manager)) => {
                entry.base().set_manager(Some(Arc::clone(&manager)));
                entry.start(&manager)
            }
            (None, _) => Err(anyhow::anyhow!("no entry in loaded module")),
            (_, None) => Err(anyhow::anyhow!("manager is gone")),
        };

        let mut slot = self.lock();
        match started {
            Ok(()) => {
                tracing::info!(path = %self.label(), "Module started");
                slot.state = ModuleState::Started;
                true
            }
            Err(e) => {
                tracing::error!(path = %self.label(), "Unable to start module: {:#}", e);
                slot.state = ModuleState::StartError;
                false
            }
        }
    }

    /// Moves to `stopping` and hands back the entry's stop gate. The module
    /// stays in `stopping` until [`Module::shutdown`] finishes the stop.
    pub fn stop_request(&self) -> StopFuture {
        let entry = {
            let mut slot = self.lock();
            match slot.state {
                ModuleState::Started | ModuleState::StartError => {}
                other => {
                    tracing::warn!(path = %self.label(), state = %other, "Stop request ignored");
                    return task::ready(Ok(()));
                }
            }
            slot.state = ModuleState::Stopping;
            slot.stop_requested = true;
            slot.entry()
        };

        match entry {
            Some(entry) => entry.stop_request(),
            None => task::ready(Ok(())),
        }
    }

    pub fn stop(&self) -> bool {
        let entry = {
            let mut slot = self.lock();
            match slot.state {
                ModuleState::Started | ModuleState::StartError => {}
                ModuleState::Starting | ModuleState::Stopping => return false,
                _ => return true,
            }
            slot.state = ModuleState::Stopping;
            slot.entry()
        };

        self.finish_stop(entry);
        true
    }

    /// Graceful stop: waits until every stop locker of the entry is released,
    /// then runs the stop hook. Returns `false` while a plain [`Module::stop`]
    /// is in flight.
    pub async fn shutdown(&self) -> bool {
        let requested = {
            let slot = self.lock();
            match (slot.state, slot.stop_requested) {
                (ModuleState::Stopping, true) => Some(slot.entry()),
                (ModuleState::Stopping, false) => return false,
                _ => None,
            }
        };
        let gate = match requested {
            Some(Some(entry)) => entry.stop_request(),
            Some(None) => task::ready(Ok(())),
            None => self.stop_request(),
        };
        if let Err(e) = gate.await {
            tracing::warn!(path = %self.label(), "Stop gate failed: {}", e);
        }

        let entry = {
            let mut slot = self.lock();
            if slot.state != ModuleState::Stopping {
                return matches!(
                    slot.state,
                    ModuleState::Null
                        | ModuleState::Attached
                        | ModuleState::AttachError
                        | ModuleState::Loaded
                        | ModuleState::LoadError
                );
            }
            if !std::mem::take(&mut slot.stop_requested) {
                return false;
            }
            slot.entry()
        };

        self.finish_stop(entry);
        true
    }

    fn finish_stop(&self, entry: Option<Arc<dyn Entry>>) {
        if let Some(entry) = entry {
            if let Err(e) = entry.stop() {
                tracing::warn!(path = %self.label(), "Stop hook failed, ignored: {:#}", e);
            }
            entry.base().set_manager(None);
        }

        let mut slot = self.lock();
        slot.state = ModuleState::Loaded;
        slot.stop_requested = false;
        tracing::debug!(path = %self.label(), "Module stopped");
    }

    pub fn create_service(&self, id: &ServiceId) -> HostFuture<Service> {
        if self.state() == ModuleState::Attached && !self.start() {
            return task::ready(Err(HostError::UnableToCreateService(format!(
                "unable to start module {}",
                self.label()
            ))));
        }

        let entry = {
            let slot = self.lock();
            if slot.state != ModuleState::Started {
                return task::ready(Err(HostError::UnableToCreateService(format!(
                    "module {} is {}",
                    self.label(),
                    slot.state
                ))));
            }
            slot.entry()
        };

        match entry {
            Some(entry) => entry.create_service(id),
            None => task::ready(Err(HostError::UnableToCreateService(format!(
                "module {} has no entry",
                self.label()
            )))),
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("manifest_file", &self.manifest_file)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        let state = match self.slot.get_mut() {
            Ok(slot) => slot.state,
            Err(_) => return,
        };
        if matches!(state, ModuleState::Null | ModuleState::AttachError) || std::thread::panicking() {
            return;
        }
        tracing::error!(path = %self.label(), state = %state, "Module dropped without detach");
        if cfg!(debug_assertions) {
            panic!("module {} dropped while {}", self.label(), state);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::manifest::ServiceDecl;
    use std::sync::atomic::Ordering;

    struct Fixture {
        _dir: tempfile::TempDir,
        manager: Arc<Manager>,
        entry: Arc<ScriptedEntry>,
        module: Module,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::new("echo", "libecho.so").with_service(ServiceDecl::new("X"));
        let path = write_manifest(dir.path(), &manifest);
        let entry = ScriptedEntry::new(manifest);
        let loader: Arc<dyn BinaryLoader> = Arc::new(loader_for(&[Arc::clone(&entry)]));
        let manager = manager_for(dir.path(), &[Arc::clone(&entry)]);
        let module = Module::new(Arc::downgrade(&manager), path, loader);
        Fixture {
            _dir: dir,
            manager,
            entry,
            module,
        }
    }

    #[test]
    fn forward_and_back_through_every_state() {
        let f = fixture();
        let m = &f.module;
        assert_eq!(m.state(), ModuleState::Null);

        assert!(m.attach());
        assert_eq!(m.state(), ModuleState::Attached);
        assert_eq!(m.name().as_deref(), Some("echo"));

        assert!(m.load());
        assert_eq!(m.state(), ModuleState::Loaded);
        assert!(m.entry().is_some());

        assert!(m.start());
        assert_eq!(m.state(), ModuleState::Started);
        assert!(f.entry.base.manager().is_some());

        assert!(m.stop());
        assert_eq!(m.state(), ModuleState::Loaded);
        assert!(f.entry.base.manager().is_none());

        assert!(m.unload());
        assert_eq!(m.state(), ModuleState::Attached);
        assert!(m.entry().is_none());

        assert!(m.detach());
        assert_eq!(m.state(), ModuleState::Null);
        assert!(m.manifest().is_none());
    }

    #[test]
    fn operations_are_idempotent() {
        let f = fixture();
        let m = &f.module;

        assert!(m.start());
        assert!(m.load());
        assert!(m.attach());
        assert!(m.start());
        assert_eq!(m.state(), ModuleState::Started);
        assert_eq!(Calls::get(&f.entry.calls.load), 1);
        assert_eq!(Calls::get(&f.entry.calls.start), 1);

        assert!(m.detach());
        assert!(m.detach());
        assert!(m.stop());
        assert!(m.unload());
        assert_eq!(m.state(), ModuleState::Null);
        assert_eq!(Calls::get(&f.entry.calls.stop), 1);
        assert_eq!(Calls::get(&f.entry.calls.unload), 1);
    }

    #[test]
    fn detach_cascades_through_stop_and_unload() {
        let f = fixture();
        assert!(f.module.start());
        assert!(f.module.detach());
        assert_eq!(f.module.state(), ModuleState::Null);
        assert_eq!(Calls::get(&f.entry.calls.stop), 1);
        assert_eq!(Calls::get(&f.entry.calls.unload), 1);
    }

    #[test]
    fn missing_manifest_is_attach_error() {
        let f = fixture();
        let loader: Arc<dyn BinaryLoader> = Arc::new(StaticLoader::new());
        let m = Module::new(
            Arc::downgrade(&f.manager),
            f._dir.path().join("absent.manifest"),
            loader,
        );
        assert!(!m.attach());
        assert_eq!(m.state(), ModuleState::AttachError);
        assert!(!m.load());
        assert!(!m.start());
        assert_eq!(m.state(), ModuleState::AttachError);
        assert!(m.detach());
        assert_eq!(m.state(), ModuleState::Null);
    }

    #[test]
    fn load_hook_failure_leaves_binary_closed() {
        let f = fixture();
        f.entry.fail_load.store(true, Ordering::SeqCst);

        assert!(!f.module.load());
        assert_eq!(f.module.state(), ModuleState::LoadError);
        assert!(f.module.entry().is_none());

        assert!(!f.module.load());
        assert!(!f.module.start());
        assert_eq!(f.module.state(), ModuleState::LoadError);

        f.entry.fail_load.store(false, Ordering::SeqCst);
        assert!(f.module.unload());
        assert_eq!(f.module.state(), ModuleState::Attached);
        assert!(f.module.load());
        assert_eq!(f.module.state(), ModuleState::Loaded);
        assert!(f.module.detach());
    }

    #[test]
    fn start_failure_is_start_error_and_stop_returns_to_loaded() {
        let f = fixture();
        f.entry.fail_start.store(true, Ordering::SeqCst);

        assert!(!f.module.start());
        assert_eq!(f.module.state(), ModuleState::StartError);
        assert!(f.module.start());
        assert_eq!(Calls::get(&f.entry.calls.start), 1);

        assert!(f.module.stop());
        assert_eq!(f.module.state(), ModuleState::Loaded);
        assert!(f.module.detach());
    }

    #[tokio::test]
    async fn stop_request_moves_to_stopping_and_blocks_stop() {
        let f = fixture();
        assert!(f.module.start());

        let locker = f.entry.base.stop_locker();
        let gate = f.module.stop_request();
        assert_eq!(f.module.state(), ModuleState::Stopping);
        assert!(!f.module.stop());
        assert!(!f.module.unload());
        assert!(!f.module.detach());
        assert_eq!(f.module.state(), ModuleState::Stopping);

        drop(locker);
        gate.await.unwrap();
        assert!(f.module.shutdown().await);
        assert_eq!(f.module.state(), ModuleState::Loaded);
        assert!(f.module.detach());
    }

    #[tokio::test]
    async fn shutdown_leaves_plain_stop_in_flight_alone() {
        let f = fixture();
        assert!(f.module.start());
        // A plain stop between its state change and its stop hook.
        f.module.lock().state = ModuleState::Stopping;

        assert!(!f.module.shutdown().await);
        assert_eq!(Calls::get(&f.entry.calls.stop), 0);
        assert_eq!(f.module.state(), ModuleState::Stopping);

        f.module.lock().state = ModuleState::Started;
        assert!(f.module.stop());
        assert_eq!(Calls::get(&f.entry.calls.stop), 1);
        assert!(f.module.detach());
    }

    #[tokio::test]
    async fn concurrent_shutdowns_run_stop_hook_once() {
        let f = fixture();
        assert!(f.module.start());

        let locker = f.entry.base.stop_locker();
        let _gate = f.module.stop_request();
        let (first, second, ()) = tokio::join!(f.module.shutdown(), f.module.shutdown(), async move {
            tokio::task::yield_now().await;
            drop(locker);
        });

        assert!(first && second);
        assert_eq!(Calls::get(&f.entry.calls.stop), 1);
        assert_eq!(f.module.state(), ModuleState::Loaded);
        assert!(f.module.detach());
    }

    #[tokio::test]
    async fn stop_request_from_wrong_state_resolves_immediately() {
        let f = fixture();
        f.module.stop_request().await.unwrap();
        assert_eq!(f.module.state(), ModuleState::Null);
    }

    #[tokio::test]
    async fn create_service_starts_attached_module() {
        let f = fixture();
        assert!(f.module.attach());

        let svc = f.module.create_service(&ServiceId::new("X")).await.unwrap();
        assert_eq!(f.module.state(), ModuleState::Started);
        assert_eq!(svc.downcast::<String>().as_deref().map(String::as_str), Some("echo"));

        let err = f
            .module
            .create_service(&ServiceId::new("unknown"))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::UnableToCreateService(_)));
        assert!(f.module.detach());
    }

    #[tokio::test]
    async fn create_service_requires_started() {
        let f = fixture();
        let err = f
            .module
            .create_service(&ServiceId::new("X"))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::UnableToCreateService(_)));
        assert_eq!(f.module.state(), ModuleState::Null);

        assert!(f.module.load());
        assert!(f.module.create_service(&ServiceId::new("X")).await.is_err());
        assert_eq!(f.module.state(), ModuleState::Loaded);
        assert!(f.module.detach());
    }
}
