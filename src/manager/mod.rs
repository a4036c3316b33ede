//! The host: discovers modules, resolves services and supervises daemons.

mod batch;
mod daemons;
mod registry;

pub use daemons::DaemonTable;
pub use registry::ServiceRegistry;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{broadcast, watch, Notify};

use crate::error::{HostError, Result};
use crate::manifest::Manifest;
use crate::matcher::Patterns;
use crate::module::{self, BinaryCache, BinaryLoader, Module, ModuleState};
use crate::service::Service;
use crate::task::{self, HostFuture, TaskScope};

/// Extension of manifest files in the modules directory.
pub const MANIFEST_EXTENSION: &str = "manifest";

const INTERRUPTED_CAPACITY: usize = 16;

#[derive(Clone)]
pub struct ManagerConfig {
    pub modules_dir: PathBuf,
    pub loader: Arc<dyn BinaryLoader>,
}

impl ManagerConfig {
    pub fn new(modules_dir: impl Into<PathBuf>) -> Self {
        Self {
            modules_dir: modules_dir.into(),
            loader: Arc::new(BinaryCache::new()),
        }
    }

    /// Modules directory from `MODHOST_MODULES_DIR`, dynamic loading.
    pub fn from_env() -> Self {
        Self::new(crate::hostenv::modules_dir())
    }

    pub fn with_loader(mut self, loader: Arc<dyn BinaryLoader>) -> Self {
        self.loader = loader;
        self
    }
}

impl fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("modules_dir", &self.modules_dir)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl WorkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkState::Stopped => "stopped",
            WorkState::Starting => "starting",
            WorkState::Started => "started",
            WorkState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct Catalog {
    modules: Vec<Arc<Module>>,
    by_name: BTreeMap<String, Arc<Module>>,
    services: ServiceRegistry,
}

impl Catalog {
    fn register(&mut self, module: Arc<Module>, manifest: &Manifest) {
        self.by_name
            .entry(manifest.name.clone())
            .or_insert_with(|| Arc::clone(&module));
        self.services.register(&module, manifest);
        self.modules.push(module);
    }

    fn take(&mut self) -> Vec<Arc<Module>> {
        self.by_name.clear();
        self.services.clear();
        std::mem::take(&mut self.modules)
    }
}

pub struct Manager {
    me: Weak<Manager>,
    config: ManagerConfig,
    state: watch::Sender<WorkState>,
    catalog: Mutex<Catalog>,
    daemons: Arc<Mutex<DaemonTable>>,
    workers: TaskScope,
    shutdown: TaskScope,
    pending_interrupts: AtomicUsize,
    interrupt_signal: Notify,
    interrupted: broadcast::Sender<()>,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let (state, _) = watch::channel(WorkState::Stopped);
        let (interrupted, _) = broadcast::channel(INTERRUPTED_CAPACITY);

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            state,
            catalog: Mutex::new(Catalog::default()),
            daemons: Arc::new(Mutex::new(DaemonTable::default())),
            workers: TaskScope::new("manager"),
            shutdown: TaskScope::new("manager-shutdown"),
            pending_interrupts: AtomicUsize::new(0),
            interrupt_signal: Notify::new(),
            interrupted,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn work_state(&self) -> WorkState {
        *self.state.borrow()
    }

    pub async fn wait_state(&self, target: WorkState) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == target).await;
    }

    pub async fn wait_stopped(&self) {
        self.wait_state(WorkState::Stopped).await;
    }

    fn lock_catalog(&self) -> MutexGuard<'_, Catalog> {
        self.catalog.lock().expect("Manager catalog lock poisoned")
    }

    fn lock_daemons(&self) -> MutexGuard<'_, DaemonTable> {
        self.daemons.lock().expect("DaemonTable lock poisoned")
    }

    /// Discovered modules in registration order.
    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.lock_catalog().modules.clone()
    }

    pub fn module_by_name(&self, name: &str) -> Option<Arc<Module>> {
        self.lock_catalog().by_name.get(name).cloned()
    }

    /// Manifest reported by the entry of the binary at `path`.
    pub fn module_manifest(loader: &dyn BinaryLoader, path: &Path) -> Result<Manifest> {
        module::read_manifest(loader, path)
    }

    /// Discovers modules and serves until [`Manager::stop`] completes.
    pub async fn run(&self) -> Result<()> {
        let mut refused = None;
        self.state.send_if_modified(|state| match *state {
            WorkState::Stopped => {
                *state = WorkState::Starting;
                true
            }
            other => {
                refused = Some(other);
                false
            }
        });
        if let Some(state) = refused {
            return Err(HostError::BadState(format!("unable to run manager while {state}")));
        }

        self.workers.reopen();
        self.reopen_daemons();

        if !self.initialize_modules() {
            if !self.deinitialize_modules().await {
                tracing::error!("Modules deinitialization failed");
            }
            self.state.send_replace(WorkState::Stopped);
            return Err(HostError::RunFailed("modules initialization failed".to_string()));
        }

        self.state.send_replace(WorkState::Started);
        tracing::info!(modules = self.lock_catalog().modules.len(), "Manager started");

        self.serve().await;

        tracing::info!("Manager stopped");
        Ok(())
    }

    async fn serve(&self) {
        let mut state = self.state.subscribe();
        loop {
            let stopped = *state.borrow_and_update() == WorkState::Stopped;
            if stopped {
                break;
            }

            tokio::select! {
                _ = self.interrupt_signal.notified() => self.forward_interrupts(),
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    fn forward_interrupts(&self) {
        let pending = self.pending_interrupts.swap(0, Ordering::SeqCst);
        for _ in 0..pending {
            tracing::debug!("Manager interrupted");
            let _ = self.interrupted.send(());
        }
    }

    /// Signals an interrupt; the serving manager re-broadcasts it to
    /// [`Manager::subscribe_interrupted`] receivers.
    pub fn interrupt(&self) {
        self.pending_interrupts.fetch_add(1, Ordering::SeqCst);
        self.interrupt_signal.notify_one();
    }

    pub fn subscribe_interrupted(&self) -> broadcast::Receiver<()> {
        self.interrupted.subscribe()
    }

    /// Begins shutdown in the background: daemons first, then modules. No-op
    /// unless started.
    pub fn stop(&self) {
        let mut from = None;
        self.state.send_if_modified(|state| {
            from = Some(*state);
            if *state == WorkState::Started {
                *state = WorkState::Stopping;
                true
            } else {
                false
            }
        });

        if from != Some(WorkState::Started) {
            tracing::debug!(state = ?from, "Stop ignored");
            return;
        }
        let Some(manager) = self.me.upgrade() else {
            return;
        };

        tracing::info!("Stopping manager");
        let _detached = self.shutdown.spawn(async move {
            manager.shutdown_sequence().await;
            Ok(())
        });
    }

    async fn shutdown_sequence(&self) {
        let daemons = self.take_daemons();
        tracing::debug!(count = daemons.len(), "Stopping daemons");

        let stops: Vec<HostFuture<()>> = daemons.iter().map(|d| d.stop()).collect();
        for (daemon, stop) in daemons.iter().zip(stops) {
            if let Err(e) = stop.await {
                tracing::warn!(daemon = %daemon.name(), "Daemon stop failed: {}", e);
            }
        }

        if !self.deinitialize_modules().await {
            tracing::error!("Modules deinitialization failed");
        }

        self.workers.stop().await;
        self.state.send_replace(WorkState::Stopped);
    }

    fn initialize_modules(&self) -> bool {
        let dir = match std::fs::canonicalize(&self.config.modules_dir) {
            Ok(dir) => dir,
            Err(e) => {
                tracing::error!(dir = %self.config.modules_dir.display(), "Unable to resolve modules directory: {}", e);
                return false;
            }
        };

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(dir = %dir.display(), "Unable to list modules directory: {}", e);
                return false;
            }
        };

        let mut manifests: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path.extension().and_then(|e| e.to_str()) == Some(MANIFEST_EXTENSION)
            })
            .collect();
        manifests.sort();

        tracing::debug!(dir = %dir.display(), count = manifests.len(), "Discovering modules");

        let mut has_failures = false;
        let mut catalog = self.lock_catalog();
        for path in manifests {
            let module = Arc::new(Module::new(
                self.me.clone(),
                path,
                Arc::clone(&self.config.loader),
            ));
            if !module.attach() {
                has_failures = true;
                continue;
            }
            if let Some(manifest) = module.manifest() {
                catalog.register(module, &manifest);
            }
        }

        !has_failures
    }

    /// Detaches every module. Modules that refuse to detach stay listed.
    async fn deinitialize_modules(&self) -> bool {
        let modules = self.lock_catalog().take();
        let detached = batch::for_each_module(&self.workers, &modules, "detach", |m| m.detach())
            .await
            .is_empty();

        let stranded: Vec<Arc<Module>> = modules
            .into_iter()
            .filter(|m| !matches!(m.state(), ModuleState::Null | ModuleState::AttachError))
            .collect();
        if !stranded.is_empty() {
            self.lock_catalog().modules.extend(stranded);
        }

        detached
    }

    /// Starts modules whose name matches a glob in `by_names`, or that declare
    /// a service id listed in `by_services` or an alias matching one of its
    /// globs.
    pub async fn start_modules<N, S>(&self, by_names: N, by_services: S) -> bool
    where
        N: IntoIterator,
        N::Item: AsRef<str>,
        S: IntoIterator,
        S::Item: AsRef<str>,
    {
        let names = Patterns::new(by_names);
        let services = Patterns::new(by_services);

        let selected: Vec<Arc<Module>> = self
            .modules()
            .into_iter()
            .filter(|module| {
                let Some(manifest) = module.manifest() else {
                    return false;
                };
                names.matches(&manifest.name)
                    || manifest.service_ids.iter().any(|decl| {
                        services.contains(decl.id.as_str())
                            || decl.alias().is_some_and(|alias| services.matches(alias))
                    })
            })
            .collect();

        tracing::info!(count = selected.len(), "Starting modules");
        batch::for_each_module(&self.workers, &selected, "start", |m| m.start())
            .await
            .is_empty()
    }

    /// Creates a service by id, or by alias when no module declares the id.
    pub fn create_service(&self, key: &str) -> HostFuture<Service> {
        let resolved = self.lock_catalog().services.resolve(key);
        match resolved {
            Ok((id, module)) => {
                tracing::debug!(service = %id, path = %module.manifest_file().display(), "Creating service");
                self.workers.spawn(module.create_service(&id))
            }
            Err(e) => task::ready(Err(e)),
        }
    }

    pub fn create_service_as<T>(&self, key: &str) -> HostFuture<Arc<T>>
    where
        T: std::any::Any + Send + Sync,
    {
        let service = self.create_service(key);
        Box::pin(async move {
            service.await?.downcast::<T>().ok_or_else(|| {
                HostError::UnableToCreateService("null value from module received".to_string())
            })
        })
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("modules_dir", &self.config.modules_dir)
            .field("state", &self.work_state())
            .finish_non_exhaustive()
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        let modules = self
            .catalog
            .get_mut()
            .map(|catalog| catalog.take())
            .unwrap_or_default();
        for module in modules {
            if !module.detach() {
                tracing::error!(path = %module.manifest_file().display(), "Unable to detach module on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{Daemon, DaemonConfig, DaemonContext, DaemonState, ServiceHook, Workload};
    use crate::manifest::ServiceDecl;
    use crate::module::testing::*;
    use crate::module::{Entry, EntryBase};
    use crate::service::{ServiceId, DAEMON_SERVICE_ID};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    async fn running(manager: &Arc<Manager>) -> tokio::task::JoinHandle<Result<()>> {
        let runner = tokio::spawn({
            let manager = Arc::clone(manager);
            async move { manager.run().await }
        });
        tokio::time::timeout(Duration::from_secs(5), manager.wait_state(WorkState::Started))
            .await
            .expect("manager did not start");
        runner
    }

    async fn stopped(manager: &Arc<Manager>, runner: tokio::task::JoinHandle<Result<()>>) {
        manager.stop();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("manager did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(manager.work_state(), WorkState::Stopped);
    }

    fn echo_manifest() -> Manifest {
        Manifest::new("echo", "libecho.so")
            .with_service(ServiceDecl::new("X").with_alias("echoSvc"))
    }

    #[tokio::test]
    async fn resolves_services_by_id_and_alias() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), &echo_manifest());
        let echo = ScriptedEntry::new(echo_manifest());
        let manager = manager_for(dir.path(), &[Arc::clone(&echo)]);
        let runner = running(&manager).await;

        let by_alias = manager.create_service_as::<String>("echoSvc").await.unwrap();
        assert_eq!(by_alias.as_str(), "echo");
        let by_id = manager.create_service("X").await.unwrap();
        assert_eq!(by_id.id().as_str(), "X");

        let err = manager.create_service("doesNotExist").await.unwrap_err();
        assert!(matches!(err, HostError::UnableToCreateService(_)));

        stopped(&manager, runner).await;
        assert!(manager.modules().is_empty());
        assert_eq!(Calls::get(&echo.calls.unload), 1);
    }

    #[tokio::test]
    async fn colliding_service_resolves_to_first_module() {
        let dir = tempfile::tempdir().unwrap();
        let a = Manifest::new("a", "liba.so").with_service(ServiceDecl::new("shared"));
        let b = Manifest::new("b", "libb.so").with_service(ServiceDecl::new("shared"));
        write_manifest(dir.path(), &a);
        write_manifest(dir.path(), &b);
        let manager = manager_for(dir.path(), &[ScriptedEntry::new(a), ScriptedEntry::new(b)]);
        let runner = running(&manager).await;

        for _ in 0..3 {
            let svc = manager.create_service_as::<String>("shared").await.unwrap();
            assert_eq!(svc.as_str(), "a");
        }

        stopped(&manager, runner).await;
    }

    #[tokio::test]
    async fn batch_start_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let entries: Vec<Arc<ScriptedEntry>> = (0..4)
            .map(|i| {
                let manifest = Manifest::new(format!("m{i}"), format!("libm{i}.so"));
                write_manifest(dir.path(), &manifest);
                ScriptedEntry::new(manifest)
            })
            .collect();
        entries[2].fail_start.store(true, Ordering::SeqCst);

        let manager = manager_for(dir.path(), &entries);
        let runner = running(&manager).await;

        let failed =
            batch::for_each_module(&manager.workers, &manager.modules(), "start", |m| m.start())
                .await;
        let failed_dir = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(failed, vec![failed_dir.join("m2.manifest")]);
        for entry in &entries {
            assert_eq!(Calls::get(&entry.calls.start), 1);
        }
        let states: Vec<ModuleState> = manager.modules().iter().map(|m| m.state()).collect();
        assert_eq!(
            states,
            vec![
                ModuleState::Started,
                ModuleState::Started,
                ModuleState::StartError,
                ModuleState::Started
            ]
        );

        assert!(manager.start_modules(["m*"], Vec::<String>::new()).await);
        assert_eq!(Calls::get(&entries[2].calls.start), 1);

        stopped(&manager, runner).await;
        for entry in &entries {
            assert_eq!(Calls::get(&entry.calls.stop), 1);
        }
    }

    #[tokio::test]
    async fn selects_modules_by_service_id_and_alias() {
        let dir = tempfile::tempdir().unwrap();
        let other = Manifest::new("other", "libother.so").with_service(ServiceDecl::new("Y"));
        write_manifest(dir.path(), &echo_manifest());
        write_manifest(dir.path(), &other);
        let manager = manager_for(
            dir.path(),
            &[ScriptedEntry::new(echo_manifest()), ScriptedEntry::new(other)],
        );
        let runner = running(&manager).await;

        assert!(manager.start_modules(Vec::<String>::new(), ["echo*"]).await);
        assert_eq!(manager.module_by_name("echo").unwrap().state(), ModuleState::Started);
        assert_eq!(manager.module_by_name("other").unwrap().state(), ModuleState::Attached);

        assert!(manager.start_modules(Vec::<String>::new(), ["Y"]).await);
        assert_eq!(manager.module_by_name("other").unwrap().state(), ModuleState::Started);

        stopped(&manager, runner).await;
    }

    #[tokio::test]
    async fn run_fails_on_bad_manifest_and_returns_to_stopped() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), &echo_manifest());
        std::fs::write(dir.path().join("broken.manifest"), "name = ").unwrap();
        let manager = manager_for(dir.path(), &[ScriptedEntry::new(echo_manifest())]);

        let err = manager.run().await.unwrap_err();
        assert!(matches!(err, HostError::RunFailed(_)));
        assert_eq!(manager.work_state(), WorkState::Stopped);
        assert!(manager.modules().is_empty());
    }

    #[tokio::test]
    async fn run_fails_without_modules_dir() {
        let manager = Manager::new(ManagerConfig::new("/nonexistent/modhost/modules"));
        assert!(matches!(manager.run().await, Err(HostError::RunFailed(_))));
    }

    #[tokio::test]
    async fn second_run_is_bad_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(dir.path(), &[]);
        let runner = running(&manager).await;

        assert!(matches!(manager.run().await, Err(HostError::BadState(_))));

        stopped(&manager, runner).await;
        manager.stop();
        assert_eq!(manager.work_state(), WorkState::Stopped);
    }

    #[tokio::test]
    async fn interrupts_are_rebroadcast() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(dir.path(), &[]);
        let mut interrupted = manager.subscribe_interrupted();
        let runner = running(&manager).await;

        manager.interrupt();
        tokio::time::timeout(Duration::from_secs(5), interrupted.recv())
            .await
            .unwrap()
            .unwrap();

        stopped(&manager, runner).await;
    }

    struct Listener {
        port: AtomicU16,
    }

    #[async_trait]
    impl Workload for Listener {
        async fn start(&self, _ctx: DaemonContext, config: DaemonConfig) -> anyhow::Result<()> {
            let port = config
                .get_parsed("port")
                .ok_or_else(|| anyhow::anyhow!("--port is required"))?;
            self.port.store(port, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ServiceHook for Listener {
        async fn service(&self) -> anyhow::Result<Service> {
            Ok(Service::new(
                ServiceId::new("echo.Port"),
                Arc::new(self.port.load(Ordering::SeqCst)),
            ))
        }
    }

    struct DaemonEntry {
        base: EntryBase,
    }

    impl Entry for DaemonEntry {
        fn base(&self) -> &EntryBase {
            &self.base
        }

        fn manifest(&self) -> Manifest {
            daemon_manifest()
        }

        fn create_service(&self, id: &ServiceId) -> HostFuture<Service> {
            if id.as_str() != DAEMON_SERVICE_ID {
                return task::ready(Err(HostError::UnableToCreateService(id.to_string())));
            }
            let daemon = Daemon::with_service(Listener {
                port: AtomicU16::new(0),
            });
            task::ready(Ok(daemon.into_service()))
        }
    }

    fn daemon_manifest() -> Manifest {
        Manifest::new("echo", "libecho.so").with_service(ServiceDecl::new(DAEMON_SERVICE_ID))
    }

    fn daemon_manager(dir: &Path) -> Arc<Manager> {
        write_manifest(dir, &daemon_manifest());
        let loader = module::StaticLoader::new().with_entry("libecho.so", || {
            Arc::new(DaemonEntry {
                base: EntryBase::new(),
            }) as Arc<dyn Entry>
        });
        Manager::new(ManagerConfig::new(dir).with_loader(Arc::new(loader)))
    }

    #[tokio::test]
    async fn run_daemon_registers_instance_by_argv0() {
        let dir = tempfile::tempdir().unwrap();
        let manager = daemon_manager(dir.path());
        let runner = running(&manager).await;

        manager.run_daemon(&["echo.1", "--port", "9"]).await.unwrap();
        assert_eq!(manager.daemon_count(), 1);

        let port = manager.get_daemon_service_as::<u16>("echo.1").await.unwrap();
        assert_eq!(*port, 9);

        let err = manager.get_daemon_service("missing").await.unwrap_err();
        assert!(matches!(err, HostError::DaemonGetFailed(_)));

        stopped(&manager, runner).await;
        assert_eq!(manager.daemon_count(), 0);
    }

    #[tokio::test]
    async fn run_daemon_failures_are_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let manager = daemon_manager(dir.path());
        let runner = running(&manager).await;

        let err = manager.run_daemon(&["nope.1"]).await.unwrap_err();
        assert!(matches!(err, HostError::DaemonRunFailed { .. }));

        let err = manager.run_daemon(&["echo.2"]).await.unwrap_err();
        match err {
            HostError::DaemonRunFailed { source: Some(cause), .. } => {
                assert!(cause.to_string().contains("--port is required"));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(manager.run_daemon::<&str>(&[]).await.is_err());
        stopped(&manager, runner).await;
    }

    #[tokio::test]
    async fn run_daemons_launches_count_instances() {
        let dir = tempfile::tempdir().unwrap();
        let manager = daemon_manager(dir.path());
        let runner = running(&manager).await;

        manager
            .run_daemons(&["3", "echo.n", "--port", "7"])
            .await
            .unwrap();
        assert_eq!(manager.daemon_count(), 3);

        assert!(manager.run_daemons(&["x", "echo.n"]).await.is_err());
        assert!(manager.run_daemons(&["2", "echo.bad"]).await.is_err());
        assert_eq!(manager.daemon_count(), 5);

        stopped(&manager, runner).await;
    }

    struct GatedEntry {
        base: EntryBase,
        release: Arc<Notify>,
        daemon: Daemon,
    }

    impl Entry for GatedEntry {
        fn base(&self) -> &EntryBase {
            &self.base
        }

        fn manifest(&self) -> Manifest {
            daemon_manifest()
        }

        fn create_service(&self, _id: &ServiceId) -> HostFuture<Service> {
            let release = Arc::clone(&self.release);
            let daemon = self.daemon.clone();
            Box::pin(async move {
                release.notified().await;
                Ok(daemon.into_service())
            })
        }
    }

    #[tokio::test]
    async fn launch_settling_after_shutdown_took_the_table_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), &daemon_manifest());
        let release = Arc::new(Notify::new());
        let daemon = Daemon::with_service(Listener {
            port: AtomicU16::new(0),
        });
        let loader = module::StaticLoader::new().with_entry("libecho.so", {
            let release = Arc::clone(&release);
            let daemon = daemon.clone();
            move || {
                Arc::new(GatedEntry {
                    base: EntryBase::new(),
                    release: Arc::clone(&release),
                    daemon: daemon.clone(),
                }) as Arc<dyn Entry>
            }
        });
        let manager = Manager::new(ManagerConfig::new(dir.path()).with_loader(Arc::new(loader)));
        let runner = running(&manager).await;

        let launch = manager.run_daemon(&["echo.1", "--port", "9"]);
        assert!(manager.take_daemons().is_empty());
        release.notify_one();

        match launch.await.unwrap_err() {
            HostError::DaemonRunFailed { source: Some(cause), .. } => {
                assert!(cause.to_string().contains("manager is stopping"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(manager.daemon_count(), 0);
        assert_eq!(daemon.state(), DaemonState::Null);

        stopped(&manager, runner).await;

        let runner = running(&manager).await;
        release.notify_one();
        manager.run_daemon(&["echo.2", "--port", "9"]).await.unwrap();
        assert_eq!(manager.daemon_count(), 1);
        stopped(&manager, runner).await;
        assert_eq!(daemon.state(), DaemonState::Stopped);
    }
}
