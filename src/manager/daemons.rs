use std::collections::BTreeMap;
use std::sync::Arc;

use crate::daemon::{Daemon, DaemonConfig};
use crate::error::{HostError, Result};
use crate::service::{Service, ServiceId};
use crate::task::{self, HostFuture};

use super::Manager;

/// Running daemons by instance name. A name may be shared by several daemons.
///
/// [`DaemonTable::take_all`] closes the table; inserts are refused until
/// [`DaemonTable::reopen`].
#[derive(Default)]
pub struct DaemonTable {
    by_name: BTreeMap<String, Vec<Daemon>>,
    closed: bool,
}

impl DaemonTable {
    /// Records `daemon`, or returns `false` if the table is closed.
    pub fn insert(&mut self, name: impl Into<String>, daemon: Daemon) -> bool {
        if self.closed {
            return false;
        }
        self.by_name.entry(name.into()).or_default().push(daemon);
        true
    }

    pub fn find(&self, name: &str) -> Option<&Daemon> {
        self.by_name.get(name).and_then(|daemons| daemons.first())
    }

    pub fn len(&self) -> usize {
        self.by_name.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Empties and closes the table, handing back every daemon.
    pub fn take_all(&mut self) -> Vec<Daemon> {
        self.closed = true;
        std::mem::take(&mut self.by_name)
            .into_values()
            .flatten()
            .collect()
    }

    pub fn reopen(&mut self) {
        self.closed = false;
    }
}

impl Manager {
    /// Launches a daemon. `argv[0]` names the instance; its text up to the
    /// first `.` names the providing module; the rest is daemon configuration.
    pub fn run_daemon<S: AsRef<str>>(&self, argv: &[S]) -> HostFuture<()> {
        let argv: Vec<String> = argv.iter().map(|s| s.as_ref().to_string()).collect();
        let Some(instance) = argv.first().cloned() else {
            return task::ready(Err(HostError::daemon_run("empty argv")));
        };

        let module_name = instance.split('.').next().unwrap_or_default();
        let Some(module) = self.module_by_name(module_name) else {
            return task::ready(Err(HostError::daemon_run(format!(
                "module \"{module_name}\" not found"
            ))));
        };

        tracing::info!(daemon = %instance, module = %module_name, "Running daemon");
        let service = module.create_service(&ServiceId::daemon());
        let daemons = Arc::clone(&self.daemons);

        self.workers.spawn(async move {
            launch(daemons, service, &argv)
                .await
                .map_err(|e| HostError::daemon_run_caused(format!("daemon \"{instance}\""), e))
        })
    }

    /// `argv[0]` is a repeat count; the rest goes to [`Manager::run_daemon`]
    /// that many times, concurrently. Fails with the first failure once every
    /// launch has settled.
    pub fn run_daemons<S: AsRef<str>>(&self, argv: &[S]) -> HostFuture<()> {
        let Some((count, rest)) = argv.split_first() else {
            return task::ready(Err(HostError::daemon_run("bad argv: missing count")));
        };
        if rest.is_empty() {
            return task::ready(Err(HostError::daemon_run("bad argv: missing daemon")));
        }
        let count: usize = match count.as_ref().parse() {
            Ok(count) => count,
            Err(e) => {
                return task::ready(Err(HostError::daemon_run(format!(
                    "bad argv: count \"{}\": {e}",
                    count.as_ref()
                ))))
            }
        };

        let launches: Vec<HostFuture<()>> = (0..count).map(|_| self.run_daemon(rest)).collect();

        self.workers.spawn(async move {
            let mut first_failure = None;
            for launch in launches {
                if let Err(e) = launch.await {
                    first_failure.get_or_insert(e);
                }
            }
            first_failure.map_or(Ok(()), Err)
        })
    }

    /// Service of the first daemon registered under `name`.
    pub fn get_daemon_service(&self, name: &str) -> HostFuture<Service> {
        let daemon = self.lock_daemons().find(name).cloned();
        match daemon {
            Some(daemon) => daemon.service(),
            None => task::ready(Err(HostError::DaemonGetFailed(format!(
                "daemon \"{name}\" not found"
            )))),
        }
    }

    pub fn get_daemon_service_as<T>(&self, name: &str) -> HostFuture<Arc<T>>
    where
        T: std::any::Any + Send + Sync,
    {
        let service = self.get_daemon_service(name);
        Box::pin(async move {
            service.await?.downcast::<T>().ok_or_else(|| {
                HostError::DaemonGetFailed("null value from daemon received".to_string())
            })
        })
    }

    pub fn daemon_count(&self) -> usize {
        self.lock_daemons().len()
    }

    pub(super) fn take_daemons(&self) -> Vec<Daemon> {
        self.lock_daemons().take_all()
    }

    pub(super) fn reopen_daemons(&self) {
        self.lock_daemons().reopen();
    }
}

async fn launch(
    daemons: Arc<std::sync::Mutex<DaemonTable>>,
    service: HostFuture<Service>,
    argv: &[String],
) -> Result<()> {
    let daemon = service
        .await?
        .as_daemon()
        .ok_or_else(|| HostError::daemon_run("module provides null daemon instance"))?;

    let instance = &argv[0];
    let config = DaemonConfig::from_args(&argv[1..])?;
    daemon.set_name(instance.clone());

    // Start under the table lock: whoever takes the table afterwards finds the
    // daemon already past `null` and able to stop it.
    let started = {
        let mut table = daemons.lock().expect("DaemonTable lock poisoned");
        if !table.insert(instance.clone(), daemon.clone()) {
            return Err(HostError::daemon_run("manager is stopping"));
        }
        daemon.start(config)
    };
    started.await
}
