//! Lifecycle state machine for long-running hosted workloads.
//!
//! A [`Daemon`] wraps a [`Workload`] (start/stop hooks) and an optional
//! [`ServiceHook`], and drives them through
//! `null → starting → started | failed`, `started → stopping → stopped`.
//! Every transition is broadcast as [`DaemonEvent::StateChanged`].

mod config;
mod protocol;

pub use config::DaemonConfig;
pub use protocol::{DaemonEvent, DaemonState};

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::HostError;
use crate::service::Service;
use crate::task::{self, HostFuture, TaskScope};

const EVENTS_CAPACITY: usize = 64;

/// Start/stop hooks of a concrete daemon.
#[async_trait]
pub trait Workload: Send + Sync + 'static {
    async fn start(&self, ctx: DaemonContext, config: DaemonConfig) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;
}

/// Optional hook producing the service a daemon exposes.
#[async_trait]
pub trait ServiceHook: Send + Sync + 'static {
    async fn service(&self) -> anyhow::Result<Service>;
}

struct Shared {
    name: Mutex<String>,
    state: Mutex<DaemonState>,
    events: broadcast::Sender<DaemonEvent>,
    starting: TaskScope,
    general: TaskScope,
    workload: Arc<dyn Workload>,
    service: Option<Arc<dyn ServiceHook>>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, DaemonState> {
        self.state.lock().expect("Daemon state lock poisoned")
    }

    fn name(&self) -> String {
        self.name.lock().expect("Daemon name lock poisoned").clone()
    }

    /// Caller holds the state lock so observers see transitions in order.
    fn transition(&self, state: &mut DaemonState, to: DaemonState) {
        *state = to;
        tracing::debug!(daemon = %self.name(), state = %to, "Daemon state changed");
        let _ = self.events.send(DaemonEvent::StateChanged(to));
    }

    fn fail(&self, error: HostError) {
        let mut state = self.lock_state();
        if *state != DaemonState::Failed {
            self.transition(&mut state, DaemonState::Failed);
        }
        tracing::error!(daemon = %self.name(), "Daemon failed: {}", error);
        let _ = self.events.send(DaemonEvent::Failed(error));
    }
}

/// Handle to a daemon instance. Clones share the same daemon.
#[derive(Clone)]
pub struct Daemon {
    shared: Arc<Shared>,
}

impl Daemon {
    pub fn new<W: Workload>(workload: W) -> Self {
        Self::build(Arc::new(workload), None)
    }

    /// Daemon whose workload also produces its service.
    pub fn with_service<W: Workload + ServiceHook>(workload: W) -> Self {
        let workload = Arc::new(workload);
        let service: Arc<dyn ServiceHook> = workload.clone();
        Self::build(workload, Some(service))
    }

    fn build(workload: Arc<dyn Workload>, service: Option<Arc<dyn ServiceHook>>) -> Self {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                name: Mutex::new(String::new()),
                state: Mutex::new(DaemonState::Null),
                events,
                starting: TaskScope::new("daemon-start"),
                general: TaskScope::new("daemon"),
                workload,
                service,
            }),
        }
    }

    /// Wraps the daemon into a handle answering the daemon contract id.
    pub fn into_service(self) -> Service {
        Service::daemon(self)
    }

    pub fn state(&self) -> DaemonState {
        *self.shared.lock_state()
    }

    pub fn name(&self) -> String {
        self.shared.name()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.shared.name.lock().expect("Daemon name lock poisoned") = name.into();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.shared.events.subscribe()
    }

    pub fn context(&self) -> DaemonContext {
        DaemonContext {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Starts the workload. Rejected with [`HostError::BadState`] unless the
    /// daemon is `null` or `stopped`; the check happens before this returns.
    pub fn start(&self, config: DaemonConfig) -> HostFuture<()> {
        {
            let mut state = self.shared.lock_state();
            if !state.can_start() {
                return task::ready(Err(HostError::BadState(format!(
                    "unable to start daemon \"{}\" while {}",
                    self.name(),
                    *state
                ))));
            }
            self.shared.transition(&mut state, DaemonState::Starting);
        }

        let shared = Arc::clone(&self.shared);
        let ctx = self.context();
        self.shared.starting.spawn(async move {
            let started = shared.workload.start(ctx, config).await;

            let mut state = shared.lock_state();
            match started {
                Ok(()) => {
                    if *state == DaemonState::Starting {
                        shared.transition(&mut state, DaemonState::Started);
                    }
                    Ok(())
                }
                Err(e) => {
                    let error = HostError::from(e);
                    tracing::warn!(daemon = %shared.name(), "Daemon start hook failed: {}", error);
                    if *state == DaemonState::Starting {
                        shared.transition(&mut state, DaemonState::Failed);
                        let _ = shared.events.send(DaemonEvent::Failed(error.clone()));
                    }
                    Err(error)
                }
            }
        })
    }

    /// Stops the workload, cancelling an in-flight start first. Rejected with
    /// [`HostError::BadState`] when there is nothing to stop.
    pub fn stop(&self) -> HostFuture<()> {
        {
            let mut state = self.shared.lock_state();
            if !state.can_stop() {
                return task::ready(Err(HostError::BadState(format!(
                    "unable to stop daemon \"{}\" while {}",
                    self.name(),
                    *state
                ))));
            }
            self.shared.transition(&mut state, DaemonState::Stopping);
        }

        let shared = Arc::clone(&self.shared);
        self.shared.general.spawn(async move {
            shared.starting.flush().await;
            shared.workload.stop().await.map_err(HostError::from)?;

            let mut state = shared.lock_state();
            if *state == DaemonState::Stopping {
                shared.transition(&mut state, DaemonState::Stopped);
            }
            Ok(())
        })
    }

    pub fn service(&self) -> HostFuture<Service> {
        match &self.shared.service {
            Some(hook) => {
                let hook = Arc::clone(hook);
                self.shared
                    .general
                    .spawn(async move { hook.service().await.map_err(HostError::from) })
            }
            None => task::ready(Err(HostError::NoService(self.name()))),
        }
    }

    /// Reports an out-of-band failure.
    pub fn fail(&self, error: HostError) {
        self.shared.fail(error);
    }
}

impl fmt::Debug for Daemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Daemon")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Weak handle a workload keeps to report failures of its daemon.
#[derive(Clone)]
pub struct DaemonContext {
    shared: Weak<Shared>,
}

impl DaemonContext {
    pub fn name(&self) -> Option<String> {
        self.shared.upgrade().map(|s| s.name())
    }

    pub fn state(&self) -> Option<DaemonState> {
        self.shared.upgrade().map(|s| *s.lock_state())
    }

    /// Moves the daemon to `failed` (if not already) and always emits
    /// [`DaemonEvent::Failed`].
    pub fn fail(&self, error: HostError) {
        if let Some(shared) = self.shared.upgrade() {
            shared.fail(error);
        }
    }
}
