//! Sample module: an `echo.Echo` service and a daemon that serves it.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use modhost::task::{self, HostFuture};
use modhost::{
    try_create_service, Daemon, DaemonConfig, DaemonContext, Entry, EntryBase, HostError,
    Manager, Manifest, Service, ServiceDecl, ServiceHook, ServiceId, StopGate, Workload,
    DAEMON_SERVICE_ID,
};

pub const ECHO_SERVICE_ID: &str = "echo.Echo";
pub const ECHO_ALIAS: &str = "echoSvc";

/// Echoes messages back. Each call holds a stop locker of the module.
pub struct Echo {
    gate: StopGate,
    port: Option<u16>,
}

impl Echo {
    pub async fn echo(&self, message: &str) -> String {
        let _locker = self.gate.lock();
        tokio::task::yield_now().await;
        message.to_string()
    }

    /// Port of the daemon this service came from.
    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

struct EchoDaemon {
    gate: StopGate,
    port: AtomicU16,
}

#[async_trait]
impl Workload for EchoDaemon {
    async fn start(&self, ctx: DaemonContext, config: DaemonConfig) -> anyhow::Result<()> {
        let port = match config.get_str("port") {
            Some(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("bad --port {raw:?}: {e}"))?,
            None => 0,
        };
        self.port.store(port, Ordering::SeqCst);
        tracing::info!(daemon = ?ctx.name(), port, "Echo daemon started");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        tracing::info!(port = self.port.load(Ordering::SeqCst), "Echo daemon stopped");
        Ok(())
    }
}

#[async_trait]
impl ServiceHook for EchoDaemon {
    async fn service(&self) -> anyhow::Result<Service> {
        let echo = Echo {
            gate: self.gate.clone(),
            port: Some(self.port.load(Ordering::SeqCst)),
        };
        Ok(Service::new(ServiceId::new(ECHO_SERVICE_ID), Arc::new(echo)))
    }
}

pub struct EchoEntry {
    base: EntryBase,
}

impl EchoEntry {
    pub fn new() -> Self {
        Self {
            base: EntryBase::new(),
        }
    }
}

impl Default for EchoEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl Entry for EchoEntry {
    fn base(&self) -> &EntryBase {
        &self.base
    }

    fn manifest(&self) -> Manifest {
        Manifest::new(
            "echo",
            format!("{}echo{}", std::env::consts::DLL_PREFIX, std::env::consts::DLL_SUFFIX),
        )
        .with_service(ServiceDecl::new(ECHO_SERVICE_ID).with_alias(ECHO_ALIAS))
        .with_service(ServiceDecl::new(DAEMON_SERVICE_ID))
    }

    fn start(&self, _manager: &Arc<Manager>) -> anyhow::Result<()> {
        tracing::debug!("Echo module started");
        Ok(())
    }

    fn create_service(&self, id: &ServiceId) -> HostFuture<Service> {
        let gate = self.base.stop_gate().clone();

        let service = try_create_service(ECHO_SERVICE_ID, id, || {
            Arc::new(Echo {
                gate: gate.clone(),
                port: None,
            })
        })
        .or_else(|| {
            (id.as_str() == DAEMON_SERVICE_ID).then(|| {
                Daemon::with_service(EchoDaemon {
                    gate: gate.clone(),
                    port: AtomicU16::new(0),
                })
                .into_service()
            })
        });

        task::ready(service.ok_or_else(|| {
            HostError::UnableToCreateService(format!("{id} is unknown to echo"))
        }))
    }
}

modhost::export_entry!(EchoEntry::new);
