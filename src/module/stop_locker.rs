use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::error::HostError;
use crate::task::HostFuture;

pub type StopFuture = HostFuture<()>;

struct GateState {
    holders: usize,
    drained: watch::Sender<bool>,
}

/// Reference-counted stop barrier.
///
/// The gate future returned by [`StopGate::wait`] is pending while at least one
/// [`StopLocker`] is alive and resolves when the last one is released. Taking a
/// locker on a drained gate installs a fresh, pending gate.
#[derive(Clone)]
pub struct StopGate {
    inner: Arc<Mutex<GateState>>,
}

impl StopGate {
    pub fn new() -> Self {
        let (drained, _) = watch::channel(true);
        Self {
            inner: Arc::new(Mutex::new(GateState {
                holders: 0,
                drained,
            })),
        }
    }

    pub fn lock(&self) -> StopLocker {
        acquire(&self.inner);
        StopLocker {
            gate: Some(Arc::clone(&self.inner)),
        }
    }

    pub fn holders(&self) -> usize {
        self.inner.lock().expect("StopGate lock poisoned").holders
    }

    pub fn is_drained(&self) -> bool {
        *self
            .inner
            .lock()
            .expect("StopGate lock poisoned")
            .drained
            .borrow()
    }

    /// Future of the current gate.
    pub fn wait(&self) -> StopFuture {
        let mut rx = self
            .inner
            .lock()
            .expect("StopGate lock poisoned")
            .drained
            .subscribe();

        Box::pin(async move {
            rx.wait_for(|drained| *drained)
                .await
                .map(|_| ())
                .map_err(|_| HostError::Cancelled)
        })
    }
}

impl Default for StopGate {
    fn default() -> Self {
        Self::new()
    }
}

fn acquire(inner: &Mutex<GateState>) {
    let mut state = inner.lock().expect("StopGate lock poisoned");
    state.holders += 1;
    if state.holders == 1 {
        let (drained, _) = watch::channel(false);
        state.drained = drained;
    }
}

fn release(inner: &Mutex<GateState>) {
    let mut state = inner.lock().expect("StopGate lock poisoned");
    debug_assert!(state.holders > 0, "stop locker released twice");
    if state.holders > 0 {
        state.holders -= 1;
        if state.holders == 0 {
            state.drained.send_replace(true);
        }
    }
}

/// Keeps the owning component's stop gate pending while alive.
///
/// Cloning takes another reference on the same gate; moving does not touch the
/// counter.
#[derive(Default)]
pub struct StopLocker {
    gate: Option<Arc<Mutex<GateState>>>,
}

impl StopLocker {
    pub fn is_empty(&self) -> bool {
        self.gate.is_none()
    }

    pub fn release(mut self) {
        self.take_release();
    }

    fn take_release(&mut self) {
        if let Some(gate) = self.gate.take() {
            release(&gate);
        }
    }
}

impl Clone for StopLocker {
    fn clone(&self) -> Self {
        if let Some(gate) = &self.gate {
            acquire(gate);
        }
        Self {
            gate: self.gate.clone(),
        }
    }
}

impl Drop for StopLocker {
    fn drop(&mut self) {
        self.take_release();
    }
}
