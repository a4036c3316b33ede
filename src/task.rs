//! Async primitives the orchestration core is written against.
//!
//! Every asynchronous result in the host is a [`HostFuture`], which resolves
//! one of three ways: a value (`Ok`), an exception (`Err` with any error other
//! than [`HostError::Cancelled`]) or a cancellation (`Err(HostError::Cancelled)`).
//!
//! [`TaskScope`] is the ownership scope: tasks spawned into it are cancelled
//! when the scope is stopped, flushed or dropped.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{HostError, Result};

pub type HostFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'static>>;

/// An already-resolved future.
pub fn ready<T: Send + 'static>(result: Result<T>) -> HostFuture<T> {
    Box::pin(std::future::ready(result))
}

struct ScopeState {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

pub struct TaskScope {
    name: &'static str,
    state: Mutex<ScopeState>,
}

impl TaskScope {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(ScopeState {
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Spawns `fut` as an independent task owned by this scope.
    ///
    /// The task keeps running whether or not the returned future is polled.
    /// Cancelling the scope resolves it with [`HostError::Cancelled`] at the
    /// task's next await point.
    pub fn spawn<F, T>(&self, fut: F) -> HostFuture<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tracker, cancel) = {
            let state = self.state.lock().expect("TaskScope lock poisoned");
            (state.tracker.clone(), state.cancel.clone())
        };

        if cancel.is_cancelled() {
            tracing::trace!(scope = self.name, "Spawn into stopped scope");
            return ready(Err(HostError::Cancelled));
        }

        let handle = tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(HostError::Cancelled),
                res = fut => res,
            }
        });

        Box::pin(async move {
            match handle.await {
                Ok(res) => res,
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn is_empty(&self) -> bool {
        self.state
            .lock()
            .expect("TaskScope lock poisoned")
            .tracker
            .is_empty()
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("TaskScope lock poisoned")
            .tracker
            .len()
    }

    /// Cancels every task and waits for all of them to finish. Spawning into a
    /// stopped scope resolves immediately with a cancellation until
    /// [`TaskScope::reopen`] is called.
    pub async fn stop(&self) {
        let tracker = self.cancel_and_close();
        tracker.wait().await;
        tracing::trace!(scope = self.name, "Scope stopped");
    }

    /// Like [`TaskScope::stop`], but the scope accepts new tasks afterwards.
    pub async fn flush(&self) {
        self.stop().await;
        self.reopen();
    }

    pub fn reopen(&self) {
        let mut state = self.state.lock().expect("TaskScope lock poisoned");
        if state.cancel.is_cancelled() {
            state.cancel = CancellationToken::new();
        }
        state.tracker.reopen();
    }

    fn cancel_and_close(&self) -> TaskTracker {
        let state = self.state.lock().expect("TaskScope lock poisoned");
        state.cancel.cancel();
        state.tracker.close();
        state.tracker.clone()
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            state.cancel.cancel();
        }
    }
}
