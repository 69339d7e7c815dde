//! Bounded concurrency with cooperative cancellation
//!
//! A `Controller` admits at most `width` operations at once. Every operation
//! submitted through it is counted as outstanding from the moment it is
//! submitted until it releases, so `wait_all` cannot return while work is
//! still queued for admission.
//!
//! Cancelling the controller's token preempts queued and running operations.
//! Preempted operations report `NebulaError::Cancelled` and release their slot
//! exactly once.

use futures::future::join_all;
use nebula_core::{NebulaError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Cleanup = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Outstanding {
    count: AtomicUsize,
    idle: Notify,
}

impl Outstanding {
    fn register(self: &Arc<Self>) -> OutstandingGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        OutstandingGuard(self.clone())
    }
}

struct OutstandingGuard(Arc<Outstanding>);

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Slot held by an admitted operation; dropping it releases the slot
pub struct Admission {
    _permit: OwnedSemaphorePermit,
    _guard: OutstandingGuard,
}

/// Admission gate of fixed width with a cancellation broadcast
#[derive(Clone)]
pub struct Controller {
    permits: Arc<Semaphore>,
    width: usize,
    cancel: CancellationToken,
    outstanding: Arc<Outstanding>,
}

impl Controller {
    pub fn new(width: usize, cancel: CancellationToken) -> Self {
        let width = width.max(1);
        Self {
            permits: Arc::new(Semaphore::new(width)),
            width,
            cancel,
            outstanding: Arc::new(Outstanding::default()),
        }
    }

    /// Independent gate whose token is cancelled along with this one
    pub fn child(&self, width: usize) -> Self {
        Self::new(width, self.cancel.child_token())
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Operations currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.width - self.permits.available_permits()
    }

    /// Operations submitted and not yet released
    pub fn outstanding(&self) -> usize {
        self.outstanding.count.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Result<Admission> {
        let guard = self.outstanding.register();
        let permit = admit(&self.permits, &self.cancel).await?;
        Ok(Admission {
            _permit: permit,
            _guard: guard,
        })
    }

    /// Run `op` on the runtime once a slot is free
    pub fn spawn<F, T>(&self, op: F) -> JoinHandle<Result<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_inner(op, None)
    }

    /// Like `spawn`, running `cleanup` once if cancellation preempts `op`
    /// after it was admitted
    pub fn spawn_with_cleanup<F, T, C>(&self, op: F, cleanup: C) -> JoinHandle<Result<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.spawn_inner(op, Some(Box::new(cleanup)))
    }

    fn spawn_inner<F, T>(&self, op: F, cleanup: Option<Cleanup>) -> JoinHandle<Result<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.outstanding.register();
        let permits = self.permits.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let _permit = admit(&permits, &cancel).await?;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if let Some(cleanup) = cleanup {
                        cleanup();
                    }
                    debug!("Operation preempted by cancellation");
                    Err(NebulaError::Cancelled)
                }
                result = op => result,
            }
        })
    }

    /// Block until every submitted operation has released
    pub async fn wait_all(&self) {
        loop {
            let notified = self.outstanding.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Await spawned operations in submission order without short-circuiting
    pub async fn join<T>(handles: Vec<JoinHandle<Result<T>>>) -> Vec<Result<T>> {
        join_all(handles)
            .await
            .into_iter()
            .map(|joined| {
                joined
                    .map_err(|e| NebulaError::Internal(format!("transfer task failed: {}", e)))
                    .and_then(|r| r)
            })
            .collect()
    }
}

async fn admit(permits: &Arc<Semaphore>, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(NebulaError::Cancelled),
        permit = permits.clone().acquire_owned() => {
            permit.map_err(|_| NebulaError::Cancelled)
        }
    }
}
