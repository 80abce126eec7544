//! Bounded executor for object-store requests.
//!
//! All fan-out in the crate (parallel range-GETs, multipart part dispatch,
//! readdir multi-HEAD) funnels through one [`RequestPool`]: a semaphore
//! capping the number of requests in flight process-wide. Callers spawn
//! their tasks into a [`tokio::task::JoinSet`] via [`RequestPool::spawn_on`]
//! and join the set, so each call site gets its own completion group while
//! sharing the global width.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Default number of concurrent store requests.
pub const DEFAULT_POOL_WIDTH: usize = 20;

/// Cooperative cancellation shared by a group of tasks.
///
/// Tasks are never pre-empted; retry loops check the flag between attempts
/// and give up early once it is raised.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Semaphore-bounded pool of request slots.
#[derive(Debug, Clone)]
pub struct RequestPool {
    permits: Arc<Semaphore>,
    width: usize,
}

impl RequestPool {
    pub fn new(width: usize) -> Self {
        assert!(width > 0, "pool width must be positive");
        Self {
            permits: Arc::new(Semaphore::new(width)),
            width,
        }
    }

    /// Maximum number of requests in flight.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Run `fut` once a request slot is free. Applies backpressure: awaits
    /// until the in-flight count drops below the pool width.
    pub async fn run<T>(&self, fut: impl Future<Output = T>) -> T {
        let _permit = self
            .permits
            .acquire()
            .await
            .unwrap_or_else(|_| unreachable!("pool semaphore is never closed"));
        fut.await
    }

    /// Spawn `fut` into `set`, gated by a pool slot.
    ///
    /// The task is queued immediately but does not execute its body until a
    /// permit is available, so a `JoinSet` of any size never exceeds the
    /// pool width in concurrent requests.
    pub fn spawn_on<T: Send + 'static>(
        &self,
        set: &mut JoinSet<T>,
        fut: impl Future<Output = T> + Send + 'static,
    ) {
        let permits = Arc::clone(&self.permits);
        set.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .unwrap_or_else(|_| unreachable!("pool semaphore is never closed"));
            fut.await
        });
    }
}

impl Default for RequestPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_WIDTH)
    }
}
