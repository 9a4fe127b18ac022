//! Worker pool for blocking plugin jobs and timers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info};

/// Owns the background runtime. Dropping it shuts the runtime down.
pub struct WorkerPool {
    runtime: Option<Runtime>,
    handle: WorkerHandle,
}

/// Cloneable spawner; jobs submitted after shutdown are dropped.
#[derive(Clone)]
pub struct WorkerHandle {
    handle: Handle,
    closed: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers.max(1))
            .thread_name("gode-worker")
            .enable_time()
            .build()?;
        let handle = WorkerHandle {
            handle: runtime.handle().clone(),
            closed: Arc::new(AtomicBool::new(false)),
        };
        debug!(workers = workers.max(1), "worker pool started");
        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Stop accepting jobs and wait up to `timeout` for running ones.
    pub fn shutdown(&mut self, timeout: Duration) {
        self.handle.closed.store(true, Ordering::Release);
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(timeout);
            info!("worker pool shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.runtime.is_none()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(Duration::from_millis(100));
    }
}

impl WorkerHandle {
    /// Run a blocking job on a worker thread.
    pub fn spawn_blocking<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            debug!("worker pool closed, dropping job");
            return false;
        }
        drop(self.handle.spawn_blocking(job));
        true
    }

    /// Run `job` on a worker after `delay`.
    pub fn spawn_after<F>(&self, delay: Duration, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            debug!("worker pool closed, dropping timer");
            return false;
        }
        drop(self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            job();
        }));
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
