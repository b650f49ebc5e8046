// src/scheduler/mod.rs - Bounded-concurrency service scheduler
//
// Services are admitted FIFO while fewer than `max_threads` are running. Each admitted
// service gets its own short-lived thread; when the body returns the worker drains the
// queue again, so there is no supervisor loop. The inner lock is never held while a
// service body runs.

pub mod build_file_parsing;
mod service;

pub use build_file_parsing::{BuildFileParsingService, BuildReadySignal};
pub use service::{Service, ServiceContext, ServiceError, ServiceHandle};

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Service '{0}' does not belong to this handler")]
    ForeignService(String),
    #[error("Invalid max thread count: {0} (must be at least 1)")]
    InvalidThreadCount(usize),
    #[error("Service '{0}' has already been queued")]
    AlreadyQueued(String),
    #[error("Service handler is shutting down")]
    ShuttingDown,
}

struct Inner {
    queue: VecDeque<ServiceHandle>,
    running: Vec<ServiceHandle>,
    finished: Vec<ServiceHandle>,
    workers: HashMap<Uuid, JoinHandle<()>>,
    max_threads: usize,
    accepting: bool,
    completed: u64,
}

pub struct ServiceHandler {
    id: Uuid,
    this: Weak<ServiceHandler>,
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl ServiceHandler {
    pub fn new(max_threads: usize) -> Result<Arc<Self>, SchedulerError> {
        if max_threads == 0 {
            return Err(SchedulerError::InvalidThreadCount(max_threads));
        }
        Ok(Arc::new_cyclic(|this| Self {
            id: Uuid::new_v4(),
            this: this.clone(),
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                running: Vec::new(),
                finished: Vec::new(),
                workers: HashMap::new(),
                max_threads,
                accepting: true,
                completed: 0,
            }),
            changed: Condvar::new(),
        }))
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wrap `service` in a handle owned by this handler. Nothing runs until it is queued.
    pub fn create_service(&self, service: impl Service + 'static) -> ServiceHandle {
        ServiceHandle::new(self.id, Box::new(service))
    }

    pub fn add_service_to_queue(&self, handle: &ServiceHandle) -> Result<(), SchedulerError> {
        if handle.owner() != self.id {
            return Err(SchedulerError::ForeignService(handle.name().to_string()));
        }
        {
            let mut inner = self.inner();
            if !inner.accepting {
                return Err(SchedulerError::ShuttingDown);
            }
            if !handle.mark_submitted() {
                return Err(SchedulerError::AlreadyQueued(handle.name().to_string()));
            }
            inner.queue.push_back(handle.clone());
        }
        tracing::debug!(subsystem = "scheduler", "queued service '{}' ({})", handle.name(), handle.id());
        self.drain();
        Ok(())
    }

    /// Applies to future admissions; running services are left alone.
    pub fn set_max_thread_count(&self, max_threads: usize) -> Result<(), SchedulerError> {
        if max_threads == 0 {
            return Err(SchedulerError::InvalidThreadCount(max_threads));
        }
        self.inner().max_threads = max_threads;
        self.drain();
        Ok(())
    }

    pub fn max_thread_count(&self) -> usize {
        self.inner().max_threads
    }

    fn drain(&self) {
        let Some(handler) = self.this.upgrade() else {
            return;
        };
        let admitted = {
            let mut inner = self.inner();
            let (done, still_running): (Vec<_>, Vec<_>) =
                inner.running.drain(..).partition(|s| !s.is_running());
            inner.running = still_running;
            inner.finished.extend(done);

            let mut admitted = Vec::new();
            while inner.accepting && inner.running.len() < inner.max_threads {
                let Some(next) = inner.queue.pop_front() else {
                    break;
                };
                next.set_running(true);
                inner.running.push(next.clone());
                admitted.push(next);
            }
            admitted
        };

        for handle in admitted {
            let id = handle.id();
            let name = handle.name().to_string();
            let worker_handler = handler.clone();
            let spawned = thread::Builder::new()
                .name(format!("service-{}", name))
                .spawn(move || run_worker(worker_handler, handle));
            match spawned {
                Ok(worker) => {
                    self.inner().workers.insert(id, worker);
                }
                Err(e) => {
                    tracing::error!(subsystem = "scheduler", "failed to spawn worker for '{}': {}", name, e);
                    let mut inner = self.inner();
                    if let Some(pos) = inner.running.iter().position(|s| s.id() == id) {
                        let failed = inner.running.remove(pos);
                        failed.set_running(false);
                        inner.finished.push(failed);
                    }
                }
            }
        }
        self.clear_garbage();
        self.changed.notify_all();
    }

    /// Forget finished services and reap worker threads that have exited.
    pub fn clear_garbage(&self) {
        let mut inner = self.inner();
        inner.finished.clear();
        inner.workers.retain(|_, worker| !worker.is_finished());
    }

    pub fn running_count(&self) -> usize {
        self.inner().running.iter().filter(|s| s.is_running()).count()
    }

    pub fn queued_count(&self) -> usize {
        self.inner().queue.len()
    }

    /// Services whose body has returned since the handler was created.
    pub fn finished_count(&self) -> u64 {
        self.inner().completed
    }

    pub fn is_shutting_down(&self) -> bool {
        !self.inner().accepting
    }

    /// Block until nothing is queued or running, or `timeout` passes.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner();
        loop {
            if inner.queue.is_empty() && !inner.running.iter().any(|s| s.is_running()) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = match self.changed.wait_timeout(inner, deadline - now) {
                Ok((guard, _)) => guard,
                Err(p) => p.into_inner().0,
            };
        }
    }

    /// Reject further services, drop the queue and join every worker.
    /// Must not be called from inside a service body.
    pub fn shutdown(&self) {
        {
            let mut inner = self.inner();
            if inner.accepting {
                inner.accepting = false;
                let dropped = inner.queue.len();
                inner.queue.clear();
                tracing::info!(subsystem = "scheduler", "shutting down ({} queued services dropped)", dropped);
            }
        }
        let current = thread::current().id();
        loop {
            let (workers, pending) = {
                let mut inner = self.inner();
                let workers: Vec<JoinHandle<()>> = inner.workers.drain().map(|(_, w)| w).collect();
                (workers, inner.running.iter().any(|s| s.is_running()))
            };
            if workers.is_empty() {
                if !pending {
                    break;
                }
                // A worker was admitted but its handle is not registered yet.
                thread::sleep(Duration::from_millis(5));
                continue;
            }
            for worker in workers {
                if worker.thread().id() == current {
                    continue;
                }
                if worker.join().is_err() {
                    tracing::warn!(subsystem = "scheduler", "worker thread ended abnormally");
                }
            }
        }
    }
}

fn run_worker(handler: Arc<ServiceHandler>, handle: ServiceHandle) {
    let ctx = ServiceContext {
        handler: handler.clone(),
        service_id: handle.id(),
    };
    let started = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| handle.entry.service.execute(&ctx)));
    match outcome {
        Ok(Ok(())) => tracing::debug!(
            subsystem = "scheduler",
            "service '{}' finished in {:.1} ms",
            handle.name(),
            started.elapsed().as_secs_f64() * 1000.0
        ),
        Ok(Err(e)) => tracing::error!(subsystem = "scheduler", "service '{}' failed: {}", handle.name(), e),
        Err(panic) => tracing::error!(
            subsystem = "scheduler",
            "service '{}' panicked: {}",
            handle.name(),
            panic_message(panic.as_ref())
        ),
    }
    handle.entry.executed.store(true, std::sync::atomic::Ordering::Release);
    {
        let mut inner = handler.inner();
        inner.completed += 1;
        handle.set_running(false);
    }
    drop(ctx);
    handler.drain();
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Sleeper {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Service for Sleeper {
        fn name(&self) -> &str {
            "sleeper"
        }

        fn execute(&self, _ctx: &ServiceContext) -> Result<(), ServiceError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn admission_is_bounded() {
        let handler = ServiceHandler::new(2).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let handle = handler.create_service(Sleeper {
                active: active.clone(),
                peak: peak.clone(),
            });
            handler.add_service_to_queue(&handle).unwrap();
            assert!(handler.running_count() <= 2);
        }
        assert!(handler.wait_until_idle(Duration::from_secs(10)));
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(handler.finished_count(), 8);
        handler.shutdown();
    }

    #[test]
    fn zero_threads_is_rejected() {
        assert!(matches!(ServiceHandler::new(0), Err(SchedulerError::InvalidThreadCount(0))));
        let handler = ServiceHandler::new(1).unwrap();
        assert!(handler.set_max_thread_count(0).is_err());
        assert_eq!(handler.max_thread_count(), 1);
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let a = ServiceHandler::new(1).unwrap();
        let b = ServiceHandler::new(1).unwrap();
        let handle = a.create_service(Sleeper {
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        });
        assert!(matches!(b.add_service_to_queue(&handle), Err(SchedulerError::ForeignService(_))));
        assert_eq!(b.queued_count(), 0);
    }

    #[test]
    fn shutdown_rejects_new_services() {
        let handler = ServiceHandler::new(1).unwrap();
        handler.shutdown();
        handler.shutdown();
        let handle = handler.create_service(Sleeper {
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        });
        assert!(matches!(handler.add_service_to_queue(&handle), Err(SchedulerError::ShuttingDown)));
    }
}
