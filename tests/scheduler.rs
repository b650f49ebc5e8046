// Integration tests for the bounded service scheduler

use foundry_rs::scheduler::{SchedulerError, Service, ServiceContext, ServiceError, ServiceHandler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Runs a closure as a service.
struct FnService<F> {
    name: String,
    body: F,
}

impl<F> Service for FnService<F>
where
    F: Fn(&ServiceContext) -> Result<(), ServiceError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, ctx: &ServiceContext) -> Result<(), ServiceError> {
        (self.body)(ctx)
    }
}

fn service<F>(name: &str, body: F) -> FnService<F>
where
    F: Fn(&ServiceContext) -> Result<(), ServiceError> + Send + Sync,
{
    FnService {
        name: name.to_string(),
        body,
    }
}

#[test]
fn never_more_running_than_the_limit() {
    let handler = ServiceHandler::new(3).unwrap();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for i in 0..12 {
        let active = active.clone();
        let peak = peak.clone();
        let handle = handler.create_service(service(&format!("job{}", i), move |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }));
        handler.add_service_to_queue(&handle).unwrap();
        handles.push(handle);
        let running = handles.iter().filter(|h| h.is_running()).count();
        assert!(running <= 3, "{} services running", running);
    }
    assert!(handler.wait_until_idle(Duration::from_secs(10)));
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(handles.iter().all(|h| h.has_executed() && !h.is_running()));
    handler.shutdown();
}

#[test]
fn services_start_in_queue_order() {
    let handler = ServiceHandler::new(1).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..5 {
        let order = order.clone();
        let handle = handler.create_service(service(&format!("s{}", i), move |_| {
            order.lock().unwrap().push(i);
            thread::sleep(Duration::from_millis(2));
            Ok(())
        }));
        handler.add_service_to_queue(&handle).unwrap();
    }
    assert!(handler.wait_until_idle(Duration::from_secs(10)));
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    handler.shutdown();
}

#[test]
fn failing_and_panicking_services_do_not_block_the_queue() {
    let handler = ServiceHandler::new(1).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let failing = handler.create_service(service("fails", |_| Err(ServiceError::Failed("disk full".into()))));
    let panicking = handler.create_service(service("panics", |_| panic!("decoder bug")));
    let counter = ran.clone();
    let after = handler.create_service(service("after", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));

    handler.add_service_to_queue(&failing).unwrap();
    handler.add_service_to_queue(&panicking).unwrap();
    handler.add_service_to_queue(&after).unwrap();
    assert!(handler.wait_until_idle(Duration::from_secs(10)));

    assert!(failing.has_executed() && !failing.is_running());
    assert!(panicking.has_executed() && !panicking.is_running());
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(handler.finished_count(), 3);
    handler.shutdown();
}

/// Enqueues the next level from inside its own body until `levels` have run.
struct Chain {
    level: usize,
    levels: usize,
    depth: Arc<AtomicUsize>,
}

impl Service for Chain {
    fn name(&self) -> &str {
        "chain"
    }

    fn execute(&self, ctx: &ServiceContext) -> Result<(), ServiceError> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.level < self.levels {
            ctx.add_service(Chain {
                level: self.level + 1,
                levels: self.levels,
                depth: self.depth.clone(),
            })?;
        }
        Ok(())
    }
}

#[test]
fn a_service_can_enqueue_follow_ups_at_full_capacity() {
    let handler = ServiceHandler::new(1).unwrap();
    let depth = Arc::new(AtomicUsize::new(0));
    let first = handler.create_service(Chain {
        level: 1,
        levels: 5,
        depth: depth.clone(),
    });
    handler.add_service_to_queue(&first).unwrap();
    assert!(handler.wait_until_idle(Duration::from_secs(10)));
    assert_eq!(depth.load(Ordering::SeqCst), 5);
    assert_eq!(handler.finished_count(), 5);
    handler.shutdown();
}

#[test]
fn raising_the_limit_admits_waiting_services() {
    let handler = ServiceHandler::new(1).unwrap();
    let gate = Arc::new(Mutex::new(()));
    let held = gate.lock().unwrap();

    let mut handles = Vec::new();
    for i in 0..3 {
        let gate = gate.clone();
        let handle = handler.create_service(service(&format!("gated{}", i), move |_| {
            drop(gate.lock().unwrap());
            Ok(())
        }));
        handler.add_service_to_queue(&handle).unwrap();
        handles.push(handle);
    }
    assert_eq!(handler.running_count(), 1);
    assert_eq!(handler.queued_count(), 2);

    handler.set_max_thread_count(3).unwrap();
    assert_eq!(handler.running_count(), 3);
    assert_eq!(handler.queued_count(), 0);

    drop(held);
    assert!(handler.wait_until_idle(Duration::from_secs(10)));
    handler.shutdown();
}

#[test]
fn shutdown_waits_for_running_services() {
    let handler = ServiceHandler::new(2).unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    let counter = done.clone();
    let slow = handler.create_service(service("slow", move |ctx| {
        thread::sleep(Duration::from_millis(50));
        assert!(ctx.is_shutting_down());
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    handler.add_service_to_queue(&slow).unwrap();
    thread::sleep(Duration::from_millis(10));
    handler.shutdown();
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(!slow.is_running());

    let late = handler.create_service(service("late", |_| Ok(())));
    assert!(matches!(handler.add_service_to_queue(&late), Err(SchedulerError::ShuttingDown)));
}

#[test]
fn a_handle_is_queued_at_most_once() {
    let handler = ServiceHandler::new(2).unwrap();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    let handle = {
        let (active, peak, runs) = (active.clone(), peak.clone(), runs.clone());
        handler.create_service(service("repeat", move |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            runs.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }))
    };
    handler.add_service_to_queue(&handle).unwrap();
    for _ in 0..3 {
        assert!(matches!(handler.add_service_to_queue(&handle), Err(SchedulerError::AlreadyQueued(_))));
    }
    assert!(handler.wait_until_idle(Duration::from_secs(5)));
    assert!(handle.has_executed());
    assert!(matches!(handler.add_service_to_queue(&handle), Err(SchedulerError::AlreadyQueued(_))));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}
