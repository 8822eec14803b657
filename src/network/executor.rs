use std::any::type_name;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::runtime::Runtime;
use tracing::{debug, error, warn};

use crate::service::GroupSizing;
use crate::AppResult;

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // executor whose job is running on this thread, 0 when none
    static CURRENT_EXECUTOR: Cell<u64> = const { Cell::new(0) };
}

/// Bounded pool that runs listener callbacks away from the reactor thread.
///
/// Backed by a dedicated multi-thread runtime: callbacks are blocking code and go
/// through `spawn_blocking`, capped at `thread_max_pool_size` threads. Jobs beyond
/// that wait in the pool queue; a job never runs on the submitting thread while the
/// pool is up. More than `thread_max_pool_size + thread_queue_size` jobs in flight
/// is logged as saturation. After shutdown, jobs run on the submitting thread.
pub struct Executor {
    id: u64,
    name: String,
    runtime: RwLock<Option<Runtime>>,
    in_flight: Arc<AtomicUsize>,
    capacity: usize,
    saturated: AtomicBool,
}

impl Executor {
    pub fn new(sizing: &GroupSizing) -> AppResult<Executor> {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder
            .worker_threads(sizing.executor_count.max(1))
            .max_blocking_threads(sizing.thread_max_pool_size.max(1))
            .thread_name(format!("{}-pool", sizing.name))
            .enable_time();
        if let Some(keep_alive) = sizing.keep_alive {
            builder.thread_keep_alive(keep_alive);
        }
        let runtime = builder.build()?;
        Ok(Executor {
            id: NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed),
            name: sizing.name.clone(),
            runtime: RwLock::new(Some(runtime)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            capacity: sizing
                .thread_max_pool_size
                .saturating_add(sizing.thread_queue_size),
            saturated: AtomicBool::new(false),
        })
    }

    pub fn is_shutdown(&self) -> bool {
        self.runtime.read().is_none()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.runtime.read();
        let Some(runtime) = guard.as_ref() else {
            drop(guard);
            run_guarded(&self.name, job);
            return;
        };
        let queued = self.in_flight.fetch_add(1, Ordering::AcqRel);
        if queued >= self.capacity {
            if !self.saturated.swap(true, Ordering::AcqRel) {
                warn!(
                    "executor {} saturated, {} jobs in flight, new jobs wait in the queue",
                    self.name, queued
                );
            }
        } else if queued < self.capacity / 2 && self.saturated.swap(false, Ordering::AcqRel) {
            debug!("executor {} drained below saturation", self.name);
        }
        let in_flight = self.in_flight.clone();
        let name = self.name.clone();
        let id = self.id;
        runtime.spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                CURRENT_EXECUTOR.with(|current| current.set(id));
                job();
                CURRENT_EXECUTOR.with(|current| current.set(0));
            })
            .await;
            in_flight.fetch_sub(1, Ordering::AcqRel);
            if let Err(join_error) = result {
                if join_error.is_panic() {
                    log_panic(&name, join_error.into_panic());
                } else {
                    error!("executor {} job cancelled", name);
                }
            }
        });
    }

    /// Stops taking jobs, waits up to `timeout` for running ones, then drops the pool.
    pub fn shutdown(&self, timeout: Duration) {
        let Some(runtime) = self.runtime.write().take() else {
            return;
        };
        let inside = CURRENT_EXECUTOR.with(|current| current.get()) == self.id;
        let own = usize::from(inside);
        let deadline = Instant::now() + timeout;
        while self.in_flight.load(Ordering::Acquire) > own && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        if inside {
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(deadline.saturating_duration_since(Instant::now()));
        }
        debug!("executor {} shutdown", self.name);
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

fn run_guarded<F: FnOnce()>(name: &str, job: F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        log_panic(name, payload);
    }
}

fn log_panic(name: &str, payload: Box<dyn std::any::Any + Send>) {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        error!("executor {} job panicked with message: {}", name, message);
    } else if let Some(message) = payload.downcast_ref::<String>() {
        error!("executor {} job panicked with message: {}", name, message);
    } else {
        // print dynamic type name
        error!(
            "executor {} job panicked with an unknown type: {}",
            name,
            get_type_name(&payload)
        );
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::service::ServerConfig;

    fn sizing(max_pool: usize, queue: usize) -> GroupSizing {
        let mut sizing = GroupSizing::from(&ServerConfig::default());
        sizing.name = "test".to_string();
        sizing.executor_count = 1;
        sizing.thread_max_pool_size = max_pool;
        sizing.thread_queue_size = queue;
        sizing
    }

    #[test]
    fn runs_jobs_off_caller_thread() {
        let executor = Executor::new(&sizing(4, 16)).unwrap();
        let (tx, rx) = mpsc::channel();
        let caller = std::thread::current().id();
        executor.submit(move || {
            tx.send(std::thread::current().id()).unwrap();
        });
        let worker = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_ne!(worker, caller);
        executor.shutdown(Duration::from_secs(1));
        assert!(executor.is_shutdown());
    }

    #[test]
    fn panics_are_contained() {
        let executor = Executor::new(&sizing(2, 2)).unwrap();
        executor.submit(|| panic!("boom"));
        let (tx, rx) = mpsc::channel();
        executor.submit(move || tx.send(1).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        executor.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn saturated_jobs_wait_instead_of_running_on_caller() {
        let executor = Executor::new(&sizing(1, 1)).unwrap();
        let caller = std::thread::current().id();
        let (tx, rx) = mpsc::channel();
        for _ in 0..4 {
            let tx = tx.clone();
            executor.submit(move || {
                std::thread::sleep(Duration::from_millis(50));
                tx.send(std::thread::current().id()).unwrap();
            });
        }
        assert!(executor.in_flight() > 2);
        for _ in 0..4 {
            let worker = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_ne!(worker, caller);
        }
        executor.shutdown(Duration::from_secs(1));
        assert_eq!(executor.in_flight(), 0);
    }

    #[test]
    fn after_shutdown_jobs_run_inline() {
        let executor = Executor::new(&sizing(2, 2)).unwrap();
        executor.shutdown(Duration::from_millis(100));
        let caller = std::thread::current().id();
        let (tx, rx) = mpsc::channel();
        executor.submit(move || tx.send(std::thread::current().id()).unwrap());
        assert_eq!(rx.try_recv().unwrap(), caller);
    }

    #[test]
    fn shutdown_waits_for_running_jobs() {
        let executor = Executor::new(&sizing(2, 2)).unwrap();
        let (tx, rx) = mpsc::channel();
        executor.submit(move || {
            std::thread::sleep(Duration::from_millis(100));
            tx.send(()).unwrap();
        });
        std::thread::sleep(Duration::from_millis(20));
        executor.shutdown(Duration::from_secs(2));
        assert!(rx.try_recv().is_ok());
        assert_eq!(executor.in_flight(), 0);
    }
}
