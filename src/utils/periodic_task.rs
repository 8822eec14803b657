use std::any::type_name;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error};

use crate::{AppResult, Shutdown};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // id of the task whose tick body is running on this thread, 0 when none
    static RUNNING_TICK: Cell<u64> = const { Cell::new(0) };
}

/// A named background thread that runs `tick` once per `period` until stopped.
///
/// The thread hosts a current-thread runtime; each tick body runs through
/// `spawn_blocking`, so it may block or tear down other runtimes freely.
/// Ticks never overlap.
pub struct PeriodicTask {
    id: u64,
    name: String,
    notify_shutdown: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F>(name: &str, period: Duration, tick: F) -> AppResult<PeriodicTask>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let (notify_shutdown, _) = broadcast::channel(1);
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let tick = Arc::new(tick);
        let task_name = name.to_string();

        let handle = std::thread::Builder::new()
            .name(task_name.clone())
            .spawn(move || {
                runtime.block_on(async move {
                    let mut interval = time::interval_at(Instant::now() + period, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    debug!("periodic task {} started, period {:?}", task_name, period);
                    loop {
                        tokio::select! {
                            _ = shutdown.recv() => {
                                debug!("periodic task {} received shutdown signal", task_name);
                                break;
                            }
                            _ = interval.tick() => {}
                        }
                        let tick = tick.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            RUNNING_TICK.with(|current| current.set(id));
                            tick();
                            RUNNING_TICK.with(|current| current.set(0));
                        })
                        .await;
                        if let Err(join_error) = result {
                            if join_error.is_panic() {
                                let payload = join_error.into_panic();
                                if let Some(message) = payload.downcast_ref::<&'static str>() {
                                    error!("periodic task {} panicked with message: {}", task_name, message);
                                } else if let Some(message) = payload.downcast_ref::<String>() {
                                    error!("periodic task {} panicked with message: {}", task_name, message);
                                } else {
                                    error!(
                                        "periodic task {} panicked with an unknown type: {}",
                                        task_name,
                                        get_type_name(&payload)
                                    );
                                }
                            }
                        }
                    }
                    debug!("periodic task {} exit loop", task_name);
                });
            })?;

        Ok(PeriodicTask {
            id,
            name: name.to_string(),
            notify_shutdown,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Signals the task and waits for its thread, unless called from its own tick.
    pub fn stop(&mut self) {
        let _ = self.notify_shutdown.send(());
        let Some(handle) = self.handle.take() else {
            return;
        };
        if RUNNING_TICK.with(|current| current.get()) == self.id {
            // the loop exits once this tick returns
            return;
        }
        if handle.join().is_err() {
            error!("periodic task {} thread panicked", self.name);
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn ticks_until_stopped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let ticks = counter.clone();
        let mut task = PeriodicTask::spawn("test-ticker", Duration::from_millis(20), move || {
            ticks.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(task.is_running());
        std::thread::sleep(Duration::from_millis(200));
        task.stop();
        let seen = counter.load(Ordering::SeqCst);
        assert!(seen >= 2, "only {} ticks", seen);
        assert!(!task.is_running());
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(counter.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn panicking_tick_keeps_the_task_alive() {
        let counter = Arc::new(AtomicUsize::new(0));
        let ticks = counter.clone();
        let mut task = PeriodicTask::spawn("test-panic", Duration::from_millis(20), move || {
            if ticks.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first tick fails");
            }
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(200));
        task.stop();
        assert!(counter.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn stop_from_own_tick_does_not_deadlock() {
        let slot: Arc<Mutex<Option<PeriodicTask>>> = Arc::new(Mutex::new(None));
        let inner = slot.clone();
        let task = PeriodicTask::spawn("test-self-stop", Duration::from_millis(20), move || {
            if let Some(mut task) = inner.lock().take() {
                task.stop();
            }
        })
        .unwrap();
        *slot.lock() = Some(task);
        std::thread::sleep(Duration::from_millis(150));
        assert!(slot.lock().is_none());
    }
}
