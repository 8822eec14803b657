use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use super::ClientService;
use crate::service::{Client, ClientConfig, WeakClient};
use crate::utils::PeriodicTask;
use crate::{AppError, AppResult};

const DEFAULT_MAX_INTERVAL_FACTOR: u32 = 32;

/// Exponential delay between failed attempts, with up to 10% jitter.
#[derive(Debug)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    delay: Duration,
    next_attempt: Option<Instant>,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Backoff {
        Backoff {
            initial,
            max: max.max(initial),
            delay: initial,
            next_attempt: None,
        }
    }

    pub(crate) fn ready(&self, now: Instant) -> bool {
        self.next_attempt.map_or(true, |at| now >= at)
    }

    /// Records a failure and returns the wait before the next attempt.
    pub(crate) fn failed(&mut self, now: Instant) -> Duration {
        let jitter_cap = (self.delay.as_millis() as u64 / 10).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap));
        let wait = self.delay + jitter;
        self.next_attempt = Some(now + wait);
        self.delay = (self.delay * 2).min(self.max);
        wait
    }

    pub(crate) fn reset(&mut self) {
        self.delay = self.initial;
        self.next_attempt = None;
    }
}

/// Probes the client every `interval` and rebuilds its connection once it is gone.
pub struct ReconnectService<M: Send + 'static> {
    interval: Duration,
    max_interval: Duration,
    client: OnceCell<WeakClient<M>>,
    task: Mutex<Option<PeriodicTask>>,
    backoff: Arc<Mutex<Backoff>>,
}

impl<M: Send + 'static> ReconnectService<M> {
    pub fn new(interval: Duration) -> ReconnectService<M> {
        ReconnectService::with_max_interval(interval, interval * DEFAULT_MAX_INTERVAL_FACTOR)
    }

    pub fn with_max_interval(interval: Duration, max_interval: Duration) -> ReconnectService<M> {
        ReconnectService {
            interval,
            max_interval,
            client: OnceCell::new(),
            task: Mutex::new(None),
            backoff: Arc::new(Mutex::new(Backoff::new(interval, max_interval))),
        }
    }

    pub fn from_config(config: &ClientConfig) -> ReconnectService<M> {
        ReconnectService::new(config.reconnection_interval())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }
}

fn probe<M: Send + 'static>(client: &WeakClient<M>, backoff: &Mutex<Backoff>) {
    let Some(client) = client.upgrade() else {
        return;
    };
    if client.is_closing() || client.is_connected() {
        backoff.lock().reset();
        return;
    }
    if !backoff.lock().ready(Instant::now()) {
        return;
    }
    match client.reconnect() {
        Ok(()) if client.is_connected() => {
            info!("client {} reconnected", client.config().name);
            backoff.lock().reset();
        }
        Ok(()) => {
            debug!("client {} reconnect skipped", client.config().name);
        }
        Err(e) => {
            let wait = backoff.lock().failed(Instant::now());
            warn!(
                "client {} reconnect failed: {}, next attempt in {:?}",
                client.config().name,
                e,
                wait
            );
        }
    }
}

impl<M: Send + 'static> ClientService<M> for ReconnectService<M> {
    fn name(&self) -> &str {
        "reconnect"
    }

    fn initialize(&self, client: &Client<M>) -> AppResult<()> {
        self.client.set(client.downgrade()).map_err(|_| {
            AppError::IllegalStateError("reconnect service is already initialized".to_string())
        })
    }

    fn is_initialized(&self) -> bool {
        self.client.get().is_some()
    }

    fn start(&self) -> AppResult<()> {
        let Some(client) = self.client.get().cloned() else {
            return Err(AppError::IllegalStateError(
                "reconnect service is not initialized".to_string(),
            ));
        };
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| t.is_running()) {
            return Ok(());
        }
        let name = format!("{}-reconnect", client_name(&client));
        let backoff = self.backoff.clone();
        backoff.lock().reset();
        *task = Some(PeriodicTask::spawn(&name, self.interval, move || {
            probe(&client, &backoff)
        })?);
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| t.is_running())
    }

    fn close(&self) {
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            task.stop();
        }
    }
}

pub(super) fn client_name<M: Send + 'static>(client: &WeakClient<M>) -> String {
    client
        .upgrade()
        .map_or_else(|| "client".to_string(), |c| c.config().name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let start = Instant::now();
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert!(backoff.ready(start));

        let first = backoff.failed(start);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(110));
        assert!(!backoff.ready(start));
        assert!(backoff.ready(start + first));

        let second = backoff.failed(start);
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(220));
        let third = backoff.failed(start);
        assert!(third >= Duration::from_millis(350) && third <= Duration::from_millis(385));
        let fourth = backoff.failed(start);
        assert!(fourth <= Duration::from_millis(385));

        backoff.reset();
        assert!(backoff.ready(start));
        let again = backoff.failed(start);
        assert!(again <= Duration::from_millis(110));
    }
}
