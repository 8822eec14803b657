use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{trace, warn};

use super::reconnect::client_name;
use super::ClientService;
use crate::service::{Client, ClientConfig, WeakClient};
use crate::utils::{now_millis, PeriodicTask};
use crate::{AppError, AppResult};

/// What to do with a session that has been silent for too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatAction {
    /// close the session and leave the rebuild to a reconnect service
    #[default]
    Close,
    /// close the session and reconnect right away
    Reconnect,
}

type HeartbeatMessage<M> = Arc<dyn Fn() -> M + Send + Sync>;

/// Sends an optional heartbeat every `interval` and acts on sessions with no
/// activity for longer than `staleness`.
pub struct HeartbeatService<M: Send + 'static> {
    interval: Duration,
    staleness: Duration,
    action: HeartbeatAction,
    message: Option<HeartbeatMessage<M>>,
    client: OnceCell<WeakClient<M>>,
    task: Mutex<Option<PeriodicTask>>,
}

impl<M: Send + 'static> HeartbeatService<M> {
    pub fn new(interval: Duration, staleness: Duration) -> HeartbeatService<M> {
        HeartbeatService {
            interval,
            staleness,
            action: HeartbeatAction::default(),
            message: None,
            client: OnceCell::new(),
            task: Mutex::new(None),
        }
    }

    /// Heartbeat every configured interval, stale after three missed ones.
    pub fn from_config(config: &ClientConfig) -> HeartbeatService<M> {
        let interval = config.heartbeat_interval();
        HeartbeatService::new(interval, interval * 3)
    }

    pub fn with_action(mut self, action: HeartbeatAction) -> HeartbeatService<M> {
        self.action = action;
        self
    }

    pub fn with_message<F>(mut self, message: F) -> HeartbeatService<M>
    where
        F: Fn() -> M + Send + Sync + 'static,
    {
        self.message = Some(Arc::new(message));
        self
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }
}

fn beat<M: Send + 'static>(
    client: &WeakClient<M>,
    message: Option<&HeartbeatMessage<M>>,
    staleness: Duration,
    action: HeartbeatAction,
) {
    let Some(client) = client.upgrade() else {
        return;
    };
    let Some(session) = client.session().filter(|s| s.is_connected()) else {
        return;
    };
    if let Some(message) = message {
        trace!("client {} sends heartbeat", client.config().name);
        if let Err(e) = session.send(&message()) {
            warn!("client {} heartbeat send failed: {}", client.config().name, e);
        }
    }
    let idle = now_millis() - session.last_activity();
    if idle > staleness.as_millis() as i64 {
        warn!(
            "client {} session {} silent for {}ms, {:?}",
            client.config().name,
            session.id(),
            idle,
            action
        );
        match action {
            HeartbeatAction::Close => session.close(),
            HeartbeatAction::Reconnect => {
                session.close_now();
                if let Err(e) = client.reconnect() {
                    warn!("client {} reconnect failed: {}", client.config().name, e);
                }
            }
        }
    }
}

impl<M: Send + 'static> ClientService<M> for HeartbeatService<M> {
    fn name(&self) -> &str {
        "heartbeat"
    }

    fn initialize(&self, client: &Client<M>) -> AppResult<()> {
        self.client.set(client.downgrade()).map_err(|_| {
            AppError::IllegalStateError("heartbeat service is already initialized".to_string())
        })
    }

    fn is_initialized(&self) -> bool {
        self.client.get().is_some()
    }

    fn start(&self) -> AppResult<()> {
        let Some(client) = self.client.get().cloned() else {
            return Err(AppError::IllegalStateError(
                "heartbeat service is not initialized".to_string(),
            ));
        };
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| t.is_running()) {
            return Ok(());
        }
        let name = format!("{}-heartbeat", client_name(&client));
        let message = self.message.clone();
        let staleness = self.staleness;
        let action = self.action;
        *task = Some(PeriodicTask::spawn(&name, self.interval, move || {
            beat(&client, message.as_ref(), staleness, action)
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
