use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{SessionListener, SessionWrapper};
use crate::network::{Codec, Listener, Session, SessionId};
use crate::service::{Server, ServerConfig};
use crate::utils::{now_millis, PeriodicTask};
use crate::{AppError, AppResult};

const IDLE_CHECK_PERIOD: Duration = Duration::from_secs(1);

type Registry<M> = DashMap<SessionId, SessionWrapper<M>>;

/// Bridges transport callbacks to a [`SessionListener`] and keeps the registry current.
struct ManagedListener<M> {
    sessions: Arc<Registry<M>>,
    listener: Arc<dyn SessionListener<M>>,
}

impl<M: Send + 'static> ManagedListener<M> {
    fn wrapper_of(&self, session: &Arc<Session<M>>) -> Option<SessionWrapper<M>> {
        self.sessions.get(&session.id()).map(|w| w.value().clone())
    }

    fn register(&self, session: &Arc<Session<M>>) -> SessionWrapper<M> {
        self.sessions
            .entry(session.id())
            .or_insert_with(|| SessionWrapper::new(session.clone()))
            .value()
            .clone()
    }
}

impl<M: Send + 'static> Listener<M> for ManagedListener<M> {
    fn on_session_accepted(&self, session: &Arc<Session<M>>) -> AppResult<()> {
        let wrapper = self.register(session);
        debug!("{} accepted", wrapper);
        self.listener.on_session_accepted(&wrapper)
    }

    fn on_session_registered(&self, session: &Arc<Session<M>>) -> AppResult<()> {
        let wrapper = self.register(session);
        debug!("{} registered, session count: {}", wrapper, self.sessions.len());
        self.listener.on_session_registered(&wrapper)
    }

    fn on_before_session_closed(&self, session: &Arc<Session<M>>) -> AppResult<()> {
        match self.wrapper_of(session) {
            Some(wrapper) => self.listener.on_before_session_closed(&wrapper),
            None => Ok(()),
        }
    }

    fn on_after_session_closed(&self, session: &Arc<Session<M>>) -> AppResult<()> {
        let Some((_, wrapper)) = self.sessions.remove(&session.id()) else {
            return Ok(());
        };
        debug!("{} closed, session count: {}", wrapper, self.sessions.len());
        self.listener.on_after_session_closed(&wrapper)
    }

    fn on_message_received(&self, message: M, session: &Arc<Session<M>>) -> AppResult<()> {
        let Some(wrapper) = self.wrapper_of(session) else {
            return Ok(());
        };
        wrapper.touch();
        self.listener.on_message_received(message, &wrapper)
    }

    fn on_exception_caught(
        &self,
        error: &AppError,
        session: Option<&Arc<Session<M>>>,
    ) -> AppResult<()> {
        match session {
            Some(session) => match self.wrapper_of(session) {
                Some(wrapper) => self.listener.on_exception_caught(error, Some(&wrapper)),
                None => Ok(()),
            },
            None => self.listener.on_exception_caught(error, None),
        }
    }
}

/// Removes every session idle for longer than `idle_ms` at `now`, then closes it.
fn sweep<M: Send + 'static>(
    sessions: &Registry<M>,
    listener: &dyn SessionListener<M>,
    idle_ms: i64,
    now: i64,
) -> usize {
    let stale: Vec<SessionId> = sessions
        .iter()
        .filter(|entry| now - entry.value().last_touch_time() > idle_ms)
        .map(|entry| *entry.key())
        .collect();
    let mut removed = 0;
    for id in stale {
        let Some((_, wrapper)) = sessions.remove(&id) else {
            continue;
        };
        removed += 1;
        debug!("{} idle for {}ms, removed", wrapper, now - wrapper.last_touch_time());
        listener.on_session_idle_removed(&wrapper);
        wrapper.close();
    }
    removed
}

/// Owns a server and tracks its sessions by id.
pub struct SessionManager<M: Send + 'static> {
    sessions: Arc<Registry<M>>,
    listener: Arc<dyn SessionListener<M>>,
    server: Server<M>,
    idle_time: Duration,
    idle_checker: Mutex<Option<PeriodicTask>>,
}

impl<M: Send + 'static> SessionManager<M> {
    /// `idle_time` of zero turns the idle sweep off.
    pub fn new<C, L>(
        config: ServerConfig,
        codec: C,
        listener: L,
        idle_time: Duration,
    ) -> AppResult<SessionManager<M>>
    where
        C: Codec<Message = M>,
        L: SessionListener<M>,
    {
        let sessions: Arc<Registry<M>> = Arc::new(DashMap::new());
        let listener: Arc<dyn SessionListener<M>> = Arc::new(listener);
        let managed = ManagedListener {
            sessions: sessions.clone(),
            listener: listener.clone(),
        };
        let server = Server::new(config, codec, managed)?;
        Ok(SessionManager {
            sessions,
            listener,
            server,
            idle_time,
            idle_checker: Mutex::new(None),
        })
    }

    /// Starts the server, then the idle checker.
    pub fn initialize(&self) -> AppResult<()> {
        self.server.start()?;
        if self.idle_time.is_zero() {
            return Ok(());
        }
        let mut checker = self.idle_checker.lock();
        if checker.is_some() {
            return Ok(());
        }
        let sessions = self.sessions.clone();
        let listener = self.listener.clone();
        let idle_ms = self.idle_time.as_millis() as i64;
        let name = format!("{}-idle-checker", self.server.config().name);
        *checker = Some(PeriodicTask::spawn(&name, IDLE_CHECK_PERIOD, move || {
            let removed = sweep(&sessions, listener.as_ref(), idle_ms, now_millis());
            if removed > 0 {
                info!("idle checker removed {} sessions", removed);
            }
        })?);
        Ok(())
    }

    pub fn close(&self) {
        let checker = self.idle_checker.lock().take();
        if let Some(mut checker) = checker {
            checker.stop();
        }
        self.server.close();
    }

    pub fn server(&self) -> &Server<M> {
        &self.server
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    pub fn idle_time(&self) -> Duration {
        self.idle_time
    }

    pub fn session_wrapper(&self, id: &SessionId) -> Option<SessionWrapper<M>> {
        self.sessions.get(id).map(|w| w.value().clone())
    }

    pub fn session_wrappers(&self) -> Vec<SessionWrapper<M>> {
        self.sessions.iter().map(|w| w.value().clone()).collect()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// `Ok(false)` when no session has this id.
    pub fn send_to(&self, id: &SessionId, message: &M) -> AppResult<bool> {
        match self.session_wrapper(id) {
            Some(wrapper) => {
                wrapper.send(message)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Sends `message` to every session, returning how many accepted it.
    pub fn broadcast(&self, message: &M) -> usize {
        self.session_wrappers()
            .iter()
            .filter(|wrapper| match wrapper.send(message) {
                Ok(()) => true,
                Err(e) => {
                    warn!("broadcast to {} failed: {}", wrapper, e);
                    false
                }
            })
            .count()
    }

    /// Forgets the session and closes it.
    pub fn close_session_wrapper(&self, wrapper: &SessionWrapper<M>) {
        self.sessions.remove(&wrapper.id());
        wrapper.close();
    }

    pub fn sweep_idle_sessions(&self) -> usize {
        self.sweep_idle_sessions_at(now_millis())
    }

    /// Like [`SessionManager::sweep_idle_sessions`], measured against `now` in millis.
    /// Does nothing when the manager was built with no idle time.
    pub fn sweep_idle_sessions_at(&self, now: i64) -> usize {
        if self.idle_time.is_zero() {
            return 0;
        }
        let idle_ms = self.idle_time.as_millis() as i64;
        sweep(&self.sessions, self.listener.as_ref(), idle_ms, now)
    }
}

impl<M: Send + 'static> Drop for SessionManager<M> {
    fn drop(&mut self) {
        self.close();
    }
}
