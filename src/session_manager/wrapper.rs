use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::network::{Session, SessionId};
use crate::AppResult;

/// What a managed session exposes to application code.
pub struct SessionWrapper<M> {
    session: Arc<Session<M>>,
}

impl<M> Clone for SessionWrapper<M> {
    fn clone(&self) -> Self {
        SessionWrapper {
            session: self.session.clone(),
        }
    }
}

impl<M: Send + 'static> SessionWrapper<M> {
    pub(crate) fn new(session: Arc<Session<M>>) -> SessionWrapper<M> {
        SessionWrapper { session }
    }

    pub fn id(&self) -> SessionId {
        self.session.id()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.session.remote_addr()
    }

    pub fn touch(&self) {
        self.session.touch();
    }

    pub fn last_touch_time(&self) -> i64 {
        self.session.last_activity()
    }

    pub fn set_attribute<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.session.set_attribute(key, value);
    }

    pub fn attribute<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.session.attribute(key)
    }

    pub fn remove_attribute(&self, key: &str) -> bool {
        self.session.remove_attribute(key)
    }

    pub fn send(&self, message: &M) -> AppResult<()> {
        self.session.send(message)
    }

    pub fn close(&self) {
        self.session.close();
    }

    pub fn session(&self) -> &Arc<Session<M>> {
        &self.session
    }
}

impl<M> fmt::Display for SessionWrapper<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionWrapper({:?})", self.session)
    }
}
