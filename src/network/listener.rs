use std::sync::Arc;

use super::Session;
use crate::{AppError, AppResult};

/// Application callbacks of one client or server endpoint.
///
/// `on_message_received`, `on_exception_caught` and `on_after_session_closed` always
/// run on the executor pool. The other callbacks run inline on the reactor thread and
/// must not block.
pub trait Listener<M>: Send + Sync + 'static {
    fn on_session_registered(&self, _session: &Arc<Session<M>>) -> AppResult<()> {
        Ok(())
    }

    fn on_session_accepted(&self, _session: &Arc<Session<M>>) -> AppResult<()> {
        Ok(())
    }

    fn on_session_connected(&self, _session: &Arc<Session<M>>) -> AppResult<()> {
        Ok(())
    }

    fn on_before_session_closed(&self, _session: &Arc<Session<M>>) -> AppResult<()> {
        Ok(())
    }

    fn on_after_session_closed(&self, _session: &Arc<Session<M>>) -> AppResult<()> {
        Ok(())
    }

    fn on_message_received(&self, message: M, session: &Arc<Session<M>>) -> AppResult<()>;

    /// `session` is absent when the failure belongs to an acceptor or a bound datagram
    /// socket rather than to one connection.
    fn on_exception_caught(
        &self,
        _error: &AppError,
        _session: Option<&Arc<Session<M>>>,
    ) -> AppResult<()> {
        Ok(())
    }
}

pub type SharedListener<M> = Arc<dyn Listener<M>>;
