pub use manager::SessionManager;
pub use wrapper::SessionWrapper;

mod manager;
mod wrapper;

use crate::{AppError, AppResult};

/// Server callbacks in terms of managed sessions.
///
/// Callbacks fire only while the session is known to the manager, the same
/// threading rules as [`crate::network::Listener`] apply.
pub trait SessionListener<M>: Send + Sync + 'static {
    fn on_session_registered(&self, _session: &SessionWrapper<M>) -> AppResult<()> {
        Ok(())
    }

    fn on_session_accepted(&self, _session: &SessionWrapper<M>) -> AppResult<()> {
        Ok(())
    }

    fn on_before_session_closed(&self, _session: &SessionWrapper<M>) -> AppResult<()> {
        Ok(())
    }

    fn on_after_session_closed(&self, _session: &SessionWrapper<M>) -> AppResult<()> {
        Ok(())
    }

    fn on_message_received(&self, message: M, session: &SessionWrapper<M>) -> AppResult<()>;

    fn on_exception_caught(
        &self,
        _error: &AppError,
        _session: Option<&SessionWrapper<M>>,
    ) -> AppResult<()> {
        Ok(())
    }

    /// The idle sweep dropped `session`; it is being closed.
    fn on_session_idle_removed(&self, _session: &SessionWrapper<M>) {}
}
