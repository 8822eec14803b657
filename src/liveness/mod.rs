//! Background services that keep a client connection alive.

pub use heartbeat::{HeartbeatAction, HeartbeatService};
pub use reconnect::ReconnectService;

mod heartbeat;
mod reconnect;

use crate::service::Client;
use crate::AppResult;

/// A periodic service attached to one client.
///
/// A service does nothing until `initialize` has bound it to a client, and only
/// holds a weak reference to it. `close` stops the timer; a later `start` brings it
/// back.
pub trait ClientService<M: Send + 'static>: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn initialize(&self, client: &Client<M>) -> AppResult<()>;

    fn is_initialized(&self) -> bool;

    fn start(&self) -> AppResult<()>;

    fn is_started(&self) -> bool;

    fn close(&self);
}
