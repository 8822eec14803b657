//! A non-blocking, event-driven transport layer for TCP and UDP.
//!
//! Bytes are framed by a pluggable [`Codec`]; each connection is a [`Session`]
//! driven by a `mio` reactor thread, and application code reacts through a
//! [`Listener`] on a separate executor pool. [`Server`], [`Client`] and
//! [`SessionManager`] build the endpoints; [`ReconnectService`] and
//! [`HeartbeatService`] keep client connections alive.

pub mod liveness;
pub mod network;
pub mod service;
pub mod session_manager;
mod utils;

pub use liveness::{ClientService, HeartbeatAction, HeartbeatService, ReconnectService};
pub use network::{
    BufferView, ByteBuffer, Codec, EventGroup, LengthFieldCodec, LineCodec, Listener, Session,
    SessionId, Status,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Client, ClientConfig, NetConfig,
    Server, ServerConfig, Shutdown, TracingGuard, Transport, WeakClient,
};
pub use session_manager::{SessionListener, SessionManager, SessionWrapper};
pub use utils::{now_millis, PeriodicTask};
