//! Transport core: framing, sessions and the reactor.
//!
//! An [`EventGroup`] ties a [`Codec`], a [`Listener`] and an executor pool to one or
//! more event processors. Each processor owns a `mio` poll and a thread; sessions
//! registered with it are read and written on that thread only, while decoded
//! messages are handed to the listener on the executor pool.

pub use buffer::{BufferView, ByteBuffer};
pub use codec::{Codec, LengthFieldCodec, LineCodec, SharedCodec};
pub use event_group::EventGroup;
pub use executor::Executor;
pub use listener::{Listener, SharedListener};
pub use processor::EventProcessor;
pub use session::{GroupContext, Session, SessionId, Status};

mod buffer;
mod codec;
mod event_group;
mod executor;
mod listener;
mod processor;
mod session;
