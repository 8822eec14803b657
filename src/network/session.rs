use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use dashmap::DashMap;
use mio::net::{TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use super::executor::Executor;
use super::processor::ProcessorHandle;
use super::{ByteBuffer, SharedCodec, SharedListener};
use crate::utils::now_millis;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> SessionId {
        SessionId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        SessionId::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    New = 0,
    Connected = 1,
    Error = 2,
    Closed = 3,
}

impl Status {
    fn from_u8(value: u8) -> Status {
        match value {
            0 => Status::New,
            1 => Status::Connected,
            2 => Status::Error,
            _ => Status::Closed,
        }
    }

    fn can_become(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::New, Status::Connected)
                | (Status::New, Status::Error)
                | (Status::New, Status::Closed)
                | (Status::Connected, Status::Error)
                | (Status::Connected, Status::Closed)
                | (Status::Error, Status::Closed)
        )
    }
}

/// Everything a session needs from the event group that created it.
pub struct GroupContext<M> {
    pub(crate) name: String,
    pub(crate) codec: SharedCodec<M>,
    pub(crate) listener: SharedListener<M>,
    pub(crate) executor: Arc<Executor>,
    pub(crate) buffer_size: usize,
    pub(crate) max_write_queue: Option<usize>,
}

impl<M> GroupContext<M> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Which side created the session, decides how it becomes CONNECTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Accepted,
    /// client stream with a connect in flight
    Connector,
    /// client datagram socket, connected as soon as it is registered
    Datagram,
    Peer,
}

pub(crate) enum Channel {
    Stream(TcpStream),
    /// connected datagram socket of a client
    Datagram(UdpSocket),
    /// source address behind the bound socket registered under `bound`
    Peer { bound: Token, addr: SocketAddr },
}

impl Channel {
    pub(crate) fn deregister(&mut self, registry: &Registry) {
        let result = match self {
            Channel::Stream(stream) => registry.deregister(stream),
            Channel::Datagram(socket) => registry.deregister(socket),
            Channel::Peer { .. } => Ok(()),
        };
        if let Err(e) = result {
            trace!("deregister failed: {}", e);
        }
    }
}

struct Registration<M> {
    token: Token,
    processor: Arc<ProcessorHandle<M>>,
}

type Attribute = Arc<dyn Any + Send + Sync>;

/// One network connection, or one datagram peer, and its state machine.
///
/// Channel reads and writes only ever happen on the thread of the processor the
/// session is registered with. Other threads queue outbound frames through
/// [`Session::send`] and ask for a close through [`Session::close`].
pub struct Session<M> {
    id: SessionId,
    origin: Origin,
    status: AtomicU8,
    last_activity: AtomicI64,
    remote_addr: Option<SocketAddr>,
    attributes: DashMap<String, Attribute>,
    context: Arc<GroupContext<M>>,
    channel: Mutex<Option<Channel>>,
    registration: Mutex<Option<Registration<M>>>,
    read_buffer: Mutex<ByteBuffer>,
    write_queue: Mutex<VecDeque<Bytes>>,
    flush_requested: AtomicBool,
    inbox: Mutex<VecDeque<M>>,
    delivering: AtomicBool,
    close_requested: AtomicBool,
    connected: Mutex<bool>,
    connected_cond: Condvar,
}

impl<M: Send + 'static> Session<M> {
    pub(crate) fn new(
        context: Arc<GroupContext<M>>,
        channel: Channel,
        origin: Origin,
        remote_addr: Option<SocketAddr>,
    ) -> Arc<Session<M>> {
        let buffer_size = context.buffer_size;
        Arc::new(Session {
            id: SessionId::new(),
            origin,
            status: AtomicU8::new(Status::New as u8),
            last_activity: AtomicI64::new(now_millis()),
            remote_addr,
            attributes: DashMap::new(),
            context,
            channel: Mutex::new(Some(channel)),
            registration: Mutex::new(None),
            read_buffer: Mutex::new(ByteBuffer::with_capacity(buffer_size)),
            write_queue: Mutex::new(VecDeque::new()),
            flush_requested: AtomicBool::new(false),
            inbox: Mutex::new(VecDeque::new()),
            delivering: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            connected: Mutex::new(false),
            connected_cond: Condvar::new(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.status() == Status::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.status() == Status::Closed
    }

    /// Whether the session still owns a processor registration.
    pub fn is_registered(&self) -> bool {
        self.registration.lock().is_some()
    }

    pub fn group_name(&self) -> &str {
        &self.context.name
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Release);
    }

    pub fn set_attribute<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.attributes.insert(key.into(), Arc::new(value));
    }

    pub fn attribute<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.attributes.get(key)?.value().clone();
        value.downcast::<T>().ok()
    }

    pub fn contains_attribute(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn remove_attribute(&self, key: &str) -> bool {
        self.attributes.remove(key).is_some()
    }

    pub fn attribute_keys(&self) -> Vec<String> {
        self.attributes.iter().map(|e| e.key().clone()).collect()
    }

    /// Frames waiting to be written.
    pub fn pending_writes(&self) -> usize {
        self.write_queue.lock().len()
    }

    /// Moves the state machine forward; refused moves leave the status untouched.
    pub(crate) fn transition(&self, next: Status) -> bool {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if !Status::from_u8(current).can_become(next) {
                return false;
            }
            match self.status.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn origin(&self) -> Origin {
        self.origin
    }

    pub(crate) fn attach(&self, token: Token, processor: Arc<ProcessorHandle<M>>) {
        *self.registration.lock() = Some(Registration { token, processor });
    }

    /// Registry token of the bound socket behind a datagram peer.
    pub(crate) fn bound_token(&self) -> Option<Token> {
        match self.channel.lock().as_ref() {
            Some(Channel::Peer { bound, .. }) => Some(*bound),
            _ => None,
        }
    }

    /// Registers the channel with the processor's multiplexer, or updates its interest.
    pub(crate) fn register_channel(
        &self,
        registry: &Registry,
        token: Token,
        interest: Interest,
        update: bool,
    ) -> io::Result<()> {
        let mut guard = self.channel.lock();
        match guard.as_mut() {
            Some(Channel::Stream(stream)) if update => registry.reregister(stream, token, interest),
            Some(Channel::Stream(stream)) => registry.register(stream, token, interest),
            Some(Channel::Datagram(socket)) if update => {
                registry.reregister(socket, token, interest)
            }
            Some(Channel::Datagram(socket)) => registry.register(socket, token, interest),
            Some(Channel::Peer { .. }) | None => Ok(()),
        }
    }

    /// Checks a pending non-blocking connect, `Ok(false)` while it is still in progress.
    pub(crate) fn finish_connect(&self) -> AppResult<bool> {
        let guard = self.channel.lock();
        let Some(Channel::Stream(stream)) = guard.as_ref() else {
            return Ok(true);
        };
        if let Some(e) = stream.take_error()? {
            return Err(e.into());
        }
        match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn mark_connected(&self) {
        self.transition(Status::Connected);
        self.release_connect_waiters(true);
    }

    fn release_connect_waiters(&self, connected: bool) {
        let mut flag = self.connected.lock();
        *flag = connected;
        self.connected_cond.notify_all();
    }

    /// Blocks until the connect completes, `false` on failure or once `timeout` elapses.
    pub fn connect_sync(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flag = self.connected.lock();
        loop {
            if *flag {
                return true;
            }
            if matches!(self.status(), Status::Error | Status::Closed) {
                return false;
            }
            if self.connected_cond.wait_until(&mut flag, deadline).timed_out() {
                return *flag;
            }
        }
    }

    /// Reads everything the socket has and hands out every complete frame.
    ///
    /// End of stream closes the session gracefully, after the frames that arrived
    /// before it have been decoded.
    pub(crate) fn read(self: &Arc<Self>, scratch: &mut [u8]) -> AppResult<()> {
        let mut eof = false;
        let mut datagrams = Vec::new();
        {
            let mut guard = self.channel.lock();
            match guard.as_mut() {
                Some(Channel::Stream(stream)) => {
                    let mut buffer = self.read_buffer.lock();
                    loop {
                        match stream.read(scratch) {
                            Ok(0) => {
                                eof = true;
                                break;
                            }
                            Ok(n) => buffer.append(&scratch[..n]),
                            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
                Some(Channel::Datagram(socket)) => loop {
                    match socket.recv(scratch) {
                        Ok(n) => datagrams.push(scratch[..n].to_vec()),
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                },
                Some(Channel::Peer { .. }) | None => return Ok(()),
            }
        }

        for datagram in datagrams {
            self.receive_datagram(&datagram)?;
        }

        let mut frames = Vec::new();
        let codec = &self.context.codec;
        let decoded = self
            .read_buffer
            .lock()
            .drain_frames(|view| codec.decode(view), |message| frames.push(message));
        for message in frames {
            self.deliver(message);
        }
        decoded?;

        if eof {
            debug!("session {} reached end of stream", self.id);
            self.close();
        }
        Ok(())
    }

    /// Decodes one datagram on its own; an incomplete tail is dropped.
    pub(crate) fn receive_datagram(self: &Arc<Self>, datagram: &[u8]) -> AppResult<()> {
        let mut buffer = ByteBuffer::with_capacity(datagram.len());
        buffer.append(datagram);
        let mut frames = Vec::new();
        let codec = &self.context.codec;
        let decoded = buffer.drain_frames(|view| codec.decode(view), |m| frames.push(m));
        for message in frames {
            self.deliver(message);
        }
        decoded?;
        if !buffer.is_empty() {
            trace!(
                "session {} dropped {} trailing datagram bytes",
                self.id,
                buffer.len()
            );
        }
        Ok(())
    }

    fn deliver(self: &Arc<Self>, message: M) {
        self.inbox.lock().push_back(message);
        if !self.delivering.swap(true, Ordering::AcqRel) {
            let session = self.clone();
            self.context.executor.submit(move || session.drain_inbox());
        }
    }

    fn drain_inbox(self: &Arc<Self>) {
        loop {
            let next = self.inbox.lock().pop_front();
            match next {
                Some(message) => self.dispatch_message(message),
                None => {
                    self.delivering.store(false, Ordering::Release);
                    // a frame may have landed between the pop and the store
                    if self.inbox.lock().is_empty() || self.delivering.swap(true, Ordering::AcqRel)
                    {
                        return;
                    }
                }
            }
        }
    }

    fn dispatch_message(self: &Arc<Self>, message: M) {
        let listener = &self.context.listener;
        let Err(error) = listener.on_message_received(message, self) else {
            return;
        };
        warn!("session {} message callback failed: {}", self.id, error);
        if let Err(e) = listener.on_exception_caught(&error, Some(self)) {
            error!(
                "session {} exception callback failed: {}, closing session",
                self.id, e
            );
            self.close();
        }
    }

    /// Queues `message` for the owning processor to write.
    ///
    /// A session that was never registered, or is already closed, drops the message.
    pub fn send(&self, message: &M) -> AppResult<()> {
        let Some((token, processor)) = self
            .registration
            .lock()
            .as_ref()
            .map(|r| (r.token, r.processor.clone()))
        else {
            trace!("session {} is not registered, message dropped", self.id);
            return Ok(());
        };
        let Some(frame) = self.context.codec.encode(message)? else {
            return Ok(());
        };
        {
            let mut queue = self.write_queue.lock();
            if let Some(limit) = self.context.max_write_queue {
                if queue.len() >= limit {
                    return Err(AppError::WriteQueueFull(self.id.to_string(), limit));
                }
            }
            queue.push_back(frame);
        }
        if !self.flush_requested.swap(true, Ordering::SeqCst) {
            processor.request_flush(token);
        }
        Ok(())
    }

    pub(crate) fn clear_flush_request(&self) {
        self.flush_requested.store(false, Ordering::SeqCst);
    }

    /// Writes queued frames in order, `Ok(true)` once the queue is empty.
    ///
    /// A frame stays at the head until it has been written completely, and the first
    /// write that makes no progress ends the flush. Datagram peers write through
    /// `bound`, the socket they share.
    pub(crate) fn flush(&self, bound: Option<&UdpSocket>) -> AppResult<bool> {
        let mut guard = self.channel.lock();
        let Some(channel) = guard.as_mut() else {
            return Ok(true);
        };
        let mut queue = self.write_queue.lock();
        while let Some(front) = queue.front_mut() {
            let (written, whole_frame) = match channel {
                Channel::Stream(stream) => (stream.write(&front[..]), false),
                Channel::Datagram(socket) => (socket.send(&front[..]), true),
                Channel::Peer { addr, .. } => match bound {
                    Some(socket) => (socket.send_to(&front[..], *addr), true),
                    None => return Ok(false),
                },
            };
            match written {
                Ok(0) if !front.is_empty() => return Ok(false),
                Ok(n) if whole_frame || n >= front.len() => {
                    queue.pop_front();
                }
                Ok(n) => front.advance(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Routes an I/O or codec failure to the listener, then closes the session.
    ///
    /// Only the first failure of a session is reported; later ones, or failures of
    /// a session already closed, are only traced.
    pub(crate) fn fail(self: &Arc<Self>, error: AppError) {
        if !self.transition(Status::Error) {
            trace!("session {} already failed or closed: {}", self.id, error);
            return;
        }
        if error.is_disconnect() {
            debug!("session {} disconnected: {}", self.id, error);
        } else {
            warn!("session {} failed: {}", self.id, error);
        }
        self.release_connect_waiters(false);
        let session = self.clone();
        self.context.executor.submit(move || {
            if let Err(e) = session
                .context
                .listener
                .on_exception_caught(&error, Some(&session))
            {
                error!("session {} exception callback failed: {}", session.id, e);
            }
            session.close();
        });
    }

    /// Asks the owning processor to close the session.
    ///
    /// The before-close callback runs here on the calling thread, at most once.
    /// Unregistered sessions are left alone.
    pub fn close(self: &Arc<Self>) {
        let processor = match self.registration.lock().as_ref() {
            Some(registration) => registration.processor.clone(),
            None => return,
        };
        if !self.begin_close() {
            return;
        }
        processor.unregister_session(self.clone());
    }

    fn begin_close(self: &Arc<Self>) -> bool {
        if self.close_requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Err(e) = self.context.listener.on_before_session_closed(self) {
            warn!("session {} before-close callback failed: {}", self.id, e);
        }
        true
    }

    /// Releases the registration and the channel, then posts the after-close callback.
    ///
    /// Only the first call does anything.
    pub fn close_now(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        self.begin_close();
        if !self.transition(Status::Closed) {
            return;
        }
        let registration = self.registration.lock().take();
        let channel = self.channel.lock().take();
        self.release_connect_waiters(false);
        self.write_queue.lock().clear();
        match registration {
            Some(registration) => registration.processor.release(registration.token, channel),
            None => drop(channel),
        }
        debug!("session {} of {} closed", self.id, self.context.name);

        let session = self.clone();
        self.context.executor.submit(move || {
            if let Err(e) = session.context.listener.on_after_session_closed(&session) {
                warn!("session {} after-close callback failed: {}", session.id, e);
            }
        });
    }
}

impl<M> fmt::Debug for Session<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &Status::from_u8(self.status.load(Ordering::Relaxed)))
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}
