use std::collections::{HashMap, HashSet, VecDeque};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use mio::event::Event;
use mio::net::{TcpListener, UdpSocket};
use mio::{Events, Interest, Poll, Token, Waker};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use super::session::{Channel, GroupContext, Origin};
use super::Session;
use crate::{AppError, AppResult};

const WAKER: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

pub(crate) enum Command<M> {
    Acceptor(TcpListener),
    Bound(UdpSocket),
    Register {
        token: Token,
        session: Arc<Session<M>>,
        interest: Interest,
    },
    Flush(Token),
    Release {
        token: Token,
        channel: Option<Channel>,
    },
}

/// The thread-safe side of an event processor.
///
/// Only the processor thread touches the multiplexer. Everyone else queues a
/// command here and wakes it up.
pub(crate) struct ProcessorHandle<M> {
    name: String,
    commands: Mutex<VecDeque<Command<M>>>,
    closing: Mutex<VecDeque<Arc<Session<M>>>>,
    waker: Waker,
    running: AtomicBool,
    exited: AtomicBool,
    next_token: AtomicUsize,
    thread_id: OnceCell<ThreadId>,
}

impl<M: Send + 'static> ProcessorHandle<M> {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn allocate_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn on_processor_thread(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }

    /// Queues `command`, handing it back when the processor has already exited.
    fn push(&self, command: Command<M>) -> Option<Command<M>> {
        {
            let mut commands = self.commands.lock();
            if self.exited.load(Ordering::Acquire) {
                return Some(command);
            }
            commands.push_back(command);
        }
        // the loop drains again after dispatching, no wakeup needed from inside it
        if !self.on_processor_thread() {
            self.wake();
        }
        None
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            error!("failed to wake event processor {}: {}", self.name, e);
        }
    }

    pub(crate) fn register_session(
        self: &Arc<Self>,
        session: &Arc<Session<M>>,
        interest: Interest,
    ) {
        let token = self.allocate_token();
        session.attach(token, self.clone());
        let command = Command::Register {
            token,
            session: session.clone(),
            interest,
        };
        if self.push(command).is_some() {
            warn!(
                "event processor {} is gone, closing session {}",
                self.name,
                session.id()
            );
            session.close_now();
        }
    }

    pub(crate) fn register_acceptor(&self, listener: TcpListener) -> AppResult<()> {
        match self.push(Command::Acceptor(listener)) {
            None => Ok(()),
            Some(_) => Err(AppError::IllegalStateError(format!(
                "event processor {} is not running",
                self.name
            ))),
        }
    }

    pub(crate) fn register_bound(&self, socket: UdpSocket) -> AppResult<()> {
        match self.push(Command::Bound(socket)) {
            None => Ok(()),
            Some(_) => Err(AppError::IllegalStateError(format!(
                "event processor {} is not running",
                self.name
            ))),
        }
    }

    pub(crate) fn request_flush(&self, token: Token) {
        self.push(Command::Flush(token));
    }

    /// Queues a graceful close, applied at the end of the current loop iteration.
    pub(crate) fn unregister_session(&self, session: Arc<Session<M>>) {
        {
            let mut closing = self.closing.lock();
            if !self.exited.load(Ordering::Acquire) {
                closing.push_back(session);
                drop(closing);
                if !self.on_processor_thread() {
                    self.wake();
                }
                return;
            }
        }
        session.close_now();
    }

    pub(crate) fn release(&self, token: Token, channel: Option<Channel>) {
        // dropping the returned command closes the channel
        self.push(Command::Release { token, channel });
    }
}

/// Hands accepted connections to the processors of a group in turn.
pub(crate) struct Balancer<M> {
    handles: Vec<Arc<ProcessorHandle<M>>>,
    next: AtomicUsize,
}

impl<M> Balancer<M> {
    pub(crate) fn new(handles: Vec<Arc<ProcessorHandle<M>>>) -> AppResult<Balancer<M>> {
        if handles.is_empty() {
            return Err(AppError::InvalidValue(
                "an event group needs at least one processor".to_string(),
            ));
        }
        Ok(Balancer {
            handles,
            next: AtomicUsize::new(0),
        })
    }

    fn next(&self) -> &Arc<ProcessorHandle<M>> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        &self.handles[index]
    }
}

/// One readiness multiplexer and the thread that runs it.
pub struct EventProcessor<M> {
    handle: Arc<ProcessorHandle<M>>,
    poll: Mutex<Option<Poll>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<M: Send + 'static> EventProcessor<M> {
    pub(crate) fn new(name: String) -> AppResult<EventProcessor<M>> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let handle = Arc::new(ProcessorHandle {
            name,
            commands: Mutex::new(VecDeque::new()),
            closing: Mutex::new(VecDeque::new()),
            waker,
            running: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            next_token: AtomicUsize::new(WAKER.0 + 1),
            thread_id: OnceCell::new(),
        });
        Ok(EventProcessor {
            handle,
            poll: Mutex::new(Some(poll)),
            thread: Mutex::new(None),
        })
    }

    pub(crate) fn handle(&self) -> &Arc<ProcessorHandle<M>> {
        &self.handle
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub(crate) fn start(
        &self,
        context: Arc<GroupContext<M>>,
        balancer: Arc<Balancer<M>>,
        select_timeout: Duration,
    ) -> AppResult<()> {
        let Some(poll) = self.poll.lock().take() else {
            return Err(AppError::IllegalStateError(format!(
                "event processor {} was already started",
                self.handle.name
            )));
        };
        let scratch = vec![0u8; context.buffer_size.max(MAX_DATAGRAM_SIZE)];
        let reactor = Reactor {
            handle: self.handle.clone(),
            context,
            balancer,
            poll,
            entries: HashMap::new(),
            writing: HashSet::new(),
            scratch,
            select_timeout,
        };
        self.handle.running.store(true, Ordering::Release);
        let spawned = thread::Builder::new()
            .name(self.handle.name.clone())
            .spawn(move || reactor.run());
        match spawned {
            Ok(join_handle) => {
                *self.thread.lock() = Some(join_handle);
                Ok(())
            }
            Err(e) => {
                self.handle.running.store(false, Ordering::Release);
                self.handle.exited.store(true, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Stops the loop and joins its thread; the multiplexer is released on the way out.
    pub fn interrupt(&self) {
        self.handle.running.store(false, Ordering::Release);
        self.handle.wake();
        let Some(join_handle) = self.thread.lock().take() else {
            return;
        };
        if join_handle.thread().id() == thread::current().id() {
            return;
        }
        if join_handle.join().is_err() {
            error!("event processor {} thread panicked", self.handle.name);
        }
    }

    pub fn close(&self) {
        self.interrupt();
    }
}

impl<M> Drop for EventProcessor<M> {
    fn drop(&mut self) {
        self.handle.running.store(false, Ordering::Release);
        if let Err(e) = self.handle.waker.wake() {
            trace!("wake on drop failed: {}", e);
        }
    }
}

struct BoundSocket {
    socket: UdpSocket,
    peers: HashMap<SocketAddr, Token>,
    pending: HashSet<Token>,
    writable: bool,
}

enum Entry<M> {
    Acceptor(TcpListener),
    Bound(BoundSocket),
    Session(Arc<Session<M>>),
}

/// State owned by the processor thread.
struct Reactor<M> {
    handle: Arc<ProcessorHandle<M>>,
    context: Arc<GroupContext<M>>,
    balancer: Arc<Balancer<M>>,
    poll: Poll,
    entries: HashMap<Token, Entry<M>>,
    /// stream sessions currently registered for write readiness
    writing: HashSet<Token>,
    scratch: Vec<u8>,
    select_timeout: Duration,
}

impl<M: Send + 'static> Reactor<M> {
    fn run(mut self) {
        if self.handle.thread_id.set(thread::current().id()).is_err() {
            warn!("event processor {} thread id already set", self.handle.name);
        }
        info!("event processor {} started", self.handle.name);
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        while self.handle.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, Some(self.select_timeout)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(
                    "event processor {} poll failed, loop terminates: {}",
                    self.handle.name, e
                );
                self.handle.running.store(false, Ordering::Release);
                break;
            }
            self.apply_commands();
            for event in events.iter() {
                self.dispatch(event);
            }
            self.apply_commands();
            self.drain_closing();
            self.apply_commands();
        }
        self.shutdown();
        info!("event processor {} stopped", self.handle.name);
    }

    fn apply_commands(&mut self) {
        loop {
            let next = self.handle.commands.lock().pop_front();
            let Some(command) = next else {
                return;
            };
            self.apply(command);
        }
    }

    fn apply(&mut self, command: Command<M>) {
        match command {
            Command::Acceptor(mut listener) => {
                let token = self.handle.allocate_token();
                match self
                    .poll
                    .registry()
                    .register(&mut listener, token, Interest::READABLE)
                {
                    Ok(()) => {
                        self.entries.insert(token, Entry::Acceptor(listener));
                    }
                    Err(e) => {
                        error!("register acceptor on {} failed: {}", self.handle.name, e);
                        self.report(e.into());
                    }
                }
            }
            Command::Bound(mut socket) => {
                let token = self.handle.allocate_token();
                match self
                    .poll
                    .registry()
                    .register(&mut socket, token, Interest::READABLE)
                {
                    Ok(()) => {
                        let bound = BoundSocket {
                            socket,
                            peers: HashMap::new(),
                            pending: HashSet::new(),
                            writable: false,
                        };
                        self.entries.insert(token, Entry::Bound(bound));
                    }
                    Err(e) => {
                        error!("register datagram socket on {} failed: {}", self.handle.name, e);
                        self.report(e.into());
                    }
                }
            }
            Command::Register {
                token,
                session,
                interest,
            } => self.register_session(token, session, interest),
            Command::Flush(token) => {
                let Some(Entry::Session(session)) = self.entries.get(&token) else {
                    return;
                };
                let session = session.clone();
                session.clear_flush_request();
                if let Err(e) = self.flush_session(&session, token) {
                    session.fail(e);
                }
            }
            Command::Release { token, channel } => self.release(token, channel),
        }
    }

    fn register_session(&mut self, token: Token, session: Arc<Session<M>>, interest: Interest) {
        if session.is_closed() {
            return;
        }
        if let Err(e) = session.register_channel(self.poll.registry(), token, interest, false) {
            session.fail(e.into());
            return;
        }
        self.entries.insert(token, Entry::Session(session.clone()));
        if interest.is_writable() {
            self.writing.insert(token);
        }
        trace!(
            "session {} registered on {} as {:?}",
            session.id(),
            self.handle.name,
            token
        );

        let listener = &self.context.listener;
        if session.origin() == Origin::Accepted {
            session.mark_connected();
        }
        if let Err(e) = listener.on_session_registered(&session) {
            session.fail(e);
            return;
        }
        if session.origin() == Origin::Datagram {
            session.mark_connected();
            if let Err(e) = listener.on_session_connected(&session) {
                session.fail(e);
            }
        }
    }

    fn dispatch(&mut self, event: &Event) {
        let token = event.token();
        if token == WAKER {
            return;
        }
        let session = match self.entries.get(&token) {
            Some(Entry::Session(session)) => session.clone(),
            Some(Entry::Acceptor(_)) => {
                self.accept(token);
                return;
            }
            Some(Entry::Bound(_)) => {
                if event.is_readable() {
                    self.receive_datagrams(token);
                }
                if event.is_writable() {
                    self.flush_peers(token);
                }
                return;
            }
            None => return,
        };
        session.touch();
        if let Err(e) = self.on_session_event(&session, token, event) {
            session.fail(e);
        }
    }

    fn on_session_event(
        &mut self,
        session: &Arc<Session<M>>,
        token: Token,
        event: &Event,
    ) -> AppResult<()> {
        if session.origin() == Origin::Connector && !session.is_connected() {
            if !session.finish_connect()? {
                return Ok(());
            }
            debug!(
                "session {} connected to {:?}",
                session.id(),
                session.remote_addr()
            );
            session.mark_connected();
            if let Err(e) = self.context.listener.on_session_connected(session) {
                session.fail(e);
                return Ok(());
            }
            return self.flush_session(session, token);
        }
        if event.is_readable() || event.is_read_closed() {
            session.read(&mut self.scratch)?;
        }
        if event.is_writable() {
            self.flush_session(session, token)?;
        }
        Ok(())
    }

    fn flush_session(&mut self, session: &Arc<Session<M>>, token: Token) -> AppResult<()> {
        if session.origin() == Origin::Peer {
            return self.flush_peer(session, token);
        }
        if session.origin() == Origin::Connector && !session.is_connected() {
            return Ok(());
        }
        let drained = session.flush(None)?;
        let registered_for_write = self.writing.contains(&token);
        if drained == registered_for_write {
            let interest = if drained {
                self.writing.remove(&token);
                Interest::READABLE
            } else {
                self.writing.insert(token);
                Interest::READABLE | Interest::WRITABLE
            };
            session.register_channel(self.poll.registry(), token, interest, true)?;
        }
        Ok(())
    }

    fn flush_peer(&mut self, session: &Arc<Session<M>>, token: Token) -> AppResult<()> {
        let Some(bound_token) = session.bound_token() else {
            return Ok(());
        };
        let Some(Entry::Bound(bound)) = self.entries.get_mut(&bound_token) else {
            return Ok(());
        };
        if session.flush(Some(&bound.socket))? {
            bound.pending.remove(&token);
            return Ok(());
        }
        bound.pending.insert(token);
        if !bound.writable {
            self.poll.registry().reregister(
                &mut bound.socket,
                bound_token,
                Interest::READABLE | Interest::WRITABLE,
            )?;
            bound.writable = true;
        }
        Ok(())
    }

    fn flush_peers(&mut self, bound_token: Token) {
        let pending: Vec<Token> = match self.entries.get_mut(&bound_token) {
            Some(Entry::Bound(bound)) => bound.pending.drain().collect(),
            _ => return,
        };
        for token in pending {
            let Some(Entry::Session(session)) = self.entries.get(&token) else {
                continue;
            };
            let session = session.clone();
            if let Err(e) = self.flush_peer(&session, token) {
                session.fail(e);
            }
        }
        if let Some(Entry::Bound(bound)) = self.entries.get_mut(&bound_token) {
            if bound.pending.is_empty() && bound.writable {
                match self.poll.registry().reregister(
                    &mut bound.socket,
                    bound_token,
                    Interest::READABLE,
                ) {
                    Ok(()) => bound.writable = false,
                    Err(e) => warn!("restore read interest on datagram socket failed: {}", e),
                }
            }
        }
    }

    fn accept(&mut self, token: Token) {
        loop {
            let accepted = match self.entries.get(&token) {
                Some(Entry::Acceptor(listener)) => listener.accept(),
                _ => return,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let session = Session::new(
                        self.context.clone(),
                        Channel::Stream(stream),
                        Origin::Accepted,
                        Some(addr),
                    );
                    debug!("accepted session {} from {}", session.id(), addr);
                    if let Err(e) = self.context.listener.on_session_accepted(&session) {
                        warn!("accept callback for {} failed: {}", addr, e);
                        session.close_now();
                        self.report(e);
                        continue;
                    }
                    self.balancer
                        .next()
                        .register_session(&session, Interest::READABLE);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept on {} failed: {}", self.handle.name, e);
                    self.report(e.into());
                    return;
                }
            }
        }
    }

    fn receive_datagrams(&mut self, bound_token: Token) {
        let mut datagrams = Vec::new();
        if let Some(Entry::Bound(bound)) = self.entries.get(&bound_token) {
            loop {
                match bound.socket.recv_from(&mut self.scratch) {
                    Ok((n, addr)) => datagrams.push((addr, self.scratch[..n].to_vec())),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("receive on datagram socket failed: {}", e);
                        self.report(e.into());
                        break;
                    }
                }
            }
        }
        for (addr, datagram) in datagrams {
            let peer = self.peer_session(bound_token, addr);
            peer.touch();
            if let Err(e) = peer.receive_datagram(&datagram) {
                peer.fail(e);
            }
        }
    }

    /// Finds the session of a datagram source, creating and registering it on first contact.
    fn peer_session(&mut self, bound_token: Token, addr: SocketAddr) -> Arc<Session<M>> {
        if let Some(Entry::Bound(bound)) = self.entries.get(&bound_token) {
            if let Some(token) = bound.peers.get(&addr) {
                if let Some(Entry::Session(session)) = self.entries.get(token) {
                    return session.clone();
                }
            }
        }
        let session = Session::new(
            self.context.clone(),
            Channel::Peer {
                bound: bound_token,
                addr,
            },
            Origin::Peer,
            Some(addr),
        );
        let token = self.handle.allocate_token();
        session.attach(token, self.handle.clone());
        self.entries.insert(token, Entry::Session(session.clone()));
        if let Some(Entry::Bound(bound)) = self.entries.get_mut(&bound_token) {
            bound.peers.insert(addr, token);
        }
        debug!("new datagram peer {} as session {}", addr, session.id());
        session.mark_connected();
        if let Err(e) = self.context.listener.on_session_registered(&session) {
            session.fail(e);
        }
        session
    }

    fn release(&mut self, token: Token, channel: Option<Channel>) {
        self.writing.remove(&token);
        self.entries.remove(&token);
        let Some(mut channel) = channel else {
            return;
        };
        if let Channel::Peer { bound, addr } = &channel {
            if let Some(Entry::Bound(socket)) = self.entries.get_mut(bound) {
                socket.peers.remove(addr);
                socket.pending.remove(&token);
            }
        }
        channel.deregister(self.poll.registry());
        trace!("released {:?} on {}", token, self.handle.name);
    }

    fn drain_closing(&mut self) {
        loop {
            let next = self.handle.closing.lock().pop_front();
            match next {
                Some(session) => session.close_now(),
                None => return,
            }
        }
    }

    /// Failure with no session attached, reported off the processor thread.
    fn report(&self, error: AppError) {
        let listener = self.context.listener.clone();
        self.context.executor.submit(move || {
            if let Err(e) = listener.on_exception_caught(&error, None) {
                error!("exception callback failed: {}", e);
            }
        });
    }

    /// Closes everything still registered, then stops accepting commands.
    fn shutdown(&mut self) {
        let sessions: Vec<Arc<Session<M>>> = self
            .entries
            .values()
            .filter_map(|entry| match entry {
                Entry::Session(session) => Some(session.clone()),
                _ => None,
            })
            .collect();
        for session in sessions {
            session.close_now();
        }
        loop {
            self.drain_closing();
            let batch = {
                let mut commands = self.handle.commands.lock();
                if commands.is_empty() {
                    self.handle.exited.store(true, Ordering::Release);
                    break;
                }
                std::mem::take(&mut *commands)
            };
            for command in batch {
                match command {
                    Command::Register { session, .. } => session.close_now(),
                    Command::Release { token, channel } => self.release(token, channel),
                    Command::Acceptor(_) | Command::Bound(_) | Command::Flush(_) => {}
                }
            }
        }
        // a close may have slipped in before exit was flagged
        self.drain_closing();
        self.entries.clear();
        self.writing.clear();
    }
}
