use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::Interest;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::executor::Executor;
use super::processor::{Balancer, EventProcessor};
use super::session::{Channel, GroupContext, Origin};
use super::{Session, SharedCodec, SharedListener, Status};
use crate::service::{GroupSizing, Transport};
use crate::{AppError, AppResult};

const EXECUTOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

enum Endpoint {
    Acceptor(TcpListener),
    Bound(UdpSocket),
}

/// Codec, listener, executor pool and processors of one client or server endpoint.
pub struct EventGroup<M> {
    context: Arc<GroupContext<M>>,
    processors: Vec<EventProcessor<M>>,
    balancer: Arc<Balancer<M>>,
    endpoint: Mutex<Option<Endpoint>>,
    session: Option<Arc<Session<M>>>,
    local_addr: SocketAddr,
    select_timeout: Duration,
    connection_timeout: Duration,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl<M: Send + 'static> EventGroup<M> {
    /// Binds `addr` and prepares `selector_count` processors for a server.
    pub fn server(
        sizing: &GroupSizing,
        transport: Transport,
        addr: SocketAddr,
        codec: SharedCodec<M>,
        listener: SharedListener<M>,
    ) -> AppResult<EventGroup<M>> {
        let (endpoint, local_addr) = match transport {
            Transport::Tcp => {
                let acceptor = TcpListener::bind(addr)?;
                let local_addr = acceptor.local_addr()?;
                (Endpoint::Acceptor(acceptor), local_addr)
            }
            Transport::Udp => {
                let socket = UdpSocket::bind(addr)?;
                let local_addr = socket.local_addr()?;
                (Endpoint::Bound(socket), local_addr)
            }
        };
        let processor_count = match transport {
            Transport::Tcp => sizing.selector_count.max(1),
            Transport::Udp => 1,
        };
        EventGroup::build(
            sizing,
            codec,
            listener,
            processor_count,
            Some(endpoint),
            local_addr,
        )
    }

    /// Opens the outbound socket of a client; the connect completes once started.
    pub fn client(
        sizing: &GroupSizing,
        transport: Transport,
        addr: SocketAddr,
        codec: SharedCodec<M>,
        listener: SharedListener<M>,
    ) -> AppResult<EventGroup<M>> {
        let (channel, origin, local_addr) = match transport {
            Transport::Tcp => {
                let stream = TcpStream::connect(addr)?;
                let local_addr = stream.local_addr()?;
                (Channel::Stream(stream), Origin::Connector, local_addr)
            }
            Transport::Udp => {
                let unspecified: SocketAddr = if addr.is_ipv4() {
                    "0.0.0.0:0".parse()?
                } else {
                    "[::]:0".parse()?
                };
                let socket = UdpSocket::bind(unspecified)?;
                socket.connect(addr)?;
                let local_addr = socket.local_addr()?;
                (Channel::Datagram(socket), Origin::Datagram, local_addr)
            }
        };
        let mut group = EventGroup::build(sizing, codec, listener, 1, None, local_addr)?;
        group.session = Some(Session::new(
            group.context.clone(),
            channel,
            origin,
            Some(addr),
        ));
        Ok(group)
    }

    fn build(
        sizing: &GroupSizing,
        codec: SharedCodec<M>,
        listener: SharedListener<M>,
        processor_count: usize,
        endpoint: Option<Endpoint>,
        local_addr: SocketAddr,
    ) -> AppResult<EventGroup<M>> {
        let executor = Arc::new(Executor::new(sizing)?);
        let context = Arc::new(GroupContext {
            name: sizing.name.clone(),
            codec,
            listener,
            executor,
            buffer_size: sizing.buffer_size,
            max_write_queue: sizing.max_write_queue,
        });
        let processors = (0..processor_count)
            .map(|i| EventProcessor::new(format!("{}-processor-{}", sizing.name, i)))
            .collect::<AppResult<Vec<_>>>()?;
        let balancer = Arc::new(Balancer::new(
            processors.iter().map(|p| p.handle().clone()).collect(),
        )?);
        Ok(EventGroup {
            context,
            processors,
            balancer,
            endpoint: Mutex::new(endpoint),
            session: None,
            local_addr,
            select_timeout: sizing.select_timeout,
            connection_timeout: sizing.connection_timeout,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The outbound session of a client group.
    pub fn session(&self) -> Option<&Arc<Session<M>>> {
        self.session.as_ref()
    }

    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire)
    }

    /// Starts the processors and registers the endpoint.
    ///
    /// A client group additionally waits up to its connection timeout for the connect
    /// to finish and stops itself when it does not.
    pub fn start(&self) -> AppResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(AppError::IllegalStateError(format!(
                "event group {} was already started",
                self.context.name
            )));
        }
        for processor in &self.processors {
            processor.start(
                self.context.clone(),
                self.balancer.clone(),
                self.select_timeout,
            )?;
        }
        let first = self.processors[0].handle();
        match self.endpoint.lock().take() {
            Some(Endpoint::Acceptor(acceptor)) => first.register_acceptor(acceptor)?,
            Some(Endpoint::Bound(socket)) => first.register_bound(socket)?,
            None => {}
        }

        let Some(session) = &self.session else {
            debug!("event group {} started", self.context.name);
            return Ok(());
        };
        let interest = match session.origin() {
            Origin::Connector => Interest::READABLE | Interest::WRITABLE,
            _ => Interest::READABLE,
        };
        first.register_session(session, interest);
        if !self.connect_sync(self.connection_timeout) {
            let remote = session
                .remote_addr()
                .map_or_else(|| "unknown".to_string(), |addr| addr.to_string());
            let failed = session.status() != Status::New;
            self.stop();
            return Err(if failed {
                AppError::DetailedIoError(format!("connect to {} failed", remote))
            } else {
                AppError::ConnectTimeout(remote)
            });
        }
        info!(
            "event group {} connected {} -> {:?}",
            self.context.name,
            self.local_addr,
            session.remote_addr()
        );
        Ok(())
    }

    /// Blocks until the client session is connected or `timeout` elapses.
    pub fn connect_sync(&self, timeout: Duration) -> bool {
        match &self.session {
            Some(session) => session.connect_sync(timeout),
            None => false,
        }
    }

    /// Interrupts the processors, closes the client session and drains the executor.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for processor in &self.processors {
            processor.interrupt();
        }
        if let Some(session) = &self.session {
            session.close_now();
        }
        // a group that never started still owns its unregistered endpoint
        if self.endpoint.lock().take().is_some() {
            warn!("event group {} stopped before it was started", self.context.name);
        }
        self.context.executor.shutdown(EXECUTOR_SHUTDOWN_TIMEOUT);
        debug!("event group {} stopped", self.context.name);
    }
}
