use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{ClientConfig, GroupSizing};
use crate::liveness::ClientService;
use crate::network::{Codec, EventGroup, Listener, Session, SharedCodec, SharedListener, Status};
use crate::{AppError, AppResult};

struct ClientInner<M: Send + 'static> {
    config: ClientConfig,
    codec: SharedCodec<M>,
    listener: SharedListener<M>,
    group: Mutex<Option<EventGroup<M>>>,
    // serializes connect, reconnect and close
    lifecycle: Mutex<()>,
    closing: AtomicBool,
    services: Mutex<Vec<Arc<dyn ClientService<M>>>>,
}

/// The outbound endpoint; cheap to clone, all clones drive the same connection.
pub struct Client<M: Send + 'static> {
    inner: Arc<ClientInner<M>>,
}

impl<M: Send + 'static> Clone for Client<M> {
    fn clone(&self) -> Self {
        Client {
            inner: self.inner.clone(),
        }
    }
}

/// A client reference that does not keep the client alive.
pub struct WeakClient<M: Send + 'static> {
    inner: Weak<ClientInner<M>>,
}

impl<M: Send + 'static> Clone for WeakClient<M> {
    fn clone(&self) -> Self {
        WeakClient {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Send + 'static> WeakClient<M> {
    pub fn upgrade(&self) -> Option<Client<M>> {
        self.inner.upgrade().map(|inner| Client { inner })
    }
}

impl<M: Send + 'static> Client<M> {
    pub fn new<C, L>(config: ClientConfig, mut codec: C, listener: L) -> AppResult<Client<M>>
    where
        C: Codec<Message = M>,
        L: Listener<M>,
    {
        codec.initialize(&config.charset)?;
        Ok(Client {
            inner: Arc::new(ClientInner {
                config,
                codec: Arc::new(codec),
                listener: Arc::new(listener),
                group: Mutex::new(None),
                lifecycle: Mutex::new(()),
                closing: AtomicBool::new(false),
                services: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakClient<M> {
        WeakClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Attaches a liveness service; it starts with the next [`Client::connect`].
    pub fn add_service<S: ClientService<M>>(&self, service: S) -> AppResult<()> {
        service.initialize(self)?;
        self.inner.services.lock().push(Arc::new(service));
        Ok(())
    }

    /// Connects unless a connection is already up or still being set up, then starts
    /// the attached services. Services start even when the connect fails, so a
    /// reconnect service can take over.
    pub fn connect(&self) -> AppResult<()> {
        let result = {
            let _lifecycle = self.inner.lifecycle.lock();
            self.inner.closing.store(false, Ordering::Release);
            if self.session_status().is_some_and(|s| matches!(s, Status::New | Status::Connected)) {
                return Ok(());
            }
            self.rebuild()
        };
        self.start_services();
        result
    }

    /// Tears down a dead connection and builds a new one; never runs while closing.
    pub fn reconnect(&self) -> AppResult<()> {
        if self.is_closing() {
            debug!("client {} is closing, reconnect skipped", self.inner.config.name);
            return Ok(());
        }
        let _lifecycle = self.inner.lifecycle.lock();
        if self.is_closing() || self.is_connected() {
            return Ok(());
        }
        info!(
            "client {} reconnecting to {}:{}",
            self.inner.config.name, self.inner.config.remote_host, self.inner.config.port
        );
        self.rebuild()
    }

    fn rebuild(&self) -> AppResult<()> {
        let old = self.inner.group.lock().take();
        if let Some(old) = old {
            old.stop();
        }
        let config = &self.inner.config;
        let group = EventGroup::client(
            &GroupSizing::from(config),
            config.transport,
            config.socket_addr()?,
            self.inner.codec.clone(),
            self.inner.listener.clone(),
        )?;
        group.start()?;
        info!(
            "client {} connected to {}:{}",
            config.name, config.remote_host, config.port
        );
        *self.inner.group.lock() = Some(group);
        Ok(())
    }

    fn start_services(&self) {
        let services = self.inner.services.lock().clone();
        for service in services {
            if service.is_started() {
                continue;
            }
            if let Err(e) = service.start() {
                warn!("client service {} failed to start: {}", service.name(), e);
            }
        }
    }

    fn session_status(&self) -> Option<Status> {
        self.session().map(|session| session.status())
    }

    pub fn session(&self) -> Option<Arc<Session<M>>> {
        self.inner
            .group
            .lock()
            .as_ref()
            .and_then(|group| group.session().cloned())
    }

    pub fn is_connected(&self) -> bool {
        self.session_status() == Some(Status::Connected)
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    pub fn send(&self, message: &M) -> AppResult<()> {
        match self.session() {
            Some(session) if session.is_connected() => session.send(message),
            _ => Err(AppError::IllegalStateError(format!(
                "client {} is not connected",
                self.inner.config.name
            ))),
        }
    }

    /// Stops the services, then the event group and its session.
    pub fn close(&self) {
        self.inner.closing.store(true, Ordering::Release);
        let services = self.inner.services.lock().clone();
        for service in services {
            service.close();
        }
        let _lifecycle = self.inner.lifecycle.lock();
        let group = self.inner.group.lock().take();
        if let Some(group) = group {
            group.stop();
            info!("client {} closed", self.inner.config.name);
        }
    }
}

impl<M: Send + 'static> Drop for ClientInner<M> {
    fn drop(&mut self) {
        for service in self.services.get_mut().drain(..) {
            service.close();
        }
        if let Some(group) = self.group.get_mut().take() {
            group.stop();
        }
    }
}
