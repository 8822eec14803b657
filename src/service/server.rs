use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info};

use super::{GroupSizing, ServerConfig};
use crate::network::{Codec, EventGroup, Listener, SharedCodec, SharedListener};
use crate::AppResult;

/// A listening endpoint; every `start` builds a fresh event group.
pub struct Server<M: Send + 'static> {
    config: ServerConfig,
    codec: SharedCodec<M>,
    listener: SharedListener<M>,
    group: Mutex<Option<EventGroup<M>>>,
}

impl<M: Send + 'static> Server<M> {
    /// The codec is initialized with the configured charset here, once.
    pub fn new<C, L>(config: ServerConfig, mut codec: C, listener: L) -> AppResult<Server<M>>
    where
        C: Codec<Message = M>,
        L: Listener<M>,
    {
        codec.initialize(&config.charset)?;
        Ok(Server {
            config,
            codec: Arc::new(codec),
            listener: Arc::new(listener),
            group: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn start(&self) -> AppResult<()> {
        let mut slot = self.group.lock();
        if slot.is_some() {
            return Ok(());
        }
        let sizing = GroupSizing::from(&self.config);
        let group = EventGroup::server(
            &sizing,
            self.config.transport,
            self.config.socket_addr()?,
            self.codec.clone(),
            self.listener.clone(),
        )?;
        if let Err(e) = group.start() {
            error!("server {} failed to start: {}", self.config.name, e);
            group.stop();
            return Err(e);
        }
        info!(
            "server {} is ready on {} ({:?}, {} processors)",
            self.config.name,
            group.local_addr(),
            self.config.transport,
            group.processor_count()
        );
        *slot = Some(group);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.group.lock().as_ref().is_some_and(|g| g.is_started())
    }

    /// The bound address, which tells the real port when the config asked for port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.group.lock().as_ref().map(|g| g.local_addr())
    }

    pub fn close(&self) {
        let group = self.group.lock().take();
        if let Some(group) = group {
            group.stop();
            info!("server {} closed", self.config.name);
        }
    }
}

impl<M: Send + 'static> Drop for Server<M> {
    fn drop(&mut self) {
        self.close();
    }
}
