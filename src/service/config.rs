use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

pub const DEFAULT_NAME: &str = "default";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8281;
pub const DEFAULT_CHARSET: &str = "UTF-8";
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_THREAD_MAX_POOL_SIZE: usize = 200;
pub const DEFAULT_THREAD_QUEUE_SIZE: usize = 1024;
pub const DEFAULT_SELECT_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RECONNECTION_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 60_000;

/// Socket kind an endpoint is built on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    /// A server keeps one session per source address until that session is
    /// closed; nothing expires silent peers on its own. Run the server under a
    /// `SessionManager` with an idle time, or close peers from the listener, to
    /// bound the peer table.
    Udp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    pub charset: String,
    pub buffer_size: usize,
    pub executor_count: usize,
    /// idle time of executor threads before they are reclaimed, 0 keeps the pool default
    pub keep_alive_time_ms: u64,
    pub thread_max_pool_size: usize,
    pub thread_queue_size: usize,
    pub selector_count: usize,
    pub select_timeout_ms: u64,
    /// frames a session may hold in its outbound queue, unbounded when absent
    pub max_write_queue: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            name: DEFAULT_NAME.to_string(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            transport: Transport::Tcp,
            charset: DEFAULT_CHARSET.to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            executor_count: num_cpus::get(),
            keep_alive_time_ms: 0,
            thread_max_pool_size: DEFAULT_THREAD_MAX_POOL_SIZE,
            thread_queue_size: DEFAULT_THREAD_QUEUE_SIZE,
            selector_count: 1,
            select_timeout_ms: DEFAULT_SELECT_TIMEOUT_MS,
            max_write_queue: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub name: String,
    pub remote_host: String,
    pub port: u16,
    pub transport: Transport,
    pub charset: String,
    pub buffer_size: usize,
    pub executor_count: usize,
    pub connection_timeout_ms: u64,
    pub reconnection_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub select_timeout_ms: u64,
    pub max_write_queue: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            name: DEFAULT_NAME.to_string(),
            remote_host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            transport: Transport::Tcp,
            charset: DEFAULT_CHARSET.to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            executor_count: num_cpus::get(),
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            reconnection_interval_ms: DEFAULT_RECONNECTION_INTERVAL_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            select_timeout_ms: DEFAULT_SELECT_TIMEOUT_MS,
            max_write_queue: None,
        }
    }
}

/// Sizing an event group derives from either endpoint config.
///
/// Zero values fall back to the defaults, the same way an unset key would.
#[derive(Debug, Clone)]
pub struct GroupSizing {
    pub name: String,
    pub buffer_size: usize,
    pub executor_count: usize,
    pub keep_alive: Option<Duration>,
    pub thread_max_pool_size: usize,
    pub thread_queue_size: usize,
    pub selector_count: usize,
    pub select_timeout: Duration,
    pub connection_timeout: Duration,
    pub max_write_queue: Option<usize>,
}

fn non_zero(value: usize, default: usize) -> usize {
    if value == 0 {
        default
    } else {
        value
    }
}

impl From<&ServerConfig> for GroupSizing {
    fn from(cfg: &ServerConfig) -> Self {
        GroupSizing {
            name: cfg.name.clone(),
            buffer_size: non_zero(cfg.buffer_size, DEFAULT_BUFFER_SIZE),
            executor_count: non_zero(cfg.executor_count, num_cpus::get()),
            keep_alive: (cfg.keep_alive_time_ms > 0)
                .then(|| Duration::from_millis(cfg.keep_alive_time_ms)),
            thread_max_pool_size: non_zero(cfg.thread_max_pool_size, DEFAULT_THREAD_MAX_POOL_SIZE),
            thread_queue_size: non_zero(cfg.thread_queue_size, DEFAULT_THREAD_QUEUE_SIZE),
            selector_count: non_zero(cfg.selector_count, 1),
            select_timeout: Duration::from_millis(
                non_zero(cfg.select_timeout_ms as usize, DEFAULT_SELECT_TIMEOUT_MS as usize) as u64,
            ),
            connection_timeout: Duration::ZERO,
            max_write_queue: cfg.max_write_queue,
        }
    }
}

impl From<&ClientConfig> for GroupSizing {
    fn from(cfg: &ClientConfig) -> Self {
        let executor_count = non_zero(cfg.executor_count, num_cpus::get());
        GroupSizing {
            name: cfg.name.clone(),
            buffer_size: non_zero(cfg.buffer_size, DEFAULT_BUFFER_SIZE),
            executor_count,
            keep_alive: None,
            // a client pool is fixed-size and never rejects work
            thread_max_pool_size: executor_count,
            thread_queue_size: usize::MAX / 2,
            selector_count: 1,
            select_timeout: Duration::from_millis(
                non_zero(cfg.select_timeout_ms as usize, DEFAULT_SELECT_TIMEOUT_MS as usize) as u64,
            ),
            connection_timeout: Duration::from_millis(non_zero(
                cfg.connection_timeout_ms as usize,
                DEFAULT_CONNECTION_TIMEOUT_MS as usize,
            ) as u64),
            max_write_queue: cfg.max_write_queue,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> AppResult<SocketAddr> {
        resolve(&self.host, self.port)
    }
}

impl ClientConfig {
    pub fn socket_addr(&self) -> AppResult<SocketAddr> {
        resolve(&self.remote_host, self.port)
    }

    pub fn reconnection_interval(&self) -> Duration {
        Duration::from_millis(non_zero(
            self.reconnection_interval_ms as usize,
            DEFAULT_RECONNECTION_INTERVAL_MS as usize,
        ) as u64)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(non_zero(
            self.heartbeat_interval_ms as usize,
            DEFAULT_HEARTBEAT_INTERVAL_MS as usize,
        ) as u64)
    }
}

fn resolve(host: &str, port: u16) -> AppResult<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| AppError::InvalidValue(format!("unresolvable address {}:{}", host, port)))
}

/// Endpoint configuration for one process, server and client side.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl NetConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<NetConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let net_config: NetConfig = config.try_deserialize()?;

        Ok(net_config)
    }
}
