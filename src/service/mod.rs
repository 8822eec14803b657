pub use app_error::{AppError, AppResult};
pub use client::{Client, WeakClient};
pub use config::{ClientConfig, GroupSizing, NetConfig, ServerConfig, Transport};
pub use server::Server;
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app_error;
mod client;
mod config;
mod server;
mod shutdown;
mod tracing_config;
