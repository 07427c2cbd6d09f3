pub use app_error::{AppError, AppResult};
pub use config::{AgentConfig, EventQueueConfig, GeneralConfig, NetworkConfig};
pub use server::Server;
pub use tracing_config::{setup_local_tracing, setup_tracing, LogGuard};

mod app_error;
mod config;
mod server;
mod tracing_config;
