//! A message-driven tcp server skeleton.
//!
//! Every accepted socket gets its own read loop that splits the byte stream into
//! `(msg id, body)` frames. Lifecycle and data events of all connections go
//! through one bounded queue to a single dispatcher, which owns the connection
//! registry and runs the handler registered for each message id. Handlers reply
//! by writing to the connection directly.

pub mod dispatch;
pub mod event;
pub mod handler;
pub mod network;
pub mod service;

pub use handler::{HandlerTable, MsgHandler};
pub use network::{Connection, FrameCodec, RecvTask};
pub use service::{
    setup_local_tracing, setup_tracing, AgentConfig, AppError, AppResult, LogGuard, Server,
};
