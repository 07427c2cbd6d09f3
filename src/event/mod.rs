//! Lifecycle and data events flowing from connections to the dispatcher.
//!
//! Every connection read loop is a producer, the dispatcher is the only consumer.

pub use queue::{event_queue, EventQueue, EventReceiver};

mod queue;

use std::fmt;
use std::sync::Arc;

use crate::network::{Connection, RecvTask};

#[derive(Debug)]
pub enum ConnEvent {
    /// the read loop has started, the connection has no id yet
    Connected(Arc<Connection>),
    Data(Arc<Connection>, RecvTask),
    Disconnected(Arc<Connection>),
}

impl ConnEvent {
    pub fn connection(&self) -> &Arc<Connection> {
        match self {
            ConnEvent::Connected(conn) => conn,
            ConnEvent::Data(conn, _) => conn,
            ConnEvent::Disconnected(conn) => conn,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConnEvent::Connected(_) => "connected",
            ConnEvent::Data(..) => "data",
            ConnEvent::Disconnected(_) => "disconnected",
        }
    }
}

impl fmt::Display for ConnEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnEvent::Data(conn, task) => write!(
                f,
                "data(peer: {}, msg_id: {}, len: {})",
                conn.peer_addr(),
                task.msg_id,
                task.len
            ),
            other => write!(f, "{}(peer: {})", other.kind(), other.connection().peer_addr()),
        }
    }
}
