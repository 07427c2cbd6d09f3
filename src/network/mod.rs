//! Network Module Implementation
//!
//! Socket level plumbing of the agent: the wire frame codec and the per-socket
//! connection.
//!
//! # Components
//!
//! - `FrameCodec`: splits a byte stream into `(msg id, body)` frames and encodes
//!   outbound frames
//! - `Connection`: shared send handle of an accepted socket
//! - `ConnectionReader`: read loop turning frames into events for the dispatcher

pub use connection::{Connection, ConnectionReader, UNREGISTERED};
pub use frame::{FrameCodec, RecvTask, HEADER_SIZE, LENGTH_FIELD_SIZE, MSG_ID_FIELD_SIZE};

#[cfg(test)]
pub(crate) use connection::tests::connected_pair;

mod connection;
mod frame;
