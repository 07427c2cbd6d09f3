//! Message handlers.
//!
//! A handler is bound to one message id. The dispatcher awaits it inline, so
//! handlers run one at a time in event order. A handler that needs to reply calls
//! [`Connection::send`] itself, the reply does not go through the event queue.

pub use echo::{EchoHandler, HelloAck, HelloReq, MSG_ID_HELLO_ACK, MSG_ID_HELLO_REQ};

mod echo;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::network::Connection;
use crate::AppResult;

#[async_trait]
pub trait MsgHandler: Send + Sync {
    /// Handles one inbound frame. `len` is the body length announced by the frame.
    ///
    /// An error is logged by the dispatcher and otherwise ignored: the connection
    /// stays open and the next event is dispatched as usual.
    async fn handle(
        &self,
        conn: &Arc<Connection>,
        msg_id: u16,
        body: Bytes,
        len: usize,
    ) -> AppResult<()>;
}

#[async_trait]
impl<F, Fut> MsgHandler for F
where
    F: Fn(Arc<Connection>, u16, Bytes, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult<()>> + Send + 'static,
{
    async fn handle(
        &self,
        conn: &Arc<Connection>,
        msg_id: u16,
        body: Bytes,
        len: usize,
    ) -> AppResult<()> {
        (self)(conn.clone(), msg_id, body, len).await
    }
}

/// Message id to handler mapping, filled in before the server starts and
/// read only by the dispatcher afterwards.
#[derive(Default, Clone)]
pub struct HandlerTable {
    handlers: HashMap<u16, Arc<dyn MsgHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        HandlerTable::default()
    }

    /// Table with the built-in echo handler registered on [`MSG_ID_HELLO_REQ`].
    pub fn with_default_handlers() -> Self {
        let mut table = HandlerTable::new();
        table.register(MSG_ID_HELLO_REQ, EchoHandler);
        table
    }

    /// Binds `handler` to `msg_id`. Registering the same id again replaces the
    /// previous handler.
    pub fn register<H>(&mut self, msg_id: u16, handler: H) -> &mut Self
    where
        H: MsgHandler + 'static,
    {
        if self.handlers.insert(msg_id, Arc::new(handler)).is_some() {
            debug!("handler for msg id {} replaced", msg_id);
        }
        self
    }

    pub fn get(&self, msg_id: u16) -> Option<&Arc<dyn MsgHandler>> {
        self.handlers.get(&msg_id)
    }

    pub fn contains(&self, msg_id: u16) -> bool {
        self.handlers.contains_key(&msg_id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut msg_ids: Vec<_> = self.handlers.keys().collect();
        msg_ids.sort();
        f.debug_struct("HandlerTable")
            .field("msg_ids", &msg_ids)
            .finish()
    }
}
