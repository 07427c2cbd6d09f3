use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::ConnectionRegistry;
use crate::event::{ConnEvent, EventReceiver};
use crate::handler::HandlerTable;
use crate::network::{Connection, RecvTask};

/// Requests the server sends to the dispatcher. The registry never leaves the
/// dispatcher, so anything that needs it goes through here.
#[derive(Debug)]
pub enum DispatcherCommand {
    /// close every registered connection, clear the registry and close any
    /// connection announced afterwards
    CloseAll(oneshot::Sender<()>),
    /// ids of the registered connections
    Snapshot(oneshot::Sender<Vec<u64>>),
}

/// The single consumer of the event queue.
///
/// Events are handled one at a time in the order they were queued, handlers
/// included, so the registry and the handler table are only ever touched from
/// this task.
pub struct Dispatcher {
    server_id: i32,
    registry: ConnectionRegistry,
    handlers: HandlerTable,
    events: EventReceiver,
    commands: mpsc::Receiver<DispatcherCommand>,
    closing: bool,
}

impl Dispatcher {
    pub fn new(
        server_id: i32,
        handlers: HandlerTable,
        events: EventReceiver,
        commands: mpsc::Receiver<DispatcherCommand>,
    ) -> Self {
        Dispatcher {
            server_id,
            registry: ConnectionRegistry::new(),
            handlers,
            events,
            commands,
            closing: false,
        }
    }

    /// Runs until the event queue is closed and drained.
    #[tracing::instrument(name = "dispatcher", skip(self), fields(server_id = self.server_id))]
    pub async fn run(mut self) {
        debug!("dispatcher started with {:?}", self.handlers);
        loop {
            tokio::select! {
                biased;
                Some(command) = self.commands.recv() => {
                    self.on_command(command).await;
                }
                maybe_event = self.events.pop() => {
                    match maybe_event {
                        Some(event) => self.dispatch(event).await,
                        None => break,
                    }
                }
            }
        }
        debug!(
            "dispatcher exited, {} connections still registered",
            self.registry.len()
        );
    }

    pub async fn dispatch(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Connected(conn) => self.on_connected(conn).await,
            ConnEvent::Data(conn, task) => self.on_data(conn, task).await,
            ConnEvent::Disconnected(conn) => self.on_disconnected(conn),
        }
    }

    async fn on_connected(&mut self, conn: Arc<Connection>) {
        if self.closing {
            debug!(
                "connection from {} arrived during shutdown, closing it",
                conn.peer_addr()
            );
            conn.shutdown().await;
            return;
        }
        let id = self.registry.register(conn.clone());
        debug!("connection {} registered for {}", id, conn.peer_addr());
    }

    fn on_disconnected(&mut self, conn: Arc<Connection>) {
        if self.registry.remove(&conn).is_some() {
            debug!("connection {} unregistered", conn.id());
        }
    }

    async fn on_data(&mut self, conn: Arc<Connection>, task: RecvTask) {
        trace!(
            "connection id: {}, recv msg id: {}, data len: {}",
            conn.id(),
            task.msg_id,
            task.len
        );
        let handler = match self.handlers.get(task.msg_id) {
            Some(handler) => handler.clone(),
            None => {
                trace!("no handler for msg id {}, ignored", task.msg_id);
                return;
            }
        };
        if let Err(e) = handler
            .handle(&conn, task.msg_id, task.body, task.len)
            .await
        {
            warn!(
                "handler for msg id {} failed on connection {}: {}",
                task.msg_id,
                conn.id(),
                e
            );
        }
    }

    async fn on_command(&mut self, command: DispatcherCommand) {
        match command {
            DispatcherCommand::CloseAll(reply) => {
                self.closing = true;
                let conns = self.registry.drain();
                info!("shutdown {} connections...", conns.len());
                for conn in conns {
                    conn.shutdown().await;
                }
                let _ = reply.send(());
            }
            DispatcherCommand::Snapshot(reply) => {
                let _ = reply.send(self.registry.ids());
            }
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }
}
