// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, info, info_span, warn, Instrument};

use super::AgentConfig;
use crate::dispatch::{Dispatcher, DispatcherCommand};
use crate::event::{event_queue, EventQueue, EventReceiver};
use crate::handler::HandlerTable;
use crate::network::{Connection, FrameCodec};
use crate::{AppError, AppResult};

/// Everything `run` moves into the background tasks.
struct Startup {
    listener: TcpListener,
    handlers: HandlerTable,
    event_receiver: EventReceiver,
    command_rx: mpsc::Receiver<DispatcherCommand>,
}

struct RunningTasks {
    acceptor: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
}

/// Accept loop.
struct Acceptor {
    listener: TcpListener,
    codec: FrameCodec,
    read_buffer_size: usize,
    event_queue: EventQueue,
    /// parent of every connection's close token
    shutdown: CancellationToken,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl Acceptor {
    /// Accepts sockets until shutdown or until `accept` fails. An accept error
    /// ends this loop only, connections already running are not affected.
    async fn run(self) {
        loop {
            let accepted = tokio::select! {
                res = self.listener.accept() => res,
                _ = self.shutdown.cancelled() => {
                    debug!("accept loop received shutdown signal");
                    break;
                }
            };
            let socket = match accepted {
                Ok((socket, _)) => socket,
                Err(e) => {
                    debug!("accept error, accept loop exits: {}", e);
                    break;
                }
            };

            let (connection, reader) = match Connection::new(
                socket,
                self.codec.clone(),
                self.read_buffer_size,
                self.shutdown.child_token(),
            ) {
                Ok(pair) => pair,
                Err(e) => {
                    // the peer is usually already gone
                    debug!("failed to set up accepted socket: {}", e);
                    continue;
                }
            };
            debug!("accept new connection from {}", connection.peer_addr());

            let span = debug_span!("connection", peer = %connection.peer_addr());
            tokio::spawn(
                reader
                    .run(self.event_queue.clone(), self.shutdown_complete_tx.clone())
                    .instrument(span),
            );
        }
        // the listening socket is closed when `self.listener` drops
    }
}

/// The agent's tcp server.
///
/// `bind` opens the listening socket, `run` starts the dispatcher and the accept
/// loop in the background, `shutdown` tears everything down.
pub struct Server {
    config: Arc<AgentConfig>,
    local_addr: SocketAddr,
    event_queue: EventQueue,
    command_tx: mpsc::Sender<DispatcherCommand>,
    shutdown: CancellationToken,
    startup: Mutex<Option<Startup>>,
    running: tokio::sync::Mutex<Option<RunningTasks>>,
}

impl Server {
    /// Binds the listening socket. A bind failure is fatal, there is no retry.
    pub async fn bind(config: Arc<AgentConfig>, handlers: HandlerTable) -> AppResult<Server> {
        config.validate()?;
        let listen_address = config.network.listen_address();

        let listener = match TcpListener::bind(&listen_address).await {
            Ok(listener) => listener,
            Err(err) => {
                let error_msg = format!(
                    "Failed to bind server to address: {} - Error: {}",
                    listen_address, err
                );
                error!("{}", error_msg);
                return Err(AppError::IllegalStateError(error_msg));
            }
        };
        let local_addr = listener.local_addr()?;
        info!(
            "server {} binding to {} for listening",
            config.general.id, local_addr
        );

        let (event_queue, event_receiver) = event_queue(&config.event_queue);
        let (command_tx, command_rx) = mpsc::channel(16);

        Ok(Server {
            config,
            local_addr,
            event_queue,
            command_tx,
            shutdown: CancellationToken::new(),
            startup: Mutex::new(Some(Startup {
                listener,
                handlers,
                event_receiver,
                command_rx,
            })),
            running: tokio::sync::Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts the dispatcher and the accept loop on the current tokio runtime and
    /// returns right away.
    pub async fn run(&self) -> AppResult<()> {
        let mut running = self.running.lock().await;
        let Startup {
            listener,
            handlers,
            event_receiver,
            command_rx,
        } = self.startup.lock().take().ok_or(AppError::IllegalStateError(
            "server is already running or has been shut down".to_string(),
        ))?;
        let server_id = self.config.general.id;

        let dispatcher = tokio::spawn(
            Dispatcher::new(server_id, handlers, event_receiver, command_rx).run(),
        );

        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        let acceptor = Acceptor {
            listener,
            codec: FrameCodec::new(self.config.network.max_package_size),
            read_buffer_size: self.config.network.conn_read_buffer_size,
            event_queue: self.event_queue.clone(),
            shutdown: self.shutdown.clone(),
            shutdown_complete_tx: shutdown_complete_tx.clone(),
        };
        let acceptor = tokio::spawn(
            acceptor
                .run()
                .instrument(info_span!("acceptor", server_id = server_id)),
        );

        *running = Some(RunningTasks {
            acceptor,
            dispatcher,
            shutdown_complete_tx,
            shutdown_complete_rx,
        });
        info!("server {} running on {}", server_id, self.local_addr);
        Ok(())
    }

    // Shutdown sequence:
    // 1. Cancel the root token. The accept loop exits and drops the listening
    //    socket. Every connection's child token fires, which stops its read loop
    //    and aborts sends blocked on peers that stopped reading.
    // 2. The dispatcher closes every registered connection and clears the
    //    registry. A `Connected` event consumed after this point closes that
    //    connection instead of registering it.
    // 3. Wait until every read loop has dropped its `shutdown_complete_tx`, at
    //    which point all connection sockets are closed.
    // 4. Close the event queue, the dispatcher drains what is left and exits.
    /// Stops the server. Returns once the listener and every connection socket
    /// are closed. Calling it again, or on a server that never ran, only makes
    /// sure the listener is closed.
    pub async fn shutdown(&self) {
        let mut running = self.running.lock().await;
        // a server that never ran still owns its listener
        drop(self.startup.lock().take());
        let Some(tasks) = running.take() else {
            return;
        };
        let RunningTasks {
            acceptor,
            dispatcher,
            shutdown_complete_tx,
            mut shutdown_complete_rx,
        } = tasks;

        info!("close listener...");
        self.shutdown.cancel();
        if let Err(e) = acceptor.await {
            warn!("accept loop ended abnormally: {}", e);
        }

        info!("shutdown all connections...");
        let (reply_tx, reply_rx) = oneshot::channel();
        match self
            .command_tx
            .send(DispatcherCommand::CloseAll(reply_tx))
            .await
        {
            Ok(()) => {
                if let Err(e) = reply_rx.await {
                    warn!("dispatcher did not confirm closing connections: {}", e);
                }
            }
            Err(e) => warn!("dispatcher is gone: {}", e),
        }

        drop(shutdown_complete_tx);
        let _ = shutdown_complete_rx.recv().await;
        debug!("all connection read loops exited");

        self.event_queue.close();
        if let Err(e) = dispatcher.await {
            warn!("dispatcher ended abnormally: {}", e);
        }
        info!("server {} shutdown complete", self.config.general.id);
    }

    /// Ids of the currently registered connections, as seen by the dispatcher.
    pub async fn connection_ids(&self) -> AppResult<Vec<u64>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(DispatcherCommand::Snapshot(reply_tx))
            .await?;
        Ok(reply_rx.await?)
    }

    /// Events dropped because the event queue stayed full for too long.
    pub fn dropped_events(&self) -> u64 {
        self.event_queue.dropped()
    }
}
