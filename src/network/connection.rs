use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::frame::{FrameCodec, RecvTask, HEADER_SIZE};
use crate::event::{ConnEvent, EventQueue};
use crate::{AppError, AppResult};

/// Id of a connection that the dispatcher has not registered yet.
pub const UNREGISTERED: u64 = 0;

/// Shared handle of an accepted socket.
///
/// The registry, the events and application handlers all hold an `Arc` of it.
/// Sends are serialized by the write lock, so frames written by concurrent
/// callers never interleave on the wire. Different connections never share a lock.
///
/// Closing goes through `closed`, never through the write lock: a send stuck on
/// a peer that stops reading is aborted as soon as the token is cancelled.
#[derive(Debug)]
pub struct Connection {
    id: AtomicU64,
    peer_addr: SocketAddr,
    codec: FrameCodec,
    writer: Mutex<Option<BufWriter<OwnedWriteHalf>>>,
    closed: CancellationToken,
}

impl Connection {
    /// Splits `socket` into the shared send handle and the read loop that feeds
    /// the event queue. Nothing is read until [`ConnectionReader::run`] is called.
    ///
    /// Cancelling `closed`, or any token it was derived from, closes the
    /// connection the same way [`Connection::shutdown`] does.
    pub fn new(
        socket: TcpStream,
        codec: FrameCodec,
        read_buffer_size: usize,
        closed: CancellationToken,
    ) -> AppResult<(Arc<Connection>, ConnectionReader)> {
        let peer_addr = socket.peer_addr()?;
        let (reader, writer) = socket.into_split();

        let connection = Arc::new(Connection {
            id: AtomicU64::new(UNREGISTERED),
            peer_addr,
            codec: codec.clone(),
            writer: Mutex::new(Some(BufWriter::new(writer))),
            closed,
        });
        let reader = ConnectionReader {
            connection: connection.clone(),
            frames: FrameReader {
                reader,
                buffer: BytesMut::with_capacity(read_buffer_size),
                codec,
            },
        };
        Ok((connection, reader))
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    /// Only the dispatcher assigns ids.
    pub(crate) fn set_id(&self, id: u64) {
        self.id.store(id, Ordering::Release);
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Encodes `msg` as the frame body and writes it to the socket.
    pub async fn send<M: prost::Message>(&self, msg_id: u16, msg: &M) -> AppResult<()> {
        self.send_bytes(msg_id, &msg.encode_to_vec()).await
    }

    /// Writes one frame. Fails with [`AppError::ConnectionClosed`] if the
    /// connection is closed before or while the frame is being written.
    pub async fn send_bytes(&self, msg_id: u16, body: &[u8]) -> AppResult<()> {
        // the whole frame is built up front and written under a single lock
        let mut frame = BytesMut::with_capacity(HEADER_SIZE + body.len());
        self.codec.encode_frame(msg_id, body, &mut frame)?;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(AppError::ConnectionClosed(self.id())),
            res = self.write_frame(&frame) => {
                res?;
                trace!(
                    "connection {} sent msg id: {}, data len: {}",
                    self.id(),
                    msg_id,
                    body.len()
                );
                Ok(())
            }
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> AppResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or(AppError::ConnectionClosed(self.id()))?;
        writer
            .write_all(frame)
            .await
            .map_err(|e| AppError::DetailedIoError(format!("write frame error: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| AppError::DetailedIoError(format!("flush frame error: {}", e)))?;
        Ok(())
    }

    /// Closes the socket. Pending sends are aborted, the write half is dropped
    /// and the read loop drops the read half on its way out.
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        self.closed.cancel();
        // the lock is free once aborted sends have unwound
        let writer = self.writer.lock().await.take();
        if let Some(writer) = writer {
            debug!("shutdown connection {} ({})", self.id(), self.peer_addr);
            // dropping the write half sends FIN without flushing a half written frame
            drop(writer);
        }
    }
}

/// Buffered frame reader over the read half of the socket.
#[derive(Debug)]
struct FrameReader {
    reader: OwnedReadHalf,
    buffer: BytesMut,
    codec: FrameCodec,
}

impl FrameReader {
    /// Reads the next frame.
    ///
    /// Returns `None` if the peer closed the connection on a frame boundary, an
    /// error if it closed in the middle of a frame or sent a malformed frame.
    async fn read_frame(&mut self) -> AppResult<Option<RecvTask>> {
        loop {
            if let Some(task) = self.codec.parse(&mut self.buffer)? {
                return Ok(Some(task));
            }
            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(
                        io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer")
                            .into(),
                    )
                };
            }
        }
    }
}

/// Read loop of one connection.
#[derive(Debug)]
pub struct ConnectionReader {
    connection: Arc<Connection>,
    frames: FrameReader,
}

impl ConnectionReader {
    /// Announces the connection, forwards every decoded frame as a data event and
    /// announces the disconnect once reading stops.
    ///
    /// Reading stops on peer close, on a framing or I/O error, or once the
    /// connection's close token is cancelled. In every case the socket is closed
    /// before the `Disconnected` event is pushed. `_shutdown_complete` is dropped
    /// when the loop is done, which lets the server wait for all read loops.
    pub async fn run(self, event_queue: EventQueue, _shutdown_complete: mpsc::Sender<()>) {
        let ConnectionReader {
            connection,
            mut frames,
        } = self;

        event_queue
            .push(ConnEvent::Connected(connection.clone()))
            .await;

        loop {
            let maybe_task = tokio::select! {
                res = frames.read_frame() => res,
                _ = connection.closed.cancelled() => {
                    debug!("connection {} read loop stopped by shutdown", connection.id());
                    break;
                }
            };
            match maybe_task {
                Ok(Some(task)) => {
                    event_queue
                        .push(ConnEvent::Data(connection.clone(), task))
                        .await;
                }
                Ok(None) => {
                    debug!("connection {} closed by peer", connection.id());
                    break;
                }
                Err(e) => {
                    debug!("connection {} read error: {}", connection.id(), e);
                    break;
                }
            }
        }

        connection.shutdown().await;
        drop(frames);
        event_queue
            .push(ConnEvent::Disconnected(connection.clone()))
            .await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_util::codec::FramedRead;

    use super::*;
    use crate::event::event_queue;
    use crate::service::EventQueueConfig;

    /// Accepted server side connection plus the client socket talking to it.
    pub(crate) async fn connected_pair(
        max_package_size: usize,
    ) -> (Arc<Connection>, ConnectionReader, TcpStream) {
        connected_pair_closed_by(max_package_size, CancellationToken::new()).await
    }

    async fn connected_pair_closed_by(
        max_package_size: usize,
        closed: CancellationToken,
    ) -> (Arc<Connection>, ConnectionReader, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (socket, _) = accepted.unwrap();
        let (conn, reader) =
            Connection::new(socket, FrameCodec::new(max_package_size), 1024, closed).unwrap();
        (conn, reader, client.unwrap())
    }

    #[tokio::test]
    async fn test_send_writes_one_frame() {
        let (conn, _reader, client) = connected_pair(1024).await;
        conn.send_bytes(42, b"payload").await.unwrap();

        let mut frames = FramedRead::new(client, FrameCodec::new(1024));
        let task = frames.next().await.unwrap().unwrap();
        assert_eq!(task.msg_id, 42);
        assert_eq!(&task.body[..], b"payload");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sends_do_not_interleave() {
        let (conn, _reader, client) = connected_pair(64 * 1024).await;
        const SENDERS: u16 = 4;
        const FRAMES_PER_SENDER: usize = 200;

        let mut handles = Vec::new();
        for sender in 0..SENDERS {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move {
                // large bodies force partial writes on the socket
                let body = vec![sender as u8; 8 * 1024 + sender as usize];
                for _ in 0..FRAMES_PER_SENDER {
                    conn.send_bytes(sender, &body).await.unwrap();
                }
            }));
        }

        let reader = tokio::spawn(async move {
            let mut frames = FramedRead::new(client, FrameCodec::new(64 * 1024));
            let mut counts: HashMap<u16, usize> = HashMap::new();
            for _ in 0..(SENDERS as usize * FRAMES_PER_SENDER) {
                let task = frames.next().await.unwrap().unwrap();
                assert_eq!(task.len, 8 * 1024 + task.msg_id as usize);
                assert!(task.body.iter().all(|b| *b == task.msg_id as u8));
                *counts.entry(task.msg_id).or_default() += 1;
            }
            counts
        });

        for handle in handles {
            handle.await.unwrap();
        }
        let counts = timeout(Duration::from_secs(30), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counts.len(), SENDERS as usize);
        assert!(counts.values().all(|c| *c == FRAMES_PER_SENDER));
    }

    #[tokio::test]
    async fn test_read_loop_emits_lifecycle_events() {
        let (conn, reader, client) = connected_pair(1024).await;
        let (queue, receiver) = event_queue(&EventQueueConfig::default());
        let (complete_tx, mut complete_rx) = mpsc::channel::<()>(1);
        tokio::spawn(reader.run(queue, complete_tx));

        let mut framed = tokio_util::codec::Framed::new(client, FrameCodec::new(1024));
        futures::SinkExt::send(&mut framed, (7u16, &b"abc"[..]))
            .await
            .unwrap();
        drop(framed);

        assert!(matches!(receiver.pop().await, Some(ConnEvent::Connected(_))));
        match receiver.pop().await {
            Some(ConnEvent::Data(c, task)) => {
                assert!(Arc::ptr_eq(&c, &conn));
                assert_eq!(task, RecvTask::new(7, bytes::Bytes::from_static(b"abc")));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            receiver.pop().await,
            Some(ConnEvent::Disconnected(_))
        ));
        // the read loop has finished
        assert!(complete_rx.recv().await.is_none());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_malformed_frame_terminates_connection() {
        let (conn, reader, mut client) = connected_pair(16).await;
        let (queue, receiver) = event_queue(&EventQueueConfig::default());
        let (complete_tx, _complete_rx) = mpsc::channel::<()>(1);
        tokio::spawn(reader.run(queue, complete_tx));

        // declared length above max_package_size
        client.write_all(&[0, 0, 1, 0, 0, 1]).await.unwrap();

        assert!(matches!(receiver.pop().await, Some(ConnEvent::Connected(_))));
        assert!(matches!(
            receiver.pop().await,
            Some(ConnEvent::Disconnected(_))
        ));
        assert!(conn.is_closed());

        // the server side socket is gone
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_read_loop_and_rejects_send() {
        let (conn, reader, mut client) = connected_pair(1024).await;
        let (queue, receiver) = event_queue(&EventQueueConfig::default());
        let (complete_tx, mut complete_rx) = mpsc::channel::<()>(1);
        tokio::spawn(reader.run(queue, complete_tx));
        assert!(matches!(receiver.pop().await, Some(ConnEvent::Connected(_))));

        conn.shutdown().await;
        conn.shutdown().await;

        assert!(matches!(
            receiver.pop().await,
            Some(ConnEvent::Disconnected(_))
        ));
        assert!(complete_rx.recv().await.is_none());
        assert!(matches!(
            conn.send_bytes(1, b"late").await,
            Err(AppError::ConnectionClosed(_))
        ));

        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_server_shutdown_stops_read_loop() {
        let server_shutdown = CancellationToken::new();
        let (conn, reader, _client) =
            connected_pair_closed_by(1024, server_shutdown.child_token()).await;
        let (queue, receiver) = event_queue(&EventQueueConfig::default());
        let (complete_tx, mut complete_rx) = mpsc::channel::<()>(1);
        tokio::spawn(reader.run(queue, complete_tx));
        assert!(matches!(receiver.pop().await, Some(ConnEvent::Connected(_))));

        server_shutdown.cancel();

        assert!(matches!(
            receiver.pop().await,
            Some(ConnEvent::Disconnected(_))
        ));
        assert!(complete_rx.recv().await.is_none());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_send_blocked_on_idle_peer() {
        const BODY_SIZE: usize = 32 * 1024 * 1024;
        // the client never reads, the frame cannot fit in the socket buffers
        let (conn, _reader, _client) = connected_pair(BODY_SIZE).await;

        let sender = conn.clone();
        let blocked = tokio::spawn(async move {
            let body = vec![7u8; BODY_SIZE];
            sender.send_bytes(2, &body).await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!blocked.is_finished());

        timeout(Duration::from_secs(5), conn.shutdown())
            .await
            .expect("shutdown waited for the blocked send");
        let res = timeout(Duration::from_secs(5), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(AppError::ConnectionClosed(_))));
        assert!(conn.is_closed());
    }
}
