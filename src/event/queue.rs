use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::TrySendError;
use tokio::time;
use tracing::{debug, warn};

use super::ConnEvent;
use crate::service::EventQueueConfig;

/// Producer side of the bounded event queue, cloned into every connection.
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: async_channel::Sender<ConnEvent>,
    push_timeout: Duration,
    dropped: Arc<AtomicU64>,
}

/// Consumer side, owned by the dispatcher.
#[derive(Debug)]
pub struct EventReceiver {
    rx: async_channel::Receiver<ConnEvent>,
}

pub fn event_queue(config: &EventQueueConfig) -> (EventQueue, EventReceiver) {
    let (tx, rx) = async_channel::bounded(config.capacity);
    (
        EventQueue {
            tx,
            push_timeout: config.push_timeout(),
            dropped: Arc::new(AtomicU64::new(0)),
        },
        EventReceiver { rx },
    )
}

impl EventQueue {
    /// Best-effort enqueue.
    ///
    /// Tries an immediate enqueue first. When the queue is full the producer waits
    /// at most `push_timeout`, after which the event is dropped. The producer is
    /// never told about the drop, it only shows up in the logs and in `dropped()`.
    pub async fn push(&self, event: ConnEvent) {
        let event = match self.tx.try_send(event) {
            Ok(()) => return,
            Err(TrySendError::Closed(event)) => {
                debug!("event queue closed, discard {}", event);
                return;
            }
            Err(TrySendError::Full(event)) => event,
        };

        let description = event.to_string();
        match time::timeout(self.push_timeout, self.tx.send(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                debug!("event queue closed, discard {}", description);
            }
            Err(_) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "event queue full for {:?}, drop {} (total dropped: {})",
                    self.push_timeout, description, dropped
                );
            }
        }
    }

    /// Closes the queue. Events already queued can still be popped, later pushes
    /// are discarded.
    pub fn close(&self) -> bool {
        self.tx.close()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl EventReceiver {
    /// Waits for the next event, `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<ConnEvent> {
        self.rx.recv().await.ok()
    }
}
