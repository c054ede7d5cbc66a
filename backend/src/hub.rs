//! Outbound delivery.
//!
//! Each live connection owns a bounded outbox channel; its connection loop
//! drains the receiving end onto the wire. Sends are best effort: an unknown
//! target or a full outbox drops the event.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::{Dispatch, Schedule};
use crate::protocol::{ConnectionId, ServerEvent};

/// Default per-connection outbox capacity.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 64;

#[derive(Debug)]
struct HubInner {
    outboxes: DashMap<ConnectionId, mpsc::Sender<ServerEvent>>,
    /// Deferred notices keyed by the connection whose departure caused them.
    pending: DashMap<ConnectionId, JoinHandle<()>>,
    capacity: usize,
}

/// Routes server events to connection outboxes. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOX_CAPACITY)
    }
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                outboxes: DashMap::new(),
                pending: DashMap::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Open an outbox for `id` and return its receiving end.
    ///
    /// A deferred notice caused by an earlier connection with the same id is
    /// cancelled.
    pub fn attach(&self, id: ConnectionId) -> mpsc::Receiver<ServerEvent> {
        if let Some((_, task)) = self.inner.pending.remove(&id) {
            debug!(conn_id = %id, "Cancelling deferred notice for reconnected id");
            task.abort();
        }
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        self.inner.outboxes.insert(id, tx);
        rx
    }

    /// Close the outbox for `id`.
    pub fn detach(&self, id: &ConnectionId) {
        self.inner.outboxes.remove(id);
    }

    pub fn is_attached(&self, id: &ConnectionId) -> bool {
        self.inner.outboxes.contains_key(id)
    }

    /// Queue `event` for `to`. Returns whether it was queued.
    pub fn send(&self, to: &ConnectionId, event: ServerEvent) -> bool {
        let Some(tx) = self.inner.outboxes.get(to).map(|tx| tx.clone()) else {
            debug!(conn_id = %to, "Dropping event for stale target");
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn_id = %to, "Outbox full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(conn_id = %to, "Outbox closed, dropping event");
                false
            }
        }
    }

    /// Carry out the engine's dispatches.
    ///
    /// Deferred dispatches spawn onto the current tokio runtime.
    pub fn deliver(&self, dispatches: Vec<Dispatch>) {
        for dispatch in dispatches {
            match dispatch.schedule {
                Schedule::Now => {
                    self.send(&dispatch.to, dispatch.event);
                }
                Schedule::Deferred { delay, cancel_key } => {
                    self.send_after(cancel_key, dispatch.to, dispatch.event, delay);
                }
            }
        }
    }

    fn send_after(
        &self,
        cancel_key: ConnectionId,
        to: ConnectionId,
        event: ServerEvent,
        delay: Duration,
    ) {
        let hub = self.clone();
        let key = cancel_key.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            hub.inner.pending.remove(&key);
            hub.send(&to, event);
        });
        if let Some(previous) = self.inner.pending.insert(cancel_key, task) {
            previous.abort();
        }
    }
}
