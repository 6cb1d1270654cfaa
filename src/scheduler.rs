//! Deferred, cancellable reply delivery.
//!
//! Every reply the engine builds is parked here for the configured delay
//! before it reaches the socket, so that a faster server on the segment
//! answers the client first. Each pending send is a timer task keyed by
//! client. A new request from the same client aborts that client's pending
//! sends before its own reply is scheduled.
//!
//! Cancellation is best effort: a send whose timer fired just before the
//! abort may still go out. Clients tolerate a late duplicate OFFER.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::lease::ClientId;
use crate::packet::DhcpMessage;

/// A reply and where it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub message: DhcpMessage,
    pub destination: SocketAddrV4,
}

type PendingSends = HashMap<ClientId, HashMap<u64, JoinHandle<()>>>;

#[derive(Debug)]
struct Inner {
    pending: Mutex<PendingSends>,
    next_id: AtomicU64,
    outbound: mpsc::UnboundedSender<Reply>,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, PendingSends> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Removes send `id` for `client_id`. Returns `false` if it was
    /// cancelled in the meantime.
    fn take(&self, client_id: &ClientId, id: u64) -> bool {
        let mut pending = self.lock();
        let Some(sends) = pending.get_mut(client_id) else {
            return false;
        };
        let found = sends.remove(&id).is_some();
        if sends.is_empty() {
            pending.remove(client_id);
        }
        found
    }
}

/// Handle to the scheduler. Clones share the same pending set.
#[derive(Debug, Clone)]
pub struct DelayScheduler {
    inner: Arc<Inner>,
}

impl DelayScheduler {
    /// Creates a scheduler and the receiving end that the transmit task
    /// drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Reply>) {
        let (outbound, receiver) = mpsc::unbounded_channel();
        let scheduler = Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                outbound,
            }),
        };
        (scheduler, receiver)
    }

    /// Hands `reply` to the transmit channel once `delay` has elapsed,
    /// unless it is cancelled first.
    pub fn schedule(&self, client_id: ClientId, reply: Reply, delay: Duration) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        // Held across the spawn so the task cannot look for its id before
        // it has been inserted.
        let mut pending = self.inner.lock();

        let inner = Arc::clone(&self.inner);
        let key = client_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !inner.take(&key, id) {
                return;
            }
            debug!(
                "Releasing delayed reply for {} to {}",
                key, reply.destination
            );
            if inner.outbound.send(reply).is_err() {
                debug!("Transmit channel closed, dropping reply for {}", key);
            }
        });

        pending.entry(client_id).or_default().insert(id, handle);
    }

    /// Aborts every pending send for `client_id` and returns how many there
    /// were.
    pub fn cancel_all_for(&self, client_id: &ClientId) -> usize {
        let removed = self.inner.lock().remove(client_id);
        match removed {
            Some(sends) => {
                for handle in sends.values() {
                    handle.abort();
                }
                sends.len()
            }
            None => 0,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().values().map(HashMap::len).sum()
    }

    /// Pending sends per client, for the admin console.
    pub fn pending_clients(&self) -> Vec<(ClientId, usize)> {
        let mut clients: Vec<_> = self
            .inner
            .lock()
            .iter()
            .map(|(client_id, sends)| (client_id.clone(), sends.len()))
            .collect();
        clients.sort();
        clients
    }

    /// Aborts everything still pending.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.inner.lock().drain().collect();
        for (_, sends) in drained {
            for handle in sends.values() {
                handle.abort();
            }
        }
    }
}
