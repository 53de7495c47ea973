//! Revocation fan-out
//!
//! Every subscriber gets its own channel. Publishing never blocks: a lossy
//! subscriber with a full buffer misses the event, a reliable one buffers without bound.

use crate::auth::KeyId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A key was revoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revocation {
    pub key_id: KeyId,
}

enum Outlet {
    Lossy(mpsc::Sender<Revocation>),
    Reliable(mpsc::UnboundedSender<Revocation>),
}

#[derive(Default)]
struct Inner {
    outlets: Mutex<HashMap<u64, Outlet>>,
    next_id: AtomicU64,
}

/// Registry of revocation subscribers
#[derive(Clone, Default)]
pub struct Subscribers {
    inner: Arc<Inner>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe with a bounded buffer; events are dropped for this subscriber while it is full
    pub fn subscribe(&self, buffer: usize) -> (RevocationReceiver, Unsubscribe) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let guard = self.register(Outlet::Lossy(tx));
        (RevocationReceiver::Lossy(rx), guard)
    }

    /// Subscribe without a buffer limit; no event is ever dropped
    pub fn subscribe_reliable(&self) -> (RevocationReceiver, Unsubscribe) {
        let (tx, rx) = mpsc::unbounded_channel();
        let guard = self.register(Outlet::Reliable(tx));
        (RevocationReceiver::Reliable(rx), guard)
    }

    fn register(&self, outlet: Outlet) -> Unsubscribe {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.outlets.lock().insert(id, outlet);

        Unsubscribe {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Deliver an event to every current subscriber, returning how many received it
    pub fn publish(&self, event: Revocation) -> usize {
        let outlets = self.inner.outlets.lock();
        let mut delivered = 0;

        for (id, outlet) in outlets.iter() {
            let sent = match outlet {
                Outlet::Lossy(tx) => tx.try_send(event).is_ok(),
                Outlet::Reliable(tx) => tx.send(event).is_ok(),
            };

            if sent {
                delivered += 1;
            } else {
                debug!(subscriber = id, key_id = %event.key_id, "Revocation not delivered (buffer full or receiver gone)");
            }
        }

        delivered
    }

    /// Number of registered subscribers
    pub fn count(&self) -> usize {
        self.inner.outlets.lock().len()
    }
}

/// Receiving end of a revocation subscription
pub enum RevocationReceiver {
    Lossy(mpsc::Receiver<Revocation>),
    Reliable(mpsc::UnboundedReceiver<Revocation>),
}

impl RevocationReceiver {
    /// Wait for the next event; `None` once the subscription is torn down
    pub async fn recv(&mut self) -> Option<Revocation> {
        match self {
            RevocationReceiver::Lossy(rx) => rx.recv().await,
            RevocationReceiver::Reliable(rx) => rx.recv().await,
        }
    }

    pub fn try_recv(&mut self) -> Option<Revocation> {
        match self {
            RevocationReceiver::Lossy(rx) => rx.try_recv().ok(),
            RevocationReceiver::Reliable(rx) => rx.try_recv().ok(),
        }
    }
}

/// Teardown handle for a subscription. Dropping it also unsubscribes.
pub struct Unsubscribe {
    inner: std::sync::Weak<Inner>,
    id: u64,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            // Removing the sender closes the channel, so the receiver drains and ends
            inner.outlets.lock().remove(&self.id);
        }
    }
}
