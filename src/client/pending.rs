use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::{lock_ignore_poison, CorrelationId};

/// The single reply a client is waiting for.
///
/// A client has at most one call in flight, so this is one slot rather than a
/// map. The reply task completes the slot only when the incoming correlation
/// id matches; anything else is a stale or foreign reply and is dropped.
pub(super) struct PendingReply {
    // ---
    slot: Mutex<Option<(CorrelationId, oneshot::Sender<Bytes>)>>,
}

impl PendingReply {
    // ---

    /// Create an empty slot.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Wait for the reply to `correlation_id`, replacing any previous wait.
    ///
    /// Returns a receiver that resolves when the matching reply arrives.
    pub fn register(&self, correlation_id: CorrelationId) -> oneshot::Receiver<Bytes> {
        // ---
        let (tx, rx) = oneshot::channel();
        *lock_ignore_poison(&self.slot) = Some((correlation_id, tx));
        rx
    }

    /// Deliver `body` if `correlation_id` is the one being waited for.
    ///
    /// Returns true if the reply was accepted.
    pub fn complete(&self, correlation_id: Option<&CorrelationId>, body: Bytes) -> bool {
        // ---
        let mut slot = lock_ignore_poison(&self.slot);

        let matches = matches!(
            (slot.as_ref(), correlation_id),
            (Some((expected, _)), Some(actual)) if expected == actual
        );
        if !matches {
            return false;
        }

        match slot.take() {
            // Receiver may already be gone after a timeout.
            Some((_, tx)) => tx.send(body).is_ok(),
            None => false,
        }
    }

    /// Stop waiting; a late reply will be dropped.
    pub fn clear(&self) {
        lock_ignore_poison(&self.slot).take();
    }

    /// Whether a reply is currently awaited.
    pub fn is_pending(&self) -> bool {
        lock_ignore_poison(&self.slot).is_some()
    }
}
