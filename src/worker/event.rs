//! `EventWorker`: completes when the broker acknowledges an operation
//! (subscribe, unsubscribe, publish at QoS > 0) rather than when a dedicated
//! thread finishes a task.
//!
//! Grounded on §4.1's "EventWorker: completes when an external event fires
//! (a broker acknowledgement); the transport owns signalling it" and on how
//! `rumqttc::Event::Incoming` acks carry back the packet identifier the
//! client assigned when it made the call.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{new_pair, Completer, Future};

/// Tracks outstanding `EventWorker`s by the packet identifier the broker
/// will echo back in its acknowledgement.
///
/// One table per acknowledgement kind (subscribe, unsubscribe, publish) is
/// expected; [`crate::mqtt`] keeps one instance of each.
pub struct EventWorkerTable<T> {
    pending: Mutex<HashMap<u16, Completer<T>>>,
}

impl<T> Default for EventWorkerTable<T> {
    fn default() -> Self {
        EventWorkerTable { pending: Mutex::new(HashMap::new()) }
    }
}

impl<T> EventWorkerTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new worker for `pkid`, returning the future half to give
    /// back to the caller that issued the operation.
    pub fn register(&self, pkid: u16) -> Future<T> {
        let (future, completer) = new_pair();
        self.insert(pkid, completer);
        future
    }

    /// Registers an already-created completer under `pkid`. Used when the
    /// future was handed to the caller before the broker-assigned packet
    /// identifier became known (the transport learns `pkid` only once the
    /// outgoing packet has actually been written).
    pub fn insert(&self, pkid: u16, completer: Completer<T>) {
        self.pending
            .lock()
            .expect("event worker table poisoned")
            .insert(pkid, completer);
    }

    /// Completes the worker registered for `pkid`, if any is still pending.
    /// Acks for unknown or already-completed packet IDs are dropped; this can
    /// happen legitimately if the transport already failed the same worker
    /// via [`Self::fail_all`] on a prior disconnect.
    pub fn complete(&self, pkid: u16, result: Result<T, anyhow::Error>) {
        let completer = self
            .pending
            .lock()
            .expect("event worker table poisoned")
            .remove(&pkid);
        if let Some(completer) = completer {
            completer.complete(result);
        }
    }

    /// Fails every still-pending worker with a clone-by-message of `reason`.
    /// Called when the transport drops the connection: §4.1's "disconnection
    /// fails every outstanding EventWorker with NotConnected".
    pub fn fail_all(&self, reason: impl Fn() -> anyhow::Error) {
        let mut pending = self.pending.lock().expect("event worker table poisoned");
        for (_, completer) in pending.drain() {
            completer.complete(Err(reason()));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("event worker table poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_completes_by_pkid() {
        let table: EventWorkerTable<()> = EventWorkerTable::new();
        let future = table.register(1);
        table.complete(1, Ok(()));
        assert!(future.done());
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn ack_for_unknown_pkid_is_ignored() {
        let table: EventWorkerTable<()> = EventWorkerTable::new();
        table.complete(99, Ok(()));
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn fail_all_completes_every_pending_worker() {
        let table: EventWorkerTable<()> = EventWorkerTable::new();
        let a = table.register(1);
        let b = table.register(2);
        table.fail_all(|| anyhow::anyhow!("not connected"));
        assert!(a.done());
        assert!(b.done());
        assert_eq!(table.pending_count(), 0);
    }
}
