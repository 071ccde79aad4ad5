// ABOUTME: Transaction aggregator - groups change events by originating transaction
// ABOUTME: Shared keyed buffer appended to by fetchers and drained by the materializer

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::{ChangeEvent, TxId};

#[derive(Debug, Default)]
struct Buckets {
    events: HashMap<TxId, Vec<ChangeEvent>>,
    /// Keys in first-seen order; drives materialization order.
    order: Vec<TxId>,
}

/// Keyed buffer of change events grouped by transaction id.
///
/// Within a key, events keep append order. Keys are reported in the order
/// they were first seen. Cloning yields another handle to the same buffer.
///
/// Materialization follows a snapshot-then-drain discipline: take
/// [`snapshot`](Self::snapshot), apply each key, then call
/// [`complete`](Self::complete) with the number of events actually applied.
/// Events appended to a key after it was read are left for a later cycle.
#[derive(Debug, Clone, Default)]
pub struct TransactionBuffer {
    inner: Arc<Mutex<Buckets>>,
}

impl TransactionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, txid: TxId, event: ChangeEvent) {
        let mut buckets = self.inner.lock();
        let Buckets { events, order } = &mut *buckets;
        events
            .entry(txid)
            .or_insert_with(|| {
                order.push(txid);
                Vec::new()
            })
            .push(event);
    }

    /// Append a whole batch under one lock so a fetcher pass lands atomically.
    pub fn extend(&self, batch: impl IntoIterator<Item = (TxId, ChangeEvent)>) {
        let mut buckets = self.inner.lock();
        let Buckets { events, order } = &mut *buckets;
        for (txid, event) in batch {
            events
                .entry(txid)
                .or_insert_with(|| {
                    order.push(txid);
                    Vec::new()
                })
                .push(event);
        }
    }

    /// Copy of the events currently buffered for `txid`.
    pub fn get(&self, txid: TxId) -> Option<Vec<ChangeEvent>> {
        self.inner.lock().events.get(&txid).cloned()
    }

    /// Drop a key and all of its events.
    pub fn delete(&self, txid: TxId) -> Option<Vec<ChangeEvent>> {
        let mut buckets = self.inner.lock();
        buckets.order.retain(|k| *k != txid);
        buckets.events.remove(&txid)
    }

    /// Ordered list of keys present right now. This is a copy, not a live view.
    pub fn snapshot(&self) -> Vec<TxId> {
        self.inner.lock().order.clone()
    }

    /// Alias of [`snapshot`](Self::snapshot).
    pub fn keys(&self) -> Vec<TxId> {
        self.snapshot()
    }

    /// Mark the first `applied` events of `txid` as materialized.
    ///
    /// The key is removed once it has no events left.
    pub fn complete(&self, txid: TxId, applied: usize) {
        let mut buckets = self.inner.lock();
        let now_empty = match buckets.events.get_mut(&txid) {
            Some(list) => {
                let applied = applied.min(list.len());
                list.drain(..applied);
                list.is_empty()
            }
            None => false,
        };
        if now_empty {
            buckets.events.remove(&txid);
            buckets.order.retain(|k| *k != txid);
        }
    }

    /// Number of transactions buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of events across all transactions.
    pub fn pending_events(&self) -> usize {
        self.inner.lock().events.values().map(Vec::len).sum()
    }
}
