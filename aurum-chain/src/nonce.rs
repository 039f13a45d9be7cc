use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(Debug, Default, Clone, Copy)]
struct NonceRecord {
    confirmed: u64,
    pending: u64,
}

/// Per-sender replay protection: `confirmed` tracks the chain, `pending`
/// counts live mempool reservations. The next acceptable nonce is
/// `confirmed + pending`.
///
/// Confirmed values are monotonic; only a reorg rebuild may lower them.
/// The tracker carries its own lock so reservations (mempool path) and
/// commits (chain path) stay individually atomic without entangling the
/// two outer locks.
#[derive(Debug, Default)]
pub struct NonceTracker {
    records: Mutex<HashMap<String, NonceRecord>>,
}

impl NonceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowest unconfirmed nonce for the sender.
    pub fn get_nonce(&self, address: &str) -> u64 {
        self.records
            .lock()
            .get(address)
            .map(|r| r.confirmed)
            .unwrap_or(0)
    }

    /// Upper bound the mempool may accept: confirmed + reservations.
    pub fn next_nonce(&self, address: &str) -> u64 {
        self.records
            .lock()
            .get(address)
            .map(|r| r.confirmed + r.pending)
            .unwrap_or(0)
    }

    pub fn reserve(&self, address: &str) {
        self.records.lock().entry(address.to_string()).or_default().pending += 1;
    }

    pub fn release(&self, address: &str) {
        let mut records = self.records.lock();
        if let Some(rec) = records.get_mut(address) {
            rec.pending = rec.pending.saturating_sub(1);
        }
    }

    /// Confirm a nonce from a block: advance `confirmed` past it and
    /// consume the reservation it held.
    pub fn commit(&self, address: &str, nonce: u64) {
        let mut records = self.records.lock();
        let rec = records.entry(address.to_string()).or_default();
        rec.confirmed = rec.confirmed.max(nonce + 1);
        rec.pending = rec.pending.saturating_sub(1);
    }

    /// Replace all state after a reorg: confirmed counts recomputed from
    /// the adopted chain, reservations recounted from the mempool.
    pub fn rebuild(&self, confirmed: HashMap<String, u64>, pending: HashMap<String, u64>) {
        let mut records = self.records.lock();
        records.clear();
        for (address, value) in confirmed {
            records.entry(address).or_default().confirmed = value;
        }
        for (address, value) in pending {
            records.entry(address).or_default().pending = value;
        }
    }
}
