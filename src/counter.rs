//! Per-job byte accounting.
//!
//! Every announcement session owns one [`ByteCounter`] and threads it
//! through each send, wait and bulk transfer, so the totals reflect the
//! whole job regardless of which task touched the wire.

use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Totals {
    sent: u64,
    received: u64,
}

/// Thread-safe sent/received byte totals for one job. Cheap to clone; all
/// clones share the same totals.
#[derive(Clone, Debug, Default)]
pub struct ByteCounter {
    totals: Arc<Mutex<Totals>>,
}

impl ByteCounter {
    pub fn new() -> ByteCounter {
        ByteCounter::default()
    }

    pub fn sent_bytes(&self, n: usize) {
        let mut totals = self.totals.lock().expect("byte counter poisoned");
        totals.sent += n as u64;
    }

    pub fn received_bytes(&self, n: usize) {
        let mut totals = self.totals.lock().expect("byte counter poisoned");
        totals.received += n as u64;
    }

    /// Payload bytes are already included in the sent total at this layer.
    pub fn sent_payload(&self, _n: usize) {}

    pub fn total_sent(&self) -> u64 {
        self.totals.lock().expect("byte counter poisoned").sent
    }

    pub fn total_received(&self) -> u64 {
        self.totals.lock().expect("byte counter poisoned").received
    }
}
