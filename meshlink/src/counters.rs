//! Statistics counters shared across the device, receiver, and
//! transmitter. Relaxed atomic increments, advisory reads only — per the
//! source's "Statistics counters" discipline, nothing here gates protocol
//! behavior.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counters {
    pub fragments_sent: AtomicU64,
    pub fragments_received: AtomicU64,
    pub crc_failures: AtomicU64,
    pub nacks_sent: AtomicU64,
    pub retransmitted: AtomicU64,
    pub messages_completed: AtomicU64,
}

/// A point-in-time snapshot, safe to hand to application code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub fragments_sent: u64,
    pub fragments_received: u64,
    pub crc_failures: u64,
    pub nacks_sent: u64,
    pub retransmitted: u64,
    pub messages_completed: u64,
}

impl Counters {
    pub fn new() -> Counters {
        Counters::default()
    }

    #[inline]
    pub fn inc_fragments_sent(&self) {
        self.fragments_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_fragments_received(&self) {
        self.fragments_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_crc_failures(&self) {
        self.crc_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_nacks_sent(&self) {
        self.nacks_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_retransmitted(&self, count: u64) {
        self.retransmitted.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_messages_completed(&self) {
        self.messages_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            fragments_sent: self.fragments_sent.load(Ordering::Relaxed),
            fragments_received: self.fragments_received.load(Ordering::Relaxed),
            crc_failures: self.crc_failures.load(Ordering::Relaxed),
            nacks_sent: self.nacks_sent.load(Ordering::Relaxed),
            retransmitted: self.retransmitted.load(Ordering::Relaxed),
            messages_completed: self.messages_completed.load(Ordering::Relaxed),
        }
    }
}
