//! ICMP input-path statistics.
//!
//! Counters are observational only and never influence control flow. The
//! dispatcher talks to a sink trait rather than fixed globals so tests can
//! assert exact counts against a private instance.

use core::sync::atomic::{AtomicU64, Ordering};

/// Fire-and-forget counter sink driven by the dispatcher.
pub trait IcmpCounters {
    /// A message reached the input path.
    fn inc_recv(&self);
    /// An echo reply was left in the device buffer for transmission.
    fn inc_sent(&self);
    /// A message was discarded as unrecognized or malformed.
    fn inc_type_errors(&self);
    /// A message was discarded without being handled anywhere.
    fn inc_drops(&self);
}

/// Atomic counter set implementing [`IcmpCounters`].
#[derive(Debug, Default)]
pub struct IcmpStats {
    /// Messages received
    pub recv: AtomicU64,
    /// Echo replies sent
    pub sent: AtomicU64,
    /// Unrecognized or malformed messages
    pub type_errors: AtomicU64,
    /// Messages dropped
    pub drops: AtomicU64,
}

impl IcmpStats {
    /// Create a zeroed counter set.
    pub const fn new() -> Self {
        IcmpStats {
            recv: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            type_errors: AtomicU64::new(0),
            drops: AtomicU64::new(0),
        }
    }

    /// Copy out the current values.
    pub fn snapshot(&self) -> IcmpStatsSnapshot {
        IcmpStatsSnapshot {
            recv: self.recv.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            type_errors: self.type_errors.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
        }
    }
}

impl IcmpCounters for IcmpStats {
    #[inline]
    fn inc_recv(&self) {
        self.recv.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn inc_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn inc_type_errors(&self) {
        self.type_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn inc_drops(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`IcmpStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpStatsSnapshot {
    pub recv: u64,
    pub sent: u64,
    pub type_errors: u64,
    pub drops: u64,
}
