//! ICMP Inbound Processing Core
//!
//! This crate implements the receive-side ICMP path for a small network
//! stack:
//! - Echo request → echo reply, rewritten in place in the device buffer
//! - Path-MTU discovery: a bounded cache fed by fragmentation-needed
//!   notifications
//! - Fan-out of inbound messages to listening raw sockets, subject to
//!   per-socket type filters and echo-reply correlation
//! - Packet buffers with headroom/tailroom support and a preallocated pool
//!
//! # Design
//!
//! The core runs synchronously on the caller's thread, under the caller's
//! network lock. Nothing here blocks: buffer allocation, queue append and
//! queue read are all "try" operations that fail fast, and a failed
//! delivery to one socket never affects the others. Outcomes are reported
//! only through the device's outgoing length and the statistics counters;
//! there is no error return from the input path.
//!
//! # Example
//!
//! ```ignore
//! let conns = IcmpConnTable::new();
//! let pool = BufPool::new(32);
//! let mut pmtu = PmtuCache::new();
//! let stats = IcmpStats::new();
//! let config = IcmpConfig::default();
//!
//! // A datagram has arrived in dev's buffer, validated down to the IP
//! // payload. Classify it; if dev.len() is nonzero afterwards, the
//! // buffer holds an echo reply ready to transmit.
//! icmp_input(&mut dev, &conns, &pool, &mut pmtu, &stats, &config);
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod buffer;
pub mod checksum;
pub mod device;
pub mod icmp;
pub mod ipv4;
pub mod pmtu;
pub mod socket;
pub mod stats;

pub use buffer::{BufPool, BufQueue, NetBuf};
pub use checksum::{adjust_for_type_change, checksum};
pub use device::NetDevice;
pub use icmp::{
    filter_accepts, icmp_input, DeliverError, IcmpConfig, IcmpError, IcmpMessage,
    ICMP_CODE_FRAG_NEEDED, ICMP_HDR_LEN, ICMP_TYPE_DEST_UNREACHABLE, ICMP_TYPE_ECHO_REPLY,
    ICMP_TYPE_ECHO_REQUEST, INNER_IP_OFFSET,
};
pub use ipv4::{Ipv4Addr, Ipv4View, Ipv4ViewMut, IPV4_HEADER_MIN_LEN};
pub use pmtu::{PmtuCache, PmtuEntry, PMTU_MAX_ENTRIES};
pub use socket::{
    ConnMeta, ConnStats, IcmpConn, IcmpConnTable, RecvAddr, ICMP_FILTER_ACCEPT_ALL,
    MAX_READAHEAD_QUEUE, RECV_ADDR_LEN,
};
pub use stats::{IcmpCounters, IcmpStats, IcmpStatsSnapshot};

// ============================================================================
// Buffer Layout Constants
// ============================================================================

/// Default payload capacity for pool buffers.
pub const DEFAULT_MTU: usize = 1500;

/// Default headroom reserved in pool buffers. Large enough for the
/// delivery path's address record with room left for future prepends.
pub const DEFAULT_HEADROOM: usize = 64;

/// Default tailroom reserved in pool buffers.
pub const DEFAULT_TAILROOM: usize = 64;
