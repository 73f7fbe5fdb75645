//! Listening ICMP connections and their registry.
//!
//! One `IcmpConn` exists per open raw ICMP socket. The input path is the
//! producer: it appends copied messages to the connection's read-ahead
//! queue. The socket's read call is the consumer. Both run under the
//! caller's coarse network lock but in separate calls, so the queue sits
//! behind its own lock and both ends are non-blocking.
//!
//! # Filtering
//!
//! Each connection carries a 32-bit type mask: bit *n* set means message
//! type *n* is accepted; types 32 and above are never filtered out. Echo
//! replies are additionally correlated against the connection's echo id and
//! bound device, so one pinging socket does not see another socket's
//! replies.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use log::warn;
use spin::{Mutex, RwLock};

use crate::buffer::{BufPool, BufQueue, NetBuf};
use crate::ipv4::Ipv4Addr;

/// Maximum chains queued per connection before deliveries are refused.
pub const MAX_READAHEAD_QUEUE: usize = 16;

/// Filter accepting every message type.
pub const ICMP_FILTER_ACCEPT_ALL: u32 = u32::MAX;

// ============================================================================
// Received-Message Address Record
// ============================================================================

/// Length of the encoded address record at the front of a queued chain.
pub const RECV_ADDR_LEN: usize = 8;

const AF_INET: u16 = 2;

/// Source-address metadata stored ahead of each buffered message.
///
/// ICMP has no ports; the port field is always zero and exists so the
/// record reads like the socket-address structures applications expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvAddr {
    /// Source address of the buffered message.
    pub addr: Ipv4Addr,
    /// Always zero for ICMP.
    pub port: u16,
}

impl RecvAddr {
    /// Create a record for a message from `addr`.
    pub fn new(addr: Ipv4Addr) -> Self {
        RecvAddr { addr, port: 0 }
    }

    /// Encode into the fixed wire record.
    pub fn encode(&self) -> [u8; RECV_ADDR_LEN] {
        let mut out = [0u8; RECV_ADDR_LEN];
        out[0..2].copy_from_slice(&AF_INET.to_be_bytes());
        out[2..4].copy_from_slice(&self.port.to_be_bytes());
        out[4..8].copy_from_slice(&self.addr.octets());
        out
    }

    /// Decode a record; `None` if short or not an IPv4 record.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RECV_ADDR_LEN {
            return None;
        }
        if u16::from_be_bytes([bytes[0], bytes[1]]) != AF_INET {
            return None;
        }
        Some(RecvAddr {
            port: u16::from_be_bytes([bytes[2], bytes[3]]),
            addr: Ipv4Addr([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}

// ============================================================================
// Connection Metadata
// ============================================================================

/// Mutable correlation state for a connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnMeta {
    /// Identifier this socket last sent an echo request with.
    pub echo_id: u16,
    /// Device the request went out on, if any.
    pub bound_device: Option<usize>,
}

// ============================================================================
// Listening Connection
// ============================================================================

/// Per-socket state for a registered raw ICMP connection.
///
/// Wrapped in `Arc` and shared between the registry and the owning socket.
pub struct IcmpConn {
    /// Unique connection identifier (monotonically increasing).
    id: u64,
    /// Accept mask; bit *n* accepts type *n*, types >= 32 always pass.
    filter: AtomicU32,
    /// Echo correlation state.
    meta: Mutex<ConnMeta>,
    /// Read-ahead queue of buffered inbound messages.
    readahead: Mutex<BufQueue>,
    /// Set when the owning socket closes; refuses further deliveries.
    closed: AtomicBool,
    /// Payload bytes buffered.
    rx_bytes: AtomicU64,
    /// Messages buffered.
    rx_messages: AtomicU64,
    /// Deliveries refused (queue full or connection closed).
    rx_dropped: AtomicU64,
}

impl core::fmt::Debug for IcmpConn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IcmpConn")
            .field("id", &self.id)
            .field("filter", &self.filter.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl IcmpConn {
    fn new(id: u64) -> Self {
        IcmpConn {
            id,
            filter: AtomicU32::new(ICMP_FILTER_ACCEPT_ALL),
            meta: Mutex::new(ConnMeta::default()),
            readahead: Mutex::new(BufQueue::new(MAX_READAHEAD_QUEUE)),
            closed: AtomicBool::new(false),
            rx_bytes: AtomicU64::new(0),
            rx_messages: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
        }
    }

    /// Unique identifier of this connection.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current accept mask.
    #[inline]
    pub fn filter(&self) -> u32 {
        self.filter.load(Ordering::Relaxed)
    }

    /// Replace the accept mask.
    pub fn set_filter(&self, filter: u32) {
        self.filter.store(filter, Ordering::Relaxed);
    }

    /// Snapshot of the correlation state.
    pub fn meta(&self) -> ConnMeta {
        *self.meta.lock()
    }

    /// Record the identifier used for outgoing echo requests.
    pub fn set_echo_id(&self, echo_id: u16) {
        self.meta.lock().echo_id = echo_id;
    }

    /// Bind the connection to a device (by registration index).
    pub fn bind_device(&self, index: Option<usize>) {
        self.meta.lock().bound_device = index;
    }

    /// Whether the owning socket has closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Append a completed chain to the read-ahead queue without blocking.
    ///
    /// The chain must already carry the address record at its front. On
    /// refusal (closed connection or full queue) the chain is handed back
    /// so the caller can free it; nothing is partially queued.
    pub fn try_queue(&self, buf: NetBuf) -> Result<(), NetBuf> {
        if self.is_closed() {
            self.rx_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(buf);
        }

        let payload_len = buf.len().saturating_sub(RECV_ADDR_LEN) as u64;
        match self.readahead.lock().try_add(buf) {
            Ok(()) => {
                self.rx_bytes.fetch_add(payload_len, Ordering::Relaxed);
                self.rx_messages.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(buf) => {
                self.rx_dropped.fetch_add(1, Ordering::Relaxed);
                Err(buf)
            }
        }
    }

    /// Number of chains waiting to be read.
    pub fn readahead_len(&self) -> usize {
        self.readahead.lock().len()
    }

    /// Consume the next buffered message.
    ///
    /// Pops one chain, decodes the leading address record, copies out the
    /// payload and returns the chain to `pool`. Returns `None` when the
    /// queue is empty. Non-blocking; this is the socket read call's half of
    /// the producer/consumer pair.
    pub fn recvfrom(&self, pool: &BufPool) -> Option<(RecvAddr, Vec<u8>)> {
        let mut buf = self.readahead.lock().try_read()?;

        let addr = match buf.pull_head(RECV_ADDR_LEN).and_then(RecvAddr::decode) {
            Some(addr) => addr,
            None => {
                // A queued chain always starts with the record; anything
                // else is a logic error upstream. Drop the chain.
                warn!("icmp: discarding read-ahead chain without address record");
                pool.free(buf);
                return None;
            }
        };

        let payload = buf.data().to_vec();
        pool.free(buf);
        Some((addr, payload))
    }

    /// Per-connection delivery statistics.
    pub fn stats(&self) -> ConnStats {
        ConnStats {
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_messages: self.rx_messages.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            readahead_len: self.readahead_len(),
        }
    }
}

/// Snapshot of per-connection statistics.
#[derive(Debug, Clone, Copy)]
pub struct ConnStats {
    pub rx_bytes: u64,
    pub rx_messages: u64,
    pub rx_dropped: u64,
    pub readahead_len: usize,
}

// ============================================================================
// Connection Registry
// ============================================================================

/// Registry of listening connections, iterated in registration order.
///
/// Registration and removal happen on socket open/close; the input path
/// only iterates. The read lock held during iteration guarantees no
/// connection appears or disappears mid-fanout.
pub struct IcmpConnTable {
    conns: RwLock<Vec<Arc<IcmpConn>>>,
    next_id: AtomicU64,
}

impl IcmpConnTable {
    /// Create an empty registry.
    pub fn new() -> Self {
        IcmpConnTable {
            conns: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new listening connection.
    ///
    /// The connection starts with the accept-all filter and no echo
    /// correlation state.
    pub fn register(&self) -> Arc<IcmpConn> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(IcmpConn::new(id));
        self.conns.write().push(conn.clone());
        conn
    }

    /// Remove a connection and free its queued chains back to `pool`.
    ///
    /// The socket may still hold its `Arc`; the closed flag stops any
    /// concurrent delivery attempt from re-queueing.
    pub fn unregister(&self, id: u64, pool: &BufPool) {
        let conn = {
            let mut conns = self.conns.write();
            match conns.iter().position(|c| c.id == id) {
                Some(pos) => Some(conns.remove(pos)),
                None => None,
            }
        };

        if let Some(conn) = conn {
            conn.mark_closed();
            let mut queue = conn.readahead.lock();
            while let Some(buf) = queue.try_read() {
                pool.free(buf);
            }
        }
    }

    /// Invoke `f` once per registered connection, in registration order.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<IcmpConn>),
    {
        for conn in self.conns.read().iter() {
            f(conn);
        }
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.conns.read().len()
    }

    /// Returns true if no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.conns.read().is_empty()
    }
}

impl Default for IcmpConnTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
