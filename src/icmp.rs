//! ICMP input processing.
//!
//! This module is the receive-side entry point for ICMP: given a device
//! whose buffer holds a validated IPv4 datagram carrying an ICMP message,
//! it fans the message out to listening raw sockets, classifies it, and
//! decides what (if anything) goes back out.
//!
//! # Architecture
//!
//! ```text
//!                  +--------------------+
//!                  |     icmp_input     |
//!                  +---------+----------+
//!                            |
//!              +-------------v-------------+
//!              |  deliver to listeners     |
//!              |  (filter + correlation)   |
//!              +-------------+-------------+
//!                            |
//!              +-------------v-------------+
//!              |        classify           |
//!              +--+---------+---------+----+
//!                 |         |         |
//!          echo request  frag-needed  other
//!          (reply in     (PMTU cache  (suppress /
//!           place)        update)      count + drop)
//! ```
//!
//! Every path ends in one cleanup step that sets the device's outgoing
//! length and bumps the statistics counters; the caller sees no error
//! codes. All buffer operations are non-blocking; a failed delivery to
//! one socket abandons that copy and nothing else.
//!
//! # Assumptions
//!
//! The caller holds the network lock for the duration of the call; this
//! module performs no locking of its own beyond the queue-level guards.

use log::{trace, warn};

use crate::buffer::BufPool;
use crate::checksum::adjust_for_type_change;
use crate::device::NetDevice;
use crate::ipv4::{Ipv4Addr, Ipv4View, Ipv4ViewMut, IPV4_HEADER_MIN_LEN};
use crate::pmtu::PmtuCache;
use crate::socket::{IcmpConn, IcmpConnTable, RecvAddr, RECV_ADDR_LEN};
use crate::stats::IcmpCounters;

// ============================================================================
// Message Types and Layout
// ============================================================================

/// Echo reply ("pong")
pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
/// Destination unreachable
pub const ICMP_TYPE_DEST_UNREACHABLE: u8 = 3;
/// Echo request ("ping")
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;

/// Destination-unreachable code: fragmentation needed and DF set
pub const ICMP_CODE_FRAG_NEEDED: u8 = 4;

/// Fixed ICMP header length (type, code, checksum, rest-of-header).
pub const ICMP_HDR_LEN: usize = 8;

/// Offset of the embedded original IP header in an error message,
/// relative to the start of the ICMP message.
pub const INNER_IP_OFFSET: usize = ICMP_HDR_LEN;

const OFF_TYPE: usize = 0;
const OFF_CODE: usize = 1;
const OFF_CHECKSUM: usize = 2;
const OFF_IDENT: usize = 4;
const OFF_MTU_HI: usize = 4;
const OFF_MTU_LO: usize = 6;
const INNER_DST_OFFSET: usize = INNER_IP_OFFSET + 16;

// ============================================================================
// Errors and Configuration
// ============================================================================

/// Errors raised while reading an ICMP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpError {
    /// Message shorter than its advertised shape
    Truncated,
    /// Fragmentation-needed notification with a non-positive MTU
    InvalidMtu,
}

/// Delivery-pipe failure for a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverError {
    /// Buffer allocation or queue append failed; nothing was queued.
    ResourceExhausted,
}

/// Input-path configuration.
#[derive(Debug, Clone, Copy)]
pub struct IcmpConfig {
    /// Maintain ICMP checksums. When false, the echo reply's checksum
    /// field is forced to zero, meaning "unchecked".
    pub verify_checksums: bool,
    /// Answer echo requests in the stack. When false, requests are only
    /// offered to listening sockets and dropped if nobody takes them.
    pub echo_reply: bool,
}

impl Default for IcmpConfig {
    fn default() -> Self {
        IcmpConfig {
            verify_checksums: true,
            echo_reply: true,
        }
    }
}

// ============================================================================
// Message View
// ============================================================================

/// Immutable overlay on the ICMP portion of the receive buffer.
///
/// Borrowed from the device buffer for the duration of one input call;
/// anything that outlives the call is copied into a delivery chain first.
#[derive(Clone, Copy)]
pub struct IcmpMessage<'a> {
    bytes: &'a [u8],
}

impl<'a> IcmpMessage<'a> {
    /// Overlay `bytes`, which must hold at least the fixed header.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, IcmpError> {
        if bytes.len() < ICMP_HDR_LEN {
            return Err(IcmpError::Truncated);
        }
        Ok(IcmpMessage { bytes })
    }

    /// Message type.
    #[inline]
    pub fn ty(&self) -> u8 {
        self.bytes[OFF_TYPE]
    }

    /// Message code.
    #[inline]
    pub fn code(&self) -> u8 {
        self.bytes[OFF_CODE]
    }

    /// Stored checksum.
    #[inline]
    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.bytes[OFF_CHECKSUM], self.bytes[OFF_CHECKSUM + 1]])
    }

    /// Echo identifier. Only meaningful for echo request/reply.
    #[inline]
    pub fn ident(&self) -> u16 {
        u16::from_be_bytes([self.bytes[OFF_IDENT], self.bytes[OFF_IDENT + 1]])
    }

    /// Bytes following the fixed header (echo data, or the embedded
    /// original IP header for error messages).
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[ICMP_HDR_LEN..]
    }

    /// Read a fragmentation-needed notification: the advertised next-hop
    /// MTU and the destination named by the embedded original header.
    ///
    /// The MTU spans both rest-of-header words, so a notification that
    /// abuses the reserved high word comes out non-positive and is
    /// rejected as malformed, as is a message too short to contain the
    /// inner destination address.
    pub fn frag_needed(&self) -> Result<(Ipv4Addr, i32), IcmpError> {
        let hi = u16::from_be_bytes([self.bytes[OFF_MTU_HI], self.bytes[OFF_MTU_HI + 1]]);
        let lo = u16::from_be_bytes([self.bytes[OFF_MTU_LO], self.bytes[OFF_MTU_LO + 1]]);
        let mtu = (((hi as u32) << 16) | lo as u32) as i32;
        if mtu <= 0 {
            return Err(IcmpError::InvalidMtu);
        }

        if self.bytes.len() < INNER_DST_OFFSET + 4 {
            return Err(IcmpError::Truncated);
        }
        let dst = Ipv4Addr([
            self.bytes[INNER_DST_OFFSET],
            self.bytes[INNER_DST_OFFSET + 1],
            self.bytes[INNER_DST_OFFSET + 2],
            self.bytes[INNER_DST_OFFSET + 3],
        ]);

        Ok((dst, mtu))
    }
}

// ============================================================================
// Listener Filtering
// ============================================================================

/// Type-mask check: bit `ty` accepts type `ty`; types 32 and above are
/// never filtered out.
pub fn filter_accepts(filter: u32, ty: u8) -> bool {
    if ty < 32 {
        (1u32 << ty) & filter != 0
    } else {
        true
    }
}

/// Full acceptance test for one connection: the type mask, plus the
/// echo-reply correlation rule (identifier and device must both match, so
/// a reply only reaches the socket that sent the request).
fn conn_accepts(conn: &IcmpConn, dev: &NetDevice, ty: u8, ident: u16) -> bool {
    if !filter_accepts(conn.filter(), ty) {
        return false;
    }

    if ty == ICMP_TYPE_ECHO_REPLY {
        let meta = conn.meta();
        return meta.echo_id == ident && meta.bound_device == Some(dev.index());
    }

    true
}

// ============================================================================
// Delivery Pipe
// ============================================================================

/// Copy the current message into `conn`'s read-ahead queue.
///
/// All-or-nothing: on any failure the chain is freed and the queue is left
/// untouched. Returns the number of payload bytes buffered.
fn deliver_to_conn(dev: &NetDevice, conn: &IcmpConn, pool: &BufPool) -> Result<usize, DeliverError> {
    let mut buf = match pool.try_alloc() {
        Some(buf) => buf,
        None => return Err(DeliverError::ResourceExhausted),
    };

    // Copy the whole message from the receive buffer, without blocking
    // and without touching the source.
    let packet = dev.data();
    match buf.push_tail(packet.len()) {
        Some(region) => region.copy_from_slice(packet),
        None => {
            pool.free(buf);
            return Err(DeliverError::ResourceExhausted);
        }
    }

    // Prepend the source-address record so it sits at the front of the
    // chain and payload bytes follow without overlap.
    let src = Ipv4View::new(packet)
        .map(|ip| ip.src())
        .unwrap_or(Ipv4Addr::UNSPECIFIED);
    match buf.push_head(RECV_ADDR_LEN) {
        Some(region) => region.copy_from_slice(&RecvAddr::new(src).encode()),
        None => {
            pool.free(buf);
            return Err(DeliverError::ResourceExhausted);
        }
    }

    let buflen = packet.len();
    match conn.try_queue(buf) {
        Ok(()) => Ok(buflen),
        Err(buf) => {
            pool.free(buf);
            Err(DeliverError::ResourceExhausted)
        }
    }
}

/// Offer the message to every listening connection.
///
/// Returns whether at least one connection accepted it. Acceptance is the
/// filter decision; a connection that accepts but cannot buffer (pool or
/// queue exhausted) still counts as having taken the message, and the
/// remaining connections are still offered their copy.
fn deliver(dev: &NetDevice, conns: &IcmpConnTable, pool: &BufPool, iphdrlen: usize) -> bool {
    let (ty, ident) = match IcmpMessage::parse(&dev.data()[iphdrlen..]) {
        Ok(msg) => (msg.ty(), msg.ident()),
        Err(_) => return false,
    };

    let mut delivered = false;
    conns.for_each(|conn| {
        if !conn_accepts(conn, dev, ty, ident) {
            return;
        }

        delivered = true;
        match deliver_to_conn(dev, conn, pool) {
            Ok(buflen) => trace!("icmp: buffered {} bytes for conn {}", buflen, conn.id()),
            Err(DeliverError::ResourceExhausted) => {
                warn!("icmp: delivery to conn {} abandoned: no buffers", conn.id());
            }
        }
    });

    delivered
}

// ============================================================================
// Classification
// ============================================================================

/// What the input path decided to do with the message. Consumed by a
/// single cleanup step that sets the outgoing length and the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// The buffer now holds an echo reply; leave the length for transmit.
    Reply,
    /// Handled (PMTU update or delivered to a socket); nothing to send.
    SendNothing,
    /// Unrecognized or malformed; counted as a type error.
    TypeError,
    /// Undeliverable echo request with stack replies disabled.
    Drop,
}

/// Classify the message and apply its protocol-level side effects.
fn classify(
    dev: &mut NetDevice,
    iphdrlen: usize,
    delivered: bool,
    pmtu: &mut PmtuCache,
    config: &IcmpConfig,
) -> Disposition {
    let (ty, code, frag) = {
        let msg = match IcmpMessage::parse(&dev.data()[iphdrlen..]) {
            Ok(msg) => msg,
            Err(_) => return Disposition::TypeError,
        };
        let ty = msg.ty();
        let code = msg.code();
        let frag = (ty == ICMP_TYPE_DEST_UNREACHABLE && code == ICMP_CODE_FRAG_NEEDED)
            .then(|| msg.frag_needed());
        (ty, code, frag)
    };

    match ty {
        ICMP_TYPE_ECHO_REQUEST if config.echo_reply => {
            turn_echo_reply(dev, iphdrlen, config);
            Disposition::Reply
        }
        ICMP_TYPE_DEST_UNREACHABLE if code == ICMP_CODE_FRAG_NEEDED => match frag {
            Some(Ok((dest, mtu))) => {
                pmtu.insert_or_update(dest, mtu);
                Disposition::SendNothing
            }
            // Non-positive MTU or truncated inner header: malformed
            _ => Disposition::TypeError,
        },
        _ if delivered => Disposition::SendNothing,
        ICMP_TYPE_ECHO_REQUEST => Disposition::Drop,
        _ => {
            warn!("icmp: unknown message type: {}", ty);
            Disposition::TypeError
        }
    }
}

/// Rewrite the echo request in the device buffer into its reply.
///
/// Only the type byte, the two addresses and the checksum change; the
/// identifier, sequence and data go back exactly as they came.
fn turn_echo_reply(dev: &mut NetDevice, iphdrlen: usize, config: &IcmpConfig) {
    let dev_addr = dev.ipaddr();
    let buf = dev.data_mut();

    buf[iphdrlen + OFF_TYPE] = ICMP_TYPE_ECHO_REPLY;

    // Return to sender, sourced from this device's own address.
    if let Some(mut ip) = Ipv4ViewMut::new(buf) {
        let requester = ip.src();
        ip.set_dst(requester);
        ip.set_src(dev_addr);
    }

    // Only the type byte changed; adjust the checksum for that one word
    // instead of resumming the whole message.
    let off = iphdrlen + OFF_CHECKSUM;
    if config.verify_checksums {
        let old = u16::from_be_bytes([buf[off], buf[off + 1]]);
        let new = adjust_for_type_change(old, (ICMP_TYPE_ECHO_REQUEST as u16) << 8);
        buf[off..off + 2].copy_from_slice(&new.to_be_bytes());
    } else {
        buf[off] = 0;
        buf[off + 1] = 0;
    }
}

/// Apply the decided outcome: outgoing length and counters.
///
/// A type error also counts as a drop; a plain drop counts only itself.
fn finish(dev: &mut NetDevice, disposition: Disposition, stats: &dyn IcmpCounters) {
    match disposition {
        Disposition::Reply => {
            trace!("icmp: outgoing reply length: {}", dev.len());
            stats.inc_sent();
        }
        Disposition::SendNothing => {
            dev.set_len(0);
        }
        Disposition::TypeError => {
            stats.inc_type_errors();
            stats.inc_drops();
            dev.set_len(0);
        }
        Disposition::Drop => {
            stats.inc_drops();
            dev.set_len(0);
        }
    }
}

// ============================================================================
// Input Dispatch
// ============================================================================

/// Handle an inbound ICMP message sitting in `dev`'s receive buffer.
///
/// The datagram has already passed IP-level validation; `dev.len()` covers
/// the IPv4 header and the ICMP message. On return, `dev.len()` is either
/// unchanged (the buffer holds an echo reply for the caller to transmit)
/// or zero (nothing to send). Failures are not reported to the caller;
/// they are observable through `stats` and the sockets' queues.
///
/// # Assumptions
///
/// The network is locked.
pub fn icmp_input(
    dev: &mut NetDevice,
    conns: &IcmpConnTable,
    pool: &BufPool,
    pmtu: &mut PmtuCache,
    stats: &dyn IcmpCounters,
    config: &IcmpConfig,
) {
    stats.inc_recv();

    // Construct the header views once; a datagram too short for an ICMP
    // header cannot be classified at all.
    let iphdrlen = match Ipv4View::new(dev.data()) {
        Some(ip) => ip.header_len(),
        None => {
            finish(dev, Disposition::TypeError, stats);
            return;
        }
    };
    if iphdrlen < IPV4_HEADER_MIN_LEN || dev.len() < iphdrlen + ICMP_HDR_LEN {
        finish(dev, Disposition::TypeError, stats);
        return;
    }

    // Offer the message to listening sockets before classification; the
    // delivered flag decides the fate of otherwise-unhandled types.
    let delivered = deliver(dev, conns, pool, iphdrlen);

    let disposition = classify(dev, iphdrlen, delivered, pmtu, config);
    finish(dev, disposition, stats);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufPool;
    use crate::checksum::checksum;
    use crate::socket::MAX_READAHEAD_QUEUE;
    use crate::stats::IcmpStats;
    use alloc::vec::Vec;

    const DEV_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);
    const PEER_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);

    fn ipv4_header(ihl: u8, payload_len: usize, src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
        let header_len = (ihl as usize) * 4;
        let mut hdr = alloc::vec![0u8; header_len];
        hdr[0] = 0x40 | ihl;
        hdr[2..4].copy_from_slice(&((header_len + payload_len) as u16).to_be_bytes());
        hdr[8] = 64; // TTL
        hdr[9] = 1; // protocol: ICMP
        hdr[12..16].copy_from_slice(&src.octets());
        hdr[16..20].copy_from_slice(&dst.octets());
        hdr
    }

    fn icmp_message(ty: u8, code: u8, rest: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut msg = alloc::vec![ty, code, 0, 0];
        msg.extend_from_slice(&rest);
        msg.extend_from_slice(payload);
        let csum = checksum(&msg);
        msg[2..4].copy_from_slice(&csum.to_be_bytes());
        msg
    }

    fn build_packet(ihl: u8, src: Ipv4Addr, dst: Ipv4Addr, icmp: &[u8]) -> Vec<u8> {
        let mut pkt = ipv4_header(ihl, icmp.len(), src, dst);
        pkt.extend_from_slice(icmp);
        pkt
    }

    fn echo_request(ident: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut rest = [0u8; 4];
        rest[0..2].copy_from_slice(&ident.to_be_bytes());
        rest[2..4].copy_from_slice(&seq.to_be_bytes());
        build_packet(5, PEER_ADDR, DEV_ADDR, &icmp_message(ICMP_TYPE_ECHO_REQUEST, 0, rest, payload))
    }

    fn echo_reply_packet(ident: u16) -> Vec<u8> {
        let mut rest = [0u8; 4];
        rest[0..2].copy_from_slice(&ident.to_be_bytes());
        build_packet(5, PEER_ADDR, DEV_ADDR, &icmp_message(ICMP_TYPE_ECHO_REPLY, 0, rest, b""))
    }

    fn frag_needed(inner_dst: Ipv4Addr, mtu: u32) -> Vec<u8> {
        let mut rest = [0u8; 4];
        rest[0..2].copy_from_slice(&((mtu >> 16) as u16).to_be_bytes());
        rest[2..4].copy_from_slice(&(mtu as u16).to_be_bytes());
        // Embedded original header: the packet that was too big
        let inner = ipv4_header(5, 8, DEV_ADDR, inner_dst);
        build_packet(
            5,
            PEER_ADDR,
            DEV_ADDR,
            &icmp_message(ICMP_TYPE_DEST_UNREACHABLE, ICMP_CODE_FRAG_NEEDED, rest, &inner),
        )
    }

    struct Harness {
        dev: NetDevice,
        conns: IcmpConnTable,
        pool: BufPool,
        pmtu: PmtuCache,
        stats: IcmpStats,
        config: IcmpConfig,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                dev: NetDevice::new(0, DEV_ADDR, 2048),
                conns: IcmpConnTable::new(),
                pool: BufPool::new(32),
                pmtu: PmtuCache::new(),
                stats: IcmpStats::new(),
                config: IcmpConfig::default(),
            }
        }

        fn input(&mut self, packet: &[u8]) {
            assert!(self.dev.receive(packet));
            icmp_input(
                &mut self.dev,
                &self.conns,
                &self.pool,
                &mut self.pmtu,
                &self.stats,
                &self.config,
            );
        }
    }

    #[test]
    fn test_echo_request_becomes_reply() {
        let mut h = Harness::new();
        let request = echo_request(7, 1, b"AB");
        h.input(&request);

        // Outgoing length equals inbound length
        assert_eq!(h.dev.len(), request.len());

        let reply = h.dev.data();
        let ip = Ipv4View::new(reply).unwrap();
        assert_eq!(ip.src(), DEV_ADDR);
        assert_eq!(ip.dst(), PEER_ADDR);

        let msg = IcmpMessage::parse(&reply[20..]).unwrap();
        assert_eq!(msg.ty(), ICMP_TYPE_ECHO_REPLY);
        assert_eq!(msg.code(), 0);
        assert_eq!(msg.ident(), 7);
        assert_eq!(msg.payload(), b"AB");

        // Adjusted checksum must equal a full resum of the reply
        let mut resum = reply[20..].to_vec();
        resum[2] = 0;
        resum[3] = 0;
        assert_eq!(msg.checksum(), checksum(&resum));

        let snap = h.stats.snapshot();
        assert_eq!(snap.recv, 1);
        assert_eq!(snap.sent, 1);
        assert_eq!(snap.type_errors, 0);
        assert_eq!(snap.drops, 0);
    }

    #[test]
    fn test_echo_request_with_ip_options() {
        let mut h = Harness::new();
        let mut rest = [0u8; 4];
        rest[0..2].copy_from_slice(&3u16.to_be_bytes());
        let request = build_packet(
            6, // 24-byte header, one option word
            PEER_ADDR,
            DEV_ADDR,
            &icmp_message(ICMP_TYPE_ECHO_REQUEST, 0, rest, b"opt"),
        );
        h.input(&request);

        assert_eq!(h.dev.len(), request.len());
        let reply = h.dev.data();
        let msg = IcmpMessage::parse(&reply[24..]).unwrap();
        assert_eq!(msg.ty(), ICMP_TYPE_ECHO_REPLY);
        assert_eq!(msg.payload(), b"opt");

        let mut resum = reply[24..].to_vec();
        resum[2] = 0;
        resum[3] = 0;
        assert_eq!(msg.checksum(), checksum(&resum));
    }

    #[test]
    fn test_echo_reply_checksum_forced_zero_when_disabled() {
        let mut h = Harness::new();
        h.config.verify_checksums = false;
        h.input(&echo_request(1, 1, b"data"));

        let reply = h.dev.data();
        assert_eq!(IcmpMessage::parse(&reply[20..]).unwrap().checksum(), 0);
    }

    #[test]
    fn test_frag_needed_updates_pmtu_cache() {
        let mut h = Harness::new();
        let inner_dst = Ipv4Addr::new(198, 51, 100, 9);
        h.input(&frag_needed(inner_dst, 1400));

        // No reply; exactly one entry for the inner destination
        assert_eq!(h.dev.len(), 0);
        assert_eq!(h.pmtu.len(), 1);
        assert_eq!(h.pmtu.find(inner_dst).unwrap().pmtu, 1400);

        // A second notification overwrites without growing the table
        h.input(&frag_needed(inner_dst, 1200));
        assert_eq!(h.pmtu.len(), 1);
        assert_eq!(h.pmtu.find(inner_dst).unwrap().pmtu, 1200);

        let snap = h.stats.snapshot();
        assert_eq!(snap.recv, 2);
        assert_eq!(snap.type_errors, 0);
        assert_eq!(snap.sent, 0);
    }

    #[test]
    fn test_frag_needed_zero_mtu_is_malformed() {
        let mut h = Harness::new();
        h.input(&frag_needed(Ipv4Addr::new(198, 51, 100, 9), 0));

        assert_eq!(h.dev.len(), 0);
        assert!(h.pmtu.is_empty());
        let snap = h.stats.snapshot();
        assert_eq!(snap.type_errors, 1);
        assert_eq!(snap.drops, 1);
    }

    #[test]
    fn test_frag_needed_negative_mtu_is_malformed() {
        let mut h = Harness::new();
        // High bit set across the two rest-of-header words
        h.input(&frag_needed(Ipv4Addr::new(198, 51, 100, 9), 0x8000_0000));

        assert!(h.pmtu.is_empty());
        assert_eq!(h.stats.snapshot().type_errors, 1);
    }

    #[test]
    fn test_frag_needed_truncated_inner_header() {
        let mut h = Harness::new();
        let mut rest = [0u8; 4];
        rest[2..4].copy_from_slice(&1400u16.to_be_bytes());
        // Only 4 bytes of embedded header: the inner destination is missing
        let pkt = build_packet(
            5,
            PEER_ADDR,
            DEV_ADDR,
            &icmp_message(ICMP_TYPE_DEST_UNREACHABLE, ICMP_CODE_FRAG_NEEDED, rest, &[0u8; 4]),
        );
        h.input(&pkt);

        assert!(h.pmtu.is_empty());
        assert_eq!(h.stats.snapshot().type_errors, 1);
    }

    #[test]
    fn test_unknown_type_is_counted_and_dropped() {
        let mut h = Harness::new();
        let pkt = build_packet(5, PEER_ADDR, DEV_ADDR, &icmp_message(42, 0, [0; 4], b""));
        h.input(&pkt);

        assert_eq!(h.dev.len(), 0);
        let snap = h.stats.snapshot();
        assert_eq!(snap.type_errors, 1);
        assert_eq!(snap.drops, 1);
    }

    #[test]
    fn test_truncated_message_is_type_error() {
        let mut h = Harness::new();
        // IP header plus only 4 ICMP bytes
        let mut pkt = ipv4_header(5, 4, PEER_ADDR, DEV_ADDR);
        pkt.extend_from_slice(&[8, 0, 0, 0]);
        h.input(&pkt);

        assert_eq!(h.dev.len(), 0);
        assert_eq!(h.stats.snapshot().type_errors, 1);
    }

    #[test]
    fn test_delivery_suppresses_unknown_type_error() {
        let mut h = Harness::new();
        let conn = h.conns.register();
        let pkt = build_packet(5, PEER_ADDR, DEV_ADDR, &icmp_message(42, 0, [0; 4], b"xyz"));
        h.input(&pkt);

        // Delivered, so no error counted and nothing sent
        assert_eq!(h.dev.len(), 0);
        let snap = h.stats.snapshot();
        assert_eq!(snap.type_errors, 0);
        assert_eq!(snap.drops, 0);

        // The queued copy carries the source address and the whole message
        let (addr, payload) = conn.recvfrom(&h.pool).unwrap();
        assert_eq!(addr.addr, PEER_ADDR);
        assert_eq!(addr.port, 0);
        assert_eq!(payload, pkt);
        assert_eq!(h.pool.available(), h.pool.total());
    }

    #[test]
    fn test_filter_bit_gates_delivery() {
        let mut h = Harness::new();
        let blocked = h.conns.register();
        blocked.set_filter(0);
        let open = h.conns.register();
        open.set_filter(1 << 13);

        let pkt = build_packet(5, PEER_ADDR, DEV_ADDR, &icmp_message(13, 0, [0; 4], b""));
        h.input(&pkt);

        assert_eq!(blocked.readahead_len(), 0);
        assert_eq!(open.readahead_len(), 1);

        // Exactly one delivery per matching inbound message
        h.input(&pkt);
        assert_eq!(open.readahead_len(), 2);
    }

    #[test]
    fn test_high_types_bypass_filter() {
        let mut h = Harness::new();
        let conn = h.conns.register();
        conn.set_filter(0); // blocks every maskable type

        let pkt = build_packet(5, PEER_ADDR, DEV_ADDR, &icmp_message(200, 0, [0; 4], b""));
        h.input(&pkt);

        assert_eq!(conn.readahead_len(), 1);
    }

    #[test]
    fn test_echo_reply_requires_id_and_device_match() {
        let mut h = Harness::new();

        let matching = h.conns.register();
        matching.set_echo_id(7);
        matching.bind_device(Some(0));

        let wrong_id = h.conns.register();
        wrong_id.set_echo_id(8);
        wrong_id.bind_device(Some(0));

        let wrong_dev = h.conns.register();
        wrong_dev.set_echo_id(7);
        wrong_dev.bind_device(Some(3));

        let unbound = h.conns.register();
        unbound.set_echo_id(7);

        h.input(&echo_reply_packet(7));

        assert_eq!(matching.readahead_len(), 1);
        assert_eq!(wrong_id.readahead_len(), 0);
        assert_eq!(wrong_dev.readahead_len(), 0);
        assert_eq!(unbound.readahead_len(), 0);

        // Delivered to one connection, so the reply is suppressed silently
        assert_eq!(h.dev.len(), 0);
        assert_eq!(h.stats.snapshot().type_errors, 0);
    }

    #[test]
    fn test_undelivered_echo_reply_is_type_error() {
        let mut h = Harness::new();
        h.input(&echo_reply_packet(7));

        assert_eq!(h.dev.len(), 0);
        assert_eq!(h.stats.snapshot().type_errors, 1);
    }

    #[test]
    fn test_delivery_is_all_or_nothing_on_pool_exhaustion() {
        let mut h = Harness::new();
        h.pool = BufPool::new(0); // allocation always fails
        let conn = h.conns.register();

        let pkt = build_packet(5, PEER_ADDR, DEV_ADDR, &icmp_message(42, 0, [0; 4], b""));
        h.input(&pkt);

        // Nothing queued, but the connection did accept the message, so
        // the unknown type is still suppressed rather than counted.
        assert_eq!(conn.readahead_len(), 0);
        assert_eq!(h.dev.len(), 0);
        assert_eq!(h.stats.snapshot().type_errors, 0);
    }

    #[test]
    fn test_delivery_queue_overflow_frees_chain() {
        let mut h = Harness::new();
        let conn = h.conns.register();

        let pkt = build_packet(5, PEER_ADDR, DEV_ADDR, &icmp_message(42, 0, [0; 4], b""));
        for _ in 0..MAX_READAHEAD_QUEUE {
            h.input(&pkt);
        }
        assert_eq!(conn.readahead_len(), MAX_READAHEAD_QUEUE);
        let available_before = h.pool.available();

        h.input(&pkt);

        // Queue unchanged and the abandoned chain went back to the pool
        assert_eq!(conn.readahead_len(), MAX_READAHEAD_QUEUE);
        assert_eq!(h.pool.available(), available_before);
        assert_eq!(conn.stats().rx_dropped, 1);
    }

    #[test]
    fn test_echo_request_still_replies_when_delivered() {
        let mut h = Harness::new();
        let conn = h.conns.register();

        let request = echo_request(9, 1, b"ping");
        h.input(&request);

        // The listener got its copy of the original request...
        let (_, payload) = conn.recvfrom(&h.pool).unwrap();
        assert_eq!(payload, request);

        // ...and the stack still answered it
        assert_eq!(h.dev.len(), request.len());
        assert_eq!(
            IcmpMessage::parse(&h.dev.data()[20..]).unwrap().ty(),
            ICMP_TYPE_ECHO_REPLY
        );
        assert_eq!(h.stats.snapshot().sent, 1);
    }

    #[test]
    fn test_echo_request_dropped_when_replies_disabled() {
        let mut h = Harness::new();
        h.config.echo_reply = false;

        h.input(&echo_request(9, 1, b"ping"));
        assert_eq!(h.dev.len(), 0);
        let snap = h.stats.snapshot();
        assert_eq!(snap.sent, 0);
        assert_eq!(snap.type_errors, 0);
        assert_eq!(snap.drops, 1);

        // With a listener, the request is delivered instead of dropped
        let conn = h.conns.register();
        h.input(&echo_request(9, 2, b"ping"));
        assert_eq!(conn.readahead_len(), 1);
        assert_eq!(h.stats.snapshot().drops, 1);
        assert_eq!(h.dev.len(), 0);
    }

    #[test]
    fn test_multiple_listeners_each_get_a_copy() {
        let mut h = Harness::new();
        let a = h.conns.register();
        let b = h.conns.register();

        let pkt = build_packet(5, PEER_ADDR, DEV_ADDR, &icmp_message(42, 0, [0; 4], b"1"));
        h.input(&pkt);

        assert_eq!(a.readahead_len(), 1);
        assert_eq!(b.readahead_len(), 1);
        assert_eq!(h.pool.in_use(), 2);
    }

    #[test]
    fn test_inner_destination_offset() {
        // The inner destination sits one full ICMP header plus 16 bytes in
        let inner_dst = Ipv4Addr::new(203, 0, 113, 5);
        let pkt = frag_needed(inner_dst, 1280);
        let msg = IcmpMessage::parse(&pkt[20..]).unwrap();
        let (dst, mtu) = msg.frag_needed().unwrap();
        assert_eq!(dst, inner_dst);
        assert_eq!(mtu, 1280);
        assert_eq!(&pkt[20 + INNER_DST_OFFSET..20 + INNER_DST_OFFSET + 4], &inner_dst.octets());
    }
}
