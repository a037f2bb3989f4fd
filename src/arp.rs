//! ARP (Address Resolution Protocol) - RFC 826
//!
//! Maps IPv4 addresses to link addresses. Results are cached with a
//! 12-hour lifetime checked lazily on lookup; entries are never actively
//! evicted. An outbound IP packet whose next hop is unresolved is parked in
//! a one-slot-per-address pending queue while a request goes out, and is
//! flushed to the link the moment the reply lands. A second send to the same
//! unresolved address supersedes the parked packet (last write wins), whose
//! buffer is released on the spot.
//!
//! Packet format, after the Ethernet header:
//! [HW Type (2)][Proto Type (2)][HW Len (1)][Proto Len (1)][Opcode (2)]
//! [Sender MAC (6)][Sender IP (4)][Target MAC (6)][Target IP (4)]

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::cell::{Cell, RefCell};
use core::net::Ipv4Addr;

use log::{debug, trace, warn};
use spin::Mutex;

use crate::error::ErrorKind;
use crate::ethernet::{EthernetFrame, MacAddr, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use crate::ipv4::Ipv4Packet;
use crate::packet::PacketBuffer;

pub const HW_TYPE_ETHERNET: u16 = 0x0001;
pub const PROTO_TYPE_IPV4: u16 = 0x0800;
pub const HLEN_PLEN: [u8; 2] = [6, 4];

pub const OP_REQUEST: u16 = 1;
pub const OP_REPLY: u16 = 2;

/// ARP payload length, after the Ethernet header.
pub const PACKET_LEN: u16 = 28;

/// Cache entries older than this are treated as absent.
pub const CACHE_EXPIRY_SECS: u64 = 60 * 60 * 12;

/// Zero-copy view of a buffer as an ARP packet, bound at the cursor.
pub struct ArpPacket<'a> {
    buf: &'a mut PacketBuffer,
    offset: u16,
}

impl<'a> ArpPacket<'a> {
    pub fn new(buf: &'a mut PacketBuffer) -> Result<Self, ErrorKind> {
        let offset = buf.payload_offset();
        if offset as usize + PACKET_LEN as usize > buf.size() as usize {
            return Err(ErrorKind::CapacityExceeded);
        }
        Ok(Self { buf, offset })
    }

    /// Stamp the fixed preamble: Ethernet hardware, IPv4 protocol, 6/4
    /// address lengths.
    pub fn init(&mut self) {
        self.set_u16(0, HW_TYPE_ETHERNET);
        self.set_u16(2, PROTO_TYPE_IPV4);
        let i = (self.offset + 4) as usize;
        self.buf.data_mut()[i..i + 2].copy_from_slice(&HLEN_PLEN);
    }

    /// Whether the preamble declares Ethernet/IPv4 with 6/4 lengths.
    pub fn is_well_formed(&self) -> bool {
        let i = (self.offset + 4) as usize;
        self.get_u16(0) == HW_TYPE_ETHERNET
            && self.get_u16(2) == PROTO_TYPE_IPV4
            && self.buf.data()[i..i + 2] == HLEN_PLEN
    }

    fn get_u16(&self, at: u16) -> u16 {
        let i = (self.offset + at) as usize;
        let b = self.buf.data();
        u16::from_be_bytes([b[i], b[i + 1]])
    }

    fn set_u16(&mut self, at: u16, v: u16) {
        let i = (self.offset + at) as usize;
        self.buf.data_mut()[i..i + 2].copy_from_slice(&v.to_be_bytes());
    }

    fn get_mac(&self, at: u16) -> MacAddr {
        let i = (self.offset + at) as usize;
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.buf.data()[i..i + 6]);
        MacAddr(mac)
    }

    fn set_mac(&mut self, at: u16, mac: MacAddr) {
        let i = (self.offset + at) as usize;
        self.buf.data_mut()[i..i + 6].copy_from_slice(&mac.0);
    }

    fn get_ip(&self, at: u16) -> Ipv4Addr {
        let i = (self.offset + at) as usize;
        let b = self.buf.data();
        Ipv4Addr::new(b[i], b[i + 1], b[i + 2], b[i + 3])
    }

    fn set_ip(&mut self, at: u16, ip: Ipv4Addr) {
        let i = (self.offset + at) as usize;
        self.buf.data_mut()[i..i + 4].copy_from_slice(&ip.octets());
    }

    pub fn opcode(&self) -> u16 {
        self.get_u16(6)
    }

    pub fn set_opcode(&mut self, op: u16) {
        self.set_u16(6, op);
    }

    pub fn sender_mac(&self) -> MacAddr {
        self.get_mac(8)
    }

    pub fn set_sender_mac(&mut self, mac: MacAddr) {
        self.set_mac(8, mac);
    }

    pub fn sender_ip(&self) -> Ipv4Addr {
        self.get_ip(14)
    }

    pub fn set_sender_ip(&mut self, ip: Ipv4Addr) {
        self.set_ip(14, ip);
    }

    pub fn target_mac(&self) -> MacAddr {
        self.get_mac(18)
    }

    pub fn set_target_mac(&mut self, mac: MacAddr) {
        self.set_mac(18, mac);
    }

    pub fn target_ip(&self) -> Ipv4Addr {
        self.get_ip(24)
    }

    pub fn set_target_ip(&mut self, ip: Ipv4Addr) {
        self.set_ip(24, ip);
    }
}

struct CacheEntry {
    mac: MacAddr,
    timestamp: u64,
}

/// IP-to-MAC cache with lazy expiry.
pub struct ArpCache {
    entries: Mutex<BTreeMap<Ipv4Addr, CacheEntry>>,
}

impl ArpCache {
    pub const fn new() -> Self {
        Self { entries: Mutex::new(BTreeMap::new()) }
    }

    pub fn insert(&self, ip: Ipv4Addr, mac: MacAddr, now: u64) {
        self.entries.lock().insert(ip, CacheEntry { mac, timestamp: now });
    }

    /// Fresh mapping for `ip`, or `None` when absent or expired.
    pub fn lookup(&self, ip: Ipv4Addr, now: u64) -> Option<MacAddr> {
        let entries = self.entries.lock();
        let entry = entries.get(&ip)?;
        if now.saturating_sub(entry.timestamp) > CACHE_EXPIRY_SECS {
            return None;
        }
        Some(entry.mac)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for ArpCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Pluggable resolution strategy. Both variants honor the same cache and
/// pending-queue contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolver {
    /// Broadcast an ARP request and park the packet until the reply.
    Broadcast,
    /// Derive the MAC deterministically from the IPv4 address, the scheme
    /// used on lab networks with administratively assigned addresses.
    /// Resolution completes synchronously.
    StaticMap,
}

impl Resolver {
    fn static_map(ip: Ipv4Addr) -> MacAddr {
        let o = ip.octets();
        // locally administered prefix + the address octets
        MacAddr([0x02, 0x00, o[0], o[1], o[2], o[3]])
    }
}

pub type LinkDownstream = Box<dyn FnMut(PacketBuffer, MacAddr, u16)>;
pub type FrameSource = Box<dyn FnMut() -> Result<PacketBuffer, ErrorKind>>;

/// The ARP resolver: cache, pending-resolution queue, request/reply engine.
pub struct Arp {
    mac: MacAddr,
    ip: Ipv4Addr,
    cache: ArpCache,
    /// At most one parked packet per unresolved address.
    waiting: RefCell<BTreeMap<Ipv4Addr, PacketBuffer>>,
    link_downstream: RefCell<Option<LinkDownstream>>,
    frame_source: RefCell<Option<FrameSource>>,
    resolver: Cell<Resolver>,
    clock: Box<dyn Fn() -> u64>,
    requests_rx: Cell<u64>,
    requests_tx: Cell<u64>,
    replies_rx: Cell<u64>,
    replies_tx: Cell<u64>,
    dropped: Cell<u64>,
}

impl Arp {
    pub fn new(mac: MacAddr, ip: Ipv4Addr, clock: impl Fn() -> u64 + 'static) -> Self {
        Self {
            mac,
            ip,
            cache: ArpCache::new(),
            waiting: RefCell::new(BTreeMap::new()),
            link_downstream: RefCell::new(None),
            frame_source: RefCell::new(None),
            resolver: Cell::new(Resolver::Broadcast),
            clock: Box::new(clock),
            requests_rx: Cell::new(0),
            requests_tx: Cell::new(0),
            replies_rx: Cell::new(0),
            replies_tx: Cell::new(0),
            dropped: Cell::new(0),
        }
    }

    /// Link output: (frame buffer, destination MAC, ethertype).
    pub fn set_link_downstream(&self, handler: impl FnMut(PacketBuffer, MacAddr, u16) + 'static) {
        *self.link_downstream.borrow_mut() = Some(Box::new(handler));
    }

    pub fn set_frame_source(&self, source: impl FnMut() -> Result<PacketBuffer, ErrorKind> + 'static) {
        *self.frame_source.borrow_mut() = Some(Box::new(source));
    }

    pub fn set_resolver(&self, resolver: Resolver) {
        self.resolver.set(resolver);
    }

    pub fn cache(&self) -> &ArpCache {
        &self.cache
    }

    /// Whether a fresh (unexpired) mapping for `ip` is cached.
    pub fn is_valid_cached(&self, ip: Ipv4Addr) -> bool {
        self.cache.lookup(ip, (self.clock)()).is_some()
    }

    /// Handle an inbound ARP packet, cursor at the ARP header.
    pub fn receive(&self, mut buf: PacketBuffer) {
        let (opcode, sender_mac, sender_ip, target_ip) = {
            let pkt = match ArpPacket::new(&mut buf) {
                Ok(pkt) if pkt.is_well_formed() => pkt,
                _ => {
                    trace!("arp: dropping malformed packet");
                    self.dropped.set(self.dropped.get() + 1);
                    return;
                }
            };
            (pkt.opcode(), pkt.sender_mac(), pkt.sender_ip(), pkt.target_ip())
        };
        drop(buf);

        match opcode {
            OP_REPLY => {
                self.replies_rx.set(self.replies_rx.get() + 1);
                debug!("arp: {} is at {}", sender_ip, sender_mac);
                self.cache.insert(sender_ip, sender_mac, (self.clock)());
                self.flush_waiting(sender_ip, sender_mac);
            }
            OP_REQUEST => {
                self.requests_rx.set(self.requests_rx.get() + 1);
                if target_ip == self.ip {
                    self.cache.insert(sender_ip, sender_mac, (self.clock)());
                    self.respond(sender_mac, sender_ip);
                }
            }
            other => {
                trace!("arp: unknown opcode {}", other);
                self.dropped.set(self.dropped.get() + 1);
            }
        }
    }

    /// Downstream: transmit an IP packet, resolving its next hop first.
    ///
    /// On a cache hit the packet goes straight to the link; otherwise the
    /// configured resolver strategy takes over.
    pub fn transmit(&self, mut buf: PacketBuffer) {
        let next_hop = if buf.next_hop().is_unspecified() {
            match Ipv4Packet::new(&mut buf) {
                Ok(pkt) => pkt.dst(),
                Err(_) => {
                    trace!("arp: dropping packet without destination");
                    self.dropped.set(self.dropped.get() + 1);
                    return;
                }
            }
        } else {
            buf.next_hop()
        };

        if next_hop.is_broadcast() {
            self.send_frame(buf, MacAddr::BROADCAST, ETHERTYPE_IPV4);
            return;
        }

        let now = (self.clock)();
        if let Some(mac) = self.cache.lookup(next_hop, now) {
            self.send_frame(buf, mac, ETHERTYPE_IPV4);
            return;
        }

        match self.resolver.get() {
            Resolver::StaticMap => {
                let mac = Resolver::static_map(next_hop);
                self.cache.insert(next_hop, mac, now);
                self.send_frame(buf, mac, ETHERTYPE_IPV4);
            }
            Resolver::Broadcast => {
                self.await_resolution(buf, next_hop);
                self.request(next_hop);
            }
        }
    }

    /// Park a packet until its address resolves. Last write wins: a packet
    /// already waiting for the same address is superseded and its buffer
    /// released here.
    fn await_resolution(&self, buf: PacketBuffer, addr: Ipv4Addr) {
        if let Some(superseded) = self.waiting.borrow_mut().insert(addr, buf) {
            trace!("arp: superseding packet queued for {}", addr);
            drop(superseded);
        }
    }

    fn flush_waiting(&self, addr: Ipv4Addr, mac: MacAddr) {
        let parked = self.waiting.borrow_mut().remove(&addr);
        if let Some(buf) = parked {
            self.send_frame(buf, mac, ETHERTYPE_IPV4);
        }
    }

    fn respond(&self, requester_mac: MacAddr, requester_ip: Ipv4Addr) {
        let mut buf = match self.create_packet() {
            Ok(buf) => buf,
            Err(e) => {
                warn!("arp: cannot build reply: {}", e);
                self.dropped.set(self.dropped.get() + 1);
                return;
            }
        };
        {
            // constructor cannot fail: create_packet sized the buffer
            let Ok(mut pkt) = ArpPacket::new(&mut buf) else { return };
            pkt.init();
            pkt.set_opcode(OP_REPLY);
            pkt.set_sender_mac(self.mac);
            pkt.set_sender_ip(self.ip);
            pkt.set_target_mac(requester_mac);
            pkt.set_target_ip(requester_ip);
        }
        self.replies_tx.set(self.replies_tx.get() + 1);
        self.send_frame(buf, requester_mac, ETHERTYPE_ARP);
    }

    fn request(&self, target: Ipv4Addr) {
        let mut buf = match self.create_packet() {
            Ok(buf) => buf,
            Err(e) => {
                warn!("arp: cannot build request: {}", e);
                self.dropped.set(self.dropped.get() + 1);
                return;
            }
        };
        {
            let Ok(mut pkt) = ArpPacket::new(&mut buf) else { return };
            pkt.init();
            pkt.set_opcode(OP_REQUEST);
            pkt.set_sender_mac(self.mac);
            pkt.set_sender_ip(self.ip);
            pkt.set_target_mac(MacAddr::ZERO);
            pkt.set_target_ip(target);
        }
        self.requests_tx.set(self.requests_tx.get() + 1);
        debug!("arp: who has {}?", target);
        self.send_frame(buf, MacAddr::BROADCAST, ETHERTYPE_ARP);
    }

    /// A fresh frame with room reserved for the link header and the cursor
    /// at the ARP payload.
    fn create_packet(&self) -> Result<PacketBuffer, ErrorKind> {
        let mut source = self.frame_source.borrow_mut();
        let source = source.as_mut().ok_or(ErrorKind::PoolExhausted)?;
        let mut buf = source()?;
        buf.set_size(EthernetFrame::HEADER_LEN + PACKET_LEN)?;
        buf.advance(EthernetFrame::HEADER_LEN)?;
        Ok(buf)
    }

    fn send_frame(&self, buf: PacketBuffer, dst: MacAddr, ethertype: u16) {
        match self.link_downstream.borrow_mut().as_mut() {
            Some(down) => down(buf, dst, ethertype),
            None => warn!("arp: no link downstream registered"),
        }
    }

    pub fn requests_rx(&self) -> u64 {
        self.requests_rx.get()
    }

    pub fn requests_tx(&self) -> u64 {
        self.requests_tx.get()
    }

    pub fn replies_rx(&self) -> u64 {
        self.replies_rx.get()
    }

    pub fn replies_tx(&self) -> u64 {
        self.replies_tx.get()
    }
}
