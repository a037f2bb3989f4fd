//! IPv4 layer (RFC 791)
//!
//! [`Ipv4Packet`] is a zero-copy lens over a [`PacketBuffer`] positioned at
//! the network header; [`Ip4`] is the layer itself - inbound validation and
//! protocol dispatch, outbound header finalization and hand-off to address
//! resolution.
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version|  IHL  |      TOS      |         Total Length          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Identification        |Flags|      Fragment Offset    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Time to Live |    Protocol   |         Header Checksum       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Source Address                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Destination Address                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use alloc::boxed::Box;
use core::cell::{Cell, RefCell};

use log::{trace, warn};

pub use core::net::Ipv4Addr;

use crate::checksum;
use crate::error::ErrorKind;
use crate::ethernet::Upstream;
use crate::packet::PacketBuffer;

/// IPv4 protocol numbers (IANA assigned)
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

pub const DEFAULT_TTL: u8 = 64;
pub const MIN_HEADER_LEN: u16 = 20;

/// Zero-copy view of a buffer as an IPv4 packet.
///
/// The header starts at the buffer's payload cursor. Construction fails if
/// the declared header does not lie inside the populated bytes or the
/// declared total length exceeds the buffer's capacity; receive paths treat
/// that failure as a silent drop.
pub struct Ipv4Packet<'a> {
    buf: &'a mut PacketBuffer,
    offset: u16,
    entered: bool,
}

impl<'a> Ipv4Packet<'a> {
    pub fn new(buf: &'a mut PacketBuffer) -> Result<Self, ErrorKind> {
        let offset = buf.payload_offset();
        if offset as usize + MIN_HEADER_LEN as usize > buf.size() as usize {
            return Err(ErrorKind::CapacityExceeded);
        }
        let version_ihl = buf.data()[offset as usize];
        if version_ihl >> 4 != 4 {
            return Err(ErrorKind::CapacityExceeded);
        }
        let header_len = ((version_ihl & 0x0F) as u16) * 4;
        if header_len < MIN_HEADER_LEN || offset as usize + header_len as usize > buf.size() as usize {
            return Err(ErrorKind::CapacityExceeded);
        }
        let total_length = {
            let b = buf.data();
            u16::from_be_bytes([b[offset as usize + 2], b[offset as usize + 3]])
        };
        if offset as usize + total_length as usize > buf.capacity() as usize {
            return Err(ErrorKind::CapacityExceeded);
        }
        Ok(Self { buf, offset, entered: false })
    }

    /// Start a fresh header at the cursor: version/IHL 0x45, TTL 64, all
    /// fragmentation fields zeroed, size covering exactly the header.
    pub fn init(buf: &'a mut PacketBuffer) -> Result<Self, ErrorKind> {
        let offset = buf.payload_offset();
        let end = offset.checked_add(MIN_HEADER_LEN).ok_or(ErrorKind::CapacityExceeded)?;
        buf.set_size(end)?;
        let header = &mut buf.data_mut()[offset as usize..end as usize];
        header.fill(0);
        header[0] = 0x45;
        header[8] = DEFAULT_TTL;
        Ok(Self { buf, offset, entered: false })
    }

    fn get_u8(&self, at: u16) -> u8 {
        self.buf.data()[(self.offset + at) as usize]
    }

    fn set_u8(&mut self, at: u16, v: u8) {
        self.buf.data_mut()[(self.offset + at) as usize] = v;
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

    pub fn version(&self) -> u8 {
        self.get_u8(0) >> 4
    }

    /// Header length in bytes, from the IHL field.
    pub fn header_len(&self) -> u16 {
        ((self.get_u8(0) & 0x0F) as u16) * 4
    }

    pub fn total_length(&self) -> u16 {
        self.get_u16(2)
    }

    pub fn ident(&self) -> u16 {
        self.get_u16(4)
    }

    pub fn ttl(&self) -> u8 {
        self.get_u8(8)
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.set_u8(8, ttl);
    }

    pub fn protocol(&self) -> u8 {
        self.get_u8(9)
    }

    pub fn set_protocol(&mut self, proto: u8) {
        self.set_u8(9, proto);
    }

    pub fn header_checksum(&self) -> u16 {
        self.get_u16(10)
    }

    pub fn src(&self) -> Ipv4Addr {
        let i = (self.offset + 12) as usize;
        let b = self.buf.data();
        Ipv4Addr::new(b[i], b[i + 1], b[i + 2], b[i + 3])
    }

    pub fn set_src(&mut self, addr: Ipv4Addr) {
        let i = (self.offset + 12) as usize;
        self.buf.data_mut()[i..i + 4].copy_from_slice(&addr.octets());
    }

    pub fn dst(&self) -> Ipv4Addr {
        let i = (self.offset + 16) as usize;
        let b = self.buf.data();
        Ipv4Addr::new(b[i], b[i + 1], b[i + 2], b[i + 3])
    }

    pub fn set_dst(&mut self, addr: Ipv4Addr) {
        let i = (self.offset + 16) as usize;
        self.buf.data_mut()[i..i + 4].copy_from_slice(&addr.octets());
    }

    /// Last modifications before transmission: recompute total length from
    /// the buffer (everything past the link header) and the header checksum.
    /// Call exactly once, after every header field is final.
    pub fn make_flight_ready(&mut self) {
        debug_assert!(self.protocol() != 0, "protocol must be set before transmit");
        let segment = self.buf.size() - self.offset;
        self.set_u16(2, segment);
        self.set_u16(10, 0);
        let start = self.offset as usize;
        let end = start + self.header_len() as usize;
        let sum = checksum::checksum(&self.buf.data()[start..end]);
        self.set_u16(10, sum);
    }

    /// Whether the populated header checksum is self-consistent.
    pub fn verify_checksum(&self) -> bool {
        let start = self.offset as usize;
        let end = start + self.header_len() as usize;
        checksum::verify(&self.buf.data()[start..end])
    }

    /// Advance the cursor past this header, handing the payload upstream.
    pub fn enter(&mut self) -> Result<(), ErrorKind> {
        debug_assert!(!self.entered, "enter() without an intervening leave()");
        self.buf.advance(self.header_len())?;
        self.entered = true;
        Ok(())
    }

    /// Retract the cursor back over this header.
    pub fn leave(&mut self) -> Result<(), ErrorKind> {
        debug_assert!(self.entered, "leave() without enter()");
        self.buf.retract(self.header_len())?;
        self.entered = false;
        Ok(())
    }
}

/// Static next-hop selection: local subnet or gateway. Not a routing
/// protocol - one interface, one optional default gateway.
#[derive(Debug, Clone, Copy)]
pub struct RoutingTable {
    pub local_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
}

impl RoutingTable {
    pub fn new(local_ip: Ipv4Addr, netmask: Ipv4Addr, gateway: Option<Ipv4Addr>) -> Self {
        Self { local_ip, netmask, gateway }
    }

    /// Whether `dst` is on the local subnet.
    pub fn is_local(&self, dst: Ipv4Addr) -> bool {
        let local = u32::from_be_bytes(self.local_ip.octets());
        let mask = u32::from_be_bytes(self.netmask.octets());
        let dest = u32::from_be_bytes(dst.octets());
        (local & mask) == (dest & mask)
    }

    /// Next hop for `dst`: the destination itself when local, else the
    /// gateway. `None` when off-subnet with no gateway configured.
    pub fn next_hop(&self, dst: Ipv4Addr) -> Option<Ipv4Addr> {
        if self.is_local(dst) || dst.is_broadcast() {
            Some(dst)
        } else {
            self.gateway
        }
    }

    pub fn is_our_ip(&self, ip: Ipv4Addr) -> bool {
        ip == self.local_ip || ip.is_broadcast()
    }
}

pub type Downstream = Box<dyn FnMut(PacketBuffer)>;

/// The IPv4 layer.
pub struct Ip4 {
    routing: Cell<RoutingTable>,
    mtu: Cell<u16>,
    icmp_handler: RefCell<Option<Upstream>>,
    udp_handler: RefCell<Option<Upstream>>,
    tcp_handler: RefCell<Option<Upstream>>,
    linklayer_out: RefCell<Option<Downstream>>,
    forward_packet: RefCell<Option<Upstream>>,
    packets_rx: Cell<u64>,
    packets_tx: Cell<u64>,
    packets_dropped: Cell<u64>,
}

impl Ip4 {
    pub fn new(routing: RoutingTable, mtu: u16) -> Self {
        Self {
            routing: Cell::new(routing),
            mtu: Cell::new(mtu),
            icmp_handler: RefCell::new(None),
            udp_handler: RefCell::new(None),
            tcp_handler: RefCell::new(None),
            linklayer_out: RefCell::new(None),
            forward_packet: RefCell::new(None),
            packets_rx: Cell::new(0),
            packets_tx: Cell::new(0),
            packets_dropped: Cell::new(0),
        }
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.routing.get().local_ip
    }

    /// Maximum datagram data size: the room an upper layer has in one
    /// packet. IP fragmentation is not implemented; oversized datagrams are
    /// a caller error.
    pub fn mdds(&self) -> u16 {
        self.mtu.get() - MIN_HEADER_LEN
    }

    pub fn set_icmp_handler(&self, handler: impl FnMut(PacketBuffer) + 'static) {
        *self.icmp_handler.borrow_mut() = Some(Box::new(handler));
    }

    pub fn set_udp_handler(&self, handler: impl FnMut(PacketBuffer) + 'static) {
        *self.udp_handler.borrow_mut() = Some(Box::new(handler));
    }

    pub fn set_tcp_handler(&self, handler: impl FnMut(PacketBuffer) + 'static) {
        *self.tcp_handler.borrow_mut() = Some(Box::new(handler));
    }

    pub fn set_linklayer_out(&self, handler: impl FnMut(PacketBuffer) + 'static) {
        *self.linklayer_out.borrow_mut() = Some(Box::new(handler));
    }

    pub fn set_packet_forwarding(&self, handler: impl FnMut(PacketBuffer) + 'static) {
        *self.forward_packet.borrow_mut() = Some(Box::new(handler));
    }

    /// Upstream input from the link layer.
    pub fn bottom(&self, mut buf: PacketBuffer) {
        enum Verdict {
            Deliver(u8),
            Forward,
            Malformed,
        }

        let verdict = match Ipv4Packet::new(&mut buf) {
            Ok(mut pkt) => {
                if self.routing.get().is_our_ip(pkt.dst()) {
                    let proto = pkt.protocol();
                    // cannot fail: the constructor bounds-checked the header
                    let _ = pkt.enter();
                    Verdict::Deliver(proto)
                } else {
                    Verdict::Forward
                }
            }
            Err(_) => Verdict::Malformed,
        };

        match verdict {
            Verdict::Malformed => self.drop_packet("malformed header"),
            Verdict::Forward => match self.forward_packet.borrow_mut().as_mut() {
                Some(forward) => forward(buf),
                None => self.drop_packet("not ours, forwarding disabled"),
            },
            Verdict::Deliver(proto) => {
                self.packets_rx.set(self.packets_rx.get() + 1);
                let handler = match proto {
                    protocol::ICMP => &self.icmp_handler,
                    protocol::UDP => &self.udp_handler,
                    protocol::TCP => &self.tcp_handler,
                    other => {
                        trace!("ip4: unhandled protocol {}", other);
                        self.packets_dropped.set(self.packets_dropped.get() + 1);
                        return;
                    }
                };
                match handler.borrow_mut().as_mut() {
                    Some(up) => up(buf),
                    None => self.drop_packet("no handler registered"),
                }
            }
        }
    }

    /// Downstream: receive a packet from above and transmit it.
    ///
    /// Destination address and protocol must already be set; the source
    /// address is filled with the interface address when left unspecified.
    pub fn transmit(&self, mut buf: PacketBuffer) -> Result<(), ErrorKind> {
        let offset = buf.payload_offset();
        if buf.size() - offset > self.mtu.get() {
            return Err(ErrorKind::PayloadTooLarge);
        }
        let next_hop = {
            let mut pkt = Ipv4Packet::new(&mut buf)?;
            if pkt.src().is_unspecified() {
                let local = self.routing.get().local_ip;
                pkt.set_src(local);
            }
            let dst = pkt.dst();
            pkt.make_flight_ready();
            self.routing.get().next_hop(dst).unwrap_or(dst)
        };
        buf.set_next_hop(next_hop);
        self.packets_tx.set(self.packets_tx.get() + 1);
        match self.linklayer_out.borrow_mut().as_mut() {
            Some(out) => out(buf),
            None => warn!("ip4: transmit with no link-layer out registered"),
        }
        Ok(())
    }

    fn drop_packet(&self, why: &str) {
        trace!("ip4: dropping packet: {}", why);
        self.packets_dropped.set(self.packets_dropped.get() + 1);
    }

    pub fn packets_rx(&self) -> u64 {
        self.packets_rx.get()
    }

    pub fn packets_tx(&self) -> u64 {
        self.packets_tx.get()
    }

    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped.get()
    }
}
