//! Ethernet framing (OSI layer 2)
//!
//! Frame structure: [Dest MAC (6)][Src MAC (6)][EtherType (2)][Payload]
//!
//! [`EthernetFrame`] is a zero-copy lens over a [`PacketBuffer`]: it reads
//! and writes header fields in place and moves the buffer's payload cursor
//! across the header when a frame is handed up or down the stack. The
//! [`Ethernet`] layer owns the upstream/downstream delegate registration the
//! device driver and the network protocols plug into.

use alloc::boxed::Box;
use core::cell::{Cell, RefCell};
use core::fmt;

use log::{trace, warn};

use crate::error::ErrorKind;
use crate::packet::PacketBuffer;

/// EtherType constants
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// A MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_multicast(&self) -> bool {
        (self.0[0] & 0x01) != 0 && !self.is_broadcast()
    }

    pub fn is_unicast(&self) -> bool {
        !self.is_broadcast() && !self.is_multicast()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Zero-copy view of a buffer as an Ethernet frame.
///
/// The header is read at the buffer's payload cursor; construction fails if
/// the 14 header bytes do not lie inside the populated region.
pub struct EthernetFrame<'a> {
    buf: &'a mut PacketBuffer,
    offset: u16,
    entered: bool,
}

impl<'a> EthernetFrame<'a> {
    pub const HEADER_LEN: u16 = 14;

    pub fn new(buf: &'a mut PacketBuffer) -> Result<Self, ErrorKind> {
        let offset = buf.payload_offset();
        if offset as usize + Self::HEADER_LEN as usize > buf.size() as usize {
            return Err(ErrorKind::CapacityExceeded);
        }
        Ok(Self { buf, offset, entered: false })
    }

    fn mac_at(&self, at: u16) -> MacAddr {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.buf.data()[at as usize..at as usize + 6]);
        MacAddr(mac)
    }

    fn set_mac_at(&mut self, at: u16, mac: MacAddr) {
        self.buf.data_mut()[at as usize..at as usize + 6].copy_from_slice(&mac.0);
    }

    pub fn dst(&self) -> MacAddr {
        self.mac_at(self.offset)
    }

    pub fn set_dst(&mut self, mac: MacAddr) {
        self.set_mac_at(self.offset, mac);
    }

    pub fn src(&self) -> MacAddr {
        self.mac_at(self.offset + 6)
    }

    pub fn set_src(&mut self, mac: MacAddr) {
        self.set_mac_at(self.offset + 6, mac);
    }

    pub fn ethertype(&self) -> u16 {
        let at = (self.offset + 12) as usize;
        let b = self.buf.data();
        u16::from_be_bytes([b[at], b[at + 1]])
    }

    pub fn set_ethertype(&mut self, ethertype: u16) {
        let at = (self.offset + 12) as usize;
        self.buf.data_mut()[at..at + 2].copy_from_slice(&ethertype.to_be_bytes());
    }

    /// Advance the cursor past this header, handing the payload upstream.
    pub fn enter(&mut self) -> Result<(), ErrorKind> {
        debug_assert!(!self.entered, "enter() without an intervening leave()");
        self.buf.advance(Self::HEADER_LEN)?;
        self.entered = true;
        Ok(())
    }

    /// Retract the cursor back over this header.
    pub fn leave(&mut self) -> Result<(), ErrorKind> {
        debug_assert!(self.entered, "leave() without enter()");
        self.buf.retract(Self::HEADER_LEN)?;
        self.entered = false;
        Ok(())
    }

    /// Frame payload, past the header.
    pub fn payload(&self) -> &[u8] {
        &self.buf.data()[(self.offset + Self::HEADER_LEN) as usize..]
    }
}

pub type Upstream = Box<dyn FnMut(PacketBuffer)>;
pub type FrameDownstream = Box<dyn FnMut(PacketBuffer)>;

/// The link layer: demultiplexes inbound frames by ethertype and frames
/// outbound packets for the physical downstream.
///
/// Delegates live in separate cells so a transmit triggered from inside a
/// receive dispatch (an ARP reply, an echo response) never re-borrows the
/// cell the receive path is still holding.
pub struct Ethernet {
    mac: MacAddr,
    ip4_upstream: RefCell<Option<Upstream>>,
    arp_upstream: RefCell<Option<Upstream>>,
    physical_downstream: RefCell<Option<FrameDownstream>>,
    frames_rx: Cell<u64>,
    frames_tx: Cell<u64>,
    frames_dropped: Cell<u64>,
}

impl Ethernet {
    pub fn new(mac: MacAddr) -> Self {
        Self {
            mac,
            ip4_upstream: RefCell::new(None),
            arp_upstream: RefCell::new(None),
            physical_downstream: RefCell::new(None),
            frames_rx: Cell::new(0),
            frames_tx: Cell::new(0),
            frames_dropped: Cell::new(0),
        }
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn set_ip4_upstream(&self, handler: impl FnMut(PacketBuffer) + 'static) {
        *self.ip4_upstream.borrow_mut() = Some(Box::new(handler));
    }

    pub fn set_arp_upstream(&self, handler: impl FnMut(PacketBuffer) + 'static) {
        *self.arp_upstream.borrow_mut() = Some(Box::new(handler));
    }

    pub fn set_physical_downstream(&self, handler: impl FnMut(PacketBuffer) + 'static) {
        *self.physical_downstream.borrow_mut() = Some(Box::new(handler));
    }

    /// Ingress from the device driver: validate, filter, demultiplex.
    pub fn receive(&self, mut buf: PacketBuffer) {
        let (ethertype, dst) = {
            let mut frame = match EthernetFrame::new(&mut buf) {
                Ok(frame) => frame,
                Err(_) => {
                    self.drop_frame("truncated frame");
                    return;
                }
            };
            let ethertype = frame.ethertype();
            let dst = frame.dst();
            if frame.enter().is_err() {
                self.drop_frame("truncated frame");
                return;
            }
            (ethertype, dst)
        };

        if dst.is_unicast() && dst != self.mac {
            self.drop_frame("not addressed to us");
            return;
        }
        self.frames_rx.set(self.frames_rx.get() + 1);

        match ethertype {
            ETHERTYPE_ARP => self.dispatch(&self.arp_upstream, buf),
            ETHERTYPE_IPV4 => self.dispatch(&self.ip4_upstream, buf),
            other => {
                trace!("eth: unknown ethertype {:#06x}", other);
                self.frames_dropped.set(self.frames_dropped.get() + 1);
            }
        }
    }

    /// Egress: claim the 14 bytes below the cursor for the link header and
    /// hand the finished frame to the physical downstream.
    pub fn transmit(&self, mut buf: PacketBuffer, dst: MacAddr, ethertype: u16) {
        if buf.retract(EthernetFrame::HEADER_LEN).is_err() {
            self.drop_frame("no room for link header");
            return;
        }
        {
            let mut frame = match EthernetFrame::new(&mut buf) {
                Ok(frame) => frame,
                Err(_) => {
                    self.drop_frame("frame below minimum size");
                    return;
                }
            };
            frame.set_dst(dst);
            frame.set_src(self.mac);
            frame.set_ethertype(ethertype);
        }
        self.frames_tx.set(self.frames_tx.get() + 1);
        match self.physical_downstream.borrow_mut().as_mut() {
            Some(tx) => tx(buf),
            None => warn!("eth: transmit with no physical downstream registered"),
        }
    }

    fn dispatch(&self, target: &RefCell<Option<Upstream>>, buf: PacketBuffer) {
        match target.borrow_mut().as_mut() {
            Some(up) => up(buf),
            None => self.frames_dropped.set(self.frames_dropped.get() + 1),
        }
    }

    fn drop_frame(&self, why: &str) {
        trace!("eth: dropping frame: {}", why);
        self.frames_dropped.set(self.frames_dropped.get() + 1);
    }

    pub fn frames_rx(&self) -> u64 {
        self.frames_rx.get()
    }

    pub fn frames_tx(&self) -> u64 {
        self.frames_tx.get()
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.get()
    }
}
