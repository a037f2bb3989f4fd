//! ICMP echo (RFC 792)
//!
//! Echo requests addressed to us are turned into replies in place: the same
//! buffer is retagged, its checksum recomputed, the IP addresses swapped,
//! and the packet resubmitted to the network layer. Identifier, sequence
//! and payload ride along untouched.

use alloc::boxed::Box;
use core::cell::{Cell, RefCell};
use core::net::Ipv4Addr;

use log::{debug, trace, warn};

use crate::arp::FrameSource;
use crate::checksum;
use crate::error::ErrorKind;
use crate::ethernet::EthernetFrame;
use crate::ipv4::{protocol, Ipv4Packet, DEFAULT_TTL};
use crate::packet::PacketBuffer;

pub const ECHO_REPLY: u8 = 0;
pub const ECHO_REQUEST: u8 = 8;
pub const HEADER_LEN: u16 = 8;

/// Zero-copy view of a buffer as an ICMP message, bound at the cursor.
pub struct IcmpPacket<'a> {
    buf: &'a mut PacketBuffer,
    offset: u16,
}

impl<'a> IcmpPacket<'a> {
    pub fn new(buf: &'a mut PacketBuffer) -> Result<Self, ErrorKind> {
        let offset = buf.payload_offset();
        if offset as usize + HEADER_LEN as usize > buf.size() as usize {
            return Err(ErrorKind::CapacityExceeded);
        }
        Ok(Self { buf, offset })
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

    pub fn icmp_type(&self) -> u8 {
        self.buf.data()[self.offset as usize]
    }

    pub fn set_icmp_type(&mut self, t: u8) {
        self.buf.data_mut()[self.offset as usize] = t;
    }

    pub fn code(&self) -> u8 {
        self.buf.data()[self.offset as usize + 1]
    }

    pub fn set_code(&mut self, code: u8) {
        self.buf.data_mut()[self.offset as usize + 1] = code;
    }

    pub fn checksum(&self) -> u16 {
        self.get_u16(2)
    }

    pub fn identifier(&self) -> u16 {
        self.get_u16(4)
    }

    pub fn set_identifier(&mut self, ident: u16) {
        self.set_u16(4, ident);
    }

    pub fn sequence(&self) -> u16 {
        self.get_u16(6)
    }

    pub fn set_sequence(&mut self, seq: u16) {
        self.set_u16(6, seq);
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf.data()[(self.offset + HEADER_LEN) as usize..]
    }

    /// Recompute the checksum over the whole ICMP message.
    pub fn update_checksum(&mut self) {
        self.set_u16(2, 0);
        let sum = checksum::checksum(&self.buf.data()[self.offset as usize..]);
        self.set_u16(2, sum);
    }

    pub fn verify_checksum(&self) -> bool {
        checksum::verify(&self.buf.data()[self.offset as usize..])
    }
}

pub type NetworkDownstream = Box<dyn FnMut(PacketBuffer)>;

/// The ICMP layer: echo responder plus an outbound ping primitive.
pub struct Icmp {
    network_downstream: RefCell<Option<NetworkDownstream>>,
    frame_source: RefCell<Option<FrameSource>>,
    requests_rx: Cell<u64>,
    replies_rx: Cell<u64>,
    replies_tx: Cell<u64>,
    dropped: Cell<u64>,
}

impl Icmp {
    pub fn new() -> Self {
        Self {
            network_downstream: RefCell::new(None),
            frame_source: RefCell::new(None),
            requests_rx: Cell::new(0),
            replies_rx: Cell::new(0),
            replies_tx: Cell::new(0),
            dropped: Cell::new(0),
        }
    }

    pub fn set_network_downstream(&self, handler: impl FnMut(PacketBuffer) + 'static) {
        *self.network_downstream.borrow_mut() = Some(Box::new(handler));
    }

    pub fn set_frame_source(&self, source: impl FnMut() -> Result<PacketBuffer, ErrorKind> + 'static) {
        *self.frame_source.borrow_mut() = Some(Box::new(source));
    }

    /// Inbound ICMP, cursor at the ICMP header.
    pub fn receive(&self, mut buf: PacketBuffer) {
        let icmp_type = {
            match IcmpPacket::new(&mut buf) {
                Ok(pkt) => pkt.icmp_type(),
                Err(_) => {
                    trace!("icmp: dropping truncated message");
                    self.dropped.set(self.dropped.get() + 1);
                    return;
                }
            }
        };

        match icmp_type {
            ECHO_REQUEST => {
                self.requests_rx.set(self.requests_rx.get() + 1);
                self.reply_in_place(buf);
            }
            ECHO_REPLY => {
                self.replies_rx.set(self.replies_rx.get() + 1);
                let Ok(pkt) = IcmpPacket::new(&mut buf) else { return };
                debug!("icmp: echo reply seq={}", pkt.sequence());
            }
            other => {
                trace!("icmp: unhandled type {}", other);
                self.dropped.set(self.dropped.get() + 1);
            }
        }
    }

    /// Turn a request into a reply using the buffer it arrived in.
    fn reply_in_place(&self, mut buf: PacketBuffer) {
        {
            let Ok(mut pkt) = IcmpPacket::new(&mut buf) else { return };
            pkt.set_icmp_type(ECHO_REPLY);
            pkt.update_checksum();
        }

        // Step back down to the network header and swap the endpoints;
        // transmit() refills the unspecified source with our address.
        let Some(ip_header_len) = buf.payload_offset().checked_sub(EthernetFrame::HEADER_LEN)
        else {
            self.dropped.set(self.dropped.get() + 1);
            return;
        };
        if buf.retract(ip_header_len).is_err() {
            self.dropped.set(self.dropped.get() + 1);
            return;
        }
        {
            let Ok(mut ip) = Ipv4Packet::new(&mut buf) else {
                self.dropped.set(self.dropped.get() + 1);
                return;
            };
            let requester = ip.src();
            ip.set_dst(requester);
            ip.set_src(Ipv4Addr::UNSPECIFIED);
            ip.set_ttl(DEFAULT_TTL);
        }
        self.replies_tx.set(self.replies_tx.get() + 1);
        self.submit(buf);
    }

    /// Build and send an echo request.
    pub fn send_echo_request(
        &self,
        dst: Ipv4Addr,
        ident: u16,
        seq: u16,
        payload: &[u8],
    ) -> Result<(), ErrorKind> {
        let mut buf = {
            let mut source = self.frame_source.borrow_mut();
            let source = source.as_mut().ok_or(ErrorKind::PoolExhausted)?;
            source()?
        };
        buf.set_size(EthernetFrame::HEADER_LEN)?;
        buf.advance(EthernetFrame::HEADER_LEN)?;
        {
            let mut ip = Ipv4Packet::init(&mut buf)?;
            ip.set_protocol(protocol::ICMP);
            ip.set_dst(dst);
        }

        let total = buf.size() as usize + HEADER_LEN as usize + payload.len();
        if total > buf.capacity() as usize {
            return Err(ErrorKind::PayloadTooLarge);
        }
        buf.set_size(total as u16)?;
        buf.advance(crate::ipv4::MIN_HEADER_LEN)?;
        {
            let mut pkt = IcmpPacket::new(&mut buf)?;
            pkt.set_icmp_type(ECHO_REQUEST);
            pkt.set_code(0);
            pkt.set_identifier(ident);
            pkt.set_sequence(seq);
            let at = (pkt.offset + HEADER_LEN) as usize;
            pkt.buf.data_mut()[at..at + payload.len()].copy_from_slice(payload);
            pkt.update_checksum();
        }
        buf.retract(crate::ipv4::MIN_HEADER_LEN)?;
        self.submit(buf);
        Ok(())
    }

    fn submit(&self, buf: PacketBuffer) {
        match self.network_downstream.borrow_mut().as_mut() {
            Some(down) => down(buf),
            None => warn!("icmp: no network downstream registered"),
        }
    }

    pub fn requests_rx(&self) -> u64 {
        self.requests_rx.get()
    }

    pub fn replies_rx(&self) -> u64 {
        self.replies_rx.get()
    }

    pub fn replies_tx(&self) -> u64 {
        self.replies_tx.get()
    }
}

impl Default for Icmp {
    fn default() -> Self {
        Self::new()
    }
}
