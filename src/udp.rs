//! UDP (RFC 768)
//!
//! Per-port socket table with inbound delivery by destination port, and an
//! outbound send queue that slices large payloads into MTU-sized datagrams
//! and drains them as buffer capacity allows.
//!
//! The transmit path builds every datagram at fixed offsets (link 0,
//! network 14, transport 34) since it never emits IP options; received
//! datagrams are read the same way.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::rc::{Rc, Weak};
use core::cell::{Cell, RefCell};
use core::net::Ipv4Addr;

use log::{trace, warn};

use crate::arp::FrameSource;
use crate::error::ErrorKind;
use crate::ethernet::EthernetFrame;
use crate::ipv4::{protocol, Ipv4Packet};
use crate::packet::PacketBuffer;

pub const HEADER_LEN: u16 = 8;

/// Ethernet + IPv4 + UDP headers, the fixed preamble of every datagram the
/// transmit path emits.
pub const FULL_HEADER_LEN: u16 = 42;

const IP_OFFSET: u16 = EthernetFrame::HEADER_LEN;
const UDP_OFFSET: u16 = IP_OFFSET + crate::ipv4::MIN_HEADER_LEN;

/// First port probed by [`Udp::bind_any`].
pub const AUTO_BIND_START: u16 = 1024;

/// Zero-copy view of a buffer as a UDP datagram.
///
/// Unlike the cursor-bound views, the datagram reads its headers at the
/// fixed offsets above: [`init`](Self::init) leaves the cursor at the
/// network header so the finished datagram can go straight to
/// `Ip4::transmit`.
pub struct UdpDatagram<'a> {
    buf: &'a mut PacketBuffer,
}

impl<'a> UdpDatagram<'a> {
    pub fn new(buf: &'a mut PacketBuffer) -> Result<Self, ErrorKind> {
        if buf.size() < FULL_HEADER_LEN {
            return Err(ErrorKind::CapacityExceeded);
        }
        Ok(Self { buf })
    }

    /// Initialize a fresh frame as an empty UDP datagram: IPv4 defaults,
    /// protocol 17, zero ports, zero length, checksum disabled.
    pub fn init(buf: &'a mut PacketBuffer) -> Result<Self, ErrorKind> {
        buf.set_size(IP_OFFSET)?;
        buf.advance(IP_OFFSET)?;
        {
            let mut ip = Ipv4Packet::init(buf)?;
            ip.set_protocol(protocol::UDP);
        }
        let mut dgram = Self { buf };
        dgram.set_length(0)?;
        dgram.set_src_port(0);
        dgram.set_dst_port(0);
        dgram.set_checksum(0);
        Ok(dgram)
    }

    fn get_u16(&self, at: u16) -> u16 {
        let i = (UDP_OFFSET + at) as usize;
        let b = self.buf.data();
        u16::from_be_bytes([b[i], b[i + 1]])
    }

    fn set_u16(&mut self, at: u16, v: u16) {
        let i = (UDP_OFFSET + at) as usize;
        self.buf.data_mut()[i..i + 2].copy_from_slice(&v.to_be_bytes());
    }

    pub fn src_port(&self) -> u16 {
        self.get_u16(0)
    }

    pub fn set_src_port(&mut self, port: u16) {
        self.set_u16(0, port);
    }

    pub fn dst_port(&self) -> u16 {
        self.get_u16(2)
    }

    pub fn set_dst_port(&mut self, port: u16) {
        self.set_u16(2, port);
    }

    /// The UDP length field: header plus data.
    pub fn length(&self) -> u16 {
        self.get_u16(4)
    }

    pub fn checksum(&self) -> u16 {
        self.get_u16(6)
    }

    pub fn set_checksum(&mut self, sum: u16) {
        self.set_u16(6, sum);
    }

    pub fn data_length(&self) -> u16 {
        self.length().saturating_sub(HEADER_LEN)
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        let b = self.buf.data();
        let i = (IP_OFFSET + 12) as usize;
        Ipv4Addr::new(b[i], b[i + 1], b[i + 2], b[i + 3])
    }

    pub fn set_src_addr(&mut self, addr: Ipv4Addr) {
        let i = (IP_OFFSET + 12) as usize;
        self.buf.data_mut()[i..i + 4].copy_from_slice(&addr.octets());
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        let b = self.buf.data();
        let i = (IP_OFFSET + 16) as usize;
        Ipv4Addr::new(b[i], b[i + 1], b[i + 2], b[i + 3])
    }

    pub fn set_dst_addr(&mut self, addr: Ipv4Addr) {
        let i = (IP_OFFSET + 16) as usize;
        self.buf.data_mut()[i..i + 4].copy_from_slice(&addr.octets());
    }

    /// Datagram payload. The declared length is clamped to the populated
    /// bytes, so a lying length field cannot read past them.
    pub fn data(&self) -> &[u8] {
        let start = FULL_HEADER_LEN as usize;
        let end = (start + self.data_length() as usize).min(self.buf.size() as usize);
        &self.buf.data()[start..end]
    }

    /// Set the data length, adjusting both the UDP length field and the
    /// buffer's total size.
    pub fn set_length(&mut self, data_len: u16) -> Result<(), ErrorKind> {
        let total = FULL_HEADER_LEN
            .checked_add(data_len)
            .ok_or(ErrorKind::CapacityExceeded)?;
        self.buf.set_size(total)?;
        self.set_u16(4, HEADER_LEN + data_len);
        Ok(())
    }

    /// Append bytes to the payload, never past the buffer's capacity.
    /// Returns how many bytes were actually copied.
    pub fn fill(&mut self, bytes: &[u8]) -> u16 {
        let room = (self.buf.capacity() - self.buf.size()) as usize;
        let count = bytes.len().min(room) as u16;
        let at = self.data_length();
        // set_length cannot fail: count was clamped to the remaining room
        let _ = self.set_length(at + count);
        let start = (FULL_HEADER_LEN + at) as usize;
        self.buf.data_mut()[start..start + count as usize]
            .copy_from_slice(&bytes[..count as usize]);
        count
    }

    /// RFC 768 checksum over the pseudo-header and the datagram; a computed
    /// zero is transmitted as 0xFFFF. The default emitted checksum stays 0
    /// (disabled), this is for callers that want it.
    pub fn compute_checksum(&self) -> u16 {
        let segment_start = UDP_OFFSET as usize;
        let segment = &self.buf.data()[segment_start..];
        let mut scratch = [0u8; 8];
        scratch.copy_from_slice(&segment[..8]);
        scratch[6] = 0;
        scratch[7] = 0;
        let sum = crate::checksum::pseudo_header_checksum_parts(
            self.src_addr(),
            self.dst_addr(),
            protocol::UDP,
            &scratch,
            &segment[8..],
        );
        if sum == 0 { 0xFFFF } else { sum }
    }

    /// Advance the cursor past the UDP header.
    pub fn enter(&mut self) -> Result<(), ErrorKind> {
        self.buf.advance(HEADER_LEN)
    }

    /// Retract the cursor back over the UDP header.
    pub fn leave(&mut self) -> Result<(), ErrorKind> {
        self.buf.retract(HEADER_LEN)
    }
}

pub type RecvCallback = Box<dyn FnMut(Ipv4Addr, u16, &[u8])>;
pub type SendtoHandler = Box<dyn FnMut()>;
pub type NetworkDownstream = Box<dyn FnMut(PacketBuffer)>;

/// A bound UDP socket. Handed out by [`Udp::bind`]; the port stays bound
/// until [`Udp::close`] releases it.
pub struct Socket {
    port: u16,
    on_read: RefCell<Option<RecvCallback>>,
    udp: Weak<Udp>,
}

impl core::fmt::Debug for Socket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Socket").field("port", &self.port).finish()
    }
}

impl Socket {
    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Register the inbound-delivery callback:
    /// `(source address, source port, payload)`.
    pub fn on_read(&self, callback: impl FnMut(Ipv4Addr, u16, &[u8]) + 'static) {
        *self.on_read.borrow_mut() = Some(Box::new(callback));
    }

    /// Send `bytes` to `dst:dst_port`, splitting at datagram-size
    /// boundaries. The completion callback runs once the final datagram has
    /// left the send queue. A no-op for empty payloads or when the stack
    /// has been torn down.
    pub fn sendto(
        &self,
        dst: Ipv4Addr,
        dst_port: u16,
        bytes: &[u8],
        completion: Option<SendtoHandler>,
    ) {
        let Some(udp) = self.udp.upgrade() else {
            warn!("udp: socket {} outlived its stack", self.port);
            return;
        };
        udp.sendto_from(self.port, dst, dst_port, bytes, completion);
    }

    /// Broadcast `bytes` on the local segment.
    pub fn bcast(&self, dst_port: u16, bytes: &[u8], completion: Option<SendtoHandler>) {
        self.sendto(Ipv4Addr::BROADCAST, dst_port, bytes, completion);
    }

    fn internal_read(&self, src: Ipv4Addr, src_port: u16, data: &[u8]) {
        // Take the callback out while it runs so it may touch this socket
        // (e.g. answer with sendto) without re-borrowing the cell.
        let taken = self.on_read.borrow_mut().take();
        if let Some(mut callback) = taken {
            callback(src, src_port, data);
            let mut slot = self.on_read.borrow_mut();
            if slot.is_none() {
                *slot = Some(callback);
            }
        } else {
            trace!("udp: port {} has no reader, payload discarded", self.port);
        }
    }
}

/// One send-queue entry: a slice of the caller's payload worth exactly one
/// datagram, plus the endpoints and an optional completion callback.
/// The entry leaves the queue exactly when `offset == len`.
struct WriteBuffer {
    data: Rc<[u8]>,
    begin: usize,
    len: usize,
    offset: usize,
    callback: Option<SendtoHandler>,
    l_addr: Ipv4Addr,
    l_port: u16,
    d_addr: Ipv4Addr,
    d_port: u16,
}

impl WriteBuffer {
    fn remaining(&self) -> usize {
        self.len - self.offset
    }

    fn done(&self) -> bool {
        self.offset == self.len
    }
}

/// The UDP layer.
pub struct Udp {
    sockets: RefCell<BTreeMap<u16, Rc<Socket>>>,
    current_port: Cell<u16>,
    sendq: RefCell<VecDeque<WriteBuffer>>,
    network_downstream: RefCell<Option<NetworkDownstream>>,
    frame_source: RefCell<Option<FrameSource>>,
    local_ip: Cell<Ipv4Addr>,
    /// Room for UDP header + data in one IP packet (the network layer's
    /// maximum datagram data size).
    mdds: Cell<u16>,
    datagrams_rx: Cell<u64>,
    datagrams_tx: Cell<u64>,
    dropped: Cell<u64>,
}

impl Udp {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            sockets: RefCell::new(BTreeMap::new()),
            current_port: Cell::new(AUTO_BIND_START),
            sendq: RefCell::new(VecDeque::new()),
            network_downstream: RefCell::new(None),
            frame_source: RefCell::new(None),
            local_ip: Cell::new(Ipv4Addr::UNSPECIFIED),
            mdds: Cell::new(1500 - crate::ipv4::MIN_HEADER_LEN),
            datagrams_rx: Cell::new(0),
            datagrams_tx: Cell::new(0),
            dropped: Cell::new(0),
        })
    }

    pub fn set_local_ip(&self, ip: Ipv4Addr) {
        self.local_ip.set(ip);
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip.get()
    }

    pub fn set_mdds(&self, mdds: u16) {
        self.mdds.set(mdds);
    }

    /// Payload bytes that fit in one datagram.
    pub fn max_datagram_size(&self) -> u16 {
        self.mdds.get() - HEADER_LEN
    }

    pub fn set_network_downstream(&self, handler: impl FnMut(PacketBuffer) + 'static) {
        *self.network_downstream.borrow_mut() = Some(Box::new(handler));
    }

    pub fn set_frame_source(&self, source: impl FnMut() -> Result<PacketBuffer, ErrorKind> + 'static) {
        *self.frame_source.borrow_mut() = Some(Box::new(source));
    }

    /// Bind `port`, reserving it for the returned socket.
    pub fn bind(self: &Rc<Self>, port: u16) -> Result<Rc<Socket>, ErrorKind> {
        let mut sockets = self.sockets.borrow_mut();
        if sockets.contains_key(&port) {
            return Err(ErrorKind::PortInUse);
        }
        let socket = Rc::new(Socket {
            port,
            on_read: RefCell::new(None),
            udp: Rc::downgrade(self),
        });
        sockets.insert(port, socket.clone());
        trace!("udp: bound port {}", port);
        Ok(socket)
    }

    /// Bind the next unused port at or above 1024, probing with wraparound.
    pub fn bind_any(self: &Rc<Self>) -> Result<Rc<Socket>, ErrorKind> {
        let start = self.current_port.get();
        loop {
            let candidate = self.current_port.get();
            let next = if candidate == u16::MAX { AUTO_BIND_START } else { candidate + 1 };
            self.current_port.set(next);
            if !self.is_bound(candidate) {
                return self.bind(candidate);
            }
            if next == start {
                return Err(ErrorKind::PortsExhausted);
            }
        }
    }

    pub fn is_bound(&self, port: u16) -> bool {
        self.sockets.borrow().contains_key(&port)
    }

    /// Release a bound port. Outstanding socket handles become inert.
    pub fn close(&self, port: u16) {
        self.sockets.borrow_mut().remove(&port);
        trace!("udp: closed port {}", port);
    }

    /// Inbound delivery, cursor at the UDP header.
    pub fn receive(&self, mut buf: PacketBuffer) {
        let populated = buf.size() as usize;
        let (dst_port, src_port, src_addr, data_len) = {
            let dgram = match UdpDatagram::new(&mut buf) {
                Ok(dgram) => dgram,
                Err(_) => {
                    self.drop_datagram("truncated datagram");
                    return;
                }
            };
            let length = dgram.length();
            let declared_end = FULL_HEADER_LEN as usize + length.saturating_sub(HEADER_LEN) as usize;
            if length < HEADER_LEN || declared_end > populated {
                self.drop_datagram("bad length field");
                return;
            }
            (dgram.dst_port(), dgram.src_port(), dgram.src_addr(), length - HEADER_LEN)
        };

        let socket = self.sockets.borrow().get(&dst_port).cloned();
        match socket {
            Some(socket) => {
                self.datagrams_rx.set(self.datagrams_rx.get() + 1);
                let start = FULL_HEADER_LEN as usize;
                socket.internal_read(src_addr, src_port, &buf.data()[start..start + data_len as usize]);
            }
            // Deliberately no ICMP port-unreachable here.
            None => self.drop_datagram("no socket bound to destination port"),
        }
    }

    fn sendto_from(
        &self,
        l_port: u16,
        d_addr: Ipv4Addr,
        d_port: u16,
        bytes: &[u8],
        completion: Option<SendtoHandler>,
    ) {
        if bytes.is_empty() {
            return;
        }
        let data: Rc<[u8]> = Rc::from(bytes);
        let slice = self.max_datagram_size() as usize;
        let l_addr = self.local_ip.get();
        {
            let mut sendq = self.sendq.borrow_mut();
            let mut begin = 0;
            while begin < data.len() {
                let len = slice.min(data.len() - begin);
                sendq.push_back(WriteBuffer {
                    data: data.clone(),
                    begin,
                    len,
                    offset: 0,
                    callback: None,
                    l_addr,
                    l_port,
                    d_addr,
                    d_port,
                });
                begin += len;
            }
            if let Some(last) = sendq.back_mut() {
                last.callback = completion;
            }
        }
        // Datagrams are meant to leave immediately; try to drain right away.
        self.flush();
    }

    /// Drain as much of the send queue as buffer capacity allows.
    pub fn flush(&self) {
        let pending = self.sendq.borrow().len();
        self.process_sendq(pending);
    }

    /// Build and transmit up to `num` datagrams from the send queue.
    pub fn process_sendq(&self, num: usize) {
        for _ in 0..num {
            let Some(mut entry) = self.sendq.borrow_mut().pop_front() else {
                return;
            };

            let allocated = {
                let mut source = self.frame_source.borrow_mut();
                match source.as_mut() {
                    Some(source) => source(),
                    None => {
                        warn!("udp: no frame source registered");
                        Err(ErrorKind::PoolExhausted)
                    }
                }
            };
            let mut buf = match allocated {
                Ok(buf) => buf,
                Err(ErrorKind::PoolExhausted) => {
                    // Backpressure: park the entry and retry on the next
                    // flush.
                    self.sendq.borrow_mut().push_front(entry);
                    return;
                }
                Err(e) => {
                    warn!("udp: frame source failed: {}", e);
                    self.drop_datagram("frame source failure");
                    return;
                }
            };

            let built = {
                match UdpDatagram::init(&mut buf) {
                    Ok(mut dgram) => {
                        dgram.set_src_port(entry.l_port);
                        dgram.set_dst_port(entry.d_port);
                        dgram.set_src_addr(entry.l_addr);
                        dgram.set_dst_addr(entry.d_addr);
                        let chunk = &entry.data[entry.begin + entry.offset..entry.begin + entry.len];
                        let wrote = dgram.fill(chunk);
                        entry.offset += wrote as usize;
                        true
                    }
                    Err(_) => false,
                }
            };
            if !built {
                self.drop_datagram("slot too small for headers");
                continue;
            }

            self.datagrams_tx.set(self.datagrams_tx.get() + 1);
            match self.network_downstream.borrow_mut().as_mut() {
                Some(down) => down(buf),
                None => warn!("udp: no network downstream registered"),
            }

            if entry.done() {
                if let Some(mut callback) = entry.callback.take() {
                    callback();
                }
            } else {
                trace!("udp: {} bytes left in queue head", entry.remaining());
                self.sendq.borrow_mut().push_front(entry);
            }
        }
    }

    /// Entries currently waiting in the send queue.
    pub fn sendq_len(&self) -> usize {
        self.sendq.borrow().len()
    }

    fn drop_datagram(&self, why: &str) {
        trace!("udp: dropping datagram: {}", why);
        self.dropped.set(self.dropped.get() + 1);
    }

    pub fn datagrams_rx(&self) -> u64 {
        self.datagrams_rx.get()
    }

    pub fn datagrams_tx(&self) -> u64 {
        self.datagrams_tx.get()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.get()
    }
}
