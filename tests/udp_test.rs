use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::sync::Arc;

use nanonet::arp::Resolver;
use nanonet::checksum;
use nanonet::error::ErrorKind;
use nanonet::ethernet::{MacAddr, ETHERTYPE_IPV4};
use nanonet::ipv4::protocol;
use nanonet::packet::PacketBuffer;
use nanonet::pool::BufferPool;
use nanonet::stack::{Inet, NetworkConfig};
use nanonet::udp::UdpDatagram;

const LOCAL_MAC: MacAddr = MacAddr([0x52, 0x54, 0x00, 0x00, 0x00, 0x02]);
const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const DEST_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 5);

fn stack(pool: &Arc<BufferPool>) -> (Inet, Rc<RefCell<Vec<PacketBuffer>>>) {
    // a flat /0 network: every destination is its own next hop, so the
    // static-map resolver derives the receiving stack's MAC directly
    let config = NetworkConfig::new(LOCAL_MAC, LOCAL_IP, Ipv4Addr::new(0, 0, 0, 0), None);
    let inet = Inet::new(config, pool.clone(), || 0);
    inet.arp().set_resolver(Resolver::StaticMap);
    let sent = Rc::new(RefCell::new(Vec::new()));
    {
        let sent = sent.clone();
        inet.set_transmit_handler(move |buf| sent.borrow_mut().push(buf));
    }
    (inet, sent)
}

#[test]
fn binding_a_taken_port_is_refused() {
    let pool = BufferPool::new(4, 2048);
    let (inet, _sent) = stack(&pool);

    let _first = inet.udp().bind(7000).unwrap();
    assert_eq!(inet.udp().bind(7000).unwrap_err(), ErrorKind::PortInUse);
}

#[test]
fn close_releases_the_port() {
    let pool = BufferPool::new(4, 2048);
    let (inet, _sent) = stack(&pool);

    let _socket = inet.udp().bind(7000).unwrap();
    assert!(inet.udp().is_bound(7000));
    inet.udp().close(7000);
    assert!(!inet.udp().is_bound(7000));
    assert!(inet.udp().bind(7000).is_ok());
}

#[test]
fn auto_bind_probes_past_taken_ports() {
    let pool = BufferPool::new(4, 2048);
    let (inet, _sent) = stack(&pool);

    let _a = inet.udp().bind(1024).unwrap();
    let _b = inet.udp().bind(1025).unwrap();
    let c = inet.udp().bind_any().unwrap();
    assert_eq!(c.local_port(), 1026);

    let d = inet.udp().bind_any().unwrap();
    assert_ne!(d.local_port(), c.local_port());
    assert!(!([1024, 1025].contains(&d.local_port())));
}

#[test]
fn datagram_fill_stops_at_capacity() {
    // a slot barely larger than the headers: 8 bytes of payload room
    let mut buf = PacketBuffer::heap(50);
    let mut dgram = UdpDatagram::init(&mut buf).unwrap();
    let wrote = dgram.fill(&[0x55; 100]);
    assert_eq!(wrote, 8);
    assert_eq!(dgram.data_length(), 8);
    assert_eq!(dgram.data(), &[0x55u8; 8][..]);
    // a second fill finds no room at all
    assert_eq!(dgram.fill(&[0x66; 4]), 0);
}

#[test]
fn datagram_view_cursor_round_trip() {
    let mut buf = PacketBuffer::heap(128);
    {
        let mut dgram = UdpDatagram::init(&mut buf).unwrap();
        dgram.fill(b"abcd");
    }
    // move to the transport header, as the network layer does on receive
    buf.advance(20).unwrap();
    let before = buf.payload_offset();
    {
        let mut dgram = UdpDatagram::new(&mut buf).unwrap();
        dgram.enter().unwrap();
    }
    assert_eq!(buf.payload_offset(), 42);
    assert_eq!(buf.payload(), b"abcd");
    {
        let mut dgram = UdpDatagram::new(&mut buf).unwrap();
        dgram.leave().unwrap();
    }
    assert_eq!(buf.payload_offset(), before);
}

#[test]
fn sendto_emits_the_canonical_datagram() {
    let pool = BufferPool::new(8, 2048);
    let (inet, sent) = stack(&pool);

    let socket = inet.udp().bind(5000).unwrap();
    socket.sendto(DEST_IP, 7000, b"ten bytes!", None);

    let sent = sent.borrow();
    assert_eq!(sent.len(), 1);
    let bytes = sent[0].data();

    assert_eq!(&bytes[12..14], &ETHERTYPE_IPV4.to_be_bytes());
    assert_eq!(bytes[23], protocol::UDP);
    // IP total length: 20 + 8 + 10
    assert_eq!(u16::from_be_bytes([bytes[16], bytes[17]]), 38);
    assert!(checksum::verify(&bytes[14..34]));
    assert_eq!(&bytes[26..30], &LOCAL_IP.octets());
    assert_eq!(&bytes[30..34], &DEST_IP.octets());
    // UDP header: ports and length 8 + 10
    assert_eq!(u16::from_be_bytes([bytes[34], bytes[35]]), 5000);
    assert_eq!(u16::from_be_bytes([bytes[36], bytes[37]]), 7000);
    assert_eq!(u16::from_be_bytes([bytes[38], bytes[39]]), 18);
    assert_eq!(&bytes[42..], b"ten bytes!");
    assert_eq!(bytes.len(), 52);
}

#[test]
fn received_datagram_reaches_the_bound_socket() {
    let pool = BufferPool::new(8, 2048);
    let (sender, sender_out) = stack(&pool);
    let socket = sender.udp().bind(5000).unwrap();
    socket.sendto(DEST_IP, 7000, b"ten bytes!", None);
    let frame = sender_out.borrow_mut().pop().unwrap();

    // a second stack owning the destination address
    let receiver_pool = BufferPool::new(8, 2048);
    let config = NetworkConfig::new(
        MacAddr([0x02, 0x00, 203, 0, 113, 5]),
        DEST_IP,
        Ipv4Addr::new(255, 255, 255, 0),
        None,
    );
    let receiver = Inet::new(config, receiver_pool.clone(), || 0);

    let got: Rc<RefCell<Vec<(Ipv4Addr, u16, Vec<u8>)>>> = Rc::new(RefCell::new(Vec::new()));
    let listener = receiver.udp().bind(7000).unwrap();
    {
        let got = got.clone();
        listener.on_read(move |src, sport, data| {
            got.borrow_mut().push((src, sport, data.to_vec()));
        });
    }

    receiver.receive(frame);

    let got = got.borrow();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, LOCAL_IP);
    assert_eq!(got[0].1, 5000);
    assert_eq!(got[0].2, b"ten bytes!");
}

#[test]
fn datagrams_to_unbound_ports_vanish_quietly() {
    let pool = BufferPool::new(8, 2048);
    let (sender, sender_out) = stack(&pool);
    let socket = sender.udp().bind(5000).unwrap();
    socket.sendto(DEST_IP, 7000, b"nobody home", None);
    let frame = sender_out.borrow_mut().pop().unwrap();

    let receiver_pool = BufferPool::new(8, 2048);
    let config = NetworkConfig::new(
        MacAddr([0x02, 0x00, 203, 0, 113, 5]),
        DEST_IP,
        Ipv4Addr::new(255, 255, 255, 0),
        None,
    );
    let receiver = Inet::new(config, receiver_pool.clone(), || 0);

    let out = Rc::new(RefCell::new(Vec::new()));
    {
        let out = out.clone();
        receiver.set_transmit_handler(move |buf| out.borrow_mut().push(buf));
    }
    receiver.receive(frame);

    assert_eq!(receiver.udp().dropped(), 1);
    // no ICMP port-unreachable leaves the stack
    assert!(out.borrow().is_empty());
}

#[test]
fn large_payloads_split_at_the_datagram_boundary() {
    let pool = BufferPool::new(8, 2048);
    let (inet, sent) = stack(&pool);

    let socket = inet.udp().bind(5000).unwrap();
    let max = inet.udp().max_datagram_size() as usize;
    assert_eq!(max, 1500 - 20 - 8);

    let done = Rc::new(RefCell::new(0u32));
    let payload = vec![0xA5u8; max * 2 + 10];
    {
        let done = done.clone();
        socket.sendto(
            DEST_IP,
            7000,
            &payload,
            Some(Box::new(move || *done.borrow_mut() += 1)),
        );
    }

    let sent = sent.borrow();
    assert_eq!(sent.len(), 3);
    let lengths: Vec<u16> = sent
        .iter()
        .map(|f| u16::from_be_bytes([f.data()[38], f.data()[39]]))
        .collect();
    assert_eq!(lengths, vec![8 + max as u16, 8 + max as u16, 8 + 10]);
    // completion fires exactly once, after the final datagram
    assert_eq!(*done.borrow(), 1);
}

#[test]
fn exhausted_pool_parks_the_send_queue() {
    let pool = BufferPool::new(2, 2048);
    let (inet, sent) = stack(&pool);
    let socket = inet.udp().bind(5000).unwrap();

    let hold_a = pool.allocate(0).unwrap();
    let hold_b = pool.allocate(0).unwrap();
    socket.sendto(DEST_IP, 7000, b"delayed", None);

    assert!(sent.borrow().is_empty());
    assert_eq!(inet.udp().sendq_len(), 1);

    drop(hold_a);
    drop(hold_b);
    inet.udp().flush();

    assert_eq!(sent.borrow().len(), 1);
    assert_eq!(inet.udp().sendq_len(), 0);
    assert_eq!(&sent.borrow()[0].data()[42..], b"delayed");
}

#[test]
fn empty_sends_are_ignored() {
    let pool = BufferPool::new(4, 2048);
    let (inet, sent) = stack(&pool);
    let socket = inet.udp().bind(5000).unwrap();
    socket.sendto(DEST_IP, 7000, b"", None);
    assert!(sent.borrow().is_empty());
    assert_eq!(inet.udp().sendq_len(), 0);
}

#[test]
fn a_socket_can_answer_from_its_own_callback() {
    // receive and send on the same socket within one dispatch
    let pool = BufferPool::new(8, 2048);
    let config = NetworkConfig::new(
        MacAddr([0x02, 0x00, 203, 0, 113, 5]),
        DEST_IP,
        Ipv4Addr::new(255, 255, 255, 0),
        None,
    );
    let inet = Inet::new(config, pool.clone(), || 0);
    inet.arp().set_resolver(Resolver::StaticMap);
    let sent = Rc::new(RefCell::new(Vec::new()));
    {
        let sent = sent.clone();
        inet.set_transmit_handler(move |buf| sent.borrow_mut().push(buf));
    }

    let echo = inet.udp().bind(7000).unwrap();
    {
        let echo_handle = echo.clone();
        echo.on_read(move |src, sport, data| {
            let mut answer = b"re: ".to_vec();
            answer.extend_from_slice(data);
            echo_handle.sendto(src, sport, &answer, None);
        });
    }

    // hand-build an inbound datagram from a peer
    let (peer, peer_out) = stack(&pool);
    let peer_socket = peer.udp().bind(5000).unwrap();
    peer_socket.sendto(DEST_IP, 7000, b"hello", None);
    inet.receive(peer_out.borrow_mut().pop().unwrap());

    let sent = sent.borrow();
    assert_eq!(sent.len(), 1);
    assert_eq!(&sent[0].data()[42..], b"re: hello");
    assert_eq!(u16::from_be_bytes([sent[0].data()[36], sent[0].data()[37]]), 5000);
}

#[test]
fn udp_checksum_helper_is_self_consistent() {
    let mut buf = PacketBuffer::heap(128);
    let mut dgram = UdpDatagram::init(&mut buf).unwrap();
    dgram.set_src_port(5000);
    dgram.set_dst_port(7000);
    dgram.set_src_addr(LOCAL_IP);
    dgram.set_dst_addr(DEST_IP);
    dgram.fill(b"checksummed");
    let sum = dgram.compute_checksum();
    assert_ne!(sum, 0);
    dgram.set_checksum(sum);

    // verifying over pseudo-header + datagram folds to zero
    let segment = &buf.data()[34..];
    assert_eq!(
        checksum::pseudo_header_checksum(LOCAL_IP, DEST_IP, protocol::UDP, segment),
        0
    );
}
