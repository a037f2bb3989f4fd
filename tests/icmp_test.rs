use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::sync::Arc;

use nanonet::arp::Resolver;
use nanonet::checksum;
use nanonet::ethernet::{EthernetFrame, MacAddr, ETHERTYPE_IPV4};
use nanonet::icmp::{IcmpPacket, ECHO_REPLY, ECHO_REQUEST};
use nanonet::ipv4::{protocol, Ipv4Packet};
use nanonet::packet::PacketBuffer;
use nanonet::pool::BufferPool;
use nanonet::stack::{Inet, NetworkConfig};

const LOCAL_MAC: MacAddr = MacAddr([0x52, 0x54, 0x00, 0x00, 0x00, 0x02]);
const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const REMOTE_MAC: MacAddr = MacAddr([0x52, 0x54, 0x00, 0x00, 0x00, 0x09]);
const REMOTE_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);

fn stack(pool: &Arc<BufferPool>) -> (Inet, Rc<RefCell<Vec<PacketBuffer>>>) {
    let config = NetworkConfig::new(LOCAL_MAC, LOCAL_IP, Ipv4Addr::new(255, 255, 255, 0), None);
    let inet = Inet::new(config, pool.clone(), || 0);
    // resolve link addresses synchronously so transmissions surface at once
    inet.arp().set_resolver(Resolver::StaticMap);
    let sent = Rc::new(RefCell::new(Vec::new()));
    {
        let sent = sent.clone();
        inet.set_transmit_handler(move |buf| sent.borrow_mut().push(buf));
    }
    (inet, sent)
}

fn echo_request_frame(pool: &Arc<BufferPool>, ident: u16, seq: u16, payload: &[u8]) -> PacketBuffer {
    let mut buf = pool.allocate(0).unwrap();
    buf.set_size(EthernetFrame::HEADER_LEN).unwrap();
    buf.advance(EthernetFrame::HEADER_LEN).unwrap();
    {
        let mut ip = Ipv4Packet::init(&mut buf).unwrap();
        ip.set_protocol(protocol::ICMP);
        ip.set_src(REMOTE_IP);
        ip.set_dst(LOCAL_IP);
    }
    let total = buf.size() + 8 + payload.len() as u16;
    buf.set_size(total).unwrap();
    buf.advance(20).unwrap();
    {
        let mut icmp = IcmpPacket::new(&mut buf).unwrap();
        icmp.set_icmp_type(ECHO_REQUEST);
        icmp.set_code(0);
        icmp.set_identifier(ident);
        icmp.set_sequence(seq);
    }
    buf.data_mut()[42..].copy_from_slice(payload);
    {
        let mut icmp = IcmpPacket::new(&mut buf).unwrap();
        icmp.update_checksum();
    }
    buf.retract(20).unwrap();
    {
        let mut ip = Ipv4Packet::new(&mut buf).unwrap();
        ip.make_flight_ready();
    }
    buf.retract(EthernetFrame::HEADER_LEN).unwrap();
    {
        let mut frame = EthernetFrame::new(&mut buf).unwrap();
        frame.set_dst(LOCAL_MAC);
        frame.set_src(REMOTE_MAC);
        frame.set_ethertype(ETHERTYPE_IPV4);
    }
    buf
}

#[test]
fn echo_request_produces_a_matching_reply() {
    let pool = BufferPool::new(8, 2048);
    let (inet, sent) = stack(&pool);

    inet.receive(echo_request_frame(&pool, 0x1234, 7, b"ping payload"));

    let sent = sent.borrow();
    assert_eq!(sent.len(), 1);
    let reply = &sent[0];
    let bytes = reply.data();

    // IPv4, addresses swapped, our address filled in as source
    assert_eq!(&bytes[12..14], &ETHERTYPE_IPV4.to_be_bytes());
    assert_eq!(&bytes[26..30], &LOCAL_IP.octets());
    assert_eq!(&bytes[30..34], &REMOTE_IP.octets());
    assert!(checksum::verify(&bytes[14..34]));

    // echo reply with identifier, sequence and payload preserved
    assert_eq!(bytes[34], ECHO_REPLY);
    assert_eq!(u16::from_be_bytes([bytes[38], bytes[39]]), 0x1234);
    assert_eq!(u16::from_be_bytes([bytes[40], bytes[41]]), 7);
    assert_eq!(&bytes[42..], b"ping payload");
    assert!(checksum::verify(&bytes[34..]));

    assert_eq!(inet.icmp().requests_rx(), 1);
    assert_eq!(inet.icmp().replies_tx(), 1);
}

#[test]
fn reply_reuses_the_request_buffer() {
    let pool = BufferPool::new(8, 2048);
    let (inet, sent) = stack(&pool);

    let free_before = pool.available();
    inet.receive(echo_request_frame(&pool, 1, 1, b"x"));
    // one buffer in flight: the reply, built in place from the request
    assert_eq!(pool.available(), free_before - 1);
    sent.borrow_mut().clear();
    assert_eq!(pool.available(), free_before);
}

#[test]
fn send_echo_request_builds_a_ping() {
    let pool = BufferPool::new(8, 2048);
    let (inet, sent) = stack(&pool);

    inet.icmp()
        .send_echo_request(REMOTE_IP, 42, 3, b"abc")
        .unwrap();

    let sent = sent.borrow();
    assert_eq!(sent.len(), 1);
    let bytes = sent[0].data();
    assert_eq!(bytes[23], protocol::ICMP);
    assert_eq!(bytes[34], ECHO_REQUEST);
    assert_eq!(u16::from_be_bytes([bytes[38], bytes[39]]), 42);
    assert_eq!(u16::from_be_bytes([bytes[40], bytes[41]]), 3);
    assert_eq!(&bytes[42..], b"abc");
    assert!(checksum::verify(&bytes[34..]));
    assert!(checksum::verify(&bytes[14..34]));
}

#[test]
fn non_echo_types_are_dropped() {
    let pool = BufferPool::new(8, 2048);
    let (inet, sent) = stack(&pool);

    let mut frame = echo_request_frame(&pool, 0, 0, &[]);
    frame.data_mut()[34] = 13; // timestamp request
    // checksum field is stale now, which must not matter for the drop path
    inet.receive(frame);

    assert!(sent.borrow().is_empty());
}
