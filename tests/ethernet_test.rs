use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use nanonet::ethernet::{Ethernet, EthernetFrame, MacAddr, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use nanonet::packet::PacketBuffer;
use nanonet::pool::BufferPool;

const OUR_MAC: MacAddr = MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);

fn frame_from(pool: &Arc<BufferPool>, bytes: &[u8]) -> PacketBuffer {
    let mut buf = pool.allocate(bytes.len() as u16).unwrap();
    buf.set_size(bytes.len() as u16).unwrap();
    buf.data_mut().copy_from_slice(bytes);
    buf
}

fn raw_frame(dst: MacAddr, src: MacAddr, ethertype: u16, payload_len: usize) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&dst.octets());
    bytes.extend_from_slice(&src.octets());
    bytes.extend_from_slice(&ethertype.to_be_bytes());
    bytes.extend(std::iter::repeat(0u8).take(payload_len));
    bytes
}

#[test]
fn frame_view_round_trips_the_cursor() {
    let mut buf = PacketBuffer::heap(64);
    buf.set_size(40).unwrap();

    let mut frame = EthernetFrame::new(&mut buf).unwrap();
    frame.enter().unwrap();
    frame.leave().unwrap();
    drop(frame);
    assert_eq!(buf.payload_offset(), 0);
}

#[test]
fn receive_dispatches_by_ethertype() {
    let pool = BufferPool::new(4, 256);
    let eth = Ethernet::new(OUR_MAC);

    let to_ip4 = Rc::new(RefCell::new(0u32));
    let to_arp = Rc::new(RefCell::new(0u32));
    {
        let to_ip4 = to_ip4.clone();
        eth.set_ip4_upstream(move |buf| {
            // the link header has been consumed by the time we see it
            assert_eq!(buf.payload_offset(), EthernetFrame::HEADER_LEN);
            *to_ip4.borrow_mut() += 1;
        });
    }
    {
        let to_arp = to_arp.clone();
        eth.set_arp_upstream(move |_| *to_arp.borrow_mut() += 1);
    }

    let peer = MacAddr([2, 0, 0, 0, 0, 9]);
    eth.receive(frame_from(&pool, &raw_frame(OUR_MAC, peer, ETHERTYPE_IPV4, 30)));
    eth.receive(frame_from(&pool, &raw_frame(MacAddr::BROADCAST, peer, ETHERTYPE_ARP, 30)));

    assert_eq!(*to_ip4.borrow(), 1);
    assert_eq!(*to_arp.borrow(), 1);
    assert_eq!(eth.frames_rx(), 2);
}

#[test]
fn unicast_frames_for_other_hosts_are_dropped() {
    let pool = BufferPool::new(4, 256);
    let eth = Ethernet::new(OUR_MAC);

    let delivered = Rc::new(RefCell::new(0u32));
    {
        let delivered = delivered.clone();
        eth.set_ip4_upstream(move |_| *delivered.borrow_mut() += 1);
    }

    let someone_else = MacAddr([0x52, 0x54, 0x00, 0xAA, 0xBB, 0xCC]);
    let peer = MacAddr([2, 0, 0, 0, 0, 9]);
    eth.receive(frame_from(&pool, &raw_frame(someone_else, peer, ETHERTYPE_IPV4, 30)));

    assert_eq!(*delivered.borrow(), 0);
    assert_eq!(eth.frames_dropped(), 1);
}

#[test]
fn unknown_ethertype_is_counted_and_dropped() {
    let pool = BufferPool::new(4, 256);
    let eth = Ethernet::new(OUR_MAC);
    eth.receive(frame_from(&pool, &raw_frame(MacAddr::BROADCAST, MacAddr::ZERO, 0x86DD, 30)));
    assert_eq!(eth.frames_dropped(), 1);
}

#[test]
fn truncated_frames_never_reach_upstream() {
    let pool = BufferPool::new(4, 256);
    let eth = Ethernet::new(OUR_MAC);
    let reached = Rc::new(RefCell::new(0u32));
    {
        let reached = reached.clone();
        eth.set_ip4_upstream(move |_| *reached.borrow_mut() += 1);
    }
    eth.receive(frame_from(&pool, &[0u8; 10]));
    assert_eq!(*reached.borrow(), 0);
    assert_eq!(eth.frames_dropped(), 1);
}

#[test]
fn transmit_writes_the_link_header_and_forwards() {
    let pool = BufferPool::new(4, 256);
    let eth = Ethernet::new(OUR_MAC);

    let sent = Rc::new(RefCell::new(Vec::new()));
    {
        let sent = sent.clone();
        eth.set_physical_downstream(move |buf| sent.borrow_mut().push(buf));
    }

    // a buffer whose cursor sits at the network header, link bytes below it
    let mut buf = pool.allocate(0).unwrap();
    buf.set_size(50).unwrap();
    buf.advance(EthernetFrame::HEADER_LEN).unwrap();

    let dst = MacAddr([2, 0, 10, 0, 0, 9]);
    eth.transmit(buf, dst, ETHERTYPE_IPV4);

    let sent = sent.borrow();
    assert_eq!(sent.len(), 1);
    let frame = &sent[0];
    assert_eq!(frame.payload_offset(), 0);
    assert_eq!(&frame.data()[..6], &dst.octets());
    assert_eq!(&frame.data()[6..12], &OUR_MAC.octets());
    assert_eq!(&frame.data()[12..14], &ETHERTYPE_IPV4.to_be_bytes());
    assert_eq!(eth.frames_tx(), 1);
}

#[test]
fn mac_address_classes() {
    assert!(MacAddr::BROADCAST.is_broadcast());
    assert!(MacAddr([0x01, 0, 0x5E, 0, 0, 1]).is_multicast());
    assert!(OUR_MAC.is_unicast());
    assert_eq!(format!("{}", OUR_MAC), "52:54:00:12:34:56");
}
