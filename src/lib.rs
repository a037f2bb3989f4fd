//! nanonet - a pool-backed, zero-copy UDP/IP network stack
//!
//! The stack is built around a single buffer currency: a [`PacketBuffer`]
//! drawn from a fixed-slot [`BufferPool`] is viewed in place as successively
//! narrower protocol units while it climbs the stack, and widened again on
//! the way back down. No payload bytes are ever copied between layers.
//!
//! ```text
//! NIC -> PacketBuffer -> EthernetFrame -> { Arp | Ipv4Packet } -> { Icmp | UdpDatagram }
//!                                                                         |
//!                                                                  socket callback
//! ```
//!
//! Layers hand buffers to each other through registered delegates, so the
//! whole stack runs on one logical thread of control with no blocking
//! operation anywhere: long-latency work (ARP resolution) parks its packet
//! and returns, resuming from a callback when the awaited reply arrives.
//!
//! [`stack::Inet`] wires one instance of every layer together; a NIC driver
//! only needs `Inet::receive` for ingress and a transmit handler for egress.

#![no_std]

extern crate alloc;

pub mod arp;
pub mod checksum;
pub mod error;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod packet;
pub mod pool;
pub mod stack;
pub mod udp;

pub use error::ErrorKind;
pub use ethernet::MacAddr;
pub use packet::PacketBuffer;
pub use pool::BufferPool;
pub use stack::{Inet, NetworkConfig};
