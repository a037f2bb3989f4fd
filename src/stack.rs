//! Stack assembly
//!
//! [`Inet`] owns one instance of every layer and wires the delegates into
//! the canonical data flow:
//!
//! ```text
//! driver -> Ethernet::receive -> { Arp::receive | Ip4::bottom }
//!                                       -> { Icmp::receive | Udp::receive } -> sockets
//! sockets/ping -> Ip4::transmit -> Arp::transmit -> Ethernet::transmit -> driver
//! ```
//!
//! The driver side stays at arm's length: frames come in through
//! [`Inet::receive`], go out through the registered transmit handler, and
//! are allocated from the shared [`BufferPool`].

use alloc::rc::Rc;
use alloc::sync::Arc;
use core::net::Ipv4Addr;

use log::warn;

use crate::arp::Arp;
use crate::error::ErrorKind;
use crate::ethernet::{Ethernet, MacAddr};
use crate::icmp::Icmp;
use crate::ipv4::{Ip4, RoutingTable};
use crate::packet::PacketBuffer;
use crate::pool::BufferPool;
use crate::udp::Udp;

pub const DEFAULT_MTU: u16 = 1500;

/// Static interface configuration.
#[derive(Debug, Clone, Copy)]
pub struct NetworkConfig {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub mtu: u16,
}

impl NetworkConfig {
    pub fn new(mac: MacAddr, ip: Ipv4Addr, netmask: Ipv4Addr, gateway: Option<Ipv4Addr>) -> Self {
        Self { mac, ip, netmask, gateway, mtu: DEFAULT_MTU }
    }
}

/// A fully wired protocol stack for one interface.
pub struct Inet {
    pool: Arc<BufferPool>,
    ethernet: Rc<Ethernet>,
    arp: Rc<Arp>,
    ip4: Rc<Ip4>,
    icmp: Rc<Icmp>,
    udp: Rc<Udp>,
}

impl Inet {
    /// Build and wire the stack. `clock` supplies seconds since boot for
    /// ARP cache expiry; on a real target this is the timer facility, in
    /// tests an adjustable counter.
    pub fn new(config: NetworkConfig, pool: Arc<BufferPool>, clock: impl Fn() -> u64 + 'static) -> Self {
        let ethernet = Rc::new(Ethernet::new(config.mac));
        let arp = Rc::new(Arp::new(config.mac, config.ip, clock));
        let routing = RoutingTable::new(config.ip, config.netmask, config.gateway);
        let ip4 = Rc::new(Ip4::new(routing, config.mtu));
        let icmp = Rc::new(Icmp::new());
        let udp = Udp::new();

        udp.set_local_ip(config.ip);
        udp.set_mdds(ip4.mdds());

        // upstream: link -> network -> transport
        {
            let arp = arp.clone();
            ethernet.set_arp_upstream(move |buf| arp.receive(buf));
        }
        {
            let ip4 = ip4.clone();
            ethernet.set_ip4_upstream(move |buf| ip4.bottom(buf));
        }
        {
            let icmp = icmp.clone();
            ip4.set_icmp_handler(move |buf| icmp.receive(buf));
        }
        {
            let udp = udp.clone();
            ip4.set_udp_handler(move |buf| udp.receive(buf));
        }

        // downstream: transport -> network -> resolver -> link
        {
            let arp = arp.clone();
            ip4.set_linklayer_out(move |buf| arp.transmit(buf));
        }
        {
            let ethernet = ethernet.clone();
            arp.set_link_downstream(move |buf, dst, ethertype| ethernet.transmit(buf, dst, ethertype));
        }
        {
            let ip4 = ip4.clone();
            udp.set_network_downstream(move |buf| {
                if let Err(e) = ip4.transmit(buf) {
                    warn!("udp: transmit rejected: {}", e);
                }
            });
        }
        {
            let ip4 = ip4.clone();
            icmp.set_network_downstream(move |buf| {
                if let Err(e) = ip4.transmit(buf) {
                    warn!("icmp: transmit rejected: {}", e);
                }
            });
        }

        // every layer that originates packets draws from the shared pool
        {
            let pool = pool.clone();
            arp.set_frame_source(move || pool.allocate(0));
        }
        {
            let pool = pool.clone();
            udp.set_frame_source(move || pool.allocate(0));
        }
        {
            let pool = pool.clone();
            icmp.set_frame_source(move || pool.allocate(0));
        }

        Self { pool, ethernet, arp, ip4, icmp, udp }
    }

    /// Ingress: hand a raw frame from the driver to the link layer.
    pub fn receive(&self, buf: PacketBuffer) {
        self.ethernet.receive(buf);
    }

    /// Egress registration: the driver's transmit function.
    pub fn set_transmit_handler(&self, handler: impl FnMut(PacketBuffer) + 'static) {
        self.ethernet.set_physical_downstream(handler);
    }

    /// A fresh frame buffer from the interface pool.
    pub fn create_frame(&self) -> Result<PacketBuffer, ErrorKind> {
        self.pool.allocate(0)
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn ethernet(&self) -> &Rc<Ethernet> {
        &self.ethernet
    }

    pub fn arp(&self) -> &Rc<Arp> {
        &self.arp
    }

    pub fn ip4(&self) -> &Rc<Ip4> {
        &self.ip4
    }

    pub fn icmp(&self) -> &Rc<Icmp> {
        &self.icmp
    }

    pub fn udp(&self) -> &Rc<Udp> {
        &self.udp
    }
}
