//! Error taxonomy for caller-misuse and backpressure conditions.
//!
//! Malformed input off the wire is never surfaced as an error value: the
//! receive paths drop such packets silently and bump a per-layer counter,
//! since a network stack must not be destabilized by corrupt or adversarial
//! traffic. `ErrorKind` covers only the conditions a caller caused and must
//! react to.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No free slot in the buffer pool. Apply backpressure (e.g. stop
    /// reading from the NIC) until buffers are released.
    PoolExhausted,
    /// An operation would read or write outside a buffer's allocated
    /// capacity or populated bytes.
    CapacityExceeded,
    /// A datagram larger than the interface can carry in one packet.
    PayloadTooLarge,
    /// The requested local port is already bound.
    PortInUse,
    /// Automatic port selection found no unbound port.
    PortsExhausted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::PoolExhausted => write!(f, "buffer pool exhausted"),
            ErrorKind::CapacityExceeded => write!(f, "buffer capacity exceeded"),
            ErrorKind::PayloadTooLarge => write!(f, "payload too large for one datagram"),
            ErrorKind::PortInUse => write!(f, "port already in use"),
            ErrorKind::PortsExhausted => write!(f, "no unbound ports available"),
        }
    }
}
