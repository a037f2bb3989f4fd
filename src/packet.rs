//! The owned packet-buffer unit
//!
//! A [`PacketBuffer`] is the single currency every layer exchanges: a block
//! of memory (a pool slot, or a private heap block when built pool-less)
//! plus the bookkeeping the protocol views need — populated size, a payload
//! cursor that slides forward as headers are consumed on receive and back
//! as they are claimed on transmit, and an optional singly-linked chain used
//! to build FIFOs out of buffers.
//!
//! Ownership is unique and transferable, never shared: there is no `Clone`,
//! and dropping the buffer is what returns its slot to the pool, so a slot
//! can neither leak nor be released twice.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use core::net::Ipv4Addr;
use core::ptr::NonNull;

use crate::error::ErrorKind;
use crate::pool::BufferPool;

enum Storage {
    Pooled { pool: Arc<BufferPool>, slot: u16 },
    Heap(Box<[u8]>),
}

pub struct PacketBuffer {
    storage: Storage,
    capacity: u16,
    /// Populated bytes; `size <= capacity`.
    size: u16,
    /// Payload cursor, always within `[0, size]`.
    payload: u16,
    /// Next-hop address stamped by the network layer for the resolver.
    next_hop: Ipv4Addr,
    chain: Option<Box<PacketBuffer>>,
    /// Cached terminal buffer of `chain`, so appends stay O(1).
    last: Option<NonNull<PacketBuffer>>,
}

impl core::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("capacity", &self.capacity)
            .field("size", &self.size)
            .field("payload", &self.payload)
            .field("next_hop", &self.next_hop)
            .finish()
    }
}

impl PacketBuffer {
    pub(crate) fn from_pool(pool: Arc<BufferPool>, slot: u16) -> Self {
        let capacity = pool.slot_size();
        Self {
            storage: Storage::Pooled { pool, slot },
            capacity,
            size: 0,
            payload: 0,
            next_hop: Ipv4Addr::UNSPECIFIED,
            chain: None,
            last: None,
        }
    }

    /// A buffer backed by its own heap block instead of a pool slot.
    pub fn heap(capacity: u16) -> Self {
        Self {
            storage: Storage::Heap(vec![0u8; capacity as usize].into_boxed_slice()),
            capacity,
            size: 0,
            payload: 0,
            next_hop: Ipv4Addr::UNSPECIFIED,
            chain: None,
            last: None,
        }
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Number of populated bytes.
    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn set_size(&mut self, new_size: u16) -> Result<(), ErrorKind> {
        if new_size > self.capacity {
            return Err(ErrorKind::CapacityExceeded);
        }
        self.size = new_size;
        Ok(())
    }

    /// Current payload cursor offset.
    pub fn payload_offset(&self) -> u16 {
        self.payload
    }

    /// Slide the cursor forward past a consumed header.
    pub fn advance(&mut self, n: u16) -> Result<(), ErrorKind> {
        let moved = self.payload.checked_add(n).ok_or(ErrorKind::CapacityExceeded)?;
        if moved > self.size {
            return Err(ErrorKind::CapacityExceeded);
        }
        self.payload = moved;
        Ok(())
    }

    /// Slide the cursor back over a header about to be written.
    pub fn retract(&mut self, n: u16) -> Result<(), ErrorKind> {
        self.payload = self.payload.checked_sub(n).ok_or(ErrorKind::CapacityExceeded)?;
        Ok(())
    }

    /// All populated bytes, `[0, size)`.
    pub fn data(&self) -> &[u8] {
        match &self.storage {
            Storage::Pooled { pool, slot } => {
                // SAFETY: we own this slot exclusively (move-only type, no
                // Clone) and size <= capacity == slot_size.
                unsafe { core::slice::from_raw_parts(pool.slot_data(*slot), self.size as usize) }
            }
            Storage::Heap(block) => &block[..self.size as usize],
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Pooled { pool, slot } => {
                // SAFETY: exclusive ownership as above, plus &mut self.
                unsafe { core::slice::from_raw_parts_mut(pool.slot_data(*slot), self.size as usize) }
            }
            Storage::Heap(block) => &mut block[..self.size as usize],
        }
    }

    /// Bytes from the cursor to the end of the populated region.
    pub fn payload(&self) -> &[u8] {
        &self.data()[self.payload as usize..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let at = self.payload as usize;
        &mut self.data_mut()[at..]
    }

    pub fn next_hop(&self) -> Ipv4Addr {
        self.next_hop
    }

    pub fn set_next_hop(&mut self, addr: Ipv4Addr) {
        self.next_hop = addr;
    }

    /// Append `p` (which may itself be a chain) to the tail of this chain.
    pub fn chain(&mut self, p: PacketBuffer) {
        let mut boxed = Box::new(p);
        let appended_last = boxed.last.unwrap_or_else(|| NonNull::from(&mut *boxed));
        match self.last {
            None => {
                debug_assert!(self.chain.is_none());
                self.chain = Some(boxed);
                self.last = Some(appended_last);
            }
            Some(mut last) => {
                // SAFETY: `last` points at the terminal buffer of our chain,
                // which lives in a Box reachable from self.chain; we hold
                // &mut self, so no other reference into the chain exists.
                let tail = unsafe { last.as_mut() };
                debug_assert!(tail.chain.is_none());
                tail.chain = Some(boxed);
                self.last = Some(appended_last);
            }
        }
    }

    /// Detach and return everything after this buffer. Used to pop work
    /// items from a FIFO built on chaining: the head is the popped item,
    /// the returned chain is the remaining queue.
    pub fn detach_tail(&mut self) -> Option<PacketBuffer> {
        self.last = None;
        let mut head = *self.chain.take()?;
        head.refresh_last();
        Some(head)
    }

    /// Whether more buffers are chained behind this one.
    pub fn has_chain(&self) -> bool {
        self.chain.is_some()
    }

    fn refresh_last(&mut self) {
        self.last = self
            .chain
            .as_deref_mut()
            .map(|c| NonNull::from(c.terminal_mut()));
    }

    fn terminal_mut(&mut self) -> &mut PacketBuffer {
        match self.chain {
            Some(ref mut next) => next.terminal_mut(),
            None => self,
        }
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        // Unlink iteratively so a long chain cannot blow the stack.
        while let Some(mut next) = self.chain.take() {
            self.chain = next.chain.take();
        }
        if let Storage::Pooled { pool, slot } = &self.storage {
            pool.release(*slot);
        }
    }
}
