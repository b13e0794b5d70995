//! Descriptor rings and per-slot buffer ownership.

use super::desc::{RxDesc, TxDesc};
use crate::error::NetError;
use core::mem::size_of;
use core::ptr::{self, NonNull};
use heapless::Vec;
use log::debug;
use shared::{FrameAllocator, PhysAddr, PAGE_SIZE};

/// Descriptors that fit in the single page backing a ring
pub const MAX_RING_SIZE: usize = PAGE_SIZE / size_of::<TxDesc>();

/// Who currently holds the page a ring slot points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwner {
    /// Allocated by and private to the ring
    Ring(PhysAddr),
    /// A caller's page, mapped copy-on-write while the device may still read it
    SharedCopyOnWrite(PhysAddr),
    /// Handed to a caller; the slot's replacement has not been installed yet
    Caller(PhysAddr),
}

impl BufferOwner {
    pub fn page(&self) -> PhysAddr {
        match *self {
            BufferOwner::Ring(page)
            | BufferOwner::SharedCopyOnWrite(page)
            | BufferOwner::Caller(page) => page,
        }
    }
}

/// A descriptor array living in one DMA page
pub struct DescRing<D> {
    base: NonNull<D>,
    page: PhysAddr,
    size: u16,
}

// SAFETY: the descriptor page is owned by the ring; concurrent access from
// the device is coordinated through the done-bit protocol.
unsafe impl<D: Send> Send for DescRing<D> {}

impl<D: Copy> DescRing<D> {
    fn new<F: FrameAllocator + ?Sized>(frames: &F, size: u16) -> Result<Self, NetError> {
        assert!(size as usize <= MAX_RING_SIZE);
        let page = frames.alloc_zeroed_page().ok_or(NetError::OutOfMemory)?;
        let base = match NonNull::new(frames.phys_to_virt(page).cast::<D>()) {
            Some(base) => base,
            None => {
                frames.free_page(page);
                return Err(NetError::OutOfMemory);
            }
        };
        Ok(Self { base, page, size })
    }

    /// Number of slots
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Physical address of the descriptor array
    pub fn page(&self) -> PhysAddr {
        self.page
    }

    /// Ring length in bytes, as programmed into xDLEN
    pub fn byte_len(&self) -> u32 {
        (self.size as usize * size_of::<D>()) as u32
    }

    /// Slot following `index`
    pub fn next(&self, index: u16) -> u16 {
        (index + 1) % self.size
    }

    /// Volatile snapshot of a descriptor
    pub fn read(&self, index: u16) -> D {
        assert!(index < self.size, "descriptor index {} out of range", index);
        // SAFETY: index is within the descriptor page.
        unsafe { ptr::read_volatile(self.base.as_ptr().add(index as usize)) }
    }

    /// Volatile store of a whole descriptor
    pub fn write(&self, index: u16, desc: D) {
        assert!(index < self.size, "descriptor index {} out of range", index);
        // SAFETY: index is within the descriptor page.
        unsafe { ptr::write_volatile(self.base.as_ptr().add(index as usize), desc) }
    }
}

/// Transmit ring: descriptors plus the page each slot currently references
pub struct TxRing {
    pub descs: DescRing<TxDesc>,
    pub buffers: Vec<BufferOwner, MAX_RING_SIZE>,
}

/// Receive ring: descriptors plus the page each slot fills
pub struct RxRing {
    pub descs: DescRing<RxDesc>,
    pub buffers: Vec<BufferOwner, MAX_RING_SIZE>,
}

/// Allocate one page per slot, releasing everything on failure
fn alloc_slot_pages<F: FrameAllocator + ?Sized>(
    frames: &F,
    size: u16,
) -> Result<Vec<BufferOwner, MAX_RING_SIZE>, NetError> {
    let mut buffers = Vec::new();
    for _ in 0..size {
        match frames.alloc_zeroed_page() {
            Some(page) => {
                // Capacity is MAX_RING_SIZE and size never exceeds it
                let _ = buffers.push(BufferOwner::Ring(page));
            }
            None => {
                release_pages(frames, &buffers);
                return Err(NetError::OutOfMemory);
            }
        }
    }
    Ok(buffers)
}

fn release_pages<F: FrameAllocator + ?Sized>(frames: &F, buffers: &[BufferOwner]) {
    for owner in buffers {
        if let BufferOwner::Ring(page) = owner {
            frames.free_page(*page);
        }
    }
}

/// Build a transmit ring with every slot free (done-bit set)
pub fn build_tx_ring<F: FrameAllocator + ?Sized>(frames: &F, size: u16) -> Result<TxRing, NetError> {
    let descs = DescRing::<TxDesc>::new(frames, size)?;
    let buffers = match alloc_slot_pages(frames, size) {
        Ok(buffers) => buffers,
        Err(e) => {
            frames.free_page(descs.page());
            return Err(e);
        }
    };

    for (index, owner) in buffers.iter().enumerate() {
        descs.write(index as u16, TxDesc::free(owner.page().as_u64()));
    }

    debug!("e1000: tx ring of {} slots at {}", size, descs.page());
    Ok(TxRing { descs, buffers })
}

/// Build a receive ring with every slot empty (done-bit clear)
pub fn build_rx_ring<F: FrameAllocator + ?Sized>(frames: &F, size: u16) -> Result<RxRing, NetError> {
    let descs = DescRing::<RxDesc>::new(frames, size)?;
    let buffers = match alloc_slot_pages(frames, size) {
        Ok(buffers) => buffers,
        Err(e) => {
            frames.free_page(descs.page());
            return Err(e);
        }
    };

    for (index, owner) in buffers.iter().enumerate() {
        descs.write(index as u16, RxDesc::empty(owner.page().as_u64()));
    }

    debug!("e1000: rx ring of {} slots at {}", size, descs.page());
    Ok(RxRing { descs, buffers })
}

impl TxRing {
    /// Give every ring-owned page back to the allocator
    pub fn release<F: FrameAllocator + ?Sized>(self, frames: &F) {
        release_pages(frames, &self.buffers);
        frames.free_page(self.descs.page());
    }
}

impl RxRing {
    /// Give every ring-owned page back to the allocator
    pub fn release<F: FrameAllocator + ?Sized>(self, frames: &F) {
        release_pages(frames, &self.buffers);
        frames.free_page(self.descs.page());
    }
}
