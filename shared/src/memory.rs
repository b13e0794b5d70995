// Physical memory and address-space services shared across moteOS crates

use bitflags::bitflags;
use core::fmt;
use thiserror::Error;

/// Size of a physical page frame and of a virtual page
pub const PAGE_SIZE: usize = 4096;

/// Round a virtual address down to the start of its page
pub const fn page_round_down(va: usize) -> usize {
    va & !(PAGE_SIZE - 1)
}

/// Offset of a virtual address within its page
pub const fn page_offset(va: usize) -> usize {
    va & (PAGE_SIZE - 1)
}

/// A physical (bus) address as seen by DMA-capable devices
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysAddr(u64);

impl PhysAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Lower 32 bits, for split base-address registers
    pub const fn low_u32(self) -> u32 {
        self.0 as u32
    }

    /// Upper 32 bits, for split base-address registers
    pub const fn high_u32(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn add(self, offset: usize) -> Self {
        Self(self.0 + offset as u64)
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE as u64 - 1) == 0
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

bitflags! {
    /// Page mapping permissions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT = 0x001;
        const WRITABLE = 0x002;
        const USER = 0x004;
        /// Software-available bit: the page is shared and duplicated on first write
        const COPY_ON_WRITE = 0x800;
    }
}

/// Address-space mapping errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("out of memory for page tables")]
    OutOfMemory,

    #[error("address is not page aligned")]
    Misaligned,

    #[error("address is not mapped")]
    Unmapped,
}

/// Physical page frame allocator
///
/// Frames handed out are owned by the caller until passed back to
/// [`FrameAllocator::free_page`].
pub trait FrameAllocator {
    /// Allocate one zero-filled page frame
    ///
    /// # Returns
    /// * `Some(addr)` - Page-aligned physical address of the frame
    /// * `None` - No free frames remain
    fn alloc_zeroed_page(&self) -> Option<PhysAddr>;

    /// Return a frame to the allocator
    fn free_page(&self, page: PhysAddr);

    /// Kernel virtual address through which a physical address can be accessed
    fn phys_to_virt(&self, addr: PhysAddr) -> *mut u8;
}

/// A (user) virtual address space
pub trait AddressSpace {
    /// Find the frame and permissions backing the page containing `va`
    fn lookup(&self, va: usize) -> Option<(PhysAddr, PageFlags)>;

    /// Map `page` at the page-aligned address `va`, replacing any existing mapping
    fn map(&self, va: usize, page: PhysAddr, flags: PageFlags) -> Result<(), MapError>;

    /// Remove the mapping at `va`, if any
    fn unmap(&self, va: usize);
}
