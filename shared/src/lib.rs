#![cfg_attr(not(test), no_std)]

// Shared crate for moteOS
// Kernel services consumed by device drivers: page frames, address spaces,
// scheduling and interrupt-line control

pub mod memory;
pub mod sched;

// Re-export shared kernel service types
pub use memory::{
    page_offset, page_round_down, AddressSpace, FrameAllocator, MapError, PageFlags, PhysAddr,
    PAGE_SIZE,
};
pub use sched::{ContextId, InterruptController, Scheduler};
