//! Intel 82540EM register map and MMIO access.
//!
//! Offsets and bit positions follow the controller datasheet. All register
//! traffic goes through [`RegisterIo`] so the driver core can run against a
//! mapped BAR ([`Mmio`]) or a simulated register file.

use bitflags::bitflags;
use core::ptr::NonNull;
use core::sync::atomic::{fence, Ordering};
use volatile::VolatilePtr;

// ---------------------------------------------------------------------------
// Register offsets
// ---------------------------------------------------------------------------

/// Device Control
pub const CTRL: usize = 0x0000;
/// Device Status
pub const STATUS: usize = 0x0008;
/// EEPROM Read
pub const EERD: usize = 0x0014;
/// Interrupt Cause Read (reading clears the pending causes)
pub const ICR: usize = 0x00C0;
/// Interrupt Cause Set
#[cfg(test)]
pub(crate) const ICS: usize = 0x00C8;
/// Interrupt Mask Set/Read
pub const IMS: usize = 0x00D0;
/// Interrupt Mask Clear
pub const IMC: usize = 0x00D8;
/// Receive Control
pub const RCTL: usize = 0x0100;
/// Transmit Control
pub const TCTL: usize = 0x0400;
/// Transmit Inter-Packet Gap
pub const TIPG: usize = 0x0410;
/// RX Descriptor Base Address Low
pub const RDBAL: usize = 0x2800;
/// RX Descriptor Base Address High
pub const RDBAH: usize = 0x2804;
/// RX Descriptor Ring Length (bytes)
pub const RDLEN: usize = 0x2808;
/// RX Descriptor Head
pub const RDH: usize = 0x2810;
/// RX Descriptor Tail
pub const RDT: usize = 0x2818;
/// TX Descriptor Base Address Low
pub const TDBAL: usize = 0x3800;
/// TX Descriptor Base Address High
pub const TDBAH: usize = 0x3804;
/// TX Descriptor Ring Length (bytes)
pub const TDLEN: usize = 0x3808;
/// TX Descriptor Head
pub const TDH: usize = 0x3810;
/// TX Descriptor Tail
pub const TDT: usize = 0x3818;
/// Multicast Table Array base (128 x 32-bit entries)
pub const MTA: usize = 0x5200;
/// Number of 32-bit entries in the MTA
pub const MTA_COUNT: usize = 128;
/// Receive Address Low, entry 0
pub const RAL0: usize = 0x5400;
/// Receive Address High, entry 0
pub const RAH0: usize = 0x5404;

/// RAH: Address Valid
pub const RAH_AV: u32 = 1 << 31;

// ---------------------------------------------------------------------------
// Register bit fields
// ---------------------------------------------------------------------------

bitflags! {
    /// Device Control (CTRL)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ctrl: u32 {
        /// Set Link Up
        const SLU = 1 << 6;
    }
}

bitflags! {
    /// Device Status (STATUS)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        const FD = 1 << 0;
        /// Link Up
        const LU = 1 << 1;
    }
}

bitflags! {
    /// Receive Control (RCTL)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rctl: u32 {
        /// Receiver Enable
        const EN = 1 << 1;
        /// Store Bad Packets
        const SBP = 1 << 2;
        /// Unicast Promiscuous
        const UPE = 1 << 3;
        /// Multicast Promiscuous
        const MPE = 1 << 4;
        /// Long Packet Enable
        const LPE = 1 << 5;
        /// Broadcast Accept Mode
        const BAM = 1 << 15;
        /// Buffer Size Extension
        const BSEX = 1 << 25;
        /// Strip Ethernet CRC
        const SECRC = 1 << 26;
    }
}

/// RCTL loopback mode field (bits 7:6); zero means no loopback
pub const RCTL_LBM_MASK: u32 = 0b11 << 6;
/// RCTL buffer size field (bits 17:16); zero with BSEX clear means 2048 bytes
pub const RCTL_BSIZE_MASK: u32 = 0b11 << 16;

bitflags! {
    /// Transmit Control (TCTL)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Tctl: u32 {
        /// Transmitter Enable
        const EN = 1 << 1;
        /// Pad Short Packets
        const PSP = 1 << 3;
    }
}

/// TCTL Collision Threshold shift (bits 11:4)
pub const TCTL_CT_SHIFT: u32 = 4;
/// TCTL Collision Distance shift (bits 21:12)
pub const TCTL_COLD_SHIFT: u32 = 12;

bitflags! {
    /// Interrupt causes, shared by ICR / ICS / IMS / IMC
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptCause: u32 {
        /// Transmit Queue Empty
        const TXQE = 1 << 1;
        /// Receiver Timer Interrupt (frame received)
        const RXT0 = 1 << 7;
    }
}

bitflags! {
    /// EEPROM Read (EERD) control bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Eerd: u32 {
        const START = 1 << 0;
        const DONE = 1 << 4;
    }
}

/// EERD word address shift (bits 15:8)
pub const EERD_ADDR_SHIFT: u32 = 8;
/// EERD read data shift (bits 31:16)
pub const EERD_DATA_SHIFT: u32 = 16;

// ---------------------------------------------------------------------------
// Register access
// ---------------------------------------------------------------------------

/// 32-bit register access by byte offset
///
/// Implementations must perform each access exactly once, in program order,
/// and ordered after any preceding descriptor-memory stores.
pub trait RegisterIo {
    fn read(&self, offset: usize) -> u32;
    fn write(&self, offset: usize, value: u32);
}

/// The controller's register block mapped uncached into kernel space
pub struct Mmio {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: the mapping is device memory with no thread affinity; every access
// is a single volatile load or store.
unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

impl Mmio {
    /// Wrap a mapped register window.
    ///
    /// # Safety
    /// `base` must point to `size` bytes of uncached MMIO mapping that stays
    /// valid for the lifetime of the returned value.
    pub unsafe fn new(base: *mut u8, size: usize) -> Option<Self> {
        NonNull::new(base).map(|base| Self { base, size })
    }

    fn register(&self, offset: usize) -> VolatilePtr<'_, u32> {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.size,
            "e1000: register offset {:#x} outside mapped window",
            offset
        );
        // SAFETY: offset is aligned and inside the window checked above.
        unsafe {
            VolatilePtr::new(NonNull::new_unchecked(
                self.base.as_ptr().add(offset).cast::<u32>(),
            ))
        }
    }
}

impl RegisterIo for Mmio {
    fn read(&self, offset: usize) -> u32 {
        let value = self.register(offset).read();
        // Descriptor reads that depend on this value must not be hoisted above it
        fence(Ordering::Acquire);
        value
    }

    fn write(&self, offset: usize, value: u32) {
        // Publish descriptor-memory stores before the doorbell
        fence(Ordering::SeqCst);
        self.register(offset).write(value);
    }
}
