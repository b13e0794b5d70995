//! Legacy 16-byte transmit and receive descriptors.
//!
//! Layouts are consumed by the controller's DMA engine and must match the
//! datasheet byte for byte.

use core::mem::size_of;

/// Legacy transmit descriptor
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxDesc {
    /// Physical address of the frame data
    pub addr: u64,
    /// Number of bytes to send from `addr`
    pub length: u16,
    /// Checksum offset
    pub cso: u8,
    /// Command bits (`TXD_CMD_*`)
    pub cmd: u8,
    /// Status bits (`TXD_STAT_*`), written back by hardware
    pub status: u8,
    /// Checksum start
    pub css: u8,
    /// VLAN tag
    pub special: u16,
}

/// Legacy receive descriptor
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxDesc {
    /// Physical address of the receive buffer
    pub addr: u64,
    /// Bytes written into the buffer (CRC already stripped)
    pub length: u16,
    /// Packet checksum
    pub checksum: u16,
    /// Status bits (`RXD_STAT_*`)
    pub status: u8,
    /// Error bits
    pub errors: u8,
    /// VLAN tag
    pub special: u16,
}

const _: () = assert!(size_of::<TxDesc>() == 16);
const _: () = assert!(size_of::<RxDesc>() == 16);

/// End of Packet
pub const TXD_CMD_EOP: u8 = 0x01;
/// Insert FCS
pub const TXD_CMD_IFCS: u8 = 0x02;
/// Report Status: hardware sets DD once the descriptor is processed
pub const TXD_CMD_RS: u8 = 0x08;

/// Descriptor Done
pub const TXD_STAT_DD: u8 = 0x01;

/// Descriptor Done
pub const RXD_STAT_DD: u8 = 0x01;
/// End of Packet
pub const RXD_STAT_EOP: u8 = 0x02;

impl TxDesc {
    /// A free slot pointing at `addr`
    pub const fn free(addr: u64) -> Self {
        Self {
            addr,
            length: 0,
            cso: 0,
            cmd: TXD_CMD_RS | TXD_CMD_EOP,
            status: TXD_STAT_DD,
            css: 0,
            special: 0,
        }
    }

    pub const fn is_done(&self) -> bool {
        self.status & TXD_STAT_DD != 0
    }
}

impl RxDesc {
    /// An empty slot the controller may fill
    pub const fn empty(addr: u64) -> Self {
        Self {
            addr,
            length: 0,
            checksum: 0,
            status: 0,
            errors: 0,
            special: 0,
        }
    }

    pub const fn is_done(&self) -> bool {
        self.status & RXD_STAT_DD != 0
    }

    pub const fn is_end_of_packet(&self) -> bool {
        self.status & RXD_STAT_EOP != 0
    }
}
