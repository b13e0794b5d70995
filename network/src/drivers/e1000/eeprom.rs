//! EEPROM access and the station MAC address.

use super::regs::{Eerd, RegisterIo, EERD, EERD_ADDR_SHIFT, EERD_DATA_SHIFT};
use core::fmt;

/// EEPROM word addresses holding the burned-in station address
const MAC_WORDS: [u8; 3] = [0, 1, 2];

/// 48-bit Ethernet station address
///
/// Stored as the value a little-endian load of the six address octets would
/// produce: octet 0 is the least significant byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(u64);

impl MacAddress {
    /// Assemble an address from the three EEPROM words, lowest word first
    pub const fn from_eeprom_words(words: [u16; 3]) -> Self {
        Self((words[0] as u64) | ((words[1] as u64) << 16) | ((words[2] as u64) << 32))
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Address octets in transmission order
    pub fn octets(self) -> [u8; 6] {
        let bytes = self.0.to_le_bytes();
        [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]]
    }

    /// Value for the Receive Address Low register
    pub const fn ral(self) -> u32 {
        self.0 as u32
    }

    /// Value for the address half of Receive Address High
    pub const fn rah(self) -> u32 {
        ((self.0 >> 32) & 0xFFFF) as u32
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.octets();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// Read one 16-bit word from the EEPROM
///
/// Busy-waits for the DONE bit with no timeout; the EEPROM answers within
/// microseconds and a dead part is not recoverable anyway.
pub fn read_word<R: RegisterIo + ?Sized>(regs: &R, address: u8) -> u16 {
    regs.write(
        EERD,
        Eerd::START.bits() | ((address as u32) << EERD_ADDR_SHIFT),
    );
    loop {
        let value = regs.read(EERD);
        if value & Eerd::DONE.bits() != 0 {
            return (value >> EERD_DATA_SHIFT) as u16;
        }
        core::hint::spin_loop();
    }
}

/// Read the station address from EEPROM words 0, 1 and 2
pub fn read_mac_address<R: RegisterIo + ?Sized>(regs: &R) -> MacAddress {
    MacAddress::from_eeprom_words(MAC_WORDS.map(|address| read_word(regs, address)))
}
