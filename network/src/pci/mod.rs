// PCI device discovery and the bus operations the NIC driver needs

use crate::error::NetError;
use shared::PhysAddr;

/// PCI vendor ID for Intel
pub const INTEL_VENDOR_ID: u16 = 0x8086;

/// PCI device ID for the 82540EM (QEMU/Bochs/VirtualBox emulated e1000)
pub const E1000_82540EM_DEVICE_ID: u16 = 0x100E;

/// Configuration space offsets
const PCI_COMMAND: u8 = 0x04;
const PCI_BAR0: u8 = 0x10;
const PCI_INTERRUPT_LINE: u8 = 0x3C;

/// Command register: respond to memory space accesses
const PCI_COMMAND_MEMORY: u32 = 1 << 1;
/// Command register: allow the device to master the bus (DMA)
const PCI_COMMAND_BUS_MASTER: u32 = 1 << 2;

/// Bus operations a driver performs on the function it attaches to
pub trait PciFunction {
    /// Enable memory decoding and bus mastering
    fn enable(&self);

    /// Physical base and size of a memory BAR
    ///
    /// # Errors
    /// Returns `NetError::NotMemoryMapped` if the BAR decodes I/O space
    fn memory_bar(&self, index: usize) -> Result<(PhysAddr, usize), NetError>;

    /// Legacy interrupt line routed to this function
    fn interrupt_line(&self) -> u8;
}

/// PCI device information
#[derive(Debug, Clone, Copy)]
pub struct PciDevice {
    /// Bus number
    pub bus: u8,
    /// Device number
    pub device: u8,
    /// Function number
    pub function: u8,
    /// Vendor ID
    pub vendor_id: u16,
    /// Device ID
    pub device_id: u16,
    /// Base address registers
    pub bars: [u32; 6],
    /// Decoded size of each BAR in bytes (0 if unimplemented)
    pub bar_sizes: [u32; 6],
    /// Interrupt line
    pub interrupt_line: u8,
}

/// Build a CONFIG_ADDRESS value for mechanism #1
fn config_address(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    (1u32 << 31)
        | ((bus as u32) << 16)
        | ((device as u32) << 11)
        | ((function as u32) << 8)
        | (offset as u32 & 0xFC)
}

#[cfg(target_arch = "x86_64")]
fn read_config(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    use x86_64::instructions::port::Port;

    unsafe {
        Port::<u32>::new(0xCF8).write(config_address(bus, device, function, offset));
        Port::<u32>::new(0xCFC).read()
    }
}

#[cfg(target_arch = "x86_64")]
fn write_config(bus: u8, device: u8, function: u8, offset: u8, value: u32) {
    use x86_64::instructions::port::Port;

    unsafe {
        Port::<u32>::new(0xCF8).write(config_address(bus, device, function, offset));
        Port::<u32>::new(0xCFC).write(value);
    }
}

impl PciDevice {
    /// Read a 32-bit value from this function's configuration space
    #[cfg(target_arch = "x86_64")]
    pub fn read_config_dword(&self, offset: u8) -> u32 {
        read_config(self.bus, self.device, self.function, offset)
    }

    /// Write a 32-bit value to this function's configuration space
    #[cfg(target_arch = "x86_64")]
    pub fn write_config_dword(&self, offset: u8, value: u32) {
        write_config(self.bus, self.device, self.function, offset, value)
    }

    /// Probe a single bus/device/function, returning `None` if it is absent
    #[cfg(target_arch = "x86_64")]
    fn probe(bus: u8, device: u8, function: u8) -> Option<Self> {
        let id = read_config(bus, device, function, 0x00);
        let vendor_id = (id & 0xFFFF) as u16;
        if vendor_id == 0xFFFF {
            return None;
        }

        let mut bars = [0u32; 6];
        let mut bar_sizes = [0u32; 6];
        for i in 0..6 {
            let offset = PCI_BAR0 + (i as u8) * 4;
            let original = read_config(bus, device, function, offset);
            bars[i] = original;

            // Size the BAR by writing all ones and reading back the mask
            write_config(bus, device, function, offset, 0xFFFF_FFFF);
            let mask = read_config(bus, device, function, offset);
            write_config(bus, device, function, offset, original);
            bar_sizes[i] = bar_size_from_mask(mask);
        }

        let interrupt_line = (read_config(bus, device, function, PCI_INTERRUPT_LINE) & 0xFF) as u8;

        Some(PciDevice {
            bus,
            device,
            function,
            vendor_id,
            device_id: (id >> 16) as u16,
            bars,
            bar_sizes,
            interrupt_line,
        })
    }

    /// Get the base address held in BAR `index`
    pub fn get_bar(&self, index: usize) -> u64 {
        if index >= 6 {
            return 0;
        }

        let bar_low = self.bars[index];

        // 64-bit memory BAR: the next BAR holds the high half
        if (bar_low & 0x6) == 0x4 && index < 5 {
            ((self.bars[index + 1] as u64) << 32) | (bar_low & 0xFFFF_FFF0) as u64
        } else {
            (bar_low & 0xFFFF_FFF0) as u64
        }
    }
}

/// Decode the size of a BAR from the value read back after writing all ones
fn bar_size_from_mask(mask: u32) -> u32 {
    let flags = if mask & 0x1 != 0 { 0x3 } else { 0xF };
    let bits = mask & !flags;
    if bits == 0 {
        0
    } else {
        (!bits).wrapping_add(1)
    }
}

impl PciFunction for PciDevice {
    #[cfg(target_arch = "x86_64")]
    fn enable(&self) {
        let command = self.read_config_dword(PCI_COMMAND);
        self.write_config_dword(
            PCI_COMMAND,
            command | PCI_COMMAND_MEMORY | PCI_COMMAND_BUS_MASTER,
        );
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn enable(&self) {
        let _ = (PCI_COMMAND, PCI_COMMAND_MEMORY, PCI_COMMAND_BUS_MASTER);
    }

    fn memory_bar(&self, index: usize) -> Result<(PhysAddr, usize), NetError> {
        if index >= 6 {
            return Err(NetError::InvalidArgument("BAR index out of range"));
        }
        if self.bars[index] & 0x1 != 0 {
            return Err(NetError::NotMemoryMapped);
        }
        Ok((PhysAddr::new(self.get_bar(index)), self.bar_sizes[index] as usize))
    }

    fn interrupt_line(&self) -> u8 {
        self.interrupt_line
    }
}

/// Scan PCI bus for devices
///
/// # Returns
/// A vector of all discovered PCI functions
#[cfg(target_arch = "x86_64")]
pub fn scan_pci_bus() -> alloc::vec::Vec<PciDevice> {
    let mut devices = alloc::vec::Vec::new();

    for bus in 0..=255u8 {
        for device in 0..32u8 {
            for function in 0..8u8 {
                if let Some(found) = PciDevice::probe(bus, device, function) {
                    devices.push(found);
                }
            }
        }
    }

    devices
}

/// Find a PCI device by vendor and device ID
///
/// # Errors
/// Returns `NetError::DeviceNotFound` if no function matches
pub fn find_pci_device(vendor_id: u16, device_id: u16) -> Result<PciDevice, NetError> {
    #[cfg(target_arch = "x86_64")]
    {
        scan_pci_bus()
            .into_iter()
            .find(|d| d.vendor_id == vendor_id && d.device_id == device_id)
            .ok_or(NetError::DeviceNotFound)
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (vendor_id, device_id);
        Err(NetError::DeviceNotFound)
    }
}
