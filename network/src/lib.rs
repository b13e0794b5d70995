#![cfg_attr(not(test), no_std)]

// Network drivers for moteOS
// Interrupt-driven e1000 Ethernet controller, PCI discovery, and the
// system-call surface for raw frame transmit and receive

extern crate alloc;

pub mod drivers;
pub mod error;
pub mod pci;

// Re-export commonly used types
pub use drivers::e1000::{BufferOwner, BufferStrategy, E1000Config, MacAddress, NicKernel, E1000};
pub use drivers::{DriverSlot, NetworkDriver, NIC};
pub use error::NetError;
pub use pci::{find_pci_device, PciDevice, PciFunction};
