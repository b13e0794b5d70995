// Network driver implementations and the kernel-wide device slot

pub mod e1000;
#[cfg(target_arch = "x86_64")]
pub mod interrupts;
pub mod user;

use crate::error::NetError;
use e1000::MacAddress;
use log::error;
use shared::AddressSpace;
use spin::Once;

/// Trait for network drivers
///
/// Operations take `&self`: the interrupt handler runs against the same
/// instance while a caller is blocked inside `transmit` or `receive`.
pub trait NetworkDriver: Send + Sync {
    /// Queue one Ethernet frame from the caller's memory
    ///
    /// Blocks while no transmit slot is free.
    fn transmit(&self, caller: &dyn AddressSpace, buffer: usize, length: usize) -> Result<(), NetError>;

    /// Take the next received frame into the caller's memory
    ///
    /// Blocks until a frame is available.
    ///
    /// # Returns
    /// Number of bytes delivered
    fn receive(&self, caller: &dyn AddressSpace, buffer: usize, capacity: usize) -> Result<usize, NetError>;

    fn mac_address(&self) -> MacAddress;

    /// Legacy interrupt line the device raises
    fn irq_line(&self) -> u8;

    /// Service a device interrupt; never blocks
    fn handle_interrupt(&self);
}

/// Holds the one attached network device
pub struct DriverSlot {
    driver: Once<&'static dyn NetworkDriver>,
}

impl DriverSlot {
    pub const fn new() -> Self {
        Self { driver: Once::new() }
    }

    /// Publish the attached device
    ///
    /// # Panics
    /// If a device was already installed
    pub fn install(&self, driver: &'static dyn NetworkDriver) {
        let mut installed = false;
        self.driver.call_once(|| {
            installed = true;
            driver
        });
        if !installed {
            error!("network: second device installed");
            panic!("network: device already installed");
        }
    }

    pub fn get(&self) -> Option<&'static dyn NetworkDriver> {
        self.driver.get().copied()
    }

    fn expect_ready(&self) -> &'static dyn NetworkDriver {
        match self.get() {
            Some(driver) => driver,
            None => {
                error!("network: device used before attach");
                panic!("network: device not ready");
            }
        }
    }

    /// Interrupt line of the installed device
    ///
    /// # Panics
    /// If no device is installed
    pub fn irq_line(&self) -> u8 {
        self.expect_ready().irq_line()
    }

    /// # Panics
    /// If no device is installed
    pub fn mac_address(&self) -> MacAddress {
        self.expect_ready().mac_address()
    }

    /// Transmit system call: 0 on success or a negative error number
    pub fn sys_transmit(&self, caller: &dyn AddressSpace, buffer: usize, length: usize) -> i32 {
        let Some(driver) = self.get() else {
            return NetError::DeviceNotFound.errno();
        };
        match driver.transmit(caller, buffer, length) {
            Ok(()) => 0,
            Err(e) => e.errno(),
        }
    }

    /// Receive system call: byte count on success or a negative error number
    pub fn sys_receive(&self, caller: &dyn AddressSpace, buffer: usize, capacity: usize) -> i32 {
        let Some(driver) = self.get() else {
            return NetError::DeviceNotFound.errno();
        };
        match driver.receive(caller, buffer, capacity) {
            Ok(len) => len as i32,
            Err(e) => e.errno(),
        }
    }
}

impl Default for DriverSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel's network device
pub static NIC: DriverSlot = DriverSlot::new();
