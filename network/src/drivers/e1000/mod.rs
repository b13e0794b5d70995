//! Intel 82540EM (e1000) Ethernet controller driver.
//!
//! One transmit ring and one receive ring of legacy descriptors, driven by
//! the descriptor done-bit: software only touches a slot after observing the
//! bit, and never touches a slot it has handed to the controller. Callers
//! block (one per direction) when the transmit ring is full or the receive
//! ring is empty, and the interrupt handler wakes them.

use crate::drivers::NetworkDriver;
use crate::error::NetError;
use crate::pci::PciFunction;
use log::{info, trace};
use shared::{
    AddressSpace, ContextId, FrameAllocator, InterruptController, MapError, PhysAddr, Scheduler,
    PAGE_SIZE,
};
use spin::Mutex;

pub mod desc;
pub mod eeprom;
pub mod regs;
pub mod ring;
mod rx;
#[cfg(test)]
pub(crate) mod sim;
mod tx;
pub mod waiter;

pub use eeprom::MacAddress;
pub use ring::{BufferOwner, MAX_RING_SIZE};

use regs::{
    Ctrl, InterruptCause, RegisterIo, Rctl, Tctl, CTRL, ICR, IMC, IMS, MTA, MTA_COUNT, RAH0, RAH_AV,
    RAL0, RCTL, RDBAH, RDBAL, RDH, RDLEN, RDT, STATUS, TCTL, TCTL_COLD_SHIFT, TCTL_CT_SHIFT, TDBAH,
    TDBAL, TDH, TDLEN, TDT, TIPG,
};
use ring::{build_rx_ring, build_tx_ring, RxRing, TxRing};
use waiter::WaitSlot;

/// Largest frame accepted for transmit (header, 1500-byte payload, CRC)
pub const MAX_FRAME_SIZE: usize = 1518;
/// Receive buffer size programmed into RCTL.BSIZE
pub const RX_BUFFER_SIZE: usize = 2048;

/// Collision threshold recommended for full duplex
const TCTL_CT: u32 = 0x10;
/// Collision distance for full duplex
const TCTL_COLD: u32 = 0x40;
/// Inter-packet gap: IPGT 10, IPGR1 8, IPGR2 6
const TIPG_DEFAULT: u32 = 10 | (8 << 10) | (6 << 20);

/// How frame data moves between callers and ring slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStrategy {
    /// Copy bytes through each slot's own page
    Copy,
    /// Remap pages between the caller and the ring
    ZeroCopy,
}

/// Driver configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct E1000Config {
    /// Transmit descriptors (multiple of 8, at most [`MAX_RING_SIZE`])
    pub tx_ring_size: u16,
    /// Receive descriptors (multiple of 8, at most [`MAX_RING_SIZE`])
    pub rx_ring_size: u16,
    pub strategy: BufferStrategy,
    /// Page-aligned user address of the per-slot transmit scratch region
    /// used by [`BufferStrategy::ZeroCopy`]; slot `i` maps at
    /// `tx_scratch_base + i * PAGE_SIZE`
    pub tx_scratch_base: usize,
}

impl Default for E1000Config {
    fn default() -> Self {
        Self {
            tx_ring_size: 64,
            rx_ring_size: 128,
            strategy: BufferStrategy::ZeroCopy,
            tx_scratch_base: 0xD000_0000,
        }
    }
}

impl E1000Config {
    /// Check ring geometry and the scratch region
    ///
    /// Ring byte lengths must be multiples of 128 (8 descriptors) and each
    /// descriptor array must fit in one page.
    pub fn validate(&self) -> Result<(), NetError> {
        for size in [self.tx_ring_size, self.rx_ring_size] {
            if size == 0 || size % 8 != 0 {
                return Err(NetError::InvalidArgument("ring size must be a multiple of 8"));
            }
            if size as usize > MAX_RING_SIZE {
                return Err(NetError::InvalidArgument("ring does not fit in one page"));
            }
        }
        if self.tx_scratch_base % PAGE_SIZE != 0 {
            return Err(NetError::InvalidArgument("scratch region is not page aligned"));
        }
        Ok(())
    }
}

/// Kernel services the driver is built on
pub trait NicKernel: FrameAllocator + Scheduler + InterruptController + Send + Sync {
    type Regs: RegisterIo + Send + Sync;

    /// Map a device register window uncached into kernel space
    fn map_registers(&self, base: PhysAddr, size: usize) -> Result<Self::Regs, MapError>;
}

/// An attached e1000 controller
pub struct E1000<K: NicKernel> {
    kernel: K,
    regs: K::Regs,
    config: E1000Config,
    irq_line: u8,
    mac: MacAddress,
    tx: Mutex<TxRing>,
    rx: Mutex<RxRing>,
    tx_waiter: WaitSlot,
    rx_waiter: WaitSlot,
}

impl<K: NicKernel> E1000<K> {
    /// Bring up the controller behind `pci`
    ///
    /// Either returns a fully enabled device or fails with nothing enabled:
    /// both rings are allocated before any enable bit is written.
    ///
    /// # Errors
    /// * `NetError::InvalidArgument` - `config` fails validation
    /// * `NetError::NotMemoryMapped` - BAR0 is an I/O BAR
    /// * `NetError::Map` - the register window could not be mapped
    /// * `NetError::OutOfMemory` - ring or buffer allocation failed
    pub fn attach(pci: &dyn PciFunction, kernel: K, config: E1000Config) -> Result<Self, NetError> {
        config.validate()?;

        pci.enable();
        let (bar, bar_size) = pci.memory_bar(0)?;
        let regs = kernel.map_registers(bar, bar_size)?;
        info!(
            "e1000: registers at {} ({:#x} bytes), status {:#010x}",
            bar,
            bar_size,
            regs.read(STATUS)
        );

        // Quiesce interrupts while the rings are set up
        regs.write(IMC, u32::MAX);
        let _ = regs.read(ICR);

        let tx = build_tx_ring(&kernel, config.tx_ring_size)?;
        let rx = match build_rx_ring(&kernel, config.rx_ring_size) {
            Ok(rx) => rx,
            Err(e) => {
                tx.release(&kernel);
                return Err(e);
            }
        };

        let irq_line = pci.interrupt_line();
        regs.write(IMS, (InterruptCause::TXQE | InterruptCause::RXT0).bits());
        kernel.unmask(irq_line);

        regs.write(CTRL, regs.read(CTRL) | Ctrl::SLU.bits());

        // Transmit
        regs.write(TDBAL, tx.descs.page().low_u32());
        regs.write(TDBAH, tx.descs.page().high_u32());
        regs.write(TDLEN, tx.descs.byte_len());
        regs.write(TDH, 0);
        regs.write(TDT, 0);
        regs.write(TIPG, TIPG_DEFAULT);
        regs.write(
            TCTL,
            (Tctl::EN | Tctl::PSP).bits() | (TCTL_CT << TCTL_CT_SHIFT) | (TCTL_COLD << TCTL_COLD_SHIFT),
        );

        // Receive: the controller owns every slot but the one at the tail
        regs.write(RDBAL, rx.descs.page().low_u32());
        regs.write(RDBAH, rx.descs.page().high_u32());
        regs.write(RDLEN, rx.descs.byte_len());
        regs.write(RDH, 0);
        regs.write(RDT, (config.rx_ring_size - 1) as u32);

        let mac = eeprom::read_mac_address(&regs);
        regs.write(RAL0, mac.ral());
        regs.write(RAH0, mac.rah() | RAH_AV);
        for i in 0..MTA_COUNT {
            regs.write(MTA + i * 4, 0);
        }

        // 2048-byte buffers, no loopback, no promiscuous modes
        let rctl = Rctl::BAM | Rctl::SECRC;
        regs.write(RCTL, rctl.bits());
        regs.write(RCTL, (rctl | Rctl::EN).bits());

        info!(
            "e1000: MAC={} irq {} tx ring {} rx ring {} ({:?})",
            mac, irq_line, config.tx_ring_size, config.rx_ring_size, config.strategy
        );

        Ok(Self {
            kernel,
            regs,
            config,
            irq_line,
            mac,
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
            tx_waiter: WaitSlot::new("transmit"),
            rx_waiter: WaitSlot::new("receive"),
        })
    }

    pub fn mac_address(&self) -> MacAddress {
        self.mac
    }

    pub fn irq_line(&self) -> u8 {
        self.irq_line
    }

    /// Context blocked waiting for a free transmit slot
    pub fn transmit_waiter(&self) -> Option<ContextId> {
        self.tx_waiter.waiter()
    }

    /// Context blocked waiting for a received frame
    pub fn receive_waiter(&self) -> Option<ContextId> {
        self.rx_waiter.waiter()
    }

    /// Service the device interrupt
    ///
    /// Reads (and so clears) the cause register once, then wakes at most one
    /// transmitter and one receiver. Never blocks or allocates.
    pub fn handle_interrupt(&self) {
        let cause = InterruptCause::from_bits_retain(self.regs.read(ICR));
        if cause.is_empty() {
            trace!("e1000: interrupt with no cause");
            return;
        }

        if cause.contains(InterruptCause::TXQE) {
            if let Some(ctx) = self.tx_waiter.take() {
                self.kernel.wake(ctx);
            }
        }

        // A receive cause with nobody waiting is picked up by the next receive
        if cause.contains(InterruptCause::RXT0) {
            if let Some(ctx) = self.rx_waiter.take() {
                self.kernel.wake(ctx);
            }
        }
    }

    /// Suspend the current context until `ready` holds
    ///
    /// The readiness check is repeated after registering, so a completion
    /// that lands before the context is recorded as the waiter is not lost.
    fn wait_until(&self, slot: &WaitSlot, mut ready: impl FnMut() -> bool) {
        while !ready() {
            let me = self.kernel.current();
            self.kernel.block(me);
            slot.register(me);
            if ready() && slot.cancel(me) {
                self.kernel.wake(me);
            }
            self.kernel.yield_now();
        }
    }
}

impl<K: NicKernel> NetworkDriver for E1000<K> {
    fn transmit(&self, caller: &dyn AddressSpace, buffer: usize, length: usize) -> Result<(), NetError> {
        E1000::transmit(self, caller, buffer, length)
    }

    fn receive(&self, caller: &dyn AddressSpace, buffer: usize, capacity: usize) -> Result<usize, NetError> {
        E1000::receive(self, caller, buffer, capacity)
    }

    fn mac_address(&self) -> MacAddress {
        self.mac
    }

    fn irq_line(&self) -> u8 {
        self.irq_line
    }

    fn handle_interrupt(&self) {
        E1000::handle_interrupt(self)
    }
}
