// Interrupt entry for the network device

use crate::drivers::NIC;
use log::trace;
use x86_64::instructions::port::Port;
use x86_64::structures::idt::InterruptStackFrame;

/// First vector the legacy PICs are remapped to
pub const PIC_VECTOR_OFFSET: u8 = 32;

const PIC1_COMMAND: u16 = 0x20;
const PIC2_COMMAND: u16 = 0xA0;
const PIC_EOI: u8 = 0x20;

/// IDT vector that an interrupt line is delivered on
pub const fn interrupt_vector(line: u8) -> u8 {
    PIC_VECTOR_OFFSET + line
}

/// Network device interrupt handler
///
/// Register at `interrupt_vector(NIC.irq_line())` once the device is
/// installed. An interrupt arriving before then is acknowledged and ignored.
///
/// # Safety
/// Must only be entered as an interrupt handler.
pub unsafe extern "C" fn e1000_interrupt_handler(_stack_frame: InterruptStackFrame) {
    let line = match NIC.get() {
        Some(driver) => {
            driver.handle_interrupt();
            Some(driver.irq_line())
        }
        None => {
            trace!("network: interrupt before attach");
            None
        }
    };

    if line.is_some_and(|line| line >= 8) {
        Port::new(PIC2_COMMAND).write(PIC_EOI);
    }
    Port::new(PIC1_COMMAND).write(PIC_EOI);
}
