// Receive path

use super::desc::RxDesc;
use super::regs::{RegisterIo, RDT};
use super::ring::{BufferOwner, RxRing};
use super::{BufferStrategy, NicKernel, E1000};
use crate::drivers::user::{check_user_range, copy_to_user};
use crate::error::NetError;
use log::{debug, warn};
use shared::{page_offset, AddressSpace, PageFlags, PhysAddr};

/// A zero-copy destination may be unmapped or a page the caller can write
fn check_replaceable(caller: &dyn AddressSpace, buffer: usize) -> Result<(), NetError> {
    match caller.lookup(buffer) {
        None => Ok(()),
        Some((_, flags))
            if flags.contains(PageFlags::PRESENT | PageFlags::USER)
                && flags.intersects(PageFlags::WRITABLE | PageFlags::COPY_ON_WRITE) =>
        {
            Ok(())
        }
        Some(_) => Err(NetError::BadAddress),
    }
}

impl<K: NicKernel> E1000<K> {
    /// Deliver the next received frame into the caller's `buffer`
    ///
    /// Blocks until a frame is ready. With [`BufferStrategy::Copy`] at most
    /// `capacity` bytes are copied and the copied count is returned. With
    /// [`BufferStrategy::ZeroCopy`] the slot's page itself is mapped at the
    /// page-aligned `buffer` and the slot gets a fresh page; the frame length
    /// is returned.
    ///
    /// # Errors
    /// * `NetError::InvalidArgument` - zero capacity, or a zero-copy buffer
    ///   that is not page aligned
    /// * `NetError::BadAddress` - buffer not writable by the caller; for
    ///   zero-copy an unmapped buffer is accepted and mapped fresh
    /// * `NetError::OutOfMemory` - no page to replenish the slot; the frame
    ///   stays queued
    pub fn receive(&self, caller: &dyn AddressSpace, buffer: usize, capacity: usize) -> Result<usize, NetError> {
        if capacity == 0 {
            return Err(NetError::InvalidArgument("zero-length receive buffer"));
        }
        match self.config.strategy {
            BufferStrategy::Copy => check_user_range(
                caller,
                buffer,
                capacity,
                PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE,
            )?,
            BufferStrategy::ZeroCopy if page_offset(buffer) != 0 => {
                return Err(NetError::InvalidArgument("zero-copy buffer is not page aligned"));
            }
            BufferStrategy::ZeroCopy => check_replaceable(caller, buffer)?,
        }

        loop {
            self.wait_until(&self.rx_waiter, || {
                let rx = self.rx.lock();
                rx.descs.read(self.rx_next(&rx)).is_done()
            });

            let mut rx = self.rx.lock();
            let index = self.rx_next(&rx);
            let mut desc = rx.descs.read(index);

            if desc.errors != 0 || !desc.is_end_of_packet() {
                warn!(
                    "e1000: dropping rx slot {} (errors {:#04x}, status {:#04x})",
                    index, desc.errors, desc.status
                );
                self.recycle(&rx, index, desc);
                continue;
            }

            let delivered = match self.config.strategy {
                BufferStrategy::Copy => {
                    let len = capacity.min(desc.length as usize);
                    let src = self.kernel.phys_to_virt(rx.buffers[index as usize].page());
                    // SAFETY: the controller finished writing this ring-owned
                    // page (done-bit observed) and len is within it.
                    let src = unsafe { core::slice::from_raw_parts(src, len) };
                    copy_to_user(&self.kernel, caller, buffer, src)?;
                    len
                }
                BufferStrategy::ZeroCopy => {
                    desc.addr = self.lend_slot_page(&mut rx, index, caller, buffer)?.as_u64();
                    desc.length as usize
                }
            };

            debug!("e1000: rx slot {} len {} delivered {}", index, desc.length, delivered);
            self.recycle(&rx, index, desc);
            return Ok(delivered);
        }
    }

    /// First slot past the software tail
    fn rx_next(&self, rx: &RxRing) -> u16 {
        let tail = (self.regs.read(RDT) % rx.descs.size() as u32) as u16;
        rx.descs.next(tail)
    }

    /// Hand slot `index` back to the controller and advance the tail over it
    fn recycle(&self, rx: &RxRing, index: u16, mut desc: RxDesc) {
        desc.status = 0;
        desc.errors = 0;
        desc.length = 0;
        rx.descs.write(index, desc);
        self.regs.write(RDT, index as u32);
    }

    /// Map the slot's page into the caller and install a replacement
    ///
    /// The replacement is allocated first so a failure leaves the slot and
    /// its frame untouched. Returns the replacement page.
    fn lend_slot_page(
        &self,
        rx: &mut RxRing,
        index: u16,
        caller: &dyn AddressSpace,
        buffer: usize,
    ) -> Result<PhysAddr, NetError> {
        let replacement = self.kernel.alloc_zeroed_page().ok_or(NetError::OutOfMemory)?;
        let page = rx.buffers[index as usize].page();

        rx.buffers[index as usize] = BufferOwner::Caller(page);
        let user = PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE;
        if let Err(e) = caller.map(buffer, page, user) {
            rx.buffers[index as usize] = BufferOwner::Ring(page);
            self.kernel.free_page(replacement);
            return Err(e.into());
        }

        rx.buffers[index as usize] = BufferOwner::Ring(replacement);
        Ok(replacement)
    }
}
