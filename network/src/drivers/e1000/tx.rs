// Transmit path

use super::desc::{TXD_CMD_EOP, TXD_CMD_IFCS, TXD_CMD_RS};
use super::regs::{RegisterIo, TDT};
use super::ring::{BufferOwner, TxRing};
use super::{BufferStrategy, NicKernel, E1000, MAX_FRAME_SIZE};
use crate::drivers::user::{check_user_range, copy_from_user};
use crate::error::NetError;
use log::debug;
use shared::{page_offset, page_round_down, AddressSpace, PageFlags, PAGE_SIZE};

impl<K: NicKernel> E1000<K> {
    /// Queue one frame from the caller's `buffer`
    ///
    /// Blocks while the slot at the transmit tail is still owned by the
    /// controller. On return the slot belongs to the controller; with
    /// [`BufferStrategy::ZeroCopy`] the caller's page stays mapped
    /// copy-on-write so later writes cannot disturb the frame.
    ///
    /// # Errors
    /// * `NetError::InvalidArgument` - empty or oversized frame, or a
    ///   zero-copy buffer that crosses a page boundary
    /// * `NetError::BadAddress` - buffer not mapped readable by the caller
    /// * `NetError::Map` - remapping the caller's page failed
    pub fn transmit(&self, caller: &dyn AddressSpace, buffer: usize, length: usize) -> Result<(), NetError> {
        if length > MAX_FRAME_SIZE {
            return Err(NetError::InvalidArgument("frame exceeds maximum frame size"));
        }
        if length == 0 {
            return Err(NetError::InvalidArgument("empty frame"));
        }
        if self.config.strategy == BufferStrategy::ZeroCopy
            && page_offset(buffer) + length > PAGE_SIZE
        {
            return Err(NetError::InvalidArgument("zero-copy frame crosses a page boundary"));
        }
        check_user_range(caller, buffer, length, PageFlags::PRESENT | PageFlags::USER)?;

        self.wait_until(&self.tx_waiter, || {
            let tx = self.tx.lock();
            tx.descs.read(self.tx_tail(&tx)).is_done()
        });

        let mut tx = self.tx.lock();
        let tail = self.tx_tail(&tx);
        let mut desc = tx.descs.read(tail);

        desc.addr = match self.config.strategy {
            BufferStrategy::Copy => {
                let page = tx.buffers[tail as usize].page();
                let dst = self.kernel.phys_to_virt(page);
                // SAFETY: the slot page is ring-owned, PAGE_SIZE long, and the
                // controller is done with it (done-bit observed above).
                let dst = unsafe { core::slice::from_raw_parts_mut(dst, length) };
                copy_from_user(&self.kernel, caller, buffer, dst)?;
                desc.addr
            }
            BufferStrategy::ZeroCopy => self.share_caller_page(&mut tx, tail, caller, buffer)?,
        };
        desc.length = length as u16;
        desc.cmd = TXD_CMD_EOP | TXD_CMD_RS | TXD_CMD_IFCS;
        desc.status = 0;
        tx.descs.write(tail, desc);

        let next = tx.descs.next(tail);
        self.regs.write(TDT, next as u32);
        debug!("e1000: tx slot {} len {}", tail, length);
        Ok(())
    }

    fn tx_tail(&self, tx: &TxRing) -> u16 {
        (self.regs.read(TDT) % tx.descs.size() as u32) as u16
    }

    /// Point slot `tail` straight at the caller's page
    ///
    /// The page is mapped copy-on-write both at its own address and at the
    /// slot's scratch address, so neither side can change bytes the
    /// controller is about to read. Returns the descriptor buffer address.
    fn share_caller_page(
        &self,
        tx: &mut TxRing,
        tail: u16,
        caller: &dyn AddressSpace,
        buffer: usize,
    ) -> Result<u64, NetError> {
        let (page, flags) = caller.lookup(buffer).ok_or(NetError::BadAddress)?;
        let shared = PageFlags::PRESENT | PageFlags::USER | PageFlags::COPY_ON_WRITE;

        let scratch = self.config.tx_scratch_base + tail as usize * PAGE_SIZE;
        caller.map(scratch, page, shared)?;
        if flags.intersects(PageFlags::WRITABLE | PageFlags::COPY_ON_WRITE) {
            if let Err(e) = caller.map(page_round_down(buffer), page, shared) {
                caller.unmap(scratch);
                return Err(e.into());
            }
        }

        let previous = core::mem::replace(
            &mut tx.buffers[tail as usize],
            BufferOwner::SharedCopyOnWrite(page),
        );
        if let BufferOwner::Ring(own) = previous {
            self.kernel.free_page(own);
        }

        Ok(page.as_u64() + page_offset(buffer) as u64)
    }
}
