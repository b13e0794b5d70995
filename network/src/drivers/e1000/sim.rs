//! Hosted stand-ins for the controller and kernel services.
//!
//! Registers are a plain atomic file with the side effects the driver relies
//! on (ICR clear-on-read, EERD completion, ICS/IMS/IMC). Each test thread is
//! one execution context; a blocked context parks on a condition variable
//! until another thread wakes it.

use super::desc::{RXD_STAT_DD, RXD_STAT_EOP, TXD_STAT_DD};
use super::regs::{
    Eerd, InterruptCause, RegisterIo, Status, EERD, EERD_ADDR_SHIFT, EERD_DATA_SHIFT, ICR, ICS,
    IMC, IMS, RDH, RDT, STATUS, TDH,
};
use super::{E1000Config, NicKernel, E1000};
use crate::error::NetError;
use crate::pci::PciFunction;
use shared::{
    page_offset, page_round_down, AddressSpace, ContextId, FrameAllocator, InterruptController,
    MapError, PageFlags, PhysAddr, Scheduler, PAGE_SIZE,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use std::vec::Vec;

/// Physical address of the simulated BAR0
pub const SIM_BAR0: PhysAddr = PhysAddr::new(0xFEBC_0000);
/// Size of the simulated register window
pub const SIM_BAR0_SIZE: usize = 0x20000;
pub const SIM_IRQ_LINE: u8 = 11;

/// Two read-write pages mapped by [`SimEnv::user_space`]
pub const USER_BUFFER: usize = 0x1000_0000;
/// One read-write page mapped by [`SimEnv::user_space`]
pub const USER_BUFFER_2: usize = 0x2000_0000;

/// EEPROM contents of a QEMU e1000 (52:54:00:12:34:56)
const DEFAULT_EEPROM: [u16; 3] = [0x5452, 0x1200, 0x5634];

const PARK_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Registers
// ---------------------------------------------------------------------------

pub struct SimRegisters {
    regs: Vec<AtomicU32>,
    eeprom: [u16; 3],
}

impl SimRegisters {
    fn new(eeprom: [u16; 3]) -> Self {
        let regs: Vec<AtomicU32> = (0..SIM_BAR0_SIZE / 4).map(|_| AtomicU32::new(0)).collect();
        regs[STATUS / 4].store((Status::FD | Status::LU).bits(), Ordering::SeqCst);
        Self { regs, eeprom }
    }

    fn slot(&self, offset: usize) -> &AtomicU32 {
        assert!(offset % 4 == 0, "unaligned register offset {:#x}", offset);
        &self.regs[offset / 4]
    }

    /// Read a register without side effects
    pub fn peek(&self, offset: usize) -> u32 {
        self.slot(offset).load(Ordering::SeqCst)
    }

    /// Store a register without side effects
    pub fn poke(&self, offset: usize, value: u32) {
        self.slot(offset).store(value, Ordering::SeqCst);
    }
}

impl RegisterIo for Arc<SimRegisters> {
    fn read(&self, offset: usize) -> u32 {
        match offset {
            ICR => self.slot(ICR).swap(0, Ordering::SeqCst),
            _ => self.peek(offset),
        }
    }

    fn write(&self, offset: usize, value: u32) {
        match offset {
            EERD if value & Eerd::START.bits() != 0 => {
                let address = (value >> EERD_ADDR_SHIFT) & 0xFF;
                let word = self.eeprom.get(address as usize).copied().unwrap_or(0xFFFF);
                self.poke(
                    EERD,
                    ((word as u32) << EERD_DATA_SHIFT)
                        | (address << EERD_ADDR_SHIFT)
                        | Eerd::DONE.bits(),
                );
            }
            ICS => {
                self.slot(ICR).fetch_or(value, Ordering::SeqCst);
            }
            IMS => {
                self.slot(IMS).fetch_or(value, Ordering::SeqCst);
            }
            IMC => {
                self.slot(IMS).fetch_and(!value, Ordering::SeqCst);
            }
            _ => self.poke(offset, value),
        }
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE]);

/// Page frames backed by host allocations at synthetic physical addresses
pub struct SimMemory {
    frames: Mutex<BTreeMap<u64, Box<Frame>>>,
    next: AtomicU64,
    budget: Option<usize>,
}

impl SimMemory {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(BTreeMap::new()),
            next: AtomicU64::new(0x1_0000_0000),
            budget: None,
        }
    }

    /// Allocator that fails once `pages` frames are live
    pub fn with_budget(pages: usize) -> Self {
        Self {
            budget: Some(pages),
            ..Self::new()
        }
    }

    pub fn live_pages(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

impl FrameAllocator for SimMemory {
    fn alloc_zeroed_page(&self) -> Option<PhysAddr> {
        let mut frames = self.frames.lock().unwrap();
        if self.budget.is_some_and(|budget| frames.len() >= budget) {
            return None;
        }
        let addr = self.next.fetch_add(PAGE_SIZE as u64, Ordering::SeqCst);
        frames.insert(addr, Box::new(Frame([0; PAGE_SIZE])));
        Some(PhysAddr::new(addr))
    }

    fn free_page(&self, page: PhysAddr) {
        assert!(page.is_page_aligned(), "freeing unaligned frame {}", page);
        let freed = self.frames.lock().unwrap().remove(&page.as_u64());
        assert!(freed.is_some(), "double free of frame {}", page);
    }

    fn phys_to_virt(&self, addr: PhysAddr) -> *mut u8 {
        let base = addr.as_u64() & !(PAGE_SIZE as u64 - 1);
        let mut frames = self.frames.lock().unwrap();
        let frame = frames
            .get_mut(&base)
            .unwrap_or_else(|| panic!("access to unallocated frame {}", addr));
        // SAFETY: the offset is below PAGE_SIZE.
        unsafe { frame.0.as_mut_ptr().add((addr.as_u64() - base) as usize) }
    }
}

// ---------------------------------------------------------------------------
// Address spaces
// ---------------------------------------------------------------------------

/// A user address space: a page table over [`SimMemory`] frames
pub struct SimSpace {
    memory: Arc<SimMemory>,
    pages: Mutex<BTreeMap<usize, (PhysAddr, PageFlags)>>,
    refused: Mutex<Option<usize>>,
}

impl SimSpace {
    pub fn new(memory: Arc<SimMemory>) -> Self {
        Self {
            memory,
            pages: Mutex::new(BTreeMap::new()),
            refused: Mutex::new(None),
        }
    }

    /// Make every later `map` at `va` fail as if page tables ran out
    pub fn refuse_map(&self, va: usize) {
        *self.refused.lock().unwrap() = Some(va);
    }

    /// Back `va` with a fresh frame
    pub fn alloc_page(&self, va: usize, flags: PageFlags) -> PhysAddr {
        let page = self
            .memory
            .alloc_zeroed_page()
            .expect("simulated memory exhausted");
        self.map(va, page, flags).expect("alloc_page needs an aligned address");
        page
    }

    /// Store bytes as the owning process would, ignoring write protection
    pub fn write_bytes(&self, va: usize, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            // SAFETY: phys_to_virt points inside a live frame.
            unsafe { *self.byte_ptr(va + i) = *byte };
        }
    }

    pub fn read_bytes(&self, va: usize, len: usize) -> Vec<u8> {
        // SAFETY: phys_to_virt points inside a live frame.
        (0..len).map(|i| unsafe { *self.byte_ptr(va + i) }).collect()
    }

    fn byte_ptr(&self, va: usize) -> *mut u8 {
        let (page, _) = self
            .lookup(va)
            .unwrap_or_else(|| panic!("{:#x} is not mapped", va));
        self.memory.phys_to_virt(page.add(page_offset(va)))
    }
}

impl AddressSpace for SimSpace {
    fn lookup(&self, va: usize) -> Option<(PhysAddr, PageFlags)> {
        self.pages.lock().unwrap().get(&page_round_down(va)).copied()
    }

    fn map(&self, va: usize, page: PhysAddr, flags: PageFlags) -> Result<(), MapError> {
        if page_offset(va) != 0 || !page.is_page_aligned() {
            return Err(MapError::Misaligned);
        }
        if *self.refused.lock().unwrap() == Some(va) {
            return Err(MapError::OutOfMemory);
        }
        self.pages.lock().unwrap().insert(va, (page, flags));
        Ok(())
    }

    fn unmap(&self, va: usize) {
        self.pages.lock().unwrap().remove(&page_round_down(va));
    }
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

static NEXT_CONTEXT: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static CURRENT: ContextId = ContextId(NEXT_CONTEXT.fetch_add(1, Ordering::SeqCst));
}

#[derive(Default)]
struct RunState {
    blocked: HashSet<ContextId>,
    parked: HashSet<ContextId>,
}

#[derive(Default)]
struct SimScheduler {
    state: Mutex<RunState>,
    changed: Condvar,
}

impl SimScheduler {
    fn is_parked(&self, ctx: ContextId) -> bool {
        self.state.lock().unwrap().parked.contains(&ctx)
    }
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// Kernel services handed to the driver; clones share state
#[derive(Clone)]
pub struct SimKernel {
    memory: Arc<SimMemory>,
    regs: Arc<SimRegisters>,
    sched: Arc<SimScheduler>,
    unmasked: Arc<Mutex<Vec<u8>>>,
    woken: Arc<AtomicUsize>,
}

impl SimKernel {
    pub fn unmasked_lines(&self) -> Vec<u8> {
        self.unmasked.lock().unwrap().clone()
    }

    /// Number of wake calls so far
    pub fn woken(&self) -> usize {
        self.woken.load(Ordering::SeqCst)
    }
}

impl FrameAllocator for SimKernel {
    fn alloc_zeroed_page(&self) -> Option<PhysAddr> {
        self.memory.alloc_zeroed_page()
    }

    fn free_page(&self, page: PhysAddr) {
        self.memory.free_page(page)
    }

    fn phys_to_virt(&self, addr: PhysAddr) -> *mut u8 {
        self.memory.phys_to_virt(addr)
    }
}

impl Scheduler for SimKernel {
    fn current(&self) -> ContextId {
        CURRENT.with(|ctx| *ctx)
    }

    fn block(&self, ctx: ContextId) {
        self.sched.state.lock().unwrap().blocked.insert(ctx);
    }

    fn wake(&self, ctx: ContextId) {
        self.woken.fetch_add(1, Ordering::SeqCst);
        self.sched.state.lock().unwrap().blocked.remove(&ctx);
        self.sched.changed.notify_all();
    }

    fn yield_now(&self) {
        let me = self.current();
        let deadline = Instant::now() + PARK_TIMEOUT;
        let mut state = self.sched.state.lock().unwrap();
        state.parked.insert(me);
        while state.blocked.contains(&me) {
            let left = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_else(|| panic!("{} never woken", me));
            state = self.sched.changed.wait_timeout(state, left).unwrap().0;
        }
        state.parked.remove(&me);
    }
}

impl InterruptController for SimKernel {
    fn unmask(&self, line: u8) {
        self.unmasked.lock().unwrap().push(line);
    }
}

impl NicKernel for SimKernel {
    type Regs = Arc<SimRegisters>;

    fn map_registers(&self, base: PhysAddr, size: usize) -> Result<Self::Regs, MapError> {
        assert_eq!(base, SIM_BAR0);
        assert_eq!(size, SIM_BAR0_SIZE);
        Ok(self.regs.clone())
    }
}

// ---------------------------------------------------------------------------
// PCI
// ---------------------------------------------------------------------------

pub struct SimPci {
    enabled: AtomicBool,
}

impl SimPci {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl PciFunction for SimPci {
    fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    fn memory_bar(&self, index: usize) -> Result<(PhysAddr, usize), NetError> {
        match index {
            0 => Ok((SIM_BAR0, SIM_BAR0_SIZE)),
            _ => Err(NetError::NotMemoryMapped),
        }
    }

    fn interrupt_line(&self) -> u8 {
        SIM_IRQ_LINE
    }
}

// ---------------------------------------------------------------------------
// Test environment
// ---------------------------------------------------------------------------

/// One simulated machine: memory, a controller, and a scheduler
pub struct SimEnv {
    kernel: SimKernel,
}

impl SimEnv {
    pub fn new() -> Self {
        Self::build(SimMemory::new(), DEFAULT_EEPROM)
    }

    pub fn with_eeprom(words: [u16; 3]) -> Self {
        Self::build(SimMemory::new(), words)
    }

    pub fn with_page_budget(pages: usize) -> Self {
        Self::build(SimMemory::with_budget(pages), DEFAULT_EEPROM)
    }

    fn build(memory: SimMemory, eeprom: [u16; 3]) -> Self {
        Self {
            kernel: SimKernel {
                memory: Arc::new(memory),
                regs: Arc::new(SimRegisters::new(eeprom)),
                sched: Arc::new(SimScheduler::default()),
                unmasked: Arc::new(Mutex::new(Vec::new())),
                woken: Arc::new(AtomicUsize::new(0)),
            },
        }
    }

    pub fn attach(&self, config: E1000Config) -> Result<E1000<SimKernel>, NetError> {
        self.attach_with(&SimPci::new(), config)
    }

    pub fn attach_with(&self, pci: &SimPci, config: E1000Config) -> Result<E1000<SimKernel>, NetError> {
        E1000::attach(pci, self.kernel.clone(), config)
    }

    pub fn regs(&self) -> &SimRegisters {
        &self.kernel.regs
    }

    pub fn kernel(&self) -> &SimKernel {
        &self.kernel
    }

    pub fn memory(&self) -> &SimMemory {
        &self.kernel.memory
    }

    /// A process with [`USER_BUFFER`] and [`USER_BUFFER_2`] mapped read-write
    pub fn user_space(&self) -> Arc<SimSpace> {
        let space = self.user_space_unbacked();
        let rw = PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE;
        space.alloc_page(USER_BUFFER, rw);
        space.alloc_page(USER_BUFFER + PAGE_SIZE, rw);
        space.alloc_page(USER_BUFFER_2, rw);
        space
    }

    /// A process with nothing mapped
    pub fn user_space_unbacked(&self) -> Arc<SimSpace> {
        Arc::new(SimSpace::new(self.kernel.memory.clone()))
    }

    /// Wait until `waiter` reports a context and that context is parked
    pub fn wait_until_parked(&self, waiter: impl Fn() -> Option<ContextId>) -> ContextId {
        let deadline = Instant::now() + PARK_TIMEOUT;
        loop {
            if let Some(ctx) = waiter() {
                if self.kernel.sched.is_parked(ctx) {
                    return ctx;
                }
            }
            assert!(Instant::now() < deadline, "no context parked in time");
            thread::sleep(Duration::from_millis(1));
        }
    }
}

// ---------------------------------------------------------------------------
// Device side of the rings
// ---------------------------------------------------------------------------

/// Transmit every queued frame, the way the controller would
///
/// Walks from TDH over slots whose done-bit is clear, sets the bit on each,
/// and advances TDH. A full ring drains all `size` slots.
pub fn drain_tx(nic: &E1000<SimKernel>) -> Vec<Vec<u8>> {
    let tx = nic.tx.lock();
    let regs = &nic.kernel.regs;
    let mut head = regs.peek(TDH) as u16;
    let mut sent = Vec::new();

    for _ in 0..tx.descs.size() {
        let mut desc = tx.descs.read(head);
        if desc.is_done() {
            break;
        }
        let src = nic.kernel.phys_to_virt(PhysAddr::new(desc.addr));
        // SAFETY: a queued descriptor references `length` bytes inside one frame.
        sent.push(unsafe { std::slice::from_raw_parts(src, desc.length as usize) }.to_vec());
        desc.status |= TXD_STAT_DD;
        tx.descs.write(head, desc);
        head = tx.descs.next(head);
    }

    regs.poke(TDH, head as u32);
    sent
}

/// Deliver one frame into the slot at RDH
///
/// Returns false, dropping the frame, when the controller owns no free slot.
pub fn inject_rx(nic: &E1000<SimKernel>, frame: &[u8]) -> bool {
    let rx = nic.rx.lock();
    let regs = &nic.kernel.regs;
    let head = regs.peek(RDH) as u16;
    if head as u32 == regs.peek(RDT) {
        return false;
    }

    let mut desc = rx.descs.read(head);
    let dst = nic.kernel.phys_to_virt(PhysAddr::new(desc.addr));
    // SAFETY: receive buffers are whole frames and frames fit in RX_BUFFER_SIZE.
    unsafe { std::ptr::copy_nonoverlapping(frame.as_ptr(), dst, frame.len()) };
    desc.length = frame.len() as u16;
    desc.status = RXD_STAT_DD | RXD_STAT_EOP;
    desc.errors = 0;
    rx.descs.write(head, desc);

    regs.poke(RDH, rx.descs.next(head) as u32);
    true
}

/// Mark a filled receive slot as a CRC error
pub fn corrupt_rx(nic: &E1000<SimKernel>, index: u16) {
    let rx = nic.rx.lock();
    let mut desc = rx.descs.read(index);
    desc.errors |= 0x01;
    rx.descs.write(index, desc);
}

/// Assert interrupt causes and run the handler
pub fn raise(nic: &E1000<SimKernel>, cause: InterruptCause) {
    nic.regs.write(ICS, cause.bits());
    nic.handle_interrupt();
}
