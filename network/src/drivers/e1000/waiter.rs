//! Single-occupant waiter slots.
//!
//! Each direction admits at most one blocked context. The slot is a single
//! atomic word so the interrupt handler can claim the waiter without locking
//! or allocating.

use core::sync::atomic::{AtomicU64, Ordering};
use log::error;
use shared::ContextId;

const EMPTY: u64 = 0;

fn encode(ctx: ContextId) -> u64 {
    ctx.0 as u64 + 1
}

fn decode(raw: u64) -> Option<ContextId> {
    match raw {
        EMPTY => None,
        raw => Some(ContextId((raw - 1) as u32)),
    }
}

pub struct WaitSlot {
    direction: &'static str,
    waiter: AtomicU64,
}

impl WaitSlot {
    pub const fn new(direction: &'static str) -> Self {
        Self {
            direction,
            waiter: AtomicU64::new(EMPTY),
        }
    }

    /// Record `ctx` as the blocked context for this direction
    ///
    /// # Panics
    /// If another context is already waiting. One producer and one consumer
    /// per direction is part of the driver's contract.
    pub fn register(&self, ctx: ContextId) {
        if let Err(existing) =
            self.waiter
                .compare_exchange(EMPTY, encode(ctx), Ordering::AcqRel, Ordering::Acquire)
        {
            let existing = decode(existing).map_or(0, |c| c.0);
            error!(
                "e1000: {} waiter ctx#{} registered while ctx#{} is blocked",
                self.direction, ctx.0, existing
            );
            panic!(
                "e1000: second {} waiter {} (ctx#{} already blocked)",
                self.direction, ctx, existing
            );
        }
    }

    /// Remove and return the blocked context, if any
    pub fn take(&self) -> Option<ContextId> {
        decode(self.waiter.swap(EMPTY, Ordering::AcqRel))
    }

    /// Withdraw `ctx` if it is still the registered waiter
    pub fn cancel(&self, ctx: ContextId) -> bool {
        self.waiter
            .compare_exchange(encode(ctx), EMPTY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn waiter(&self) -> Option<ContextId> {
        decode(self.waiter.load(Ordering::Acquire))
    }
}
