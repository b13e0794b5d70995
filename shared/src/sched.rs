// Scheduling and interrupt-line services shared across moteOS crates

use core::fmt;

/// Identifier of a schedulable execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u32);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Cooperative scheduler
///
/// Only one context runs at a time; interrupts may preempt it but run to
/// completion without blocking.
pub trait Scheduler {
    /// The context currently executing
    fn current(&self) -> ContextId;

    /// Mark a context non-runnable
    fn block(&self, ctx: ContextId);

    /// Mark a context runnable again
    ///
    /// Must be callable from interrupt context.
    fn wake(&self, ctx: ContextId);

    /// Give up the CPU
    ///
    /// Returns once the current context is runnable and has been picked again.
    fn yield_now(&self);
}

/// Interrupt controller line masking
pub trait InterruptController {
    /// Allow the given interrupt line to be delivered
    fn unmask(&self, line: u8);
}
