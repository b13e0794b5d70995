// Error types for network driver operations

use shared::MapError;
use thiserror::Error;

/// Kernel error numbers returned (negated) across the syscall boundary
pub const E_BAD_DEV: i32 = 2;
pub const E_INVAL: i32 = 3;
pub const E_NO_MEM: i32 = 4;

/// Network driver errors
///
/// Broken concurrency contracts (a second waiter on one direction) and use of
/// the driver before attach are not represented here: they abort the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NetError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("buffer is not mapped with the required user permissions")]
    BadAddress,

    #[error("mapping failed: {0}")]
    Map(#[from] MapError),

    #[error("Device not found")]
    DeviceNotFound,

    #[error("BAR0 is not memory mapped")]
    NotMemoryMapped,
}

impl NetError {
    /// Negative error number for returning to user space
    pub fn errno(&self) -> i32 {
        match self {
            NetError::OutOfMemory | NetError::Map(MapError::OutOfMemory) => -E_NO_MEM,
            NetError::InvalidArgument(_) | NetError::BadAddress | NetError::Map(_) => -E_INVAL,
            NetError::DeviceNotFound | NetError::NotMemoryMapped => -E_BAD_DEV,
        }
    }
}
