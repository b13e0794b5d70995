// Access to caller (user) buffers through their address space

use crate::error::NetError;
use core::ptr;
use shared::{page_offset, AddressSpace, FrameAllocator, PageFlags, PAGE_SIZE};

/// Walk `[va, va + len)` one page-bounded chunk at a time
fn for_each_chunk(
    va: usize,
    len: usize,
    mut f: impl FnMut(usize, usize, usize) -> Result<(), NetError>,
) -> Result<(), NetError> {
    let end = va.checked_add(len).ok_or(NetError::BadAddress)?;
    let mut cursor = va;
    while cursor < end {
        let chunk = (PAGE_SIZE - page_offset(cursor)).min(end - cursor);
        f(cursor, cursor - va, chunk)?;
        cursor += chunk;
    }
    Ok(())
}

/// Verify every page of `[va, va + len)` is mapped with at least `required`
///
/// # Errors
/// Returns `NetError::BadAddress` on the first page that is missing or lacks
/// a required permission
pub fn check_user_range(
    space: &dyn AddressSpace,
    va: usize,
    len: usize,
    required: PageFlags,
) -> Result<(), NetError> {
    for_each_chunk(va, len, |page_va, _, _| match space.lookup(page_va) {
        Some((_, flags)) if flags.contains(required) => Ok(()),
        _ => Err(NetError::BadAddress),
    })
}

/// Copy `dst.len()` bytes from the caller's `va` into kernel memory
pub fn copy_from_user<F: FrameAllocator + ?Sized>(
    frames: &F,
    space: &dyn AddressSpace,
    va: usize,
    dst: &mut [u8],
) -> Result<(), NetError> {
    for_each_chunk(va, dst.len(), |chunk_va, done, chunk| {
        let (page, _) = space.lookup(chunk_va).ok_or(NetError::BadAddress)?;
        let src = frames.phys_to_virt(page);
        // SAFETY: chunk stays within the page backing chunk_va.
        unsafe {
            ptr::copy_nonoverlapping(
                src.add(page_offset(chunk_va)),
                dst[done..done + chunk].as_mut_ptr(),
                chunk,
            );
        }
        Ok(())
    })
}

/// Copy kernel bytes into the caller's writable memory at `va`
pub fn copy_to_user<F: FrameAllocator + ?Sized>(
    frames: &F,
    space: &dyn AddressSpace,
    va: usize,
    src: &[u8],
) -> Result<(), NetError> {
    for_each_chunk(va, src.len(), |chunk_va, done, chunk| {
        let (page, flags) = space.lookup(chunk_va).ok_or(NetError::BadAddress)?;
        if !flags.contains(PageFlags::WRITABLE) {
            return Err(NetError::BadAddress);
        }
        let dst = frames.phys_to_virt(page);
        // SAFETY: chunk stays within the page backing chunk_va.
        unsafe {
            ptr::copy_nonoverlapping(
                src[done..done + chunk].as_ptr(),
                dst.add(page_offset(chunk_va)),
                chunk,
            );
        }
        Ok(())
    })
}
