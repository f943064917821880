use std::alloc::Layout;
use std::ptr::NonNull;

/// Allocate `size` bytes from the C heap, aborting on exhaustion.
///
/// The block is not zeroed. Zero-size requests allocate one byte so the
/// returned pointer is always unique. Release with [`deallocate`].
#[must_use]
pub fn allocate(size: usize) -> NonNull<u8> {
    let size = size.max(1);
    // Safety: FFI call to malloc.
    let ptr = unsafe { libc::malloc(size) };
    match NonNull::new(ptr.cast::<u8>()) {
        Some(p) => p,
        // Reports the failed size on stderr and aborts.
        None => std::alloc::handle_alloc_error(
            Layout::from_size_align(size, 1).unwrap_or(Layout::new::<u8>()),
        ),
    }
}

/// Return a block obtained from [`allocate`] to the C heap.
///
/// # Safety
/// - `ptr` must have been returned by [`allocate`] and not freed already.
/// - `ptr` must not be used after this call.
pub unsafe fn deallocate(ptr: NonNull<u8>) {
    // Safety: upheld by caller.
    unsafe { libc::free(ptr.as_ptr().cast::<libc::c_void>()) };
}
