use super::config::LargeAllocConfig;
use super::crash::{HookState, PlatformCrashHooks, PreviousDisposition};
use super::heap;
use super::large::LargeAllocator;
use super::registry::{Backing, RegistryEntry};
use super::stats::{self, LargeAllocStats};
use super::vm::{Advice, PlatformVmOps, VmError};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::OnceLock;

type ProcessAllocator = LargeAllocator<PlatformVmOps, PlatformCrashHooks>;

/// Interior-mutable slot for the process-wide allocator.
///
/// No lock: the exit hook and the `SIGABRT` handler must be able to reach the
/// registry without blocking or allocating, and the allocator is
/// single-threaded by contract. Callers must not touch it from more than one
/// thread at a time.
struct SignalCell<T>(UnsafeCell<T>);

// Safety: access is single-threaded by contract (see above).
unsafe impl<T: Send> Sync for SignalCell<T> {}

impl<T> SignalCell<T> {
    fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    fn get(&self) -> *mut T {
        self.0.get()
    }
}

static GLOBAL_LARGE_ALLOC: OnceLock<SignalCell<ProcessAllocator>> = OnceLock::new();

fn instance() -> &'static SignalCell<ProcessAllocator> {
    GLOBAL_LARGE_ALLOC.get_or_init(|| {
        SignalCell::new(LargeAllocator::new(
            LargeAllocConfig::default(),
            PlatformCrashHooks,
        ))
    })
}

/// Run `f` with exclusive access to the process-wide allocator.
///
/// The borrow must end before any fatal path runs, so that the `SIGABRT`
/// handler is the only one touching the registry then.
fn with<R>(f: impl FnOnce(&mut ProcessAllocator) -> R) -> R {
    // Safety: single-threaded contract; no other borrow is live outside `f`.
    f(unsafe { &mut *instance().get() })
}

/// Exit/abort hook entry point. Lock-free and allocation-free; does nothing
/// if the allocator was never created.
pub(crate) fn release_all_tracked() {
    if let Some(cell) = GLOBAL_LARGE_ALLOC.get() {
        // Safety: called on the exit/abort path, after the faulting code
        // released its borrow (see `with`).
        unsafe { (*cell.get()).release_all() };
    }
}

/// `SIGABRT` disposition replaced by the crash hooks, if they are installed.
pub(crate) fn previous_abort_disposition() -> Option<PreviousDisposition> {
    let cell = GLOBAL_LARGE_ALLOC.get()?;
    // Safety: read-only access from the abort path; see `release_all_tracked`.
    unsafe { (*cell.get()).crash_state().previous().copied() }
}

/// Process-wide large allocator.
///
/// Created lazily with [`LargeAllocConfig::default`] on first use unless
/// [`init`](Self::init) ran first. The methods here report errors; the free
/// functions [`allocate_large`] and friends terminate on them instead.
pub struct GlobalLargeAlloc;

impl GlobalLargeAlloc {
    /// Use `config` for the process-wide allocator.
    ///
    /// Returns `false` (and changes nothing) if the allocator already exists,
    /// either from an earlier `init` or from an allocation.
    pub fn init(config: LargeAllocConfig) -> bool {
        log::debug!("[memory] large allocator configured: {config:?}");
        GLOBAL_LARGE_ALLOC
            .set(SignalCell::new(LargeAllocator::new(config, PlatformCrashHooks)))
            .is_ok()
    }

    /// Configuration in effect.
    #[must_use]
    pub fn config() -> LargeAllocConfig {
        with(|alloc| alloc.config().clone())
    }

    /// Anonymous, zero-filled region of at least `size` bytes.
    ///
    /// # Errors
    ///
    /// `VmError::RegistryFull` or `VmError::AnonymousMapFailed`.
    pub fn alloc(size: usize) -> Result<NonNull<u8>, VmError> {
        with(|alloc| alloc.try_alloc(size))
    }

    /// Region of at least `size` bytes backed by an unlinked temp file. The
    /// first success installs the crash-safety hooks.
    ///
    /// # Errors
    ///
    /// Any `VmError`; nothing stays registered or open on error.
    pub fn alloc_ext(size: usize) -> Result<NonNull<u8>, VmError> {
        with(|alloc| alloc.try_alloc_file_backed(size))
    }

    /// Release a region from [`alloc`](Self::alloc) or
    /// [`alloc_ext`](Self::alloc_ext). Returns the entry that was released;
    /// unknown addresses are ignored and give `None`, as does the heap tier.
    ///
    /// # Safety
    /// - `ptr` must not be used after this call.
    /// - With the heap tier, `ptr` must come from this allocator and not have
    ///   been freed already.
    pub unsafe fn free(ptr: NonNull<u8>) -> Option<RegistryEntry> {
        // Safety: upheld by caller.
        with(|alloc| unsafe { alloc.free(ptr) })
    }

    /// Paging advice for the registered region at `ptr`. Returns `Ok(false)`
    /// if `ptr` is not registered.
    ///
    /// # Errors
    ///
    /// `VmError::AdviseFailed` if the kernel rejects the advice.
    pub fn advise(ptr: NonNull<u8>, advice: Advice) -> Result<bool, VmError> {
        with(|alloc| alloc.advise(ptr, advice))
    }

    /// Backing of the registered region at `ptr`.
    #[must_use]
    pub fn backing_of(ptr: NonNull<u8>) -> Option<Backing> {
        with(|alloc| alloc.registry().find(ptr).map(|e| e.backing))
    }

    #[must_use]
    pub fn live_allocations() -> usize {
        with(|alloc| alloc.registry().len())
    }

    #[must_use]
    pub fn hooks_installed() -> bool {
        with(|alloc| alloc.crash_state().state() == HookState::Installed)
    }

    #[must_use]
    pub fn stats() -> LargeAllocStats {
        stats::snapshot()
    }
}

/// General-purpose allocation that never returns null.
///
/// Terminates the process if the heap is exhausted.
#[must_use]
pub fn allocate(size: usize) -> NonNull<u8> {
    heap::allocate(size)
}

/// Anonymous, zero-filled, registry-tracked region of at least `size` bytes.
///
/// Terminates the process on any failure, including a full registry.
#[must_use]
pub fn allocate_large(size: usize) -> NonNull<u8> {
    GlobalLargeAlloc::alloc(size).unwrap_or_else(|e| e.terminate())
}

/// Region of at least `size` bytes privately mapped from an unlinked temp
/// file of exactly `size` bytes.
///
/// Terminates the process on any failure.
#[must_use]
pub fn allocate_large_ext(size: usize) -> NonNull<u8> {
    GlobalLargeAlloc::alloc_ext(size).unwrap_or_else(|e| e.terminate())
}

/// Release a region from [`allocate_large`] or [`allocate_large_ext`].
///
/// # Safety
/// - `ptr` must not be used after this call.
/// - With the heap tier, `ptr` must come from one of the large allocation
///   functions and not have been freed already.
pub unsafe fn free_large(ptr: NonNull<u8>) {
    // Safety: upheld by caller.
    unsafe { GlobalLargeAlloc::free(ptr) };
}
