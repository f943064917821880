#[cfg(not(target_pointer_width = "64"))]
compile_error!("largemem supports only 64-bit targets.");

#[cfg(not(unix))]
compile_error!("largemem supports only Unix targets (mmap, mkstemp, sigaction).");

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocation entry points
pub use memory::global::{
    GlobalLargeAlloc, allocate, allocate_large, allocate_large_ext, free_large,
};

// registry
pub use memory::registry::{Backing, MAX_LARGE_ALLOCS, RegistryEntry};

// configuration
pub use memory::config::{LargeAllocConfig, MappingTier};

// stats
pub use memory::stats::LargeAllocStats;

// errors and advice
pub use memory::vm::{Advice, FailureKind, RawDescriptor, VmError};
