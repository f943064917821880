pub(crate) mod backing_file;
pub(crate) mod config;
pub(crate) mod crash;
pub(crate) mod global;
pub(crate) mod heap;
pub(crate) mod large;
pub(crate) mod registry;
pub(crate) mod stats;
pub(crate) mod vm;

/// Serialises tests that depend on the shared counters or the process-wide
/// allocator. Readers may run together; writers run alone.
#[cfg(test)]
pub static TEST_MUTEX: std::sync::RwLock<()> = std::sync::RwLock::new(());
