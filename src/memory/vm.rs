use std::ffi::c_int;
use std::fmt;
use std::io;
use std::ptr::NonNull;

/// Huge page size requested for explicit huge-page mappings.
pub(crate) const PAGE_SIZE_2MB: usize = 2 * 1024 * 1024;

/// Raw OS descriptor of a backing file.
pub type RawDescriptor = c_int;

/// Failure classes of the allocator. Both are fatal at the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Address space, huge-page pool or registry slots ran out.
    ResourceExhausted,
    /// The backing file, its mapping or the crash hooks could not be set up.
    SetupFailure,
}

#[derive(Debug)]
pub enum VmError {
    AnonymousMapFailed(io::Error),
    RegistryFull { capacity: usize },
    TempFileFailed(io::Error),
    ResizeFailed(io::Error),
    FileMapFailed(io::Error),
    UnmapFailed(io::Error),
    AdviseFailed(io::Error),
    HookInstallFailed { hook: &'static str, source: io::Error },
    Unsupported(&'static str),
}

impl VmError {
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            VmError::AnonymousMapFailed(_) | VmError::RegistryFull { .. } => {
                FailureKind::ResourceExhausted
            }
            VmError::TempFileFailed(_)
            | VmError::ResizeFailed(_)
            | VmError::FileMapFailed(_)
            | VmError::UnmapFailed(_)
            | VmError::AdviseFailed(_)
            | VmError::HookInstallFailed { .. }
            | VmError::Unsupported(_) => FailureKind::SetupFailure,
        }
    }

    /// Report the error on stderr and abort the process.
    ///
    /// Goes straight to stderr rather than through `log`: the process is about
    /// to die and there may be no logger installed. `abort` raises `SIGABRT`,
    /// so installed crash hooks still release every tracked mapping.
    pub(crate) fn terminate(&self) -> ! {
        eprintln!("[memory] fatal ({:?}): {self}", self.kind());
        std::process::abort()
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::AnonymousMapFailed(e) => write!(f, "anonymous mmap failed: {e}"),
            VmError::RegistryFull { capacity } => {
                write!(f, "too many large allocations (capacity {capacity})")
            }
            VmError::TempFileFailed(e) => write!(f, "failed to create backing file: {e}"),
            VmError::ResizeFailed(e) => write!(f, "resizing write failed: {e}"),
            VmError::FileMapFailed(e) => write!(f, "file-backed mmap failed: {e}"),
            VmError::UnmapFailed(e) => write!(f, "munmap failed: {e}"),
            VmError::AdviseFailed(e) => write!(f, "posix_madvise failed: {e}"),
            VmError::HookInstallFailed { hook, source } => {
                write!(f, "failed to install {hook}: {source}")
            }
            VmError::Unsupported(what) => write!(f, "unsupported on this platform: {what}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::AnonymousMapFailed(e)
            | VmError::TempFileFailed(e)
            | VmError::ResizeFailed(e)
            | VmError::FileMapFailed(e)
            | VmError::UnmapFailed(e)
            | VmError::AdviseFailed(e)
            | VmError::HookInstallFailed { source: e, .. } => Some(e),
            VmError::RegistryFull { .. } | VmError::Unsupported(_) => None,
        }
    }
}

/// How a mapping request asks for huge pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HugePages {
    /// Ordinary pages only.
    Off,
    /// Ordinary mapping, then advise the kernel to back it with transparent
    /// huge pages where it can.
    Transparent,
    /// Explicit hugetlb pages of [`PAGE_SIZE_2MB`]. `len` must be a multiple
    /// of that size.
    Explicit,
}

/// Advisory flags attached to a mapping request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MapHints {
    pub huge_pages: HugePages,
    /// Fault every page in up front.
    pub populate: bool,
}

/// Paging advice for an existing region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    /// Contents will not be needed for a while; the kernel may drop them.
    Unused,
    /// Contents will be needed soon; read ahead.
    WillNeed,
}

/// Abstract interface for the mapping calls the large allocator makes.
///
/// `unmap` and `close_descriptor` are called from the crash-safety path
/// (exit hook and `SIGABRT` handler) and must stay async-signal-safe: no
/// allocation, no locks, no logging.
pub(crate) trait VmOps {
    /// Private, zero-filled, read/write anonymous mapping of `len` bytes.
    unsafe fn map_anonymous(len: usize, hints: MapHints) -> Result<NonNull<u8>, VmError>;

    /// Private read/write mapping of the first `len` bytes of `fd`.
    unsafe fn map_file(
        fd: RawDescriptor,
        len: usize,
        hints: MapHints,
    ) -> Result<NonNull<u8>, VmError>;

    /// Remove a mapping created by `map_anonymous` or `map_file`.
    unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> Result<(), VmError>;

    /// Pass paging advice for a mapped range. Purely advisory.
    unsafe fn advise(ptr: NonNull<u8>, len: usize, advice: Advice) -> Result<(), VmError>;

    /// Close a descriptor handed over to the registry. Errors are ignored.
    unsafe fn close_descriptor(fd: RawDescriptor);

    /// OS page size (default/minimum).
    fn page_size() -> usize;

    /// Returns a list of supported page sizes (e.g. [4096, 2097152]).
    fn supported_page_sizes() -> Vec<usize>;
}

pub(crate) struct PlatformVmOps;

mod unix {
    use super::{Advice, HugePages, MapHints, NonNull, PlatformVmOps, RawDescriptor, VmError, VmOps};
    use std::io;

    /// Linux: MAP_HUGETLB with the page size encoded in the upper bits of flags,
    /// plus MAP_POPULATE for eager faulting.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn hint_flags(hints: MapHints) -> libc::c_int {
        // MAP_HUGE_SHIFT is 26; the log₂ of the page size goes in bits [31:26].
        const MAP_HUGE_SHIFT: libc::c_int = 26;
        const MAP_HUGE_2MB: libc::c_int = 21 << MAP_HUGE_SHIFT;

        let mut flags = 0;
        if hints.huge_pages == HugePages::Explicit {
            flags |= libc::MAP_HUGETLB | MAP_HUGE_2MB;
        }
        // Populating before MADV_HUGEPAGE would fault in small pages first;
        // transparent mappings are populated after the advice instead.
        if hints.populate && hints.huge_pages != HugePages::Transparent {
            flags |= libc::MAP_POPULATE;
        }
        flags
    }

    /// No mmap-level huge page or populate flags elsewhere; hints are dropped.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn hint_flags(_hints: MapHints) -> libc::c_int {
        0
    }

    /// Linux: ask for transparent huge pages, then populate if requested.
    /// Both calls are best effort.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe fn after_map(ptr: *mut libc::c_void, len: usize, hints: MapHints) {
        // Not exported by every libc version; value from <asm-generic/mman-common.h>.
        const MADV_POPULATE_WRITE: libc::c_int = 23;

        if hints.huge_pages != HugePages::Transparent {
            return;
        }
        if len >= super::PAGE_SIZE_2MB {
            // Safety: FFI call to madvise on a range we just mapped.
            unsafe { libc::madvise(ptr, len, libc::MADV_HUGEPAGE) };
        }
        if hints.populate {
            // Safety: FFI call to madvise on a range we just mapped.
            // Kernels before 5.14 reject this; pages then fault on first touch.
            unsafe { libc::madvise(ptr, len, MADV_POPULATE_WRITE) };
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    unsafe fn after_map(_ptr: *mut libc::c_void, _len: usize, _hints: MapHints) {}

    unsafe fn map(
        len: usize,
        flags: libc::c_int,
        fd: RawDescriptor,
        hints: MapHints,
    ) -> Result<NonNull<u8>, io::Error> {
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags | hint_flags(hints),
                fd,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // Safety: ptr/len describe the mapping created above.
        unsafe { after_map(ptr, len, hints) };

        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))
    }

    /// Linux: probe /sys/kernel/mm/hugepages/ for kernel-supported huge page
    /// sizes. Directory names are "hugepages-NkB" where N is the size in KiB.
    ///
    /// This reports what sizes the kernel *supports*, not what's currently
    /// reserved; an explicit huge mapping may still fail if `nr_hugepages` is 0.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn probe_supported_page_sizes() -> Vec<usize> {
        let mut sizes = vec![PlatformVmOps::page_size()];

        if let Ok(entries) = std::fs::read_dir("/sys/kernel/mm/hugepages") {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(kb) = name
                    .strip_prefix("hugepages-")
                    .and_then(|s| s.strip_suffix("kB"))
                    .and_then(|s| s.parse::<usize>().ok())
                {
                    sizes.push(kb * 1024);
                }
            }
        }

        sizes.sort_unstable();
        sizes.dedup();
        sizes
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn probe_supported_page_sizes() -> Vec<usize> {
        vec![PlatformVmOps::page_size()]
    }

    impl VmOps for PlatformVmOps {
        unsafe fn map_anonymous(len: usize, hints: MapHints) -> Result<NonNull<u8>, VmError> {
            // Safety: fresh anonymous mapping, no aliasing.
            unsafe { map(len, libc::MAP_PRIVATE | libc::MAP_ANON, -1, hints) }
                .map_err(VmError::AnonymousMapFailed)
        }

        unsafe fn map_file(
            fd: RawDescriptor,
            len: usize,
            hints: MapHints,
        ) -> Result<NonNull<u8>, VmError> {
            // Safety: caller passes an open descriptor of at least `len` bytes.
            unsafe { map(len, libc::MAP_PRIVATE, fd, hints) }.map_err(VmError::FileMapFailed)
        }

        unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), len) } != 0 {
                return Err(VmError::UnmapFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn advise(ptr: NonNull<u8>, len: usize, advice: Advice) -> Result<(), VmError> {
            let flag = match advice {
                Advice::Unused => libc::POSIX_MADV_DONTNEED,
                Advice::WillNeed => libc::POSIX_MADV_WILLNEED,
            };
            // Safety: FFI call to posix_madvise. It returns the error number
            // instead of setting errno.
            let rc = unsafe { libc::posix_madvise(ptr.as_ptr().cast::<libc::c_void>(), len, flag) };
            if rc != 0 {
                return Err(VmError::AdviseFailed(io::Error::from_raw_os_error(rc)));
            }
            Ok(())
        }

        unsafe fn close_descriptor(fd: RawDescriptor) {
            // Safety: FFI call to close; the registry owns `fd`.
            unsafe { libc::close(fd) };
        }

        fn page_size() -> usize {
            use std::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                usize::try_from(raw).ok().filter(|&p| p > 0).unwrap_or(4096)
            })
        }

        fn supported_page_sizes() -> Vec<usize> {
            use std::sync::OnceLock;
            static CACHED: OnceLock<Vec<usize>> = OnceLock::new();
            CACHED.get_or_init(probe_supported_page_sizes).clone()
        }
    }
}
