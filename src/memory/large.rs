use super::backing_file;
use super::config::{LargeAllocConfig, MappingTier};
use super::crash::{CrashHooks, CrashSafetyState};
use super::heap;
use super::registry::{Backing, MAX_LARGE_ALLOCS, Registry, RegistryEntry};
use super::vm::{Advice, HugePages, MapHints, PAGE_SIZE_2MB, RawDescriptor, VmError, VmOps};
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::ptr::NonNull;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapKind {
    Anonymous,
    FileBacked,
}

/// Runtime availability of explicit huge pages, per mapping kind.
///
/// Both start out as candidates when the configuration asks for huge pages.
/// The first refused explicit mapping of a kind strikes that kind off, with a
/// warning, and it is never retried:
///
/// - **hugetlb pool empty**: the first anonymous request gets `ENOMEM`,
///   later ones go straight to ordinary pages with a THP hint.
/// - **backing file not on hugetlbfs**: `MAP_HUGETLB` on the descriptor is
///   rejected once, later file mappings use ordinary pages.
struct HugePageProbe {
    anonymous: bool,
    file_backed: bool,
}

impl HugePageProbe {
    fn new(enabled: bool) -> Self {
        Self {
            anonymous: enabled,
            file_backed: enabled,
        }
    }

    fn should_try(&self, kind: MapKind) -> bool {
        match kind {
            MapKind::Anonymous => self.anonymous,
            MapKind::FileBacked => self.file_backed,
        }
    }

    fn mark_unavailable(&mut self, kind: MapKind, err: &VmError) {
        match kind {
            MapKind::Anonymous => self.anonymous = false,
            MapKind::FileBacked => self.file_backed = false,
        }
        log::warn!(
            "[memory] explicit {}MB huge pages unavailable for {kind:?} mappings ({err}); \
             falling back to ordinary pages",
            PAGE_SIZE_2MB / (1024 * 1024),
        );
    }
}

/// Registry-tracked allocator for a handful of very large, long-lived
/// regions.
///
/// `V` performs the mapping calls, `H` installs the crash-safety hooks on the
/// first file-backed allocation. All `try_*` methods leave the registry
/// consistent on error; the public front end turns errors into process
/// termination.
pub(crate) struct LargeAllocator<V: VmOps, H: CrashHooks> {
    registry: Registry<MAX_LARGE_ALLOCS>,
    config: LargeAllocConfig,
    probe: HugePageProbe,
    crash: CrashSafetyState,
    hooks: H,
    _vm: PhantomData<V>,
}

// Safety: LargeAllocator owns its mappings and descriptors.
unsafe impl<V: VmOps, H: CrashHooks + Send> Send for LargeAllocator<V, H> {}

impl<V: VmOps, H: CrashHooks> LargeAllocator<V, H> {
    pub(crate) fn new(config: LargeAllocConfig, hooks: H) -> Self {
        let explicit =
            config.huge_page_hint && V::supported_page_sizes().contains(&PAGE_SIZE_2MB);
        if config.huge_page_hint && !explicit {
            log::debug!("[memory] kernel reports no 2MB huge pages; using ordinary pages");
        }
        let probe = HugePageProbe::new(explicit);
        Self {
            registry: Registry::new(),
            config,
            probe,
            crash: CrashSafetyState::new(),
            hooks,
            _vm: PhantomData,
        }
    }

    pub(crate) fn config(&self) -> &LargeAllocConfig {
        &self.config
    }

    pub(crate) fn registry(&self) -> &Registry<MAX_LARGE_ALLOCS> {
        &self.registry
    }

    pub(crate) fn crash_state(&self) -> &CrashSafetyState {
        &self.crash
    }

    /// Anonymous, zero-filled region of at least `size` bytes.
    ///
    /// Below [`MappingTier::Anonymous`] this is a plain heap allocation with no
    /// registry entry.
    ///
    /// # Errors
    ///
    /// `RegistryFull` if every slot is taken, `AnonymousMapFailed` if even an
    /// ordinary-page mapping is refused.
    pub(crate) fn try_alloc(&mut self, size: usize) -> Result<NonNull<u8>, VmError> {
        if self.config.tier < MappingTier::Anonymous {
            return Ok(heap::allocate(size));
        }
        let size = size.max(1);

        let slot = self.registry.reserve_slot()?;
        match self.map_with_fallback(MapKind::Anonymous, None, size) {
            Ok((ptr, mapped_len)) => {
                self.registry.record(slot, ptr, size, mapped_len, Backing::Anonymous);
                log::debug!("[memory] mapped {size} anonymous bytes at {ptr:p}");
                Ok(ptr)
            }
            Err(e) => {
                self.registry.cancel(slot);
                Err(e)
            }
        }
    }

    /// Region of at least `size` bytes mapped privately from an unlinked temp
    /// file of exactly `size` bytes.
    ///
    /// The first success installs the crash-safety hooks. Below
    /// [`MappingTier::FileBacked`] this degrades to [`try_alloc`](Self::try_alloc).
    ///
    /// # Errors
    ///
    /// `RegistryFull`, `TempFileFailed`, `ResizeFailed`, `FileMapFailed` or
    /// `HookInstallFailed`. The descriptor is closed and any mapping made is
    /// removed before returning.
    pub(crate) fn try_alloc_file_backed(&mut self, size: usize) -> Result<NonNull<u8>, VmError> {
        if self.config.tier < MappingTier::FileBacked {
            return self.try_alloc(size);
        }
        let size = size.max(1);

        let slot = self.registry.reserve_slot()?;
        let built = backing_file::create_unlinked(&self.config.temp_dir).and_then(|mut file| {
            backing_file::sparse_resize(&mut file, size)?;
            let (ptr, mapped_len) =
                self.map_with_fallback(MapKind::FileBacked, Some(file.as_raw_fd()), size)?;
            if let Err(e) = self.crash.ensure_installed(&self.hooks) {
                // Safety: we just created this mapping and nobody has seen it.
                drop(unsafe { V::unmap(ptr, mapped_len) });
                return Err(e);
            }
            Ok((ptr, mapped_len, file))
        });

        match built {
            Ok((ptr, mapped_len, file)) => {
                let fd = file.into_raw_fd();
                self.registry.record(slot, ptr, size, mapped_len, Backing::File(fd));
                log::debug!("[memory] mapped {size} file-backed bytes at {ptr:p} (fd {fd})");
                Ok(ptr)
            }
            Err(e) => {
                self.registry.cancel(slot);
                Err(e)
            }
        }
    }

    /// Release a region returned by either allocation method.
    ///
    /// Unknown addresses are ignored at the mapping tiers. At the heap tier
    /// the pointer goes back to the C heap.
    ///
    /// # Safety
    /// - `ptr` must come from this allocator and not have been freed already.
    /// - `ptr` must not be used after this call.
    pub(crate) unsafe fn free(&mut self, ptr: NonNull<u8>) -> Option<RegistryEntry> {
        if self.config.tier < MappingTier::Anonymous {
            // Safety: upheld by caller; heap tier hands out C heap blocks only.
            unsafe { heap::deallocate(ptr) };
            return None;
        }
        let removed = self.registry.find_and_remove::<V>(ptr);
        match &removed {
            Some(entry) => log::debug!("[memory] released {} bytes at {ptr:p}", entry.size),
            None => log::debug!("[memory] free of unregistered address {ptr:p} ignored"),
        }
        removed
    }

    /// Pass paging advice for the registered region starting at `ptr`.
    ///
    /// Returns `Ok(false)` if `ptr` is not registered.
    pub(crate) fn advise(&self, ptr: NonNull<u8>, advice: Advice) -> Result<bool, VmError> {
        let Some(entry) = self.registry.find(ptr) else {
            return Ok(false);
        };
        // Safety: the entry describes a live mapping of `mapped_len` bytes.
        unsafe { V::advise(entry.address, entry.mapped_len, advice)? };
        Ok(true)
    }

    /// Unmap and close everything. Async-signal-safe.
    pub(crate) fn release_all(&mut self) {
        self.registry.release_all::<V>();
    }

    /// Map `size` bytes, trying explicit huge pages first when allowed.
    /// Returns the address and the length actually mapped.
    fn map_with_fallback(
        &mut self,
        kind: MapKind,
        fd: Option<RawDescriptor>,
        size: usize,
    ) -> Result<(NonNull<u8>, usize), VmError> {
        let populate = self.config.eager_populate;

        // A size that cannot be rounded to the huge page says nothing about
        // huge page availability; leave the probe alone.
        let huge_len = size.checked_next_multiple_of(PAGE_SIZE_2MB);
        if let Some(len) = huge_len.filter(|_| self.probe.should_try(kind)) {
            let hints = MapHints {
                huge_pages: HugePages::Explicit,
                populate,
            };
            // Safety: fresh mapping; `fd` (if any) is open and at least `size` long.
            match unsafe { Self::map(fd, len, hints) } {
                Ok(ptr) => return Ok((ptr, len)),
                Err(e) => self.probe.mark_unavailable(kind, &e),
            }
        }

        let huge_pages = if self.config.huge_page_hint && kind == MapKind::Anonymous {
            HugePages::Transparent
        } else {
            HugePages::Off
        };
        let hints = MapHints {
            huge_pages,
            populate,
        };
        // Safety: as above.
        let ptr = unsafe { Self::map(fd, size, hints)? };
        Ok((ptr, size))
    }

    unsafe fn map(
        fd: Option<RawDescriptor>,
        len: usize,
        hints: MapHints,
    ) -> Result<NonNull<u8>, VmError> {
        // Safety: upheld by caller.
        unsafe {
            match fd {
                Some(fd) => V::map_file(fd, len, hints),
                None => V::map_anonymous(len, hints),
            }
        }
    }
}

impl<V: VmOps, H: CrashHooks> Drop for LargeAllocator<V, H> {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::crash::{HookState, PreviousDisposition};
    use crate::memory::stats;
    use crate::memory::vm::PlatformVmOps;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Counts installations instead of touching process-wide handlers.
    #[derive(Clone, Default)]
    struct SpyHooks {
        installs: Rc<Cell<usize>>,
        fail: bool,
    }

    impl CrashHooks for SpyHooks {
        fn install(&self, _previous: &mut Option<PreviousDisposition>) -> Result<(), VmError> {
            self.installs.set(self.installs.get() + 1);
            if self.fail {
                return Err(VmError::HookInstallFailed {
                    hook: "exit handler",
                    source: std::io::Error::other("injected"),
                });
            }
            Ok(())
        }
    }

    type TestAllocator = LargeAllocator<PlatformVmOps, SpyHooks>;

    fn small_config() -> LargeAllocConfig {
        // Huge hints stay on so the fallback path runs on machines without a
        // hugetlb pool.
        LargeAllocConfig::detect().with_tier(MappingTier::FileBacked)
    }

    fn fd_of(alloc: &TestAllocator, ptr: NonNull<u8>) -> RawDescriptor {
        match alloc.registry().find(ptr).expect("not registered").backing {
            Backing::File(fd) => fd,
            Backing::Anonymous => panic!("expected a file-backed entry"),
        }
    }

    fn fd_is_open(fd: RawDescriptor) -> bool {
        // Safety: Test code; F_GETFD only inspects the descriptor table.
        unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
    }

    #[test]
    fn test_anonymous_region_is_zeroed_and_writable() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut alloc = TestAllocator::new(small_config(), SpyHooks::default());
        let size = 3 * 4096 + 17;
        let ptr = alloc.try_alloc(size).expect("alloc failed");

        // Safety: Test code; region is at least `size` bytes.
        unsafe {
            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            assert!(slice.iter().all(|&b| b == 0));
            slice.fill(0x5A);
            assert_eq!(slice[size - 1], 0x5A);
        }

        let entry = *alloc.registry().find(ptr).expect("not registered");
        assert_eq!(entry.size, size);
        assert!(entry.mapped_len >= size);
        assert_eq!(entry.backing, Backing::Anonymous);

        // Safety: Test code.
        let removed = unsafe { alloc.free(ptr) }.expect("free did not find the entry");
        assert_eq!(removed.address, ptr);
        assert!(alloc.registry().is_empty());
    }

    #[test]
    fn test_anonymous_never_installs_hooks() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let hooks = SpyHooks::default();
        let mut alloc = TestAllocator::new(small_config(), hooks.clone());
        for _ in 0..3 {
            alloc.try_alloc(4096).expect("alloc failed");
        }
        assert_eq!(hooks.installs.get(), 0);
        assert_eq!(alloc.crash_state().state(), HookState::Uninstalled);
    }

    #[test]
    fn test_file_backed_installs_hooks_once() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let hooks = SpyHooks::default();
        let mut alloc = TestAllocator::new(small_config(), hooks.clone());

        let ptrs: Vec<_> = (0..4)
            .map(|_| alloc.try_alloc_file_backed(64 * 1024).expect("alloc_ext failed"))
            .collect();
        assert_eq!(hooks.installs.get(), 1);
        assert_eq!(alloc.crash_state().state(), HookState::Installed);

        for ptr in ptrs {
            // Safety: Test code.
            unsafe { alloc.free(ptr) };
        }
        alloc.try_alloc_file_backed(4096).expect("alloc_ext after free failed");
        assert_eq!(hooks.installs.get(), 1);
    }

    #[test]
    fn test_file_backed_region_and_backing_size() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut alloc = TestAllocator::new(small_config(), SpyHooks::default());
        let size = 1024 * 1024 + 5;
        let ptr = alloc.try_alloc_file_backed(size).expect("alloc_ext failed");

        // Safety: Test code.
        unsafe {
            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            assert_eq!(slice[0], 0);
            assert_eq!(slice[size - 1], 0);
            slice[0] = 1;
            slice[size - 1] = 2;
            assert_eq!(slice[size - 1], 2);
        }

        let fd = fd_of(&alloc, ptr);
        // Safety: Test code; fstat on a descriptor the registry holds.
        let st = unsafe {
            let mut st: libc::stat = std::mem::zeroed();
            assert_eq!(libc::fstat(fd, &mut st), 0);
            st
        };
        assert_eq!(st.st_size as usize, size);
        assert_eq!(st.st_nlink, 0);
    }

    #[test]
    fn test_free_file_backed_closes_descriptor() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut alloc = TestAllocator::new(small_config(), SpyHooks::default());
        let ptr = alloc.try_alloc_file_backed(8192).expect("alloc_ext failed");
        let fd = fd_of(&alloc, ptr);
        assert!(fd_is_open(fd));

        // Safety: Test code.
        unsafe { alloc.free(ptr) };
        assert!(!fd_is_open(fd));
        assert!(alloc.registry().is_empty());
    }

    #[test]
    fn test_free_unknown_address_leaves_live_entries() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut alloc = TestAllocator::new(small_config(), SpyHooks::default());
        let anon = alloc.try_alloc(4096).expect("alloc failed");
        let file = alloc.try_alloc_file_backed(4096).expect("alloc_ext failed");
        let fd = fd_of(&alloc, file);

        let mut stray = 0u64;
        // Safety: Test code; the stray pointer is never dereferenced by free.
        assert!(unsafe { alloc.free(NonNull::from(&mut stray).cast()) }.is_none());

        assert_eq!(alloc.registry().len(), 2);
        assert!(fd_is_open(fd));
        // Safety: Test code; both regions must still be mapped.
        unsafe {
            *anon.as_ptr() = 9;
            *file.as_ptr() = 9;
        }
    }

    #[test]
    fn test_capacity_exceeded_is_reported() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut alloc = TestAllocator::new(small_config(), SpyHooks::default());
        for _ in 0..MAX_LARGE_ALLOCS {
            alloc.try_alloc(4096).expect("alloc within capacity failed");
        }
        let err = alloc.try_alloc(4096).expect_err("over-capacity alloc must fail");
        assert!(matches!(err, VmError::RegistryFull { capacity: MAX_LARGE_ALLOCS }));
        let err = alloc.try_alloc_file_backed(4096).expect_err("over-capacity alloc_ext must fail");
        assert!(matches!(err, VmError::RegistryFull { .. }));
        assert_eq!(alloc.registry().len(), MAX_LARGE_ALLOCS);
    }

    #[test]
    fn test_live_addresses_are_unique() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut alloc = TestAllocator::new(small_config(), SpyHooks::default());
        let a = alloc.try_alloc(4096).unwrap();
        // Safety: Test code.
        unsafe { alloc.free(a) };
        let b = alloc.try_alloc(4096).unwrap();
        let c = alloc.try_alloc_file_backed(4096).unwrap();
        let d = alloc.try_alloc(4096).unwrap();

        let mut live: Vec<usize> = alloc
            .registry()
            .iter()
            .map(|e| e.address.as_ptr() as usize)
            .collect();
        assert_eq!(live.len(), 3);
        live.sort_unstable();
        live.dedup();
        assert_eq!(live.len(), 3, "duplicate live address among {b:p} {c:p} {d:p}");
    }

    #[test]
    fn test_hook_failure_rolls_back() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let hooks = SpyHooks {
            installs: Rc::default(),
            fail: true,
        };
        let mut alloc = TestAllocator::new(small_config(), hooks.clone());
        let err = alloc.try_alloc_file_backed(4096).expect_err("install failure must surface");
        assert!(matches!(err, VmError::HookInstallFailed { .. }));
        assert!(alloc.registry().is_empty());
        assert_eq!(alloc.crash_state().state(), HookState::Uninstalled);
    }

    #[test]
    fn test_temp_file_failure_rolls_back() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let config = small_config().with_temp_dir("/nonexistent-largemem-dir");
        let hooks = SpyHooks::default();
        let mut alloc = TestAllocator::new(config, hooks.clone());
        let err = alloc.try_alloc_file_backed(4096).expect_err("missing temp dir must fail");
        assert!(matches!(err, VmError::TempFileFailed(_)));
        assert!(alloc.registry().is_empty());
        assert_eq!(hooks.installs.get(), 0);
    }

    #[test]
    fn test_file_backed_degrades_to_anonymous() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let hooks = SpyHooks::default();
        let config = small_config().with_tier(MappingTier::Anonymous);
        let mut alloc = TestAllocator::new(config, hooks.clone());
        let ptr = alloc.try_alloc_file_backed(4096).expect("degraded alloc failed");
        assert_eq!(alloc.registry().find(ptr).map(|e| e.backing), Some(Backing::Anonymous));
        assert_eq!(hooks.installs.get(), 0);
    }

    #[test]
    fn test_heap_tier_bypasses_registry() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut alloc = TestAllocator::new(LargeAllocConfig::heap_only(), SpyHooks::default());
        let a = alloc.try_alloc(1 << 20).expect("heap alloc failed");
        let b = alloc.try_alloc_file_backed(1 << 20).expect("heap alloc_ext failed");
        assert!(alloc.registry().is_empty());
        // Safety: Test code.
        unsafe {
            *a.as_ptr() = 1;
            *b.as_ptr() = 2;
            assert!(alloc.free(a).is_none());
            assert!(alloc.free(b).is_none());
        }
    }

    #[test]
    fn test_zero_size_gets_a_region() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut alloc = TestAllocator::new(small_config(), SpyHooks::default());
        let a = alloc.try_alloc(0).expect("zero-size alloc failed");
        let b = alloc.try_alloc_file_backed(0).expect("zero-size alloc_ext failed");
        assert_ne!(a, b);
        assert_eq!(alloc.registry().find(b).map(|e| e.size), Some(1));
    }

    #[test]
    fn test_unroundable_size_fails_cleanly() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut alloc = TestAllocator::new(small_config(), SpyHooks::default());
        let explicit_before = alloc.probe.should_try(MapKind::Anonymous);

        let err = alloc.try_alloc(usize::MAX - 10).expect_err("absurd size must fail");
        assert!(matches!(err, VmError::AnonymousMapFailed(_)));
        assert_eq!(alloc.registry().len(), 0);
        assert_eq!(alloc.probe.should_try(MapKind::Anonymous), explicit_before);

        let err = alloc
            .try_alloc_file_backed(usize::MAX - 10)
            .expect_err("absurd size must fail");
        assert!(matches!(err, VmError::ResizeFailed(_) | VmError::FileMapFailed(_)));
        assert_eq!(alloc.registry().len(), 0);

        let ptr = alloc.try_alloc(4096).expect("allocator unusable after failure");
        assert_eq!(alloc.registry().find(ptr).map(|e| e.size), Some(4096));
    }

    #[test]
    fn test_advise_registered_only() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut alloc = TestAllocator::new(small_config(), SpyHooks::default());
        let ptr = alloc.try_alloc(8192).unwrap();
        assert!(alloc.advise(ptr, Advice::WillNeed).unwrap());
        assert!(alloc.advise(ptr, Advice::Unused).unwrap());
        let mut stray = 0u64;
        assert!(!alloc.advise(NonNull::from(&mut stray).cast(), Advice::Unused).unwrap());
    }

    #[test]
    fn test_drop_releases_everything() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let before = stats::snapshot();
        let fd;
        {
            let mut alloc = TestAllocator::new(small_config(), SpyHooks::default());
            alloc.try_alloc(4096).unwrap();
            let ptr = alloc.try_alloc_file_backed(4096).unwrap();
            fd = fd_of(&alloc, ptr);

            let during = stats::snapshot();
            assert_eq!(during.live_mappings, before.live_mappings + 2);
            assert_eq!(during.open_descriptors, before.open_descriptors + 1);
            assert!(during.mapped_bytes >= before.mapped_bytes + 8192);
        }
        let after = stats::snapshot();
        assert_eq!(after.live_mappings, before.live_mappings);
        assert_eq!(after.open_descriptors, before.open_descriptors);
        assert_eq!(after.mapped_bytes, before.mapped_bytes);
        assert!(!fd_is_open(fd));
    }
}
