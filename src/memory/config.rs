use std::path::PathBuf;

/// Which allocation strategy the large allocator may use, lowest first.
///
/// Every strategy degrades to the next lower tier when its own tier is not
/// enabled: file-backed requests become anonymous ones, anonymous requests
/// become plain heap allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MappingTier {
    /// No mappings at all; large allocations come from the C heap and are not
    /// tracked.
    Heap,
    /// Registry-tracked anonymous mappings.
    Anonymous,
    /// Anonymous mappings plus temp-file-backed mappings, with crash-safety
    /// hooks installed on first use.
    FileBacked,
}

impl MappingTier {
    /// Highest tier compiled into this build.
    #[must_use]
    pub const fn compiled() -> Self {
        if cfg!(feature = "file-backed-mappings") {
            MappingTier::FileBacked
        } else if cfg!(feature = "large-mappings") {
            MappingTier::Anonymous
        } else {
            MappingTier::Heap
        }
    }
}

/// Capabilities of the large allocator, chosen once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LargeAllocConfig {
    /// Highest strategy to use. Default: [`MappingTier::compiled`].
    pub tier: MappingTier,

    /// Ask for huge pages on every mapping. Explicit hugetlb pages are tried
    /// first; if the kernel refuses them the allocator falls back to ordinary
    /// pages (with a transparent-huge-page hint on anonymous memory) and stops
    /// asking. Default: true where the platform has a huge-page mmap flag.
    pub huge_page_hint: bool,

    /// Fault every page in at mapping time. Default: true where the platform
    /// has a populate mmap flag.
    pub eager_populate: bool,

    /// Directory for the unlinked backing files of file-backed mappings.
    /// Default: `std::env::temp_dir()` (honours `TMPDIR`).
    pub temp_dir: PathBuf,
}

impl Default for LargeAllocConfig {
    fn default() -> Self {
        Self::detect()
    }
}

impl LargeAllocConfig {
    /// Capabilities of this build on this platform.
    #[must_use]
    pub fn detect() -> Self {
        let linux = cfg!(any(target_os = "linux", target_os = "android"));
        Self {
            tier: MappingTier::compiled(),
            huge_page_hint: linux,
            eager_populate: linux,
            temp_dir: std::env::temp_dir(),
        }
    }

    /// Large allocations are forwarded to the C heap.
    #[must_use]
    pub fn heap_only() -> Self {
        Self::detect().with_tier(MappingTier::Heap)
    }

    /// Cap the tier. Asking for more than was compiled in has no effect.
    #[must_use]
    pub fn with_tier(mut self, tier: MappingTier) -> Self {
        self.tier = tier.min(MappingTier::compiled());
        self
    }

    #[must_use]
    pub fn with_huge_page_hint(mut self, enabled: bool) -> Self {
        self.huge_page_hint = enabled;
        self
    }

    #[must_use]
    pub fn with_eager_populate(mut self, enabled: bool) -> Self {
        self.eager_populate = enabled;
        self
    }

    #[must_use]
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }
}
