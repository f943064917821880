use super::stats;
use super::vm::{RawDescriptor, VmError, VmOps};
use std::ptr::NonNull;

/// Default registry capacity. The workload does a handful of huge
/// allocations; running out means a bug, not pressure.
pub const MAX_LARGE_ALLOCS: usize = 32;

/// What backs a registered mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Anonymous memory; nothing to close on release.
    Anonymous,
    /// Private mapping of an unlinked temp file; the registry owns the descriptor.
    File(RawDescriptor),
}

/// One live large allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryEntry {
    pub address: NonNull<u8>,
    /// Bytes requested by the caller.
    pub size: usize,
    /// Bytes actually mapped (`size` rounded up to the huge page when
    /// explicit huge pages were granted). Used for `munmap`.
    pub mapped_len: usize,
    pub backing: Backing,
}

/// Handle to a reserved slot, valid until it is recorded or cancelled.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SlotIndex(usize);

#[derive(Debug, Clone, Copy)]
enum Slot {
    Vacant,
    /// Counted against capacity while the mapping is being built.
    Reserved,
    Live(RegistryEntry),
}

/// Fixed-capacity, ordered table of large mappings.
///
/// Occupied slots always form the prefix `[0, len)`; removal shifts the tail
/// down by one so the order of the remaining entries is preserved. The table
/// is an inline array so that [`release_all`](Self::release_all) never touches
/// the heap.
pub(crate) struct Registry<const N: usize> {
    slots: [Slot; N],
    len: usize,
}

// Safety: the registry owns its mappings; raw addresses are just bookkeeping.
unsafe impl<const N: usize> Send for Registry<N> {}

impl<const N: usize> Registry<N> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [Slot::Vacant; N],
            len: 0,
        }
    }

    /// Number of occupied slots, reserved ones included.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[cfg(test)]
    #[inline]
    pub(crate) const fn capacity(&self) -> usize {
        N
    }

    /// Claim the next slot before the mapping call is made.
    ///
    /// # Errors
    ///
    /// `VmError::RegistryFull` when all `N` slots are occupied; nothing is
    /// modified in that case.
    pub(crate) fn reserve_slot(&mut self) -> Result<SlotIndex, VmError> {
        if self.len == N {
            return Err(VmError::RegistryFull { capacity: N });
        }
        let index = self.len;
        self.slots[index] = Slot::Reserved;
        self.len += 1;
        Ok(SlotIndex(index))
    }

    /// Fill a reserved slot with a completed mapping.
    pub(crate) fn record(
        &mut self,
        slot: SlotIndex,
        address: NonNull<u8>,
        size: usize,
        mapped_len: usize,
        backing: Backing,
    ) {
        debug_assert!(
            matches!(self.slots[slot.0], Slot::Reserved),
            "record: slot {} is not reserved",
            slot.0
        );
        debug_assert!(
            self.find(address).is_none(),
            "record: {address:p} is already registered"
        );
        self.slots[slot.0] = Slot::Live(RegistryEntry {
            address,
            size,
            mapped_len,
            backing,
        });

        stats::LIVE_MAPPINGS.add(1);
        stats::MAPPED_BYTES.add(mapped_len);
        if matches!(backing, Backing::File(_)) {
            stats::OPEN_DESCRIPTORS.add(1);
        }
    }

    /// Give back a reserved slot whose mapping was never recorded.
    pub(crate) fn cancel(&mut self, slot: SlotIndex) {
        debug_assert!(
            matches!(self.slots[slot.0], Slot::Reserved),
            "cancel: slot {} is not reserved",
            slot.0
        );
        self.remove_at(slot.0);
    }

    pub(crate) fn find(&self, address: NonNull<u8>) -> Option<&RegistryEntry> {
        self.iter().find(|e| e.address == address)
    }

    /// Live entries in registration order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.slots[..self.len].iter().filter_map(|slot| match slot {
            Slot::Live(entry) => Some(entry),
            Slot::Vacant | Slot::Reserved => None,
        })
    }

    /// Unmap and forget the entry at `address`.
    ///
    /// Returns `None`, and leaves every other entry untouched, if `address`
    /// is not registered.
    pub(crate) fn find_and_remove<V: VmOps>(
        &mut self,
        address: NonNull<u8>,
    ) -> Option<RegistryEntry> {
        let index = self.slots[..self.len]
            .iter()
            .position(|slot| matches!(slot, Slot::Live(e) if e.address == address))?;
        let Slot::Live(entry) = self.slots[index] else {
            unreachable!("position matched a live slot");
        };

        // Safety: the entry describes a mapping this registry created.
        if let Err(e) = unsafe { V::unmap(entry.address, entry.mapped_len) } {
            log::error!(
                "[memory] unmap of {:p} ({} bytes) failed: {e}",
                entry.address,
                entry.mapped_len
            );
        }
        if let Backing::File(fd) = entry.backing {
            // Safety: the registry owns `fd`.
            unsafe { V::close_descriptor(fd) };
            stats::OPEN_DESCRIPTORS.sub(1);
        }
        stats::LIVE_MAPPINGS.sub(1);
        stats::MAPPED_BYTES.sub(entry.mapped_len);

        self.remove_at(index);
        Some(entry)
    }

    /// Unmap every live entry, close every backing descriptor and clear the
    /// table.
    ///
    /// Runs from the exit hook and the `SIGABRT` handler: no allocation, no
    /// locking, no logging, and errors are ignored. A second call finds an
    /// empty table and does nothing.
    pub(crate) fn release_all<V: VmOps>(&mut self) {
        for slot in &mut self.slots[..self.len] {
            if let Slot::Live(entry) = *slot {
                // Safety: the entry describes a mapping this registry created.
                drop(unsafe { V::unmap(entry.address, entry.mapped_len) });
                if let Backing::File(fd) = entry.backing {
                    // Safety: the registry owns `fd`.
                    unsafe { V::close_descriptor(fd) };
                    stats::OPEN_DESCRIPTORS.sub(1);
                }
                stats::LIVE_MAPPINGS.sub(1);
                stats::MAPPED_BYTES.sub(entry.mapped_len);
            }
            *slot = Slot::Vacant;
        }
        self.len = 0;
    }

    fn remove_at(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.slots.copy_within(index + 1..self.len, index);
        self.len -= 1;
        self.slots[self.len] = Slot::Vacant;
    }
}

impl<const N: usize> Default for Registry<N> {
    fn default() -> Self {
        Self::new()
    }
}
