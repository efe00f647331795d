//! The VMA map: one address space's set of mapped virtual ranges, their
//! permissions, and the vm_object each backs onto.
//!
//! The data structure is a `BTreeMap<VAddr, Vma>` keyed by start address
//! (O(log n) insert/lookup/overlap-check for free, courtesy of the
//! already-balanced std tree) paired with a secondary `BTreeMap<(usize,
//! VAddr), VAddr>` gap index keyed by `(gap_size, gap_start)`: finding the
//! smallest gap that still fits a request is a single `range` query on the
//! index rather than a tree walk that has to carry a max-gap augmentation
//! by hand. See `DESIGN.md` for why this was chosen over a hand-rolled
//! augmented red-black tree.
//!
//! The first [`BOOTSTRAP_POOL_SIZE`] [`Vma`] allocations come out of a
//! BSS-resident pool rather than the global allocator, so an address space
//! can exist before the slab heap the global allocator is wired to is up.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use eonix_mm::address::{AddrOps as _, VAddr, VRange};
use eonix_mm::paging::PAGE_SIZE;

use crate::collaborators::MmHandle;
use crate::sync::RwLock;
use crate::vm_object::VmObject;

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct VmaFlags: u32 {
        const READ          = 1 << 0;
        const WRITE         = 1 << 1;
        const EXEC          = 1 << 2;
        const SHARED        = 1 << 3;
        const NO_HUGEPAGE   = 1 << 4;
        const UFFD_MISSING  = 1 << 5;
        const UFFD_WP       = 1 << 6;
    }
}

/// One mapped virtual range. Stored by value in the owning address space's
/// map; `object`/`pgoff` say what backs it, `anon_vma_chain` is the
/// fork-sharing chain anonymous pages use for rmap.
pub struct Vma {
    range: VRange,
    pub flags: VmaFlags,
    pub object: Arc<VmObject>,
    /// Page offset into `object` that `range.start()` maps to.
    pub pgoff: usize,
    pub preferred_node: u8,
    /// Other VMAs (this one's fork ancestors/siblings) sharing the same
    /// anon_vma, for anonymous-page rmap.
    pub anon_vma_chain: alloc::vec::Vec<MmHandle>,
    /// Set once userspace registers this range with userfaultfd; checked
    /// by the fault path before it does anything else.
    pub uffd: Option<Arc<crate::fault::UserfaultfdCtx>>,
}

impl Vma {
    pub fn new(range: VRange, flags: VmaFlags, object: Arc<VmObject>, pgoff: usize, preferred_node: u8) -> Self {
        Self {
            range,
            flags,
            object,
            pgoff,
            preferred_node,
            anon_vma_chain: alloc::vec::Vec::new(),
            uffd: None,
        }
    }

    pub fn range(&self) -> VRange {
        self.range
    }
}

const BOOTSTRAP_POOL_SIZE: usize = 128;

/// A `Vma` handle that's either a heap box or a slot borrowed from the
/// bootstrap pool; `Drop` routes to the right place.
pub enum VmaBox {
    Heap(Box<Vma>),
    Bootstrap(NonNull<Vma>),
}

impl core::ops::Deref for VmaBox {
    type Target = Vma;
    fn deref(&self) -> &Vma {
        match self {
            VmaBox::Heap(b) => b,
            VmaBox::Bootstrap(p) => unsafe { p.as_ref() },
        }
    }
}

impl core::ops::DerefMut for VmaBox {
    fn deref_mut(&mut self) -> &mut Vma {
        match self {
            VmaBox::Heap(b) => b,
            VmaBox::Bootstrap(p) => unsafe { p.as_mut() },
        }
    }
}

impl Drop for VmaBox {
    fn drop(&mut self) {
        if let VmaBox::Bootstrap(p) = *self {
            unsafe { bootstrap_pool::free(p) };
        }
    }
}

mod bootstrap_pool {
    use super::{Vma, BOOTSTRAP_POOL_SIZE};
    use core::cell::UnsafeCell;
    use core::mem::MaybeUninit;
    use core::ptr::NonNull;
    use eonix_sync::Spin;

    const BITMAP_WORDS: usize = BOOTSTRAP_POOL_SIZE / 64;

    #[repr(transparent)]
    struct Slot(UnsafeCell<MaybeUninit<Vma>>);

    // SAFETY: every slot is only ever touched while `BITMAP`'s lock is held,
    // which is what actually arbitrates access to it.
    unsafe impl Sync for Slot {}

    static POOL: [Slot; BOOTSTRAP_POOL_SIZE] =
        [const { Slot(UnsafeCell::new(MaybeUninit::uninit())) }; BOOTSTRAP_POOL_SIZE];

    /// One bit per slot, set while that slot holds a live `Vma`.
    static BITMAP: Spin<[u64; BITMAP_WORDS]> = Spin::new([0; BITMAP_WORDS]);

    /// Takes a slot if one is free; hands `vma` back if the pool is full so
    /// the caller can fall back to the heap.
    pub fn alloc(vma: Vma) -> Result<NonNull<Vma>, Vma> {
        let mut bitmap = BITMAP.lock();
        for idx in 0..BOOTSTRAP_POOL_SIZE {
            let (word, bit) = (idx / 64, idx % 64);
            if bitmap[word] & (1 << bit) == 0 {
                bitmap[word] |= 1 << bit;
                let slot = POOL[idx].0.get();
                unsafe {
                    (*slot).write(vma);
                    return Ok(NonNull::new_unchecked((*slot).as_mut_ptr()));
                }
            }
        }
        Err(vma)
    }

    /// # Safety
    /// `ptr` must have come from a still-live [`alloc`] call on this pool.
    pub unsafe fn free(ptr: NonNull<Vma>) {
        let base = POOL.as_ptr() as usize;
        let idx = (ptr.as_ptr() as usize - base) / core::mem::size_of::<Slot>();
        debug_assert!(idx < BOOTSTRAP_POOL_SIZE);

        unsafe { core::ptr::drop_in_place(ptr.as_ptr()) };

        let mut bitmap = BITMAP.lock();
        let (word, bit) = (idx / 64, idx % 64);
        bitmap[word] &= !(1 << bit);
    }
}

fn box_vma(vma: Vma) -> VmaBox {
    match bootstrap_pool::alloc(vma) {
        Ok(ptr) => VmaBox::Bootstrap(ptr),
        Err(vma) => VmaBox::Heap(Box::new(vma)),
    }
}

struct AddressSpaceLocked {
    areas: BTreeMap<VAddr, VmaBox>,
    /// `(gap_size_in_bytes, gap_start)` -> nothing meaningful, just an
    /// ordered set; `gap_start` is carried in the key (not the value) so
    /// `BTreeMap::range` can return it without a lookup.
    gaps: BTreeMap<(usize, VAddr), ()>,
    break_start: Option<VAddr>,
    break_pos: Option<VAddr>,
}

/// One address space's VMA map (spec.md's `mm_struct`), minus the page
/// table itself (that's the collaborator's concern, reached through
/// [`MmHandle`]).
pub struct AddressSpace {
    pub handle: MmHandle,
    locked: RwLock<AddressSpaceLocked>,
    map_count: AtomicU64,
    user_lo: VAddr,
    user_hi: VAddr,
}

impl AddressSpace {
    pub fn new(handle: MmHandle, user_lo: VAddr, user_hi: VAddr) -> Self {
        let mut gaps = BTreeMap::new();
        gaps.insert((user_hi - user_lo, user_lo), ());

        Self {
            handle,
            locked: crate::sync::new_rwlock(AddressSpaceLocked {
                areas: BTreeMap::new(),
                gaps,
                break_start: None,
                break_pos: None,
            }),
            map_count: AtomicU64::new(0),
            user_lo,
            user_hi,
        }
    }

    pub fn map_count(&self) -> u64 {
        self.map_count.load(Ordering::Relaxed)
    }

    /// Insert a VMA for `range`. Refuses if it overlaps any existing VMA.
    pub fn insert(
        &self,
        range: VRange,
        flags: VmaFlags,
        object: Arc<VmObject>,
        pgoff: usize,
        preferred_node: u8,
    ) -> crate::error::MmResult<()> {
        if range.start() < self.user_lo || range.end() > self.user_hi {
            return Err(crate::error::MmError::Invalid("range outside address space"));
        }

        let mut locked = self.locked.write();
        if overlaps(&locked.areas, range) {
            return Err(crate::error::MmError::Invalid("overlaps an existing VMA"));
        }

        // No VMA overlaps `range`, so it falls entirely within the single
        // gap bounded by the nearest VMA (or the address-space edge) on
        // either side; that gap's key is exactly derivable from those two
        // neighbors, no need to search the gap index itself.
        let left_bound = locked
            .areas
            .range(..range.start())
            .next_back()
            .map(|(_, vma)| vma.range().end())
            .unwrap_or(self.user_lo);
        let right_bound = locked
            .areas
            .range(range.start()..)
            .next()
            .map(|(start, _)| *start)
            .unwrap_or(self.user_hi);

        let gap = (right_bound - left_bound, left_bound);
        remove_gap(&mut locked.gaps, gap);
        reinsert_remainder(&mut locked.gaps, gap, range);

        let vma = Vma::new(range, flags, object, pgoff, preferred_node);
        vma.object.register_vma(crate::vm_object::VmaRef {
            mm: self.handle,
            range,
            pgoff,
        });
        locked.areas.insert(range.start(), box_vma(vma));
        self.map_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// O(log n) lookup by address.
    pub fn find(&self, addr: VAddr) -> bool {
        self.with_area_containing(addr, |_| ()).is_some()
    }

    pub fn with_area_containing<R>(&self, addr: VAddr, f: impl FnOnce(&Vma) -> R) -> Option<R> {
        let locked = self.locked.read();
        let (_, vma) = locked.areas.range(..=addr).next_back()?;
        if vma.range().start() <= addr && addr < vma.range().end() {
            Some(f(vma))
        } else {
            None
        }
    }

    /// First aligned gap of at least `len` bytes within `[lo, hi)`, walking
    /// the gap index from the smallest-fitting entry up rather than
    /// scanning the area list. `align` must be a power of two.
    pub fn find_free_region(&self, lo: VAddr, hi: VAddr, len: usize, align: usize) -> Option<VAddr> {
        let len = len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let locked = self.locked.read();

        for ((gap_size, gap_start), ()) in locked.gaps.range((len, VAddr::NULL)..) {
            let gap_size = *gap_size;
            let gap_start = *gap_start;
            if gap_size < len {
                continue;
            }

            let aligned = gap_start.ceil_to(align);
            let slack = aligned - gap_start;
            if slack >= gap_size {
                continue;
            }
            if gap_size - slack < len {
                continue;
            }

            let candidate_end = aligned + len;
            if aligned < lo {
                continue;
            }
            if candidate_end > hi {
                continue;
            }

            return Some(aligned);
        }

        None
    }

    /// Remove every VMA overlapping `range`, splitting the boundary VMAs if
    /// `range` only partially covers them. Returns the vm_objects that lost
    /// a mapping (so the caller can run rmap teardown / last-unmap free).
    pub fn remove_range(&self, range: VRange) -> alloc::vec::Vec<Arc<VmObject>> {
        let mut locked = self.locked.write();
        let mut removed_objects = alloc::vec::Vec::new();

        let overlapping_starts: alloc::vec::Vec<VAddr> = locked
            .areas
            .range(..)
            .filter(|(_, vma)| vma.range().overlap_with(&range))
            .map(|(start, _)| *start)
            .collect();

        for start in overlapping_starts {
            let vma = locked.areas.remove(&start).expect("just matched above");
            let vma_range = vma.range();
            vma.object.unregister_vma(self.handle, vma_range);
            removed_objects.push(vma.object.clone());
            self.map_count.fetch_sub(1, Ordering::Relaxed);

            let Some((left, _mid, right)) = vma_range.mask_with_checked(&range) else {
                continue;
            };

            if let Some(left) = left {
                let new_vma = Vma::new(left, vma.flags, vma.object.clone(), vma.pgoff, vma.preferred_node);
                new_vma.object.register_vma(crate::vm_object::VmaRef {
                    mm: self.handle,
                    range: left,
                    pgoff: new_vma.pgoff,
                });
                locked.areas.insert(left.start(), box_vma(new_vma));
                self.map_count.fetch_add(1, Ordering::Relaxed);
            }
            if let Some(right) = right {
                let pgoff_shift = (right.start() - vma_range.start()) / PAGE_SIZE;
                let new_vma = Vma::new(
                    right,
                    vma.flags,
                    vma.object.clone(),
                    vma.pgoff + pgoff_shift,
                    vma.preferred_node,
                );
                new_vma.object.register_vma(crate::vm_object::VmaRef {
                    mm: self.handle,
                    range: right,
                    pgoff: new_vma.pgoff,
                });
                locked.areas.insert(right.start(), box_vma(new_vma));
                self.map_count.fetch_add(1, Ordering::Relaxed);
            }
        }

        rebuild_gaps(&mut locked, self.user_lo, self.user_hi);
        removed_objects
    }

    /// Tear the whole address space down, returning every vm_object that
    /// lost its last mapping from this space.
    pub fn destroy(&self) -> alloc::vec::Vec<Arc<VmObject>> {
        let mut locked = self.locked.write();
        let objects = locked
            .areas
            .values()
            .map(|vma| {
                vma.object.unregister_vma(self.handle, vma.range());
                vma.object.clone()
            })
            .collect();
        locked.areas.clear();
        locked.gaps.clear();
        self.map_count.store(0, Ordering::Relaxed);
        objects
    }
}

fn overlaps(areas: &BTreeMap<VAddr, VmaBox>, range: VRange) -> bool {
    if let Some((_, left)) = areas.range(..=range.start()).next_back() {
        if left.range().overlap_with(&range) {
            return true;
        }
    }
    areas
        .range(range.start()..range.end())
        .next()
        .map(|(_, vma)| vma.range().overlap_with(&range))
        .unwrap_or(false)
}

fn remove_gap(gaps: &mut BTreeMap<(usize, VAddr), ()>, gap: (usize, VAddr)) {
    gaps.remove(&gap);
}

/// After removing the gap that used to span `vma_range`'s footprint,
/// reinsert whatever slack remains on either side of it.
fn reinsert_remainder(gaps: &mut BTreeMap<(usize, VAddr), ()>, gap: (usize, VAddr), taken: VRange) {
    let (gap_size, gap_start) = gap;
    let gap_end = gap_start + gap_size;

    if gap_start < taken.start() {
        let left_len = taken.start() - gap_start;
        gaps.insert((left_len, gap_start), ());
    }
    if taken.end() < gap_end {
        let right_len = gap_end - taken.end();
        gaps.insert((right_len, taken.end()), ());
    }
}

/// Recompute the gap index from scratch against the current area set.
/// O(n); used after bulk removal where incremental gap bookkeeping would
/// be more bug-prone than just re-deriving it.
fn rebuild_gaps(locked: &mut AddressSpaceLocked, user_lo: VAddr, user_hi: VAddr) {
    locked.gaps.clear();
    let mut cursor = user_lo;
    for (start, vma) in locked.areas.iter() {
        if *start > cursor {
            locked.gaps.insert((*start - cursor, cursor), ());
        }
        cursor = vma.range().end();
    }
    if cursor < user_hi {
        locked.gaps.insert((user_hi - cursor, cursor), ());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm_object::{VmObject, VmObjectKind};
    use eonix_mm::paging::PFN;

    fn handle() -> MmHandle {
        MmHandle::new(PFN::from(0usize))
    }

    fn space() -> AddressSpace {
        AddressSpace::new(handle(), VAddr::from(0x1000), VAddr::from(0x10_0000))
    }

    fn object() -> Arc<VmObject> {
        VmObject::new(VmObjectKind::Anonymous, 0x10000, 0)
    }

    #[test]
    fn insert_then_lookup() {
        let space = space();
        let range = VRange::new(VAddr::from(0x2000), VAddr::from(0x3000));
        space
            .insert(range, VmaFlags::READ | VmaFlags::WRITE, object(), 0, 0)
            .unwrap();

        assert!(space.find(VAddr::from(0x2500)));
        assert!(!space.find(VAddr::from(0x5000)));
        assert_eq!(space.map_count(), 1);
    }

    #[test]
    fn overlapping_insert_is_refused() {
        let space = space();
        let range = VRange::new(VAddr::from(0x2000), VAddr::from(0x4000));
        space.insert(range, VmaFlags::READ, object(), 0, 0).unwrap();

        let overlapping = VRange::new(VAddr::from(0x3000), VAddr::from(0x5000));
        assert!(space
            .insert(overlapping, VmaFlags::READ, object(), 0, 0)
            .is_err());
    }

    #[test]
    fn find_free_region_avoids_mapped_ranges() {
        let space = space();
        space
            .insert(
                VRange::new(VAddr::from(0x2000), VAddr::from(0x4000)),
                VmaFlags::READ,
                object(),
                0,
                0,
            )
            .unwrap();

        let found = space
            .find_free_region(VAddr::from(0x1000), VAddr::from(0x10_0000), 0x1000, 0x1000)
            .unwrap();
        assert!(found < VAddr::from(0x2000) || found >= VAddr::from(0x4000));
    }

    #[test]
    fn remove_range_splits_a_covering_vma() {
        let space = space();
        space
            .insert(
                VRange::new(VAddr::from(0x2000), VAddr::from(0x6000)),
                VmaFlags::READ,
                object(),
                0,
                0,
            )
            .unwrap();

        let removed = space.remove_range(VRange::new(VAddr::from(0x3000), VAddr::from(0x4000)));
        assert_eq!(removed.len(), 1);
        assert_eq!(space.map_count(), 2);
        assert!(space.find(VAddr::from(0x2500)));
        assert!(!space.find(VAddr::from(0x3500)));
        assert!(space.find(VAddr::from(0x5000)));
    }

    #[test]
    fn destroy_clears_the_map() {
        let space = space();
        space
            .insert(
                VRange::new(VAddr::from(0x2000), VAddr::from(0x3000)),
                VmaFlags::READ,
                object(),
                0,
                0,
            )
            .unwrap();

        let objects = space.destroy();
        assert_eq!(objects.len(), 1);
        assert_eq!(space.map_count(), 0);
    }

    #[test]
    fn bootstrap_pool_reuses_freed_slots() {
        // Allocate and drop more than the pool holds, to exercise both the
        // bootstrap and heap-fallback paths without leaking bitmap bits.
        for _ in 0..(BOOTSTRAP_POOL_SIZE + 4) {
            let vma = Vma::new(
                VRange::new(VAddr::from(0x1000), VAddr::from(0x2000)),
                VmaFlags::READ,
                object(),
                0,
                0,
            );
            drop(box_vma(vma));
        }
    }
}
