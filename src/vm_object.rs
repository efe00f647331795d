//! vm_object: the thing a VMA maps. Anonymous, Vnode, Device, or Shadow,
//! refcounted through `Arc` (so the atomic refcount spec.md lists as an
//! attribute is `Arc`'s own strong count, not a field here), holding a
//! radix-indexed page tree keyed by page-offset.
//!
//! The page tree and rmap list are built here; the fault path that
//! populates and walks them (COW, shadow-chain collapse/bypass, readahead,
//! userfaultfd) is a later module built on top of this one.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use buddy_allocator::BuddyFolio;
use eonix_mm::address::{PAddr, VRange};

use crate::collaborators::MmHandle;
use crate::sync::RwLock;

/// How a Vnode object populates a page tree slot on a fault. Narrow and
/// object-safe for the same reason `slab_allocator::SlabPageAccess` is:
/// every vnode-backed object shares one dynamically-dispatched filesystem
/// hook, set up by whoever owns the backing store.
pub trait ReadFolio: Send + Sync {
    fn read_folio(&self, pgoff: usize, dst: &BuddyFolio) -> crate::error::MmResult<()>;
}

/// How an Anonymous object's swapped-out or zram-compressed pages come
/// back. Absent for objects that have never been reclaimed.
pub trait SwapBacking: Send + Sync {
    fn swap_in(&self, handle: u64, dst: &BuddyFolio) -> crate::error::MmResult<()>;
    fn decompress(&self, handle: u64, dst: &BuddyFolio) -> crate::error::MmResult<()>;
    fn free_slot(&self, handle: u64);
}

/// What a vm_object is backed by.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VmObjectKind {
    /// Zero-fill-on-demand memory with no file backing.
    Anonymous,
    /// Backed by a file/inode at some collaborator-defined identity.
    Vnode,
    /// A direct physical-address window (MMIO); never populates the page
    /// tree, so its fault path is a pure `map_page` of `phys + offset`.
    Device,
    /// Interposed on fork of a private mapping; forwards reads to `backing`
    /// and copies on write. See [`VmObjectLocked::backing`].
    Shadow,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct VmObjectFlags: u32 {
        const SHADOW     = 1 << 0;
        const COLLAPSING = 1 << 1;
        const DEAD       = 1 << 2;
    }
}

/// One slot of the page tree, tagging what the low two bits of a real
/// tagged pointer would otherwise encode (spec.md's page-tree entry
/// encoding table).
#[derive(Clone)]
pub enum PageTreeEntry {
    Folio(BuddyFolio),
    Compressed(u64),
    Swap(u64),
    WorkingSetShadow(u64),
}

/// Adaptive-readahead state, one per vm_object (spec.md's "readahead
/// state" attribute).
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadaheadState {
    pub start: usize,
    pub size: usize,
    pub async_size: usize,
    pub max_ra_pages: usize,
    pub thrash_count: u32,
}

/// One VMA currently mapping this object, recorded for rmap walks
/// (`try_to_unmap_folio`). Kept as a plain (address-space handle, range)
/// pair rather than a pointer back into the VMA map, so this module never
/// has to hold this object's lock and the VMA map's lock at once.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VmaRef {
    pub mm: MmHandle,
    pub range: VRange,
    /// Page offset into the object that `range.start()` maps to, carried
    /// here (rather than looked up from the VMA map) so a rmap walk never
    /// needs the map's lock.
    pub pgoff: usize,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct VmObjectStats {
    pub nr_pages: usize,
    pub nr_swap: usize,
    pub nr_dirty: usize,
}

/// Fields that need the object's rwlock: the page tree itself, the shadow
/// chain's backing link, and the two reverse-mapping lists.
pub struct VmObjectLocked {
    pub page_tree: BTreeMap<usize, PageTreeEntry>,
    /// `Some` only for `Shadow` objects: the object this one was
    /// interposed in front of, plus the page-offset shift between them.
    pub backing: Option<Arc<VmObject>>,
    pub shadow_offset: usize,
    pub shadow_depth: u32,
    /// VMAs currently mapping this object, for rmap walks.
    pub vmas: Vec<VmaRef>,
    /// Folios with unwritten changes, oldest first.
    pub dirty_folios: Vec<usize>,
}

pub struct VmObject {
    pub kind: VmObjectKind,
    size: AtomicUsize,
    locked: RwLock<VmObjectLocked>,
    /// Other shadow objects created on top of this one.
    children_count: AtomicUsize,
    /// Collapse `backing` into a child once `children_count` drops to 1
    /// and this many or fewer pages remain to copy. Default 8 per
    /// spec.md.
    pub collapse_threshold: u32,
    pub preferred_node: u8,
    readahead: crate::sync::RwLock<ReadaheadState>,
    stats: VmObjectStatsCell,
    flags: AtomicU32,
    /// `Device` objects only: the physical base this object's page-offset
    /// zero maps to. Never consulted for any other kind.
    device_base: Option<PAddr>,
    /// `Vnode` objects only: how a missing page gets populated.
    read_folio_hook: Option<&'static dyn ReadFolio>,
    /// `Anonymous` objects only, and only once something of theirs has
    /// been reclaimed: how a `Swap`/`Compressed` page-tree entry resolves.
    swap_backing: Option<&'static dyn SwapBacking>,
}

/// `VmObjectStats`'s three counters as independent atomics: faults update
/// one at a time and never need a consistent snapshot of all three.
struct VmObjectStatsCell {
    nr_pages: AtomicUsize,
    nr_swap: AtomicUsize,
    nr_dirty: AtomicUsize,
}

impl VmObject {
    #[allow(clippy::too_many_arguments)]
    fn build(
        kind: VmObjectKind,
        size: usize,
        preferred_node: u8,
        backing: Option<Arc<VmObject>>,
        shadow_offset: usize,
        shadow_depth: u32,
        flags: VmObjectFlags,
        device_base: Option<PAddr>,
        read_folio_hook: Option<&'static dyn ReadFolio>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            size: AtomicUsize::new(size),
            locked: crate::sync::new_rwlock(VmObjectLocked {
                page_tree: BTreeMap::new(),
                backing,
                shadow_offset,
                shadow_depth,
                vmas: Vec::new(),
                dirty_folios: Vec::new(),
            }),
            children_count: AtomicUsize::new(0),
            collapse_threshold: 8,
            preferred_node,
            readahead: crate::sync::new_rwlock(ReadaheadState::default()),
            stats: VmObjectStatsCell {
                nr_pages: AtomicUsize::new(0),
                nr_swap: AtomicUsize::new(0),
                nr_dirty: AtomicUsize::new(0),
            },
            flags: AtomicU32::new(flags.bits()),
            device_base,
            read_folio_hook,
            swap_backing: None,
        })
    }

    pub fn new(kind: VmObjectKind, size: usize, preferred_node: u8) -> Arc<Self> {
        Self::build(
            kind,
            size,
            preferred_node,
            None,
            0,
            0,
            VmObjectFlags::empty(),
            None,
            None,
        )
    }

    /// A Vnode-backed object: faults populate the page tree by calling
    /// `read_folio` instead of zero-filling.
    pub fn new_vnode(read_folio: &'static dyn ReadFolio, size: usize, preferred_node: u8) -> Arc<Self> {
        Self::build(
            VmObjectKind::Vnode,
            size,
            preferred_node,
            None,
            0,
            0,
            VmObjectFlags::empty(),
            None,
            Some(read_folio),
        )
    }

    /// A Device object: faults map `base + (pgoff * PAGE_SIZE)` directly
    /// and never touch the page tree.
    pub fn new_device(base: PAddr, size: usize, preferred_node: u8) -> Arc<Self> {
        Self::build(
            VmObjectKind::Device,
            size,
            preferred_node,
            None,
            0,
            0,
            VmObjectFlags::empty(),
            Some(base),
            None,
        )
    }

    /// Interpose a fresh, empty shadow object between `backing` and
    /// whatever was mapping it, offset by `shadow_offset` pages. Created in
    /// pairs on fork of a private mapping; the caller is responsible for
    /// repointing both VMAs at their own new shadow.
    pub fn new_shadow(backing: Arc<VmObject>, shadow_offset: usize, size: usize) -> Arc<Self> {
        let preferred_node = backing.preferred_node;
        let depth = backing.shadow_depth_of_new_child();
        backing.children_count.fetch_add(1, Ordering::AcqRel);

        Self::build(
            VmObjectKind::Shadow,
            size,
            preferred_node,
            Some(backing),
            shadow_offset,
            depth,
            VmObjectFlags::SHADOW,
            None,
            None,
        )
    }

    /// Attach reclaim backing to a freshly built Anonymous object, before
    /// anyone else can observe it (the only time this is ever called: `self`
    /// being `&mut` through `Arc::get_mut` proves sole ownership).
    pub fn set_swap_backing(self: &mut Arc<Self>, backing: &'static dyn SwapBacking) {
        Arc::get_mut(self)
            .expect("set_swap_backing called on a shared object")
            .swap_backing = Some(backing);
    }

    fn shadow_depth_of_new_child(&self) -> u32 {
        self.locked.read().shadow_depth + 1
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn locked(&self) -> &RwLock<VmObjectLocked> {
        &self.locked
    }

    pub fn children_count(&self) -> usize {
        self.children_count.load(Ordering::Acquire)
    }

    pub fn flags(&self) -> VmObjectFlags {
        VmObjectFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    pub fn set_flag(&self, flag: VmObjectFlags, value: bool) {
        if value {
            self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        }
    }

    pub fn stats(&self) -> VmObjectStats {
        VmObjectStats {
            nr_pages: self.stats.nr_pages.load(Ordering::Relaxed),
            nr_swap: self.stats.nr_swap.load(Ordering::Relaxed),
            nr_dirty: self.stats.nr_dirty.load(Ordering::Relaxed),
        }
    }

    pub fn readahead(&self) -> ReadaheadState {
        *self.readahead.read()
    }

    pub fn update_readahead(&self, f: impl FnOnce(&mut ReadaheadState)) {
        f(&mut self.readahead.write());
    }

    /// Record a page installed into the tree, for `stats().nr_pages`.
    pub fn note_page_inserted(&self) {
        self.stats.nr_pages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_page_removed(&self) {
        self.stats.nr_pages.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn device_base(&self) -> Option<PAddr> {
        self.device_base
    }

    pub fn read_folio_hook(&self) -> Option<&'static dyn ReadFolio> {
        self.read_folio_hook
    }

    pub fn swap_backing(&self) -> Option<&'static dyn SwapBacking> {
        self.swap_backing
    }

    /// Record that `vma_ref` now maps this object, for a later
    /// `try_to_unmap_folio` rmap walk.
    pub fn register_vma(&self, vma_ref: VmaRef) {
        self.locked.write().vmas.push(vma_ref);
    }

    /// Undo [`Self::register_vma`] once a VMA is unmapped or torn down.
    pub fn unregister_vma(&self, mm: MmHandle, range: VRange) {
        self.locked.write().vmas.retain(|v| !(v.mm == mm && v.range == range));
    }
}

impl Drop for VmObject {
    /// Undo the `children_count` bump [`Self::new_shadow`] made on `backing`,
    /// so a chain with no other children left is eligible for a collapse
    /// step once this drop runs.
    fn drop(&mut self) {
        if let Some(backing) = self.locked.get_mut().backing.take() {
            backing.children_count.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eonix_mm::address::VAddr;

    #[test]
    fn new_object_starts_with_no_children_and_no_flags() {
        let obj = VmObject::new(VmObjectKind::Anonymous, 0x4000, 0);
        assert_eq!(obj.kind, VmObjectKind::Anonymous);
        assert_eq!(obj.size(), 0x4000);
        assert_eq!(obj.children_count(), 0);
        assert_eq!(obj.flags(), VmObjectFlags::empty());
    }

    #[test]
    fn shadow_bumps_backing_children_count_and_depth() {
        let backing = VmObject::new(VmObjectKind::Anonymous, 0x4000, 0);
        let shadow = VmObject::new_shadow(backing.clone(), 1, 0x4000);

        assert_eq!(backing.children_count(), 1);
        assert_eq!(shadow.kind, VmObjectKind::Shadow);
        assert!(shadow.flags().contains(VmObjectFlags::SHADOW));
        assert_eq!(shadow.locked().read().shadow_depth, 1);

        let grandchild = VmObject::new_shadow(shadow.clone(), 0, 0x4000);
        assert_eq!(grandchild.locked().read().shadow_depth, 2);
        assert_eq!(shadow.children_count(), 1);
    }

    #[test]
    fn set_flag_toggles_independently_of_others() {
        let obj = VmObject::new(VmObjectKind::Anonymous, 0x1000, 0);
        obj.set_flag(VmObjectFlags::COLLAPSING, true);
        assert!(obj.flags().contains(VmObjectFlags::COLLAPSING));
        assert!(!obj.flags().contains(VmObjectFlags::DEAD));

        obj.set_flag(VmObjectFlags::DEAD, true);
        obj.set_flag(VmObjectFlags::COLLAPSING, false);
        assert!(!obj.flags().contains(VmObjectFlags::COLLAPSING));
        assert!(obj.flags().contains(VmObjectFlags::DEAD));
    }

    #[test]
    fn page_insert_and_remove_counts_track_stats() {
        let obj = VmObject::new(VmObjectKind::Anonymous, 0x1000, 0);
        obj.note_page_inserted();
        obj.note_page_inserted();
        obj.note_page_removed();
        assert_eq!(obj.stats().nr_pages, 1);
    }

    #[test]
    fn readahead_state_updates_through_the_helper() {
        let obj = VmObject::new(VmObjectKind::Anonymous, 0x1000, 0);
        obj.update_readahead(|ra| {
            ra.start = 4;
            ra.size = 8;
        });
        let ra = obj.readahead();
        assert_eq!(ra.start, 4);
        assert_eq!(ra.size, 8);
    }

    #[test]
    fn device_object_carries_its_base() {
        let base = PAddr::from(0xdead_0000usize);
        let obj = VmObject::new_device(base, 0x1000, 0);
        assert_eq!(obj.kind, VmObjectKind::Device);
        assert_eq!(obj.device_base(), Some(base));
        assert!(obj.read_folio_hook().is_none());
    }

    struct NullReadFolio;
    impl ReadFolio for NullReadFolio {
        fn read_folio(&self, _pgoff: usize, _dst: &BuddyFolio) -> crate::error::MmResult<()> {
            Ok(())
        }
    }

    #[test]
    fn vnode_object_carries_its_read_folio_hook() {
        static HOOK: NullReadFolio = NullReadFolio;
        let obj = VmObject::new_vnode(&HOOK, 0x1000, 0);
        assert_eq!(obj.kind, VmObjectKind::Vnode);
        assert!(obj.read_folio_hook().is_some());
        assert!(obj.device_base().is_none());
    }

    #[test]
    fn vma_registration_is_visible_to_rmap_and_reversible() {
        let obj = VmObject::new(VmObjectKind::Anonymous, 0x1000, 0);
        let mm = MmHandle::new(eonix_mm::paging::PFN::from(0usize));
        let range = VRange::new(VAddr::from(0x1000usize), VAddr::from(0x2000usize));
        let vma_ref = VmaRef { mm, range, pgoff: 0 };

        obj.register_vma(vma_ref);
        assert_eq!(obj.locked().read().vmas.len(), 1);

        obj.unregister_vma(mm, range);
        assert!(obj.locked().read().vmas.is_empty());
    }
}
