//! The fault path: `fault()` and its per-kind handlers, shadow-chain COW
//! and collapse, rmap teardown, readahead, and the userfaultfd
//! interception point. Built directly on `vm_object`'s page tree and the
//! `collaborators` boundary's `map_page`/`tlb_shootdown`, the way the
//! donor's `mm_area.rs` sits on top of `folio.rs` and its own page table
//! walker.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use buddy_allocator::{BuddyFolio, MigrateType};
use eonix_mm::address::{AddrOps as _, VAddr};
use eonix_mm::paging::{Folio as _, PAGE_SIZE};
use eonix_sync::{LazyLock, Spin, WaitList};

use crate::collaborators::{self, PageProt};
use crate::error::MmError;
use crate::vma::{Vma, VmaFlags};
use crate::vm_object::{PageTreeEntry, VmObject, VmObjectFlags, VmObjectKind};

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct FaultFlags: u32 {
        const WRITE       = 1 << 0;
        const SPECULATIVE = 1 << 1;
        const INSTRUCTION = 1 << 2;
    }
}

/// In/out parameters for one fault, per spec's `vmf`.
pub struct VmFault {
    pub address: VAddr,
    pub pgoff: usize,
    pub flags: FaultFlags,
    pub folio: Option<BuddyFolio>,
    pub prot: PageProt,
}

impl VmFault {
    pub fn new(address: VAddr, pgoff: usize, flags: FaultFlags) -> Self {
        Self {
            address,
            pgoff,
            flags,
            folio: None,
            prot: PageProt::empty(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultResult {
    /// PTE installed directly; the caller has nothing left to do.
    Completed,
    /// Folio resolved; the caller installs the PTE itself with `vmf.prot`.
    Ok,
    /// Drop every lock held and restart the fault from the top.
    Retry,
    SigBus,
    SigSegv,
    Oom,
}

/// The single, global, read-only zero-filled page every Anonymous
/// read-fault is satisfied from until the first write. Allocated once,
/// lazily, on first use; marked `RESERVED` so it is never mistaken for
/// ordinary freeable memory.
static ZERO_FOLIO: LazyLock<BuddyFolio> = LazyLock::new(|| {
    let folio = buddy_allocator::alloc_pages_on(0, 0, MigrateType::Unmovable)
        .expect("no memory left to allocate the global zero page");
    zero_folio(&folio);
    folio
        .as_raw()
        .descriptor()
        .flags()
        .set(buddy_allocator::PageFlags::RESERVED);
    folio
});

fn zero_folio(folio: &BuddyFolio) {
    let ptr = unsafe { collaborators::page_access().get_ptr_for_pfn(folio.pfn()) };
    unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, PAGE_SIZE << folio.order()) };
}

fn is_zero_folio(folio: &BuddyFolio) -> bool {
    folio.pfn() == ZERO_FOLIO.pfn()
}

fn alloc_zeroed_folio(node: u8) -> Option<BuddyFolio> {
    let folio = buddy_allocator::alloc_pages_on(node, 0, MigrateType::Movable)?;
    zero_folio(&folio);
    Some(folio)
}

/// Point of entry for every page fault. Dispatches on the backing
/// object's kind; every handler either installs `vmf.folio`/`vmf.prot` or
/// returns a terminal `FaultResult` directly.
pub fn fault(vma: &Vma, vmf: &mut VmFault) -> FaultResult {
    match vma.object.kind {
        VmObjectKind::Anonymous => anon_fault(&vma.object, vma, vmf),
        VmObjectKind::Vnode => vnode_fault(&vma.object, vma, vmf),
        VmObjectKind::Device => device_fault(&vma.object, vma, vmf),
        VmObjectKind::Shadow => shadow_fault(&vma.object, vma, vmf),
    }
}

fn fault_prot(vma: &Vma, vmf: &VmFault, writable: bool) -> PageProt {
    let mut prot = PageProt::USER;
    if vma.flags.contains(VmaFlags::EXEC) {
        prot |= PageProt::EXECUTE;
    }
    if writable && vmf.flags.contains(FaultFlags::WRITE) {
        prot |= PageProt::WRITE;
    } else if vma.flags.contains(VmaFlags::WRITE) {
        prot |= PageProt::COPY_ON_WRITE;
    }
    prot
}

/// `true` if this fault should be handed off to userspace instead of
/// resolved here: enqueue the event, wake the uffd reader, and tell the
/// caller to retry once userspace has resumed it. This core has no
/// scheduler of its own to block the faulting thread on
/// `ctx.resolve_queue()`; that part is the embedding kernel's job.
fn maybe_intercept_uffd(vma: &Vma, vmf: &VmFault, missing: bool) -> Option<FaultResult> {
    let ctx = vma.uffd.as_ref()?;
    let write = vmf.flags.contains(FaultFlags::WRITE);
    let intercept =
        (missing && vma.flags.contains(VmaFlags::UFFD_MISSING)) || (write && vma.flags.contains(VmaFlags::UFFD_WP));
    if !intercept {
        return None;
    }
    ctx.enqueue_pagefault(vmf.address, write);
    Some(FaultResult::Retry)
}

fn anon_fault(obj: &Arc<VmObject>, vma: &Vma, vmf: &mut VmFault) -> FaultResult {
    if vmf.pgoff * PAGE_SIZE >= obj.size() {
        return FaultResult::SigBus;
    }

    if vmf.flags.contains(FaultFlags::SPECULATIVE) {
        let Some(locked) = obj.locked().try_read() else {
            return FaultResult::Retry;
        };
        return match locked.page_tree.get(&vmf.pgoff) {
            Some(PageTreeEntry::Folio(folio)) if !is_zero_folio(folio) => {
                vmf.folio = Some(folio.clone());
                vmf.prot = fault_prot(vma, vmf, true);
                FaultResult::Ok
            }
            _ => FaultResult::Retry,
        };
    }

    let missing = { !obj.locked().read().page_tree.contains_key(&vmf.pgoff) };
    if let Some(result) = maybe_intercept_uffd(vma, vmf, missing) {
        return result;
    }

    {
        let locked = obj.locked().read();
        match locked.page_tree.get(&vmf.pgoff) {
            Some(PageTreeEntry::Folio(folio)) => {
                if !(is_zero_folio(folio) && vmf.flags.contains(FaultFlags::WRITE)) {
                    vmf.folio = Some(folio.clone());
                    vmf.prot = fault_prot(vma, vmf, true);
                    return FaultResult::Ok;
                }
            }
            Some(PageTreeEntry::WorkingSetShadow(_)) | None => {}
            Some(PageTreeEntry::Compressed(_)) | Some(PageTreeEntry::Swap(_)) => {}
        }
    }

    // Everything past this point needs the write lock: populate on
    // Missing/Compressed/Swap/Shadow, or promote the zero page to a real
    // private copy on a write fault.
    let mut locked = obj.locked().write();
    match locked.page_tree.get(&vmf.pgoff).cloned() {
        Some(PageTreeEntry::Folio(folio)) if !(is_zero_folio(&folio) && vmf.flags.contains(FaultFlags::WRITE)) => {
            vmf.folio = Some(folio.clone());
            vmf.prot = fault_prot(vma, vmf, true);
            FaultResult::Ok
        }
        Some(PageTreeEntry::Compressed(handle)) => {
            let Some(new_folio) = alloc_zeroed_folio(vma.preferred_node) else {
                return FaultResult::Oom;
            };
            let Some(backing) = obj.swap_backing() else {
                return FaultResult::SigBus;
            };
            if backing.decompress(handle, &new_folio).is_err() {
                return FaultResult::SigBus;
            }
            backing.free_slot(handle);
            locked.page_tree.insert(vmf.pgoff, PageTreeEntry::Folio(new_folio.clone()));
            obj.note_page_inserted();
            vmf.folio = Some(new_folio);
            vmf.prot = fault_prot(vma, vmf, true);
            FaultResult::Ok
        }
        Some(PageTreeEntry::Swap(handle)) => {
            let Some(new_folio) = alloc_zeroed_folio(vma.preferred_node) else {
                return FaultResult::Oom;
            };
            let Some(backing) = obj.swap_backing() else {
                return FaultResult::SigBus;
            };
            if backing.swap_in(handle, &new_folio).is_err() {
                return FaultResult::SigBus;
            }
            backing.free_slot(handle);
            locked.page_tree.insert(vmf.pgoff, PageTreeEntry::Folio(new_folio.clone()));
            obj.note_page_inserted();
            vmf.folio = Some(new_folio);
            vmf.prot = fault_prot(vma, vmf, true);
            FaultResult::Ok
        }
        // A workingset-shadow entry (or a page the tree has never heard of)
        // is treated identically: it's a miss, just one that may feed
        // refault accounting the readahead module owns.
        Some(PageTreeEntry::WorkingSetShadow(_)) | None => {
            if !vmf.flags.contains(FaultFlags::WRITE) {
                vmf.folio = Some(ZERO_FOLIO.clone());
                vmf.prot = fault_prot(vma, vmf, false);
                return FaultResult::Ok;
            }

            let order = hugepage_order_for(vma, vmf.address, vmf.pgoff);
            let Some(new_folio) = buddy_allocator::alloc_pages_on(vma.preferred_node, order, MigrateType::Movable)
            else {
                return FaultResult::Oom;
            };
            zero_folio(&new_folio);
            locked.page_tree.insert(vmf.pgoff, PageTreeEntry::Folio(new_folio.clone()));
            drop(locked);
            obj.note_page_inserted();
            vmf.folio = Some(new_folio);
            vmf.prot = fault_prot(vma, vmf, true);
            FaultResult::Ok
        }
        Some(PageTreeEntry::Folio(_zero_page)) => {
            // Zero-page write fault: promote to a private copy.
            let Some(new_folio) = alloc_zeroed_folio(vma.preferred_node) else {
                return FaultResult::Oom;
            };
            locked.page_tree.insert(vmf.pgoff, PageTreeEntry::Folio(new_folio.clone()));
            vmf.folio = Some(new_folio);
            vmf.prot = fault_prot(vma, vmf, true);
            FaultResult::Ok
        }
    }
}

/// 2-MiB opportunism: only when the fault is write, the VMA permits huge
/// pages, and the address falls on a 2-MiB-aligned, 2-MiB-sized boundary
/// of the object.
fn hugepage_order_for(vma: &Vma, address: VAddr, pgoff: usize) -> u32 {
    const HUGE_ORDER: u32 = 9; // 2^9 * 4 KiB = 2 MiB
    const HUGE_PAGES: usize = 1 << HUGE_ORDER;
    if vma.flags.contains(VmaFlags::NO_HUGEPAGE) {
        return 0;
    }
    let huge_size = PAGE_SIZE << HUGE_ORDER;
    if !address.is_aligned_to(huge_size) || pgoff % HUGE_PAGES != 0 {
        return 0;
    }
    HUGE_ORDER
}

fn vnode_fault(obj: &Arc<VmObject>, vma: &Vma, vmf: &mut VmFault) -> FaultResult {
    if vmf.pgoff * PAGE_SIZE >= obj.size() {
        return FaultResult::SigBus;
    }

    run_readahead(obj, vmf.pgoff);

    let missing = { !obj.locked().read().page_tree.contains_key(&vmf.pgoff) };
    if let Some(result) = maybe_intercept_uffd(vma, vmf, missing) {
        return result;
    }

    {
        let locked = obj.locked().read();
        if let Some(PageTreeEntry::Folio(folio)) = locked.page_tree.get(&vmf.pgoff) {
            vmf.folio = Some(folio.clone());
            vmf.prot = fault_prot(vma, vmf, vma.flags.contains(VmaFlags::SHARED));
            return FaultResult::Ok;
        }
    }

    let Some(read_folio) = obj.read_folio_hook() else {
        return FaultResult::SigBus;
    };
    let Some(new_folio) = buddy_allocator::alloc_pages_on(vma.preferred_node, 0, MigrateType::Movable) else {
        return FaultResult::Oom;
    };
    if read_folio.read_folio(vmf.pgoff, &new_folio).is_err() {
        return FaultResult::SigBus;
    }

    let mut locked = obj.locked().write();
    let installed = locked
        .page_tree
        .entry(vmf.pgoff)
        .or_insert_with(|| PageTreeEntry::Folio(new_folio.clone()))
        .clone();
    drop(locked);
    obj.note_page_inserted();

    let (folio, writable) = match installed {
        PageTreeEntry::Folio(folio) => (folio, vma.flags.contains(VmaFlags::SHARED)),
        _ => (new_folio, false),
    };
    vmf.folio = Some(folio);
    vmf.prot = fault_prot(vma, vmf, writable);
    FaultResult::Ok
}

fn device_fault(obj: &Arc<VmObject>, vma: &Vma, vmf: &mut VmFault) -> FaultResult {
    let Some(base) = obj.device_base() else {
        return FaultResult::SigBus;
    };
    let phys = base + vmf.pgoff * PAGE_SIZE;
    let prot = fault_prot(vma, vmf, vma.flags.contains(VmaFlags::WRITE));
    match collaborators::get().map_page(&vma_mm_handle(vma), vmf.address, phys, prot) {
        Ok(()) => FaultResult::Completed,
        Err(MmError::OutOfMemory) => FaultResult::Oom,
        Err(_) => FaultResult::SigBus,
    }
}

/// `Vma` doesn't keep its own `MmHandle` (the address space it belongs to
/// owns that); callers that need one for a device mapping or rmap walk
/// pull it from the VMA's own rmap registration, which always exists
/// once the VMA is inserted into its address space.
fn vma_mm_handle(vma: &Vma) -> crate::collaborators::MmHandle {
    vma.object
        .locked()
        .read()
        .vmas
        .iter()
        .find(|v| v.range == vma.range())
        .map(|v| v.mm)
        .expect("a mapped VMA is always registered in its object's rmap list")
}

fn shadow_fault(obj: &Arc<VmObject>, vma: &Vma, vmf: &mut VmFault) -> FaultResult {
    if vmf.pgoff * PAGE_SIZE >= obj.size() {
        return FaultResult::SigBus;
    }

    if vmf.flags.contains(FaultFlags::WRITE) {
        return shadow_write_fault(obj, vma, vmf);
    }

    // Read fault: walk child -> backing -> backing... until a folio turns
    // up or a terminal (non-shadow) object resolves it.
    let mut current = obj.clone();
    let mut offset = vmf.pgoff;
    loop {
        let hit = {
            let locked = current.locked().read();
            locked.page_tree.get(&offset).cloned()
        };
        if let Some(PageTreeEntry::Folio(folio)) = hit {
            vmf.folio = Some(folio);
            vmf.prot = fault_prot(vma, vmf, false);
            return FaultResult::Ok;
        }

        let (backing, shadow_offset, kind) = {
            let locked = current.locked().read();
            (locked.backing.clone(), locked.shadow_offset, current.kind)
        };
        let Some(backing) = backing else {
            // Bottom of the chain with no backing: this is itself the
            // terminal object (Anonymous/Vnode/Device), so defer to its
            // own fault handler for this offset.
            let mut sub_vmf = VmFault::new(vmf.address, offset, vmf.flags);
            let result = match kind {
                VmObjectKind::Anonymous => anon_fault(&current, vma, &mut sub_vmf),
                VmObjectKind::Vnode => vnode_fault(&current, vma, &mut sub_vmf),
                VmObjectKind::Device => device_fault(&current, vma, &mut sub_vmf),
                VmObjectKind::Shadow => unreachable!("shadow with no backing"),
            };
            vmf.folio = sub_vmf.folio;
            vmf.prot = sub_vmf.prot;
            return result;
        };
        offset += shadow_offset;
        current = backing;
    }
}

fn shadow_write_fault(obj: &Arc<VmObject>, vma: &Vma, vmf: &mut VmFault) -> FaultResult {
    {
        let locked = obj.locked().read();
        if let Some(PageTreeEntry::Folio(folio)) = locked.page_tree.get(&vmf.pgoff) {
            vmf.folio = Some(folio.clone());
            vmf.prot = fault_prot(vma, vmf, true);
            return FaultResult::Ok;
        }
    }

    let (backing_strong_count, shadow_offset, backing) = {
        let locked = obj.locked().read();
        (
            locked.backing.as_ref().map(Arc::strong_count),
            locked.shadow_offset,
            locked.backing.clone(),
        )
    };
    let Some(backing) = backing else {
        return FaultResult::SigSegv;
    };
    let backing_offset = vmf.pgoff + shadow_offset;

    // `backing_strong_count` was read before the clone above, so it counts
    // only the owners that existed independently of this fault: the
    // object's own `backing` field plus anything else actually pointing at
    // it. A `Some(1)` here means this shadow is the sole path to it.
    let uniquely_owned = backing.children_count() == 1 && backing_strong_count == Some(1);
    if uniquely_owned && backing.kind == VmObjectKind::Anonymous {
        let stolen = {
            let mut backing_locked = backing.locked().write();
            backing_locked.page_tree.remove(&backing_offset)
        };
        if let Some(PageTreeEntry::Folio(folio)) = stolen {
            backing.note_page_removed();
            obj.locked().write().page_tree.insert(vmf.pgoff, PageTreeEntry::Folio(folio.clone()));
            obj.note_page_inserted();
            vmf.folio = Some(folio);
            vmf.prot = fault_prot(vma, vmf, true);
            return FaultResult::Ok;
        }
    }

    // Copy-on-write: the ancestor page (if any) is read, a fresh folio is
    // populated with its contents (or zeroed, if the ancestor has none
    // either), and inserted into this shadow.
    let mut sub_vmf = VmFault::new(vmf.address, backing_offset, FaultFlags::empty());
    let ancestor_result = shadow_read_from(&backing, vma, &mut sub_vmf);

    let Some(new_folio) = buddy_allocator::alloc_pages_on(vma.preferred_node, 0, MigrateType::Movable) else {
        return FaultResult::Oom;
    };
    match ancestor_result {
        FaultResult::Ok if sub_vmf.folio.is_some() => {
            copy_folio(sub_vmf.folio.as_ref().unwrap(), &new_folio);
        }
        _ => zero_folio(&new_folio),
    }

    obj.locked().write().page_tree.insert(vmf.pgoff, PageTreeEntry::Folio(new_folio.clone()));
    obj.note_page_inserted();
    vmf.folio = Some(new_folio);
    vmf.prot = fault_prot(vma, vmf, true);
    FaultResult::Ok
}

/// Read-only lookup used while resolving a shadow write fault's ancestor
/// page: never writes, never recurses into another shadow's own
/// write-fault path.
fn shadow_read_from(obj: &Arc<VmObject>, vma: &Vma, vmf: &mut VmFault) -> FaultResult {
    match obj.kind {
        VmObjectKind::Shadow => shadow_fault(obj, vma, vmf),
        VmObjectKind::Anonymous => anon_fault(obj, vma, vmf),
        VmObjectKind::Vnode => vnode_fault(obj, vma, vmf),
        VmObjectKind::Device => device_fault(obj, vma, vmf),
    }
}

fn copy_folio(src: &BuddyFolio, dst: &BuddyFolio) {
    let src_ptr = unsafe { collaborators::page_access().get_ptr_for_pfn(src.pfn()) };
    let dst_ptr = unsafe { collaborators::page_access().get_ptr_for_pfn(dst.pfn()) };
    unsafe { core::ptr::copy_nonoverlapping(src_ptr.as_ptr(), dst_ptr.as_ptr(), PAGE_SIZE) };
}

/// Attempt to collapse a shadow object per spec's two cases: merge an
/// immediate backing that has exactly one child and one reference
/// ("collapse step"), or drop a shadow with no pages of its own in favor
/// of its backing ("bypass"). Returns the (possibly unchanged) object the
/// caller should keep pointing at.
pub fn collapse(shadow: Arc<VmObject>) -> Arc<VmObject> {
    if let Some(bypassed) = try_bypass(&shadow) {
        return bypassed;
    }
    try_collapse_step(&shadow);
    shadow
}

/// The asynchronous form: hand `shadow` off to the single collapse
/// worker instead of running `collapse` on the caller's own stack.
/// `shadow`'s reference is held by the queued work item and released
/// once `collapse` returns, so the caller doesn't need to keep it alive
/// itself. Callers that cannot afford to run `collapse`'s locking inline
/// (a refcount dropping to one from inside another lock's release path)
/// use this instead of calling `collapse` directly.
pub fn schedule_collapse(shadow: Arc<VmObject>) {
    crate::workqueue::enqueue(move || {
        collapse(shadow);
    });
}

fn try_bypass(shadow: &Arc<VmObject>) -> Option<Arc<VmObject>> {
    if shadow.kind != VmObjectKind::Shadow {
        return None;
    }
    let (backing, is_empty) = {
        let locked = shadow.locked().read();
        (locked.backing.clone(), locked.page_tree.is_empty())
    };
    let backing = backing?;
    if !is_empty {
        return None;
    }
    // The caller (the VMA layer, which owns every `AddressSpace`) is
    // responsible for repointing each of `shadow`'s rmap entries at
    // `backing` with `vm_pgoff` adjusted by `shadow_offset`; this module
    // only ever sees a `VmaRef`, not the address space itself.
    Some(backing)
}

fn try_collapse_step(child: &Arc<VmObject>) {
    let (backing_strong_count, backing) = {
        let locked = child.locked().read();
        (locked.backing.as_ref().map(Arc::strong_count), locked.backing.clone())
    };
    let Some(backing) = backing else { return };
    if backing.kind != VmObjectKind::Anonymous {
        return;
    }
    if backing.children_count() != 1 || backing_strong_count != Some(1) {
        return;
    }

    backing.set_flag(VmObjectFlags::COLLAPSING, true);

    let shadow_offset = child.locked().read().shadow_offset;
    let mut backing_locked = backing.locked().write();
    let mut child_locked = child.locked().write();

    let entries: Vec<(usize, PageTreeEntry)> = backing_locked.page_tree.iter().map(|(k, v)| (*k, v.clone())).collect();
    for (pgoff, entry) in entries {
        let child_pgoff = pgoff.saturating_sub(shadow_offset);
        if child_locked.page_tree.contains_key(&child_pgoff) {
            // Child already shadows this page: drop the backing's copy.
            backing_locked.page_tree.remove(&pgoff);
        } else if let PageTreeEntry::Folio(_) = entry {
            backing_locked.page_tree.remove(&pgoff);
            child_locked.page_tree.insert(child_pgoff, entry);
        }
    }

    let grandparent = backing_locked.backing.take();
    let grandparent_offset = backing_locked.shadow_offset;
    child_locked.backing = grandparent;
    child_locked.shadow_offset = shadow_offset + grandparent_offset;
    child_locked.shadow_depth = backing_locked.shadow_depth;

    drop(child_locked);
    drop(backing_locked);
    backing.set_flag(VmObjectFlags::COLLAPSING, false);
    backing.set_flag(VmObjectFlags::DEAD, true);
}

/// Tear down every mapping of `pgoff` across every VMA currently rmap'd
/// to `obj` (file-backed objects use one shared list; anonymous pages use
/// the same list here, keyed by VMA rather than a separate anon_vma
/// chain, since this core's `VmaRef` already plays that role).
pub fn try_to_unmap_folio(obj: &VmObject, pgoff: usize) {
    let vmas = obj.locked().read().vmas.clone();
    for vma_ref in vmas {
        if pgoff < vma_ref.pgoff {
            continue;
        }
        let page_index = pgoff - vma_ref.pgoff;
        let addr = vma_ref.range.start() + page_index * PAGE_SIZE;
        if addr >= vma_ref.range.end() {
            continue;
        }
        let _ = collaborators::get().unmap_page(&vma_ref.mm, addr);
        collaborators::get().tlb_shootdown(&vma_ref.mm, eonix_mm::address::VRange::new(addr, addr + PAGE_SIZE));
    }
}

const MAX_RA_PAGES: usize = 32;
const INITIAL_RA_SIZE: usize = 4;
const THRASH_RESET_THRESHOLD: u32 = 2;

/// Adaptive readahead ramp: a sequential hit doubles the window (capped
/// at `max_ra_pages`); anything else resets it to the initial size. Does
/// not itself perform any I/O; callers needing the actual pages issued
/// still go through `read_folio` per page, this only maintains the
/// bookkeeping that decides how many pages to ask for.
fn run_readahead(obj: &Arc<VmObject>, pgoff: usize) {
    obj.update_readahead(|ra| {
        if ra.size == 0 {
            ra.start = pgoff;
            ra.size = INITIAL_RA_SIZE;
            ra.async_size = INITIAL_RA_SIZE / 2;
            ra.max_ra_pages = MAX_RA_PAGES;
            return;
        }

        if pgoff == ra.start + 1 {
            ra.start = pgoff;
            ra.size = (ra.size * 2).min(ra.max_ra_pages);
            ra.async_size = ra.size / 2;
            ra.thrash_count = 0;
        } else {
            ra.thrash_count += 1;
            ra.start = pgoff;
            if ra.thrash_count >= THRASH_RESET_THRESHOLD {
                ra.size = INITIAL_RA_SIZE;
                ra.async_size = INITIAL_RA_SIZE / 2;
                ra.thrash_count = 0;
            }
        }
    });
}

/// One pending fault a userfaultfd-registered VMA handed off to
/// userspace, carried to whoever is polling the ctx's read side.
#[derive(Clone, Copy, Debug)]
pub struct PagefaultEvent {
    pub address: VAddr,
    pub write: bool,
}

/// Per-registration userfaultfd state: the pending-event queue userspace
/// reads from, plus the wait-queues for "something to read" and "a
/// faulting thread is parked waiting for `copy`/`zeropage`/`wake`". This
/// core has no scheduler to actually block a thread on the latter; it
/// only maintains the queue and the wake signal, and returns `Retry` from
/// the fault path so the embedding kernel's own blocking primitive can do
/// the rest.
pub struct UserfaultfdCtx {
    events: Spin<VecDeque<PagefaultEvent>>,
    read_queue: WaitList,
    resolve_queue: WaitList,
}

impl UserfaultfdCtx {
    pub fn new() -> Self {
        Self {
            events: Spin::new(VecDeque::new()),
            read_queue: WaitList::new(),
            resolve_queue: WaitList::new(),
        }
    }

    pub fn enqueue_pagefault(&self, address: VAddr, write: bool) {
        self.events.lock().push_back(PagefaultEvent { address, write });
        self.read_queue.notify_all();
    }

    pub fn pop_event(&self) -> Option<PagefaultEvent> {
        self.events.lock().pop_front()
    }

    pub fn read_queue(&self) -> &WaitList {
        &self.read_queue
    }

    /// Userspace has issued `copy`/`zeropage`/`wake`; let every thread
    /// parked on this context's fault resume.
    pub fn wake_resolved(&self) {
        self.resolve_queue.notify_all();
    }

    pub fn resolve_queue(&self) -> &WaitList {
        &self.resolve_queue
    }
}

impl Default for UserfaultfdCtx {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm_object::{VmObject, VmObjectKind};
    use eonix_mm::address::VRange;

    fn anon_object(size: usize) -> Arc<VmObject> {
        VmObject::new(VmObjectKind::Anonymous, size, 0)
    }

    fn vma(flags: VmaFlags, object: Arc<VmObject>) -> Vma {
        let range = VRange::new(VAddr::from(0x1000usize), VAddr::from(0x2000usize));
        Vma::new(range, flags, object, 0, 0)
    }

    #[test]
    fn hugepage_order_is_zero_off_alignment() {
        let v = vma(VmaFlags::READ | VmaFlags::WRITE, anon_object(0x10000));
        assert_eq!(hugepage_order_for(&v, VAddr::from(0x1000usize), 1), 0);
    }

    #[test]
    fn hugepage_order_is_zero_when_no_hugepage_is_set() {
        let v = vma(VmaFlags::WRITE | VmaFlags::NO_HUGEPAGE, anon_object(0x10000));
        assert_eq!(hugepage_order_for(&v, VAddr::from(0), 0), 0);
    }

    #[test]
    fn try_bypass_refuses_a_shadow_with_pages_of_its_own() {
        let backing = anon_object(0x10000);
        let shadow = VmObject::new_shadow(backing.clone(), 0, 0x10000);
        shadow
            .locked()
            .write()
            .page_tree
            .insert(0, PageTreeEntry::WorkingSetShadow(1));

        assert!(try_bypass(&shadow).is_none());
    }

    #[test]
    fn try_bypass_refuses_a_non_shadow_object() {
        let obj = anon_object(0x1000);
        assert!(try_bypass(&obj).is_none());
    }

    #[test]
    fn try_bypass_hands_back_the_backing_object_once_empty() {
        let backing = anon_object(0x10000);
        let shadow = VmObject::new_shadow(backing.clone(), 0, 0x10000);

        let bypassed = try_bypass(&shadow).expect("empty shadow should bypass");
        assert!(Arc::ptr_eq(&bypassed, &backing));
    }

    #[test]
    fn schedule_collapse_runs_on_the_workqueue_worker() {
        while crate::workqueue::run_worker() > 0 {}

        let backing = anon_object(0x10000);
        let shadow = VmObject::new_shadow(backing.clone(), 0, 0x10000);
        shadow
            .locked()
            .write()
            .page_tree
            .insert(0, PageTreeEntry::WorkingSetShadow(1));
        drop(backing);

        schedule_collapse(shadow.clone());
        assert_eq!(crate::workqueue::run_worker(), 1);
        assert!(shadow.locked().read().backing.is_none());
    }

    #[test]
    fn readahead_ramps_up_on_sequential_access_and_resets_on_a_miss() {
        let obj = anon_object(0x100000);
        run_readahead(&obj, 10);
        let first = obj.readahead();
        assert_eq!(first.size, INITIAL_RA_SIZE);

        run_readahead(&obj, 11);
        let second = obj.readahead();
        assert_eq!(second.size, INITIAL_RA_SIZE * 2);

        // A jump away from the sequential run should eventually reset the
        // window once the thrash threshold is crossed.
        run_readahead(&obj, 400);
        run_readahead(&obj, 900);
        let after_thrash = obj.readahead();
        assert_eq!(after_thrash.size, INITIAL_RA_SIZE);
    }

    #[test]
    fn readahead_caps_at_max_ra_pages() {
        let obj = anon_object(0x1000000);
        run_readahead(&obj, 0);
        for pgoff in 1..16 {
            run_readahead(&obj, pgoff);
        }
        assert!(obj.readahead().size <= MAX_RA_PAGES);
    }

    #[test]
    fn uffd_ctx_queues_events_in_order() {
        let ctx = UserfaultfdCtx::new();
        ctx.enqueue_pagefault(VAddr::from(0x1000usize), false);
        ctx.enqueue_pagefault(VAddr::from(0x2000usize), true);

        let first = ctx.pop_event().unwrap();
        assert_eq!(first.address, VAddr::from(0x1000usize));
        assert!(!first.write);

        let second = ctx.pop_event().unwrap();
        assert_eq!(second.address, VAddr::from(0x2000usize));
        assert!(second.write);

        assert!(ctx.pop_event().is_none());
    }

    #[test]
    fn maybe_intercept_uffd_is_a_noop_without_a_registered_context() {
        let v = vma(VmaFlags::READ | VmaFlags::UFFD_MISSING, anon_object(0x1000));
        let vmf = VmFault::new(VAddr::from(0x1000usize), 0, FaultFlags::empty());
        assert!(maybe_intercept_uffd(&v, &vmf, true).is_none());
    }

    #[test]
    fn maybe_intercept_uffd_retries_a_missing_fault_once_registered() {
        let mut v = vma(VmaFlags::READ | VmaFlags::UFFD_MISSING, anon_object(0x1000));
        v.uffd = Some(Arc::new(UserfaultfdCtx::new()));
        let vmf = VmFault::new(VAddr::from(0x1000usize), 0, FaultFlags::empty());

        let result = maybe_intercept_uffd(&v, &vmf, true);
        assert_eq!(result, Some(FaultResult::Retry));
        assert!(v.uffd.as_ref().unwrap().pop_event().is_some());
    }

    #[test]
    fn maybe_intercept_uffd_ignores_a_present_page_without_write_protect() {
        let mut v = vma(VmaFlags::READ | VmaFlags::UFFD_MISSING, anon_object(0x1000));
        v.uffd = Some(Arc::new(UserfaultfdCtx::new()));
        let vmf = VmFault::new(VAddr::from(0x1000usize), 0, FaultFlags::empty());

        assert!(maybe_intercept_uffd(&v, &vmf, false).is_none());
    }

    #[test]
    fn fault_flags_combine_independently() {
        let flags = FaultFlags::WRITE | FaultFlags::SPECULATIVE;
        assert!(flags.contains(FaultFlags::WRITE));
        assert!(flags.contains(FaultFlags::SPECULATIVE));
        assert!(!flags.contains(FaultFlags::INSTRUCTION));
    }
}
