//! vmalloc: non-physically-contiguous virtual allocations carved out of a
//! fixed virtual range the embedding kernel reserves for this core
//! (`[VMALLOC_BASE, VMALLOC_END)`), handed back as already page-table-
//! mapped VAs rather than a slot in the caller's own address space.
//!
//! The VA range is statically partitioned into one contiguous slice per
//! `buddy_allocator::MAX_NODES`, so "search across all nodes' RB-trees"
//! becomes "try the preferred node's own slice, then fall back to the
//! next-closest node's" instead of needing distributed coordination over
//! one shared tree. Each slice gets the same `BTreeMap`-keyed-area plus
//! `BTreeMap`-keyed-gap-index representation `vma.rs` uses for the VMA
//! map, for the same reason recorded in `DESIGN.md`: a gap lookup is then
//! a single ordered range query instead of a hand-maintained augmented
//! red-black tree.
//!
//! Per-CPU fast paths (the `vmap_block` partial queue, the small-request
//! PCP bins) follow `buddy_allocator::pcp`'s shape: `eonix_percpu` cells
//! guarded by `eonix_preempt::disable`/`enable` around the bookkeeping,
//! never held across a call into the collaborator.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use buddy_allocator::{nodes_by_distance_from, BuddyFolio, MigrateType, MAX_NODES};
use eonix_mm::address::{AddrOps as _, PAddr, VAddr, VRange};
use eonix_mm::paging::{Folio as _, PAGE_SIZE};
use eonix_sync::Spin;

use crate::collaborators::{self, MmHandle, PageProt};
use crate::error::{MmError, MmResult};
use crate::sync::RwLock;

/// 2 MiB: a `vmap_block`'s reserved span, and also the huge-page
/// threshold for standalone allocations of at least 512 pages aligned
/// to 2 MiB — both fall out of the same order.
pub const VMAP_BLOCK_ORDER: u32 = 9;
pub const VMAP_BLOCK_PAGES: usize = 1 << VMAP_BLOCK_ORDER;
const VMAP_BLOCK_SIZE: usize = VMAP_BLOCK_PAGES * PAGE_SIZE;
const BITMAP_WORDS: usize = VMAP_BLOCK_PAGES / 64;

/// Requests at or under half a block go through a CPU's `vmap_block`
/// queue instead of carving a standalone area out of a node's tree.
const SMALL_ALLOC_CEILING: usize = VMAP_BLOCK_SIZE / 2;

/// PCP bins cache already-reserved, already-unmapped VA ranges of
/// exactly these page counts, so a free/alloc pair of the same size
/// skips the per-node tree entirely.
const PCP_BIN_PAGE_COUNTS: [usize; 4] = [1, 2, 4, 8];
const PCP_BIN_CAP: usize = 8;

/// Node-local lazy purge runs once this many pages have accumulated on
/// the purge list. 32 MiB is an implementer's pick for the threshold
/// policy spec.md leaves open; see `DESIGN.md`.
const LAZY_PURGE_THRESHOLD_PAGES: usize = (32 * 1024 * 1024) / PAGE_SIZE;

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    struct VmapAreaFlags: u32 {
        /// A device/ioremap mapping: unmapped immediately on free, never
        /// subject to lazy purge.
        const STATIC = 1 << 0;
        /// Reserved for a `vmap_block`'s own 2 MiB span; never individually
        /// freed through the standalone path.
        const BLOCK  = 1 << 1;
        /// Unmapped already; waiting on the purge thread for its TLB
        /// shootdown and tree removal.
        const LAZY   = 1 << 2;
    }
}

/// Cache-control variant for an `ioremap` mapping. Encoded into the same
/// `PageProt` the fault path installs PTEs with, since the only thing
/// distinguishing the variants is page-protection bits.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CacheAttr {
    WriteBack,
    Uncached,
    WriteCombining,
    WriteThrough,
}

impl CacheAttr {
    fn prot_bits(self) -> PageProt {
        match self {
            CacheAttr::WriteBack => PageProt::empty(),
            CacheAttr::Uncached => PageProt::CACHE_UC,
            CacheAttr::WriteCombining => PageProt::CACHE_WC,
            CacheAttr::WriteThrough => PageProt::CACHE_WT,
        }
    }
}

/// One reserved virtual range. `va_start` is the key it's stored under in
/// its node's `areas` map; the trailing guard page is implicit (`end()`
/// accounts for it, it's never part of `real_size` or ever mapped).
struct VmapArea {
    real_size: usize,
    flags: VmapAreaFlags,
    /// `None` for `STATIC` (ioremap) areas, whose physical pages are the
    /// caller's, not ours to free.
    folios: Option<Vec<BuddyFolio>>,
}

impl VmapArea {
    fn end(&self, start: VAddr) -> VAddr {
        start + self.real_size + PAGE_SIZE
    }
}

struct VmapNodeLocked {
    areas: BTreeMap<VAddr, VmapArea>,
    /// `(gap_size_in_bytes, gap_start)`, mirroring `vma.rs`'s gap index.
    gaps: BTreeMap<(usize, VAddr), ()>,
    /// Owning block for every `BLOCK`-flagged area in `areas`, keyed by
    /// the same `va_start`. Kept apart from `VmapArea` itself so a block
    /// can be constructed, reserved, and only then recorded in one shot.
    blocks: BTreeMap<VAddr, Arc<VmapBlock>>,
    purge_list: Vec<VAddr>,
    lazy_pages: usize,
}

impl VmapNodeLocked {
    const fn empty() -> Self {
        Self {
            areas: BTreeMap::new(),
            gaps: BTreeMap::new(),
            blocks: BTreeMap::new(),
            purge_list: Vec::new(),
            lazy_pages: 0,
        }
    }
}

static NODES: [Spin<VmapNodeLocked>; MAX_NODES] =
    [const { Spin::new(VmapNodeLocked::empty()) }; MAX_NODES];
/// `(lo, hi)` bounds of each node's slice of `[VMALLOC_BASE, VMALLOC_END)`,
/// filled once by [`init`].
static PARTITIONS: Spin<[(usize, usize); MAX_NODES]> = Spin::new([(0, 0); MAX_NODES]);
static KERNEL_MM: Spin<Option<MmHandle>> = Spin::new(None);

/// Divide `range` into `MAX_NODES` equal contiguous slices and seed each
/// node's gap index with its own slice, so every node's tree only ever
/// has to reason about its own disjoint span — "coordinating to avoid
/// overlap" becomes a non-issue by construction instead of a shared lock
/// every allocation has to take.
pub fn init(range: VRange, kernel_mm: MmHandle) {
    let total = range.end() - range.start();
    let chunk = total / MAX_NODES;

    let mut partitions = PARTITIONS.lock();
    for node in 0..MAX_NODES {
        let lo = range.start() + chunk * node;
        let hi = if node + 1 == MAX_NODES {
            range.end()
        } else {
            lo + chunk
        };
        partitions[node] = (addr_of(lo), addr_of(hi));

        let mut locked = NODES[node].lock();
        locked.gaps.insert((hi - lo, lo), ());
    }

    *KERNEL_MM.lock() = Some(kernel_mm);
}

fn addr_of(va: VAddr) -> usize {
    va - VAddr::NULL
}

fn kernel_mm() -> MmHandle {
    KERNEL_MM.lock().expect("vmalloc::init was never called")
}

fn find_area_node(addr: VAddr) -> Option<u8> {
    let partitions = PARTITIONS.lock();
    (0..MAX_NODES as u8).find(|&node| {
        let (lo, hi) = partitions[node as usize];
        addr >= VAddr::from(lo) && addr < VAddr::from(hi)
    })
}

/// Find and claim the first gap big enough for `real_size` plus one guard
/// page, aligned to 2 MiB once the request is large enough that a huge
/// mapping could actually land on it, else to a single page. Pure w.r.t.
/// its `locked`/`lo`/`hi` arguments so the gap math is unit-testable
/// without the global per-node statics.
fn claim_gap(locked: &mut VmapNodeLocked, lo: VAddr, hi: VAddr, real_size: usize, flags: VmapAreaFlags) -> Option<VAddr> {
    let align = if real_size >= VMAP_BLOCK_SIZE { VMAP_BLOCK_SIZE } else { PAGE_SIZE };
    let needed = real_size + PAGE_SIZE;

    let mut chosen = None;
    for (&(gap_size, gap_start), ()) in locked.gaps.range((needed, VAddr::NULL)..) {
        let aligned = gap_start.ceil_to(align);
        let slack = aligned - gap_start;
        if slack >= gap_size || gap_size - slack < needed {
            continue;
        }
        if aligned < lo || aligned + needed > hi {
            continue;
        }
        chosen = Some((gap_size, gap_start, aligned));
        break;
    }

    let (gap_size, gap_start, aligned) = chosen?;
    locked.gaps.remove(&(gap_size, gap_start));
    let gap_end = gap_start + gap_size;
    if gap_start < aligned {
        locked.gaps.insert((aligned - gap_start, gap_start), ());
    }
    let used_end = aligned + needed;
    if used_end < gap_end {
        locked.gaps.insert((gap_end - used_end, used_end), ());
    }

    locked.areas.insert(
        aligned,
        VmapArea {
            real_size,
            flags,
            folios: None,
        },
    );
    Some(aligned)
}

/// Recompute a node's gap index from scratch against its current areas.
/// O(n); used after removals, same tradeoff `vma.rs::rebuild_gaps` makes.
fn rebuild_gaps(locked: &mut VmapNodeLocked, lo: VAddr, hi: VAddr) {
    locked.gaps.clear();
    let mut cursor = lo;
    for (&start, area) in locked.areas.iter() {
        if start > cursor {
            locked.gaps.insert((start - cursor, cursor), ());
        }
        cursor = area.end(start);
    }
    if cursor < hi {
        locked.gaps.insert((hi - cursor, cursor), ());
    }
}

fn reserve_in_node(node: u8, real_size: usize, flags: VmapAreaFlags) -> Option<VAddr> {
    let (lo, hi) = PARTITIONS.lock()[node as usize];
    let (lo, hi) = (VAddr::from(lo), VAddr::from(hi));
    claim_gap(&mut NODES[node as usize].lock(), lo, hi, real_size, flags)
}

/// Try the preferred node's slice, then each other node's in NUMA-
/// distance order, the same fallback `buddy_allocator::pick_zone` uses.
fn reserve_area(preferred_node: u8, real_size: usize, flags: VmapAreaFlags) -> MmResult<(VAddr, u8)> {
    for candidate in nodes_by_distance_from(preferred_node) {
        if let Some(va) = reserve_in_node(candidate, real_size, flags) {
            return Ok((va, candidate));
        }
    }
    Err(MmError::OutOfMemory)
}

fn release_area(node: u8, va: VAddr) {
    let (lo, hi) = PARTITIONS.lock()[node as usize];
    let mut locked = NODES[node as usize].lock();
    locked.areas.remove(&va);
    rebuild_gaps(&mut locked, VAddr::from(lo), VAddr::from(hi));
}

/// Map `pages` order-0 pages (or order-9 2 MiB huge pages, opportunistically,
/// once at least [`VMAP_BLOCK_PAGES`] remain and the current VA is 2 MiB
/// aligned) starting at `va`, rolling back whatever was already mapped on
/// the first failure. Mirrors the rollback-on-partial-failure shape of a
/// userspace-growth allocator walking page by page and unwinding on OOM.
fn map_pages(va: VAddr, pages: usize, prot: PageProt, node: u8) -> MmResult<Vec<BuddyFolio>> {
    let mm = kernel_mm();
    let mut folios = Vec::new();
    let mut mapped_ranges: Vec<(VAddr, usize)> = Vec::new();
    let mut mapped = 0usize;

    while mapped < pages {
        let remaining = pages - mapped;
        let cursor = va + mapped * PAGE_SIZE;
        let huge_eligible = remaining >= VMAP_BLOCK_PAGES && cursor.is_aligned_to(VMAP_BLOCK_SIZE);
        let order = if huge_eligible { VMAP_BLOCK_ORDER } else { 0 };
        let run = 1usize << order;

        let Some(folio) = buddy_allocator::alloc_pages_on(node, order, MigrateType::Unmovable) else {
            rollback_mapped(&mm, &mapped_ranges);
            return Err(MmError::OutOfMemory);
        };

        let mut ok = true;
        for i in 0..run {
            let virt = cursor + i * PAGE_SIZE;
            let phys = PAddr::from(folio.pfn() + i);
            if collaborators::get().map_page(&mm, virt, phys, prot).is_err() {
                ok = false;
                break;
            }
        }
        if !ok {
            drop(folio);
            rollback_mapped(&mm, &mapped_ranges);
            return Err(MmError::OutOfMemory);
        }

        mapped_ranges.push((cursor, run));
        folios.push(folio);
        mapped += run;
    }

    Ok(folios)
}

fn rollback_mapped(mm: &MmHandle, ranges: &[(VAddr, usize)]) {
    for &(start, run) in ranges {
        for i in 0..run {
            let _ = collaborators::get().unmap_page(mm, start + i * PAGE_SIZE);
        }
    }
}

fn unmap_pages(mm: &MmHandle, va: VAddr, pages: usize) {
    for i in 0..pages {
        let _ = collaborators::get().unmap_page(mm, va + i * PAGE_SIZE);
    }
}

/// The standalone (non-block) path: reserve a gap, map fresh physical
/// pages into it, record the folios so `vfree` can release them later.
fn area_alloc(preferred_node: u8, real_size: usize, prot: PageProt, flags: VmapAreaFlags) -> MmResult<VAddr> {
    let (va, node) = reserve_area(preferred_node, real_size, flags)?;
    let pages = real_size / PAGE_SIZE;

    match map_pages(va, pages, prot, node) {
        Ok(folios) => {
            let mut locked = NODES[node as usize].lock();
            if let Some(area) = locked.areas.get_mut(&va) {
                area.folios = Some(folios);
            }
            Ok(va)
        }
        Err(e) => {
            release_area(node, va);
            Err(e)
        }
    }
}

/// Allocate a non-physically-contiguous virtual region, mapped and ready
/// to use. `prot` is the protection the caller wants installed; cache
/// attributes for device mappings go through [`ioremap`] instead.
pub fn vmalloc(size: usize, prot: PageProt, preferred_node: u8) -> MmResult<VAddr> {
    let pages = size.div_ceil(PAGE_SIZE).max(1);
    let real_size = pages * PAGE_SIZE;

    if real_size <= SMALL_ALLOC_CEILING {
        if let Some(va) = pcp_bin_take(preferred_node, pages) {
            return match map_pages(va, pages, prot, preferred_node) {
                Ok(folios) => {
                    let mut locked = NODES[preferred_node as usize].lock();
                    locked.areas.insert(
                        va,
                        VmapArea {
                            real_size,
                            flags: VmapAreaFlags::empty(),
                            folios: Some(folios),
                        },
                    );
                    Ok(va)
                }
                // The VA itself is simply not re-cached; a rare mid-reuse
                // OOM just gives up the reservation rather than risking a
                // half-mapped range pretending to be a live bin entry.
                Err(e) => Err(e),
            };
        }
        return block_alloc(preferred_node, pages, prot);
    }

    area_alloc(preferred_node, real_size, prot, VmapAreaFlags::empty())
}

/// Map a physical device range directly; always `STATIC`, never subject
/// to lazy purge. The variants differ only in the cache-control bits
/// folded into `prot`.
pub fn ioremap(phys: PAddr, size: usize, cache: CacheAttr, preferred_node: u8) -> MmResult<VAddr> {
    let pages = size.div_ceil(PAGE_SIZE).max(1);
    let real_size = pages * PAGE_SIZE;
    let (va, node) = reserve_area(preferred_node, real_size, VmapAreaFlags::STATIC)?;
    let mm = kernel_mm();
    let prot = PageProt::WRITE | PageProt::GLOBAL | cache.prot_bits();

    for i in 0..pages {
        let virt = va + i * PAGE_SIZE;
        if collaborators::get().map_page(&mm, virt, phys + i * PAGE_SIZE, prot).is_err() {
            unmap_pages(&mm, va, i);
            release_area(node, va);
            return Err(MmError::OutOfMemory);
        }
    }
    collaborators::get().tlb_shootdown(&mm, VRange::new(va, va + real_size));
    Ok(va)
}

pub fn iounmap(addr: VAddr) {
    vfree(addr);
}

/// Free a `vmalloc`/`ioremap` return value, or a sub-allocation handed
/// out of a `vmap_block`. A no-op on an address this module never
/// handed back (double-free protection is the caller's/page-fault-on-
/// guard-page's job, not this function's).
pub fn vfree(addr: VAddr) {
    let Some(node) = find_area_node(addr) else {
        return;
    };

    {
        let mut locked = NODES[node as usize].lock();
        if locked.areas.contains_key(&addr) {
            free_standalone(&mut locked, node, addr);
            return;
        }
    }

    let block = {
        let locked = NODES[node as usize].lock();
        locked
            .areas
            .range(..=addr)
            .next_back()
            .and_then(|(start, _)| locked.blocks.get(start).cloned())
    };
    if let Some(block) = block {
        free_block_slot(&block, addr);
    }
}

fn free_standalone(locked: &mut VmapNodeLocked, node: u8, va: VAddr) {
    let Some(area) = locked.areas.get(&va) else {
        return;
    };
    let pages = area.real_size / PAGE_SIZE;
    let flags = area.flags;
    let mm = kernel_mm();

    if flags.contains(VmapAreaFlags::STATIC) {
        unmap_pages(&mm, va, pages);
        collaborators::get().tlb_shootdown(&mm, VRange::new(va, va + area.real_size));
        locked.areas.remove(&va);
        let (lo, hi) = PARTITIONS.lock()[node as usize];
        rebuild_gaps(locked, VAddr::from(lo), VAddr::from(hi));
        return;
    }

    if let Some(bin) = PCP_BIN_PAGE_COUNTS.iter().position(|&n| n == pages) {
        if pcp_bin_cache(node, bin, va) {
            unmap_pages(&mm, va, pages);
            collaborators::get().tlb_shootdown(&mm, VRange::new(va, va + area.real_size));
            // Space stays reserved (present in neither `areas` nor `gaps`)
            // while it sits in the bin, so nothing else can land on it.
            locked.areas.remove(&va);
            return;
        }
    }

    // Neither STATIC nor bin-eligible: unmap now, defer the shootdown and
    // the tree removal to the purge pass.
    unmap_pages(&mm, va, pages);
    if let Some(area) = locked.areas.get_mut(&va) {
        area.flags.insert(VmapAreaFlags::LAZY);
    }
    locked.purge_list.push(va);
    locked.lazy_pages += pages;
    if locked.lazy_pages >= LAZY_PURGE_THRESHOLD_PAGES {
        run_purge_locked(locked, node);
    }
}

fn run_purge_locked(locked: &mut VmapNodeLocked, node: u8) {
    let mm = kernel_mm();
    let purge_list = core::mem::take(&mut locked.purge_list);
    for va in purge_list {
        if let Some(area) = locked.areas.remove(&va) {
            collaborators::get().tlb_shootdown(&mm, VRange::new(va, va + area.real_size));
            locked.lazy_pages = locked.lazy_pages.saturating_sub(area.real_size / PAGE_SIZE);
        }
    }
    let (lo, hi) = PARTITIONS.lock()[node as usize];
    rebuild_gaps(locked, VAddr::from(lo), VAddr::from(hi));
}

/// Run the lazy-purge pass for `node` if it's actually over threshold.
/// `vfree` already does this inline on the allocation that tips a node
/// over, so in this no-scheduler core the only reason to call this
/// directly is a kernel that wants its own worker loop to own the timing
/// instead — there is no background thread underneath this module.
pub fn run_purge(node: u8) {
    let mut locked = NODES[node as usize].lock();
    if locked.lazy_pages >= LAZY_PURGE_THRESHOLD_PAGES {
        run_purge_locked(&mut locked, node);
    }
}

// --- vmap_block: the per-CPU small-allocation fast path ---------------

struct VmapBlock {
    va_start: VAddr,
    node: u8,
    bitmap: RwLock<BlockBitmap>,
}

struct BlockBitmap {
    used: [u64; BITMAP_WORDS],
    /// Keyed by the allocation's starting slot; the `Vec`'s length is the
    /// per-slot size table spec.md calls for, so a free doesn't need a
    /// separate size lookup.
    slots: BTreeMap<u16, Vec<BuddyFolio>>,
}

fn find_free_run(used: &[u64; BITMAP_WORDS], pages: usize) -> Option<usize> {
    let mut run = 0usize;
    let mut start = 0usize;
    for bit in 0..VMAP_BLOCK_PAGES {
        let word = bit / 64;
        let mask = 1u64 << (bit % 64);
        if used[word] & mask == 0 {
            if run == 0 {
                start = bit;
            }
            run += 1;
            if run == pages {
                return Some(start);
            }
        } else {
            run = 0;
        }
    }
    None
}

fn mark_used(used: &mut [u64; BITMAP_WORDS], start: usize, pages: usize) {
    for bit in start..start + pages {
        used[bit / 64] |= 1 << (bit % 64);
    }
}

fn mark_free(used: &mut [u64; BITMAP_WORDS], start: usize, pages: usize) {
    for bit in start..start + pages {
        used[bit / 64] &= !(1u64 << (bit % 64));
    }
}

fn new_block(node: u8) -> MmResult<(Arc<VmapBlock>, VAddr)> {
    let (va_start, node) = reserve_area(node, VMAP_BLOCK_SIZE, VmapAreaFlags::BLOCK)?;
    let block = Arc::new(VmapBlock {
        va_start,
        node,
        bitmap: crate::sync::new_rwlock(BlockBitmap {
            used: [0; BITMAP_WORDS],
            slots: BTreeMap::new(),
        }),
    });
    NODES[node as usize].lock().blocks.insert(va_start, block.clone());
    Ok((block, va_start))
}

const BLOCK_QUEUE_SLOTS: usize = 8;

struct BlockQueue {
    blocks: [Option<Arc<VmapBlock>>; BLOCK_QUEUE_SLOTS],
}

impl BlockQueue {
    const fn new() -> Self {
        Self {
            blocks: [const { None }; BLOCK_QUEUE_SLOTS],
        }
    }
}

#[eonix_percpu::define_percpu]
static BLOCK_QUEUE: BlockQueue = BlockQueue::new();

/// Lockless scan of this CPU's partial-block queue, trylocking each
/// block's bitmap in turn rather than taking a list-wide lock — a block
/// another CPU is currently carving into just gets skipped this round.
fn scan_block_queue(pages: usize) -> Option<(Arc<VmapBlock>, usize, VAddr)> {
    eonix_preempt::disable();
    let queue = unsafe { BLOCK_QUEUE.as_ref() };
    let mut found = None;
    for slot in queue.blocks.iter() {
        if let Some(block) = slot {
            if let Some(mut bitmap) = block.bitmap.try_write() {
                if let Some(start) = find_free_run(&bitmap.used, pages) {
                    mark_used(&mut bitmap.used, start, pages);
                    found = Some((block.clone(), start));
                    break;
                }
            }
        }
    }
    eonix_preempt::enable();
    found.map(|(block, start)| {
        let va = block.va_start + start * PAGE_SIZE;
        (block, start, va)
    })
}

/// Install a freshly created block into this CPU's queue, evicting an
/// empty slot or (failing that) a fully exhausted block. If the queue is
/// full of still-useful blocks, the new one just isn't cached here; it
/// remains reachable through its node's `blocks` map, so nothing leaks,
/// it's only no longer this CPU's first guess for the next small alloc.
fn install_in_queue(block: Arc<VmapBlock>) {
    eonix_preempt::disable();
    let queue = unsafe { BLOCK_QUEUE.as_mut() };
    let slot = queue.blocks.iter_mut().find(|s| match s {
        None => true,
        Some(b) => b.bitmap.read().used.iter().all(|w| *w == u64::MAX),
    });
    if let Some(slot) = slot {
        *slot = Some(block);
    }
    eonix_preempt::enable();
}

fn block_alloc(node: u8, pages: usize, prot: PageProt) -> MmResult<VAddr> {
    if let Some((block, start, va)) = scan_block_queue(pages) {
        return finish_block_mapping(block, start, pages, va, prot);
    }

    let (block, va_start) = new_block(node)?;
    install_in_queue(block.clone());

    let start = {
        let mut bitmap = block.bitmap.write();
        let start = find_free_run(&bitmap.used, pages).ok_or(MmError::OutOfMemory)?;
        mark_used(&mut bitmap.used, start, pages);
        start
    };
    let va = va_start + start * PAGE_SIZE;
    finish_block_mapping(block, start, pages, va, prot)
}

fn finish_block_mapping(block: Arc<VmapBlock>, start: usize, pages: usize, va: VAddr, prot: PageProt) -> MmResult<VAddr> {
    let mm = kernel_mm();
    let mut mapped = Vec::with_capacity(pages);

    for i in 0..pages {
        let Some(folio) = buddy_allocator::alloc_pages_on(block.node, 0, MigrateType::Unmovable) else {
            unmap_pages(&mm, va, mapped.len());
            let mut bitmap = block.bitmap.write();
            mark_free(&mut bitmap.used, start, pages);
            return Err(MmError::OutOfMemory);
        };
        if collaborators::get().map_page(&mm, va + i * PAGE_SIZE, PAddr::from(folio.pfn()), prot).is_err() {
            drop(folio);
            unmap_pages(&mm, va, mapped.len());
            let mut bitmap = block.bitmap.write();
            mark_free(&mut bitmap.used, start, pages);
            return Err(MmError::OutOfMemory);
        }
        mapped.push(folio);
    }

    block.bitmap.write().slots.insert(start as u16, mapped);
    Ok(va)
}

fn free_block_slot(block: &Arc<VmapBlock>, va: VAddr) {
    let start = ((va - block.va_start) / PAGE_SIZE) as u16;
    let mm = kernel_mm();
    let mut bitmap = block.bitmap.write();
    let Some(folios) = bitmap.slots.remove(&start) else {
        return;
    };
    let pages = folios.len();
    unmap_pages(&mm, va, pages);
    mark_free(&mut bitmap.used, start as usize, pages);
    // `folios` drops here, returning the physical pages. No broadcast
    // shootdown: block-slot churn isn't in spec.md's enumerated "flush
    // before handing the VA back" list (STATIC / PCP / lazy-purge), only
    // a local unmap, since reuse is overwhelmingly same-CPU.
}

// --- PCP bins: cached VA ranges for 1/2/4/8-page requests --------------

#[derive(Clone, Copy)]
struct PcpBins {
    bins: [[Option<(VAddr, u8)>; PCP_BIN_CAP]; PCP_BIN_PAGE_COUNTS.len()],
}

impl PcpBins {
    const fn new() -> Self {
        Self {
            bins: [[None; PCP_BIN_CAP]; PCP_BIN_PAGE_COUNTS.len()],
        }
    }
}

#[eonix_percpu::define_percpu]
static PCP_BINS: PcpBins = PcpBins::new();

fn pcp_bin_cache(node: u8, bin: usize, va: VAddr) -> bool {
    eonix_preempt::disable();
    let bins = unsafe { PCP_BINS.as_mut() };
    let slot = bins.bins[bin].iter_mut().find(|s| s.is_none());
    let cached = if let Some(slot) = slot {
        *slot = Some((va, node));
        true
    } else {
        false
    };
    eonix_preempt::enable();
    cached
}

fn pcp_bin_take(node: u8, pages: usize) -> Option<VAddr> {
    let bin = PCP_BIN_PAGE_COUNTS.iter().position(|&n| n == pages)?;
    eonix_preempt::disable();
    let bins = unsafe { PCP_BINS.as_mut() };
    let mut found = None;
    for slot in bins.bins[bin].iter_mut() {
        if let Some((va, n)) = *slot {
            if n == node {
                *slot = None;
                found = Some(va);
                break;
            }
        }
    }
    eonix_preempt::enable();
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_free_run_finds_the_first_fitting_gap() {
        let mut used = [0u64; BITMAP_WORDS];
        mark_used(&mut used, 0, 4);
        mark_used(&mut used, 10, 2);

        assert_eq!(find_free_run(&used, 4), Some(4));
        assert_eq!(find_free_run(&used, 6), Some(12));
    }

    #[test]
    fn mark_used_then_mark_free_round_trips() {
        let mut used = [0u64; BITMAP_WORDS];
        mark_used(&mut used, 60, 8);
        assert_eq!(find_free_run(&used, 8), Some(68));
        mark_free(&mut used, 60, 8);
        assert_eq!(find_free_run(&used, VMAP_BLOCK_PAGES), Some(0));
    }

    #[test]
    fn find_free_run_returns_none_when_block_is_full() {
        let mut used = [0u64; BITMAP_WORDS];
        mark_used(&mut used, 0, VMAP_BLOCK_PAGES);
        assert_eq!(find_free_run(&used, 1), None);
    }

    #[test]
    fn claim_gap_picks_an_aligned_start_and_shrinks_the_gap() {
        let mut locked = VmapNodeLocked::empty();
        let lo = VAddr::from(0x1000usize);
        let hi = VAddr::from(0x100_000usize);
        locked.gaps.insert((hi - lo, lo), ());

        let va = claim_gap(&mut locked, lo, hi, 2 * PAGE_SIZE, VmapAreaFlags::empty()).unwrap();
        assert!(va >= lo);
        assert_eq!(locked.areas.len(), 1);

        // The gap shrank by at least the claimed span plus its guard page.
        let remaining: usize = locked.gaps.keys().map(|(size, _)| *size).sum();
        assert!(remaining <= (hi - lo) - (2 * PAGE_SIZE + PAGE_SIZE));
    }

    #[test]
    fn claim_gap_refuses_a_request_with_no_fitting_gap() {
        let mut locked = VmapNodeLocked::empty();
        let lo = VAddr::from(0x1000usize);
        let hi = VAddr::from(0x1000usize + 2 * PAGE_SIZE);
        locked.gaps.insert((hi - lo, lo), ());

        // 2 pages plus a guard page doesn't fit in a 2-page gap.
        assert!(claim_gap(&mut locked, lo, hi, 2 * PAGE_SIZE, VmapAreaFlags::empty()).is_none());
    }

    #[test]
    fn rebuild_gaps_recovers_holes_left_by_removed_areas() {
        let mut locked = VmapNodeLocked::empty();
        let lo = VAddr::from(0x1000usize);
        let hi = VAddr::from(0x10_000usize);
        locked.gaps.insert((hi - lo, lo), ());

        let first = claim_gap(&mut locked, lo, hi, PAGE_SIZE, VmapAreaFlags::empty()).unwrap();
        let second = claim_gap(&mut locked, lo, hi, PAGE_SIZE, VmapAreaFlags::empty()).unwrap();
        assert_ne!(first, second);

        locked.areas.remove(&first);
        rebuild_gaps(&mut locked, lo, hi);

        // The freed area's span (plus its guard page) is available again.
        let reclaimed = claim_gap(&mut locked, lo, hi, PAGE_SIZE, VmapAreaFlags::empty());
        assert!(reclaimed.is_some());
    }

    #[test]
    fn huge_alignment_threshold_matches_the_block_size() {
        assert_eq!(VMAP_BLOCK_PAGES, 512);
        assert_eq!(VMAP_BLOCK_SIZE, 2 * 1024 * 1024);
    }

    #[test]
    fn cache_attr_write_back_adds_no_bits() {
        assert_eq!(CacheAttr::WriteBack.prot_bits(), PageProt::empty());
        assert_ne!(CacheAttr::Uncached.prot_bits(), PageProt::empty());
        assert_ne!(CacheAttr::WriteCombining.prot_bits(), CacheAttr::WriteThrough.prot_bits());
    }

    #[test]
    fn pcp_bin_page_counts_are_the_spec_quoted_sizes() {
        assert_eq!(PCP_BIN_PAGE_COUNTS, [1, 2, 4, 8]);
    }
}
