//! One size class's slab cache: per-CPU magazines in front of per-node
//! partial/empty/full slab lists, grounded on the donor `SlabCache`'s
//! three-list shape (`empty_list`/`partial_list`/`full_list` over an
//! intrusive [`List`]) but split per NUMA node and fronted by a
//! magazine-style per-CPU cache analogous to `buddy_allocator::pcp`'s
//! order-0 page cache, just at the object granularity instead of the page
//! granularity.
//!
//! A true SLUB fastpath does its per-CPU alloc/free with a single
//! 16-byte `cmpxchg16b` against `(freelist_ptr, transaction_id)` so a
//! remote free racing the owning CPU's allocation is caught instead of
//! silently lost. Stable Rust has no portable double-word CAS, so this
//! cache instead takes the Linux SLAB-style path: the per-CPU magazine is
//! only ever touched by its own CPU under `eonix_preempt::disable()`, and
//! a free from a different CPU than the one that holds a slab's objects
//! in its magazine goes straight to that slab's own freelist, protected
//! by the slab page's [`Spin`].

use core::ptr::NonNull;

use alloc::boxed::Box;

use buddy_allocator::{MigrateType, MAX_NODES};
use eonix_mm::paging::{Folio as _, PAGE_SIZE};
use eonix_sync::Spin;
use intrusive_list::List;

use crate::access;
use crate::meta::{self, FREELIST_NONE};
use crate::rcu;
use crate::secret;

pub(crate) const MAGAZINE_CAPACITY: usize = 32;
const REFILL_BATCH: u32 = 16;
const EMPTY_SLAB_CAP: usize = 2;

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct CacheFlags: u32 {
        /// Fill freed objects with a poison byte, so a use-after-free
        /// reads garbage instead of plausible-looking stale data.
        const POISON   = 1 << 0;
        /// Pad each object with a canary word checked on free, to catch a
        /// one-past-the-end write into the next object.
        const RED_ZONE = 1 << 1;
        /// An empty slab page isn't released to the buddy allocator
        /// immediately; it's handed to `call_rcu` so that a reader who
        /// looked an object up without a reference (a typesafe-by-RCU
        /// lookup) can still safely dereference the page's type tag
        /// inside the current grace period, even past the object's own
        /// free. Doesn't defer individual object frees, only the page.
        const TYPESAFE_BY_RCU = 1 << 2;
    }
}

const POISON_BYTE: u8 = 0x6b; // matches Linux's POISON_FREE, easy to spot in a dump
const REDZONE_WORD: usize = 0x5a5a5a5a5a5a5a5a_u64 as usize;

pub(crate) struct CpuCache {
    current_slab: usize, // PFN + 1; 0 means none
    magazine: [usize; MAGAZINE_CAPACITY],
    magazine_count: u32,
}

impl CpuCache {
    pub(crate) const fn new() -> Self {
        Self {
            current_slab: 0,
            magazine: [0; MAGAZINE_CAPACITY],
            magazine_count: 0,
        }
    }
}

pub struct Cache {
    idx: usize,
    name: Option<&'static str>,
    object_size: u32,
    align: u32,
    objects_per_slab: u32,
    slab_order: u32,
    flags: CacheFlags,
    empty: [Spin<List>; MAX_NODES],
    partial: [Spin<List>; MAX_NODES],
    full: [Spin<List>; MAX_NODES],
}

unsafe impl Send for Cache {}
unsafe impl Sync for Cache {}

fn redzone_size(flags: CacheFlags) -> usize {
    if flags.contains(CacheFlags::RED_ZONE) {
        core::mem::size_of::<usize>()
    } else {
        0
    }
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

impl Cache {
    pub(crate) fn new(idx: usize, object_size: u32, flags: CacheFlags) -> Self {
        Self::new_named(idx, None, object_size, 1, flags)
    }

    pub(crate) fn new_named(idx: usize, name: Option<&'static str>, object_size: u32, align: u32, flags: CacheFlags) -> Self {
        let align = align.max(1) as usize;
        let stride = round_up(object_size as usize + redzone_size(flags), align);
        let objects_per_slab = ((PAGE_SIZE / stride).max(1)) as u32;
        Self {
            idx,
            name,
            object_size,
            align: align as u32,
            objects_per_slab,
            slab_order: 0,
            flags,
            empty: core::array::from_fn(|_| Spin::new(List::new())),
            partial: core::array::from_fn(|_| Spin::new(List::new())),
            full: core::array::from_fn(|_| Spin::new(List::new())),
        }
    }

    pub fn name(&self) -> Option<&'static str> {
        self.name
    }

    pub fn object_size(&self) -> u32 {
        self.object_size
    }

    pub fn align(&self) -> u32 {
        self.align
    }

    pub fn flags(&self) -> CacheFlags {
        self.flags
    }

    /// A cache is eligible to be handed back by `cache_create` for a
    /// different caller asking for the same size/align/flags: neither
    /// side wants its objects sharing a slab page with an unrelated
    /// type once poisoning or redzone checking is in play, since both
    /// are keyed to one fixed `object_size`, not the merged caller's.
    pub(crate) fn is_mergeable(&self) -> bool {
        !self.flags.intersects(CacheFlags::POISON | CacheFlags::RED_ZONE)
    }

    fn stride(&self) -> usize {
        round_up(self.object_size as usize + redzone_size(self.flags), self.align as usize)
    }

    fn with_cpu_cache<R>(&self, f: impl FnOnce(&mut CpuCache) -> R) -> R {
        eonix_preempt::disable();
        // SAFETY: preemption is disabled for the duration of `f`, so no
        // other task can observe or touch this CPU's slot concurrently.
        let caches = unsafe { crate::CPU_CACHES.as_mut() };
        let result = f(&mut caches[self.idx]);
        eonix_preempt::enable();
        result
    }

    pub fn alloc(&self, node: u8) -> Option<NonNull<u8>> {
        self.with_cpu_cache(|cc| {
            if cc.magazine_count == 0 {
                self.refill(cc, node);
                if cc.magazine_count == 0 {
                    return None;
                }
            }
            cc.magazine_count -= 1;
            let addr = cc.magazine[cc.magazine_count as usize];
            NonNull::new(addr as *mut u8)
        })
        .inspect(|&ptr| {
            if self.flags.contains(CacheFlags::POISON) {
                unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, self.object_size as usize) };
            }
            self.write_redzone(ptr);
        })
    }

    /// Fill as much of `out` as the magazine and its slab can cover
    /// under one `eonix_preempt::disable`/`enable` pair, instead of
    /// paying that toggle and the magazine bookkeeping once per object.
    /// A true SLUB fastpath amortizes this with a single CAS against the
    /// lockless freelist; this cache's magazine plays the same role.
    /// Returns the number of slots filled; a short count means the
    /// backing slabs ran dry, not an error.
    pub fn alloc_bulk(&self, node: u8, zero: bool, out: &mut [Option<NonNull<u8>>]) -> usize {
        let mut filled = 0;
        self.with_cpu_cache(|cc| {
            for slot in out.iter_mut() {
                if cc.magazine_count == 0 {
                    self.refill(cc, node);
                    if cc.magazine_count == 0 {
                        break;
                    }
                }
                cc.magazine_count -= 1;
                let addr = cc.magazine[cc.magazine_count as usize];
                let Some(ptr) = NonNull::new(addr as *mut u8) else {
                    break;
                };
                *slot = Some(ptr);
                filled += 1;
            }
        });
        for slot in out[..filled].iter().flatten() {
            if zero || self.flags.contains(CacheFlags::POISON) {
                unsafe { core::ptr::write_bytes(slot.as_ptr(), 0, self.object_size as usize) };
            }
            self.write_redzone(*slot);
        }
        filled
    }

    /// Per-pointer loop, per spec: there's no magazine-level win to
    /// amortize on the free side the way there is on alloc, since each
    /// pointer's slab and remote-vs-local ownership has to be looked up
    /// independently.
    pub fn free_bulk(&self, ptrs: &[NonNull<u8>]) {
        for &ptr in ptrs {
            self.free(ptr);
        }
    }

    fn write_redzone(&self, ptr: NonNull<u8>) {
        if self.flags.contains(CacheFlags::RED_ZONE) {
            unsafe {
                let guard = ptr.as_ptr().add(self.object_size as usize) as *mut usize;
                guard.write_unaligned(REDZONE_WORD);
            }
        }
    }

    fn check_redzone(&self, ptr: NonNull<u8>) {
        if self.flags.contains(CacheFlags::RED_ZONE) {
            unsafe {
                let guard = ptr.as_ptr().add(self.object_size as usize) as *const usize;
                debug_assert_eq!(
                    guard.read_unaligned(),
                    REDZONE_WORD,
                    "heap redzone corrupted past a {}-byte object",
                    self.object_size
                );
            }
        }
    }

    pub fn free(&self, ptr: NonNull<u8>) {
        self.check_redzone(ptr);
        if self.flags.contains(CacheFlags::POISON) {
            unsafe { core::ptr::write_bytes(ptr.as_ptr(), POISON_BYTE, self.object_size as usize) };
        }

        let pfn = access::ptr_to_pfn(ptr);
        let addr = ptr.as_ptr() as usize;

        self.with_cpu_cache(|cc| {
            if cc.current_slab == usize::from(pfn) + 1 && (cc.magazine_count as usize) < MAGAZINE_CAPACITY {
                cc.magazine[cc.magazine_count as usize] = addr;
                cc.magazine_count += 1;
                return;
            }
            if cc.current_slab == usize::from(pfn) + 1 {
                // Magazine's full and it's our own slab: flush it before
                // adding this object back, to avoid a remote-free detour
                // for memory we're about to want again anyway.
                self.flush_current(cc);
                cc.magazine[cc.magazine_count as usize] = addr;
                cc.magazine_count += 1;
                return;
            }
            self.remote_free(pfn, addr);
        });
    }

    /// Push back every object this CPU holds for `pfn`'s slab onto that
    /// slab's own freelist, in one lock acquisition.
    fn flush_current(&self, cc: &mut CpuCache) {
        if cc.current_slab == 0 {
            return;
        }
        let pfn = eonix_mm::paging::PFN::from(cc.current_slab - 1);
        while cc.magazine_count > 0 {
            cc.magazine_count -= 1;
            let addr = cc.magazine[cc.magazine_count as usize];
            self.push_free(pfn, addr);
        }
        cc.current_slab = 0;
    }

    fn remote_free(&self, pfn: eonix_mm::paging::PFN, addr: usize) {
        self.push_free(pfn, addr);
    }

    fn push_free(&self, pfn: eonix_mm::paging::PFN, addr: usize) {
        let meta = meta::get(pfn);
        let node = meta.node();
        let mut state = meta.state.lock();
        state.freelist = secret::encode(state.freelist, addr);
        unsafe { (addr as *mut usize).write_unaligned(state.freelist) };
        state.freelist = addr;
        state.free_count += 1;

        if state.free_count == self.objects_per_slab {
            self.move_to_empty(pfn, node, &mut state);
        } else if state.free_count == 1 {
            self.move_to_partial(pfn, node, &mut state);
        }
    }

    fn refill(&self, cc: &mut CpuCache, node: u8) {
        loop {
            if cc.current_slab == 0 {
                let Some(pfn) = self.get_or_alloc_slab(node) else {
                    return;
                };
                cc.current_slab = usize::from(pfn) + 1;
            }

            let pfn = eonix_mm::paging::PFN::from(cc.current_slab - 1);
            let meta = meta::get(pfn);
            let mut state = meta.state.lock();

            let free_count_before = state.free_count;
            let mut taken = 0u32;
            while taken < REFILL_BATCH
                && (cc.magazine_count as usize) < MAGAZINE_CAPACITY
                && state.freelist != FREELIST_NONE
            {
                let addr = state.freelist;
                let encoded = unsafe { (addr as *const usize).read_unaligned() };
                state.freelist = secret::decode(encoded, addr);
                state.free_count -= 1;
                cc.magazine[cc.magazine_count as usize] = addr;
                cc.magazine_count += 1;
                taken += 1;
            }

            let exhausted = state.freelist == FREELIST_NONE;

            if taken > 0 && free_count_before == self.objects_per_slab {
                // This slab was fully free (fresh, or sitting in the
                // empty list) before this batch: it's now in use.
                self.move_to_partial(pfn, node, &mut state);
            }
            if exhausted && state.free_count == 0 {
                self.move_to_full(pfn, node, &mut state);
            }

            if exhausted {
                cc.current_slab = 0;
            }
            drop(state);

            if taken > 0 || cc.magazine_count as usize >= MAGAZINE_CAPACITY {
                return;
            }
            if exhausted && taken == 0 {
                // Nothing left in this slab and it was already empty when
                // we grabbed it; try another.
                continue;
            }
            return;
        }
    }

    fn get_or_alloc_slab(&self, node: u8) -> Option<eonix_mm::paging::PFN> {
        for candidate in self.nodes_in_order(node) {
            if let Some(link) = self.partial[candidate as usize].lock().pop() {
                let pfn = unsafe { meta::pfn_from_link(link) };
                meta::get(pfn).state.lock().list_kind = meta::LIST_NONE;
                return Some(pfn);
            }
        }
        for candidate in self.nodes_in_order(node) {
            if let Some(link) = self.empty[candidate as usize].lock().pop() {
                let pfn = unsafe { meta::pfn_from_link(link) };
                meta::get(pfn).state.lock().list_kind = meta::LIST_NONE;
                return Some(pfn);
            }
        }
        self.alloc_fresh_slab(node)
    }

    fn nodes_in_order(&self, node: u8) -> [u8; MAX_NODES] {
        buddy_allocator::nodes_by_distance_from(node)
    }

    fn alloc_fresh_slab(&self, node: u8) -> Option<eonix_mm::paging::PFN> {
        let folio = buddy_allocator::alloc_pages_on(node, self.slab_order, MigrateType::Unmovable)?;
        let pfn = folio.pfn();
        core::mem::forget(folio); // kept alive by the slab subsystem's own refcount slot

        let meta = meta::get(pfn);
        meta.claim(self.idx as u8, self.object_size, self.objects_per_slab, node);

        let ptr = unsafe { access::access().get_ptr_for_pfn(pfn) };
        let stride = self.stride();
        let mut head = FREELIST_NONE;
        for i in (0..self.objects_per_slab as usize).rev() {
            let slot = unsafe { ptr.as_ptr().add(i * stride) } as usize;
            let encoded = secret::encode(head, slot);
            unsafe { (slot as *mut usize).write_unaligned(encoded) };
            head = slot;
        }
        let mut state = meta.state.lock();
        state.freelist = head;
        state.free_count = self.objects_per_slab;
        drop(state);

        Some(pfn)
    }

    /// Every `move_to_*`/`unlink_from_any` call is made with `pfn`'s own
    /// `state` lock already held by the caller (`push_free`/`refill`),
    /// which is what makes "decide a transition from `free_count`, then
    /// perform it" atomic against another CPU deciding the same thing for
    /// the same shared slab page.
    fn move_to_partial(&self, pfn: eonix_mm::paging::PFN, node: u8, state: &mut meta::SlabPageState) {
        self.unlink_from_any(pfn, node, state);
        let meta = meta::get(pfn);
        let link = unsafe { &mut *(&meta.link as *const _ as *mut _) };
        self.partial[node as usize].lock().insert(link);
        state.list_kind = meta::LIST_PARTIAL;
    }

    fn move_to_full(&self, pfn: eonix_mm::paging::PFN, node: u8, state: &mut meta::SlabPageState) {
        self.unlink_from_any(pfn, node, state);
        let meta = meta::get(pfn);
        let link = unsafe { &mut *(&meta.link as *const _ as *mut _) };
        self.full[node as usize].lock().insert(link);
        state.list_kind = meta::LIST_FULL;
    }

    fn move_to_empty(&self, pfn: eonix_mm::paging::PFN, node: u8, state: &mut meta::SlabPageState) {
        self.unlink_from_any(pfn, node, state);
        if self.empty[node as usize].lock().count() >= EMPTY_SLAB_CAP {
            state.list_kind = meta::LIST_NONE;
            if self.flags.contains(CacheFlags::TYPESAFE_BY_RCU) {
                // A lockless reader may still be mid-lookup against this
                // page's cache tag; keep both the tag and the page itself
                // alive until the grace period ends instead of handing
                // the page to a possibly-unrelated type right away.
                rcu::access().call_rcu(Box::new(move || release_slab_page(pfn)));
            } else {
                release_slab_page(pfn);
            }
            return;
        }
        let meta = meta::get(pfn);
        let link = unsafe { &mut *(&meta.link as *const _ as *mut _) };
        self.empty[node as usize].lock().insert(link);
        state.list_kind = meta::LIST_EMPTY;
    }

    /// A page can be in at most one of empty/partial/full at a time;
    /// `state.list_kind` remembers which (there's no membership query on
    /// `intrusive_list::List`), so a transition only ever locks the one
    /// list the page is actually in.
    fn unlink_from_any(&self, pfn: eonix_mm::paging::PFN, node: u8, state: &mut meta::SlabPageState) {
        if state.list_kind == meta::LIST_NONE {
            return;
        }
        let list = match state.list_kind {
            meta::LIST_EMPTY => &self.empty[node as usize],
            meta::LIST_PARTIAL => &self.partial[node as usize],
            _ => &self.full[node as usize],
        };
        let meta = meta::get(pfn);
        let link = unsafe { &mut *(&meta.link as *const _ as *mut _) };
        list.lock().remove(link);
        state.list_kind = meta::LIST_NONE;
    }

    pub fn ksize(&self) -> usize {
        self.object_size as usize
    }
}

/// Return an emptied-out slab page to the buddy allocator. Split out of
/// `move_to_empty` so the `TypesafeByRCU` path can run it from inside a
/// `call_rcu` callback instead of inline.
fn release_slab_page(pfn: eonix_mm::paging::PFN) {
    meta::get(pfn).release();
    // SAFETY: this CPU was the last holder of every object in the slab
    // (free_count == objects_per_slab), and the folio's refcount was
    // parked at 1 by `alloc_fresh_slab`'s `forget`. `page_at` only reads
    // the page array, not `state`, so this doesn't re-enter any lock the
    // caller might still be holding.
    let folio = unsafe { buddy_allocator::BuddyFolio::from_raw(buddy_allocator::page_at(pfn).unwrap()) };
    drop(folio);
}
