//! The boundary the embedding kernel implements and installs at boot, so
//! this core compiles and runs standalone without a real bootloader, APIC,
//! or page-table walker behind it. Mirrors the role the donor's deleted
//! `eonix_hal` crate played for `src/kernel/mem`, except the boundary here
//! is a plain `&dyn Collaborators` object the embedding kernel hands in,
//! not a concrete arch crate this one links against directly.
//!
//! Local-IRQ masking is deliberately *not* part of this trait: it's
//! modeled as internal to the core's own concurrency primitives
//! (`eonix_sync::spin::spin_irq`'s x86_64 `cli`/`sti`), not a delegated
//! collaborator concern.

use core::ptr::NonNull;

use alloc::boxed::Box;

use eonix_mm::address::{PAddr, VAddr, VRange};

pub use buddy_allocator::BumpAllocator;

/// A set of CPUs, for `send_ipi`'s target mask. 64 CPUs is generous for
/// anything this core's NUMA fan-out (`buddy_allocator::MAX_NODES`) is
/// sized for; an embedding kernel with more CPUs than that can still use
/// `ALL` and handle the broadcast itself.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const ALL: Self = Self(u64::MAX);
    pub const NONE: Self = Self(0);

    pub const fn one(cpu: u32) -> Self {
        Self(1 << cpu)
    }

    pub const fn contains(self, cpu: u32) -> bool {
        self.0 & (1 << cpu) != 0
    }

    pub const fn insert(self, cpu: u32) -> Self {
        Self(self.0 | (1 << cpu))
    }
}

bitflags::bitflags! {
    /// The logical protection/attribute bits `map_page` asks the
    /// collaborator to install, independent of any concrete PTE bit
    /// layout. Named after the semantic flags the donor's own
    /// `eonix_mm::page_table::PageAttribute` trait exposes
    /// (`is_write`/`is_execute`/`is_user`/`is_global`/`is_copy_on_write`),
    /// minus the ones (`present`, `accessed`, `dirty`) that are either
    /// implied by calling `map_page` at all or are hardware-managed after
    /// the fact.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct PageProt: u32 {
        const WRITE   = 1 << 0;
        const EXECUTE = 1 << 1;
        const USER    = 1 << 2;
        const GLOBAL  = 1 << 3;
        /// Map read-only and let the first write fault through to the
        /// fault path's COW handling, per spec.md §4.E.
        const COPY_ON_WRITE = 1 << 4;

        /// Uncached: every access goes to the device, in program order.
        const CACHE_UC = 1 << 5;
        /// Uncached but writes may be buffered and combined; for
        /// framebuffer-style MMIO that doesn't need per-store ordering.
        const CACHE_WC = 1 << 6;
        /// Cached for reads, writes go through to memory immediately.
        const CACHE_WT = 1 << 7;
        // Absence of all three cache bits means write-back, the default
        // for ordinary memory.
    }
}

/// An opaque handle to one address space's page-table root, passed back
/// into the collaborator for every mapping operation concerning it. The
/// VMA-map module (spec.md §4.C) is the eventual owner of the concrete
/// address-space type; this core only ever needs the page-table root PFN
/// to hand to the collaborator, so the handle is kept to exactly that
/// rather than threading a full address-space reference through a trait
/// this crate doesn't otherwise depend on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MmHandle {
    root_pfn: eonix_mm::paging::PFN,
}

impl MmHandle {
    pub const fn new(root_pfn: eonix_mm::paging::PFN) -> Self {
        Self { root_pfn }
    }

    pub const fn root_pfn(&self) -> eonix_mm::paging::PFN {
        self.root_pfn
    }
}

/// The object-safe boundary this core calls into for everything it can't
/// do itself: SMP topology, wall-clock time, and page-table manipulation.
/// Installed once at boot (see [`init`]) and thereafter reached through
/// [`get`].
pub trait Collaborators: Send + Sync {
    fn smp_get_id(&self) -> u32;
    fn smp_cpu_count(&self) -> u32;
    fn send_ipi(&self, cpu_mask: CpuMask, vector: u8);
    fn get_time_ns(&self) -> u64;

    fn map_page(&self, mm: &MmHandle, virt: VAddr, phys: PAddr, prot: PageProt) -> crate::error::MmResult<()>;
    fn unmap_page(&self, mm: &MmHandle, virt: VAddr) -> crate::error::MmResult<()>;
    fn virt_to_phys(&self, mm: &MmHandle, virt: VAddr) -> Option<PAddr>;
    fn switch_mm(&self, mm: &MmHandle);
    fn tlb_shootdown(&self, mm: &MmHandle, range: VRange);

    /// Queue `callback` to run after every CPU has passed through a
    /// quiescent state at least once. This core has no grace-period
    /// tracker of its own (no scheduler to watch for a context switch on
    /// every CPU); `TypesafeByRCU` slab caches and anything else that
    /// defers a free past the current reader all route through this one
    /// hook. Callers may hold one of this core's own spinlocks across
    /// the call, so registering the callback must not itself block.
    fn call_rcu(&self, callback: Box<dyn FnOnce() + Send>);
}

static mut COLLABORATORS: Option<&'static dyn Collaborators> = None;
static mut PAGE_ACCESS: Option<&'static dyn slab_allocator::SlabPageAccess> = None;
static READY: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

/// # Safety
/// Must be called exactly once at boot, before any code in this crate
/// that touches an address space (the PMM/SLUB subsystems don't need
/// this; the VMA map, vmalloc, and fault path do). `page_access` is the
/// same direct-physical-map implementor handed to `slab_allocator::init`;
/// the fault path reuses it to zero newly allocated folios rather than
/// this module inventing a second physical-access boundary.
pub unsafe fn init(collaborators: &'static dyn Collaborators, page_access: &'static dyn slab_allocator::SlabPageAccess) {
    unsafe {
        COLLABORATORS = Some(collaborators);
        PAGE_ACCESS = Some(page_access);
    }
    READY.store(true, core::sync::atomic::Ordering::Release);
}

pub fn get() -> &'static dyn Collaborators {
    debug_assert!(
        READY.load(core::sync::atomic::Ordering::Acquire),
        "collaborators::init was never called"
    );
    unsafe { COLLABORATORS.expect("collaborators::init was never called") }
}

pub fn page_access() -> &'static dyn slab_allocator::SlabPageAccess {
    debug_assert!(
        READY.load(core::sync::atomic::Ordering::Acquire),
        "collaborators::init was never called"
    );
    unsafe { PAGE_ACCESS.expect("collaborators::init was never called") }
}

/// Forwards `slab_allocator`'s narrow RCU-domain need onto the full
/// [`Collaborators`] object, the same way [`DirectMapSlabAccess`] forwards
/// its narrow physical-access need. A bare unit struct rather than a
/// `&'static dyn Collaborators` field: the bridge is handed to
/// `slab_allocator::init` before `collaborators::init` has necessarily
/// run, and only calls [`get`] once actually invoked at a `call_rcu` site,
/// by which point boot has long since installed the real collaborator.
struct RcuBridge;

impl slab_allocator::RcuDomain for RcuBridge {
    fn call_rcu(&self, callback: Box<dyn FnOnce() + Send>) {
        get().call_rcu(callback);
    }
}

static RCU_BRIDGE: RcuBridge = RcuBridge;

pub(crate) fn rcu_bridge() -> &'static dyn slab_allocator::RcuDomain {
    &RCU_BRIDGE
}

/// The direct-physical-map-backed implementor of
/// [`slab_allocator::SlabPageAccess`] every embedding kernel installs
/// alongside [`Collaborators`]: slab pages are always mapped through the
/// kernel's own HHDM, never through a per-process page table, so this
/// needs nothing from `Collaborators` itself, just the HHDM offset.
pub struct DirectMapSlabAccess {
    hhdm_offset: usize,
}

impl DirectMapSlabAccess {
    pub const fn new(hhdm_offset: usize) -> Self {
        Self { hhdm_offset }
    }
}

impl slab_allocator::SlabPageAccess for DirectMapSlabAccess {
    unsafe fn get_ptr_for_pfn(&self, pfn: eonix_mm::paging::PFN) -> NonNull<u8> {
        let phys = usize::from(pfn) << eonix_mm::paging::PAGE_SIZE_BITS;
        let virt = self.hhdm_offset + phys;
        unsafe { NonNull::new_unchecked(virt as *mut u8) }
    }

    fn phys_for_ptr(&self, ptr: NonNull<u8>) -> PAddr {
        let virt = ptr.as_ptr() as usize;
        PAddr::from(virt - self.hhdm_offset)
    }
}
