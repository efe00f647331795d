use intrusive_list::List;

use crate::page::{MigrateType, PageFlags, PagePtr};

/// One order's, one migrate-type's free list within a zone. Grounded on
/// the single-migrate-type `FreeArea` the buddy allocator started from
/// (`free_list`/`count` pair over an intrusive [`Link`]); widened to carry
/// a `migrate_type` tag so `Zone` can keep `MigrateType::COUNT` of these
/// per order instead of one.
pub struct FreeArea {
    free_list: List,
    migrate_type: MigrateType,
}

unsafe impl Send for FreeArea {}
unsafe impl Sync for FreeArea {}

impl FreeArea {
    pub const fn new(migrate_type: MigrateType) -> Self {
        Self {
            free_list: List::new(),
            migrate_type,
        }
    }

    pub fn count(&self) -> usize {
        self.free_list.count()
    }

    pub fn is_empty(&self) -> bool {
        self.free_list.is_empty()
    }

    pub fn get_free_page(&mut self) -> Option<PagePtr> {
        self.free_list.pop().map(|link| unsafe { PagePtr::from_link(link) })
    }

    pub fn add_page(&mut self, page: PagePtr) {
        let descriptor = page.descriptor();
        descriptor.flags().set(PageFlags::FREE);
        descriptor.set_migrate_type(self.migrate_type);
        // SAFETY: `link` lives as long as the page array, i.e. forever.
        let link = unsafe { &mut *(&descriptor.link as *const _ as *mut _) };
        self.free_list.insert(link);
    }

    pub fn del_page(&mut self, page: PagePtr) {
        let descriptor = page.descriptor();
        debug_assert!(descriptor.flags().has(PageFlags::FREE));
        descriptor.flags().clear(PageFlags::FREE);
        let link = unsafe { &mut *(&descriptor.link as *const _ as *mut _) };
        self.free_list.remove(link);
    }
}
