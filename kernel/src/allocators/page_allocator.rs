use core::{
    alloc::{GlobalAlloc, Layout},
    cmp::Ordering,
    ptr::NonNull,
};

use bit_field::BitField;
use log::trace;
use spin::{Mutex, Once};

use crate::paging::SMALL_PAGE_SIZE;

const PAGE_SIZE: usize = SMALL_PAGE_SIZE as usize;

/// Page-granular allocator over one contiguous region. The first pages of the region hold a
/// bitmap with one "free" bit per page.
pub struct PageAllocator {
    heap_start: NonNull<u8>,
    page_count: usize,
}

// The region is owned exclusively by the allocator.
unsafe impl Send for PageAllocator {}

impl PageAllocator {
    /// # Safety
    ///
    /// `heap_start` must be page aligned and point to `heap_len` writable bytes that nothing
    /// else uses for as long as the allocator lives.
    pub unsafe fn new(heap_start: *mut u8, heap_len: usize) -> PageAllocator {
        debug_assert_eq!(heap_start as usize % PAGE_SIZE, 0);

        // We intentionally use integer division to not overflow the heap
        let page_count = heap_len / PAGE_SIZE;

        let page_allocator = PageAllocator {
            heap_start: unsafe { NonNull::new_unchecked(heap_start) },
            page_count,
        };

        page_allocator.reserve_bitmap_pages();

        page_allocator
    }

    fn reserve_bitmap_pages(&self) {
        let needed_page_count = self.page_count.div_ceil(8).div_ceil(PAGE_SIZE);

        for i in 0..needed_page_count {
            self.set_free_bit(i, false);
        }

        for i in needed_page_count..self.page_count {
            self.set_free_bit(i, true);
        }
    }

    pub fn calculate_free_space(&self) -> usize {
        (0..self.page_count).filter(|&i| self.is_free(i)).count() * PAGE_SIZE
    }

    #[inline]
    fn is_free(&self, index: usize) -> bool {
        let byte_index = index / 8;
        let bit_index = index % 8;

        unsafe { (*self.heap_start.byte_add(byte_index).as_ptr()).get_bit(bit_index) }
    }

    #[inline]
    fn set_free_bit(&self, index: usize, value: bool) {
        let byte_index = index / 8;
        let bit_index = index % 8;

        unsafe {
            (*self.heap_start.byte_add(byte_index).as_ptr()).set_bit(bit_index, value);
        }
    }

    #[inline]
    fn get_page(&self, index: usize) -> NonNull<u8> {
        unsafe { self.heap_start.byte_add(index * PAGE_SIZE) }
    }

    #[inline]
    fn get_page_index_of(&self, ptr: *mut u8) -> usize {
        (ptr.addr() - self.heap_start.addr().get()) / PAGE_SIZE
    }

    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        let start = self.heap_start.addr().get();

        address >= start && address < start + self.page_count * PAGE_SIZE
    }

    fn is_run_free(&self, first: usize, count: usize) -> bool {
        first + count <= self.page_count && (first..first + count).all(|i| self.is_free(i))
    }

    fn mark_run(&self, first: usize, count: usize, free: bool) {
        for i in first..first + count {
            self.set_free_bit(i, free);
        }
    }

    pub fn alloc(&self, layout: Layout) -> *mut u8 {
        let needed_page_count = layout.size().div_ceil(PAGE_SIZE).max(1);

        for page_index in 0..self.page_count {
            if self.get_page(page_index).addr().get() % layout.align() != 0 {
                continue;
            }

            if self.is_run_free(page_index, needed_page_count) {
                self.mark_run(page_index, needed_page_count, false);

                return self.get_page(page_index).as_ptr();
            }
        }

        core::ptr::null_mut()
    }

    pub fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let needed_page_count = layout.size().div_ceil(PAGE_SIZE).max(1);

        self.mark_run(self.get_page_index_of(ptr), needed_page_count, true);

        trace!("released {needed_page_count} pages at {ptr:p}");
    }

    pub fn resize(&self, old_ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let old_needed_page_count = layout.size().div_ceil(PAGE_SIZE).max(1);
        let new_needed_page_count = new_size.div_ceil(PAGE_SIZE).max(1);
        let page_index = self.get_page_index_of(old_ptr);

        match new_needed_page_count.cmp(&old_needed_page_count) {
            // We shouldn't reallocate with the same page count
            Ordering::Equal => old_ptr,

            // And if we are shrinking the page count, we should free the excess pages
            Ordering::Less => {
                self.mark_run(
                    page_index + new_needed_page_count,
                    old_needed_page_count - new_needed_page_count,
                    true,
                );

                old_ptr
            }

            // Lastly, growing the page count requires us to check if there is some excess pages
            // which we can use, otherwise we have no choice but to reallocate
            Ordering::Greater => {
                let extra = new_needed_page_count - old_needed_page_count;

                if self.is_run_free(page_index + old_needed_page_count, extra) {
                    self.mark_run(page_index + old_needed_page_count, extra, false);

                    return old_ptr;
                }

                let new_layout =
                    unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };

                let new_ptr = self.alloc(new_layout);

                if !new_ptr.is_null() {
                    unsafe {
                        core::ptr::copy_nonoverlapping(old_ptr, new_ptr, layout.size());
                    }

                    self.dealloc(old_ptr, layout);
                }

                new_ptr
            }
        }
    }
}

/// The page allocator behind a lock, filled in once the memory map is known. Allocations made
/// before that fail.
pub struct LockedPageAllocator(Once<Mutex<PageAllocator>>);

impl LockedPageAllocator {
    pub const fn new() -> Self {
        Self(Once::new())
    }

    pub fn init(&self, allocator: PageAllocator) {
        self.0.call_once(|| Mutex::new(allocator));
    }

    pub fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        NonNull::new(self.0.get()?.lock().alloc(layout))
    }

    /// Gives back a run handed out by [`Self::allocate`] with the same `layout`.
    pub fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        if let Some(allocator) = self.0.get() {
            allocator.lock().dealloc(ptr.as_ptr(), layout);
        }
    }
}

impl Default for LockedPageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for LockedPageAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate(layout)
            .map_or(core::ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.release(ptr, layout);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        match self.0.get() {
            Some(allocator) => allocator.lock().resize(ptr, layout, new_size),
            None => core::ptr::null_mut(),
        }
    }
}
