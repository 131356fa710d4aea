use core::{alloc::Layout, ptr::NonNull};

use log::info;
use spin::Once;

use crate::{
    allocators::page_allocator::{LockedPageAllocator, PageAllocator},
    boot::{BootDescriptor, MemoryKind},
    paging::SMALL_PAGE_SIZE,
};

#[cfg_attr(target_os = "none", global_allocator)]
pub static PAGE_ALLOCATOR: LockedPageAllocator = LockedPageAllocator::new();

static DIRECT_MAP: Once<DirectMap> = Once::new();

#[inline]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    align_down(value + align - 1, align)
}

#[inline]
pub const fn is_aligned(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}

/// Source of physical memory for stacks and page tables. Returned frames are never aliased by
/// another live allocation; their contents are unspecified.
pub trait FrameAllocator {
    /// One 4 KiB frame.
    fn allocate_page(&mut self) -> Option<u64>;

    /// `count` physically contiguous 4 KiB frames.
    fn allocate_pages(&mut self, count: usize) -> Option<u64>;

    /// Returns `count` frames starting at `phys`, as handed out by one `allocate_pages` call.
    /// Nothing may refer to them afterwards.
    fn free_pages(&mut self, phys: u64, count: usize);
}

/// The fixed window where physical address `p` is always reachable at `p + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectMap {
    offset: u64,
}

impl DirectMap {
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub const fn to_virt(&self, phys: u64) -> u64 {
        phys.wrapping_add(self.offset)
    }

    #[inline]
    pub const fn to_phys(&self, virt: u64) -> u64 {
        virt.wrapping_sub(self.offset)
    }

    #[inline]
    pub fn ptr<T>(&self, phys: u64) -> *mut T {
        self.to_virt(phys) as *mut T
    }
}

/// The kernel's direct map. Panics if asked for before [`init`].
pub fn direct_map() -> DirectMap {
    *DIRECT_MAP
        .get()
        .expect("the direct map was used before memory::init")
}

/// Installs the direct map and hands the largest usable memory-map region to the page allocator.
pub fn init(descriptor: &BootDescriptor) {
    let direct_map = *DIRECT_MAP.call_once(|| DirectMap::new(descriptor.direct_map_offset()));

    let mut largest = None;

    descriptor.iterate_memory_map(|entry| {
        if entry.kind == MemoryKind::Usable
            && largest.is_none_or(|(_, length)| entry.length > length)
        {
            largest = Some((entry.base, entry.length));
        }
    });

    let (base, length) = largest.expect("the memory map has no usable region");

    let start = align_up(base, SMALL_PAGE_SIZE);
    let length = length - (start - base);

    // SAFETY: the region is usable RAM reported by the bootloader and reached through the
    // direct map; nothing else owns it.
    let allocator = unsafe { PageAllocator::new(direct_map.ptr(start), length as usize) };

    info!(
        "heap: {:#x}..{:#x} ({} KiB free)",
        start,
        start + length,
        allocator.calculate_free_space() / 1024
    );

    PAGE_ALLOCATOR.init(allocator);
}

/// Frames carved out of the page allocator, named by physical address.
#[derive(Clone, Copy)]
pub struct HeapFrames {
    heap: &'static LockedPageAllocator,
    direct_map: DirectMap,
}

impl HeapFrames {
    pub fn new(heap: &'static LockedPageAllocator, direct_map: DirectMap) -> Self {
        Self { heap, direct_map }
    }
}

impl FrameAllocator for HeapFrames {
    fn allocate_page(&mut self) -> Option<u64> {
        self.allocate_pages(1)
    }

    fn allocate_pages(&mut self, count: usize) -> Option<u64> {
        let size = count * SMALL_PAGE_SIZE as usize;
        let layout = Layout::from_size_align(size, SMALL_PAGE_SIZE as usize).ok()?;

        let virt = self.heap.allocate(layout)?;

        Some(self.direct_map.to_phys(virt.as_ptr() as u64))
    }

    fn free_pages(&mut self, phys: u64, count: usize) {
        let size = count * SMALL_PAGE_SIZE as usize;

        if let (Ok(layout), Some(virt)) = (
            Layout::from_size_align(size, SMALL_PAGE_SIZE as usize),
            NonNull::new(self.direct_map.ptr::<u8>(phys)),
        ) {
            self.heap.release(virt, layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ARENA_PHYS_BASE, PhysArena, leak};

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_up(0x2000, 0x1000), 0x2000);
        assert!(is_aligned(0x20_0000, 0x20_0000));
        assert!(!is_aligned(0x20_1000, 0x20_0000));
    }

    #[test]
    fn freed_heap_frames_are_handed_out_again() {
        let arena = PhysArena::new(8);
        let direct_map = arena.direct_map();
        let heap = leak(LockedPageAllocator::new());

        heap.init(unsafe { PageAllocator::new(direct_map.ptr(ARENA_PHYS_BASE), 8 * 0x1000) });

        let mut frames = HeapFrames::new(heap, direct_map);
        let stack = frames.allocate_pages(4).unwrap();

        assert!(frames.allocate_pages(4).is_none());

        frames.free_pages(stack, 4);

        assert_eq!(frames.allocate_pages(4), Some(stack));
    }

    #[test]
    fn direct_map_round_trips() {
        let direct_map = DirectMap::new(0xFFFF_8000_0000_0000);

        assert_eq!(direct_map.to_virt(0x1000), 0xFFFF_8000_0000_1000);
        assert_eq!(direct_map.to_phys(0xFFFF_8000_0000_1000), 0x1000);
    }
}
