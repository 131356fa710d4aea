//! Four-level page tables: building mappings, the direct-mapped window and keeping the kernel
//! half of every per-core root identical.

use core::fmt;

use bitflags::bitflags;
use log::trace;

use crate::{
    arch,
    memory::{self, DirectMap, FrameAllocator, HeapFrames, PAGE_ALLOCATOR, align_down, is_aligned},
    percpu::CoreRegistry,
};

pub mod table;

use table::{PageTable, PageTableIndices, TABLE_ENTRY_COUNT};

pub const SMALL_PAGE_SIZE: u64 = 0x1000;
pub const MEDIUM_PAGE_SIZE: u64 = 0x20_0000;
pub const LARGE_PAGE_SIZE: u64 = 0x4000_0000;

/// Translation granularity of one mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// 4 KiB, mapped by a P1 entry.
    Small,
    /// 2 MiB, mapped by a huge P2 entry.
    Medium,
    /// 1 GiB, mapped by a huge P3 entry.
    Large,
}

impl PageType {
    pub const fn size(self) -> u64 {
        match self {
            PageType::Small => SMALL_PAGE_SIZE,
            PageType::Medium => MEDIUM_PAGE_SIZE,
            PageType::Large => LARGE_PAGE_SIZE,
        }
    }

    /// Level of the table holding the leaf entry.
    pub const fn level(self) -> u8 {
        match self {
            PageType::Small => 1,
            PageType::Medium => 2,
            PageType::Large => 3,
        }
    }
}

bitflags! {
    /// Leaf-entry attributes, at their hardware bit positions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageProperties: u64 {
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const GLOBAL = 1 << 8;
        const NO_EXECUTE = 1 << 63;

        const KERNEL_DATA = Self::WRITABLE.bits() | Self::NO_EXECUTE.bits();
        const MMIO = Self::KERNEL_DATA.bits() | Self::NO_CACHE.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Something is already mapped there and overwriting was not requested.
    AlreadyMapped,
    /// An intermediate table could not be allocated.
    OutOfFrames,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::AlreadyMapped => f.write_str("address is already mapped"),
            MapError::OutOfFrames => f.write_str("out of frames for page tables"),
        }
    }
}

/// Bytes one entry of a level `level` table covers.
const fn level_page_size(level: u8) -> u64 {
    SMALL_PAGE_SIZE << (9 * (level as u64 - 1))
}

/// # Safety
///
/// `phys` must be a page table reachable through `direct_map` that nobody else is accessing.
unsafe fn table_at<'t>(direct_map: DirectMap, phys: u64) -> &'t mut PageTable {
    unsafe { &mut *direct_map.ptr::<PageTable>(phys) }
}

/// Edits the tree under one root, taking intermediate tables from `frames`.
pub struct PageMapper<'a, F: FrameAllocator> {
    root: u64,
    direct_map: DirectMap,
    frames: &'a mut F,
}

impl<'a, F: FrameAllocator> PageMapper<'a, F> {
    pub fn new(root: u64, direct_map: DirectMap, frames: &'a mut F) -> Self {
        Self {
            root,
            direct_map,
            frames,
        }
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    /// Maps the page at `virt` to the frame at `phys`.
    ///
    /// With `overwrite == false` an existing mapping, or a huge page covering `virt`, is left
    /// untouched and reported as [`MapError::AlreadyMapped`]. With `overwrite == true` a huge
    /// page in the way is split into a table of next-smaller pages with the same frames and
    /// attributes before the walk continues.
    ///
    /// # Panics
    ///
    /// If either address is not aligned to `page_type`.
    pub fn map(
        &mut self,
        page_type: PageType,
        virt: u64,
        phys: u64,
        properties: PageProperties,
        overwrite: bool,
    ) -> Result<(), MapError> {
        let size = page_type.size();

        assert!(
            is_aligned(virt, size) && is_aligned(phys, size),
            "misaligned {page_type:?} mapping {virt:#x} -> {phys:#x}"
        );

        let indices = PageTableIndices::from(virt);
        let leaf_level = page_type.level();
        let mut table_phys = self.root;

        for level in (leaf_level + 1..=4).rev() {
            // SAFETY: every table in the tree was allocated through `frames` and is reached
            // through the direct map.
            let table = unsafe { table_at(self.direct_map, table_phys) };
            let entry = &mut table[indices.at(level)];

            if !entry.is_present() {
                let frame = self.frames.allocate_page().ok_or(MapError::OutOfFrames)?;

                unsafe { table_at(self.direct_map, frame) }.clear();

                entry
                    .set_phys(frame)
                    .set_present(true)
                    .set_writable(true)
                    .set_user_accessible(properties.contains(PageProperties::USER));
            } else if entry.is_huge() {
                if !overwrite {
                    return Err(MapError::AlreadyMapped);
                }

                let frame = self.frames.allocate_page().ok_or(MapError::OutOfFrames)?;
                let split = unsafe { table_at(self.direct_map, frame) };
                let child_size = level_page_size(level - 1);
                let base = entry.get_phys();
                let huge_properties = entry.properties();

                for index in 0..TABLE_ENTRY_COUNT as u16 {
                    let child = &mut split[index];

                    child.clear();
                    child
                        .set_phys(base + u64::from(index) * child_size)
                        .set_present(true)
                        .set_huge(level - 1 > 1)
                        .set_properties(huge_properties);
                }

                entry.clear();
                entry
                    .set_phys(frame)
                    .set_present(true)
                    .set_writable(true)
                    .set_user_accessible(
                        huge_properties.contains(PageProperties::USER)
                            || properties.contains(PageProperties::USER),
                    );

                if arch::read_page_table_root() == self.root {
                    arch::flush_page(align_down(virt, level_page_size(level)));
                }

                trace!("split the huge page at {virt:#x} (level {level})");
            }

            table_phys = entry.get_phys();
        }

        let table = unsafe { table_at(self.direct_map, table_phys) };
        let entry = &mut table[indices.at(leaf_level)];

        if entry.is_present() && !overwrite {
            return Err(MapError::AlreadyMapped);
        }

        entry.clear();
        entry
            .set_phys(phys)
            .set_present(true)
            .set_huge(page_type != PageType::Small)
            .set_properties(properties);

        if arch::read_page_table_root() == self.root {
            arch::flush_page(virt);
        }

        Ok(())
    }

    /// Maps the `page_type` page holding `phys` at its direct-map address and returns the
    /// virtual address of `phys` itself. A page that is already there counts as mapped.
    pub fn map_direct(
        &mut self,
        page_type: PageType,
        phys: u64,
        properties: PageProperties,
    ) -> Result<u64, MapError> {
        let page = align_down(phys, page_type.size());

        match self.map(
            page_type,
            self.direct_map.to_virt(page),
            page,
            properties,
            false,
        ) {
            Ok(()) | Err(MapError::AlreadyMapped) => Ok(self.direct_map.to_virt(phys)),
            Err(error) => Err(error),
        }
    }

    pub fn translate(&self, virt: u64) -> Option<u64> {
        translate(self.root, self.direct_map, virt)
    }
}

/// Walks the tree under `root` and returns the physical address `virt` maps to.
pub fn translate(root: u64, direct_map: DirectMap, virt: u64) -> Option<u64> {
    let indices = PageTableIndices::from(virt);
    let mut table_phys = root;

    for level in (1..=4).rev() {
        let entry = unsafe { table_at(direct_map, table_phys) }[indices.at(level)];

        if !entry.is_present() {
            return None;
        }

        let page_size = match level {
            1 => SMALL_PAGE_SIZE,
            2 if entry.is_huge() => MEDIUM_PAGE_SIZE,
            3 if entry.is_huge() => LARGE_PAGE_SIZE,
            _ => {
                table_phys = entry.get_phys();
                continue;
            }
        };

        return Some(entry.get_phys() + (virt & (page_size - 1)));
    }

    None
}

/// Allocates an empty root table.
pub fn new_root(frames: &mut impl FrameAllocator, direct_map: DirectMap) -> Result<u64, MapError> {
    let root = frames.allocate_page().ok_or(MapError::OutOfFrames)?;

    unsafe { table_at(direct_map, root) }.clear();

    Ok(root)
}

/// Copies the kernel-half root entries of `src` into `dest`. The user half is untouched.
pub fn copy_kernel_tables(dest: &mut PageTable, src: &PageTable) {
    dest.kernel_half_mut().copy_from_slice(src.kernel_half());
}

/// Makes the kernel half of `dest_core`'s root equal to `src_core`'s.
///
/// Must follow the creation of every root and every change to a kernel-half root entry.
///
/// # Panics
///
/// If either core is missing from the registry or has no root yet.
pub fn sync(registry: &CoreRegistry, direct_map: DirectMap, dest_core: usize, src_core: usize) {
    let root_of = |id| {
        let root = registry
            .get(id)
            .unwrap_or_else(|| panic!("core {id} is not in the registry"))
            .pagemap();

        assert!(root != 0, "core {id} has no page-table root");
        root
    };

    let (dest, src) = (root_of(dest_core), root_of(src_core));

    if dest == src {
        return;
    }

    // SAFETY: `dest` belongs to a core that is not running yet, or to the caller; only the
    // kernel half is written and `src` is read through a shared reference.
    let src_table = unsafe { &*direct_map.ptr::<PageTable>(src) };
    copy_kernel_tables(unsafe { table_at(direct_map, dest) }, src_table);

    trace!("synced kernel half of core {dest_core} from core {src_core}");
}

/// Maps `phys` into the direct map of the calling core's active root, taking tables from the
/// kernel heap. Returns the virtual address of `phys`.
pub fn map_direct(
    page_type: PageType,
    phys: u64,
    properties: PageProperties,
) -> Result<u64, MapError> {
    let direct_map = memory::direct_map();
    let mut frames = HeapFrames::new(&PAGE_ALLOCATOR, direct_map);

    PageMapper::new(arch::read_page_table_root(), direct_map, &mut frames).map_direct(
        page_type,
        phys,
        properties,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::PhysArena;

    const KERNEL_VIRT: u64 = 0xFFFF_FFFF_8020_0000;

    fn arena_root(arena: &mut PhysArena) -> u64 {
        let direct_map = arena.direct_map();
        new_root(arena, direct_map).unwrap()
    }

    #[test]
    fn small_mapping_translates() {
        let mut arena = PhysArena::new(16);
        let direct_map = arena.direct_map();
        let root = arena_root(&mut arena);
        let mut mapper = PageMapper::new(root, direct_map, &mut arena);

        mapper
            .map(PageType::Small, KERNEL_VIRT, 0x4_2000, PageProperties::KERNEL_DATA, false)
            .unwrap();

        assert_eq!(mapper.translate(KERNEL_VIRT + 0x123), Some(0x4_2123));
        assert_eq!(mapper.translate(KERNEL_VIRT + SMALL_PAGE_SIZE), None);
    }

    #[test]
    fn second_map_reports_already_mapped_and_keeps_translation() {
        let mut arena = PhysArena::new(16);
        let direct_map = arena.direct_map();
        let root = arena_root(&mut arena);
        let mut mapper = PageMapper::new(root, direct_map, &mut arena);

        mapper
            .map(PageType::Small, KERNEL_VIRT, 0x4_2000, PageProperties::KERNEL_DATA, false)
            .unwrap();

        assert_eq!(
            mapper.map(PageType::Small, KERNEL_VIRT, 0x4_2000, PageProperties::KERNEL_DATA, false),
            Err(MapError::AlreadyMapped)
        );
        assert_eq!(
            mapper.map(PageType::Small, KERNEL_VIRT, 0x9_9000, PageProperties::WRITABLE, false),
            Err(MapError::AlreadyMapped)
        );
        assert_eq!(mapper.translate(KERNEL_VIRT), Some(0x4_2000));
    }

    #[test]
    fn overwrite_replaces_mapping() {
        let mut arena = PhysArena::new(16);
        let direct_map = arena.direct_map();
        let root = arena_root(&mut arena);
        let mut mapper = PageMapper::new(root, direct_map, &mut arena);

        mapper
            .map(PageType::Small, KERNEL_VIRT, 0x4_2000, PageProperties::KERNEL_DATA, false)
            .unwrap();
        mapper
            .map(PageType::Small, KERNEL_VIRT, 0x9_9000, PageProperties::KERNEL_DATA, true)
            .unwrap();

        assert_eq!(mapper.translate(KERNEL_VIRT), Some(0x9_9000));
    }

    #[test]
    fn huge_pages_translate_with_their_own_offsets() {
        let mut arena = PhysArena::new(16);
        let direct_map = arena.direct_map();
        let root = arena_root(&mut arena);
        let mut mapper = PageMapper::new(root, direct_map, &mut arena);

        mapper
            .map(PageType::Medium, 0xFFFF_8000_0020_0000, 0x60_0000, PageProperties::KERNEL_DATA, false)
            .unwrap();
        mapper
            .map(PageType::Large, 0xFFFF_8001_0000_0000, 0x8000_0000, PageProperties::KERNEL_DATA, false)
            .unwrap();

        assert_eq!(mapper.translate(0xFFFF_8000_0021_2345), Some(0x61_2345));
        assert_eq!(mapper.translate(0xFFFF_8001_1234_5678), Some(0x9234_5678));
    }

    #[test]
    fn huge_page_in_the_way_is_already_mapped() {
        let mut arena = PhysArena::new(16);
        let direct_map = arena.direct_map();
        let root = arena_root(&mut arena);
        let mut mapper = PageMapper::new(root, direct_map, &mut arena);

        mapper
            .map(PageType::Medium, 0xFFFF_8000_0020_0000, 0x60_0000, PageProperties::KERNEL_DATA, false)
            .unwrap();

        assert_eq!(
            mapper.map(PageType::Small, 0xFFFF_8000_0020_3000, 0x1000, PageProperties::KERNEL_DATA, false),
            Err(MapError::AlreadyMapped)
        );
        assert_eq!(mapper.translate(0xFFFF_8000_0020_3000), Some(0x60_3000));
    }

    #[test]
    fn overwriting_inside_a_huge_page_splits_it() {
        let mut arena = PhysArena::new(16);
        let direct_map = arena.direct_map();
        let root = arena_root(&mut arena);
        let mut mapper = PageMapper::new(root, direct_map, &mut arena);

        mapper
            .map(PageType::Medium, 0xFFFF_8000_0020_0000, 0x60_0000, PageProperties::KERNEL_DATA, false)
            .unwrap();
        mapper
            .map(PageType::Small, 0xFFFF_8000_0020_3000, 0x1000, PageProperties::KERNEL_DATA, true)
            .unwrap();

        assert_eq!(mapper.translate(0xFFFF_8000_0020_3010), Some(0x1010));
        assert_eq!(mapper.translate(0xFFFF_8000_0020_4000), Some(0x60_4000));
        assert_eq!(mapper.translate(0xFFFF_8000_0020_0000), Some(0x60_0000));
        assert_eq!(mapper.translate(0xFFFF_8000_003F_F008), Some(0x7F_F008));
    }

    #[test]
    fn overwriting_inside_a_large_page_keeps_medium_neighbours() {
        let mut arena = PhysArena::new(16);
        let direct_map = arena.direct_map();
        let root = arena_root(&mut arena);
        let mut mapper = PageMapper::new(root, direct_map, &mut arena);

        mapper
            .map(PageType::Large, 0xFFFF_8000_4000_0000, 0x4000_0000, PageProperties::KERNEL_DATA, false)
            .unwrap();
        mapper
            .map(PageType::Small, 0xFFFF_8000_4020_3000, 0x2000, PageProperties::KERNEL_DATA, true)
            .unwrap();

        assert_eq!(mapper.translate(0xFFFF_8000_4020_3000), Some(0x2000));
        assert_eq!(mapper.translate(0xFFFF_8000_4020_4000), Some(0x4020_4000));
        assert_eq!(mapper.translate(0xFFFF_8000_7FE0_0010), Some(0x7FE0_0010));
    }

    #[test]
    #[should_panic(expected = "misaligned")]
    fn misaligned_mapping_panics() {
        let mut arena = PhysArena::new(16);
        let direct_map = arena.direct_map();
        let root = arena_root(&mut arena);
        let mut mapper = PageMapper::new(root, direct_map, &mut arena);

        let _ = mapper.map(
            PageType::Medium,
            0xFFFF_8000_0020_1000,
            0x60_0000,
            PageProperties::KERNEL_DATA,
            false,
        );
    }

    #[test]
    fn fresh_tables_are_zeroed() {
        let mut arena = PhysArena::new(16);
        let direct_map = arena.direct_map();
        let root = arena_root(&mut arena);

        {
            let mut mapper = PageMapper::new(root, direct_map, &mut arena);
            mapper
                .map(PageType::Small, KERNEL_VIRT, 0x4_2000, PageProperties::KERNEL_DATA, false)
                .unwrap();
        }

        // Root plus P3, P2 and P1.
        assert_eq!(arena.allocated(), 4);

        let root_table = unsafe { &*direct_map.ptr::<PageTable>(root) };
        let present = root_table
            .kernel_half()
            .iter()
            .chain(root_table.user_half())
            .filter(|entry| entry.is_present())
            .count();

        assert_eq!(present, 1);
        assert_eq!(translate(root, direct_map, KERNEL_VIRT + SMALL_PAGE_SIZE), None);
        assert_eq!(translate(root, direct_map, KERNEL_VIRT + MEDIUM_PAGE_SIZE), None);
    }

    #[test]
    fn out_of_frames_is_reported() {
        let mut arena = PhysArena::new(16);
        let direct_map = arena.direct_map();
        let root = arena_root(&mut arena);

        arena.limit_to(2);

        let mut mapper = PageMapper::new(root, direct_map, &mut arena);

        assert_eq!(
            mapper.map(PageType::Small, KERNEL_VIRT, 0x4_2000, PageProperties::KERNEL_DATA, false),
            Err(MapError::OutOfFrames)
        );
        assert_eq!(mapper.translate(KERNEL_VIRT), None);
    }

    #[test]
    fn map_direct_returns_the_window_address_of_the_byte() {
        let mut arena = PhysArena::new(16);
        let direct_map = arena.direct_map();
        let root = arena_root(&mut arena);
        let mut mapper = PageMapper::new(root, direct_map, &mut arena);

        let virt = mapper
            .map_direct(PageType::Small, 0xFEE0_0020, PageProperties::MMIO)
            .unwrap();

        assert_eq!(virt, direct_map.to_virt(0xFEE0_0020));
        assert_eq!(mapper.translate(virt), Some(0xFEE0_0020));
        assert_eq!(
            mapper.map_direct(PageType::Small, 0xFEE0_0000, PageProperties::MMIO),
            Ok(direct_map.to_virt(0xFEE0_0000))
        );
    }

    #[test]
    fn copied_kernel_half_is_identical_and_user_half_untouched() {
        let mut arena = PhysArena::new(16);
        let direct_map = arena.direct_map();
        let src = arena_root(&mut arena);
        let dest = arena_root(&mut arena);

        {
            let mut mapper = PageMapper::new(src, direct_map, &mut arena);
            mapper
                .map(PageType::Small, KERNEL_VIRT, 0x4_2000, PageProperties::KERNEL_DATA, false)
                .unwrap();
            mapper
                .map(PageType::Small, 0x40_0000, 0x5_0000, PageProperties::USER, false)
                .unwrap();
        }

        let (src_table, dest_table) = unsafe {
            (
                &*direct_map.ptr::<PageTable>(src),
                &mut *direct_map.ptr::<PageTable>(dest),
            )
        };

        copy_kernel_tables(dest_table, src_table);

        assert_eq!(dest_table.kernel_half(), src_table.kernel_half());
        assert!(dest_table.user_half().iter().all(|entry| !entry.is_present()));
        assert_eq!(translate(dest, direct_map, KERNEL_VIRT), Some(0x4_2000));
        assert_eq!(translate(dest, direct_map, 0x40_0000), None);
    }
}
