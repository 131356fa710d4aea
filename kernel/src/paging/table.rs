use core::ops::{Index, IndexMut};

use bit_field::BitField;

use super::PageProperties;

pub const TABLE_ENTRY_COUNT: usize = 512;

/// First root-table slot of the kernel half (`0xffff_8000_0000_0000` and up).
pub const KERNEL_HALF_START: usize = TABLE_ENTRY_COUNT / 2;

#[derive(Debug, Clone)]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [Entry; TABLE_ENTRY_COUNT],
}

impl PageTable {
    pub fn clear(&mut self) {
        self.entries.fill(Entry(0));
    }

    pub fn kernel_half(&self) -> &[Entry] {
        &self.entries[KERNEL_HALF_START..]
    }

    pub fn kernel_half_mut(&mut self) -> &mut [Entry] {
        &mut self.entries[KERNEL_HALF_START..]
    }

    pub fn user_half(&self) -> &[Entry] {
        &self.entries[..KERNEL_HALF_START]
    }
}

impl Index<u16> for PageTable {
    type Output = Entry;

    fn index(&self, index: u16) -> &Self::Output {
        &self.entries[index as usize]
    }
}

impl IndexMut<u16> for PageTable {
    fn index_mut(&mut self, index: u16) -> &mut Self::Output {
        &mut self.entries[index as usize]
    }
}

/// Table indices a virtual address selects at each level, P4 (root) down to P1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableIndices {
    pub p1_index: u16,
    pub p2_index: u16,
    pub p3_index: u16,
    pub p4_index: u16,
}

impl PageTableIndices {
    /// Index used in a table of the given level (1..=4).
    pub const fn at(&self, level: u8) -> u16 {
        match level {
            1 => self.p1_index,
            2 => self.p2_index,
            3 => self.p3_index,
            _ => self.p4_index,
        }
    }
}

impl From<u64> for PageTableIndices {
    fn from(virt: u64) -> Self {
        Self {
            p1_index: ((virt >> 12) % 512) as u16,
            p2_index: ((virt >> 12 >> 9) % 512) as u16,
            p3_index: ((virt >> 12 >> 9 >> 9) % 512) as u16,
            p4_index: ((virt >> 12 >> 9 >> 9 >> 9) % 512) as u16,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Entry(u64);

impl Entry {
    pub const fn raw(&self) -> u64 {
        self.0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Get the physical address stored in this entry
    #[inline]
    pub fn get_phys(&self) -> u64 {
        self.0.get_bits(12..52) << 12
    }

    /// Set the physical address stored in this entry
    #[inline]
    pub fn set_phys(&mut self, phys: u64) -> &mut Entry {
        self.0.set_bits(12..52, phys >> 12);
        self
    }

    /// Whether the mapped frame or page table is loaded in memory.
    #[inline]
    pub fn is_present(&self) -> bool {
        self.0.get_bit(0)
    }

    #[inline]
    pub fn set_present(&mut self, is_present: bool) -> &mut Self {
        self.0.set_bit(0, is_present);
        self
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.0.get_bit(1)
    }

    /// Controls whether writes to the mapped frames are allowed.
    ///
    /// If this bit is unset in a level 1 page table entry, the mapped frame is read-only.
    /// If this bit is unset in a higher level page table entry the complete range of mapped
    /// pages is read-only.
    #[inline]
    pub fn set_writable(&mut self, is_writable: bool) -> &mut Self {
        self.0.set_bit(1, is_writable);
        self
    }

    /// Controls whether accesses from userspace (i.e. ring 3) are permitted.
    #[inline]
    pub fn set_user_accessible(&mut self, is_user_accessible: bool) -> &mut Self {
        self.0.set_bit(2, is_user_accessible);
        self
    }

    /// If this bit is set, a “write-through” policy is used for the cache, else a “write-back”
    /// policy is used.
    #[inline]
    pub fn set_write_through(&mut self, can_write_through: bool) -> &mut Self {
        self.0.set_bit(3, can_write_through);
        self
    }

    #[inline]
    pub fn set_cachability(&mut self, is_cachable: bool) -> &mut Self {
        // We do `!is_cachable` because enabling bit 4 disables the cachability
        self.0.set_bit(4, !is_cachable);
        self
    }

    /// Whether the entry maps a huge frame instead of a page table. Only allowed in
    /// P2 or P3 tables.
    #[inline]
    pub fn is_huge(&self) -> bool {
        self.0.get_bit(7)
    }

    #[inline]
    pub fn set_huge(&mut self, is_huge: bool) -> &mut Self {
        self.0.set_bit(7, is_huge);
        self
    }

    /// Indicates that the mapping is present in all address spaces, so it isn't flushed from
    /// the TLB on an address space switch.
    #[inline]
    pub fn set_global(&mut self, is_global: bool) -> &mut Self {
        self.0.set_bit(8, is_global);
        self
    }

    /// Whether code execution from the mapped frames is allowed.
    ///
    /// Can be only used when the no-execute page protection feature is enabled in the EFER
    /// register.
    #[inline]
    pub fn set_executability(&mut self, is_executable: bool) -> &mut Self {
        // We do `!is_executable` because enabling bit 63 disables the executability
        self.0.set_bit(63, !is_executable);
        self
    }

    pub fn set_properties(&mut self, properties: PageProperties) -> &mut Self {
        self.set_writable(properties.contains(PageProperties::WRITABLE))
            .set_user_accessible(properties.contains(PageProperties::USER))
            .set_write_through(properties.contains(PageProperties::WRITE_THROUGH))
            .set_cachability(!properties.contains(PageProperties::NO_CACHE))
            .set_global(properties.contains(PageProperties::GLOBAL))
            .set_executability(!properties.contains(PageProperties::NO_EXECUTE))
    }

    pub fn properties(&self) -> PageProperties {
        PageProperties::from_bits_truncate(self.0)
    }
}
