//! Per-core global descriptor tables. Every core gets its own GDT and TSS, so loading the task
//! register on one core never trips over the busy bit another core set.

use alloc::{boxed::Box, vec};

use bit_field::BitField;

use crate::{
    arch::{self, DescriptorTableRegister, SegmentSelectors},
    config::DOUBLE_FAULT_STACK_SIZE,
    tss::TaskStateSegment,
};

/// Interrupt stack (0-based TSS slot) the double-fault gate switches to.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

pub const SELECTORS: SegmentSelectors = SegmentSelectors {
    code: 0x08,
    data: 0x10,
    tss: 0x28,
};

#[derive(Debug, PartialEq)]
pub struct GlobalDescriptorTable<const MAX: usize = 8> {
    table: [Entry; MAX],
    len: usize,
}

impl<const MAX: usize> GlobalDescriptorTable<MAX> {
    pub const fn empty() -> Self {
        Self {
            table: [Entry(0); MAX],
            len: 1,
        }
    }

    /// Appends a descriptor and returns its selector.
    pub const fn push(&mut self, descriptor: Descriptor) -> u16 {
        let index = self.len;

        match descriptor {
            Descriptor::UserSegment(value) => {
                self.table[self.len] = Entry(value);
                self.len += 1;
            }

            Descriptor::SystemSegment(value_low, value_high) => {
                self.table[self.len] = Entry(value_low);
                self.len += 1;
                self.table[self.len] = Entry(value_high);
                self.len += 1;
            }
        }

        (index * size_of::<Entry>()) as u16
    }

    pub fn register(&'static self) -> DescriptorTableRegister {
        DescriptorTableRegister {
            address: self.table.as_ptr() as u64,
            size: (self.len * size_of::<Entry>() - 1) as u16,
        }
    }

    fn entry(&self, selector: u16) -> u64 {
        self.table[selector as usize / size_of::<Entry>()].0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(transparent)]
struct Entry(u64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Descriptor {
    UserSegment(u64),
    SystemSegment(u64, u64),
}

/// Bits of a code or data segment descriptor. Base and limit are ignored in long mode, but the
/// limit is kept at its maximum so the descriptors stay valid in compatibility mode.
mod descriptor_flags {
    pub const ACCESSED: u64 = 1 << 40;
    /// Readable for code, writable for data.
    pub const READ_WRITE: u64 = 1 << 41;
    pub const EXECUTABLE: u64 = 1 << 43;
    /// Code or data, as opposed to a system descriptor.
    pub const NON_SYSTEM: u64 = 1 << 44;
    pub const RING_3: u64 = 3 << 45;
    pub const PRESENT: u64 = 1 << 47;
    pub const LONG_MODE: u64 = 1 << 53;
    pub const SIZE_32: u64 = 1 << 54;
    pub const LIMIT_IN_PAGES: u64 = 1 << 55;

    const MAX_LIMIT: u64 = 0xFFFF | 0xF << 48;

    const SEGMENT: u64 =
        NON_SYSTEM | PRESENT | READ_WRITE | ACCESSED | MAX_LIMIT | LIMIT_IN_PAGES;

    pub const KERNEL_CODE: u64 = SEGMENT | LONG_MODE | EXECUTABLE;
    pub const KERNEL_DATA: u64 = SEGMENT | SIZE_32;
    pub const USER_CODE: u64 = KERNEL_CODE | RING_3;
    pub const USER_DATA: u64 = KERNEL_DATA | RING_3;
}

impl Descriptor {
    #[inline]
    pub const fn kernel_code_segment() -> Descriptor {
        Descriptor::UserSegment(descriptor_flags::KERNEL_CODE)
    }

    #[inline]
    pub const fn kernel_data_segment() -> Descriptor {
        Descriptor::UserSegment(descriptor_flags::KERNEL_DATA)
    }

    #[inline]
    pub const fn user_code_segment() -> Descriptor {
        Descriptor::UserSegment(descriptor_flags::USER_CODE)
    }

    #[inline]
    pub const fn user_data_segment() -> Descriptor {
        Descriptor::UserSegment(descriptor_flags::USER_DATA)
    }

    pub fn task_state_segment(tss: &'static TaskStateSegment) -> Descriptor {
        let ptr = tss as *const _ as u64;

        let mut low = descriptor_flags::PRESENT;
        let mut high = 0;

        // address
        low.set_bits(16..40, ptr.get_bits(0..24));
        low.set_bits(56..64, ptr.get_bits(24..32));
        high.set_bits(0..32, ptr.get_bits(32..64));

        // size
        low.set_bits(0..16, (size_of::<TaskStateSegment>() - 1) as u64);

        // type (0b1001 means 64-bit available tss)
        low.set_bits(40..44, 0b1001);

        Descriptor::SystemSegment(low, high)
    }
}

/// One core's GDT and the TSS it points at.
#[derive(Debug, Clone, Copy)]
pub struct CoreDescriptors {
    pub gdt: &'static GlobalDescriptorTable,
    pub tss: &'static TaskStateSegment,
}

impl CoreDescriptors {
    /// Builds a GDT and TSS with a fresh double-fault stack. Both live for the rest of the run.
    pub fn new() -> Self {
        let stack = Box::leak(vec![0u8; DOUBLE_FAULT_STACK_SIZE].into_boxed_slice());
        let stack_top = (stack.as_ptr_range().end as u64) & !0xF;

        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = stack_top;
        let tss: &'static TaskStateSegment = Box::leak(Box::new(tss));

        let mut gdt = GlobalDescriptorTable::empty();

        gdt.push(Descriptor::kernel_code_segment()); // 0x08
        gdt.push(Descriptor::kernel_data_segment()); // 0x10
        // User data sits below user code so SYSRET can derive both from one STAR field.
        gdt.push(Descriptor::user_data_segment()); // 0x18
        gdt.push(Descriptor::user_code_segment()); // 0x20
        gdt.push(Descriptor::task_state_segment(tss)); // 0x28

        Self {
            gdt: Box::leak(Box::new(gdt)),
            tss,
        }
    }

    /// Loads the GDT and task register on the calling core.
    pub fn install(&self) {
        // SAFETY: both tables are leaked, so they outlive the core, and `SELECTORS` matches the
        // push order in `new`.
        unsafe { arch::load_gdt(&self.gdt.register(), SELECTORS) }
    }
}

impl Default for CoreDescriptors {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_follow_push_order() {
        let mut gdt = GlobalDescriptorTable::<8>::empty();

        assert_eq!(gdt.push(Descriptor::kernel_code_segment()), SELECTORS.code);
        assert_eq!(gdt.push(Descriptor::kernel_data_segment()), SELECTORS.data);
        gdt.push(Descriptor::user_data_segment());
        gdt.push(Descriptor::user_code_segment());
        assert_eq!(gdt.push(Descriptor::SystemSegment(0, 0)), SELECTORS.tss);
    }

    #[test]
    fn tss_descriptor_points_at_the_tss() {
        let descriptors = CoreDescriptors::new();
        let low = descriptors.gdt.entry(SELECTORS.tss);
        let high = descriptors.gdt.entry(SELECTORS.tss + 8);

        let mut address = 0u64;
        address.set_bits(0..24, low.get_bits(16..40));
        address.set_bits(24..32, low.get_bits(56..64));
        address.set_bits(32..64, high.get_bits(0..32));

        assert_eq!(address, descriptors.tss as *const _ as u64);
        assert_eq!(low.get_bits(40..44), 0b1001);
    }

    #[test]
    fn every_core_gets_its_own_double_fault_stack() {
        let first = CoreDescriptors::new();
        let second = CoreDescriptors::new();

        let first_top = first.tss.interrupt_stack(DOUBLE_FAULT_IST_INDEX as usize);
        let second_top = second.tss.interrupt_stack(DOUBLE_FAULT_IST_INDEX as usize);

        assert_eq!(first_top % 16, 0);
        assert!(first_top.abs_diff(second_top) >= DOUBLE_FAULT_STACK_SIZE as u64 - 16);
    }

    #[test]
    fn install_loads_the_table_with_kernel_selectors() {
        let descriptors = CoreDescriptors::new();

        descriptors.install();

        let (register, selectors) = arch::loaded_gdt().unwrap();

        assert_eq!(register, descriptors.gdt.register());
        assert_eq!(register.size, 7 * 8 - 1);
        assert_eq!(selectors, SELECTORS);
    }
}
