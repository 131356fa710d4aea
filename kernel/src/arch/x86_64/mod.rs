use core::arch::asm;

use super::{DescriptorTableRegister, ModelSpecificRegister, SegmentSelectors};

pub mod interrupts;
pub mod io_ports;
pub mod msr;
pub mod pic;
pub mod pit;
mod stubs;

pub use stubs::interrupt_stubs;

const CR3_ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Physical address of the page-table root this core is translating through.
#[inline]
pub fn read_page_table_root() -> u64 {
    let value: u64;

    unsafe {
        asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
    }

    value & CR3_ADDRESS_MASK
}

/// # Safety
///
/// `phys` must be the root of a page-table tree that maps the running code, the current stack
/// and the direct-mapped window.
#[inline]
pub unsafe fn write_page_table_root(phys: u64) {
    unsafe {
        asm!("mov cr3, {}", in(reg) phys, options(nostack, preserves_flags));
    }
}

#[inline]
pub fn flush_page(virt: u64) {
    unsafe {
        asm!("invlpg [{}]", in(reg) virt, options(nostack, preserves_flags));
    }
}

/// # Safety
///
/// The table described by `register` must stay alive and unmoved for as long as this core runs.
pub unsafe fn load_idt(register: &DescriptorTableRegister) {
    unsafe {
        asm!("lidt [{}]", in(reg) register, options(readonly, nostack, preserves_flags));
    }
}

/// Loads a GDT, reloads CS through a far return, reloads the data segments and the task
/// register. FS and GS are left alone so their base MSRs survive.
///
/// # Safety
///
/// The GDT must stay alive for as long as this core runs and `selectors` must index valid
/// descriptors in it.
pub unsafe fn load_gdt(register: &DescriptorTableRegister, selectors: SegmentSelectors) {
    unsafe {
        asm!(
            "lgdt [{register}]",
            "push {code}",
            "lea {return_address}, [rip + 2f]",
            "push {return_address}",
            "retfq",
            "2:",
            "mov ds, {data:x}",
            "mov es, {data:x}",
            "mov ss, {data:x}",
            "ltr {tss:x}",
            register = in(reg) register,
            code = in(reg) u64::from(selectors.code),
            return_address = out(reg) _,
            data = in(reg) selectors.data,
            tss = in(reg) selectors.tss,
        );
    }
}

/// Points both GS base registers at this core's state block.
///
/// # Safety
///
/// `ptr` must stay valid for the lifetime of the core.
pub unsafe fn set_core_pointer(ptr: u64) {
    unsafe {
        ModelSpecificRegister::GsBase.write(ptr);
        ModelSpecificRegister::KernelGsBase.write(ptr);
    }
}

/// The value last given to [`set_core_pointer`], or zero.
#[inline]
pub fn core_pointer() -> u64 {
    ModelSpecificRegister::GsBase.read()
}

/// Stops this core for good.
pub fn halt() -> ! {
    interrupts::disable();

    loop {
        interrupts::wait_for_interrupts();
    }
}
