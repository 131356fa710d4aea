//! Hosted stand-in for the x86_64 layer, used when the library runs as an ordinary process.
//!
//! Each host thread is one core: its page-table root, core pointer, MSRs, loaded descriptor
//! tables and interrupt flag are thread-local. `halt` panics so a fatal path is observable.

extern crate std;

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use super::{DescriptorTableRegister, ModelSpecificRegister, SegmentSelectors, StubLayout};

/// Fake address of the stub table; only its arithmetic matters on the host.
pub const HOSTED_STUB_BASE: u64 = 0xFFFF_FFFF_8010_0000;

std::thread_local! {
    static PAGE_TABLE_ROOT: Cell<u64> = const { Cell::new(0) };
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(false) };
    static LOADED_IDT: Cell<Option<DescriptorTableRegister>> = const { Cell::new(None) };
    static LOADED_GDT: Cell<Option<(DescriptorTableRegister, SegmentSelectors)>> =
        const { Cell::new(None) };
    static MSRS: RefCell<BTreeMap<ModelSpecificRegister, u64>> = const { RefCell::new(BTreeMap::new()) };
}

pub mod interrupts {
    use super::{INTERRUPTS_ENABLED, std};

    pub fn disable() {
        INTERRUPTS_ENABLED.set(false);
    }

    pub fn enable() {
        INTERRUPTS_ENABLED.set(true);
    }

    pub fn wait_for_interrupts() {
        std::thread::yield_now();
    }

    pub fn are_enabled() -> bool {
        INTERRUPTS_ENABLED.get()
    }

    pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
        let were_enabled = are_enabled();

        disable();
        let result = f();
        INTERRUPTS_ENABLED.set(were_enabled);

        result
    }
}

impl ModelSpecificRegister {
    pub fn read(self) -> u64 {
        MSRS.with_borrow(|msrs| msrs.get(&self).copied().unwrap_or(0))
    }

    /// # Safety
    ///
    /// Mirrors the bare-metal signature; writing a hosted MSR is always sound.
    pub unsafe fn write(self, value: u64) {
        MSRS.with_borrow_mut(|msrs| msrs.insert(self, value));
    }
}

pub fn read_page_table_root() -> u64 {
    PAGE_TABLE_ROOT.get()
}

/// # Safety
///
/// Mirrors the bare-metal signature.
pub unsafe fn write_page_table_root(phys: u64) {
    PAGE_TABLE_ROOT.set(phys);
}

pub fn flush_page(_virt: u64) {}

/// # Safety
///
/// Mirrors the bare-metal signature.
pub unsafe fn load_idt(register: &DescriptorTableRegister) {
    LOADED_IDT.set(Some(*register));
}

/// # Safety
///
/// Mirrors the bare-metal signature.
pub unsafe fn load_gdt(register: &DescriptorTableRegister, selectors: SegmentSelectors) {
    LOADED_GDT.set(Some((*register, selectors)));
}

/// # Safety
///
/// Mirrors the bare-metal signature.
pub unsafe fn set_core_pointer(ptr: u64) {
    unsafe {
        ModelSpecificRegister::GsBase.write(ptr);
        ModelSpecificRegister::KernelGsBase.write(ptr);
    }
}

pub fn core_pointer() -> u64 {
    ModelSpecificRegister::GsBase.read()
}

pub fn interrupt_stubs() -> StubLayout {
    StubLayout {
        base: HOSTED_STUB_BASE,
        stride: 16,
    }
}

pub fn halt() -> ! {
    interrupts::disable();
    panic!("core halted");
}

/// The IDT register this thread last loaded.
pub fn loaded_idt() -> Option<DescriptorTableRegister> {
    LOADED_IDT.get()
}

/// The GDT register and selectors this thread last loaded.
pub fn loaded_gdt() -> Option<(DescriptorTableRegister, SegmentSelectors)> {
    LOADED_GDT.get()
}
