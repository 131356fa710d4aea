//! Privileged-instruction layer.
//!
//! On the bare-metal target this is real x86_64 code. Everywhere else (unit tests on the host)
//! a hosted backend with the same surface is selected, in which every host thread plays the
//! part of one core and its control registers are thread-local.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use x86_64::*;

#[cfg(not(target_os = "none"))]
mod hosted;
#[cfg(not(target_os = "none"))]
pub use hosted::*;

/// Operand of `lgdt` / `lidt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed(2))]
pub struct DescriptorTableRegister {
    pub size: u16,
    pub address: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum ModelSpecificRegister {
    ApicBase = 0x0000_001B,
    Pat = 0x0000_0277,
    Efer = 0xC000_0080,
    Star = 0xC000_0081,
    SfMask = 0xC000_0084,
    GsBase = 0xC000_0101,
    KernelGsBase = 0xC000_0102,
}

/// Selectors reloaded after a new GDT is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSelectors {
    pub code: u16,
    pub data: u16,
    pub tss: u16,
}

/// Where the low-level interrupt entry stubs live: stub `n` starts at `base + n * stride`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubLayout {
    pub base: u64,
    pub stride: u64,
}

impl StubLayout {
    pub const fn stub(&self, vector: u8) -> u64 {
        self.base + vector as u64 * self.stride
    }
}
