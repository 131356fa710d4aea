use core::arch::asm;

use crate::arch::ModelSpecificRegister;

impl ModelSpecificRegister {
    pub fn read(self) -> u64 {
        let value_low: u32;
        let value_high: u32;

        unsafe {
            asm!(
                "rdmsr",
                in("ecx") self as u32,
                out("eax") value_low,
                out("edx") value_high,
                options(nomem, nostack, preserves_flags),
            );
        }

        (u64::from(value_high) << 32) | u64::from(value_low)
    }

    /// # Safety
    ///
    /// Model-specific registers control paging, segmentation and system-call entry; the caller
    /// must know the value is valid for the register.
    pub unsafe fn write(self, value: u64) {
        let value_low = value as u32;
        let value_high = (value >> 32) as u32;

        unsafe {
            asm!(
                "wrmsr",
                in("ecx") self as u32,
                in("eax") value_low,
                in("edx") value_high,
                options(nostack, preserves_flags),
            );
        }
    }
}
