//! Compile-time configuration.

use log::LevelFilter;

/// Upper bound on logical cores; extra cores reported by the bootloader are left parked.
pub const MAX_CORES: usize = 64;

/// Memory-map entries kept by the boot descriptor; the rest are dropped with a warning.
pub const MEMORY_MAP_CAPACITY: usize = 256;

pub const READY_QUEUE_CAPACITY: usize = 512;

/// Base of the direct-mapped window when the bootloader does not report one.
pub const DIRECT_MAP_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Stack given to the bootstrap core by Limine.
pub const BOOT_STACK_SIZE: u64 = 0x10_0000;

/// Small pages backing each application core's first stack.
pub const AP_STACK_PAGES: usize = 16;

pub const DOUBLE_FAULT_STACK_SIZE: usize = 20 * 1024;

pub const TIMER_VECTOR: u8 = 32;
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// Milliseconds between two timer interrupts on every core.
pub const TIMER_PERIOD_MS: u32 = 20;

/// How long the local APIC timer is measured against the reference clock.
pub const CALIBRATION_MS: u32 = 10;

/// Local APIC timer reload value (divide-by-16 clock) when calibration measures nothing.
pub const FALLBACK_TIMER_INITIAL_COUNT: u32 = 0x19_FBD0;

/// PAT entries: WB, WC, UC-, UC, repeated for the upper half.
pub const PAT_VALUE: u64 = 0x0007_0106_0007_0106;

pub const LOG_LEVEL: LevelFilter = if cfg!(feature = "verbose_logging") {
    LevelFilter::Trace
} else {
    LevelFilter::Info
};
