//! Early boot and multiprocessor bring-up for an x86_64 kernel booted by Limine.
//!
//! The binary owns everything Limine-specific and drives this library: it builds the
//! [`boot::BootDescriptor`], sets up the heap, prepares core 0, then hands every other core to
//! [`smp::dispatch_secondaries`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod acpi;
pub mod allocators;
pub mod arch;
pub mod boot;
pub mod config;
pub mod gdt;
pub mod interrupts;
pub mod local_apic;
pub mod logger;
pub mod memory;
pub mod paging;
pub mod percpu;
pub mod smp;
pub mod task;
pub mod tss;

#[cfg(test)]
mod testing;
