#![no_std]
#![no_main]

use core::arch::asm;

use limine::mp::Cpu;
use log::{error, info};

use sunrise::{
    acpi::{self, Rsdp, RootTable, SdtHeader},
    arch::{self, pic, pit::PIT},
    boot::{self, BootDescriptor},
    config::LOG_LEVEL,
    local_apic::LocalApic,
    logger,
    memory::{self, DirectMap, HeapFrames, PAGE_ALLOCATOR, align_down},
    paging::{self, PageProperties, PageType, SMALL_PAGE_SIZE, table::PageTable},
    percpu::{self, BOOTSTRAP_CORE, CoreRegistry},
    smp,
};

pub mod panic;
pub mod requests;
pub mod serial;

/// Initialize bootstrap processor
#[unsafe(no_mangle)]
extern "C" fn init_bsp() -> ! {
    if !requests::BASE_REVISION.is_supported() {
        panic!("limine bootloader does not support our requested base revision");
    }

    arch::interrupts::disable();
    pic::disable();

    // Every log line looks up the current core, so the pointer goes in before the logger.
    percpu::set_current(&BOOTSTRAP_CORE);
    logger::init(serial::write, LOG_LEVEL).expect("the logger was set up twice");

    let descriptor = BootDescriptor::new(&requests::LimineBoot)
        .unwrap_or_else(|error| panic!("unusable boot information: {error}"));
    let descriptor = boot::install(descriptor);

    descriptor.log_summary();

    memory::init(descriptor);

    let direct_map = memory::direct_map();

    BOOTSTRAP_CORE.set_lapic_id(descriptor.bsp_lapic_id());

    // Anything mapped into Limine's tables now ends up in every core's kernel half.
    map_range(LocalApic::phys_base(), SMALL_PAGE_SIZE, PageProperties::MMIO);
    map_acpi_tables(descriptor, direct_map);

    let mut frames = HeapFrames::new(&PAGE_ALLOCATOR, direct_map);
    let root = paging::new_root(&mut frames, direct_map)
        .unwrap_or_else(|error| panic!("could not allocate core 0's page tables: {error}"));

    // SAFETY: both roots are page tables reached through the direct map, and the new one is not
    // active yet.
    unsafe {
        paging::copy_kernel_tables(
            &mut *direct_map.ptr::<PageTable>(root),
            &*direct_map.ptr::<PageTable>(arch::read_page_table_root()),
        );
    }

    BOOTSTRAP_CORE.set_pagemap(root);

    let registry = percpu::install(CoreRegistry::create(
        &BOOTSTRAP_CORE,
        descriptor.core_count(),
    ));

    smp::dispatch_secondaries(
        descriptor,
        registry,
        direct_map,
        &mut frames,
        requests::parked_cpus(),
    );

    smp::bring_up_bootstrap(registry, direct_map, &PIT);

    descriptor.report_warnings();

    smp::idle()
}

/// Initialize application processor (the entry point which `smp::dispatch_secondaries`
/// directs the application processors into)
pub extern "C" fn init_ap(cpu: &Cpu) -> ! {
    let record = cpu.extra.load(core::sync::atomic::Ordering::Relaxed);

    // The hand-off record sits at the top of the stack prepared for this core.
    // SAFETY: `record` is 16-byte aligned and below it lies this core's unused stack.
    unsafe {
        asm!(
            "mov rsp, {stack}",
            "xor ebp, ebp",
            "call {main}",
            "ud2",
            stack = in(reg) record,
            main = sym ap_main,
            in("rdi") record,
            options(noreturn),
        );
    }
}

extern "C" fn ap_main(record: u64) -> ! {
    percpu::clear_current();

    // SAFETY: `record` is the address the bootstrap core released us with.
    let record = unsafe { smp::take_handoff(record) };

    smp::bring_up_core(record, percpu::registry(), memory::direct_map(), &PIT);
    smp::idle()
}

/// Maps `[phys, phys + length)` into the direct map of the active root.
fn map_range(phys: u64, length: u64, properties: PageProperties) {
    for page in (align_down(phys, SMALL_PAGE_SIZE)..phys + length).step_by(SMALL_PAGE_SIZE as usize)
    {
        if let Err(error) = paging::map_direct(PageType::Small, page, properties) {
            panic!("could not map {page:#x} into the direct map: {error}");
        }
    }
}

/// Maps a whole ACPI table, reading its length from the header.
fn map_acpi_table(phys: u64, direct_map: DirectMap) {
    map_range(phys, size_of::<SdtHeader>() as u64, PageProperties::KERNEL_DATA);

    let length = acpi::read_header(phys, direct_map).length;

    map_range(phys, u64::from(length), PageProperties::KERNEL_DATA);
}

/// Makes the RSDP, the root table and every table it lists reachable through the direct map,
/// and logs their signatures.
fn map_acpi_tables(descriptor: &BootDescriptor, direct_map: DirectMap) {
    let rsdp = descriptor.rsdp_address();

    map_range(rsdp, size_of::<Rsdp>() as u64, PageProperties::KERNEL_DATA);

    let root = match RootTable::from_rsdp(rsdp, direct_map) {
        Ok(root) => root,
        Err(error) => {
            error!("acpi: {error}");
            return;
        }
    };

    map_acpi_table(root.address(), direct_map);

    for table in root.tables(direct_map) {
        map_acpi_table(table, direct_map);
    }

    let result = descriptor.iterate_acpi_tables(direct_map, |table, header| {
        info!("acpi: {} at {table:#x}", header.signature());
    });

    if let Err(error) = result {
        error!("acpi: {error}");
    }
}
