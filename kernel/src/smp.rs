//! Multiprocessor bring-up.
//!
//! The bootstrap core prepares every application core (stack, page-table root, hand-off
//! record) and releases it; each core then runs [`bring_up_core`] on its own, touching only the
//! memory it was given. The bootstrap core runs the same path for itself last.

use core::{
    fmt,
    sync::atomic::{Ordering, fence},
};

use log::{debug, error, info, warn};
use spin::Mutex;

use crate::{
    arch::{self, ModelSpecificRegister},
    boot::BootDescriptor,
    config::{AP_STACK_PAGES, PAT_VALUE, SPURIOUS_VECTOR, TIMER_PERIOD_MS, TIMER_VECTOR},
    gdt::SELECTORS,
    interrupts::GateOptions,
    local_apic::{self, LocalApic, ReferenceClock},
    memory::{DirectMap, FrameAllocator, align_down},
    paging::{self, SMALL_PAGE_SIZE},
    percpu::{self, CoreRegistry, CoreState},
    task::TaskId,
};

const EFER_SYSCALL_ENABLE: u64 = 1 << 0;
const EFER_NO_EXECUTE_ENABLE: u64 = 1 << 11;

/// SYSCALL loads CS from bits 32..48; SYSRET derives the user selectors from bits 48..64.
const STAR_VALUE: u64 = (SELECTORS.code as u64) << 32 | (SELECTORS.data as u64 | 3) << 48;

/// RFLAGS bits cleared on SYSCALL: TF, IF, DF and AC.
const SFMASK_VALUE: u64 = 1 << 8 | 1 << 9 | 1 << 10 | 1 << 18;

/// What an application core needs before it can run any Rust code of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct HandoffRecord {
    pub core_id: usize,
    /// Physical address of the page-table root to activate.
    pub root: u64,
}

/// A core the bootloader holds in a wait loop.
pub trait ParkedCpu {
    fn lapic_id(&self) -> u32;

    /// Hands `argument` to the core and lets it jump to the kernel's secondary entry point.
    /// The entry point must be published with a sequentially consistent store, after every
    /// write the core depends on.
    fn release(&self, argument: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpError {
    MissingRegistryEntry(usize),
    StackAllocation,
    RootAllocation,
}

impl fmt::Display for BringUpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BringUpError::MissingRegistryEntry(core_id) => {
                write!(f, "core {core_id} has no registry entry")
            }
            BringUpError::StackAllocation => f.write_str("could not allocate a stack"),
            BringUpError::RootAllocation => f.write_str("could not allocate a page-table root"),
        }
    }
}

/// Prepares and releases every application core. Returns how many were released.
///
/// Core ids are handed out in the bootloader's order, starting at 1. A core whose resources
/// cannot be allocated stays parked; the others are unaffected.
pub fn dispatch_secondaries<P: ParkedCpu>(
    descriptor: &BootDescriptor,
    registry: &'static CoreRegistry,
    direct_map: DirectMap,
    frames: &mut impl FrameAllocator,
    cpus: impl IntoIterator<Item = P>,
) -> usize {
    if !descriptor.mark_smp_started() {
        error!("secondary cores were already dispatched");
        return 0;
    }

    let mut next_core_id = 1;
    let mut released = 0;

    for cpu in cpus {
        let lapic_id = cpu.lapic_id();

        if lapic_id == descriptor.bsp_lapic_id() || !descriptor.lapic_ids().contains(&lapic_id) {
            continue;
        }

        let core_id = next_core_id;
        next_core_id += 1;

        match prepare_core(core_id, lapic_id, registry, direct_map, frames) {
            Ok(record) => {
                // Stack, root and registry entry must be visible before the core can run.
                fence(Ordering::SeqCst);
                cpu.release(record);
                released += 1;

                debug!("released core {core_id} (lapic {lapic_id})");
            }
            Err(error) => error!("core {core_id} (lapic {lapic_id}) stays parked: {error}"),
        }
    }

    info!("released {released} of {} secondary cores", registry.len() - 1);

    released
}

/// Allocates a stack and root for `core_id` and writes its hand-off record at the top of the
/// stack. Returns the record's virtual address, which is also the core's first stack pointer.
fn prepare_core(
    core_id: usize,
    lapic_id: u32,
    registry: &CoreRegistry,
    direct_map: DirectMap,
    frames: &mut impl FrameAllocator,
) -> Result<u64, BringUpError> {
    let core = registry
        .get(core_id)
        .ok_or(BringUpError::MissingRegistryEntry(core_id))?;

    let stack = frames
        .allocate_pages(AP_STACK_PAGES)
        .ok_or(BringUpError::StackAllocation)?;
    let root = match paging::new_root(frames, direct_map) {
        Ok(root) => root,
        Err(_) => {
            frames.free_pages(stack, AP_STACK_PAGES);
            return Err(BringUpError::RootAllocation);
        }
    };

    core.set_lapic_id(lapic_id);
    core.set_pagemap(root);
    paging::sync(registry, direct_map, core_id, 0);

    let stack_top = direct_map.to_virt(stack + AP_STACK_PAGES as u64 * SMALL_PAGE_SIZE);
    let record = align_down(stack_top - size_of::<HandoffRecord>() as u64, 16);

    // SAFETY: the stack was just allocated for this core and nothing else refers to it.
    unsafe { (record as *mut HandoffRecord).write(HandoffRecord { core_id, root }) };

    Ok(record)
}

/// Reads the hand-off record at `address`.
///
/// # Safety
///
/// `address` must be what [`dispatch_secondaries`] gave this core.
pub unsafe fn take_handoff(address: u64) -> HandoffRecord {
    unsafe { (address as *const HandoffRecord).read() }
}

/// Programs the page attribute table and the fast system call MSRs.
fn configure_msrs() {
    // SAFETY: the PAT keeps WB in entry 0 so existing mappings keep their memory type, and
    // the syscall MSRs only matter once user mode exists.
    unsafe {
        ModelSpecificRegister::Pat.write(PAT_VALUE);

        let efer = ModelSpecificRegister::Efer.read();
        ModelSpecificRegister::Efer.write(efer | EFER_SYSCALL_ENABLE | EFER_NO_EXECUTE_ENABLE);

        ModelSpecificRegister::Star.write(STAR_VALUE);
        ModelSpecificRegister::SfMask.write(SFMASK_VALUE);
    }
}

/// The per-core bring-up path, run by every core on itself.
///
/// The order matters: the address space first, then the core pointer (everything after it
/// logs with a core id and finds state through it), then the tables, then the timer. The timer
/// is calibrated against `clock`, which cores take turns on.
///
/// # Panics
///
/// If `record` names a core the registry does not have.
pub fn bring_up_core(
    record: HandoffRecord,
    registry: &'static CoreRegistry,
    direct_map: DirectMap,
    clock: &Mutex<impl ReferenceClock>,
) -> &'static CoreState {
    // SAFETY: the root's kernel half is a copy of core 0's, which maps this code, the direct
    // map and therefore the stack we are on.
    unsafe { arch::write_page_table_root(record.root) };

    let core = registry
        .get(record.core_id)
        .unwrap_or_else(|| panic!("hand-off names unknown core {}", record.core_id));

    percpu::set_current(core);
    configure_msrs();

    core.allocate_buffers();
    core.install_descriptors();

    let interrupt_table = core
        .interrupt_table()
        .expect("the interrupt table was just allocated");

    interrupt_table.init(arch::interrupt_stubs());
    interrupt_table.install();

    core.create_ready_queue();
    core.push_task(TaskId::idle(core.id()));

    // SAFETY: the bootstrap core mapped the local APIC page before any core was released.
    let local_apic = core.set_local_apic(unsafe { LocalApic::current(direct_map) });

    local_apic.enable(SPURIOUS_VECTOR);
    interrupt_table.register(TIMER_VECTOR, local_apic::handle_timer_tick, GateOptions::new());
    interrupt_table.register(SPURIOUS_VECTOR, local_apic::handle_spurious, GateOptions::new());

    let ticks_per_ms = local_apic.calibrate(&mut *clock.lock());

    if ticks_per_ms == 0 {
        warn!("timer calibration measured no ticks, using the fallback count");
    } else {
        info!("timer: {ticks_per_ms} ticks per ms");
    }

    local_apic.start_timer(
        TIMER_VECTOR,
        local_apic::timer_initial_count(ticks_per_ms, TIMER_PERIOD_MS),
    );

    info!("online (lapic {}, root {:#x})", core.lapic_id(), record.root);

    core
}

/// Runs the bring-up path on the bootstrap core, which was set up before the registry existed.
pub fn bring_up_bootstrap(
    registry: &'static CoreRegistry,
    direct_map: DirectMap,
    clock: &Mutex<impl ReferenceClock>,
) -> &'static CoreState {
    let bootstrap = registry.get(0).expect("the registry has no core 0");

    bring_up_core(
        HandoffRecord {
            core_id: 0,
            root: bootstrap.pagemap(),
        },
        registry,
        direct_map,
        clock,
    )
}

/// The idle task: wait for interrupts forever.
pub fn idle() -> ! {
    arch::interrupts::enable();

    loop {
        arch::interrupts::wait_for_interrupts();
    }
}
