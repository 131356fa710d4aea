//! Per-core state blocks and the registry indexing them by core id.
//!
//! A core finds its own block through the GS base register, so [`current`] is a single MSR
//! read with no lock. Entry 0 belongs to the bootstrap core and is a static, since it is
//! needed before the heap exists; the others are heap-allocated when the registry is created.

use core::{
    iter,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use alloc::boxed::Box;
use log::warn;
use spin::{Mutex, Once};

use crate::{
    arch::{self, interrupts::without_interrupts},
    gdt::CoreDescriptors,
    interrupts::{InterruptFrame, InterruptTable},
    local_apic::LocalApic,
    task::{ReadyQueue, TaskId},
};

/// State of the bootstrap core.
pub static BOOTSTRAP_CORE: CoreState = CoreState::new(0);

static REGISTRY: Once<CoreRegistry> = Once::new();

pub struct CoreState {
    id: usize,
    lapic_id: AtomicU32,
    /// Physical address of this core's page-table root; zero until assigned.
    pagemap: AtomicU64,
    current_task: AtomicU64,
    ticks: AtomicU64,
    /// Register snapshot of the last interrupt taken on this core.
    context: Once<Box<Mutex<InterruptFrame>>>,
    interrupt_table: Once<&'static InterruptTable>,
    ready_queue: Once<Mutex<Box<ReadyQueue>>>,
    descriptors: Once<CoreDescriptors>,
    local_apic: Once<LocalApic>,
}

impl CoreState {
    pub const fn new(id: usize) -> Self {
        Self {
            id,
            lapic_id: AtomicU32::new(0),
            pagemap: AtomicU64::new(0),
            current_task: AtomicU64::new(TaskId::NONE.pack()),
            ticks: AtomicU64::new(0),
            context: Once::new(),
            interrupt_table: Once::new(),
            ready_queue: Once::new(),
            descriptors: Once::new(),
            local_apic: Once::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn lapic_id(&self) -> u32 {
        self.lapic_id.load(Ordering::Acquire)
    }

    pub fn set_lapic_id(&self, lapic_id: u32) {
        self.lapic_id.store(lapic_id, Ordering::Release);
    }

    pub fn pagemap(&self) -> u64 {
        self.pagemap.load(Ordering::Acquire)
    }

    /// Only the bootstrap core may call this for another core, and only before that core
    /// starts.
    pub fn set_pagemap(&self, root: u64) {
        self.pagemap.store(root, Ordering::Release);
    }

    pub fn current_task(&self) -> TaskId {
        TaskId::unpack(self.current_task.load(Ordering::Relaxed))
    }

    pub fn set_current_task(&self, task: TaskId) {
        self.current_task.store(task.pack(), Ordering::Relaxed);
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Allocates the context buffer and the interrupt table. Later calls are no-ops.
    pub fn allocate_buffers(&self) {
        self.context
            .call_once(|| Box::new(Mutex::new(InterruptFrame::default())));
        self.interrupt_table
            .call_once(|| Box::leak(Box::new(InterruptTable::new())));
    }

    pub fn interrupt_table(&self) -> Option<&'static InterruptTable> {
        self.interrupt_table.get().copied()
    }

    /// Copies `frame` into the context buffer. A buffer that is being read is left alone
    /// rather than waited on, since this runs in interrupt context.
    pub fn save_context(&self, frame: &InterruptFrame) {
        if let Some(mut context) = self.context.get().and_then(|context| context.try_lock()) {
            *context = *frame;
        }
    }

    pub fn context(&self) -> Option<InterruptFrame> {
        self.context.get().map(|context| *context.lock())
    }

    /// Builds and loads this core's GDT and TSS. Must run on this core.
    pub fn install_descriptors(&self) -> CoreDescriptors {
        let descriptors = *self.descriptors.call_once(CoreDescriptors::new);

        descriptors.install();
        descriptors
    }

    pub fn descriptors(&self) -> Option<CoreDescriptors> {
        self.descriptors.get().copied()
    }

    pub fn create_ready_queue(&self) {
        self.ready_queue
            .call_once(|| Mutex::new(Box::new(ReadyQueue::new())));
    }

    /// Queues `task` on this core. If the queue was full, the oldest task is dropped and
    /// returned.
    ///
    /// # Panics
    ///
    /// If the ready queue has not been created.
    pub fn push_task(&self, task: TaskId) -> Option<TaskId> {
        let queue = self.ready_queue.get().expect("ready queue used before creation");
        let evicted = without_interrupts(|| queue.lock().push(task));

        if let Some(evicted) = evicted {
            warn!("ready queue of core {} is full, dropped task {evicted}", self.id);
        }

        evicted
    }

    pub fn pop_task(&self) -> Option<TaskId> {
        let queue = self.ready_queue.get()?;

        without_interrupts(|| queue.lock().pop())
    }

    pub fn queued_tasks(&self) -> usize {
        self.ready_queue
            .get()
            .map_or(0, |queue| without_interrupts(|| queue.lock().len()))
    }

    pub fn set_local_apic(&self, local_apic: LocalApic) -> LocalApic {
        *self.local_apic.call_once(|| local_apic)
    }

    pub fn local_apic(&self) -> Option<LocalApic> {
        self.local_apic.get().copied()
    }
}

/// Every core's state block, indexed by core id.
pub struct CoreRegistry {
    cores: Box<[&'static CoreState]>,
}

impl CoreRegistry {
    /// Installs `bootstrap` as entry 0 and allocates blank entries for cores `1..core_count`.
    ///
    /// # Panics
    ///
    /// If `bootstrap` does not have id 0.
    pub fn create(bootstrap: &'static CoreState, core_count: usize) -> Self {
        assert_eq!(bootstrap.id(), 0, "the bootstrap core must be core 0");

        let others = (1..core_count).map(|id| &*Box::leak(Box::new(CoreState::new(id))));

        Self {
            cores: iter::once(bootstrap).chain(others).collect(),
        }
    }

    pub fn get(&self, core_id: usize) -> Option<&'static CoreState> {
        self.cores.get(core_id).copied()
    }

    pub fn len(&self) -> usize {
        self.cores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static CoreState> + '_ {
        self.cores.iter().copied()
    }
}

/// Publishes the process-wide registry. Later calls keep the first one.
pub fn install(registry: CoreRegistry) -> &'static CoreRegistry {
    REGISTRY.call_once(|| registry)
}

pub fn registry() -> &'static CoreRegistry {
    REGISTRY
        .get()
        .expect("the core registry was used before percpu::install")
}

/// Points the calling core's GS base registers at `core`.
pub fn set_current(core: &'static CoreState) {
    // SAFETY: `core` is 'static.
    unsafe { arch::set_core_pointer(core as *const CoreState as u64) }
}

/// Zeroes the calling core's GS base registers, whatever the firmware or bootloader left there,
/// so [`try_current`] reports no state until [`set_current`] runs.
pub fn clear_current() {
    // SAFETY: zero is never dereferenced.
    unsafe { arch::set_core_pointer(0) }
}

/// The calling core's state, or `None` before [`set_current`] ran on it.
pub fn try_current() -> Option<&'static CoreState> {
    match arch::core_pointer() {
        0 => None,
        // SAFETY: only `set_current` writes a non-zero core pointer, always a 'static block.
        pointer => Some(unsafe { &*(pointer as *const CoreState) }),
    }
}

/// The calling core's state.
///
/// # Panics
///
/// If the core has not been given a state block yet.
pub fn current() -> &'static CoreState {
    try_current().expect("core state used before the core pointer was set")
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{collections::BTreeSet, thread, vec::Vec};

    use super::*;
    use crate::{config::READY_QUEUE_CAPACITY, testing::leak};

    #[test]
    fn registry_has_one_entry_per_core_with_distinct_ids() {
        let bootstrap = leak(CoreState::new(0));
        let registry = CoreRegistry::create(bootstrap, 4);

        let ids: Vec<usize> = registry.iter().map(CoreState::id).collect();

        assert_eq!(ids, [0, 1, 2, 3]);
        assert!(core::ptr::eq(registry.get(0).unwrap(), bootstrap));
        assert!(registry.get(4).is_none());
    }

    #[test]
    #[should_panic(expected = "core 0")]
    fn registry_rejects_a_non_zero_bootstrap_entry() {
        CoreRegistry::create(leak(CoreState::new(3)), 4);
    }

    #[test]
    fn fresh_core_runs_no_task() {
        let core = CoreState::new(5);

        assert_eq!(core.current_task(), TaskId::NONE);
        assert_eq!(core.pagemap(), 0);
        assert!(core.interrupt_table().is_none());
        assert_eq!(core.pop_task(), None);
    }

    #[test]
    fn current_follows_the_core_pointer_of_each_thread() {
        let registry: &'static CoreRegistry = leak(CoreRegistry::create(leak(CoreState::new(0)), 3));

        let seen: BTreeSet<usize> = (0..3)
            .map(|id| {
                thread::spawn(move || {
                    assert!(try_current().is_none());

                    set_current(registry.get(id).unwrap());
                    current().id()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        assert_eq!(seen, BTreeSet::from([0, 1, 2]));
    }

    #[test]
    fn cleared_pointer_reads_as_no_core() {
        unsafe { arch::set_core_pointer(0xDEAD_0000) };

        clear_current();

        assert!(try_current().is_none());
        assert_eq!(arch::core_pointer(), 0);
    }

    #[test]
    #[should_panic(expected = "core pointer")]
    fn current_without_a_pointer_panics() {
        current();
    }

    #[test]
    fn overfull_queue_reports_the_evicted_task() {
        let core = CoreState::new(1);
        core.create_ready_queue();

        for thread in 0..READY_QUEUE_CAPACITY as u32 {
            assert_eq!(core.push_task(TaskId::new(1, thread)), None);
        }

        assert_eq!(core.push_task(TaskId::new(2, 0)), Some(TaskId::new(1, 0)));
        assert_eq!(core.queued_tasks(), READY_QUEUE_CAPACITY);
        assert_eq!(core.pop_task(), Some(TaskId::new(1, 1)));
    }

    #[test]
    fn context_buffer_keeps_the_last_frame() {
        let core = CoreState::new(2);
        core.allocate_buffers();

        core.save_context(&InterruptFrame {
            vector: 32,
            ..Default::default()
        });

        assert_eq!(core.context().map(|frame| frame.vector), Some(32));
    }
}
