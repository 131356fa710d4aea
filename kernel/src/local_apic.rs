use log::trace;

use crate::{
    arch::ModelSpecificRegister,
    config::{CALIBRATION_MS, FALLBACK_TIMER_INITIAL_COUNT},
    interrupts::InterruptFrame,
    memory::DirectMap,
    percpu,
};

const APIC_BASE_ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const APIC_BASE_ENABLE: u64 = 1 << 11;

const SPURIOUS_SOFTWARE_ENABLE: u32 = 1 << 8;
const TIMER_MASKED: u32 = 1 << 16;
const TIMER_PERIODIC: u32 = 1 << 17;

/// Divide configuration for "divide by 16".
const TIMER_DIVIDE_BY_16: u32 = 0b0011;

/// A clock with a known rate the APIC timer is measured against.
pub trait ReferenceClock {
    /// Busy-waits for `ms` milliseconds.
    fn wait_ms(&mut self, ms: u32);
}

/// A core's local APIC, reached through its memory-mapped register page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalApic(usize);

#[repr(usize)]
#[derive(Debug, Clone, Copy)]
pub enum LocalApicRegister {
    Eoi = 0xb0,
    Spurious = 0xf0,
    TimerLvt = 0x320,
    TimerInit = 0x380,
    TimerCurrent = 0x390,
    TimerDiv = 0x3e0,
}

impl LocalApic {
    /// # Safety
    ///
    /// `virt` must map the register page of the calling core's local APIC.
    pub const unsafe fn new(virt: u64) -> Self {
        Self(virt as usize)
    }

    /// The calling core's APIC, through the direct map.
    ///
    /// # Safety
    ///
    /// The register page must already be mapped in the direct map.
    pub unsafe fn current(direct_map: DirectMap) -> Self {
        unsafe { Self::new(direct_map.to_virt(Self::phys_base())) }
    }

    /// Physical address of the calling core's register page.
    pub fn phys_base() -> u64 {
        ModelSpecificRegister::ApicBase.read() & APIC_BASE_ADDRESS_MASK
    }

    pub fn write(&self, register: LocalApicRegister, value: u32) {
        unsafe {
            ((self.0 + register as usize) as *mut u32).write_volatile(value);
        }
    }

    pub fn read(&self, register: LocalApicRegister) -> u32 {
        unsafe { ((self.0 + register as usize) as *mut u32).read_volatile() }
    }

    /// Turns the APIC on globally and in software, routing spurious interrupts to
    /// `spurious_vector`.
    pub fn enable(&self, spurious_vector: u8) {
        let apic_base = ModelSpecificRegister::ApicBase.read();

        // SAFETY: only sets the global enable bit, keeping the base address.
        unsafe { ModelSpecificRegister::ApicBase.write(apic_base | APIC_BASE_ENABLE) };

        self.write(
            LocalApicRegister::Spurious,
            u32::from(spurious_vector) | SPURIOUS_SOFTWARE_ENABLE,
        );
    }

    /// Starts the periodic timer firing `vector` every `initial_count` ticks of the bus clock
    /// divided by 16.
    pub fn start_timer(&self, vector: u8, initial_count: u32) {
        self.write(LocalApicRegister::TimerDiv, TIMER_DIVIDE_BY_16);
        self.write(LocalApicRegister::TimerLvt, u32::from(vector) | TIMER_PERIODIC);
        self.write(LocalApicRegister::TimerInit, initial_count);
    }

    /// Counts how many timer ticks (bus clock divided by 16) pass in one millisecond of
    /// `clock`. The timer is left stopped.
    pub fn calibrate(&self, clock: &mut impl ReferenceClock) -> u32 {
        self.write(LocalApicRegister::TimerDiv, TIMER_DIVIDE_BY_16);
        self.write(LocalApicRegister::TimerLvt, TIMER_MASKED);
        self.write(LocalApicRegister::TimerInit, u32::MAX);

        clock.wait_ms(CALIBRATION_MS);

        let elapsed = u32::MAX - self.read(LocalApicRegister::TimerCurrent);

        self.write(LocalApicRegister::TimerInit, 0);

        elapsed / CALIBRATION_MS
    }

    pub fn end_of_interrupt(&self) {
        self.write(LocalApicRegister::Eoi, 0);
    }
}

/// Reload value for a periodic tick every `period_ms`, given a calibrated rate. A rate of zero
/// means calibration failed and the fixed fallback count is used.
pub const fn timer_initial_count(ticks_per_ms: u32, period_ms: u32) -> u32 {
    if ticks_per_ms == 0 {
        FALLBACK_TIMER_INITIAL_COUNT
    } else {
        ticks_per_ms.saturating_mul(period_ms)
    }
}

/// Timer vector handler: counts the tick and acknowledges it. The scheduler hooks in here.
pub fn handle_timer_tick(_frame: &mut InterruptFrame) {
    let core = percpu::current();

    core.tick();

    if let Some(local_apic) = core.local_apic() {
        local_apic.end_of_interrupt();
    }
}

/// Spurious interrupts must not be acknowledged.
pub fn handle_spurious(frame: &mut InterruptFrame) {
    trace!("spurious interrupt {}", frame.vector);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::FrameAllocator,
        percpu::CoreState,
        testing::{FakeClock, PhysArena, leak},
    };

    fn arena_apic(arena: &mut PhysArena) -> LocalApic {
        let page = arena.allocate_page().unwrap();

        unsafe {
            ModelSpecificRegister::ApicBase.write(page | 1 << 8);
            LocalApic::current(arena.direct_map())
        }
    }

    #[test]
    fn base_comes_from_the_msr() {
        let mut arena = PhysArena::new(2);
        let apic = arena_apic(&mut arena);

        assert_eq!(LocalApic::phys_base(), crate::testing::ARENA_PHYS_BASE);
        assert_eq!(apic.0 as u64, arena.direct_map().to_virt(LocalApic::phys_base()));
    }

    #[test]
    fn enable_sets_both_enable_bits() {
        let mut arena = PhysArena::new(2);
        let apic = arena_apic(&mut arena);

        apic.enable(0xFF);

        assert_eq!(apic.read(LocalApicRegister::Spurious), 0x1FF);
        assert_ne!(ModelSpecificRegister::ApicBase.read() & APIC_BASE_ENABLE, 0);
        assert_eq!(LocalApic::phys_base(), crate::testing::ARENA_PHYS_BASE);
    }

    #[test]
    fn timer_is_periodic_on_the_given_vector() {
        let mut arena = PhysArena::new(2);
        let apic = arena_apic(&mut arena);

        apic.start_timer(32, 0x19_FBD0);

        assert_eq!(apic.read(LocalApicRegister::TimerDiv), 0b0011);
        assert_eq!(apic.read(LocalApicRegister::TimerLvt), 32 | 1 << 17);
        assert_eq!(apic.read(LocalApicRegister::TimerInit), 0x19_FBD0);
    }

    #[test]
    fn calibration_measures_ticks_per_millisecond() {
        let mut arena = PhysArena::new(2);
        let apic = arena_apic(&mut arena);
        let mut clock = FakeClock::new(arena.direct_map(), 10_000);

        assert_eq!(apic.calibrate(&mut clock), 10_000);
        assert_eq!(clock.waited_ms(), CALIBRATION_MS);
        assert_eq!(apic.read(LocalApicRegister::TimerDiv), 0b0011);
        assert_eq!(apic.read(LocalApicRegister::TimerLvt), 1 << 16);
        assert_eq!(apic.read(LocalApicRegister::TimerInit), 0);
    }

    #[test]
    fn initial_count_follows_the_period() {
        assert_eq!(timer_initial_count(10_000, 20), 200_000);
        assert_eq!(timer_initial_count(u32::MAX / 2, 20), u32::MAX);
        assert_eq!(timer_initial_count(0, 20), FALLBACK_TIMER_INITIAL_COUNT);
    }

    #[test]
    fn tick_counts_and_acknowledges() {
        let mut arena = PhysArena::new(2);
        let apic = arena_apic(&mut arena);
        let core = leak(CoreState::new(1));

        apic.write(LocalApicRegister::Eoi, 0xDEAD);
        core.set_local_apic(apic);
        percpu::set_current(core);

        handle_timer_tick(&mut InterruptFrame::default());
        handle_timer_tick(&mut InterruptFrame::default());

        assert_eq!(core.ticks(), 2);
        assert_eq!(apic.read(LocalApicRegister::Eoi), 0);
    }
}
