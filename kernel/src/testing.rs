//! Host-memory stand-in for physical RAM.

extern crate std;

use std::{boxed::Box, vec};

use crate::local_apic::{LocalApic, LocalApicRegister, ReferenceClock};
use crate::memory::{DirectMap, FrameAllocator};
use crate::paging::SMALL_PAGE_SIZE;

/// Physical address of the first arena frame. Non-zero so a stray zero address stands out.
pub const ARENA_PHYS_BASE: u64 = 0x10_0000;

const FRAME_SIZE: usize = SMALL_PAGE_SIZE as usize;

/// Byte freshly handed-out frames are filled with, so code that forgets to zero shows up.
pub const POISON: u8 = 0xA5;

#[derive(Clone)]
#[repr(C, align(4096))]
struct Frame([u8; FRAME_SIZE]);

/// A run of host frames handed out as "physical" memory, reachable through
/// [`PhysArena::direct_map`].
pub struct PhysArena {
    frames: Box<[Frame]>,
    next: usize,
    limit: usize,
}

impl PhysArena {
    pub fn new(pages: usize) -> Self {
        Self {
            frames: vec![Frame([POISON; FRAME_SIZE]); pages].into_boxed_slice(),
            next: 0,
            limit: pages,
        }
    }

    pub fn direct_map(&self) -> DirectMap {
        DirectMap::new((self.frames.as_ptr() as u64).wrapping_sub(ARENA_PHYS_BASE))
    }

    /// Makes every allocation past the next `pages` fail.
    pub fn limit_to(&mut self, pages: usize) {
        self.limit = (self.next + pages).min(self.frames.len());
    }

    pub fn allocated(&self) -> usize {
        self.next
    }

    /// Copies `value` into the arena at `phys`.
    pub fn write<T: Copy>(&mut self, phys: u64, value: T) {
        let offset = (phys - ARENA_PHYS_BASE) as usize;
        assert!(offset + size_of::<T>() <= self.frames.len() * FRAME_SIZE);

        unsafe { self.direct_map().ptr::<T>(phys).write_unaligned(value) }
    }
}

impl FrameAllocator for PhysArena {
    fn allocate_page(&mut self) -> Option<u64> {
        self.allocate_pages(1)
    }

    fn allocate_pages(&mut self, count: usize) -> Option<u64> {
        if self.next + count > self.limit {
            return None;
        }

        let phys = ARENA_PHYS_BASE + (self.next * FRAME_SIZE) as u64;
        self.next += count;

        Some(phys)
    }

    /// Only the most recent allocation is actually reclaimed; earlier ones stay used.
    fn free_pages(&mut self, phys: u64, count: usize) {
        if self.next >= count && ARENA_PHYS_BASE + ((self.next - count) * FRAME_SIZE) as u64 == phys {
            self.next -= count;
        }
    }
}

/// Advances the calling thread's local APIC timer by a fixed rate for every millisecond waited.
pub struct FakeClock {
    direct_map: DirectMap,
    ticks_per_ms: u32,
    waited_ms: u32,
}

impl FakeClock {
    pub fn new(direct_map: DirectMap, ticks_per_ms: u32) -> Self {
        Self {
            direct_map,
            ticks_per_ms,
            waited_ms: 0,
        }
    }

    pub fn waited_ms(&self) -> u32 {
        self.waited_ms
    }
}

impl ReferenceClock for FakeClock {
    fn wait_ms(&mut self, ms: u32) {
        self.waited_ms += ms;

        let apic = unsafe { LocalApic::current(self.direct_map) };
        let initial = apic.read(LocalApicRegister::TimerInit);

        apic.write(LocalApicRegister::TimerCurrent, initial - self.ticks_per_ms * ms);
    }
}

pub fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}
