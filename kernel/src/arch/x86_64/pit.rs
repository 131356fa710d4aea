//! 8254 timer, channel 2. Only used as the reference clock for local APIC timer calibration.

use spin::Mutex;

use super::io_ports::{inb, outb};
use crate::local_apic::ReferenceClock;

const PIT_FREQUENCY: u64 = 1_193_182;

const CHANNEL_2_DATA: u16 = 0x42;
const COMMAND: u16 = 0x43;
/// NMI status and speaker control.
const PORT_B: u16 = 0x61;

const GATE_2: u8 = 1 << 0;
const SPEAKER: u8 = 1 << 1;
const OUTPUT_2: u8 = 1 << 5;

/// Channel 2, low byte then high byte, mode 0 (interrupt on terminal count), binary.
const ONE_SHOT_CHANNEL_2: u8 = 0b1011_0000;

/// The channel is shared by every core, so it is only reached through [`PIT`].
pub struct Pit(());

pub static PIT: Mutex<Pit> = Mutex::new(Pit(()));

impl ReferenceClock for Pit {
    /// Waits of more than about 54 ms are cut short to the 16-bit counter range.
    fn wait_ms(&mut self, ms: u32) {
        let count = (PIT_FREQUENCY * u64::from(ms) / 1000).min(u64::from(u16::MAX)) as u16;
        let port_b = inb(PORT_B) & !SPEAKER;

        outb(PORT_B, port_b & !GATE_2);
        outb(COMMAND, ONE_SHOT_CHANNEL_2);
        outb(CHANNEL_2_DATA, count as u8);
        outb(CHANNEL_2_DATA, (count >> 8) as u8);

        // Raising the gate starts the count.
        outb(PORT_B, port_b | GATE_2);

        while inb(PORT_B) & OUTPUT_2 == 0 {
            core::hint::spin_loop();
        }
    }
}
