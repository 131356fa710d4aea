//! Legacy 8259 PIC pair. Only the local APIC delivers interrupts in this kernel, so the PICs are
//! moved out of the exception range and fully masked.

use super::io_ports::{io_wait, outb};

pub const MASTER_COMMAND_PORT: u16 = 0x20;
pub const MASTER_DATA_PORT: u16 = MASTER_COMMAND_PORT + 0x01;

pub const SLAVE_COMMAND_PORT: u16 = 0xA0;
pub const SLAVE_DATA_PORT: u16 = SLAVE_COMMAND_PORT + 0x01;

const ICW1_INIT_WITH_ICW4: u8 = 0x11;
const ICW4_8086_MODE: u8 = 0x01;

/// Vectors the PICs are remapped to, so a stray legacy IRQ never looks like a CPU exception.
const MASTER_VECTOR_OFFSET: u8 = 0xE0;
const SLAVE_VECTOR_OFFSET: u8 = 0xE8;

pub fn disable() {
    let commands = [
        (MASTER_COMMAND_PORT, ICW1_INIT_WITH_ICW4),
        (SLAVE_COMMAND_PORT, ICW1_INIT_WITH_ICW4),
        (MASTER_DATA_PORT, MASTER_VECTOR_OFFSET),
        (SLAVE_DATA_PORT, SLAVE_VECTOR_OFFSET),
        // slave attached to IRQ2 of the master
        (MASTER_DATA_PORT, 1 << 2),
        (SLAVE_DATA_PORT, 2),
        (MASTER_DATA_PORT, ICW4_8086_MODE),
        (SLAVE_DATA_PORT, ICW4_8086_MODE),
    ];

    for (port, value) in commands {
        outb(port, value);
        io_wait();
    }

    outb(MASTER_DATA_PORT, 0xff);
    outb(SLAVE_DATA_PORT, 0xff);
}
