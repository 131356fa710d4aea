use core::fmt::{self, Write};

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

use sunrise::arch::interrupts::without_interrupts;

const COM1: u16 = 0x3F8;

lazy_static! {
    static ref SERIAL: Mutex<SerialPort> = {
        // SAFETY: COM1 is only ever driven through this port.
        let mut port = unsafe { SerialPort::new(COM1) };
        port.init();
        Mutex::new(port)
    };
}

/// Log sink writing to COM1.
pub fn write(args: fmt::Arguments<'_>) {
    // A timer tick that logs while this core holds the lock would deadlock.
    without_interrupts(|| {
        let _ = SERIAL.lock().write_fmt(args);
    });
}
