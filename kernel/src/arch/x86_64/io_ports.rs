use core::arch::asm;

/// Unused POST diagnostic port; writing to it takes roughly a microsecond.
const DELAY_PORT: u16 = 0x80;

pub fn outb(port: u16, value: u8) {
    unsafe {
        asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
    }
}

pub fn inb(port: u16) -> u8 {
    let value: u8;

    unsafe {
        asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags));
    }

    value
}

/// Gives slow legacy devices time to settle between commands.
pub fn io_wait() {
    outb(DELAY_PORT, 0);
}
