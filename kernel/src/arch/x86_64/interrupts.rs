use core::arch::asm;

pub fn disable() {
    unsafe {
        asm!("cli", options(nomem, nostack));
    }
}

pub fn enable() {
    unsafe {
        asm!("sti", options(nomem, nostack));
    }
}

pub fn wait_for_interrupts() {
    unsafe {
        asm!("hlt", options(nomem, nostack));
    }
}

pub fn are_enabled() -> bool {
    let flags: u64;

    unsafe {
        asm!("pushfq", "pop {}", out(reg) flags, options(nomem, preserves_flags));
    }

    flags & (1 << 9) != 0
}

/// Runs `f` with interrupts masked, restoring the previous state afterwards.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let were_enabled = are_enabled();

    if were_enabled {
        disable();
    }

    let result = f();

    if were_enabled {
        enable();
    }

    result
}
