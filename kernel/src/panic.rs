use log::error;

use sunrise::arch;

#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo) -> ! {
    arch::interrupts::disable();

    error!("{info}");

    arch::halt();
}
