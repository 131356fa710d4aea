//! The 256 low-level interrupt entry points.
//!
//! Every stub comes from one template: push a zero error code when the CPU does not push one,
//! push the vector number, jump to the common path. Each stub is padded to `STUB_STRIDE` bytes,
//! so the table is a plain base + stride computation.

use core::arch::global_asm;

use crate::arch::StubLayout;
use crate::interrupts::{self, InterruptFrame};

const STUB_STRIDE: u64 = 16;

global_asm!(
    r#"
    .pushsection .text.interrupt_stubs, "ax", @progbits
    .balign 16
    .global interrupt_stubs_start
interrupt_stubs_start:
    .set stub_vector, 0
    .rept 256
        .balign 16
        .if !((stub_vector == 8) || ((stub_vector >= 10) && (stub_vector <= 14)) || (stub_vector == 17) || (stub_vector == 21) || (stub_vector == 29) || (stub_vector == 30))
        pushq $0
        .endif
        pushq $stub_vector
        jmp interrupt_common
        .set stub_vector, stub_vector + 1
    .endr
    .global interrupt_stubs_end
interrupt_stubs_end:

interrupt_common:
    pushq %rax
    pushq %rbx
    pushq %rcx
    pushq %rdx
    pushq %rsi
    pushq %rdi
    pushq %rbp
    pushq %r8
    pushq %r9
    pushq %r10
    pushq %r11
    pushq %r12
    pushq %r13
    pushq %r14
    pushq %r15
    movq %rsp, %rdi
    cld
    call {dispatch}
    popq %r15
    popq %r14
    popq %r13
    popq %r12
    popq %r11
    popq %r10
    popq %r9
    popq %r8
    popq %rbp
    popq %rdi
    popq %rsi
    popq %rdx
    popq %rcx
    popq %rbx
    popq %rax
    addq $16, %rsp
    iretq
    .popsection
"#,
    dispatch = sym dispatch,
    options(att_syntax)
);

unsafe extern "C" {
    static interrupt_stubs_start: u8;
    static interrupt_stubs_end: u8;
}

extern "C" fn dispatch(frame: &mut InterruptFrame) {
    interrupts::dispatch_current(frame);
}

pub fn interrupt_stubs() -> StubLayout {
    let (start, end) = unsafe {
        (
            (&raw const interrupt_stubs_start) as u64,
            (&raw const interrupt_stubs_end) as u64,
        )
    };

    debug_assert!(end - start <= 256 * STUB_STRIDE, "an interrupt stub outgrew its slot");

    StubLayout {
        base: start,
        stride: STUB_STRIDE,
    }
}
