//! Per-core interrupt descriptor tables.
//!
//! Every gate points at one of the uniform entry stubs from [`arch::interrupt_stubs`]; the stubs
//! all funnel into [`dispatch_current`], which looks the vector up in the core's handler table.
//! Vectors without a handler are fatal.

use core::{
    fmt,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bit_field::BitField;
use log::error;

use crate::{
    arch::{self, DescriptorTableRegister, StubLayout},
    gdt::{DOUBLE_FAULT_IST_INDEX, SELECTORS},
    percpu,
};

pub const VECTOR_COUNT: usize = 256;

pub const DOUBLE_FAULT_VECTOR: u8 = 8;

/// A high-level interrupt handler. It runs with interrupts disabled on the interrupted stack.
pub type Handler = fn(&mut InterruptFrame);

/// Register state pushed by the entry stubs, lowest address first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    /// Zero for vectors where the CPU pushes none.
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl fmt::Display for InterruptFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "rax={:#018x} rbx={:#018x} rcx={:#018x} rdx={:#018x}",
            self.rax, self.rbx, self.rcx, self.rdx
        )?;
        writeln!(
            f,
            "rsi={:#018x} rdi={:#018x} rbp={:#018x} rsp={:#018x}",
            self.rsi, self.rdi, self.rbp, self.rsp
        )?;
        writeln!(
            f,
            "r8 ={:#018x} r9 ={:#018x} r10={:#018x} r11={:#018x}",
            self.r8, self.r9, self.r10, self.r11
        )?;
        writeln!(
            f,
            "r12={:#018x} r13={:#018x} r14={:#018x} r15={:#018x}",
            self.r12, self.r13, self.r14, self.r15
        )?;
        write!(
            f,
            "rip={:#018x} cs={:#06x} ss={:#06x} rflags={:#010x} error={:#x}",
            self.rip, self.cs, self.ss, self.rflags, self.error_code
        )
    }
}

pub const EXCEPTION_NAMES: [&str; 32] = [
    "#DE division error",
    "#DB debug",
    "NMI",
    "#BP breakpoint",
    "#OF overflow",
    "#BR bound range exceeded",
    "#UD invalid opcode",
    "#NM device not available",
    "#DF double fault",
    "coprocessor segment overrun",
    "#TS invalid tss",
    "#NP segment not present",
    "#SS stack-segment fault",
    "#GP general protection fault",
    "#PF page fault",
    "reserved",
    "#MF x87 floating point exception",
    "#AC alignment check",
    "#MC machine check",
    "#XM simd floating point exception",
    "#VE virtualization exception",
    "#CP control protection exception",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "#HV hypervisor injection exception",
    "#VC vmm communication exception",
    "#SX security exception",
    "reserved",
];

/// Mnemonic of an architectural exception, or "interrupt" for vectors 32 and up.
pub fn vector_name(vector: u8) -> &'static str {
    EXCEPTION_NAMES
        .get(vector as usize)
        .copied()
        .unwrap_or("interrupt")
}

/// Type, privilege and stack bits of one gate (bits 32..48 of its low half).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateOptions {
    bits: u16,
}

impl GateOptions {
    /// A present ring-0 interrupt gate on the current stack.
    pub const fn new() -> Self {
        Self {
            bits: 0b1000_1110_0000_0000,
        }
    }

    pub fn set_present(mut self, value: bool) -> Self {
        self.bits.set_bit(15, value);
        self
    }

    /// Trap gates leave interrupts enabled on entry.
    pub fn set_trap(mut self, value: bool) -> Self {
        self.bits.set_bit(8, value);
        self
    }

    pub fn set_privilege_level(mut self, dpl: u16) -> Self {
        self.bits.set_bits(13..15, dpl);
        self
    }

    /// Switch to TSS interrupt stack `index` (0-based) on entry.
    pub fn set_stack_index(mut self, index: u16) -> Self {
        self.bits.set_bits(0..3, index + 1);
        self
    }

    pub fn bits(&self) -> u16 {
        self.bits
    }
}

impl Default for GateOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// One 16-byte hardware gate. Stored as atomics so a core can rebind its own vectors while
/// other code reads the table.
#[repr(C)]
struct Gate {
    low: AtomicU64,
    high: AtomicU64,
}

impl Gate {
    const fn missing() -> Self {
        Self {
            low: AtomicU64::new(0),
            high: AtomicU64::new(0),
        }
    }

    fn set(&self, address: u64, selector: u16, options: GateOptions) {
        let mut low = 0u64;

        low.set_bits(0..16, address.get_bits(0..16));
        low.set_bits(16..32, u64::from(selector));
        low.set_bits(32..48, u64::from(options.bits));
        low.set_bits(48..64, address.get_bits(16..32));

        self.high.store(address.get_bits(32..64), Ordering::Relaxed);
        self.low.store(low, Ordering::Release);
    }

    fn address(&self) -> u64 {
        let low = self.low.load(Ordering::Acquire);
        let mut address = self.high.load(Ordering::Relaxed) << 32;

        address.set_bits(0..16, low.get_bits(0..16));
        address.set_bits(16..32, low.get_bits(48..64));
        address
    }

    fn options(&self) -> GateOptions {
        GateOptions {
            bits: self.low.load(Ordering::Acquire).get_bits(32..48) as u16,
        }
    }

    fn selector(&self) -> u16 {
        self.low.load(Ordering::Acquire).get_bits(16..32) as u16
    }
}

/// A core's hardware gate table plus the handler bound to each vector.
#[repr(C, align(16))]
pub struct InterruptTable {
    gates: [Gate; VECTOR_COUNT],
    handlers: [AtomicUsize; VECTOR_COUNT],
}

impl InterruptTable {
    pub const fn new() -> Self {
        Self {
            gates: [const { Gate::missing() }; VECTOR_COUNT],
            handlers: [const { AtomicUsize::new(0) }; VECTOR_COUNT],
        }
    }

    /// Points every gate at its entry stub and unbinds every vector. Double faults switch to
    /// the dedicated interrupt stack.
    pub fn init(&self, stubs: StubLayout) {
        for vector in 0..=u8::MAX {
            let options = if vector == DOUBLE_FAULT_VECTOR {
                GateOptions::new().set_stack_index(DOUBLE_FAULT_IST_INDEX)
            } else {
                GateOptions::new()
            };

            self.gates[vector as usize].set(stubs.stub(vector), SELECTORS.code, options);
            self.handlers[vector as usize].store(0, Ordering::Relaxed);
        }
    }

    pub fn descriptor_register(&'static self) -> DescriptorTableRegister {
        DescriptorTableRegister {
            address: self.gates.as_ptr() as u64,
            size: (size_of::<[Gate; VECTOR_COUNT]>() - 1) as u16,
        }
    }

    /// Loads this table into the calling core's IDT register.
    pub fn install(&'static self) {
        // SAFETY: the table is 'static, so it outlives the core.
        unsafe { arch::load_idt(&self.descriptor_register()) }
    }

    /// Binds `handler` to `vector`, replacing whatever was bound before.
    pub fn register(&self, vector: u8, handler: Handler, options: GateOptions) {
        let gate = &self.gates[vector as usize];

        self.handlers[vector as usize].store(handler as usize, Ordering::Release);
        gate.set(gate.address(), gate.selector(), options);
    }

    pub fn handler(&self, vector: u8) -> Option<Handler> {
        match self.handlers[vector as usize].load(Ordering::Acquire) {
            0 => None,
            // SAFETY: non-zero slots only ever hold a `Handler` stored by `register`.
            raw => Some(unsafe { core::mem::transmute::<usize, Handler>(raw) }),
        }
    }

    /// Entry-stub address gate `vector` points at.
    pub fn gate_address(&self, vector: u8) -> u64 {
        self.gates[vector as usize].address()
    }

    pub fn gate_options(&self, vector: u8) -> GateOptions {
        self.gates[vector as usize].options()
    }

    /// Runs the handler bound to the frame's vector.
    pub fn dispatch(&self, frame: &mut InterruptFrame) {
        match self.handler(frame.vector as u8) {
            Some(handler) => handler(frame),
            None => unhandled(frame),
        }
    }
}

impl Default for InterruptTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The fate of every vector nobody bound: dump the registers and stop the core.
pub fn unhandled(frame: &InterruptFrame) -> ! {
    let vector = frame.vector as u8;

    error!(
        "unhandled {} (vector {vector})\n{frame}",
        vector_name(vector)
    );

    arch::halt();
}

/// Entry from the low-level stubs: snapshot the frame into the core's context buffer, then
/// dispatch through the core's own table.
pub fn dispatch_current(frame: &mut InterruptFrame) {
    let Some(core) = percpu::try_current() else {
        unhandled(frame);
    };

    core.save_context(frame);

    match core.interrupt_table() {
        Some(table) => table.dispatch(frame),
        None => unhandled(frame),
    }
}
