//! An owned snapshot of what the bootloader told us, taken before any of its memory is reused.

use core::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use bitflags::bitflags;
use log::{info, warn};
use spin::Once;

use crate::{
    acpi::{self, AcpiError, RootTable, SdtHeader},
    config::{DIRECT_MAP_BASE, MAX_CORES, MEMORY_MAP_CAPACITY},
    memory::DirectMap,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadMemory,
    BootloaderReclaimable,
    KernelAndModules,
    Framebuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryKind,
}

impl MemoryMapEntry {
    const EMPTY: MemoryMapEntry = MemoryMapEntry {
        base: 0,
        length: 0,
        kind: MemoryKind::Reserved,
    };

    pub const fn end(&self) -> u64 {
        self.base + self.length
    }
}

bitflags! {
    /// Degraded-but-continuing conditions found while taking the snapshot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BootWarnings: u32 {
        /// The memory map had more entries than we keep; the tail was dropped.
        const MEMORY_MAP_OVERFLOW = 1 << 0;
        /// More cores were reported than we support; the extra ones stay parked.
        const CORE_OVERFLOW = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    MissingKernelBase,
    MissingKernelSize,
    MissingAcpiRoot,
    MissingCores,
    MissingBootstrapCore,
    /// The core at this position of the bootloader's list has no interrupt-controller id.
    CoreWithoutId(usize),
    /// The bootstrap core's id is not among the listed cores.
    UnlistedBootstrapCore(u32),
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::MissingKernelBase => f.write_str("kernel physical base is missing"),
            BootError::MissingKernelSize => f.write_str("kernel size is missing"),
            BootError::MissingAcpiRoot => f.write_str("acpi root pointer is missing"),
            BootError::MissingCores => f.write_str("no cores were reported"),
            BootError::MissingBootstrapCore => f.write_str("bootstrap core id is missing"),
            BootError::CoreWithoutId(index) => write!(f, "core #{index} has no lapic id"),
            BootError::UnlistedBootstrapCore(id) => {
                write!(f, "bootstrap lapic id {id} is not in the core list")
            }
        }
    }
}

/// Raw boot information as some bootloader protocol exposes it. Any field may be missing.
pub trait BootSource {
    fn kernel_phys_base(&self) -> Option<u64>;

    fn kernel_size(&self) -> Option<u64>;

    fn rsdp_address(&self) -> Option<u64>;

    fn bsp_lapic_id(&self) -> Option<u32>;

    /// Offset of the direct-mapped window, if the protocol reports one.
    fn direct_map_offset(&self) -> Option<u64>;

    fn memory_map(&self) -> Option<impl Iterator<Item = MemoryMapEntry>>;

    /// Local APIC id of every core, in the bootloader's order. `None` marks a core whose id
    /// could not be read.
    fn cores(&self) -> Option<impl Iterator<Item = Option<u32>>>;
}

pub struct BootDescriptor {
    kernel_phys_base: u64,
    kernel_size: u64,
    rsdp_address: u64,
    direct_map_offset: u64,
    bsp_lapic_id: u32,
    memory_map: [MemoryMapEntry; MEMORY_MAP_CAPACITY],
    memory_map_len: usize,
    lapic_ids: [u32; MAX_CORES],
    core_count: usize,
    warnings: BootWarnings,
    smp_started: AtomicBool,
}

impl BootDescriptor {
    /// Validates every mandatory field of `source` before copying anything, so a failed
    /// construction leaves nothing behind.
    pub fn new(source: &impl BootSource) -> Result<Self, BootError> {
        let kernel_phys_base = source.kernel_phys_base().ok_or(BootError::MissingKernelBase)?;
        let kernel_size = source.kernel_size().ok_or(BootError::MissingKernelSize)?;
        let rsdp_address = source.rsdp_address().ok_or(BootError::MissingAcpiRoot)?;
        let bsp_lapic_id = source.bsp_lapic_id().ok_or(BootError::MissingBootstrapCore)?;
        let cores = source.cores().ok_or(BootError::MissingCores)?;

        let mut warnings = BootWarnings::empty();
        let mut lapic_ids = [0; MAX_CORES];
        let mut core_count = 0;
        let mut bsp_listed = false;

        for (index, lapic_id) in cores.enumerate() {
            let lapic_id = lapic_id.ok_or(BootError::CoreWithoutId(index))?;

            bsp_listed |= lapic_id == bsp_lapic_id;

            if core_count < MAX_CORES {
                lapic_ids[core_count] = lapic_id;
                core_count += 1;
            } else {
                warnings |= BootWarnings::CORE_OVERFLOW;
            }
        }

        if core_count == 0 {
            return Err(BootError::MissingCores);
        }

        if !bsp_listed {
            return Err(BootError::UnlistedBootstrapCore(bsp_lapic_id));
        }

        // The bootstrap core always gets a slot, even when the list was cut short before it.
        if !lapic_ids[..core_count].contains(&bsp_lapic_id) {
            lapic_ids[core_count - 1] = bsp_lapic_id;
        }

        let mut memory_map = [MemoryMapEntry::EMPTY; MEMORY_MAP_CAPACITY];
        let mut memory_map_len = 0;

        for entry in source.memory_map().into_iter().flatten() {
            if memory_map_len == MEMORY_MAP_CAPACITY {
                warnings |= BootWarnings::MEMORY_MAP_OVERFLOW;
                break;
            }

            memory_map[memory_map_len] = entry;
            memory_map_len += 1;
        }

        Ok(Self {
            kernel_phys_base,
            kernel_size,
            rsdp_address,
            direct_map_offset: source.direct_map_offset().unwrap_or(DIRECT_MAP_BASE),
            bsp_lapic_id,
            memory_map,
            memory_map_len,
            lapic_ids,
            core_count,
            warnings,
            smp_started: AtomicBool::new(false),
        })
    }

    pub fn kernel_phys_base(&self) -> u64 {
        self.kernel_phys_base
    }

    pub fn kernel_size(&self) -> u64 {
        self.kernel_size
    }

    pub fn rsdp_address(&self) -> u64 {
        self.rsdp_address
    }

    pub fn direct_map_offset(&self) -> u64 {
        self.direct_map_offset
    }

    pub fn bsp_lapic_id(&self) -> u32 {
        self.bsp_lapic_id
    }

    pub fn core_count(&self) -> usize {
        self.core_count
    }

    /// Local APIC ids of the cores we will run, in the bootloader's order.
    pub fn lapic_ids(&self) -> &[u32] {
        &self.lapic_ids[..self.core_count]
    }

    pub fn memory_map(&self) -> &[MemoryMapEntry] {
        &self.memory_map[..self.memory_map_len]
    }

    pub fn iterate_memory_map(&self, visitor: impl FnMut(&MemoryMapEntry)) {
        self.memory_map().iter().for_each(visitor);
    }

    /// Hands the physical address and header of every table listed by the ACPI root table to
    /// `visitor`. The RSDP, the root table and every listed header must be reachable through
    /// `direct_map`.
    pub fn iterate_acpi_tables(
        &self,
        direct_map: DirectMap,
        mut visitor: impl FnMut(u64, SdtHeader),
    ) -> Result<(), AcpiError> {
        for table in RootTable::locate(self.rsdp_address, direct_map)?.tables(direct_map) {
            visitor(table, acpi::read_header(table, direct_map));
        }

        Ok(())
    }

    pub fn warnings(&self) -> BootWarnings {
        self.warnings
    }

    /// Sets the SMP latch. Returns whether this call was the one that set it.
    pub fn mark_smp_started(&self) -> bool {
        !self.smp_started.swap(true, Ordering::AcqRel)
    }

    pub fn is_smp_started(&self) -> bool {
        self.smp_started.load(Ordering::Acquire)
    }

    /// Logs the recorded warnings, if any, by name.
    pub fn report_warnings(&self) {
        for (name, _) in self.warnings.iter_names() {
            warn!("boot warning: {name}");
        }
    }

    pub fn log_summary(&self) {
        info!(
            "kernel at {:#x} ({} KiB), {} cores, bsp lapic {}",
            self.kernel_phys_base,
            self.kernel_size / 1024,
            self.core_count,
            self.bsp_lapic_id
        );

        for entry in self.memory_map() {
            info!(
                "  {:#018x}..{:#018x} {:?}",
                entry.base,
                entry.end(),
                entry.kind
            );
        }
    }
}

static DESCRIPTOR: Once<BootDescriptor> = Once::new();

/// Publishes the process-wide descriptor. Later calls keep the first one.
pub fn install(descriptor: BootDescriptor) -> &'static BootDescriptor {
    DESCRIPTOR.call_once(|| descriptor)
}

pub fn descriptor() -> &'static BootDescriptor {
    DESCRIPTOR
        .get()
        .expect("the boot descriptor was used before boot::install")
}
