use core::sync::atomic::Ordering;

use limine::BaseRevision;
use limine::memory_map::EntryType;
use limine::mp::Cpu;
use limine::request::{
    ExecutableAddressRequest, ExecutableFileRequest, HhdmRequest, MemoryMapRequest, MpRequest,
    RequestsEndMarker, RequestsStartMarker, RsdpRequest, StackSizeRequest,
};

use sunrise::{
    boot::{BootSource, MemoryKind, MemoryMapEntry},
    config::BOOT_STACK_SIZE,
    smp::ParkedCpu,
};

#[used]
#[unsafe(link_section = ".requests_start_marker")]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[unsafe(link_section = ".requests_end_marker")]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

#[used]
#[unsafe(link_section = ".requests")]
pub static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[unsafe(link_section = ".requests")]
pub static STACK_SIZE_REQUEST: StackSizeRequest = StackSizeRequest::new().with_size(BOOT_STACK_SIZE);

#[used]
#[unsafe(link_section = ".requests")]
pub static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
pub static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
pub static EXECUTABLE_ADDRESS_REQUEST: ExecutableAddressRequest = ExecutableAddressRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
pub static EXECUTABLE_FILE_REQUEST: ExecutableFileRequest = ExecutableFileRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
pub static RSDP_REQUEST: RsdpRequest = RsdpRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
pub static MP_REQUEST: MpRequest = MpRequest::new();

/// Reads the boot descriptor's fields out of Limine's responses.
pub struct LimineBoot;

impl BootSource for LimineBoot {
    fn kernel_phys_base(&self) -> Option<u64> {
        EXECUTABLE_ADDRESS_REQUEST
            .get_response()
            .map(|response| response.physical_base())
    }

    fn kernel_size(&self) -> Option<u64> {
        EXECUTABLE_FILE_REQUEST
            .get_response()
            .map(|response| response.file().size())
    }

    fn rsdp_address(&self) -> Option<u64> {
        RSDP_REQUEST
            .get_response()
            .map(|response| response.address() as u64)
    }

    fn bsp_lapic_id(&self) -> Option<u32> {
        MP_REQUEST
            .get_response()
            .map(|response| response.bsp_lapic_id())
    }

    fn direct_map_offset(&self) -> Option<u64> {
        HHDM_REQUEST.get_response().map(|response| response.offset())
    }

    fn memory_map(&self) -> Option<impl Iterator<Item = MemoryMapEntry>> {
        let response = MEMORY_MAP_REQUEST.get_response()?;

        Some(response.entries().iter().map(|entry| MemoryMapEntry {
            base: entry.base,
            length: entry.length,
            kind: memory_kind(entry.entry_type),
        }))
    }

    fn cores(&self) -> Option<impl Iterator<Item = Option<u32>>> {
        let response = MP_REQUEST.get_response()?;

        Some(response.cpus().iter().map(|cpu| Some(cpu.lapic_id)))
    }
}

fn memory_kind(entry_type: EntryType) -> MemoryKind {
    match entry_type {
        EntryType::USABLE => MemoryKind::Usable,
        EntryType::ACPI_RECLAIMABLE => MemoryKind::AcpiReclaimable,
        EntryType::ACPI_NVS => MemoryKind::AcpiNvs,
        EntryType::BAD_MEMORY => MemoryKind::BadMemory,
        EntryType::BOOTLOADER_RECLAIMABLE => MemoryKind::BootloaderReclaimable,
        EntryType::EXECUTABLE_AND_MODULES => MemoryKind::KernelAndModules,
        EntryType::FRAMEBUFFER => MemoryKind::Framebuffer,
        _ => MemoryKind::Reserved,
    }
}

/// An application core parked in Limine's wait loop.
pub struct LimineCpu(pub &'static Cpu);

impl ParkedCpu for LimineCpu {
    fn lapic_id(&self) -> u32 {
        self.0.lapic_id
    }

    fn release(&self, argument: u64) {
        self.0.extra.store(argument, Ordering::Relaxed);

        // Limine publishes the entry point with a SeqCst store, which orders `extra` before it.
        self.0.goto_address.write(crate::init_ap);
    }
}

/// Every core Limine reports, bootstrap core included.
pub fn parked_cpus() -> impl Iterator<Item = LimineCpu> {
    MP_REQUEST
        .get_response()
        .into_iter()
        .flat_map(|response| response.cpus().iter().map(|&cpu| LimineCpu(cpu)))
}
