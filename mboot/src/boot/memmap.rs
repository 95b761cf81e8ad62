//! Firmware memory-map handling.
//!
//! The relocation engine plans against a snapshot of the firmware map
//! taken here, translated into the model kinds of `mboot_core`. Right
//! before the jump the *final* map (the one `exit_boot_services`
//! returns) is ingested into a preallocated model and handed to the
//! kernel; at that point nothing may allocate anymore.

use log::{debug, warn};

use uefi::boot::{allocate_pages, memory_map, AllocateType};
use uefi::mem::memory_map::{MemoryMap, MemoryMapMut, MemoryMapOwned, MemoryType};

use mboot_core::mem::{MemKind, MemMap, MemRange, PAGE_SIZE};

/// Extra ranges to leave room for: the firmware keeps carving the map
/// up until the very end.
const MMAP_SLACK: usize = 64;

/// Translate a firmware memory type into the model's view.
///
/// Before `exit_boot_services` the boot-services ranges are still the
/// firmware's to use, so they must not serve as copy destinations;
/// afterwards they are plain memory.
fn kind_for(ty: MemoryType, boot_services_exited: bool) -> MemKind {
    match ty {
        MemoryType::CONVENTIONAL => MemKind::Available,
        // the loader's own image and allocations; relabeled for the
        // kernel once the hand-off map is emitted
        MemoryType::LOADER_CODE | MemoryType::LOADER_DATA => MemKind::Bootloader,
        MemoryType::BOOT_SERVICES_CODE | MemoryType::BOOT_SERVICES_DATA => {
            if boot_services_exited {
                MemKind::Available
            } else {
                MemKind::Reserved
            }
        }
        // kept out of the way in case the kernel calls the runtime services
        MemoryType::RUNTIME_SERVICES_CODE | MemoryType::RUNTIME_SERVICES_DATA => {
            MemKind::RuntimeServices
        }
        MemoryType::UNUSABLE => MemKind::Defective,
        MemoryType::ACPI_RECLAIM => MemKind::AcpiReclaim,
        MemoryType::ACPI_NON_VOLATILE => MemKind::AcpiNvs,
        MemoryType::MMIO | MemoryType::MMIO_PORT_SPACE | MemoryType::PAL_CODE => MemKind::Mmio,
        MemoryType::PERSISTENT_MEMORY => {
            if boot_services_exited {
                MemKind::Available
            } else {
                MemKind::Reserved
            }
        }
        // anything unrecognized stays off limits
        _ => MemKind::Reserved,
    }
}

/// Snapshot the current firmware map as the planning model.
pub(super) fn capture() -> MemMap {
    let mut firmware_map = memory_map(MemoryType::LOADER_DATA).expect("failed to get memory map");
    firmware_map.sort();
    let mut map = MemMap::with_capacity(firmware_map.len() + MMAP_SLACK);
    for descriptor in firmware_map.entries() {
        debug!("{descriptor:x?}");
        map.insert(MemRange::new(
            descriptor.phys_start,
            descriptor.page_count * PAGE_SIZE,
            kind_for(descriptor.ty, false),
        ));
    }
    map.merge();
    map
}

/// A generous guess at how many entries the hand-off map will need.
pub(super) fn entry_estimate(map: &MemMap) -> usize {
    map.ranges().len() + MMAP_SLACK
}

/// Ingest the final firmware map into `model` and relabel loader-owned
/// memory as available for the kernel.
///
/// `model` must have been created with enough capacity: this runs after
/// `exit_boot_services`.
pub(super) fn ingest_final(firmware_map: &MemoryMapOwned, model: &mut MemMap) {
    model.clear();
    for descriptor in firmware_map.entries() {
        // growing the model would allocate, which is no longer possible
        if model.ranges().len() >= model.capacity() {
            break;
        }
        model.insert(MemRange::new(
            descriptor.phys_start,
            descriptor.page_count * PAGE_SIZE,
            kind_for(descriptor.ty, true),
        ));
    }
    model.merge();
    model.relabel_for_handoff();
}

/// Claim a planned destination range from the firmware so that nothing
/// else gets allocated into it while boot services are still running.
///
/// The firmware may refuse (the range can cross memory it already
/// handed out, including to ourselves); that is survivable as long as
/// nothing moves in before the copy pass, so it is only a warning.
pub(super) fn pin(base: u64, len: u64) {
    let page_base = base & !(PAGE_SIZE - 1);
    let pages = ((base + len - page_base).div_ceil(PAGE_SIZE)) as usize;
    match allocate_pages(
        AllocateType::Address(page_base),
        MemoryType::LOADER_DATA,
        pages,
    ) {
        Ok(_) => debug!("pinned {page_base:#x}+{pages} pages"),
        Err(e) => warn!(
            "could not claim {page_base:#x}+{pages} pages from the firmware: {:?}",
            e.status(),
        ),
    }
}
