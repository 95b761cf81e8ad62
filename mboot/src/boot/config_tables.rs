//! Handle UEFI config tables.
//!
//! The kernel finds the ACPI and SMBIOS tables through the EFI system
//! table, but an ESXi-style kernel will not get far without ACPI, so we
//! look the pointers up early and complain while there is still a
//! console to complain on.

use alloc::vec::Vec;

use log::{debug, warn};

use acpi::rsdp::Rsdp;
use uefi::system::with_config_table;
use uefi::table::cfg::{ConfigTableEntry, ACPI2_GUID, ACPI_GUID, SMBIOS3_GUID, SMBIOS_GUID};

/// Addresses of the firmware-provided system tables.
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct SystemTables {
    pub rsdp: Option<u64>,
    pub smbios: Option<u64>,
}

/// Go through all of the configuration tables.
pub(super) fn find() -> SystemTables {
    // `with_config_table` only lends the slice to a `Fn`, so take a
    // copy of the entries and walk that instead
    let config_tables: Vec<ConfigTableEntry> = with_config_table(<[ConfigTableEntry]>::to_vec);
    let mut found = SystemTables::default();
    debug!("going through configuration tables...");
    for table in config_tables {
        match table.guid {
            ACPI2_GUID => handle_acpi(&table, 2, &mut found),
            ACPI_GUID => {
                // only as a fallback: the v2 table is the one to trust
                if found.rsdp.is_none() {
                    handle_acpi(&table, 0, &mut found);
                }
            }
            SMBIOS_GUID | SMBIOS3_GUID => {
                debug!("SMBIOS entry point at {:p}", table.address);
                found.smbios = Some(table.address as u64);
            }
            guid => debug!("ignoring table {guid}"),
        }
    }
    if found.rsdp.is_none() {
        warn!("no valid ACPI RSDP found, the kernel will be unhappy");
    }
    found
}

/// Validate the RSDP before pointing anyone at it.
fn handle_acpi(table: &ConfigTableEntry, expected_revision: u8, found: &mut SystemTables) {
    debug!("handling ACPI RSDP");
    let rsdp: Rsdp = unsafe { *(table.address.cast()) };
    if rsdp.validate().is_err() {
        warn!("ignoring an RSDP that fails validation");
        return;
    }
    if rsdp.revision() != expected_revision {
        warn!(
            "expected RSDP version {expected_revision}, but got {}",
            rsdp.revision(),
        );
    }
    found.rsdp = Some(table.address as u64);
}
