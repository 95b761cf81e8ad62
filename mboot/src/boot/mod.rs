//! This module handles the actual boot and related stuff.
//!
//! This means: loading kernel and modules, registering everything with
//! the relocation engine, building the boot information block,
//! installing the trampoline and finally tearing the firmware down and
//! jumping.

use alloc::format;
use alloc::vec::Vec;

use core::arch::asm;

use uefi::boot::{exit_boot_services, set_watchdog_timer};
use uefi::mem::memory_map::MemoryType;
use uefi::prelude::*;
use uefi::cstr16;
use uefi::runtime::VariableVendor;
use uefi::table::system_table_raw;

use log::{debug, error, info, warn};

use mboot_core::elf::register_elf;
use mboot_core::error::{Error, ErrorKind};
use mboot_core::handoff::{CacheOps, HandoffRecord};
use mboot_core::info::{detect, BootInfo, BootInfoKind, BuiltInfo, EfiInfo, ModuleEntry};
use mboot_core::mem::{AllocClass, MemKind, MemMap, EXEC_ALIGN, PAGE_SIZE};
use mboot_core::reloc::{InstalledTrampoline, PlacePolicy, RelocKind, RelocTable};

use mboot_config::Config;

use super::error_status;
use super::file::File;

mod config_tables;
mod memmap;
mod tramp;
mod video;

/// Our watchdog code (anything above the firmware-reserved 0xffff).
const WATCHDOG_CODE: u64 = 0x10000 + 0xb007;

/// x86 caches are coherent; the trampoline commits with a single
/// `wbinvd` on its own.
struct CoherentCache;

impl CacheOps for CoherentCache {}

/// A module staged in memory.
struct LoadedModule {
    /// "path options...", as the kernel will see it
    cmdline: alloc::string::String,
    /// size on the boot volume, before extraction
    compressed_size: usize,
    data: Vec<u8>,
}

/// An entry that is ready to boot: everything is loaded and placed, the
/// trampoline is installed, only the firmware teardown is left.
pub(crate) struct PreparedEntry<'a> {
    config: &'a Config,
    built: BuiltInfo,
    /// preallocated model the final firmware map is ingested into
    final_map: MemMap,
    tramp: InstalledTrampoline,
    // staging buffers; the copy pass reads from these, so they have to
    // stay alive until the kernel runs
    kernel_vec: Vec<u8>,
    modules: Vec<LoadedModule>,
    acpi_tables: Vec<Vec<u8>>,
}

impl<'a> PreparedEntry<'a> {
    /// Prepare the configured kernel for boot.
    ///
    /// In order:
    /// 1. load the kernel and detect its hand-off flavor
    /// 2. load (and maybe decompress) the modules and ACPI tables
    /// 3. snapshot the firmware memory map
    /// 4. register everything with the relocation engine and place it
    /// 5. build the info block and patch its pointers
    /// 6. install the trampoline and seed the hand-off record
    ///
    /// Nothing in here is destructive; on failure the caller gets the
    /// error and the firmware stays fully usable.
    pub(crate) fn new(config: &'a Config, image_fs_handle: Handle) -> Result<Self, Status> {
        let kernel_vec: Vec<u8> = File::open(&config.kernel, image_fs_handle)?.try_into()?;
        let detected = detect(&kernel_vec).map_err(error_status)?;
        info!("kernel speaks {}", detected.kind());

        // every module must be there; a missing file aborts the entry
        let mut modules = Vec::with_capacity(config.modules.len());
        for module in &config.modules {
            let file = File::open(&module.image, image_fs_handle)?;
            debug!("(size hint: {} bytes)", file.size());
            let data: Vec<u8> = file.try_into()?;
            let compressed_size = data.len();
            let data = extract_module(&module.image, data).map_err(error_status)?;
            modules.push(LoadedModule {
                cmdline: module.cmdline(),
                compressed_size,
                data,
            });
        }
        info!("loaded {} modules", modules.len());
        let mut acpi_tables = Vec::with_capacity(config.acpi_tables.len());
        for path in &config.acpi_tables {
            let data: Vec<u8> = File::open(path, image_fs_handle)?.try_into()?;
            acpi_tables.push(data);
        }
        if config.crypto.is_some() {
            // signature verification is the crypto module's business,
            // and that runs inside the kernel
            debug!("crypto module configured, loading is left to the kernel");
        }

        let system_tables = config_tables::find();
        let framebuffer = video::framebuffer(detected.wants_video());

        let mut map = memmap::capture();
        let mmap_capacity = memmap::entry_estimate(&map);
        let mut table = RelocTable::new();
        let kernel = register_elf(
            &mut table,
            &mut map,
            &kernel_vec,
            AllocClass::Below4Gb,
            EXEC_ALIGN,
        )
        .map_err(error_status)?;
        info!(
            "kernel loads at {:#x}, will be entered at {:#x}",
            kernel.load_base, kernel.entry,
        );
        for module in &modules {
            debug!(
                "module '{}': {} bytes ({} on disk)",
                module.cmdline, module.data.len(), module.compressed_size,
            );
            table
                .register(
                    &mut map,
                    RelocKind::Module,
                    Some(module.data.as_ptr() as u64),
                    module.data.len() as u64,
                    None,
                    PAGE_SIZE,
                )
                .map_err(error_status)?;
        }
        for data in &acpi_tables {
            table
                .register(
                    &mut map,
                    RelocKind::Sysinfo,
                    Some(data.as_ptr() as u64),
                    data.len() as u64,
                    None,
                    64,
                )
                .map_err(error_status)?;
        }

        if !config.no_bootif {
            // BOOTIF= only exists on network boots, which we don't do
            debug!("no network boot, not injecting BOOTIF=");
        }
        let efi = if config.no_rts {
            info!("norts=1: not passing UEFI runtime services to the kernel");
            None
        } else {
            system_table_raw().map(|systab| EfiInfo {
                system_table: systab.as_ptr() as u64,
                secure_boot: secure_boot_enabled(),
            })
        };
        let boot_info = BootInfo {
            kind: detected.kind(),
            cmdline: config.kernel_cmdline(),
            loader_name: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            modules: modules
                .iter()
                .map(|module| ModuleEntry {
                    src: module.data.as_ptr() as u64,
                    size: module.data.len() as u64,
                    cmdline: module.cmdline.clone(),
                })
                .collect(),
            framebuffer,
            efi,
            mmap_capacity,
        };
        let mut built = boot_info.build().map_err(error_status)?;
        table
            .register(
                &mut map,
                RelocKind::Sysinfo,
                Some(built.addr()),
                built.len() as u64,
                None,
                8,
            )
            .map_err(error_status)?;

        let policy = PlacePolicy::x86(detected.kind() == BootInfoKind::Multiboot);
        unsafe { table.compute(&mut map, &policy) }.map_err(error_status)?;
        // claim every planned destination from the firmware so nothing
        // else moves in while boot services are still running
        for range in map.ranges().iter().filter(|r| r.kind == MemKind::Allocated) {
            memmap::pin(range.base, range.len);
        }
        built.fix_pointers(&table).map_err(error_status)?;

        let tramp = unsafe {
            table.install_trampoline(
                &mut map,
                &tramp::image(),
                policy.trampoline,
                &CoherentCache,
                &mut |base, len| memmap::pin(base, len),
            )
        }
        .map_err(error_status)?;
        let info_runtime = table.runtime_addr(built.addr()).map_err(error_status)?;
        unsafe {
            HandoffRecord::finalize_at(
                tramp.handoff,
                info_runtime,
                kernel.entry,
                detected.register_magic(),
            );
        }
        debug!(
            "hand-off record at {:#x}, info block at {info_runtime:#x}",
            tramp.handoff,
        );
        if system_tables.rsdp.is_none() && detected.kind() == BootInfoKind::EsxBootInfo {
            warn!("booting an ESXBootInfo kernel without ACPI");
        }

        // a trial emission from the planning map runs the sanity checks
        // while the console still exists; the real map is written after
        // the firmware is gone
        map.relabel_for_handoff();
        built.write_memory_map(&map).map_err(error_status)?;
        built.check().map_err(error_status)?;

        Ok(PreparedEntry {
            config,
            built,
            final_map: MemMap::with_capacity(mmap_capacity),
            tramp,
            kernel_vec,
            modules,
            acpi_tables,
        })
    }

    /// Actually boot the entry.
    ///
    /// In order:
    /// 1. arm (or disarm) the firmware watchdog
    /// 2. exit boot services
    /// 3. write the final memory map into the info block
    /// 4. jump to the trampoline, which runs the copy pass and enters
    ///    the kernel
    ///
    /// There is no way back out of this.
    pub(crate) fn boot(mut self) -> ! {
        if self.config.runtime_watchdog {
            let timeout = self.config.runtime_watchdog_timeout;
            match set_watchdog_timer(timeout as usize, WATCHDOG_CODE, None) {
                Ok(()) => info!("watchdog armed with a {timeout} second timeout"),
                Err(e) => warn!("failed to arm the watchdog: {:?}", e.status()),
            }
        } else if let Err(e) = set_watchdog_timer(0, WATCHDOG_CODE, None) {
            debug!("failed to disarm the watchdog: {:?}", e.status());
        }
        // The copy pass reads from the staging buffers; make sure they
        // stay around indefinitely.
        core::mem::forget(self.kernel_vec);
        core::mem::forget(self.modules);
        core::mem::forget(self.acpi_tables);

        info!(
            "exiting boot services; jumping to the trampoline at {:#x}",
            self.tramp.entry,
        );
        let firmware_map = unsafe { exit_boot_services(MemoryType::LOADER_DATA) };
        // From here on there is no console, no allocator and no way
        // back; any failure ends in a halt.
        memmap::ingest_final(&firmware_map, &mut self.final_map);
        if self.built.write_memory_map(&self.final_map).is_err() {
            hang();
        }
        unsafe {
            x86::irq::disable();
            asm!(
                "jmp {entry}",
                entry = in(reg) self.tramp.entry,
                in("rdi") self.tramp.handoff,
                options(noreturn),
            );
        }
    }
}

/// Halt forever; for errors after the firmware is gone.
fn hang() -> ! {
    loop {
        unsafe { x86::halt() };
    }
}

/// Is the firmware enforcing Secure Boot?
fn secure_boot_enabled() -> bool {
    let mut buf = [0u8; 1];
    match uefi::runtime::get_variable(
        cstr16!("SecureBoot"),
        &VariableVendor::GLOBAL_VARIABLE,
        &mut buf,
    ) {
        Ok((data, _)) => data.first() == Some(&1),
        Err(_) => false,
    }
}

/// Decompress a module, tolerating modules that were never compressed.
///
/// Only a missing gzip signature falls back to the raw bytes; a module
/// that *is* gzipped but damaged stays a hard error.
fn extract_module(name: &str, data: Vec<u8>) -> mboot_core::Result<Vec<u8>> {
    match gunzip(&data) {
        Ok(raw) => {
            debug!("decompressed '{name}': {} -> {} bytes", data.len(), raw.len());
            Ok(raw)
        }
        Err(e) if e.kind == ErrorKind::BadType => {
            warn!("module '{name}' is not gzipped, using it as-is");
            Ok(data)
        }
        Err(e) => {
            error!("failed to decompress module '{name}': {e}");
            Err(e)
        }
    }
}

// gzip member header flags
const FHCRC: u8 = 1 << 1;
const FEXTRA: u8 = 1 << 2;
const FNAME: u8 = 1 << 3;
const FCOMMENT: u8 = 1 << 4;

/// Unpack a gzip member.
fn gunzip(data: &[u8]) -> mboot_core::Result<Vec<u8>> {
    if data.len() < 18 || data[0] != 0x1f || data[1] != 0x8b {
        return Err(Error::warning(ErrorKind::BadType));
    }
    if data[2] != 8 {
        // a gzip signature with an unknown compression method
        return Err(Error::new(ErrorKind::VolumeCorrupted));
    }
    let flags = data[3];
    let mut off = 10;
    let eof = Error::new(ErrorKind::UnexpectedEof);
    if flags & FEXTRA != 0 {
        let xlen = u16::from_le_bytes(data.get(off..off + 2).ok_or(eof)?.try_into().unwrap());
        off += 2 + xlen as usize;
    }
    if flags & FNAME != 0 {
        off += data.get(off..).ok_or(eof)?.iter().position(|&b| b == 0).ok_or(eof)? + 1;
    }
    if flags & FCOMMENT != 0 {
        off += data.get(off..).ok_or(eof)?.iter().position(|&b| b == 0).ok_or(eof)? + 1;
    }
    if flags & FHCRC != 0 {
        off += 2;
    }
    if off + 8 > data.len() {
        return Err(eof);
    }
    let deflate = &data[off..data.len() - 8];
    let raw = miniz_oxide::inflate::decompress_to_vec(deflate)
        .map_err(|_| Error::new(ErrorKind::VolumeCorrupted))?;
    let expected = u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap());
    if raw.len() as u32 != expected {
        return Err(Error::new(ErrorKind::VolumeCorrupted));
    }
    Ok(raw)
}
