//! Boot information blocks
//!
//! The kernel tells us which hand-off contract it speaks by carrying a
//! header in its first loaded segment: ESXBootInfo (preferred) or legacy
//! Multiboot. The builder collects everything the kernel will want to
//! know, serializes it into one buffer, and registers that buffer as a
//! sysinfo object; every pointer inside the block is written as a
//! *source* address first and patched to its post-relocation value via
//! [`RelocTable::runtime_addr`] once placement has run.
//!
//! The memory map is the one piece that is only final after
//! `exit_boot_services`, so room for it is reserved at build time and
//! filled in place later, without allocating.

use alloc::string::String;
use alloc::vec::Vec;

use log::{debug, error, warn};

use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;
use scroll::{Pread, LE};

use crate::error::{Error, ErrorKind, Result};
use crate::mem::MemMap;
use crate::reloc::RelocTable;

pub mod esxbootinfo;
pub mod multiboot;

/// How far into the first loaded segment the header may sit.
const HEADER_SEARCH: usize = 8192;

/// The two hand-off contracts we can produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum BootInfoKind {
    Multiboot,
    EsxBootInfo,
}

bitflags::bitflags! {
    /// Request bits of the legacy Multiboot header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MultibootHeaderFlags: u32 {
        const PAGE_ALIGN = 1 << 0;
        const MEMORY_INFO = 1 << 1;
        const VIDEO_MODE = 1 << 2;
        const ADDRESS_FIELDS = 1 << 16;
    }
}

/// The header found in the kernel image.
#[derive(Clone, Copy, Debug)]
pub enum DetectedKernel {
    Multiboot(MultibootHeaderFlags),
    EsxBootInfo(u32),
}

impl DetectedKernel {
    pub const fn kind(&self) -> BootInfoKind {
        match self {
            Self::Multiboot(_) => BootInfoKind::Multiboot,
            Self::EsxBootInfo(_) => BootInfoKind::EsxBootInfo,
        }
    }

    /// The magic passed in the first argument register at kernel entry.
    pub const fn register_magic(&self) -> u32 {
        match self {
            Self::Multiboot(_) => multiboot::REGISTER_MAGIC,
            Self::EsxBootInfo(_) => esxbootinfo::REGISTER_MAGIC,
        }
    }

    pub fn wants_video(&self) -> bool {
        match self {
            Self::Multiboot(flags) => flags.contains(MultibootHeaderFlags::VIDEO_MODE),
            Self::EsxBootInfo(flags) => flags & esxbootinfo::HEADER_FLAG_VIDEO != 0,
        }
    }
}

/// Find the boot-info header in a kernel image.
///
/// The scan covers the first 8 KiB of the first program-loaded
/// segment's file bytes: ESXBootInfo at 8-byte alignment wins over
/// Multiboot at 4-byte alignment.
pub fn detect(image: &[u8]) -> Result<DetectedKernel> {
    let binary = Elf::parse(image).map_err(|e| {
        warn!("kernel is not a readable ELF image: {e}");
        Error::new(ErrorKind::BadType)
    })?;
    let segment = binary
        .program_headers
        .iter()
        .find(|ph| ph.p_type == PT_LOAD && ph.p_filesz > 0)
        .ok_or_else(|| {
            warn!("kernel has no loaded segment to search for a header");
            Error::new(ErrorKind::BadType)
        })?;
    let start = segment.p_offset as usize;
    let end = start
        .checked_add(segment.p_filesz as usize)
        .filter(|&e| e <= image.len())
        .ok_or(Error::new(ErrorKind::UnexpectedEof))?;
    scan(&image[start..end]).ok_or_else(|| {
        error!("kernel carries neither an ESXBootInfo nor a Multiboot header");
        Error::new(ErrorKind::Unsupported)
    })
}

/// The aligned magic-number scan over one segment's file bytes.
fn scan(segment: &[u8]) -> Option<DetectedKernel> {
    let window = &segment[..segment.len().min(HEADER_SEARCH)];
    for off in (0..window.len().saturating_sub(7)).step_by(8) {
        if window.pread_with::<u32>(off, LE).ok()? == esxbootinfo::HEADER_MAGIC {
            let flags = window.pread_with::<u32>(off + 4, LE).unwrap_or(0);
            debug!("found ESXBootInfo header at offset {off:#x} (flags {flags:#x})");
            return Some(DetectedKernel::EsxBootInfo(flags));
        }
    }
    for off in (0..window.len().saturating_sub(11)).step_by(4) {
        if window.pread_with::<u32>(off, LE).ok()? != multiboot::HEADER_MAGIC {
            continue;
        }
        let flags: u32 = window.pread_with(off + 4, LE).ok()?;
        let checksum: u32 = window.pread_with(off + 8, LE).ok()?;
        if multiboot::HEADER_MAGIC
            .wrapping_add(flags)
            .wrapping_add(checksum)
            != 0
        {
            continue;
        }
        debug!("found Multiboot header at offset {off:#x} (flags {flags:#x})");
        if flags & MultibootHeaderFlags::ADDRESS_FIELDS.bits() != 0 {
            warn!("kernel requests header-addressed loading, using its ELF headers instead");
        }
        return Some(DetectedKernel::Multiboot(MultibootHeaderFlags::from_bits_retain(flags)));
    }
    None
}

/// A module as the info block describes it.
pub struct ModuleEntry {
    /// the staging buffer the module was loaded (and decompressed) into
    pub src: u64,
    pub size: u64,
    /// "path options..."
    pub cmdline: String,
}

/// Linear framebuffer description, straight from the GOP.
#[derive(Clone, Copy, Debug)]
pub struct Framebuffer {
    pub addr: u64,
    /// bytes per scanline
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u8,
    /// (field position, mask size) per channel
    pub red: (u8, u8),
    pub green: (u8, u8),
    pub blue: (u8, u8),
}

/// Firmware hand-off details for the EFI record.
#[derive(Clone, Copy, Debug)]
pub struct EfiInfo {
    /// physical address of the EFI system table
    pub system_table: u64,
    pub secure_boot: bool,
}

/// Everything that goes into the info block.
pub struct BootInfo {
    pub kind: BootInfoKind,
    pub cmdline: String,
    pub loader_name: String,
    pub modules: Vec<ModuleEntry>,
    pub framebuffer: Option<Framebuffer>,
    pub efi: Option<EfiInfo>,
    /// how many memory-map entries to reserve room for
    pub mmap_capacity: usize,
}

impl BootInfo {
    /// Serialize into a buffer of final size.
    ///
    /// Pointer fields are left null; [`BuiltInfo::fix_pointers`] fills
    /// them once the relocation engine knows where everything lands.
    pub fn build(&self) -> Result<BuiltInfo> {
        match self.kind {
            BootInfoKind::Multiboot => multiboot::build(self),
            BootInfoKind::EsxBootInfo => esxbootinfo::build(self),
        }
    }
}

/// How a pointer slot is patched.
#[derive(Clone, Copy, Debug)]
pub(crate) enum FixupKind {
    /// 32-bit physical pointer
    Ptr32,
    /// 64-bit physical pointer
    Ptr64,
    /// 32-bit one-past-the-end pointer
    End32,
    /// 64-bit page number (address shifted right by 12)
    Page64,
}

/// A pointer slot: `orig` is the source address the slot stands for.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Fixup {
    pub offset: usize,
    pub kind: FixupKind,
    pub orig: u64,
}

/// Where the memory map goes, once it is final.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MmapSlot {
    pub offset: usize,
    pub len: usize,
    /// how many elements the stream holds besides the memory ranges
    /// (the ESXBootInfo element count covers both)
    pub fixed_elements: u32,
}

/// A serialized info block, ready to be registered as a sysinfo object.
pub struct BuiltInfo {
    kind: BootInfoKind,
    buf: Vec<u8>,
    fixups: Vec<Fixup>,
    mmap: MmapSlot,
}

impl BuiltInfo {
    pub(crate) fn new(kind: BootInfoKind, buf: Vec<u8>, fixups: Vec<Fixup>, mmap: MmapSlot) -> Self {
        Self { kind, buf, fixups, mmap }
    }

    /// Source address of the block (register this as a sysinfo object).
    pub fn addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Replace every pointer slot with the post-relocation address of
    /// the object it refers to.
    pub fn fix_pointers(&mut self, table: &RelocTable) -> Result<()> {
        for i in 0..self.fixups.len() {
            let f = self.fixups[i];
            if f.orig == 0 {
                continue;
            }
            match f.kind {
                FixupKind::Ptr64 => {
                    let addr = table.runtime_addr(f.orig)?;
                    put_u64(&mut self.buf, f.offset, addr);
                }
                FixupKind::Page64 => {
                    let addr = table.runtime_addr(f.orig)?;
                    debug_assert_eq!(addr % 4096, 0, "page-range object is not page-aligned");
                    put_u64(&mut self.buf, f.offset, addr >> 12);
                }
                FixupKind::Ptr32 => {
                    let addr = table.runtime_addr(f.orig)?;
                    put_u32(&mut self.buf, f.offset, to_u32(addr)?);
                }
                FixupKind::End32 => {
                    let addr = table.runtime_addr(f.orig - 1)? + 1;
                    put_u32(&mut self.buf, f.offset, to_u32(addr)?);
                }
            }
        }
        Ok(())
    }

    /// Convert the (by now stable) memory map to wire format, in place.
    ///
    /// This runs after `exit_boot_services` and therefore must not
    /// allocate; the caller has already relabeled loader-owned ranges.
    /// Returns the number of descriptors written.
    pub fn write_memory_map(&mut self, map: &MemMap) -> Result<usize> {
        match self.kind {
            BootInfoKind::Multiboot => multiboot::write_memory_map(&mut self.buf, self.mmap, map),
            BootInfoKind::EsxBootInfo => {
                esxbootinfo::write_memory_map(&mut self.buf, self.mmap, map)
            }
        }
    }

    /// Post-emission sanity checks: the map must be sorted and sized
    /// correctly; overlaps are only worth a warning.
    pub fn check(&self) -> Result<()> {
        match self.kind {
            BootInfoKind::Multiboot => multiboot::check(&self.buf, self.mmap),
            BootInfoKind::EsxBootInfo => esxbootinfo::check(&self.buf),
        }
    }
}

pub(crate) fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

pub(crate) fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

/// Write a NUL-terminated string and return its offset.
pub(crate) fn put_cstr(buf: &mut [u8], off: usize, s: &str) -> usize {
    buf[off..off + s.len()].copy_from_slice(s.as_bytes());
    buf[off + s.len()] = 0;
    off + s.len() + 1
}

fn to_u32(addr: u64) -> Result<u32> {
    addr.try_into().map_err(|_| {
        error!("{addr:#x} does not fit into a 32-bit pointer field");
        Error::new(ErrorKind::Unsupported)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment_with(off: usize, words: &[u32]) -> Vec<u8> {
        let mut seg = vec![0u8; 0x2000];
        for (i, w) in words.iter().enumerate() {
            seg[off + 4 * i..off + 4 * (i + 1)].copy_from_slice(&w.to_le_bytes());
        }
        seg
    }

    #[test]
    fn scan_finds_multiboot_with_valid_checksum() {
        let flags = MultibootHeaderFlags::MEMORY_INFO.bits();
        let checksum = 0u32
            .wrapping_sub(multiboot::HEADER_MAGIC)
            .wrapping_sub(flags);
        let seg = segment_with(0x30, &[multiboot::HEADER_MAGIC, flags, checksum]);
        match scan(&seg) {
            Some(DetectedKernel::Multiboot(f)) => {
                assert!(f.contains(MultibootHeaderFlags::MEMORY_INFO));
            }
            other => panic!("expected a Multiboot header, got {other:?}"),
        }
    }

    #[test]
    fn scan_rejects_multiboot_with_bad_checksum() {
        let seg = segment_with(0x30, &[multiboot::HEADER_MAGIC, 0, 0xdead]);
        assert!(scan(&seg).is_none());
    }

    #[test]
    fn scan_prefers_esxbootinfo() {
        let flags = 0u32;
        let checksum = 0u32.wrapping_sub(multiboot::HEADER_MAGIC);
        let mut seg = segment_with(0x10, &[multiboot::HEADER_MAGIC, flags, checksum]);
        seg[0x40..0x44].copy_from_slice(&esxbootinfo::HEADER_MAGIC.to_le_bytes());
        match scan(&seg) {
            Some(DetectedKernel::EsxBootInfo(_)) => (),
            other => panic!("expected the ESXBootInfo header to win, got {other:?}"),
        }
    }

    #[test]
    fn scan_ignores_unaligned_and_distant_magics() {
        // 8 KiB in is too far
        let mut seg = vec![0u8; 0x4000];
        seg[0x2100..0x2104].copy_from_slice(&esxbootinfo::HEADER_MAGIC.to_le_bytes());
        assert!(scan(&seg).is_none());
        // an ESXBootInfo magic at 4 but not 8 alignment does not count
        let mut seg = vec![0u8; 0x2000];
        seg[0x14..0x18].copy_from_slice(&esxbootinfo::HEADER_MAGIC.to_le_bytes());
        assert!(scan(&seg).is_none());
    }
}
