//! ELF registration
//!
//! The registrar validates a kernel image, finds out how much room its
//! loadable segments span, gets a destination range from the allocator
//! and registers one relocation entry per segment (plus a zero-fill for
//! each BSS tail). It never copies a byte itself.

use log::{debug, warn};

use goblin::elf::header::{
    EI_CLASS, EI_DATA, ELFCLASS32, ELFCLASS64, ELFDATA2LSB, ELFMAG, EM_386, EM_X86_64, ET_EXEC,
};
use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;

use crate::error::{Error, ErrorKind, Result};
use crate::mem::{AllocClass, MemMap};
use crate::reloc::{RelocKind, RelocTable};

/// What [`register_elf`] found out about the image.
#[derive(Debug)]
pub struct RegisteredKernel {
    /// post-relocation entry point
    pub entry: u64,
    /// where the image was linked to live
    pub link_base: u64,
    /// where it will actually live
    pub load_base: u64,
    /// span of the loadable segments
    pub size: u64,
}

/// Validate `image` and register a relocation entry per loadable
/// segment. `exec_align` is the architecture's execution alignment
/// (see [`crate::mem::EXEC_ALIGN`]).
///
/// Nothing is allocated before the image has been validated, so a
/// rejected image leaves the allocator untouched.
pub fn register_elf(
    table: &mut RelocTable,
    map: &mut MemMap,
    image: &[u8],
    class: AllocClass,
    exec_align: u64,
) -> Result<RegisteredKernel> {
    if image.len() < 16 || &image[0..4] != ELFMAG {
        return Err(Error::new(ErrorKind::BadType));
    }
    if !matches!(image[EI_CLASS], ELFCLASS32 | ELFCLASS64) || image[EI_DATA] != ELFDATA2LSB {
        return Err(Error::new(ErrorKind::BadArch));
    }
    let binary = Elf::parse(image).map_err(|e| {
        warn!("malformed ELF image: {e}");
        Error::new(ErrorKind::BadHeader)
    })?;
    match (binary.is_64, binary.header.e_machine) {
        (true, EM_X86_64) | (false, EM_386) => (),
        (_, machine) => {
            warn!("ELF machine type {machine:#x} does not match this platform");
            return Err(Error::new(ErrorKind::BadArch));
        }
    }
    if binary.header.e_version != 1 {
        warn!(
            "{}: ELF version is {}, expected 1",
            Error::warning(ErrorKind::IncompatibleVersion),
            binary.header.e_version,
        );
    }
    if binary.header.e_type != ET_EXEC {
        warn!(
            "{}: ELF type is {:#x}, booting it anyway",
            Error::warning(ErrorKind::NotExecutable),
            binary.header.e_type,
        );
    }

    let loadable: alloc::vec::Vec<_> = binary
        .program_headers
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD && ph.p_memsz > 0)
        .collect();
    if loadable.is_empty() {
        warn!("ELF image has no loadable segments");
        return Err(Error::new(ErrorKind::BadType));
    }
    let mut link_base = u64::MAX;
    let mut link_end = 0u64;
    for ph in &loadable {
        if ph.p_filesz > 0 {
            let file_end = ph
                .p_offset
                .checked_add(ph.p_filesz)
                .ok_or(Error::new(ErrorKind::BadHeader))?;
            if file_end > image.len() as u64 {
                warn!(
                    "segment at {:#x}+{:#x} extends past the end of the image",
                    ph.p_offset, ph.p_filesz,
                );
                return Err(Error::new(ErrorKind::UnexpectedEof));
            }
        }
        link_base = link_base.min(ph.p_paddr);
        link_end = link_end.max(
            ph.p_paddr
                .checked_add(ph.p_memsz)
                .ok_or(Error::new(ErrorKind::BadHeader))?,
        );
    }

    let size = link_end - link_base;
    let load_base = map.allocate(size, exec_align, class)?;
    // the constant offset between linked and runtime addresses
    let addend = load_base.wrapping_sub(link_base);
    debug!(
        "kernel linked for {link_base:#x}+{size:#x}, loading at {load_base:#x} (addend {addend:#x})",
    );

    for ph in &loadable {
        let dest = ph.p_paddr.wrapping_add(addend);
        if ph.p_filesz > 0 {
            table.register(
                map,
                RelocKind::Kernel,
                Some(image.as_ptr() as u64 + ph.p_offset),
                ph.p_filesz,
                Some(dest),
                1,
            )?;
        }
        if ph.p_memsz > ph.p_filesz {
            table.register(
                map,
                RelocKind::Kernel,
                None,
                ph.p_memsz - ph.p_filesz,
                Some(dest + ph.p_filesz),
                1,
            )?;
        }
    }

    Ok(RegisteredKernel {
        entry: binary.entry.wrapping_add(addend),
        link_base,
        load_base,
        size,
    })
}
