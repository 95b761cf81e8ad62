//! The ESXBootInfo element stream.
//!
//! A count-prefixed sequence of self-describing records: every element
//! starts with `{type: u32, elmtSize: u32}` and `elmtSize` covers that
//! header, so consumers can skip records they do not know. All integers
//! are little-endian; element sizes are kept multiples of 8 so the u64
//! fields stay naturally aligned.
//!
//! The element type codes and the header/register magics are defined
//! here and nowhere else; the trampoline and the detection scan both
//! use these constants.

use alloc::vec;
use alloc::vec::Vec;

use log::warn;

use crate::error::{Error, ErrorKind, Result};
use crate::info::{
    get_u32, get_u64, put_cstr, put_u32, put_u64, BootInfo, BootInfoKind, BuiltInfo, Fixup,
    FixupKind, MmapSlot,
};
use crate::mem::{align_up, MemMap};

/// Magic leading the header inside the kernel image.
pub const HEADER_MAGIC: u32 = 0x1BAD_B005;
/// Magic handed to the kernel in the first argument register.
pub const REGISTER_MAGIC: u32 = 0x2BAD_B005;

/// Header flag: the kernel wants a framebuffer set up.
pub const HEADER_FLAG_VIDEO: u32 = 1 << 2;

// element type codes
pub const ELMT_MEMRANGE: u32 = 1;
pub const ELMT_MODULE: u32 = 2;
pub const ELMT_VBE: u32 = 3;
pub const ELMT_EFI: u32 = 4;
pub const ELMT_CMDLINE: u32 = 5;
pub const ELMT_LOADER: u32 = 6;

bitflags::bitflags! {
    /// Flag word of the EFI element.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EfiFlags: u32 {
        /// the system table is 64-bit
        const EFI64 = 1 << 0;
        /// the firmware booted with Secure Boot enforced
        const SECURE_BOOT = 1 << 1;
    }
}

/// stream header: element count plus padding to 8 bytes
const STREAM_HEADER: usize = 8;
/// per-element header: type and size
const ELMT_HEADER: usize = 8;

const CMDLINE_SIZE: usize = ELMT_HEADER + 8;
const LOADER_SIZE: usize = ELMT_HEADER + 8;
/// module element with a single page range
const MODULE_SIZE: usize = ELMT_HEADER + 16 + 16;
const VBE_SIZE: usize = ELMT_HEADER + 32;
const EFI_SIZE: usize = ELMT_HEADER + 16;
const MEMRANGE_SIZE: usize = ELMT_HEADER + 24;

fn put_elmt_header(buf: &mut [u8], off: usize, ty: u32, size: usize) {
    put_u32(buf, off, ty);
    put_u32(buf, off + 4, size as u32);
}

pub(super) fn build(info: &BootInfo) -> Result<BuiltInfo> {
    let mut elements = STREAM_HEADER + CMDLINE_SIZE + LOADER_SIZE;
    elements += info.modules.len() * MODULE_SIZE;
    if info.framebuffer.is_some() {
        elements += VBE_SIZE;
    }
    if info.efi.is_some() {
        elements += EFI_SIZE;
    }
    let strings_off = elements;
    let strings_len = info.cmdline.len() + 1
        + info.loader_name.len() + 1
        + info.modules.iter().map(|m| m.cmdline.len() + 1).sum::<usize>();
    let mmap_off = align_up((strings_off + strings_len) as u64, 8).unwrap() as usize;
    let mmap_len = info.mmap_capacity * MEMRANGE_SIZE;
    let mut buf = vec![0u8; mmap_off + mmap_len];
    let addr = buf.as_ptr() as u64;
    let mut fixups = Vec::new();
    let mut fixed_elmts = 0u32;
    let mut off = STREAM_HEADER;
    let mut s = strings_off;

    put_elmt_header(&mut buf, off, ELMT_CMDLINE, CMDLINE_SIZE);
    fixups.push(Fixup { offset: off + 8, kind: FixupKind::Ptr64, orig: addr + s as u64 });
    s = put_cstr(&mut buf, s, &info.cmdline);
    off += CMDLINE_SIZE;
    fixed_elmts += 1;

    put_elmt_header(&mut buf, off, ELMT_LOADER, LOADER_SIZE);
    fixups.push(Fixup { offset: off + 8, kind: FixupKind::Ptr64, orig: addr + s as u64 });
    s = put_cstr(&mut buf, s, &info.loader_name);
    off += LOADER_SIZE;
    fixed_elmts += 1;

    for module in &info.modules {
        put_elmt_header(&mut buf, off, ELMT_MODULE, MODULE_SIZE);
        fixups.push(Fixup { offset: off + 8, kind: FixupKind::Ptr64, orig: addr + s as u64 });
        s = put_cstr(&mut buf, s, &module.cmdline);
        put_u32(&mut buf, off + 16, module.size as u32);
        put_u32(&mut buf, off + 20, 1); // one contiguous page range
        fixups.push(Fixup { offset: off + 24, kind: FixupKind::Page64, orig: module.src });
        put_u32(&mut buf, off + 32, module.size.div_ceil(4096) as u32);
        off += MODULE_SIZE;
        fixed_elmts += 1;
    }

    if let Some(fb) = &info.framebuffer {
        put_elmt_header(&mut buf, off, ELMT_VBE, VBE_SIZE);
        put_u64(&mut buf, off + 8, fb.addr);
        put_u32(&mut buf, off + 16, fb.pitch);
        put_u32(&mut buf, off + 20, fb.width);
        put_u32(&mut buf, off + 24, fb.height);
        buf[off + 28] = fb.bpp;
        buf[off + 29] = 1; // direct color
        buf[off + 30] = fb.red.0;
        buf[off + 31] = fb.red.1;
        buf[off + 32] = fb.green.0;
        buf[off + 33] = fb.green.1;
        buf[off + 34] = fb.blue.0;
        buf[off + 35] = fb.blue.1;
        off += VBE_SIZE;
        fixed_elmts += 1;
    }

    if let Some(efi) = &info.efi {
        put_elmt_header(&mut buf, off, ELMT_EFI, EFI_SIZE);
        let mut flags = EfiFlags::EFI64;
        if efi.secure_boot {
            flags |= EfiFlags::SECURE_BOOT;
        }
        put_u32(&mut buf, off + 8, flags.bits());
        // the system table is firmware memory and does not relocate
        put_u64(&mut buf, off + 16, efi.system_table);
        off += EFI_SIZE;
        fixed_elmts += 1;
    }

    debug_assert_eq!(off, strings_off);
    put_u32(&mut buf, 0, fixed_elmts);

    Ok(BuiltInfo::new(
        BootInfoKind::EsxBootInfo,
        buf,
        fixups,
        MmapSlot { offset: mmap_off, len: mmap_len, fixed_elements: fixed_elmts },
    ))
}

/// Append one MEMRANGE element per merged wire range and update the
/// element count.
pub(super) fn write_memory_map(buf: &mut [u8], slot: MmapSlot, map: &MemMap) -> Result<usize> {
    let fixed = slot.fixed_elements;
    let mut count = 0usize;
    let mut at = slot.offset;
    let mut pending: Option<(u64, u64, u32, u64)> = None;
    let mut flush = |buf: &mut [u8], at: &mut usize, entry: (u64, u64, u32, u64)| -> Result<()> {
        if *at + MEMRANGE_SIZE > slot.offset + slot.len {
            return Err(Error::new(ErrorKind::BufferTooSmall));
        }
        put_elmt_header(buf, *at, ELMT_MEMRANGE, MEMRANGE_SIZE);
        put_u64(buf, *at + 8, entry.0);
        put_u64(buf, *at + 16, entry.1);
        put_u32(buf, *at + 24, entry.2);
        put_u32(buf, *at + 28, entry.3 as u32);
        *at += MEMRANGE_SIZE;
        Ok(())
    };
    for r in map.ranges() {
        let next = (r.base, r.len, r.kind.e820_type(), r.attrs);
        if let Some(p) = pending.as_mut() {
            if p.2 == next.2 && p.3 == next.3 && p.0 + p.1 == next.0 {
                p.1 += next.1;
                continue;
            }
        }
        if let Some(p) = pending.take() {
            flush(buf, &mut at, p)?;
            count += 1;
        }
        pending = Some(next);
    }
    if let Some(p) = pending {
        flush(buf, &mut at, p)?;
        count += 1;
    }
    put_u32(buf, 0, fixed + count as u32);
    Ok(count)
}

/// Post-emission checks over the whole element stream.
pub(super) fn check(buf: &[u8]) -> Result<()> {
    let count = get_u32(buf, 0);
    let mut off = STREAM_HEADER;
    let mut prev: Option<(u64, u64)> = None;
    for _ in 0..count {
        if off + ELMT_HEADER > buf.len() {
            return Err(Error::new(ErrorKind::InconsistentData));
        }
        let ty = get_u32(buf, off);
        let size = get_u32(buf, off + 4) as usize;
        if size < ELMT_HEADER || off + size > buf.len() {
            return Err(Error::new(ErrorKind::InconsistentData));
        }
        if ty == ELMT_MEMRANGE {
            let base = get_u64(buf, off + 8);
            let len = get_u64(buf, off + 16);
            if let Some((pbase, pend)) = prev {
                if base < pbase {
                    return Err(Error::new(ErrorKind::InconsistentData));
                }
                if pend > base {
                    warn!("emitted memory map overlaps at {base:#x}");
                }
            }
            prev = Some((base, base + len));
        }
        off += size;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::{do_reloc, NoCacheOps};
    use crate::info::{EfiInfo, Framebuffer, ModuleEntry};
    use crate::mem::{MemKind, MemMap, MemRange};
    use crate::reloc::{PlacePolicy, RelocKind, RelocTable};

    /// Stage a module, build the stream, relocate everything into an
    /// arena and read it back the way the kernel would.
    #[test]
    fn stream_survives_relocation() {
        #[repr(align(4096))]
        struct Arena([u8; 0x20000]);
        let arena = Box::new(Arena([0; 0x20000]));
        let base = arena.0.as_ptr() as u64;
        let mut map = MemMap::new();
        map.insert(MemRange::new(base, arena.0.len() as u64, MemKind::Available));
        map.merge();

        let module_bytes = vec![0xabu8; 0x1800];
        let info = BootInfo {
            kind: BootInfoKind::EsxBootInfo,
            cmdline: "vmkernel.gz runlevel=1".into(),
            loader_name: "mboot 0.1.0".into(),
            modules: vec![ModuleEntry {
                src: module_bytes.as_ptr() as u64,
                size: module_bytes.len() as u64,
                cmdline: "tools.tgz".into(),
            }],
            framebuffer: Some(Framebuffer {
                addr: 0xc000_0000,
                pitch: 1024 * 4,
                width: 1024,
                height: 768,
                bpp: 32,
                red: (16, 8),
                green: (8, 8),
                blue: (0, 8),
            }),
            efi: Some(EfiInfo { system_table: 0xdead_f000, secure_boot: true }),
            mmap_capacity: 8,
        };
        let mut built = info.build().unwrap();

        let mut table = RelocTable::new();
        table
            .register(
                &mut map,
                RelocKind::Module,
                Some(module_bytes.as_ptr() as u64),
                module_bytes.len() as u64,
                None,
                4096,
            )
            .unwrap();
        table
            .register(
                &mut map,
                RelocKind::Sysinfo,
                Some(built.addr()),
                built.len() as u64,
                None,
                8,
            )
            .unwrap();
        unsafe { table.compute(&mut map, &PlacePolicy::any()).unwrap() };
        built.fix_pointers(&table).unwrap();

        let mut wire = MemMap::new();
        wire.insert(MemRange::new(0, 0x9f000, MemKind::Available));
        wire.insert(MemRange::new(0x10_0000, 0x100_0000, MemKind::Available));
        wire.merge();
        let count = built.write_memory_map(&wire).unwrap();
        assert_eq!(count, 2);
        built.check().unwrap();

        unsafe { do_reloc(table.entries().as_ptr(), &NoCacheOps) };

        let info_dest = table.runtime_addr(built.addr()).unwrap();
        let module_dest = table.runtime_addr(module_bytes.as_ptr() as u64).unwrap();
        assert_eq!(module_dest % 4096, 0);
        let stream =
            unsafe { core::slice::from_raw_parts(info_dest as *const u8, built.len()) };
        // five fixed elements plus two memory ranges
        assert_eq!(get_u32(stream, 0), 5 + 2);

        let mut off = STREAM_HEADER;
        // cmdline element points at the relocated string
        assert_eq!(get_u32(stream, off), ELMT_CMDLINE);
        let cmdline_ptr = get_u64(stream, off + 8);
        assert!(cmdline_ptr > info_dest);
        let cmdline = unsafe {
            core::slice::from_raw_parts(cmdline_ptr as *const u8, "vmkernel.gz runlevel=1".len())
        };
        assert_eq!(cmdline, b"vmkernel.gz runlevel=1");
        off += CMDLINE_SIZE;

        assert_eq!(get_u32(stream, off), ELMT_LOADER);
        off += LOADER_SIZE;

        assert_eq!(get_u32(stream, off), ELMT_MODULE);
        assert_eq!(get_u32(stream, off + 16), 0x1800);
        assert_eq!(get_u32(stream, off + 20), 1);
        assert_eq!(get_u64(stream, off + 24), module_dest >> 12);
        assert_eq!(get_u32(stream, off + 32), 2);
        off += MODULE_SIZE;

        assert_eq!(get_u32(stream, off), ELMT_VBE);
        assert_eq!(get_u64(stream, off + 8), 0xc000_0000);
        off += VBE_SIZE;

        assert_eq!(get_u32(stream, off), ELMT_EFI);
        let flags = EfiFlags::from_bits_retain(get_u32(stream, off + 8));
        assert!(flags.contains(EfiFlags::EFI64 | EfiFlags::SECURE_BOOT));
        assert_eq!(get_u64(stream, off + 16), 0xdead_f000);

        // the module arrived at its page range
        let module = unsafe {
            core::slice::from_raw_parts(module_dest as *const u8, module_bytes.len())
        };
        assert_eq!(module, module_bytes.as_slice());
        drop(arena);
    }

    #[test]
    fn memranges_are_joined_on_the_wire() {
        let info = BootInfo {
            kind: BootInfoKind::EsxBootInfo,
            cmdline: "k".into(),
            loader_name: "l".into(),
            modules: vec![],
            framebuffer: None,
            efi: None,
            mmap_capacity: 4,
        };
        let mut built = info.build().unwrap();
        let mut wire = MemMap::new();
        // distinct model kinds with the same wire code, back to back
        wire.insert(MemRange::new(0x1000, 0x1000, MemKind::Reserved));
        wire.insert(MemRange::new(0x2000, 0x1000, MemKind::Mmio));
        wire.insert(MemRange::new(0x3000, 0x1000, MemKind::Available));
        wire.merge();
        let count = built.write_memory_map(&wire).unwrap();
        assert_eq!(count, 2);
        built.check().unwrap();
    }

    #[test]
    fn unfixed_pointers_are_detected() {
        let info = BootInfo {
            kind: BootInfoKind::EsxBootInfo,
            cmdline: "k".into(),
            loader_name: "l".into(),
            modules: vec![],
            framebuffer: None,
            efi: None,
            mmap_capacity: 1,
        };
        let mut built = info.build().unwrap();
        // nothing was registered, so the strings have no destination
        let table = RelocTable::new();
        assert!(built.fix_pointers(&table).is_err());
    }
}
