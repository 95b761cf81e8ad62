//! The legacy Multiboot information structure.
//!
//! A fixed little-endian header with 32-bit pointers, a module table, a
//! memory map of 20- or 24-byte descriptors (24 when the firmware
//! reported extended attributes) and the BIOS-style lower/upper memory
//! counts. Kernels walk the map via each descriptor's leading `size`
//! field, which does not count itself.

use alloc::vec;

use log::warn;

use crate::error::{Error, ErrorKind, Result};
use crate::info::{
    put_cstr, put_u32, put_u64, get_u32, get_u64, BootInfo, BuiltInfo, BootInfoKind, Fixup,
    FixupKind, MmapSlot,
};
use crate::mem::{align_up, MemKind, MemMap};

/// Magic leading the header inside the kernel image.
pub const HEADER_MAGIC: u32 = 0x1BAD_B002;
/// Magic handed to the kernel in the first argument register.
pub const REGISTER_MAGIC: u32 = 0x2BAD_B002;

// feature bits of the info structure
const INFO_MEMORY: u32 = 1 << 0;
const INFO_CMDLINE: u32 = 1 << 2;
const INFO_MODS: u32 = 1 << 3;
const INFO_MMAP: u32 = 1 << 6;
const INFO_LOADER_NAME: u32 = 1 << 9;
const INFO_FRAMEBUFFER: u32 = 1 << 12;

// byte offsets within the fixed header
const FLAGS: usize = 0;
const MEM_LOWER: usize = 4;
const MEM_UPPER: usize = 8;
const CMDLINE: usize = 16;
const MODS_COUNT: usize = 20;
const MODS_ADDR: usize = 24;
const MMAP_LENGTH: usize = 44;
const MMAP_ADDR: usize = 48;
const LOADER_NAME: usize = 64;
const FB_ADDR: usize = 88;
const FB_PITCH: usize = 96;
const FB_WIDTH: usize = 100;
const FB_HEIGHT: usize = 104;
const FB_BPP: usize = 108;
const FB_TYPE: usize = 109;
const COLOR_INFO: usize = 110;
const HEADER_SIZE: usize = 116;

/// module table entry: start, end, cmdline, pad
const MOD_SIZE: usize = 16;

/// worst-case descriptor stride (24-byte descriptor plus its size field)
const MMAP_MAX_STRIDE: usize = 28;

/// direct-RGB framebuffer
const FB_TYPE_RGB: u8 = 1;

pub(super) fn build(info: &BootInfo) -> Result<BuiltInfo> {
    let mods_off = HEADER_SIZE;
    let strings_off = mods_off + info.modules.len() * MOD_SIZE;
    let strings_len = info.cmdline.len() + 1
        + info.loader_name.len() + 1
        + info.modules.iter().map(|m| m.cmdline.len() + 1).sum::<usize>();
    let mmap_off = align_up((strings_off + strings_len) as u64, 8).unwrap() as usize;
    let mmap_len = info.mmap_capacity * MMAP_MAX_STRIDE;
    let mut buf = vec![0u8; mmap_off + mmap_len];
    let addr = buf.as_ptr() as u64;
    let mut fixups = alloc::vec::Vec::new();

    let mut flags = INFO_MEMORY | INFO_CMDLINE | INFO_MODS | INFO_MMAP | INFO_LOADER_NAME;

    let mut s = strings_off;
    let cmdline_off = s;
    s = put_cstr(&mut buf, s, &info.cmdline);
    fixups.push(Fixup { offset: CMDLINE, kind: FixupKind::Ptr32, orig: addr + cmdline_off as u64 });
    let loader_off = s;
    s = put_cstr(&mut buf, s, &info.loader_name);
    fixups.push(Fixup {
        offset: LOADER_NAME,
        kind: FixupKind::Ptr32,
        orig: addr + loader_off as u64,
    });

    put_u32(&mut buf, MODS_COUNT, info.modules.len() as u32);
    fixups.push(Fixup { offset: MODS_ADDR, kind: FixupKind::Ptr32, orig: addr + mods_off as u64 });
    for (i, module) in info.modules.iter().enumerate() {
        let at = mods_off + i * MOD_SIZE;
        fixups.push(Fixup { offset: at, kind: FixupKind::Ptr32, orig: module.src });
        fixups.push(Fixup {
            offset: at + 4,
            kind: FixupKind::End32,
            orig: module.src + module.size,
        });
        let cmd_off = s;
        s = put_cstr(&mut buf, s, &module.cmdline);
        fixups.push(Fixup { offset: at + 8, kind: FixupKind::Ptr32, orig: addr + cmd_off as u64 });
    }

    if let Some(fb) = &info.framebuffer {
        flags |= INFO_FRAMEBUFFER;
        put_u64(&mut buf, FB_ADDR, fb.addr);
        put_u32(&mut buf, FB_PITCH, fb.pitch);
        put_u32(&mut buf, FB_WIDTH, fb.width);
        put_u32(&mut buf, FB_HEIGHT, fb.height);
        buf[FB_BPP] = fb.bpp;
        buf[FB_TYPE] = FB_TYPE_RGB;
        buf[COLOR_INFO] = fb.red.0;
        buf[COLOR_INFO + 1] = fb.red.1;
        buf[COLOR_INFO + 2] = fb.green.0;
        buf[COLOR_INFO + 3] = fb.green.1;
        buf[COLOR_INFO + 4] = fb.blue.0;
        buf[COLOR_INFO + 5] = fb.blue.1;
    }
    if info.efi.is_some() {
        // there is no standard field to carry EFI details in this flavor
        warn!("legacy Multiboot kernel: dropping the EFI hand-off record");
    }

    fixups.push(Fixup { offset: MMAP_ADDR, kind: FixupKind::Ptr32, orig: addr + mmap_off as u64 });
    put_u32(&mut buf, FLAGS, flags);

    Ok(BuiltInfo::new(
        BootInfoKind::Multiboot,
        buf,
        fixups,
        MmapSlot { offset: mmap_off, len: mmap_len, fixed_elements: 0 },
    ))
}

/// Emit the memory map and derive the BIOS memory counts.
pub(super) fn write_memory_map(buf: &mut [u8], slot: MmapSlot, map: &MemMap) -> Result<usize> {
    let extended = map.ranges().iter().any(|r| r.attrs != 0);
    let desc_size = if extended { 24usize } else { 20 };
    let stride = desc_size + 4;

    let mut off = slot.offset;
    let mut count = 0usize;
    let mut pending: Option<(u64, u64, u32, u64)> = None;
    let mut flush = |buf: &mut [u8], off: &mut usize, entry: (u64, u64, u32, u64)| -> Result<()> {
        if *off + stride > slot.offset + slot.len {
            return Err(Error::new(ErrorKind::BufferTooSmall));
        }
        put_u32(buf, *off, desc_size as u32);
        put_u64(buf, *off + 4, entry.0);
        put_u64(buf, *off + 12, entry.1);
        put_u32(buf, *off + 20, entry.2);
        if extended {
            put_u32(buf, *off + 24, entry.3 as u32);
        }
        *off += stride;
        Ok(())
    };
    for r in map.ranges() {
        let next = (r.base, r.len, r.kind.e820_type(), r.attrs);
        if let Some(p) = pending.as_mut() {
            // join adjacent ranges that look the same on the wire
            if p.2 == next.2 && p.3 == next.3 && p.0 + p.1 == next.0 {
                p.1 += next.1;
                continue;
            }
        }
        if let Some(p) = pending.take() {
            flush(buf, &mut off, p)?;
            count += 1;
        }
        pending = Some(next);
    }
    if let Some(p) = pending {
        flush(buf, &mut off, p)?;
        count += 1;
    }
    put_u32(buf, MMAP_LENGTH, (count * stride) as u32);

    // BIOS-style memory counts in KiB: lower memory runs from 0 to the
    // first hole (at most 640 KiB), upper memory from 1 MiB to the next
    let lower = map
        .ranges()
        .iter()
        .find(|r| r.kind == MemKind::Available && r.base == 0)
        .map_or(0, |r| (r.len / 1024).min(640));
    let upper = map
        .ranges()
        .iter()
        .find(|r| {
            r.kind == MemKind::Available && r.base <= 0x10_0000 && r.end() > 0x10_0000
        })
        .map_or(0, |r| (r.end() - 0x10_0000) / 1024);
    put_u32(buf, MEM_LOWER, lower as u32);
    put_u32(buf, MEM_UPPER, upper as u32);

    Ok(count)
}

/// Post-emission checks on the wire-format map.
pub(super) fn check(buf: &[u8], slot: MmapSlot) -> Result<()> {
    let length = get_u32(buf, MMAP_LENGTH) as usize;
    if length > slot.len {
        return Err(Error::new(ErrorKind::InconsistentData));
    }
    let mut off = slot.offset;
    let end = slot.offset + length;
    let mut prev: Option<(u64, u64)> = None;
    while off < end {
        let size = get_u32(buf, off) as usize;
        if size != 20 && size != 24 {
            return Err(Error::new(ErrorKind::InconsistentData));
        }
        if off + size + 4 > end {
            return Err(Error::new(ErrorKind::InconsistentData));
        }
        let base = get_u64(buf, off + 4);
        let len = get_u64(buf, off + 12);
        if let Some((pbase, pend)) = prev {
            if base < pbase {
                return Err(Error::new(ErrorKind::InconsistentData));
            }
            if pend > base {
                warn!("emitted memory map overlaps at {base:#x}");
            }
        }
        prev = Some((base, base + len));
        off += size + 4;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::ModuleEntry;
    use crate::mem::MemRange;
    use crate::reloc::{PlacePolicy, RelocKind, RelocTable};

    fn sample_info() -> BootInfo {
        BootInfo {
            kind: BootInfoKind::Multiboot,
            cmdline: "vmkernel.gz quiet".into(),
            loader_name: "mboot 0.1.0".into(),
            modules: alloc::vec![ModuleEntry {
                src: 0x9000_0000,
                size: 0x2345,
                cmdline: "mod.tgz opt=1".into(),
            }],
            framebuffer: None,
            efi: None,
            mmap_capacity: 8,
        }
    }

    /// Pointer fields hold post-relocation addresses of real objects.
    #[test]
    fn pointers_are_fixed_up_to_destinations() {
        let mut map = MemMap::new();
        map.insert(MemRange::new(0x10_0000, 0x40_0000, MemKind::Available));
        map.merge();
        let mut table = RelocTable::new();
        table
            .register(&mut map, RelocKind::Module, Some(0x9000_0000), 0x2345, None, 4096)
            .unwrap();
        let info = sample_info();
        let mut built = info.build().unwrap();
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
        unsafe { table.compute(&mut map, &PlacePolicy::x86(true)).unwrap() };
        built.fix_pointers(&table).unwrap();

        let info_dest = table.runtime_addr(built.addr()).unwrap();
        let module_dest = table.runtime_addr(0x9000_0000).unwrap();
        let buf = built.as_bytes();
        // strings follow the header and one module entry
        let cmdline_off = (HEADER_SIZE + MOD_SIZE) as u64;
        assert_eq!(get_u32(buf, CMDLINE) as u64, info_dest + cmdline_off);
        assert_eq!(
            get_u32(buf, LOADER_NAME) as u64,
            info_dest + cmdline_off + "vmkernel.gz quiet\0".len() as u64,
        );
        assert_eq!(get_u32(buf, MODS_COUNT), 1);
        assert_eq!(get_u32(buf, MODS_ADDR) as u64, info_dest + HEADER_SIZE as u64);
        assert_eq!(get_u32(buf, HEADER_SIZE) as u64, module_dest);
        assert_eq!(get_u32(buf, HEADER_SIZE + 4) as u64, module_dest + 0x2345);
        let flags = get_u32(buf, FLAGS);
        assert_eq!(flags & (INFO_MEMORY | INFO_CMDLINE | INFO_MODS | INFO_MMAP),
            INFO_MEMORY | INFO_CMDLINE | INFO_MODS | INFO_MMAP);
    }

    /// e820 → wire → reader round-trip, with the loader ranges
    /// relabeled and merged on the way out.
    #[test]
    fn memory_map_round_trips() {
        let mut map = MemMap::new();
        map.insert(MemRange::new(0, 0x9f000, MemKind::Available));
        map.insert(MemRange::new(0x9f000, 0x1000, MemKind::Reserved));
        map.insert(MemRange::new(0x10_0000, 0x10_0000, MemKind::Bootloader));
        map.insert(MemRange::new(0x20_0000, 0x1f0_0000, MemKind::Available));
        map.insert(MemRange::new(0x210_0000, 0x1000, MemKind::AcpiReclaim));
        map.merge();
        map.relabel_for_handoff();

        let info = sample_info();
        let mut built = info.build().unwrap();
        let count = built.write_memory_map(&map).unwrap();
        built.check().unwrap();
        assert_eq!(count, 4);

        // read the map back the way a kernel does
        let buf = built.as_bytes();
        let length = get_u32(buf, MMAP_LENGTH) as usize;
        let mut triples = alloc::vec::Vec::new();
        let mut off = HEADER_SIZE + MOD_SIZE
            + "vmkernel.gz quiet\0mboot 0.1.0\0mod.tgz opt=1\0".len();
        off = align_up(off as u64, 8).unwrap() as usize;
        let end = off + length;
        while off < end {
            let size = get_u32(buf, off) as usize;
            assert_eq!(size, 20);
            triples.push((get_u64(buf, off + 4), get_u64(buf, off + 12), get_u32(buf, off + 20)));
            off += size + 4;
        }
        assert_eq!(
            triples,
            alloc::vec![
                (0, 0x9f000, 1),
                (0x9f000, 0x1000, 2),
                // bootloader memory went back to being available and
                // merged with its neighbor
                (0x10_0000, 0x200_0000, 1),
                (0x210_0000, 0x1000, 3),
            ]
        );
        assert_eq!(get_u32(buf, MEM_LOWER), 636);
        assert_eq!(get_u32(buf, MEM_UPPER), 0x200_0000 / 1024);
    }

    #[test]
    fn extended_attributes_widen_the_descriptors() {
        let mut map = MemMap::new();
        map.insert(MemRange { base: 0, len: 0x1000, kind: MemKind::Available, attrs: 1 });
        map.merge();
        let info = sample_info();
        let mut built = info.build().unwrap();
        built.write_memory_map(&map).unwrap();
        built.check().unwrap();
        let buf = built.as_bytes();
        let off = {
            let o = HEADER_SIZE + MOD_SIZE
                + "vmkernel.gz quiet\0mboot 0.1.0\0mod.tgz opt=1\0".len();
            align_up(o as u64, 8).unwrap() as usize
        };
        assert_eq!(get_u32(buf, off), 24);
        assert_eq!(get_u32(buf, off + 24), 1);
        assert_eq!(get_u32(buf, MMAP_LENGTH), 28);
    }

    #[test]
    fn overflowing_the_reserved_slot_is_an_error() {
        let mut map = MemMap::new();
        for i in 0..20u64 {
            map.insert(MemRange::new(
                i * 0x2000,
                0x1000,
                if i % 2 == 0 { MemKind::Available } else { MemKind::Reserved },
            ));
        }
        map.merge();
        let mut info = sample_info();
        info.mmap_capacity = 4;
        let mut built = info.build().unwrap();
        assert!(built.write_memory_map(&map).is_err());
    }
}
