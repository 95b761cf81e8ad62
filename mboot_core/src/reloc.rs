//! The relocation engine.
//!
//! Kernel segments, modules and system information are loaded wherever
//! there happens to be room, but have to reach well-defined physical
//! addresses before the kernel may run. Copying them at load time is
//! impossible (the destinations are still owned by the firmware), so the
//! engine records every planned move as a [`RelocEntry`], assigns
//! destinations out of the [`MemMap`] and orders the table so that no
//! copy tramples the source of a later one. The actual pass runs from
//! the trampoline, after firmware teardown.
//!
//! Sources are blacklisted as they are registered, so a destination can
//! never be allocated on top of a source. Overlaps still happen where
//! destinations are pinned (kernel segments want fixed addresses); those
//! are resolved by the ordering pass, and genuine cycles are broken by
//! staging the smallest entry on the cycle into safe memory.

use alloc::vec::Vec;
use core::mem::size_of;

use log::{debug, trace};

use crate::error::{Error, ErrorKind, Result};
use crate::handoff::{do_reloc, CacheOps, HandoffRecord, TRAMP_STACK_SIZE};
use crate::mem::{align_up, AllocClass, MemMap, PAGE_SIZE};

/// The classes of runtime objects, in placement order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, strum_macros::Display)]
pub enum RelocKind {
    /// a kernel segment, destination fixed by the registrar
    Kernel,
    /// an opaque module payload
    Module,
    /// system information the kernel reads at its leisure
    Sysinfo,
    /// the trampoline and its hand-off data
    Trampoline,
}

impl RelocKind {
    /// The single-letter tag stored in the table (and shown in logs).
    pub const fn tag(self) -> u8 {
        match self {
            Self::Kernel => b'k',
            Self::Module => b'm',
            Self::Sysinfo => b's',
            Self::Trampoline => b't',
        }
    }
}

/// One planned copy. The layout is ABI: the trampoline's copy loop
/// walks the table as an array of these.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RelocEntry {
    /// source address; 0 means "zero-fill the destination"
    pub src: u64,
    /// destination address (0 until placement has run)
    pub dest: u64,
    pub size: u64,
    pub align: u64,
    /// [`RelocKind::tag`], or 0 for the sentinel
    pub kind: u8,
    /// cycle-walk bookkeeping
    visited: u8,
    pad: [u8; 6],
}

const _: () = assert!(size_of::<RelocEntry>() == 40);

impl RelocEntry {
    /// The all-zero entry terminating every table.
    pub const SENTINEL: Self = Self::new(0, 0, 0, 0, 1);

    pub const fn new(kind: u8, src: u64, dest: u64, size: u64, align: u64) -> Self {
        Self { src, dest, size, align, kind, visited: 0, pad: [0; 6] }
    }

    const fn dest_end(&self) -> u64 {
        self.dest + self.size
    }
}

/// A position-independent trampoline blob provided by the application.
pub struct TrampolineImage<'a> {
    pub code: &'a [u8],
    /// offset of the entry point within `code`
    pub entry_offset: usize,
    /// offset of the copy routine within `code`
    pub copy_routine_offset: usize,
}

/// Runtime addresses handed back by [`RelocTable::install_trampoline`].
pub struct InstalledTrampoline {
    /// where to jump, with the hand-off address in the first argument register
    pub entry: u64,
    /// runtime address of the [`HandoffRecord`]
    pub handoff: u64,
    /// base of the relocated code blob
    pub code_base: u64,
}

/// Where each object group may be placed.
///
/// Only x86 kernels are known to need low memory; other architectures
/// construct an all-[`Any`](AllocClass::Any) policy and nothing else
/// changes.
#[derive(Clone, Copy, Debug)]
pub struct PlacePolicy {
    pub sysinfo: AllocClass,
    pub modules: AllocClass,
    pub trampoline: AllocClass,
}

impl PlacePolicy {
    /// The x86 policy: sysinfo and the trampoline stay in 32-bit reach,
    /// modules only have to when the kernel speaks legacy Multiboot.
    pub const fn x86(legacy_multiboot: bool) -> Self {
        Self {
            sysinfo: AllocClass::Below4Gb,
            modules: if legacy_multiboot { AllocClass::Below4Gb } else { AllocClass::Any },
            trampoline: AllocClass::Below4Gb,
        }
    }

    pub const fn any() -> Self {
        Self {
            sysinfo: AllocClass::Any,
            modules: AllocClass::Any,
            trampoline: AllocClass::Any,
        }
    }
}

/// The relocation table and the engine operating on it.
#[derive(Default)]
pub struct RelocTable {
    entries: Vec<RelocEntry>,
    computed: bool,
}

impl RelocTable {
    pub const fn new() -> Self {
        Self { entries: Vec::new(), computed: false }
    }

    /// The entries, including the sentinel once `compute` has run.
    pub fn entries(&self) -> &[RelocEntry] {
        &self.entries
    }

    pub const fn is_computed(&self) -> bool {
        self.computed
    }

    /// Record a planned copy.
    ///
    /// `src == None` denotes a zero-fill. Entries without a destination
    /// are placed by [`compute`](RelocTable::compute); kernel segments
    /// must arrive pre-placed (the registrar allocated their image hull)
    /// and byte-addressed, that is with alignment 1 and a non-null
    /// destination.
    ///
    /// The source range is blacklisted immediately, before any further
    /// destination is chosen.
    pub fn register(
        &mut self,
        map: &mut MemMap,
        kind: RelocKind,
        src: Option<u64>,
        size: u64,
        dest: Option<u64>,
        align: u64,
    ) -> Result<()> {
        if self.computed || size == 0 || !align.is_power_of_two() {
            return Err(Error::new(ErrorKind::InvalidParameter));
        }
        if let Some(d) = dest {
            d.checked_add(size)
                .ok_or(Error::new(ErrorKind::InvalidParameter))?;
        }
        if kind == RelocKind::Kernel && (align != 1 || !matches!(dest, Some(d) if d != 0)) {
            return Err(Error::new(ErrorKind::InvalidParameter));
        }
        if let Some(s) = src {
            s.checked_add(size)
                .ok_or(Error::new(ErrorKind::InvalidParameter))?;
            map.blacklist(s, size);
        }
        trace!(
            "relocation: {kind} {size:#x} bytes from {:#x} to {:#x} (align {align:#x})",
            src.unwrap_or(0),
            dest.unwrap_or(0),
        );
        self.entries.push(RelocEntry::new(
            kind.tag(),
            src.unwrap_or(0),
            dest.unwrap_or(0),
            size,
            align,
        ));
        Ok(())
    }

    /// Where will the byte at `src` live after the copy pass?
    pub fn runtime_addr(&self, src: u64) -> Result<u64> {
        if src == 0 {
            return Err(Error::new(ErrorKind::NotFound));
        }
        self.entries
            .iter()
            .find(|e| e.kind != 0 && e.src != 0 && src >= e.src && src - e.src < e.size)
            .map(|e| e.dest + (src - e.src))
            .ok_or(Error::new(ErrorKind::NotFound))
    }

    /// Assign destinations, order the copies and seal the table.
    ///
    /// Placement groups the entries as kernel < modules < sysinfo <
    /// trampoline. Kernel segments were placed by the registrar; the
    /// sysinfo group prefers to sit right above them, modules go to the
    /// lowest fit of their class.
    ///
    /// # Safety
    ///
    /// Registered source regions must reference live memory: breaking a
    /// relocation cycle stages source bytes into safe memory right away.
    pub unsafe fn compute(&mut self, map: &mut MemMap, policy: &PlacePolicy) -> Result<()> {
        if self.computed || self.entries.is_empty() {
            return Err(Error::new(ErrorKind::InvalidParameter));
        }
        self.entries.sort_by_key(|e| match e.kind {
            b'k' => 0,
            b'm' => 1,
            b's' => 2,
            _ => 3,
        });
        let kmem_end = self
            .entries
            .iter()
            .filter(|e| e.kind == b'k')
            .map(RelocEntry::dest_end)
            .max()
            .unwrap_or(0);
        debug!("kernel memory ends at {kmem_end:#x}");
        let prefer = (kmem_end != 0).then_some(kmem_end);
        self.place_group(map, RelocKind::Sysinfo, prefer, policy.sysinfo)?;
        self.place_group(map, RelocKind::Module, None, policy.modules)?;
        self.place_group(map, RelocKind::Trampoline, None, policy.trampoline)?;
        unsafe { self.order(map)? };
        self.entries.push(RelocEntry::SENTINEL);
        self.computed = true;
        Ok(())
    }

    /// Place every not-yet-placed entry of `kind`, preferably as one
    /// contiguous block (at `prefer` if given), falling back to
    /// scattered allocations.
    fn place_group(
        &mut self,
        map: &mut MemMap,
        kind: RelocKind,
        prefer: Option<u64>,
        class: AllocClass,
    ) -> Result<()> {
        let idxs: Vec<usize> = (0..self.entries.len())
            .filter(|&i| self.entries[i].kind == kind.tag() && self.entries[i].dest == 0)
            .collect();
        if idxs.is_empty() {
            return Ok(());
        }
        // group sizing: every object aligned within the block, the block
        // itself aligned to the worst case so the inner padding holds
        let max_align = idxs.iter().map(|&i| self.entries[i].align).max().unwrap();
        let mut offsets = Vec::with_capacity(idxs.len());
        let mut run = 0u64;
        for &i in &idxs {
            run = align_up(run, self.entries[i].align)
                .ok_or(Error::new(ErrorKind::InvalidParameter))?;
            offsets.push(run);
            run = run
                .checked_add(self.entries[i].size)
                .ok_or(Error::new(ErrorKind::InvalidParameter))?;
        }
        let total = run;

        let mut base = None;
        if let Some(p) = prefer {
            let aligned = align_up(p, max_align).ok_or(Error::new(ErrorKind::InvalidParameter))?;
            match map.allocate_fixed(aligned, total) {
                Ok(()) => base = Some(aligned),
                Err(_) => debug!("preferred base {aligned:#x} for the {kind} group is taken"),
            }
        }
        if base.is_none() {
            base = map.allocate(total, max_align, class).ok();
        }
        match base {
            Some(b) => {
                debug!("placing {} {kind} objects at {b:#x}+{total:#x}", idxs.len());
                for (&i, &off) in idxs.iter().zip(&offsets) {
                    self.entries[i].dest = b + off;
                }
            }
            None => {
                // no contiguous block left; place each object on its own
                debug!("placing {} {kind} objects separately", idxs.len());
                for &i in &idxs {
                    let (size, align) = (self.entries[i].size, self.entries[i].align);
                    self.entries[i].dest = map.allocate(size, align, class)?;
                }
            }
        }
        Ok(())
    }

    /// The first entry in `[lo, hi)` whose source would be clobbered by
    /// copying entry `i`, if any. A null source cannot be depended upon.
    fn find_dependency(&self, i: usize, lo: usize, hi: usize) -> Option<usize> {
        let dest = self.entries[i].dest;
        let dest_end = self.entries[i].dest_end();
        (lo..hi).find(|&j| {
            if j == i {
                return false;
            }
            let other = &self.entries[j];
            other.src != 0 && dest < other.src + other.size && other.src < dest_end
        })
    }

    /// Permute the table so that no copy overwrites the source of a
    /// later one, breaking cycles as they are found.
    unsafe fn order(&mut self, map: &mut MemMap) -> Result<()> {
        let len = self.entries.len();
        let mut resolved = 0;
        while resolved < len {
            let mut n = 0;
            for i in resolved..len {
                if self.find_dependency(i, resolved, len).is_none() {
                    self.entries.swap(i, resolved + n);
                    n += 1;
                }
            }
            if n > 0 {
                trace!("sequenced {n} relocations ({} of {len})", resolved + n);
                resolved += n;
            } else {
                unsafe { self.break_cycle(map, resolved)? };
            }
        }
        Ok(())
    }

    /// Every unresolved entry depends on another one, so there is a
    /// cycle. Walk the first-dependency edges from the largest entry,
    /// counting visits; the entries seen twice form the cycle. Stage the
    /// smallest of them into safe memory, which removes one edge.
    ///
    /// # Safety
    ///
    /// The victim's source region must be live; its bytes are copied now.
    unsafe fn break_cycle(&mut self, map: &mut MemMap, resolved: usize) -> Result<()> {
        let len = self.entries.len();
        for i in resolved..len {
            self.entries[i].visited = 0;
        }
        let start = (resolved..len)
            .max_by_key(|&i| self.entries[i].size)
            .ok_or(Error::new(ErrorKind::InconsistentData))?;
        let mut cur = start;
        while self.entries[cur].visited < 2 {
            self.entries[cur].visited += 1;
            cur = self
                .find_dependency(cur, resolved, len)
                .ok_or(Error::new(ErrorKind::InconsistentData))?;
        }
        let victim = (resolved..len)
            .filter(|&i| self.entries[i].visited == 2)
            .min_by_key(|&i| self.entries[i].size)
            .ok_or(Error::new(ErrorKind::InconsistentData))?;
        let size = self.entries[victim].size;
        let staged = map.allocate(size, 16, AllocClass::Any)?;
        debug!(
            "breaking relocation cycle: staging {size:#x} bytes from {:#x} at {staged:#x}",
            self.entries[victim].src,
        );
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.entries[victim].src as *const u8,
                staged as *mut u8,
                size as usize,
            );
        }
        self.entries[victim].src = staged;
        Ok(())
    }

    /// Put the trampoline into safe memory and return its runtime
    /// addresses.
    ///
    /// One block takes the hand-off record, the trampoline stack and the
    /// relocation table; a second one takes the code blob. The data
    /// block is moved to its runtime location right away (with the copy
    /// routine itself, over a local table): it must be in place before
    /// anything runs on the trampoline stack. `pin` is told about both
    /// blocks so the application can claim them from the firmware.
    ///
    /// # Safety
    ///
    /// Performs the synchronous copies described above; the allocator
    /// map must describe real, unused memory.
    pub unsafe fn install_trampoline<C: CacheOps>(
        &mut self,
        map: &mut MemMap,
        image: &TrampolineImage<'_>,
        class: AllocClass,
        cache: &C,
        pin: &mut dyn FnMut(u64, u64),
    ) -> Result<InstalledTrampoline> {
        if !self.computed {
            return Err(Error::new(ErrorKind::InvalidParameter));
        }
        let table_size = (self.entries.len() * size_of::<RelocEntry>()) as u64;
        let stack_off = align_up(size_of::<HandoffRecord>() as u64, 16).unwrap();
        let table_off = stack_off + TRAMP_STACK_SIZE as u64;
        let total = table_off + table_size;
        let data = map.allocate(total, 16, class)?;
        let code = map.allocate(image.code.len() as u64, PAGE_SIZE, class)?;
        pin(data, total);
        pin(code, image.code.len() as u64);
        debug!("trampoline: code at {code:#x}, hand-off data at {data:#x}+{total:#x}");

        // the code blob is position-independent, move it directly
        unsafe {
            core::ptr::copy_nonoverlapping(image.code.as_ptr(), code as *mut u8, image.code.len());
        }
        cache.flush(code, image.code.len() as u64);

        let record = HandoffRecord {
            stack_top: data + table_off,
            reloc_table: data + table_off,
            reloc_routine: code + image.copy_routine_offset as u64,
            info_addr: 0,
            kernel_entry: 0,
            tramp_low: code,
            magic: 0,
            reserved: 0,
        };
        let tag = RelocKind::Trampoline.tag();
        let sync = [
            RelocEntry::new(
                tag,
                &record as *const HandoffRecord as u64,
                data,
                size_of::<HandoffRecord>() as u64,
                16,
            ),
            // scrub the stack region
            RelocEntry::new(tag, 0, data + stack_off, TRAMP_STACK_SIZE as u64, 16),
            RelocEntry::new(tag, self.entries.as_ptr() as u64, data + table_off, table_size, 16),
            RelocEntry::SENTINEL,
        ];
        unsafe { do_reloc(sync.as_ptr(), cache) };

        Ok(InstalledTrampoline {
            entry: code + image.entry_offset as u64,
            handoff: data,
            code_base: code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::NoCacheOps;
    use crate::mem::{MemKind, MemRange};

    /// A page-aligned chunk of real memory the tests relocate within.
    #[repr(align(4096))]
    struct Arena(pub [u8; 0x10000]);

    impl Arena {
        fn new() -> Box<Self> {
            Box::new(Arena([0; 0x10000]))
        }

        fn base(&self) -> u64 {
            self.0.as_ptr() as u64
        }

        /// A map covering the whole arena as available memory.
        fn map(&self) -> MemMap {
            let mut map = MemMap::new();
            map.insert(MemRange::new(self.base(), self.0.len() as u64, MemKind::Available));
            map.merge();
            map
        }
    }

    /// After ordering, no copy may clobber the source of a later one.
    fn assert_ordered(table: &RelocTable) {
        let entries = table.entries();
        for i in 0..entries.len() {
            for j in (i + 1)..entries.len() {
                let (a, b) = (&entries[i], &entries[j]);
                if a.kind == 0 || b.kind == 0 || b.src == 0 {
                    continue;
                }
                assert!(
                    a.dest + a.size <= b.src || b.src + b.size <= a.dest,
                    "entry {i} ({:#x}+{:#x}) clobbers the source of entry {j} ({:#x}+{:#x})",
                    a.dest, a.size, b.src, b.size,
                );
            }
        }
    }

    #[test]
    fn register_rejects_bad_entries() {
        let mut map = MemMap::new();
        let mut table = RelocTable::new();
        // zero size
        assert!(table
            .register(&mut map, RelocKind::Module, Some(0x1000), 0, None, 1)
            .is_err());
        // destination overflow
        assert!(table
            .register(&mut map, RelocKind::Module, Some(0x1000), 0x10, Some(u64::MAX - 1), 1)
            .is_err());
        // kernel segments must be pre-placed and byte-addressed
        assert!(table
            .register(&mut map, RelocKind::Kernel, Some(0x1000), 0x10, None, 1)
            .is_err());
        assert!(table
            .register(&mut map, RelocKind::Kernel, Some(0x1000), 0x10, Some(0), 1)
            .is_err());
        assert!(table
            .register(&mut map, RelocKind::Kernel, Some(0x1000), 0x10, Some(0x2000), 8)
            .is_err());
        assert!(table.entries().is_empty());
    }

    #[test]
    fn register_blacklists_the_source() {
        let mut map = MemMap::new();
        map.insert(MemRange::new(0x1000, 0x10000, MemKind::Available));
        map.merge();
        let mut table = RelocTable::new();
        table
            .register(&mut map, RelocKind::Module, Some(0x2000), 0x1000, None, 1)
            .unwrap();
        assert!(map
            .ranges()
            .iter()
            .any(|r| r.base == 0x2000 && r.len == 0x1000 && r.kind == MemKind::Blacklisted));
        // a later allocation cannot land on the source
        let addr = map.allocate(0x1000, 0x1000, AllocClass::Any).unwrap();
        assert_ne!(addr, 0x2000);
    }

    /// Forward overlap without a cycle: A's destination covers B's
    /// source, so B must be copied first.
    #[test]
    fn orders_forward_overlap_without_cycle() {
        let mut map = MemMap::new();
        let mut table = RelocTable::new();
        table
            .register(&mut map, RelocKind::Module, Some(1000), 1000, Some(3000), 1)
            .unwrap();
        table
            .register(&mut map, RelocKind::Module, Some(3500), 1000, Some(5000), 1)
            .unwrap();
        unsafe { table.compute(&mut map, &PlacePolicy::any()).unwrap() };
        let entries = table.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].src, 3500, "B must run before A");
        assert_eq!(entries[1].src, 1000);
        assert_eq!(entries[2].kind, 0, "table must be sentinel-terminated");
        assert_ordered(&table);
    }

    /// Two entries swapping places through overlapping windows: a cycle
    /// that needs a staging buffer.
    #[test]
    fn breaks_two_object_cycle() {
        let arena = Arena::new();
        let base = arena.base();
        let mut map = arena.map();
        // destinations are spoken for, like allocator-owned memory would be
        map.blacklist(base + 1000, 1500);
        let mut table = RelocTable::new();
        table
            .register(&mut map, RelocKind::Module, Some(base + 1000), 1000, Some(base + 1500), 1)
            .unwrap();
        table
            .register(&mut map, RelocKind::Module, Some(base + 1500), 1000, Some(base + 1000), 1)
            .unwrap();

        let a_src = 1000usize;
        let mut arena = arena;
        for i in 0..1000 {
            arena.0[a_src + i] = (i % 251) as u8;
        }
        let a_bytes: Vec<u8> = arena.0[a_src..a_src + 1000].to_vec();
        // B's source window [1500, 2500) overlaps A's; its head is A's tail
        let b_head: Vec<u8> = arena.0[1500..2000].to_vec();

        unsafe { table.compute(&mut map, &PlacePolicy::any()).unwrap() };
        let entries = table.entries();
        assert_eq!(entries.len(), 3);
        // the cycle was broken by staging A outside both windows
        let staged = entries.iter().find(|e| e.dest == base + 1500).unwrap();
        assert_ne!(staged.src, base + 1000, "A's source must have been rewritten");
        // and B now runs first
        assert_eq!(entries[0].dest, base + 1000);
        assert_ordered(&table);

        unsafe { do_reloc(entries.as_ptr(), &NoCacheOps) };
        // A's destination holds A's original bytes
        assert_eq!(&arena.0[1500..2500], a_bytes.as_slice());
        // the part of B's destination that A did not overwrite holds the
        // start of B's original source content
        assert_eq!(&arena.0[1000..1500], b_head.as_slice());
    }

    /// Contiguous group placement above the kernel, with
    /// alignment-induced gaps.
    #[test]
    fn places_sysinfo_group_above_kernel() {
        let mut map = MemMap::new();
        map.insert(MemRange::new(0x400000, 0x100000, MemKind::Available));
        map.merge();
        let mut table = RelocTable::new();
        // a kernel group ending at 0x400000 (sources live elsewhere)
        table
            .register(&mut map, RelocKind::Kernel, Some(0x90000000), 0x1000, Some(0x3ff000), 1)
            .unwrap();
        for (size, align) in [(0x100, 16), (0x80, 16), (0x200, 4096)] {
            table
                .register(&mut map, RelocKind::Sysinfo, Some(0x90001000), size, None, align)
                .unwrap();
        }
        unsafe { table.compute(&mut map, &PlacePolicy::any()).unwrap() };
        let dests: Vec<u64> = table
            .entries()
            .iter()
            .filter(|e| e.kind == b's')
            .map(|e| e.dest)
            .collect();
        assert_eq!(dests, &[0x400000, 0x400100, 0x401000]);
    }

    #[test]
    fn scatters_group_when_no_contiguous_block_fits() {
        let mut map = MemMap::new();
        map.insert(MemRange::new(0x1000, 0x1000, MemKind::Available));
        map.insert(MemRange::new(0x10000, 0x1000, MemKind::Available));
        map.merge();
        let mut table = RelocTable::new();
        table
            .register(&mut map, RelocKind::Module, Some(0x90000000), 0x1000, None, 1)
            .unwrap();
        table
            .register(&mut map, RelocKind::Module, Some(0x90002000), 0x1000, None, 1)
            .unwrap();
        unsafe { table.compute(&mut map, &PlacePolicy::any()).unwrap() };
        let dests: Vec<u64> = table
            .entries()
            .iter()
            .filter(|e| e.kind == b'm')
            .map(|e| e.dest)
            .collect();
        assert_eq!(dests, &[0x1000, 0x10000]);
    }

    #[test]
    fn runtime_addr_round_trips() {
        let mut map = MemMap::new();
        map.insert(MemRange::new(0x100000, 0x100000, MemKind::Available));
        map.merge();
        let mut table = RelocTable::new();
        table
            .register(&mut map, RelocKind::Module, Some(0x90000000), 0x2000, None, 4096)
            .unwrap();
        table
            .register(&mut map, RelocKind::Sysinfo, Some(0x90004000), 0x100, None, 8)
            .unwrap();
        unsafe { table.compute(&mut map, &PlacePolicy::any()).unwrap() };
        for e in table.entries().iter().filter(|e| e.kind != 0) {
            assert_eq!(table.runtime_addr(e.src).unwrap(), e.dest);
            // interior addresses translate too
            assert_eq!(table.runtime_addr(e.src + 1).unwrap(), e.dest + 1);
        }
        assert!(table.runtime_addr(0x12345).is_err());
        assert!(table.runtime_addr(0).is_err());
    }

    #[test]
    fn compute_rejects_an_empty_table() {
        let mut map = MemMap::new();
        let mut table = RelocTable::new();
        assert!(unsafe { table.compute(&mut map, &PlacePolicy::any()) }.is_err());
    }

    #[test]
    fn install_trampoline_stages_the_handoff_block() {
        let arena = Arena::new();
        let base = arena.base();
        let mut map = arena.map();
        let mut table = RelocTable::new();
        table
            .register(&mut map, RelocKind::Module, Some(0x90000000), 0x40, None, 1)
            .unwrap();
        unsafe { table.compute(&mut map, &PlacePolicy::any()).unwrap() };

        let code = [0x90u8; 64]; // nops
        let image = TrampolineImage { code: &code, entry_offset: 0, copy_routine_offset: 16 };
        let mut pinned = Vec::new();
        let installed = unsafe {
            table
                .install_trampoline(&mut map, &image, AllocClass::Any, &NoCacheOps, &mut |b, l| {
                    pinned.push((b, l))
                })
                .unwrap()
        };
        assert_eq!(pinned.len(), 2);
        assert!(installed.handoff >= base && installed.handoff < base + 0x10000);

        let record = unsafe { &*(installed.handoff as *const HandoffRecord) };
        assert_eq!(record.reloc_routine, installed.code_base + 16);
        assert_eq!(record.tramp_low, installed.code_base);
        assert_eq!(record.stack_top % 16, 0);
        assert_eq!(record.stack_top, record.reloc_table);
        // the relocation table reached its runtime location, sentinel included
        let copied = unsafe {
            core::slice::from_raw_parts(record.reloc_table as *const RelocEntry, 2)
        };
        assert_eq!(copied[0].src, table.entries()[0].src);
        assert_eq!(copied[1].kind, 0);
        // and the code blob too
        let blob = unsafe { core::slice::from_raw_parts(installed.code_base as *const u8, 64) };
        assert_eq!(blob, &code[..]);
    }
}
