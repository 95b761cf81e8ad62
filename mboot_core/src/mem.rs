//! The runtime memory model.
//!
//! After the firmware memory map has been captured it is turned into a
//! [`MemMap`]: an ordered list of typed physical ranges. The relocation
//! engine allocates every destination out of this model, so by the time
//! the trampoline is placed, whatever is still `Available` is exactly the
//! memory nothing else claims ("safe memory").
//!
//! The model never touches the memory it describes; it is plain data and
//! can be exercised on any host.

use alloc::vec::Vec;

use log::{debug, warn};

use crate::error::{Error, ErrorKind, Result};

/// Size of a physical page.
pub const PAGE_SIZE: u64 = 4096;

/// Execution alignment for kernel images (2 MiB on x86).
pub const EXEC_ALIGN: u64 = 2 * 1024 * 1024;

/// Round `value` up to the next multiple of `align` (a power of two).
///
/// Returns `None` on overflow.
pub const fn align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// What a range of physical memory is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum MemKind {
    /// free for the taking
    Available,
    /// firmware-reserved, never ours
    Reserved,
    /// ACPI tables, reclaimable by the kernel
    AcpiReclaim,
    /// ACPI non-volatile storage
    AcpiNvs,
    /// our own image and heap
    Bootloader,
    /// withdrawn from allocation (typically a relocation source)
    Blacklisted,
    /// a destination handed out by [`MemMap::allocate`]
    Allocated,
    /// UEFI runtime services code/data
    RuntimeServices,
    /// memory-mapped I/O
    Mmio,
    /// broken RAM
    Defective,
}

impl MemKind {
    /// The e820 type code used in the wire-format memory maps.
    ///
    /// Loader-owned kinds are expected to have been relabeled via
    /// [`MemMap::relabel_for_handoff`] first; unrelabeled ones come out
    /// as reserved rather than leaking half-copied memory as available.
    pub fn e820_type(self) -> u32 {
        match self {
            Self::Available => 1,
            Self::AcpiReclaim => 3,
            Self::AcpiNvs => 4,
            Self::Defective => 5,
            Self::Reserved
            | Self::Mmio
            | Self::RuntimeServices
            | Self::Bootloader
            | Self::Blacklisted
            | Self::Allocated => 2,
        }
    }
}

/// Which part of the address space an allocation may come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocClass {
    Any,
    /// x86 kernels want their early structures in 32-bit reach.
    Below4Gb,
}

/// A contiguous range of physical memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemRange {
    pub base: u64,
    pub len: u64,
    pub kind: MemKind,
    /// extended attributes as reported by the firmware (0 if none)
    pub attrs: u64,
}

impl MemRange {
    pub const fn new(base: u64, len: u64, kind: MemKind) -> Self {
        Self { base, len, kind, attrs: 0 }
    }

    /// One past the last byte.
    pub const fn end(&self) -> u64 {
        self.base + self.len
    }
}

/// The canonical memory map, sorted by base address.
///
/// All mutating operations leave the map canonical: sorted, with
/// contiguous same-kind same-attribute neighbors coalesced.
#[derive(Debug, Default)]
pub struct MemMap {
    ranges: Vec<MemRange>,
}

impl MemMap {
    pub const fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// An empty map that can hold `capacity` ranges without allocating.
    ///
    /// The final hand-off map is ingested after boot services are gone,
    /// when allocating is no longer possible.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { ranges: Vec::with_capacity(capacity) }
    }

    pub fn ranges(&self) -> &[MemRange] {
        &self.ranges
    }

    /// How many ranges fit without growing.
    pub fn capacity(&self) -> usize {
        self.ranges.capacity()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Add a range. Call [`merge`] once all ranges are in.
    ///
    /// Zero-length ranges are dropped (firmware maps do contain them).
    ///
    /// [`merge`]: MemMap::merge
    pub fn insert(&mut self, range: MemRange) {
        if range.len == 0 {
            return;
        }
        self.ranges.push(range);
    }

    /// Canonicalize: sort by base and coalesce equal neighbors.
    ///
    /// Overlapping available memory means the firmware map is lying to
    /// us; that is reported but not repaired.
    pub fn merge(&mut self) {
        self.ranges.sort_unstable_by_key(|r| r.base);
        let mut out = 0;
        for i in 0..self.ranges.len() {
            let cur = self.ranges[i];
            if out > 0 {
                let prev = &mut self.ranges[out - 1];
                if prev.end() > cur.base
                    && (prev.kind == MemKind::Available || cur.kind == MemKind::Available)
                {
                    warn!(
                        "memory ranges overlap: {:#x}+{:#x} ({}) vs {:#x}+{:#x} ({})",
                        prev.base, prev.len, prev.kind, cur.base, cur.len, cur.kind,
                    );
                }
                if prev.kind == cur.kind && prev.attrs == cur.attrs && prev.end() == cur.base {
                    prev.len += cur.len;
                    continue;
                }
            }
            self.ranges[out] = cur;
            out += 1;
        }
        self.ranges.truncate(out);
    }

    /// Withdraw `[base, base + len)` from allocation.
    ///
    /// Only the intersection with available memory changes; everything
    /// else is untouched, which also makes this idempotent.
    pub fn blacklist(&mut self, base: u64, len: u64) {
        if len == 0 {
            return;
        }
        let end = base.saturating_add(len);
        let mut out = Vec::with_capacity(self.ranges.len() + 2);
        for r in self.ranges.drain(..) {
            if r.kind != MemKind::Available || r.end() <= base || r.base >= end {
                out.push(r);
                continue;
            }
            if r.base < base {
                out.push(MemRange { len: base - r.base, ..r });
            }
            let mid_base = r.base.max(base);
            let mid_end = r.end().min(end);
            out.push(MemRange {
                base: mid_base,
                len: mid_end - mid_base,
                kind: MemKind::Blacklisted,
                attrs: r.attrs,
            });
            if r.end() > end {
                out.push(MemRange { base: end, len: r.end() - end, ..r });
            }
        }
        self.ranges = out;
        self.merge();
    }

    /// Allocate `size` bytes aligned to `align` from the lowest available
    /// range that satisfies `class`.
    pub fn allocate(&mut self, size: u64, align: u64, class: AllocClass) -> Result<u64> {
        if size == 0 || !align.is_power_of_two() {
            return Err(Error::new(ErrorKind::InvalidParameter));
        }
        let limit = match class {
            AllocClass::Any => u64::MAX,
            AllocClass::Below4Gb => 1 << 32,
        };
        let mut found = None;
        for r in &self.ranges {
            if r.kind != MemKind::Available {
                continue;
            }
            let Some(addr) = align_up(r.base, align) else {
                continue;
            };
            let Some(end) = addr.checked_add(size) else {
                continue;
            };
            if end <= r.end() && end <= limit {
                found = Some(addr);
                break;
            }
        }
        let addr = found.ok_or_else(|| {
            warn!("out of memory allocating {size:#x} bytes (align {align:#x}, {class:?})");
            Error::new(ErrorKind::OutOfResources)
        })?;
        self.carve(addr, size, MemKind::Allocated);
        debug!("allocated {size:#x} bytes at {addr:#x} (align {align:#x})");
        Ok(addr)
    }

    /// Reserve the exact range `[base, base + size)`.
    pub fn allocate_fixed(&mut self, base: u64, size: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::new(ErrorKind::InvalidParameter));
        }
        let end = base
            .checked_add(size)
            .ok_or(Error::new(ErrorKind::InvalidParameter))?;
        let fits = self
            .ranges
            .iter()
            .any(|r| r.kind == MemKind::Available && r.base <= base && end <= r.end());
        if !fits {
            return Err(Error::new(ErrorKind::OutOfResources));
        }
        self.carve(base, size, MemKind::Allocated);
        debug!("allocated {size:#x} bytes at fixed {base:#x}");
        Ok(())
    }

    /// Turn loader-owned memory back into available memory.
    ///
    /// Once the kernel runs, our image, heap and staging buffers are just
    /// RAM again; the kernel learns about its own extents from the module
    /// table, not from the memory map.
    pub fn relabel_for_handoff(&mut self) {
        for r in &mut self.ranges {
            if matches!(
                r.kind,
                MemKind::Bootloader | MemKind::Blacklisted | MemKind::Allocated
            ) {
                r.kind = MemKind::Available;
            }
        }
        self.merge();
    }

    /// Split the available range containing `[base, base + len)` and
    /// retag the middle part. The caller has verified containment.
    fn carve(&mut self, base: u64, len: u64, kind: MemKind) {
        let end = base + len;
        let Some(idx) = self
            .ranges
            .iter()
            .position(|r| r.kind == MemKind::Available && r.base <= base && end <= r.end())
        else {
            debug_assert!(false, "carve outside available memory");
            return;
        };
        let r = self.ranges.remove(idx);
        let mut at = idx;
        if r.base < base {
            self.ranges.insert(at, MemRange { len: base - r.base, ..r });
            at += 1;
        }
        self.ranges.insert(at, MemRange { base, len, kind, attrs: r.attrs });
        at += 1;
        if end < r.end() {
            self.ranges.insert(at, MemRange { base: end, len: r.end() - end, ..r });
        }
        self.merge();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(ranges: &[(u64, u64, MemKind)]) -> MemMap {
        let mut m = MemMap::new();
        for &(base, len, kind) in ranges {
            m.insert(MemRange::new(base, len, kind));
        }
        m.merge();
        m
    }

    #[test]
    fn merge_coalesces_adjacent_available() {
        let m = map(&[
            (0, 0x1000, MemKind::Available),
            (0x1000, 0x1000, MemKind::Available),
            (0x2000, 0x1000, MemKind::Reserved),
            (0x3000, 0x1000, MemKind::Available),
        ]);
        assert_eq!(
            m.ranges(),
            &[
                MemRange::new(0, 0x2000, MemKind::Available),
                MemRange::new(0x2000, 0x1000, MemKind::Reserved),
                MemRange::new(0x3000, 0x1000, MemKind::Available),
            ]
        );
    }

    #[test]
    fn merge_keeps_distinct_attrs_apart() {
        let mut m = MemMap::new();
        m.insert(MemRange { base: 0, len: 0x1000, kind: MemKind::Available, attrs: 1 });
        m.insert(MemRange { base: 0x1000, len: 0x1000, kind: MemKind::Available, attrs: 0 });
        m.merge();
        assert_eq!(m.ranges().len(), 2);
    }

    #[test]
    fn blacklist_splits_and_is_idempotent() {
        let mut m = map(&[(0, 0x10000, MemKind::Available)]);
        m.blacklist(0x4000, 0x2000);
        let expected = &[
            MemRange::new(0, 0x4000, MemKind::Available),
            MemRange::new(0x4000, 0x2000, MemKind::Blacklisted),
            MemRange::new(0x6000, 0xa000, MemKind::Available),
        ];
        assert_eq!(m.ranges(), expected);
        m.blacklist(0x4000, 0x2000);
        assert_eq!(m.ranges(), expected);
    }

    #[test]
    fn blacklist_clips_to_intersection() {
        let mut m = map(&[
            (0x1000, 0x1000, MemKind::Reserved),
            (0x2000, 0x2000, MemKind::Available),
        ]);
        m.blacklist(0, 0x3000);
        assert_eq!(
            m.ranges(),
            &[
                MemRange::new(0x1000, 0x1000, MemKind::Reserved),
                MemRange::new(0x2000, 0x1000, MemKind::Blacklisted),
                MemRange::new(0x3000, 0x1000, MemKind::Available),
            ]
        );
    }

    #[test]
    fn allocate_is_aligned_lowest_fit_and_disjoint() {
        let mut m = map(&[
            (0x1234, 0x10000, MemKind::Available),
            (0x100000, 0x100000, MemKind::Available),
        ]);
        let a = m.allocate(0x1000, 0x1000, AllocClass::Any).unwrap();
        assert_eq!(a, 0x2000);
        let b = m.allocate(0x1000, 0x1000, AllocClass::Any).unwrap();
        assert_eq!(b, 0x3000);
        // live allocations never overlap
        assert!(a + 0x1000 <= b);
        // carving tagged the handed-out ranges
        assert!(m
            .ranges()
            .iter()
            .any(|r| r.base == 0x2000 && r.len == 0x2000 && r.kind == MemKind::Allocated));
    }

    #[test]
    fn allocate_honors_class() {
        let mut m = map(&[
            (0x1_0000_0000, 0x10000, MemKind::Available),
            (0x2000, 0x1000, MemKind::Available),
        ]);
        let a = m.allocate(0x1000, 0x1000, AllocClass::Below4Gb).unwrap();
        assert_eq!(a, 0x2000);
        // the low range is used up now
        assert!(m.allocate(0x1000, 0x1000, AllocClass::Below4Gb).is_err());
        let b = m.allocate(0x1000, 0x1000, AllocClass::Any).unwrap();
        assert_eq!(b, 0x1_0000_0000);
    }

    #[test]
    fn allocate_fixed_needs_containment() {
        let mut m = map(&[(0x1000, 0x2000, MemKind::Available)]);
        assert!(m.allocate_fixed(0x2800, 0x1000).is_err());
        m.allocate_fixed(0x1800, 0x800).unwrap();
        assert!(m.allocate_fixed(0x1800, 0x800).is_err());
    }

    #[test]
    fn relabel_returns_loader_memory() {
        let mut m = map(&[(0, 0x4000, MemKind::Available)]);
        m.blacklist(0x1000, 0x1000);
        m.allocate_fixed(0x2000, 0x1000).unwrap();
        m.relabel_for_handoff();
        assert_eq!(m.ranges(), &[MemRange::new(0, 0x4000, MemKind::Available)]);
    }

    #[test]
    fn rejects_nonsense() {
        let mut m = map(&[(0, 0x1000, MemKind::Available)]);
        assert!(m.allocate(0, 1, AllocClass::Any).is_err());
        assert!(m.allocate(0x100, 3, AllocClass::Any).is_err());
        assert!(m.allocate_fixed(0, 0).is_err());
    }
}
