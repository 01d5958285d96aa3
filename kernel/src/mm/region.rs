//! Boot memory-region table
//!
//! The firmware memory map is parsed once at boot, sanitized, checksummed,
//! and never mutated again. It is the ground truth the frame allocator
//! consults when seeding its bitmap.
//!
//! Sanitization rules: sub-page slivers are truncated away, anything
//! overlapping the first MiB is forced Reserved, the list is sorted by base
//! and de-overlapped (earlier entries win the contested range).

use crate::error::{KernelError, KernelResult};
use crate::mm::{PAGE_SIZE, PhysicalAddress};

/// Most regions the table can hold after splitting.
pub const MAX_REGIONS: usize = 48;

/// Classification of a physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Usable RAM.
    Available,
    /// Firmware-reserved or unknown.
    Reserved,
    /// ACPI tables, reclaimable after parsing.
    AcpiReclaimable,
    /// ACPI non-volatile storage.
    AcpiNvs,
    /// Known-bad RAM.
    BadRam,
    /// The kernel image itself.
    Kernel,
    /// The boot module holding the initrd archive.
    Initrd,
}

impl RegionKind {
    /// Only `Available` pages may ever be handed out by the PMM.
    pub const fn is_usable(self) -> bool {
        matches!(self, RegionKind::Available)
    }
}

/// Semi-open physical interval `[base, base + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub len: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub const fn new(base: u64, len: u64, kind: RegionKind) -> Self {
        Self { base, len, kind }
    }

    pub const fn end(&self) -> u64 {
        self.base + self.len
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }
}

const FIRST_MIB: u64 = 0x10_0000;

/// The sanitized, immutable region table.
pub struct RegionTable {
    regions: [MemoryRegion; MAX_REGIONS],
    count: usize,
    checksum: u32,
    finalized: bool,
}

impl RegionTable {
    pub const fn new() -> Self {
        Self {
            regions: [MemoryRegion::new(0, 0, RegionKind::Reserved); MAX_REGIONS],
            count: 0,
            checksum: 0,
            finalized: false,
        }
    }

    /// Add a raw region. Must happen before [`finalize`](Self::finalize).
    pub fn add(&mut self, region: MemoryRegion) -> KernelResult<()> {
        if self.finalized {
            return Err(KernelError::InvalidState {
                expected: "region table under construction",
                actual: "finalized",
            });
        }
        if region.len == 0 {
            return Ok(());
        }

        // Split anything straddling the first MiB so the low part can be
        // forced Reserved without losing the rest.
        if region.base < FIRST_MIB && region.end() > FIRST_MIB {
            self.push(MemoryRegion::new(
                region.base,
                FIRST_MIB - region.base,
                RegionKind::Reserved,
            ))?;
            return self.push(MemoryRegion::new(
                FIRST_MIB,
                region.end() - FIRST_MIB,
                region.kind,
            ));
        }

        let kind = if region.end() <= FIRST_MIB {
            RegionKind::Reserved
        } else {
            region.kind
        };
        self.push(MemoryRegion::new(region.base, region.len, kind))
    }

    fn push(&mut self, mut region: MemoryRegion) -> KernelResult<()> {
        // Truncate to whole pages: usable space rounds inward, everything
        // else rounds outward so no reserved byte is ever marked free.
        let (base, end) = if region.kind.is_usable() {
            (
                region.base.div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64,
                region.end() / PAGE_SIZE as u64 * PAGE_SIZE as u64,
            )
        } else {
            (
                region.base / PAGE_SIZE as u64 * PAGE_SIZE as u64,
                region.end().div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64,
            )
        };
        if end <= base {
            return Ok(());
        }
        region.base = base;
        region.len = end - base;

        if self.count >= MAX_REGIONS {
            return Err(KernelError::ResourceExhausted {
                resource: "memory region table",
            });
        }
        self.regions[self.count] = region;
        self.count += 1;
        Ok(())
    }

    /// Sort, de-overlap, checksum. The table is immutable afterwards.
    ///
    /// Non-available entries always win contested ranges: a usable region
    /// overlapping a reserved one is split around it so the RAM on both
    /// sides stays usable.
    pub fn finalize(&mut self) {
        loop {
            self.regions[..self.count].sort_unstable_by_key(|r| r.base);

            let mut changed = false;
            let mut i = 0;
            while i + 1 < self.count {
                let cur = self.regions[i];
                let next = self.regions[i + 1];
                if next.base >= cur.end() {
                    i += 1;
                    continue;
                }
                changed = true;

                if cur.kind.is_usable() && !next.kind.is_usable() {
                    // Carve the reserved range out of the usable one,
                    // keeping the tail past its end.
                    let tail_len = cur.end().saturating_sub(next.end());
                    self.regions[i].len = next.base - cur.base;
                    if tail_len > 0 && self.count < MAX_REGIONS {
                        self.regions[self.count] =
                            MemoryRegion::new(next.end(), tail_len, cur.kind);
                        self.count += 1;
                    }
                } else {
                    // Trim (or drop) the later entry forward.
                    let overlap = cur.end() - next.base;
                    if overlap >= next.len {
                        self.remove(i + 1);
                    } else {
                        self.regions[i + 1].base += overlap;
                        self.regions[i + 1].len -= overlap;
                    }
                }
                break; // re-sort and rescan from the top
            }

            // Drop entries emptied by trimming.
            let mut w = 0;
            for r in 0..self.count {
                if self.regions[r].len > 0 {
                    self.regions[w] = self.regions[r];
                    w += 1;
                }
            }
            self.count = w;

            if !changed {
                break;
            }
        }

        self.checksum = self.compute_checksum();
        self.finalized = true;
    }

    fn remove(&mut self, index: usize) {
        self.regions.copy_within(index + 1..self.count, index);
        self.count -= 1;
    }

    fn compute_checksum(&self) -> u32 {
        // Fletcher-style running sums over the region fields.
        let mut a: u32 = 0xABCD_0001;
        let mut b: u32 = 0;
        for region in &self.regions[..self.count] {
            for word in [
                region.base as u32,
                (region.base >> 32) as u32,
                region.len as u32,
                (region.len >> 32) as u32,
                region.kind as u32,
            ] {
                a = a.wrapping_add(word).rotate_left(3);
                b = b.wrapping_add(a);
            }
        }
        a ^ b
    }

    /// Verify the table has not been corrupted since `finalize`.
    pub fn verify(&self) -> KernelResult<()> {
        if !self.finalized {
            return Err(KernelError::NotInitialized {
                subsystem: "region table",
            });
        }
        if self.compute_checksum() != self.checksum {
            return Err(KernelError::Corruption {
                what: "memory region table checksum",
            });
        }
        Ok(())
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions[..self.count]
    }

    pub fn iter_available(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions().iter().filter(|r| r.kind.is_usable())
    }

    /// Classification of a physical address; gaps default to Reserved.
    pub fn kind_at(&self, addr: PhysicalAddress) -> RegionKind {
        for region in self.regions() {
            if region.contains(addr.as_u32() as u64) {
                return region.kind;
            }
        }
        RegionKind::Reserved
    }

    /// Highest end address of any Available region (clamped to 32 bits).
    pub fn highest_available(&self) -> u64 {
        self.iter_available().map(|r| r.end()).max().unwrap_or(0)
    }
}

impl Default for RegionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn table(entries: &[(u64, u64, RegionKind)]) -> RegionTable {
        let mut t = RegionTable::new();
        for &(base, len, kind) in entries {
            t.add(MemoryRegion::new(base, len, kind))
                .expect("table capacity is sufficient for test fixtures");
        }
        t.finalize();
        t
    }

    #[test]
    fn low_megabyte_is_forced_reserved() {
        let t = table(&[(0, 0x200_0000, RegionKind::Available)]);
        assert_eq!(t.kind_at(PhysicalAddress::new(0x1000)), RegionKind::Reserved);
        assert_eq!(
            t.kind_at(PhysicalAddress::new(0x10_0000)),
            RegionKind::Available
        );
    }

    #[test]
    fn subpage_slivers_are_truncated() {
        // Usable region [0x100800, 0x103800) rounds inward to the whole
        // pages [0x101000, 0x103000).
        let t = table(&[(0x10_0800, 0x3000, RegionKind::Available)]);
        assert_eq!(t.kind_at(PhysicalAddress::new(0x10_0800)), RegionKind::Reserved);
        assert_eq!(
            t.kind_at(PhysicalAddress::new(0x10_1000)),
            RegionKind::Available
        );
        assert_eq!(t.kind_at(PhysicalAddress::new(0x10_3000)), RegionKind::Reserved);
    }

    #[test]
    fn reserved_wins_overlap() {
        let t = table(&[
            (0x10_0000, 0x100_0000, RegionKind::Available),
            (0x80_0000, 0x1_0000, RegionKind::Kernel),
        ]);
        assert_eq!(t.kind_at(PhysicalAddress::new(0x80_0000)), RegionKind::Kernel);
        // Before and after the kernel the RAM is still usable.
        assert_eq!(
            t.kind_at(PhysicalAddress::new(0x7F_F000)),
            RegionKind::Available
        );
        assert_eq!(
            t.kind_at(PhysicalAddress::new(0x81_0000)),
            RegionKind::Available
        );
    }

    #[test]
    fn kernel_at_region_start_keeps_tail_usable() {
        // Kernel image and the usable region share a base address: the RAM
        // above the image must survive the carve.
        let t = table(&[
            (0x10_0000, 0x1F0_0000, RegionKind::Available),
            (0x10_0000, 0x20_0000, RegionKind::Kernel),
        ]);
        assert_eq!(t.kind_at(PhysicalAddress::new(0x10_0000)), RegionKind::Kernel);
        assert_eq!(
            t.kind_at(PhysicalAddress::new(0x30_0000)),
            RegionKind::Available
        );
        assert_eq!(t.highest_available(), 0x200_0000);
    }

    #[test]
    fn regions_sorted_and_checksummed() {
        let t = table(&[
            (0x200_0000, 0x10_0000, RegionKind::Available),
            (0x10_0000, 0x10_0000, RegionKind::Available),
        ]);
        let bases: alloc::vec::Vec<u64> = t.regions().iter().map(|r| r.base).collect();
        let mut sorted = bases.clone();
        sorted.sort_unstable();
        assert_eq!(bases, sorted);
        t.verify().expect("freshly finalized table should verify");
    }

    #[test]
    fn verify_detects_tampering() {
        let mut t = table(&[(0x10_0000, 0x10_0000, RegionKind::Available)]);
        t.regions[0].len += PAGE_SIZE as u64;
        assert_eq!(
            t.verify(),
            Err(KernelError::Corruption {
                what: "memory region table checksum"
            })
        );
    }

    #[test]
    fn add_after_finalize_is_rejected() {
        let mut t = table(&[(0x10_0000, 0x10_0000, RegionKind::Available)]);
        assert!(t
            .add(MemoryRegion::new(0x300_0000, 0x1000, RegionKind::Available))
            .is_err());
    }

    #[test]
    fn highest_available_tracks_top() {
        let t = table(&[
            (0x10_0000, 0x1F0_0000, RegionKind::Available),
            (0x300_0000, 0x100_0000, RegionKind::Available),
        ]);
        assert_eq!(t.highest_available(), 0x400_0000);
    }
}
