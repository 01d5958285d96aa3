//! Per-task virtual address spaces
//!
//! An [`AddressSpace`] is a page directory plus a sorted list of disjoint
//! [`Area`]s and some statistics. Areas carry a protection, a type, a
//! creation timestamp, a fault counter, and a checksum over their fixed
//! fields. Guard areas have no backing frames; any access to one faults
//! and is never recovered.

use alloc::vec::Vec;

use bitflags::bitflags;

use super::phys::PhysAccess;
use super::vmm::Vmm;
use super::{FrameAllocator, PageFlags, PhysicalAddress, VirtualAddress, PAGE_SIZE};
use crate::arch;
use crate::error::{KernelError, KernelResult};

/// Base of the per-process user heap (`brk` starts here).
pub const USER_HEAP_BASE: u32 = 0x4000_0000;
/// The program break may not grow past this.
pub const USER_BRK_LIMIT: u32 = 0xA000_0000;
/// Top of the initial user stack mapping.
pub const USER_STACK_TOP: u32 = 0xBFFF_F000;
/// Pages mapped below [`USER_STACK_TOP`] at task creation.
pub const USER_STACK_PAGES: usize = 16;

bitflags! {
    /// Hardening toggles an address space may opt into.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SecurityFlags: u32 {
        const ASLR        = 1 << 0;
        const DEP         = 1 << 1;
        const STACK_GUARD = 1 << 2;
        const HEAP_GUARD  = 1 << 3;
    }
}

/// Access rights of an area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    Read,
    ReadWrite,
    ReadExecute,
    ReadWriteExecute,
    Guard,
}

impl Protection {
    /// Page flags for a user mapping with this protection. `None` means
    /// the range stays unmapped (Guard / no-access).
    pub fn page_flags(self) -> Option<PageFlags> {
        match self {
            Protection::None | Protection::Guard => None,
            // 32-bit x86 without PAE has no no-execute bit; execute
            // permission collapses onto read.
            Protection::Read | Protection::ReadExecute => Some(PageFlags::USER),
            Protection::ReadWrite | Protection::ReadWriteExecute => {
                Some(PageFlags::USER | PageFlags::WRITABLE)
            }
        }
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Protection::ReadWrite | Protection::ReadWriteExecute)
    }
}

/// What an area is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaKind {
    Anonymous,
    Heap,
    Stack,
    File,
    Device,
    Shared,
    Guard,
}

/// A typed, protected virtual range `[start, end)`.
#[derive(Debug, Clone)]
pub struct Area {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub protection: Protection,
    pub kind: AreaKind,
    pub created_at: u64,
    pub fault_count: u32,
    checksum: u32,
}

impl Area {
    pub fn new(
        start: VirtualAddress,
        end: VirtualAddress,
        protection: Protection,
        kind: AreaKind,
    ) -> Self {
        let mut area = Self {
            start,
            end,
            protection,
            kind,
            created_at: arch::read_tsc(),
            fault_count: 0,
            checksum: 0,
        };
        area.refresh_checksum();
        area
    }

    pub fn contains(&self, addr: VirtualAddress) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn pages(&self) -> usize {
        (self.end.as_u32() - self.start.as_u32()) as usize / PAGE_SIZE
    }

    fn compute_checksum(&self) -> u32 {
        self.start
            .as_u32()
            .rotate_left(5)
            .wrapping_add(self.end.as_u32())
            .rotate_left(5)
            .wrapping_add(self.protection as u32)
            .rotate_left(5)
            .wrapping_add(self.kind as u32)
            .wrapping_add(self.created_at as u32)
    }

    pub fn refresh_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn verify(&self) -> KernelResult<()> {
        if self.compute_checksum() != self.checksum {
            return Err(KernelError::Corruption {
                what: "address-space area checksum",
            });
        }
        Ok(())
    }
}

/// Address-space statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct VasStats {
    pub areas_created: u64,
    pub pages_mapped: u64,
    pub faults_recovered: u64,
    pub guard_page_hits: u64,
}

/// A page directory, its areas, and bookkeeping.
pub struct AddressSpace {
    directory: PhysicalAddress,
    /// Sorted by start; pairwise disjoint.
    areas: Vec<Area>,
    pub security: SecurityFlags,
    stats: VasStats,
    brk_base: VirtualAddress,
    brk: VirtualAddress,
}

impl AddressSpace {
    pub fn new(directory: PhysicalAddress) -> Self {
        Self {
            directory,
            areas: Vec::new(),
            security: SecurityFlags::DEP | SecurityFlags::STACK_GUARD,
            stats: VasStats::default(),
            brk_base: VirtualAddress::new(USER_HEAP_BASE),
            brk: VirtualAddress::new(USER_HEAP_BASE),
        }
    }

    pub fn directory(&self) -> PhysicalAddress {
        self.directory
    }

    pub fn stats(&self) -> VasStats {
        self.stats
    }

    pub fn areas(&self) -> &[Area] {
        &self.areas
    }

    /// Insert a new area; ranges must not overlap any existing area.
    pub fn insert_area(&mut self, area: Area) -> KernelResult<()> {
        if area.end <= area.start {
            return Err(KernelError::InvalidSize {
                size: area.end.as_u32() as usize,
            });
        }
        let idx = self
            .areas
            .partition_point(|a| a.start.as_u32() < area.start.as_u32());
        if idx > 0 && self.areas[idx - 1].end > area.start {
            return Err(KernelError::InvalidState {
                expected: "disjoint areas",
                actual: "overlapping range",
            });
        }
        if idx < self.areas.len() && self.areas[idx].start < area.end {
            return Err(KernelError::InvalidState {
                expected: "disjoint areas",
                actual: "overlapping range",
            });
        }
        self.areas.insert(idx, area);
        self.stats.areas_created += 1;
        Ok(())
    }

    pub fn find_area(&self, addr: VirtualAddress) -> Option<&Area> {
        let idx = self.areas.partition_point(|a| a.end.as_u32() <= addr.as_u32());
        self.areas.get(idx).filter(|a| a.contains(addr))
    }

    pub fn find_area_mut(&mut self, addr: VirtualAddress) -> Option<&mut Area> {
        let idx = self.areas.partition_point(|a| a.end.as_u32() <= addr.as_u32());
        self.areas.get_mut(idx).filter(|a| a.contains(addr))
    }

    pub fn remove_area(&mut self, start: VirtualAddress) -> Option<Area> {
        let idx = self.areas.iter().position(|a| a.start == start)?;
        Some(self.areas.remove(idx))
    }

    pub fn note_fault_recovered(&mut self) {
        self.stats.faults_recovered += 1;
    }

    pub fn note_page_mapped(&mut self) {
        self.stats.pages_mapped += 1;
    }

    pub fn note_guard_hit(&mut self) {
        self.stats.guard_page_hits += 1;
    }

    // -- protection changes -------------------------------------------------

    /// Remap `[base, base + count pages)` with a new protection
    /// (unmap-then-map, preserving the backing frames) and update the
    /// covering area. The range must lie inside one area.
    pub fn protect_pages(
        &mut self,
        base: VirtualAddress,
        count: usize,
        new_prot: Protection,
        vmm: &mut Vmm,
        pmm: &mut FrameAllocator,
        phys: &dyn PhysAccess,
    ) -> KernelResult<()> {
        let end = base.offset((count * PAGE_SIZE) as u32);
        {
            let area = self
                .find_area(base)
                .ok_or(KernelError::NotMapped { vaddr: base.as_u32() })?;
            if end > area.end {
                return Err(KernelError::InvalidAddress { addr: end.as_u32() });
            }
        }

        let flags = new_prot.page_flags();
        let mut vaddr = base.align_down();
        while vaddr < end {
            match vmm.unmap_page(self.directory, vaddr, phys) {
                Ok(old) => match flags {
                    Some(f) => {
                        vmm.map_page(self.directory, vaddr, old, f, pmm, phys)?;
                    }
                    None => {
                        // Dropping to Guard/None releases the frame.
                        let _ = pmm.free_frame(old);
                    }
                },
                // Never-faulted-in pages have nothing to remap.
                Err(KernelError::NotMapped { .. }) => {}
                Err(e) => return Err(e),
            }
            vaddr = vaddr.offset(PAGE_SIZE as u32);
        }

        let area = self
            .find_area_mut(base)
            .ok_or(KernelError::NotMapped { vaddr: base.as_u32() })?;
        area.protection = new_prot;
        if new_prot == Protection::Guard {
            area.kind = AreaKind::Guard;
        }
        area.refresh_checksum();
        Ok(())
    }

    /// Record a guard area over `[base, base + count pages)`: the range is
    /// unmapped (frames released) and any future access is a fatal fault.
    pub fn create_guard(
        &mut self,
        base: VirtualAddress,
        count: usize,
        vmm: &mut Vmm,
        pmm: &mut FrameAllocator,
        phys: &dyn PhysAccess,
    ) -> KernelResult<()> {
        let end = base.offset((count * PAGE_SIZE) as u32);
        let mut vaddr = base.align_down();
        while vaddr < end {
            if let Ok(old) = vmm.unmap_page(self.directory, vaddr, phys) {
                let _ = pmm.free_frame(old);
            }
            vaddr = vaddr.offset(PAGE_SIZE as u32);
        }
        self.insert_area(Area::new(base, end, Protection::Guard, AreaKind::Guard))
    }

    // -- program break ------------------------------------------------------

    pub fn brk_base(&self) -> VirtualAddress {
        self.brk_base
    }

    pub fn current_brk(&self) -> VirtualAddress {
        self.brk
    }

    /// Move the program break. `new_brk == 0` queries the current value.
    /// Growth only adjusts the Heap area; pages are zero-filled on demand
    /// by the page-fault handler.
    pub fn set_brk(&mut self, new_brk: u32) -> KernelResult<u32> {
        if new_brk == 0 {
            return Ok(self.brk.as_u32());
        }
        if new_brk < self.brk_base.as_u32() || new_brk >= USER_BRK_LIMIT {
            return Err(KernelError::InvalidAddress { addr: new_brk });
        }

        let new_end = VirtualAddress::new(new_brk).align_up();
        match self.find_area_mut(self.brk_base) {
            Some(area) if area.kind == AreaKind::Heap => {
                area.end = new_end.max(area.start.offset(PAGE_SIZE as u32));
                area.refresh_checksum();
            }
            Some(_) => {
                return Err(KernelError::InvalidState {
                    expected: "heap area at brk base",
                    actual: "foreign area",
                });
            }
            None => {
                self.insert_area(Area::new(
                    self.brk_base,
                    new_end.max(self.brk_base.offset(PAGE_SIZE as u32)),
                    Protection::ReadWrite,
                    AreaKind::Heap,
                ))?;
            }
        }
        self.brk = VirtualAddress::new(new_brk);
        Ok(new_brk)
    }

    /// Tear down the whole address space, returning every private frame.
    pub fn destroy(
        self,
        vmm: &mut Vmm,
        pmm: &mut FrameAllocator,
        phys: &dyn PhysAccess,
    ) -> KernelResult<()> {
        vmm.destroy_directory(self.directory, pmm, phys)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::phys::SimRam;
    use crate::mm::region::{MemoryRegion, RegionKind, RegionTable};
    use crate::mm::vmm::VmmInitParams;
    use alloc::boxed::Box;

    fn rig() -> (Box<FrameAllocator>, SimRam, Vmm) {
        let ram = SimRam::new(0x10_0000, 32 * 1024 * 1024);
        let mut regions = RegionTable::new();
        regions
            .add(MemoryRegion::new(0x10_0000, 32 * 1024 * 1024, RegionKind::Available))
            .expect("region fits");
        regions.finalize();
        let mut pmm = Box::new(FrameAllocator::new());
        pmm.init(&regions, PhysicalAddress::new(0x20_0000))
            .expect("pmm init");
        let vmm = Vmm::init(
            VmmInitParams {
                kernel_start: PhysicalAddress::new(0x10_0000),
                kernel_end: PhysicalAddress::new(0x20_0000),
                usable_top: 0x210_0000,
            },
            &mut pmm,
            &ram,
        )
        .expect("vmm init");
        (pmm, ram, vmm)
    }

    fn area(start: u32, end: u32) -> Area {
        Area::new(
            VirtualAddress::new(start),
            VirtualAddress::new(end),
            Protection::ReadWrite,
            AreaKind::Anonymous,
        )
    }

    #[test]
    fn areas_stay_disjoint() {
        let mut space = AddressSpace::new(PhysicalAddress::new(0x1000));
        space
            .insert_area(area(0x4000_0000, 0x4000_4000))
            .expect("first area");
        space
            .insert_area(area(0x4001_0000, 0x4001_4000))
            .expect("non-overlapping area");

        // Overlapping front, back, and containment all rejected.
        assert!(space.insert_area(area(0x4000_2000, 0x4000_6000)).is_err());
        assert!(space.insert_area(area(0x3FFF_F000, 0x4000_1000)).is_err());
        assert!(space.insert_area(area(0x4000_1000, 0x4000_2000)).is_err());
        assert_eq!(space.areas().len(), 2);

        // All pairs disjoint.
        for (i, a) in space.areas().iter().enumerate() {
            for b in space.areas().iter().skip(i + 1) {
                assert!(a.end <= b.start || b.end <= a.start);
            }
        }
    }

    #[test]
    fn find_area_hits_the_right_range() {
        let mut space = AddressSpace::new(PhysicalAddress::new(0x1000));
        space
            .insert_area(area(0x4000_0000, 0x4000_4000))
            .expect("insert");
        assert!(space.find_area(VirtualAddress::new(0x4000_1234)).is_some());
        assert!(space.find_area(VirtualAddress::new(0x4000_4000)).is_none());
        assert!(space.find_area(VirtualAddress::new(0x3FFF_FFFF)).is_none());
    }

    #[test]
    fn area_checksum_detects_tampering() {
        let mut a = area(0x4000_0000, 0x4000_4000);
        a.verify().expect("fresh area verifies");
        a.end = VirtualAddress::new(0x5000_0000);
        assert!(a.verify().is_err());
        a.refresh_checksum();
        a.verify().expect("refreshed checksum verifies");
    }

    #[test]
    fn brk_creates_then_grows_heap_area() {
        let mut space = AddressSpace::new(PhysicalAddress::new(0x1000));
        assert_eq!(space.set_brk(0).expect("query"), USER_HEAP_BASE);

        let grown = space.set_brk(USER_HEAP_BASE + 0x3000).expect("grow");
        assert_eq!(grown, USER_HEAP_BASE + 0x3000);
        let heap = space
            .find_area(VirtualAddress::new(USER_HEAP_BASE))
            .expect("heap area exists");
        assert_eq!(heap.kind, AreaKind::Heap);
        assert_eq!(heap.end.as_u32(), USER_HEAP_BASE + 0x3000);

        // Shrinking and re-growing adjusts the same area.
        space.set_brk(USER_HEAP_BASE + 0x1000).expect("shrink");
        assert_eq!(space.areas().len(), 1);

        // Below the base is invalid.
        assert!(space.set_brk(USER_HEAP_BASE - 0x1000).is_err());
    }

    #[test]
    fn protect_pages_preserves_backing_frames() {
        let (mut pmm, ram, mut vmm) = rig();
        let dir = vmm.create_directory(&mut pmm, &ram).expect("dir");
        let mut space = AddressSpace::new(dir);
        let base = VirtualAddress::new(0x4000_0000);
        space
            .insert_area(Area::new(
                base,
                base.offset(2 * PAGE_SIZE as u32),
                Protection::ReadWrite,
                AreaKind::Anonymous,
            ))
            .expect("area");

        let frame = pmm.alloc_frame().expect("frame");
        vmm.map_page(dir, base, frame, PageFlags::USER | PageFlags::WRITABLE, &mut pmm, &ram)
            .expect("map");

        space
            .protect_pages(base, 2, Protection::Read, &mut vmm, &mut pmm, &ram)
            .expect("protect");
        // Same frame, still mapped.
        assert_eq!(vmm.translate(dir, base, &ram), Some(frame));
        assert_eq!(
            space.find_area(base).expect("area").protection,
            Protection::Read
        );
        space.find_area(base).expect("area").verify().expect("checksum updated");
    }

    #[test]
    fn guard_conversion_releases_frames() {
        let (mut pmm, ram, mut vmm) = rig();
        let dir = vmm.create_directory(&mut pmm, &ram).expect("dir");
        let mut space = AddressSpace::new(dir);
        let base = VirtualAddress::new(0x5000_0000);

        let frame = pmm.alloc_frame().expect("frame");
        vmm.map_page(dir, base, frame, PageFlags::USER | PageFlags::WRITABLE, &mut pmm, &ram)
            .expect("map");
        let free_before = pmm.free_frames_count();

        space
            .create_guard(base, 1, &mut vmm, &mut pmm, &ram)
            .expect("guard");
        assert_eq!(vmm.translate(dir, base, &ram), None);
        assert_eq!(pmm.free_frames_count(), free_before + 1);
        let guard = space.find_area(base).expect("guard area");
        assert_eq!(guard.kind, AreaKind::Guard);
        assert_eq!(guard.protection, Protection::Guard);
    }
}
