//! Page-fault recovery policy
//!
//! Vector 14 lands here after the trap layer has read CR2 and decoded the
//! error code. The policy, in order:
//!
//! 1. Repeated faults at one address (beyond the limit) are fatal.
//! 2. The null page is guard-mapped and the fault stays fatal.
//! 3. Addresses whose top byte matches a known corruption fill pattern get
//!    a guard page, a counted fault, and no resume. The pattern set is
//!    configurable in [`PageFaultPolicy`].
//! 4. Guard-area hits are counted and fatal.
//! 5. Kernel-space: a write is fatal; a read gets a zero page and resumes.
//! 6. User-space: a zero-filled frame is mapped and the task resumes.

use bitflags::bitflags;

use super::phys::{zero_frame, PhysAccess};
use super::vas::{AddressSpace, Area, AreaKind, Protection};
use super::vmm::Vmm;
use super::{FrameAllocator, PageFlags, VirtualAddress, KERNEL_BASE, PAGE_SIZE};

bitflags! {
    /// x86 page-fault error code bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultErrorCode: u32 {
        /// 0 = not-present, 1 = protection violation.
        const PRESENT  = 1 << 0;
        /// 0 = read, 1 = write.
        const WRITE    = 1 << 1;
        /// 0 = supervisor, 1 = user mode.
        const USER     = 1 << 2;
        /// Reserved bit set in a paging structure.
        const RESERVED = 1 << 3;
        /// Instruction fetch.
        const FETCH    = 1 << 4;
    }
}

/// Everything the handler needs about one fault.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    /// CR2 at fault time.
    pub address: VirtualAddress,
    pub code: PageFaultErrorCode,
    pub eip: u32,
}

/// Why a fault could not be recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalFault {
    NullDereference,
    CorruptionPattern,
    GuardPageHit,
    KernelWrite,
    ProtectionViolation,
    RepeatedFault,
    OutOfMemory,
}

impl FatalFault {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NullDereference => "null pointer dereference",
            Self::CorruptionPattern => "corruption-pattern address",
            Self::GuardPageHit => "guard page hit",
            Self::KernelWrite => "write to kernel memory",
            Self::ProtectionViolation => "protection violation",
            Self::RepeatedFault => "repeated fault at same address",
            Self::OutOfMemory => "no frame for fault recovery",
        }
    }
}

/// Outcome of the recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// The mapping was repaired; re-run the faulting instruction.
    Resumed,
    /// Not recoverable; the caller panics with the fault context.
    Fatal(FatalFault),
}

/// Tunable knobs of the classifier.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultPolicy {
    /// Top bytes treated as poison/fill patterns (heuristic).
    pub corruption_top_bytes: [u8; 4],
    /// Faults at one address beyond this are fatal.
    pub max_repeats: u32,
}

impl Default for PageFaultPolicy {
    fn default() -> Self {
        Self {
            corruption_top_bytes: [0xAA, 0xDE, 0xCC, 0x55],
            max_repeats: 5,
        }
    }
}

/// Small ring remembering recent fault addresses per task.
#[derive(Debug, Clone)]
pub struct FaultTracker {
    entries: [(u32, u32); Self::CAPACITY],
    cursor: usize,
}

impl FaultTracker {
    const CAPACITY: usize = 16;

    pub const fn new() -> Self {
        Self {
            entries: [(0, 0); Self::CAPACITY],
            cursor: 0,
        }
    }

    /// Record a fault at `page`; returns how many times it has now faulted.
    pub fn record(&mut self, page: u32) -> u32 {
        for entry in self.entries.iter_mut() {
            if entry.0 == page && entry.1 > 0 {
                entry.1 += 1;
                return entry.1;
            }
        }
        self.entries[self.cursor] = (page, 1);
        self.cursor = (self.cursor + 1) % Self::CAPACITY;
        1
    }
}

impl Default for FaultTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn install_guard(space: &mut AddressSpace, page: VirtualAddress) {
    // Best effort: an overlapping area just means the range is already
    // tracked.
    let _ = space.insert_area(Area::new(
        page,
        page.offset(PAGE_SIZE as u32),
        Protection::Guard,
        AreaKind::Guard,
    ));
}

/// Run the recovery policy for one fault.
#[allow(clippy::too_many_arguments)]
pub fn handle_page_fault(
    info: PageFaultInfo,
    policy: &PageFaultPolicy,
    tracker: &mut FaultTracker,
    space: &mut AddressSpace,
    vmm: &mut Vmm,
    pmm: &mut FrameAllocator,
    phys: &dyn PhysAccess,
) -> FaultResolution {
    let page = info.address.align_down();

    // 1. Fault storms at one address never resolve themselves.
    if tracker.record(page.as_u32()) > policy.max_repeats {
        return FaultResolution::Fatal(FatalFault::RepeatedFault);
    }

    // 2. Null page: bookkeep a guard, then die anyway.
    if info.address.as_u32() < PAGE_SIZE as u32 {
        install_guard(space, page);
        return FaultResolution::Fatal(FatalFault::NullDereference);
    }

    // 3. Poison-fill addresses mean someone dereferenced freed or
    //    redzone-patterned memory.
    let top = (info.address.as_u32() >> 24) as u8;
    if policy.corruption_top_bytes.contains(&top) {
        install_guard(space, page);
        if let Some(area) = space.find_area_mut(info.address) {
            area.fault_count += 1;
        }
        return FaultResolution::Fatal(FatalFault::CorruptionPattern);
    }

    // 4. Consult the area list: guard areas are always fatal.
    if let Some(area) = space.find_area_mut(info.address) {
        area.fault_count += 1;
        if area.protection == Protection::Guard {
            space.note_guard_hit();
            return FaultResolution::Fatal(FatalFault::GuardPageHit);
        }
        if info.code.contains(PageFaultErrorCode::WRITE) && !area.protection.is_writable() {
            return FaultResolution::Fatal(FatalFault::ProtectionViolation);
        }
    }

    // 5. Kernel space: writes are fatal, reads get a zero page.
    if info.address.as_u32() >= KERNEL_BASE {
        if info.code.contains(PageFaultErrorCode::WRITE) {
            return FaultResolution::Fatal(FatalFault::KernelWrite);
        }
        return map_zero_page(space, vmm, pmm, phys, page, PageFlags::empty());
    }

    // 6. User space: zero-fill on demand.
    let flags = match space.find_area(info.address) {
        Some(area) => match area.protection.page_flags() {
            Some(flags) => flags,
            // A no-access area never gets a frame.
            None => return FaultResolution::Fatal(FatalFault::ProtectionViolation),
        },
        // No area yet: the page becomes an anonymous read-write mapping.
        None => {
            let _ = space.insert_area(Area::new(
                page,
                page.offset(PAGE_SIZE as u32),
                Protection::ReadWrite,
                AreaKind::Anonymous,
            ));
            PageFlags::USER | PageFlags::WRITABLE
        }
    };
    map_zero_page(space, vmm, pmm, phys, page, flags)
}

fn map_zero_page(
    space: &mut AddressSpace,
    vmm: &mut Vmm,
    pmm: &mut FrameAllocator,
    phys: &dyn PhysAccess,
    page: VirtualAddress,
    flags: PageFlags,
) -> FaultResolution {
    let frame = match pmm.alloc_frame() {
        Ok(frame) => frame,
        Err(_) => return FaultResolution::Fatal(FatalFault::OutOfMemory),
    };
    zero_frame(phys, frame);
    match vmm.map_page(space.directory(), page, frame, flags, pmm, phys) {
        Ok(()) => {
            space.note_page_mapped();
            space.note_fault_recovered();
            FaultResolution::Resumed
        }
        Err(_) => {
            // Present PTE under a fault means the tables disagree with the
            // CPU; do not resume.
            let _ = pmm.free_frame(frame);
            FaultResolution::Fatal(FatalFault::ProtectionViolation)
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::phys::SimRam;
    use crate::mm::region::{MemoryRegion, RegionKind, RegionTable};
    use crate::mm::vas::USER_STACK_TOP;
    use crate::mm::vmm::VmmInitParams;
    use crate::mm::PhysicalAddress;
    use alloc::boxed::Box;

    struct Rig {
        pmm: Box<FrameAllocator>,
        ram: SimRam,
        vmm: Vmm,
        space: AddressSpace,
        policy: PageFaultPolicy,
        tracker: FaultTracker,
    }

    fn rig() -> Rig {
        let ram = SimRam::new(0x10_0000, 32 * 1024 * 1024);
        let mut regions = RegionTable::new();
        regions
            .add(MemoryRegion::new(0x10_0000, 32 * 1024 * 1024, RegionKind::Available))
            .expect("region fits");
        regions.finalize();
        let mut pmm = Box::new(FrameAllocator::new());
        pmm.init(&regions, PhysicalAddress::new(0x20_0000))
            .expect("pmm init");
        let mut vmm = Vmm::init(
            VmmInitParams {
                kernel_start: PhysicalAddress::new(0x10_0000),
                kernel_end: PhysicalAddress::new(0x20_0000),
                usable_top: 0x210_0000,
            },
            &mut pmm,
            &ram,
        )
        .expect("vmm init");
        let dir = vmm.create_directory(&mut pmm, &ram).expect("dir");
        Rig {
            pmm,
            ram,
            vmm,
            space: AddressSpace::new(dir),
            policy: PageFaultPolicy::default(),
            tracker: FaultTracker::new(),
        }
    }

    fn fault(r: &mut Rig, addr: u32, code: PageFaultErrorCode) -> FaultResolution {
        handle_page_fault(
            PageFaultInfo {
                address: VirtualAddress::new(addr),
                code,
                eip: 0x0804_8000,
            },
            &r.policy,
            &mut r.tracker,
            &mut r.space,
            &mut r.vmm,
            &mut r.pmm,
            &r.ram,
        )
    }

    #[test]
    fn fresh_user_page_is_zero_filled_and_resumes() {
        let mut r = rig();
        let resolution = fault(&mut r, 0x4000_2000, PageFaultErrorCode::USER);
        assert_eq!(resolution, FaultResolution::Resumed);

        let paddr = r
            .vmm
            .translate(r.space.directory(), VirtualAddress::new(0x4000_2000), &r.ram)
            .expect("page is now mapped");
        for off in [0u32, 1, 0xFFF] {
            assert_eq!(r.ram.read_byte(PhysicalAddress::new(paddr.as_u32() + off)), 0);
        }
        assert_eq!(r.space.stats().faults_recovered, 1);
        // An anonymous area now tracks the page.
        assert!(r.space.find_area(VirtualAddress::new(0x4000_2000)).is_some());
    }

    #[test]
    fn null_dereference_is_fatal_after_bookkeeping() {
        let mut r = rig();
        assert_eq!(
            fault(&mut r, 0x42, PageFaultErrorCode::USER),
            FaultResolution::Fatal(FatalFault::NullDereference)
        );
        let area = r.space.find_area(VirtualAddress::new(0)).expect("guard recorded");
        assert_eq!(area.protection, Protection::Guard);
    }

    #[test]
    fn corruption_patterns_are_fatal_by_default_but_configurable() {
        let mut r = rig();
        assert_eq!(
            fault(&mut r, 0x5500_1000, PageFaultErrorCode::USER),
            FaultResolution::Fatal(FatalFault::CorruptionPattern)
        );

        // Reconfigured policy: 0x55 is ordinary user space again.
        let mut r = rig();
        r.policy.corruption_top_bytes = [0xAA, 0xDE, 0xCC, 0xFE];
        assert_eq!(
            fault(&mut r, 0x5500_1000, PageFaultErrorCode::USER),
            FaultResolution::Resumed
        );
    }

    #[test]
    fn guard_page_hit_is_counted_and_unrecoverable() {
        let mut r = rig();
        // One-page guard immediately below a user stack.
        let stack_base = USER_STACK_TOP - (4 * PAGE_SIZE as u32);
        let guard = VirtualAddress::new(stack_base - PAGE_SIZE as u32);
        r.space
            .create_guard(guard, 1, &mut r.vmm, &mut r.pmm, &r.ram)
            .expect("guard installed");

        assert_eq!(
            fault(&mut r, guard.as_u32() + 4, PageFaultErrorCode::USER | PageFaultErrorCode::WRITE),
            FaultResolution::Fatal(FatalFault::GuardPageHit)
        );
        assert_eq!(r.space.stats().guard_page_hits, 1);
    }

    #[test]
    fn kernel_write_faults_panic_kernel_reads_resume() {
        let mut r = rig();
        assert_eq!(
            fault(&mut r, 0xC500_0000, PageFaultErrorCode::WRITE),
            FaultResolution::Fatal(FatalFault::KernelWrite)
        );
        assert_eq!(
            fault(&mut r, 0xC500_4000, PageFaultErrorCode::empty()),
            FaultResolution::Resumed
        );
        assert!(r
            .vmm
            .is_mapped(r.space.directory(), VirtualAddress::new(0xC500_4000), &r.ram));
    }

    #[test]
    fn write_to_read_only_area_is_protection_violation() {
        let mut r = rig();
        r.space
            .insert_area(Area::new(
                VirtualAddress::new(0x0804_8000 & !0xFFF),
                VirtualAddress::new(0x0804_9000),
                Protection::Read,
                AreaKind::File,
            ))
            .expect("area");
        assert_eq!(
            fault(
                &mut r,
                0x0804_8100,
                PageFaultErrorCode::USER | PageFaultErrorCode::WRITE | PageFaultErrorCode::PRESENT
            ),
            FaultResolution::Fatal(FatalFault::ProtectionViolation)
        );
    }

    #[test]
    fn sixth_fault_at_same_address_is_fatal() {
        let mut r = rig();
        // Kernel writes never map anything, so the address keeps faulting.
        for _ in 0..5 {
            assert_eq!(
                fault(&mut r, 0xC600_0000, PageFaultErrorCode::WRITE),
                FaultResolution::Fatal(FatalFault::KernelWrite)
            );
        }
        assert_eq!(
            fault(&mut r, 0xC600_0000, PageFaultErrorCode::WRITE),
            FaultResolution::Fatal(FatalFault::RepeatedFault)
        );
    }
}
