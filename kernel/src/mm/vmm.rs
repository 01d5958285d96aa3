//! Virtual memory manager
//!
//! Builds and edits the two-level x86 page tables. The kernel directory
//! identity-maps low memory (page 0 excluded, so null dereferences trap),
//! maps the kernel image again at the higher half, and reserves the
//! Temporary-Mapping Window whose own page table is installed *before*
//! paging is enabled -- that is what lets the kernel edit page-table frames
//! it can no longer reach through the identity map.
//!
//! TLB discipline: every mutated PTE gets a single-page invalidation
//! (`INVLPG` when available, CR3 reload otherwise) behind a compiler fence;
//! bulk edits beyond [`BULK_FLUSH_THRESHOLD`] pages reload CR3 once.

use spin::{Mutex, Once};

use super::page_table::{PageTable, PAGE_TABLE_ENTRIES};
use super::phys::{zero_frame, PhysAccess, TEMP_WINDOW_BASE};
use super::{
    FrameAllocator, PageFlags, PhysicalAddress, VirtualAddress, KERNEL_BASE, PAGE_SIZE,
};
use crate::arch;
use crate::arch::x86::vga::VGA_TEXT_HIGHER_HALF;
use crate::error::{KernelError, KernelResult};

/// Identity-map at least this much (64 MiB).
pub const IDENTITY_MIN: u32 = 0x0400_0000;

/// Past this many pages, one CR3 reload beats per-page invalidations.
const BULK_FLUSH_THRESHOLD: usize = 64;

/// VMM statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmmStats {
    pub pages_mapped: u64,
    pub pages_unmapped: u64,
    pub single_flushes: u64,
    pub full_flushes: u64,
    pub directories_created: u32,
    pub directories_destroyed: u32,
}

/// The virtual memory manager.
pub struct Vmm {
    kernel_directory: PhysicalAddress,
    /// Top of the identity-mapped range.
    identity_limit: u32,
    /// Frame of the Temporary-Mapping Window's page table.
    window_table: PhysicalAddress,
    invlpg_supported: bool,
    paging_enabled: bool,
    stats: VmmStats,
}

/// Parameters `init` needs from the boot path.
#[derive(Debug, Clone, Copy)]
pub struct VmmInitParams {
    pub kernel_start: PhysicalAddress,
    pub kernel_end: PhysicalAddress,
    /// Highest usable physical address reported by the memory map.
    pub usable_top: u32,
}

impl Vmm {
    /// Build the kernel address space. Paging is *not* enabled here.
    pub fn init(
        params: VmmInitParams,
        pmm: &mut FrameAllocator,
        phys: &dyn PhysAccess,
    ) -> KernelResult<Self> {
        let kernel_directory = pmm.alloc_frame()?;
        zero_frame(phys, kernel_directory);

        // The window's page table must exist before paging turns on; its
        // frame stays below the identity limit so editing it never needs
        // the window itself.
        let window_table = pmm.alloc_frame()?;
        zero_frame(phys, window_table);

        let identity_limit = params
            .usable_top
            .max(IDENTITY_MIN)
            .min(TEMP_WINDOW_BASE);

        let mut vmm = Self {
            kernel_directory,
            identity_limit,
            window_table,
            invlpg_supported: arch::has_invlpg(),
            paging_enabled: false,
            stats: VmmStats::default(),
        };

        // Install the window's directory slot.
        {
            let dir = unsafe { &mut *(phys.frame_ptr(kernel_directory) as *mut PageTable) };
            let slot = VirtualAddress::new(TEMP_WINDOW_BASE).directory_index();
            dir[slot].set(window_table, PageFlags::WRITABLE);
        }

        // Identity map [PAGE_SIZE, identity_limit). Page 0 stays unmapped
        // so null dereferences fault.
        vmm.identity_map_range(
            kernel_directory,
            VirtualAddress::new(PAGE_SIZE as u32),
            VirtualAddress::new(identity_limit),
            PageFlags::WRITABLE,
            pmm,
            phys,
        )?;

        // Kernel image at the higher half.
        let mut paddr = params.kernel_start.as_u32() & !(PAGE_SIZE as u32 - 1);
        while paddr < params.kernel_end.as_u32() {
            vmm.map_page_inner(
                kernel_directory,
                VirtualAddress::new(KERNEL_BASE + paddr),
                PhysicalAddress::new(paddr),
                PageFlags::WRITABLE | PageFlags::GLOBAL,
                pmm,
                phys,
                false,
            )?;
            paddr += PAGE_SIZE as u32;
        }

        // VGA text buffer: identity (already covered above) plus the
        // higher-half alias the console switches to after paging.
        vmm.map_page_inner(
            kernel_directory,
            VirtualAddress::new(VGA_TEXT_HIGHER_HALF),
            PhysicalAddress::new(crate::arch::x86::vga::VGA_TEXT_PHYS),
            PageFlags::WRITABLE,
            pmm,
            phys,
            false,
        )?;

        log::info!(
            target: "vmm",
            "kernel directory {:#010x}, identity limit {:#010x}",
            kernel_directory.as_u32(),
            identity_limit
        );
        Ok(vmm)
    }

    pub fn kernel_directory(&self) -> PhysicalAddress {
        self.kernel_directory
    }

    pub fn identity_limit(&self) -> u32 {
        self.identity_limit
    }

    pub fn window_table(&self) -> PhysicalAddress {
        self.window_table
    }

    pub fn stats(&self) -> VmmStats {
        self.stats
    }

    /// Load CR3 and set CR0.PG (plus WP so the kernel honors read-only
    /// pages). Every pointer dereferenced after this must be mapped.
    pub fn enable_paging(&mut self) {
        arch::write_cr3(self.kernel_directory.as_u32());
        arch::write_cr0(arch::read_cr0() | arch::x86::CR0_PG | arch::x86::CR0_WP);
        self.paging_enabled = true;

        #[cfg(all(target_arch = "x86", target_os = "none"))]
        super::phys::kernel::KERNEL_PHYS.paging_enabled();
    }

    pub fn paging_enabled(&self) -> bool {
        self.paging_enabled
    }

    // -- TLB ----------------------------------------------------------------

    fn flush_page(&mut self, vaddr: VirtualAddress) {
        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
        if self.invlpg_supported {
            arch::invlpg(vaddr.as_u32());
            self.stats.single_flushes += 1;
        } else {
            self.flush_all();
        }
    }

    fn flush_all(&mut self) {
        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
        arch::write_cr3(arch::read_cr3());
        self.stats.full_flushes += 1;
    }

    // -- mapping ------------------------------------------------------------

    /// Map one page. Allocates and zeroes a page table on demand; refuses
    /// to touch a PTE that is already present.
    pub fn map_page(
        &mut self,
        dir: PhysicalAddress,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        flags: PageFlags,
        pmm: &mut FrameAllocator,
        phys: &dyn PhysAccess,
    ) -> KernelResult<()> {
        self.map_page_inner(dir, vaddr, paddr, flags, pmm, phys, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn map_page_inner(
        &mut self,
        dir: PhysicalAddress,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        flags: PageFlags,
        pmm: &mut FrameAllocator,
        phys: &dyn PhysAccess,
        flush: bool,
    ) -> KernelResult<()> {
        if !vaddr.is_page_aligned() {
            return Err(KernelError::InvalidAddress { addr: vaddr.as_u32() });
        }
        if !paddr.is_page_aligned() {
            return Err(KernelError::InvalidAddress { addr: paddr.as_u32() });
        }

        // SAFETY: `dir` is a page-directory frame owned by this VMM; the
        // window hands out a fresh slot per frame_ptr call, so the pointer
        // stays valid across the nested accesses below.
        let dir_table = unsafe { &mut *(phys.frame_ptr(dir) as *mut PageTable) };
        let pde = &mut dir_table[vaddr.directory_index()];

        let table_frame = match pde.addr() {
            Some(addr) => {
                // A user mapping needs USER at the directory level too.
                if flags.contains(PageFlags::USER) && !pde.flags().contains(PageFlags::USER) {
                    pde.add_flags(PageFlags::USER);
                }
                addr
            }
            None => {
                let frame = pmm.alloc_frame()?;
                zero_frame(phys, frame);
                let mut pde_flags = PageFlags::WRITABLE;
                if flags.contains(PageFlags::USER) {
                    pde_flags |= PageFlags::USER;
                }
                pde.set(frame, pde_flags);
                frame
            }
        };

        // SAFETY: `table_frame` was either just allocated or read from a
        // present PDE of a table this VMM built.
        let table = unsafe { &mut *(phys.frame_ptr(table_frame) as *mut PageTable) };
        let pte = &mut table[vaddr.table_index()];
        if pte.is_present() {
            // The second map must not mutate the entry.
            return Err(KernelError::AlreadyMapped { vaddr: vaddr.as_u32() });
        }
        pte.set(paddr, flags);

        self.stats.pages_mapped += 1;
        if flush {
            self.flush_page(vaddr);
        }
        Ok(())
    }

    /// Clear a PTE. The backing frame is *not* freed; that is the caller's
    /// decision. Returns the physical address that was mapped.
    pub fn unmap_page(
        &mut self,
        dir: PhysicalAddress,
        vaddr: VirtualAddress,
        phys: &dyn PhysAccess,
    ) -> KernelResult<PhysicalAddress> {
        if !vaddr.is_page_aligned() {
            return Err(KernelError::InvalidAddress { addr: vaddr.as_u32() });
        }

        // SAFETY: as in map_page_inner.
        let dir_table = unsafe { &mut *(phys.frame_ptr(dir) as *mut PageTable) };
        let pde = dir_table[vaddr.directory_index()];
        let table_frame = pde.addr().ok_or(KernelError::NotMapped { vaddr: vaddr.as_u32() })?;

        // SAFETY: present PDE of a table this VMM built.
        let table = unsafe { &mut *(phys.frame_ptr(table_frame) as *mut PageTable) };
        let pte = &mut table[vaddr.table_index()];
        let old = pte
            .addr()
            .ok_or(KernelError::NotMapped { vaddr: vaddr.as_u32() })?;
        pte.clear();

        self.stats.pages_unmapped += 1;
        self.flush_page(vaddr);
        Ok(old)
    }

    /// Walk the tables. Returns the physical address backing `vaddr`
    /// (including the page offset), or `None` if unmapped.
    pub fn translate(
        &self,
        dir: PhysicalAddress,
        vaddr: VirtualAddress,
        phys: &dyn PhysAccess,
    ) -> Option<PhysicalAddress> {
        // SAFETY: read-only walk of tables this VMM built.
        let dir_table = unsafe { &*(phys.frame_ptr(dir) as *const PageTable) };
        let table_frame = dir_table[vaddr.directory_index()].addr()?;
        // SAFETY: present PDE.
        let table = unsafe { &*(phys.frame_ptr(table_frame) as *const PageTable) };
        let page = table[vaddr.table_index()].addr()?;
        Some(PhysicalAddress::new(
            page.as_u32() + (vaddr.as_u32() & (PAGE_SIZE as u32 - 1)),
        ))
    }

    pub fn is_mapped(
        &self,
        dir: PhysicalAddress,
        vaddr: VirtualAddress,
        phys: &dyn PhysAccess,
    ) -> bool {
        self.translate(dir, vaddr, phys).is_some()
    }

    /// Identity-map `[start, end)`. Pages already mapped are left alone.
    /// Bulk invalidation: one CR3 reload when the range is large.
    pub fn identity_map_range(
        &mut self,
        dir: PhysicalAddress,
        start: VirtualAddress,
        end: VirtualAddress,
        flags: PageFlags,
        pmm: &mut FrameAllocator,
        phys: &dyn PhysAccess,
    ) -> KernelResult<()> {
        let pages = ((end.as_u32().saturating_sub(start.as_u32())) as usize) / PAGE_SIZE;
        let bulk = pages > BULK_FLUSH_THRESHOLD;

        let mut vaddr = start.align_down();
        while vaddr < end {
            match self.map_page_inner(
                dir,
                vaddr,
                PhysicalAddress::new(vaddr.as_u32()),
                flags,
                pmm,
                phys,
                !bulk && self.paging_enabled,
            ) {
                Ok(()) | Err(KernelError::AlreadyMapped { .. }) => {}
                Err(e) => return Err(e),
            }
            vaddr = vaddr.offset(PAGE_SIZE as u32);
        }

        if bulk && self.paging_enabled {
            self.flush_all();
        }
        Ok(())
    }

    // -- address-space lifecycle -------------------------------------------

    /// Allocate a fresh page directory sharing all kernel mappings.
    pub fn create_directory(
        &mut self,
        pmm: &mut FrameAllocator,
        phys: &dyn PhysAccess,
    ) -> KernelResult<PhysicalAddress> {
        let dir = pmm.alloc_frame()?;
        // SAFETY: freshly allocated frame; kernel directory is live.
        unsafe {
            let src = phys.frame_ptr(self.kernel_directory) as *const PageTable;
            let dst = phys.frame_ptr(dir) as *mut PageTable;
            core::ptr::copy_nonoverlapping(src, dst, 1);
        }
        self.stats.directories_created += 1;
        Ok(dir)
    }

    /// Tear down a user directory: free every private page-table frame and
    /// the user frames they map, then the directory frame itself. Entries
    /// shared with the kernel directory are skipped.
    pub fn destroy_directory(
        &mut self,
        dir: PhysicalAddress,
        pmm: &mut FrameAllocator,
        phys: &dyn PhysAccess,
    ) -> KernelResult<()> {
        if dir == self.kernel_directory {
            return Err(KernelError::InvalidState {
                expected: "user page directory",
                actual: "kernel directory",
            });
        }

        for slot in 0..PAGE_TABLE_ENTRIES {
            let (pde, kernel_pde) = {
                // SAFETY: both directories are live page-directory frames.
                let dir_table = unsafe { &*(phys.frame_ptr(dir) as *const PageTable) };
                let kernel_table =
                    unsafe { &*(phys.frame_ptr(self.kernel_directory) as *const PageTable) };
                (dir_table[slot], kernel_table[slot])
            };

            let table_frame = match pde.addr() {
                Some(addr) => addr,
                None => continue,
            };
            if pde == kernel_pde {
                // Shared kernel page table.
                continue;
            }

            // Private table: release the frames it maps, then the table.
            for entry in 0..PAGE_TABLE_ENTRIES {
                let pte = {
                    // SAFETY: present private PDE of this directory.
                    let table = unsafe { &*(phys.frame_ptr(table_frame) as *const PageTable) };
                    table[entry]
                };
                if let Some(page) = pte.addr() {
                    // Frames below the watermark (kernel image, MMIO) are
                    // rejected by the PMM; that is fine here.
                    let _ = pmm.free_frame(page);
                }
            }
            let _ = pmm.free_frame(table_frame);
        }

        pmm.free_frame(dir)?;
        self.stats.directories_destroyed += 1;
        Ok(())
    }
}

/// RAII CR3 switch used by the ELF loader: restores the previous directory
/// unconditionally, including on every error path.
pub struct AddressSpaceSwitch {
    previous: u32,
}

impl AddressSpaceSwitch {
    pub fn enter(dir: PhysicalAddress) -> Self {
        let previous = arch::read_cr3();
        arch::write_cr3(dir.as_u32());
        Self { previous }
    }
}

impl Drop for AddressSpaceSwitch {
    fn drop(&mut self) {
        arch::write_cr3(self.previous);
    }
}

/// Global VMM, installed by the boot path.
pub static VMM: Once<Mutex<Vmm>> = Once::new();

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::phys::SimRam;
    use crate::mm::region::{MemoryRegion, RegionKind, RegionTable};
    use alloc::boxed::Box;

    const RAM_BASE: u32 = 0x10_0000;
    const RAM_SIZE: usize = 32 * 1024 * 1024;
    const KERNEL_END: u32 = 0x20_0000;

    struct Rig {
        pmm: Box<FrameAllocator>,
        ram: SimRam,
        vmm: Vmm,
    }

    fn rig() -> Rig {
        let ram = SimRam::new(RAM_BASE, RAM_SIZE);
        let mut regions = RegionTable::new();
        regions
            .add(MemoryRegion::new(
                RAM_BASE as u64,
                RAM_SIZE as u64,
                RegionKind::Available,
            ))
            .expect("region fits");
        regions.finalize();

        let mut pmm = Box::new(FrameAllocator::new());
        pmm.init(&regions, PhysicalAddress::new(KERNEL_END))
            .expect("pmm init succeeds");

        let vmm = Vmm::init(
            VmmInitParams {
                kernel_start: PhysicalAddress::new(RAM_BASE),
                kernel_end: PhysicalAddress::new(KERNEL_END),
                usable_top: RAM_BASE + RAM_SIZE as u32,
            },
            &mut pmm,
            &ram,
        )
        .expect("vmm init succeeds");

        Rig { pmm, ram, vmm }
    }

    #[test]
    fn kernel_mapped_at_higher_half() {
        let r = rig();
        let dir = r.vmm.kernel_directory();
        // 0xC0100000 -> 0x00100000 (kernel loaded at 1 MiB).
        assert_eq!(
            r.vmm
                .translate(dir, VirtualAddress::new(0xC010_0000), &r.ram),
            Some(PhysicalAddress::new(0x0010_0000))
        );
        // Page offsets survive translation.
        assert_eq!(
            r.vmm
                .translate(dir, VirtualAddress::new(0xC010_0123), &r.ram),
            Some(PhysicalAddress::new(0x0010_0123))
        );
    }

    #[test]
    fn identity_map_covers_low_memory_but_not_page_zero() {
        let r = rig();
        let dir = r.vmm.kernel_directory();
        assert_eq!(
            r.vmm.translate(dir, VirtualAddress::new(0x0040_0000), &r.ram),
            Some(PhysicalAddress::new(0x0040_0000))
        );
        // 64 MiB minimum identity map even with less RAM reported.
        assert!(r.vmm.is_mapped(dir, VirtualAddress::new(IDENTITY_MIN - 0x1000), &r.ram));
        assert_eq!(r.vmm.translate(dir, VirtualAddress::new(0), &r.ram), None);
    }

    #[test]
    fn vga_higher_half_alias() {
        let r = rig();
        let dir = r.vmm.kernel_directory();
        assert_eq!(
            r.vmm
                .translate(dir, VirtualAddress::new(VGA_TEXT_HIGHER_HALF), &r.ram),
            Some(PhysicalAddress::new(0xB8000))
        );
    }

    #[test]
    fn map_unmap_round_trip() {
        let mut r = rig();
        let dir = r.vmm.kernel_directory();
        let frame = r.pmm.alloc_frame().expect("frame available");
        let vaddr = VirtualAddress::new(0x4000_2000);

        r.vmm
            .map_page(dir, vaddr, frame, PageFlags::WRITABLE | PageFlags::USER, &mut r.pmm, &r.ram)
            .expect("mapping a fresh page succeeds");
        assert_eq!(r.vmm.translate(dir, vaddr, &r.ram), Some(frame));

        let old = r.vmm.unmap_page(dir, vaddr, &r.ram).expect("unmap succeeds");
        assert_eq!(old, frame);
        // A subsequent walk returns nothing: the entry is gone.
        assert_eq!(r.vmm.translate(dir, vaddr, &r.ram), None);
    }

    #[test]
    fn double_map_returns_already_mapped_without_mutation() {
        let mut r = rig();
        let dir = r.vmm.kernel_directory();
        let first = r.pmm.alloc_frame().expect("frame available");
        let second = r.pmm.alloc_frame().expect("frame available");
        let vaddr = VirtualAddress::new(0x4800_0000);

        r.vmm
            .map_page(dir, vaddr, first, PageFlags::WRITABLE, &mut r.pmm, &r.ram)
            .expect("first map succeeds");
        assert_eq!(
            r.vmm
                .map_page(dir, vaddr, second, PageFlags::WRITABLE, &mut r.pmm, &r.ram),
            Err(KernelError::AlreadyMapped { vaddr: vaddr.as_u32() })
        );
        // The PTE still points at the first frame.
        assert_eq!(r.vmm.translate(dir, vaddr, &r.ram), Some(first));
    }

    #[test]
    fn misaligned_addresses_are_rejected() {
        let mut r = rig();
        let dir = r.vmm.kernel_directory();
        let frame = r.pmm.alloc_frame().expect("frame available");
        assert!(r
            .vmm
            .map_page(
                dir,
                VirtualAddress::new(0x4000_0001),
                frame,
                PageFlags::WRITABLE,
                &mut r.pmm,
                &r.ram
            )
            .is_err());
        assert!(r
            .vmm
            .map_page(
                dir,
                VirtualAddress::new(0x4000_0000),
                PhysicalAddress::new(frame.as_u32() + 1),
                PageFlags::WRITABLE,
                &mut r.pmm,
                &r.ram
            )
            .is_err());
    }

    #[test]
    fn unmap_of_unmapped_page_is_not_mapped() {
        let mut r = rig();
        let dir = r.vmm.kernel_directory();
        assert_eq!(
            r.vmm.unmap_page(dir, VirtualAddress::new(0x7000_0000), &r.ram),
            Err(KernelError::NotMapped { vaddr: 0x7000_0000 })
        );
    }

    #[test]
    fn cloned_directory_shares_kernel_mappings() {
        let mut r = rig();
        let dir = r
            .vmm
            .create_directory(&mut r.pmm, &r.ram)
            .expect("directory clone succeeds");
        assert_eq!(
            r.vmm.translate(dir, VirtualAddress::new(0xC010_0000), &r.ram),
            Some(PhysicalAddress::new(0x0010_0000))
        );
        r.vmm
            .destroy_directory(dir, &mut r.pmm, &r.ram)
            .expect("destroy succeeds");
    }

    #[test]
    fn destroy_directory_reclaims_user_frames() {
        let mut r = rig();
        let dir = r
            .vmm
            .create_directory(&mut r.pmm, &r.ram)
            .expect("directory clone succeeds");

        let free_before = r.pmm.free_frames_count();
        let frame = r.pmm.alloc_frame().expect("frame available");
        r.vmm
            .map_page(
                dir,
                VirtualAddress::new(0x4000_0000),
                frame,
                PageFlags::WRITABLE | PageFlags::USER,
                &mut r.pmm,
                &r.ram,
            )
            .expect("map succeeds");
        // One user frame plus one private page table are now allocated.
        assert_eq!(r.pmm.free_frames_count(), free_before - 2);

        r.vmm
            .destroy_directory(dir, &mut r.pmm, &r.ram)
            .expect("destroy succeeds");
        // Directory, table, and user frame all came back.
        assert_eq!(r.pmm.free_frames_count(), free_before + 1);
    }

    #[test]
    fn destroying_the_kernel_directory_is_refused() {
        let mut r = rig();
        let kernel_dir = r.vmm.kernel_directory();
        assert!(matches!(
            r.vmm.destroy_directory(kernel_dir, &mut r.pmm, &r.ram),
            Err(KernelError::InvalidState { .. })
        ));
    }

    #[test]
    fn every_mapped_page_backs_onto_a_used_frame() {
        let mut r = rig();
        let dir = r.vmm.kernel_directory();
        let frame = r.pmm.alloc_frame().expect("frame available");
        r.vmm
            .map_page(dir, VirtualAddress::new(0x5000_0000), frame, PageFlags::WRITABLE, &mut r.pmm, &r.ram)
            .expect("map succeeds");
        let paddr = r
            .vmm
            .translate(dir, VirtualAddress::new(0x5000_0000), &r.ram)
            .expect("mapped");
        assert!(r.pmm.is_frame_used(paddr));
    }

    #[test]
    fn address_space_switch_restores_cr3() {
        let before = arch::read_cr3();
        {
            let _switch = AddressSpaceSwitch::enter(PhysicalAddress::new(0x0055_5000));
            assert_eq!(arch::read_cr3(), 0x0055_5000);
        }
        assert_eq!(arch::read_cr3(), before);
    }
}
