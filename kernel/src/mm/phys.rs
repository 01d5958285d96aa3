//! Physical frame access
//!
//! Once paging is live the kernel cannot dereference an arbitrary physical
//! address, so every page-table edit and frame fill goes through the
//! [`PhysAccess`] seam. The bare-metal implementation uses the identity
//! mapping for low frames and the Temporary-Mapping Window above it; tests
//! use [`SimRam`], a buffer pretending to be the machine's RAM.

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
use core::cell::UnsafeCell;

use super::{PhysicalAddress, PAGE_SIZE};

/// Virtual base of the 4 MiB Temporary-Mapping Window (one page-directory
/// slot at 256 MiB). Its page table is installed before paging is enabled.
pub const TEMP_WINDOW_BASE: u32 = 0x1000_0000;
/// Number of window slots (one page table's worth).
pub const TEMP_WINDOW_PAGES: u32 = 1024;

/// Maps an owned physical frame to a pointer the kernel can dereference.
pub trait PhysAccess {
    /// Return a pointer through which the 4 KiB frame at `paddr` may be
    /// read and written. `paddr` must be page-aligned and refer to a frame
    /// the caller owns; the pointer is only valid until the next
    /// `frame_ptr` call on the same accessor (window slots rotate).
    fn frame_ptr(&self, paddr: PhysicalAddress) -> *mut u8;
}

/// Zero a whole frame through the accessor.
pub fn zero_frame(phys: &dyn PhysAccess, paddr: PhysicalAddress) {
    let ptr = phys.frame_ptr(paddr);
    unsafe { core::ptr::write_bytes(ptr, 0, PAGE_SIZE) };
}

// ---------------------------------------------------------------------------
// Bare-metal accessor
// ---------------------------------------------------------------------------

/// Kernel accessor: identity mapping below the identity limit, round-robin
/// Temporary-Mapping Window slots above it.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod kernel {
    use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::{PhysAccess, PhysicalAddress, TEMP_WINDOW_BASE, TEMP_WINDOW_PAGES};
    use crate::arch;
    use crate::mm::page_table::PageTable;
    use crate::mm::PageFlags;

    pub struct KernelPhys {
        /// Top of the identity-mapped range (frames below this are reached
        /// directly).
        identity_limit: AtomicU32,
        /// Physical frame of the window's page table. Always below the
        /// identity limit, so editing it never recurses into the window.
        window_table: AtomicU32,
        /// Round-robin slot cursor.
        next_slot: AtomicU32,
        paging: AtomicBool,
    }

    impl KernelPhys {
        pub const fn new() -> Self {
            Self {
                identity_limit: AtomicU32::new(0),
                window_table: AtomicU32::new(0),
                next_slot: AtomicU32::new(0),
                paging: AtomicBool::new(false),
            }
        }

        /// Wire up the window; called once from `vmm::init`.
        pub fn configure(&self, identity_limit: u32, window_table: PhysicalAddress) {
            self.identity_limit.store(identity_limit, Ordering::SeqCst);
            self.window_table
                .store(window_table.as_u32(), Ordering::SeqCst);
        }

        /// Flip to windowed mode; called right after paging is enabled.
        pub fn paging_enabled(&self) {
            self.paging.store(true, Ordering::SeqCst);
        }

        fn temp_map(&self, paddr: PhysicalAddress) -> *mut u8 {
            let slot = self.next_slot.fetch_add(1, Ordering::SeqCst) % TEMP_WINDOW_PAGES;
            let table = self.window_table.load(Ordering::SeqCst) as *mut PageTable;
            // SAFETY: the window table frame is identity-mapped and owned
            // exclusively by this accessor.
            unsafe {
                (*table)[slot as usize].set(paddr, PageFlags::WRITABLE);
            }
            let vaddr = TEMP_WINDOW_BASE + slot * super::PAGE_SIZE as u32;
            arch::invlpg(vaddr);
            core::sync::atomic::compiler_fence(Ordering::SeqCst);
            vaddr as *mut u8
        }
    }

    impl PhysAccess for KernelPhys {
        fn frame_ptr(&self, paddr: PhysicalAddress) -> *mut u8 {
            let identity = self.identity_limit.load(Ordering::SeqCst);
            if !self.paging.load(Ordering::SeqCst) || paddr.as_u32() < identity {
                paddr.as_u32() as *mut u8
            } else {
                self.temp_map(paddr)
            }
        }
    }

    /// The one kernel accessor instance.
    pub static KERNEL_PHYS: KernelPhys = KernelPhys::new();
}

// ---------------------------------------------------------------------------
// Simulated RAM (host builds)
// ---------------------------------------------------------------------------

/// One simulated frame, kept page-aligned so frame pointers look real.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[repr(C, align(4096))]
struct SimFrame([u8; PAGE_SIZE]);

/// A slab of fake physical memory starting at a configurable base address.
///
/// All VMM/PMM/heap algorithms run against this in host tests exactly as
/// they would against real RAM.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub struct SimRam {
    base: u32,
    frames: alloc::boxed::Box<[UnsafeCell<SimFrame>]>,
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
impl SimRam {
    /// `size` bytes of simulated RAM with physical addresses starting at
    /// `base` (both page-aligned).
    pub fn new(base: u32, size: usize) -> Self {
        assert_eq!(base as usize % PAGE_SIZE, 0, "sim RAM base must be aligned");
        let count = size / PAGE_SIZE;
        let mut frames = alloc::vec::Vec::with_capacity(count);
        for _ in 0..count {
            frames.push(UnsafeCell::new(SimFrame([0; PAGE_SIZE])));
        }
        Self {
            base,
            frames: frames.into_boxed_slice(),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.frames.len() * PAGE_SIZE
    }

    pub fn contains(&self, paddr: PhysicalAddress) -> bool {
        let a = paddr.as_u32() as usize;
        a >= self.base as usize && a < self.base as usize + self.size()
    }

    /// Read a byte of simulated RAM (test assertions).
    pub fn read_byte(&self, paddr: PhysicalAddress) -> u8 {
        let frame = PhysicalAddress::new(paddr.as_u32() & !(PAGE_SIZE as u32 - 1));
        let offset = paddr.as_u32() as usize % PAGE_SIZE;
        unsafe { *self.frame_ptr(frame).add(offset) }
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
impl PhysAccess for SimRam {
    fn frame_ptr(&self, paddr: PhysicalAddress) -> *mut u8 {
        assert!(paddr.is_page_aligned(), "frame_ptr wants aligned frames");
        assert!(self.contains(paddr), "frame {:#x} outside sim RAM", paddr.as_u32());
        let index = (paddr.as_u32() - self.base) as usize / PAGE_SIZE;
        self.frames[index].get() as *mut u8
    }
}
