//! EmberOS Kernel Library
//!
//! Memory-management and execution core for a 32-bit x86 monolithic kernel:
//! physical frame allocator, two-level page-table engine, kernel heap,
//! trap/syscall substrate, cooperative tasks with an ELF32 loader, and the
//! corruption defenses that tie them together.
//!
//! The library builds for bare metal (`target_os = "none"`) and for the host,
//! where the hardware layer is mirrored into plain statics so the full test
//! suite runs under the standard harness.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host target: use the system allocator so unit tests can allocate normally.
// On bare metal the kernel heap itself backs `alloc` (see mm::heap).
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[global_allocator]
static KERNEL_ALLOCATOR: mm::heap::KernelAllocator = mm::heap::KernelAllocator;

#[macro_use]
pub mod print;

pub mod arch;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod fs;
pub mod klog;
pub mod mm;
pub mod sched;
pub mod security;
pub mod sync;
pub mod syscall;
pub mod trap;

#[cfg(test)]
mod integration_tests;

// Re-export memory management for tests
pub use mm::{FrameNumber, PhysicalAddress, VirtualAddress, FRAME_SIZE, PAGE_SIZE};
// Re-export scheduler items for tests
pub use sched::{Task, TaskId, TaskState};

/// Heap allocation error handler.
///
/// Panic is intentional: heap allocation failure in a no_std kernel is
/// unrecoverable. The alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("Allocation error: {:?}", layout);
}
