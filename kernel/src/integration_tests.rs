//! End-to-end scenarios over simulated hardware
//!
//! Boot-shaped flows that cross subsystem boundaries: Multiboot handoff
//! through PMM/VMM bring-up into a Ready userland task, and the
//! heap-on-VMM growth path.

#![cfg(all(test, not(target_os = "none")))]

use alloc::vec;
use alloc::vec::Vec;

use crate::arch::x86::multiboot::{self, PhysReader, MULTIBOOT1_MAGIC};
use crate::elf::test_support::minimal_image;
use crate::fs::initrd::test_support::build_tar;
use crate::fs::Initrd;
use crate::mm::phys::{PhysAccess, SimRam};
use crate::mm::region::{MemoryRegion, RegionKind, RegionTable};
use crate::mm::vmm::{Vmm, VmmInitParams};
use crate::mm::{FrameAllocator, PhysicalAddress, VirtualAddress, PAGE_SIZE};
use crate::sched::{task_create_elf, Scheduler, TaskState};

struct BufReader(Vec<u8>);

impl PhysReader for BufReader {
    fn ptr(&self, paddr: u32) -> *const u8 {
        &self.0[paddr as usize] as *const u8
    }
}

fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

/// Multiboot1 image advertising one Available region [1 MiB, 32 MiB) and
/// one module (`initrd`) planted at `module_at`.
fn boot_image(initrd: &[u8], module_at: usize) -> BufReader {
    let mut buf = vec![0u8; module_at + initrd.len() + 64];
    // Info at 0x100: MMAP | MODS.
    put_u32(&mut buf, 0x100, (1 << 6) | (1 << 3));
    put_u32(&mut buf, 0x100 + 20, 1);
    put_u32(&mut buf, 0x100 + 24, 0x300);
    put_u32(&mut buf, 0x100 + 44, 24);
    put_u32(&mut buf, 0x100 + 48, 0x200);

    // One e820 entry: available [0x100000, 0x2000000).
    put_u32(&mut buf, 0x200, 20);
    put_u64(&mut buf, 0x204, 0x10_0000);
    put_u64(&mut buf, 0x20C, 0x1F0_0000);
    put_u32(&mut buf, 0x214, 1);

    // Module record.
    put_u32(&mut buf, 0x300, module_at as u32);
    put_u32(&mut buf, 0x304, (module_at + initrd.len()) as u32);

    buf[module_at..module_at + initrd.len()].copy_from_slice(initrd);
    BufReader(buf)
}

#[test]
fn boot_to_ready_userland_task() {
    const KERNEL_START: u32 = 0x10_0000;
    const KERNEL_END: u32 = 0x20_0000;

    // Firmware handoff: memory map + initrd module carrying the shell.
    let shell = minimal_image(0x0804_8000, &[0x90u8; 64]);
    let tar = build_tar(&[("bin/shell.elf", &shell)]);
    let module_at = 0x80_0000;
    let reader = boot_image(&tar, module_at);
    let boot = unsafe { multiboot::parse(&reader, MULTIBOOT1_MAGIC, 0x100) }
        .expect("multiboot1 handoff parses");

    // Region table: firmware map, then kernel image, then the module.
    let mut regions = RegionTable::new();
    for raw in boot.regions() {
        regions
            .add(MemoryRegion::new(raw.base, raw.len, raw.kind))
            .expect("region fits");
    }
    regions
        .add(MemoryRegion::new(
            KERNEL_START as u64,
            (KERNEL_END - KERNEL_START) as u64,
            RegionKind::Kernel,
        ))
        .expect("kernel region fits");
    let (mod_start, mod_end) = boot.initrd.expect("module reported");
    regions
        .add(MemoryRegion::new(
            mod_start as u64,
            (mod_end - mod_start) as u64,
            RegionKind::Initrd,
        ))
        .expect("initrd region fits");
    regions.finalize();

    // PMM over the sanitized map: 32 MiB => 8192 frames, the kernel and
    // initrd frames not free.
    let mut pmm = alloc::boxed::Box::new(FrameAllocator::new());
    pmm.init(&regions, PhysicalAddress::new(KERNEL_END))
        .expect("pmm init");
    let stats = pmm.stats();
    assert_eq!(stats.total_frames, 8192);
    let initrd_frames = (mod_end - mod_start).div_ceil(PAGE_SIZE as u32);
    assert_eq!(stats.free_frames, 8192 - 512 - initrd_frames);

    // VMM bring-up over simulated RAM.
    let ram = SimRam::new(KERNEL_START, 32 * 1024 * 1024);
    let mut vmm = Vmm::init(
        VmmInitParams {
            kernel_start: PhysicalAddress::new(KERNEL_START),
            kernel_end: PhysicalAddress::new(KERNEL_END),
            usable_top: 0x200_0000,
        },
        &mut pmm,
        &ram,
    )
    .expect("vmm init");

    // Kernel mapped at the higher half; first 64 MiB identity mapped.
    let kernel_dir = vmm.kernel_directory();
    assert_eq!(
        vmm.translate(kernel_dir, VirtualAddress::new(0xC010_0000), &ram),
        Some(PhysicalAddress::new(0x0010_0000))
    );
    assert!(vmm.is_mapped(kernel_dir, VirtualAddress::new(0x03FF_F000), &ram));

    // The shell comes out of the archive and becomes a Ready task.
    let initrd = Initrd::new(&tar);
    let image = initrd.find("/bin/shell.elf").expect("shell in initrd");
    let task = task_create_elf("shell", image, &mut vmm, &mut pmm, &ram, 0)
        .expect("shell task builds");

    let mut sched = Scheduler::new();
    let idle = sched.spawn(crate::sched::Task::new("idle", kernel_dir));
    let shell_id = sched.spawn(task);
    assert_eq!(
        sched.task(shell_id).expect("shell in arena").state,
        TaskState::Ready
    );

    // First yield hands the CPU to the shell.
    let plan = sched.schedule().expect("shell is runnable");
    assert_eq!(plan.next, shell_id);
    assert_ne!(plan.next_cr3, 0);
    let _ = idle;
}

#[test]
fn kernel_heap_grows_through_the_vmm() {
    use crate::mm::heap::{HeapBacking, KernelHeap};
    use crate::mm::PageFlags;

    // A backing that maps pages exactly the way the kernel wiring does,
    // but against local PMM/VMM instances.
    struct TestVmmBacking {
        pmm: alloc::boxed::Box<FrameAllocator>,
        vmm: Vmm,
        ram: SimRam,
        dir: PhysicalAddress,
    }

    impl HeapBacking for TestVmmBacking {
        fn map_pages(
            &mut self,
            vaddr: VirtualAddress,
            count: usize,
        ) -> Result<*mut u8, crate::error::KernelError> {
            // Frames must be virtually contiguous for the heap, which the
            // simulated RAM cannot give us for scattered frames; back each
            // request with one contiguous physical run instead.
            let base = self.pmm.alloc_frames(count)?;
            for i in 0..count {
                self.vmm.map_page(
                    self.dir,
                    vaddr.offset((i * PAGE_SIZE) as u32),
                    base.offset((i * PAGE_SIZE) as u32),
                    PageFlags::WRITABLE,
                    &mut self.pmm,
                    &self.ram,
                )?;
            }
            Ok(self.ram.frame_ptr(base))
        }
    }

    let ram = SimRam::new(0x10_0000, 32 * 1024 * 1024);
    let mut regions = RegionTable::new();
    regions
        .add(MemoryRegion::new(0x10_0000, 32 * 1024 * 1024, RegionKind::Available))
        .expect("region fits");
    regions.finalize();
    let mut pmm = alloc::boxed::Box::new(FrameAllocator::new());
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
    let dir = vmm.kernel_directory();

    let backing = TestVmmBacking {
        pmm,
        vmm,
        ram,
        dir,
    };
    let mut heap = KernelHeap::init(backing, VirtualAddress::new(0xD000_0000), 64 * 1024)
        .expect("heap init over vmm backing");

    // kmalloc -> heap block search -> heap expand -> VMM map -> PMM frame,
    // end to end.
    let a = heap.kmalloc(300);
    assert!(!a.is_null());
    let big = heap.kmalloc(128 * 1024);
    assert!(!big.is_null(), "growth path allocates");
    assert!(heap.stats().expand_count >= 2);

    // The heap's pages really are mapped in the directory.
    assert!(heap.regions_used() >= 1);
    heap.kfree(a).expect("free");
    heap.kfree(big).expect("free");
    heap.validate().expect("heap intact after vmm-backed growth");
}
