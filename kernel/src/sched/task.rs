//! Task control block
//!
//! One TCB per task: state, owned kernel stack with the saved ESP, the
//! page directory, the address space, the ELF load report, and the ready
//! ring link. Ring links are arena indices ([`TaskId`]), not pointers.

use alloc::boxed::Box;
use alloc::string::String;

use crate::arch::x86::idt::{USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use crate::elf::{self, LoadReport};
use crate::error::KernelResult;
use crate::fs::FileTable;
use crate::mm::page_fault::FaultTracker;
use crate::mm::phys::{zero_frame, PhysAccess};
use crate::mm::vas::{
    AddressSpace, Area, AreaKind, Protection, USER_STACK_PAGES, USER_STACK_TOP,
};
use crate::mm::vmm::Vmm;
use crate::mm::{FrameAllocator, PageFlags, PhysicalAddress, VirtualAddress, PAGE_SIZE};

/// Arena index identifying a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u32);

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Ready,
    Waiting,
    Terminated,
}

/// Kernel stack size per task (16 KiB).
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Owned, aligned kernel stack storage.
#[repr(C, align(16))]
pub struct KernelStack(pub [u8; KERNEL_STACK_SIZE]);

impl KernelStack {
    pub fn new() -> Box<Self> {
        Box::new(KernelStack([0; KERNEL_STACK_SIZE]))
    }
}

/// EFLAGS for ring-3 entry: IF plus the always-one bit.
pub const USER_EFLAGS: u32 = 0x0000_0202;
/// EFLAGS restored inside the context switch (interrupts still off until
/// `iret` installs the user flags).
const SWITCH_EFLAGS: u32 = 0x0000_0002;

/// Default scheduling priority.
pub const DEFAULT_PRIORITY: u8 = 16;
/// Cooperative time-slice accounting (decremented by the timer tick IRQ).
pub const DEFAULT_TICKS: u32 = 10;

/// Task control block.
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    /// Saved kernel ESP; the context switch stores/loads through this.
    pub kernel_esp: usize,
    pub kernel_stack: Option<Box<KernelStack>>,
    pub page_directory: PhysicalAddress,
    pub address_space: Option<AddressSpace>,
    pub elf: Option<LoadReport>,
    pub fault_tracker: FaultTracker,
    pub files: FileTable,
    pub priority: u8,
    pub ticks_left: u32,
    pub pending_signals: u32,
    pub exit_code: Option<i32>,
    /// Next task in the ready ring.
    pub next: Option<TaskId>,
}

impl Task {
    /// Bare TCB; the scheduler assigns the id on spawn.
    pub fn new(name: &str, page_directory: PhysicalAddress) -> Self {
        Self {
            id: TaskId(u32::MAX),
            name: String::from(name),
            state: TaskState::Ready,
            kernel_esp: 0,
            kernel_stack: None,
            page_directory,
            address_space: None,
            elf: None,
            fault_tracker: FaultTracker::new(),
            files: FileTable::new(),
            priority: DEFAULT_PRIORITY,
            ticks_left: DEFAULT_TICKS,
            pending_signals: 0,
            exit_code: None,
            next: None,
        }
    }
}

/// Format the initial kernel stack so the first context switch into this
/// task `iret`s straight into ring 3.
///
/// The switch path pops the general registers and flags, then `ret`s into
/// `trampoline` (which loads the user data segments and executes `iretd`
/// against the five-word frame laid down here). Returns the byte offset
/// the saved ESP must start at.
pub fn build_user_entry_stack(
    stack: &mut [u8; KERNEL_STACK_SIZE],
    entry: u32,
    user_esp: u32,
    trampoline: u32,
) -> usize {
    let words: [u32; 15] = [
        // popa block (edi, esi, ebp, esp placeholder, ebx, edx, ecx, eax)
        0,
        0,
        0,
        0,
        0,
        0,
        0,
        0,
        SWITCH_EFLAGS,
        trampoline,
        // iret frame, lowest address first: eip, cs, eflags, esp, ss
        entry,
        USER_CODE_SELECTOR as u32,
        USER_EFLAGS,
        user_esp,
        USER_DATA_SELECTOR as u32,
    ];

    let offset = KERNEL_STACK_SIZE - words.len() * 4;
    for (i, word) in words.iter().enumerate() {
        let at = offset + i * 4;
        stack[at..at + 4].copy_from_slice(&word.to_le_bytes());
    }
    offset
}

/// Create a user task from an ELF image: fresh address space, mapped user
/// stack with a guard page beneath it, and a kernel stack formatted to
/// enter ring 3 at the image's entry point.
pub fn task_create_elf(
    name: &str,
    image: &[u8],
    vmm: &mut Vmm,
    pmm: &mut FrameAllocator,
    phys: &dyn PhysAccess,
    trampoline: u32,
) -> KernelResult<Task> {
    let (dir, report) = elf::load(image, vmm, pmm, phys)?;
    let mut space = AddressSpace::new(dir);

    match setup_user_space(&mut space, &report, vmm, pmm, phys) {
        Ok(()) => {}
        Err(e) => {
            let _ = space.destroy(vmm, pmm, phys);
            return Err(e);
        }
    }

    let mut stack = KernelStack::new();
    let esp_offset = build_user_entry_stack(&mut stack.0, report.entry, USER_STACK_TOP, trampoline);
    let kernel_esp = stack.0.as_ptr() as usize + esp_offset;

    let mut task = Task::new(name, dir);
    task.kernel_esp = kernel_esp;
    task.kernel_stack = Some(stack);
    task.address_space = Some(space);
    task.elf = Some(report);
    Ok(task)
}

fn setup_user_space(
    space: &mut AddressSpace,
    report: &LoadReport,
    vmm: &mut Vmm,
    pmm: &mut FrameAllocator,
    phys: &dyn PhysAccess,
) -> KernelResult<()> {
    // The loaded image, as one area.
    space.insert_area(Area::new(
        VirtualAddress::new(report.mapped.start),
        VirtualAddress::new(report.mapped.end),
        Protection::ReadWriteExecute,
        AreaKind::File,
    ))?;

    // User stack pages, writable, directly below USER_STACK_TOP.
    let stack_base = USER_STACK_TOP - (USER_STACK_PAGES * PAGE_SIZE) as u32;
    for i in 0..USER_STACK_PAGES {
        let vaddr = VirtualAddress::new(stack_base + (i * PAGE_SIZE) as u32);
        let frame = pmm.alloc_frame()?;
        zero_frame(phys, frame);
        vmm.map_page(
            space.directory(),
            vaddr,
            frame,
            PageFlags::USER | PageFlags::WRITABLE,
            pmm,
            phys,
        )?;
    }
    space.insert_area(Area::new(
        VirtualAddress::new(stack_base),
        VirtualAddress::new(USER_STACK_TOP),
        Protection::ReadWrite,
        AreaKind::Stack,
    ))?;

    // Guard page below the stack catches overruns.
    space.create_guard(
        VirtualAddress::new(stack_base - PAGE_SIZE as u32),
        1,
        vmm,
        pmm,
        phys,
    )
}

// ---------------------------------------------------------------------------
// Context switch (bare metal)
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86", target_os = "none"))]
core::arch::global_asm!(
    r#"
.section .text
.global switch_context
// switch_context(prev_esp: *mut u32, next_esp: u32, next_cr3: u32)
switch_context:
    mov eax, [esp + 4]
    mov edx, [esp + 8]
    mov ecx, [esp + 12]
    pushfd
    pusha
    mov [eax], esp
    mov cr3, ecx
    mov esp, edx
    popa
    popfd
    ret

.global user_entry_trampoline
user_entry_trampoline:
    mov ax, 0x23
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    iretd
"#
);

#[cfg(all(target_arch = "x86", target_os = "none"))]
extern "C" {
    pub fn switch_context(prev_esp: *mut u32, next_esp: u32, next_cr3: u32);
    pub fn user_entry_trampoline();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::phys::SimRam;
    use crate::mm::region::{MemoryRegion, RegionKind, RegionTable};
    use crate::mm::vmm::VmmInitParams;
    use alloc::vec;

    fn read_word(stack: &[u8; KERNEL_STACK_SIZE], offset: usize, index: usize) -> u32 {
        let at = offset + index * 4;
        u32::from_le_bytes(stack[at..at + 4].try_into().expect("4 bytes"))
    }

    #[test]
    fn user_entry_stack_layout() {
        let mut stack = KernelStack::new();
        let offset = build_user_entry_stack(&mut stack.0, 0x0804_8010, USER_STACK_TOP, 0xC011_2233);

        // 8 GP registers + eflags + return address + 5-word iret frame.
        assert_eq!(offset, KERNEL_STACK_SIZE - 15 * 4);
        assert_eq!(read_word(&stack.0, offset, 9), 0xC011_2233); // trampoline
        assert_eq!(read_word(&stack.0, offset, 10), 0x0804_8010); // eip
        assert_eq!(read_word(&stack.0, offset, 11), USER_CODE_SELECTOR as u32);
        assert_eq!(read_word(&stack.0, offset, 12), USER_EFLAGS);
        assert_eq!(read_word(&stack.0, offset, 13), USER_STACK_TOP);
        assert_eq!(read_word(&stack.0, offset, 14), USER_DATA_SELECTOR as u32);
        // IF must be set for userland.
        assert_ne!(read_word(&stack.0, offset, 12) & 0x200, 0);
    }

    #[test]
    fn task_create_elf_builds_a_ready_task() {
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

        let image = crate::elf::test_support::minimal_image(0x0804_8000, &vec![0x90u8; 32]);
        let task = task_create_elf("shell", &image, &mut vmm, &mut pmm, &ram, 0)
            .expect("task creation succeeds");

        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(task.name, "shell");
        assert!(task.kernel_stack.is_some());
        assert_ne!(task.kernel_esp, 0);

        let space = task.address_space.as_ref().expect("address space");
        // Stack pages mapped and writable by user code.
        let stack_base = USER_STACK_TOP - (USER_STACK_PAGES * PAGE_SIZE) as u32;
        assert!(vmm.is_mapped(space.directory(), VirtualAddress::new(stack_base), &ram));
        assert!(vmm.is_mapped(
            space.directory(),
            VirtualAddress::new(USER_STACK_TOP - PAGE_SIZE as u32),
            &ram
        ));
        // Guard page below the stack is not mapped but is tracked.
        let guard = VirtualAddress::new(stack_base - PAGE_SIZE as u32);
        assert!(!vmm.is_mapped(space.directory(), guard, &ram));
        assert_eq!(
            space.find_area(guard).expect("guard area").protection,
            Protection::Guard
        );
    }
}
