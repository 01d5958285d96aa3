//! EmberOS kernel binary
//!
//! Multiboot entry, the boot init sequence (memory map -> PMM -> VMM ->
//! paging -> heap -> IDT -> defenses -> first task), and the panic
//! handler. The library crate holds everything else.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod boot {
    use core::fmt::Write;

    use ember_kernel::arch::x86::multiboot::{self, IdentityReader};
    use ember_kernel::arch::x86::{idt, vga};
    use ember_kernel::drivers::console::CONSOLE;
    use ember_kernel::fs::initrd::{Initrd, INITRD};
    use ember_kernel::mm::heap::init_kernel_heap;
    use ember_kernel::mm::phys::kernel::KERNEL_PHYS;
    use ember_kernel::mm::region::{MemoryRegion, RegionKind, RegionTable};
    use ember_kernel::mm::vmm::{Vmm, VmmInitParams, VMM};
    use ember_kernel::mm::{PhysicalAddress, FRAME_ALLOCATOR, PAGE_SIZE};
    use ember_kernel::sched::{self, task_create_elf, Task, SCHEDULER};
    use ember_kernel::{klog, println, security};

    /// First userland binary.
    const SHELL_PATH: &str = "/bin/shell.elf";
    /// Initial kernel heap mapping (grows on demand).
    const INITIAL_HEAP: usize = 1024 * 1024;

    // Multiboot1 header and the entry stub. GRUB hands over with EAX =
    // magic and EBX = info pointer; paging and interrupts are off.
    core::arch::global_asm!(
        r#"
    .section .multiboot_header, "aw"
    .align 4
        .long 0x1BADB002
        .long 0x00000003                    // ALIGN | MEMINFO
        .long -(0x1BADB002 + 0x00000003)

    .section .bss
    .align 16
    boot_stack_bottom:
        .skip 65536
    boot_stack_top:

    .section .text
    .global _start
    _start:
        mov esp, offset boot_stack_top
        push ebx
        push eax
        call kernel_main
    1:
        cli
        hlt
        jmp 1b
    "#
    );

    extern "C" {
        static __kernel_start: u8;
        static __kernel_end: u8;
    }

    fn kernel_image() -> (PhysicalAddress, PhysicalAddress) {
        // SAFETY: linker-provided symbols delimiting the loaded image.
        unsafe {
            (
                PhysicalAddress::new(core::ptr::addr_of!(__kernel_start) as u32),
                PhysicalAddress::new(core::ptr::addr_of!(__kernel_end) as u32),
            )
        }
    }

    #[no_mangle]
    pub extern "C" fn kernel_main(magic: u32, info: u32) -> ! {
        CONSOLE.clear();
        klog::init(log::LevelFilter::Info);
        println!("EmberOS {} booting", env!("CARGO_PKG_VERSION"));

        // Boot information: memory map first, then the initrd module.
        let boot = match unsafe { multiboot::parse(&IdentityReader, magic, info) } {
            Ok(boot) => boot,
            Err(e) => die("boot handoff", e),
        };
        if !boot.cmdline().is_empty() {
            log::info!(target: "boot", "cmdline: {}", boot.cmdline());
        }

        let (kernel_start, kernel_end) = kernel_image();

        // Sanitized region table: firmware map + kernel + initrd.
        let mut regions = RegionTable::new();
        for raw in boot.regions() {
            if let Err(e) = regions.add(MemoryRegion::new(raw.base, raw.len, raw.kind)) {
                die("memory map", e);
            }
        }
        let kernel_region = MemoryRegion::new(
            kernel_start.as_u32() as u64,
            (kernel_end.as_u32() - kernel_start.as_u32()) as u64,
            RegionKind::Kernel,
        );
        if let Err(e) = regions.add(kernel_region) {
            die("memory map", e);
        }
        if let Some((mod_start, mod_end)) = boot.initrd {
            let initrd_region =
                MemoryRegion::new(mod_start as u64, (mod_end - mod_start) as u64, RegionKind::Initrd);
            if let Err(e) = regions.add(initrd_region) {
                die("memory map", e);
            }
        }
        regions.finalize();
        let usable_top = regions.highest_available().min(u32::MAX as u64) as u32;

        // Physical frame allocator.
        {
            let mut pmm = FRAME_ALLOCATOR.lock();
            if let Err(e) = pmm.init(&regions, kernel_end) {
                die("pmm init", e);
            }
        }

        // Virtual memory: identity + higher half + temp window, then
        // paging on.
        {
            let mut pmm = FRAME_ALLOCATOR.lock();
            let vmm = match Vmm::init(
                VmmInitParams {
                    kernel_start,
                    kernel_end,
                    usable_top,
                },
                &mut pmm,
                &KERNEL_PHYS,
            ) {
                Ok(vmm) => vmm,
                Err(e) => die("vmm init", e),
            };
            KERNEL_PHYS.configure(vmm.identity_limit(), vmm.window_table());
            VMM.call_once(|| spin::Mutex::new(vmm));
        }
        VMM.get().expect("vmm just installed").lock().enable_paging();
        vga::use_higher_half();
        log::info!(target: "boot", "paging enabled");

        // Kernel heap over the fresh mappings; `alloc` works from here on.
        if let Err(e) = init_kernel_heap(INITIAL_HEAP) {
            die("heap init", e);
        }

        // Trap substrate and defenses.
        idt::init();
        security::init();

        // Initrd archive.
        if let Some((mod_start, mod_end)) = boot.initrd {
            // SAFETY: the module range is reserved in the region table and
            // identity-mapped; it is never written again.
            let data = unsafe {
                core::slice::from_raw_parts(
                    mod_start as usize as *const u8,
                    (mod_end - mod_start) as usize,
                )
            };
            let initrd = INITRD.call_once(|| Initrd::new(data));
            log::info!(target: "boot", "initrd: {} files", initrd.file_count());
        } else {
            log::warn!(target: "boot", "no initrd module");
        }

        // The boot context becomes the idle task; the shell is spawned
        // Ready and takes over at the first yield.
        {
            let kernel_dir = VMM.get().expect("vmm").lock().kernel_directory();
            SCHEDULER.lock().spawn(Task::new("idle", kernel_dir));
        }
        spawn_shell();

        ember_kernel::arch::enable_interrupts();
        log::info!(target: "boot", "entering userland");
        loop {
            sched::yield_cpu();
            ember_kernel::arch::halt();
        }
    }

    fn spawn_shell() {
        let image = match INITRD.get().and_then(|initrd| initrd.find(SHELL_PATH)) {
            Some(image) => image,
            None => {
                log::warn!(target: "boot", "{} not found; idling", SHELL_PATH);
                return;
            }
        };

        let vmm = VMM.get().expect("vmm initialized before tasks");
        let mut vmm = vmm.lock();
        let mut pmm = FRAME_ALLOCATOR.lock();
        let trampoline = ember_kernel::sched::task::user_entry_trampoline as usize as u32;
        match task_create_elf("shell", image, &mut vmm, &mut pmm, &KERNEL_PHYS, trampoline) {
            Ok(task) => {
                let id = SCHEDULER.lock().spawn(task);
                log::info!(target: "boot", "shell task {} ready", id.0);
            }
            Err(e) => log::warn!(target: "boot", "shell load failed: {}", e),
        }
    }

    fn die(stage: &str, err: ember_kernel::error::KernelError) -> ! {
        ember_kernel::arch::disable_interrupts();
        let mut buf = vga::TextBuffer::new();
        let mut line = FixedLine::new();
        let _ = write!(line, "{}: {}", stage, err);
        vga::panic_screen(&mut buf, err.category(), line.as_str(), None);
        loop {
            ember_kernel::arch::halt();
        }
    }

    /// Small fixed formatting buffer for panic paths (no allocation).
    struct FixedLine {
        buf: [u8; 120],
        len: usize,
    }

    impl FixedLine {
        fn new() -> Self {
            Self {
                buf: [0; 120],
                len: 0,
            }
        }

        fn as_str(&self) -> &str {
            core::str::from_utf8(&self.buf[..self.len]).unwrap_or("?")
        }
    }

    impl Write for FixedLine {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            for &byte in s.as_bytes() {
                if self.len < self.buf.len() {
                    self.buf[self.len] = byte;
                    self.len += 1;
                }
            }
            Ok(())
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        ember_kernel::arch::disable_interrupts();
        let mut buf = vga::TextBuffer::new();
        let mut line = FixedLine::new();
        let _ = write!(line, "{}", info.message());
        let esp: u32;
        // SAFETY: reading ESP has no side effects.
        unsafe { core::arch::asm!("mov {}, esp", out(reg) esp, options(nomem, nostack)) };
        vga::panic_screen(
            &mut buf,
            "KERNEL PANIC",
            line.as_str(),
            Some(&vga::PanicRegs {
                cr2: Some(ember_kernel::arch::read_cr2()),
                error_code: None,
                esp,
                eip: 0,
            }),
        );
        loop {
            ember_kernel::arch::halt();
        }
    }

    // The page size constant participates in the linker script contract.
    const _: () = assert!(PAGE_SIZE == 4096);
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel binary only means something on bare metal; the library
    // (and its test suite) is the host-facing surface.
}
