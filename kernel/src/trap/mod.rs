//! Trap dispatch
//!
//! All 256 vectors converge on one saved-frame layout (see the stubs in
//! `arch::x86::idt`). Faults 0-31 dispatch to per-vector policy, vector 14
//! runs the page-fault recovery in `mm::page_fault`, vectors 32-47 are PIC
//! IRQs forwarded to registered handlers (default: EOI and move on), and
//! vector 0x80 is the syscall gate.
//!
//! A process-wide depth counter guards against fault recursion: past depth
//! [`MAX_FAULT_DEPTH`] the kernel switches to a preallocated emergency
//! stack, prints straight to VGA, and halts.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::sync::SpinLock;

/// The user-invokable syscall vector.
pub const SYSCALL_VECTOR: usize = 0x80;
/// First PIC vector after remapping.
pub const IRQ_BASE: u8 = 32;
/// Number of PIC lines.
pub const IRQ_COUNT: usize = 16;
/// Beyond this many nested faults the kernel stops trusting its stacks.
pub const MAX_FAULT_DEPTH: u32 = 5;

/// Register file the stubs push before calling into Rust, lowest address
/// first: `pusha` block, DS, vector, error code, then the CPU frame.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct InterruptFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_kernel: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub ds: u32,
    pub int_no: u32,
    pub err_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    /// Only valid when the trap came from ring 3.
    pub user_esp: u32,
    pub user_ss: u32,
}

impl InterruptFrame {
    /// A zeroed frame for a given vector (used by tests and the boot
    /// path's synthetic dispatches).
    pub const fn for_vector(int_no: u32) -> Self {
        Self {
            edi: 0,
            esi: 0,
            ebp: 0,
            esp_kernel: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            ds: 0,
            int_no,
            err_code: 0,
            eip: 0,
            cs: 0,
            eflags: 0,
            user_esp: 0,
            user_ss: 0,
        }
    }

    pub fn from_user_mode(&self) -> bool {
        self.cs & 3 == 3
    }
}

/// Intel-defined exception mnemonics for vectors 0-31.
pub const EXCEPTION_NAMES: [&str; 32] = [
    "Divide Error",
    "Debug",
    "NMI",
    "Breakpoint",
    "Overflow",
    "BOUND Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack-Segment Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "x87 FPU Error",
    "Alignment Check",
    "Machine Check",
    "SIMD Exception",
    "Virtualization Exception",
    "Control Protection",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Hypervisor Injection",
    "VMM Communication",
    "Security Exception",
    "Reserved",
];

/// Coarse classification of an incoming vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// CPU exception other than a page fault.
    Exception(u8),
    PageFault,
    /// Remapped PIC line (0-15).
    Irq(u8),
    Syscall,
    /// Vector nothing should ever raise.
    Spurious,
}

pub fn classify(int_no: u32) -> TrapKind {
    match int_no {
        14 => TrapKind::PageFault,
        0..=31 => TrapKind::Exception(int_no as u8),
        n if (IRQ_BASE as u32..IRQ_BASE as u32 + IRQ_COUNT as u32).contains(&n) => {
            TrapKind::Irq((n - IRQ_BASE as u32) as u8)
        }
        n if n as usize == SYSCALL_VECTOR => TrapKind::Syscall,
        _ => TrapKind::Spurious,
    }
}

/// Result the dispatcher reports to the low-level entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    Handled,
    /// Unrecoverable: the caller paints the panic screen.
    Fatal {
        vector: u8,
        detail: &'static str,
    },
}

/// Handler a driver registers for its PIC line.
pub type IrqHandler = fn(&mut InterruptFrame);

/// IRQ routing table plus counters.
pub struct TrapDispatcher {
    irq_handlers: [Option<IrqHandler>; IRQ_COUNT],
    irqs_handled: u64,
    irqs_unhandled: u64,
}

impl TrapDispatcher {
    pub const fn new() -> Self {
        Self {
            irq_handlers: [None; IRQ_COUNT],
            irqs_handled: 0,
            irqs_unhandled: 0,
        }
    }

    pub fn register_irq(&mut self, irq: u8, handler: IrqHandler) -> KernelResult<()> {
        let slot = self
            .irq_handlers
            .get_mut(irq as usize)
            .ok_or(KernelError::InvalidSize { size: irq as usize })?;
        if slot.is_some() {
            return Err(KernelError::InvalidState {
                expected: "free irq slot",
                actual: "handler already registered",
            });
        }
        *slot = Some(handler);
        Ok(())
    }

    pub fn unregister_irq(&mut self, irq: u8) {
        if let Some(slot) = self.irq_handlers.get_mut(irq as usize) {
            *slot = None;
        }
    }

    /// Run the registered handler for a line; the default is a no-op (the
    /// caller still acknowledges the PIC). Returns whether a handler ran.
    pub fn dispatch_irq(&mut self, irq: u8, frame: &mut InterruptFrame) -> bool {
        match self.irq_handlers.get(irq as usize).copied().flatten() {
            Some(handler) => {
                handler(frame);
                self.irqs_handled += 1;
                true
            }
            None => {
                self.irqs_unhandled += 1;
                false
            }
        }
    }

    pub fn counts(&self) -> (u64, u64) {
        (self.irqs_handled, self.irqs_unhandled)
    }
}

impl Default for TrapDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Global IRQ dispatcher.
pub static TRAP_DISPATCHER: SpinLock<TrapDispatcher> = SpinLock::new(TrapDispatcher::new());

// ---------------------------------------------------------------------------
// PIC acknowledge
// ---------------------------------------------------------------------------

const PIC1_COMMAND: u16 = 0x20;
const PIC2_COMMAND: u16 = 0xA0;
const PIC_EOI: u8 = 0x20;

static EOI_COUNT: AtomicU64 = AtomicU64::new(0);

/// Acknowledge a PIC line (both controllers for the slave's lines).
pub fn pic_send_eoi(irq: u8) {
    if irq >= 8 {
        crate::arch::x86::outb(PIC2_COMMAND, PIC_EOI);
    }
    crate::arch::x86::outb(PIC1_COMMAND, PIC_EOI);
    EOI_COUNT.fetch_add(1, Ordering::Relaxed);
}

pub fn eoi_count() -> u64 {
    EOI_COUNT.load(Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Recursion guard
// ---------------------------------------------------------------------------

static FAULT_DEPTH: AtomicU32 = AtomicU32::new(0);

/// RAII increment of the fault-nesting depth.
pub struct FaultDepthGuard {
    depth: u32,
}

impl FaultDepthGuard {
    pub fn enter() -> Self {
        Self {
            depth: FAULT_DEPTH.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn exceeded(&self) -> bool {
        self.depth > MAX_FAULT_DEPTH
    }
}

impl Drop for FaultDepthGuard {
    fn drop(&mut self) {
        FAULT_DEPTH.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn fault_depth() -> u32 {
    FAULT_DEPTH.load(Ordering::SeqCst)
}

/// Emergency stack for the recursion guard (bare metal only).
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[repr(C, align(16))]
struct EmergencyStack([u8; 8192]);

#[cfg(all(target_arch = "x86", target_os = "none"))]
static mut EMERGENCY_STACK: EmergencyStack = EmergencyStack([0; 8192]);

/// Last-resort exit: direct VGA message on a known-good stack, then halt
/// with interrupts off. Never calls back into any subsystem.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn emergency_halt() -> ! {
    crate::arch::disable_interrupts();
    // SAFETY: the emergency stack is reserved for exactly this path and
    // nothing returns from it.
    unsafe {
        let top = core::ptr::addr_of_mut!(EMERGENCY_STACK) as usize + 8192;
        core::arch::asm!("mov esp, {}", in(reg) top, options(nostack));
    }
    crate::arch::x86::vga::emergency_message(0, "*** FAULT RECURSION LIMIT - HALTED ***");
    loop {
        crate::arch::halt();
    }
}

// ---------------------------------------------------------------------------
// Bare-metal entry
// ---------------------------------------------------------------------------

/// Common C-level entry every stub funnels into.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[no_mangle]
pub extern "C" fn trap_entry(frame: *mut InterruptFrame) {
    // SAFETY: the stub built a full frame at this address on the current
    // kernel stack.
    let frame = unsafe { &mut *frame };

    let guard = FaultDepthGuard::enter();
    if guard.exceeded() {
        emergency_halt();
    }

    match classify(frame.int_no) {
        TrapKind::Syscall => crate::syscall::kernel_entry(frame),
        TrapKind::PageFault => kernel_page_fault(frame),
        TrapKind::Irq(irq) => {
            TRAP_DISPATCHER.acquire().dispatch_irq(irq, frame);
            pic_send_eoi(irq);
        }
        TrapKind::Exception(vector) => {
            fatal_trap(
                frame,
                EXCEPTION_NAMES[vector as usize],
                "unhandled CPU exception",
            );
        }
        TrapKind::Spurious => {
            log::warn!(target: "trap", "spurious vector {}", frame.int_no);
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fn kernel_page_fault(frame: &mut InterruptFrame) {
    use crate::mm::page_fault::{
        handle_page_fault, FaultResolution, PageFaultErrorCode, PageFaultInfo, PageFaultPolicy,
    };
    use crate::mm::phys::kernel::KERNEL_PHYS;
    use crate::mm::VirtualAddress;

    let info = PageFaultInfo {
        address: VirtualAddress::new(crate::arch::read_cr2()),
        code: PageFaultErrorCode::from_bits_truncate(frame.err_code),
        eip: frame.eip,
    };

    let policy = PageFaultPolicy::default();
    let resolution = {
        let vmm = match crate::mm::vmm::VMM.get() {
            Some(vmm) => vmm,
            None => {
                fatal_trap(frame, "Page Fault", "fault before vmm init");
            }
        };
        let mut vmm = vmm.lock();
        let mut pmm = crate::mm::FRAME_ALLOCATOR.lock();
        let mut sched = crate::sched::SCHEDULER.lock();
        match sched.current_task_mut() {
            Some(task) => {
                let (space, tracker) = match task.address_space.as_mut() {
                    Some(space) => (space, &mut task.fault_tracker),
                    None => fatal_trap(frame, "Page Fault", "kernel task fault"),
                };
                handle_page_fault(
                    info,
                    &policy,
                    tracker,
                    space,
                    &mut vmm,
                    &mut pmm,
                    &KERNEL_PHYS,
                )
            }
            None => fatal_trap(frame, "Page Fault", "fault with no current task"),
        }
    };

    match resolution {
        FaultResolution::Resumed => {}
        FaultResolution::Fatal(reason) => {
            fatal_trap(frame, "Page Fault", reason.as_str());
        }
    }
}

/// Paint the panic screen with the trap context and halt.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn fatal_trap(frame: &InterruptFrame, category: &str, detail: &str) -> ! {
    use crate::arch::x86::vga::{panic_screen, PanicRegs, TextBuffer};

    crate::arch::disable_interrupts();
    let mut buf = TextBuffer::new();
    panic_screen(
        &mut buf,
        category,
        detail,
        Some(&PanicRegs {
            cr2: Some(crate::arch::read_cr2()),
            error_code: Some(frame.err_code),
            esp: frame.user_esp,
            eip: frame.eip,
        }),
    );
    loop {
        crate::arch::halt();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_matches_the_stub_pushes() {
        // pusha (8) + ds + int_no + err + cpu frame (5) = 16 dwords.
        assert_eq!(core::mem::size_of::<InterruptFrame>(), 16 * 4);
        let frame = InterruptFrame::for_vector(14);
        assert_eq!(frame.int_no, 14);
    }

    #[test]
    fn classification_covers_the_vector_space() {
        assert_eq!(classify(0), TrapKind::Exception(0));
        assert_eq!(classify(13), TrapKind::Exception(13));
        assert_eq!(classify(14), TrapKind::PageFault);
        assert_eq!(classify(32), TrapKind::Irq(0));
        assert_eq!(classify(47), TrapKind::Irq(15));
        assert_eq!(classify(0x80), TrapKind::Syscall);
        assert_eq!(classify(0x81), TrapKind::Spurious);
        assert_eq!(classify(200), TrapKind::Spurious);
    }

    #[test]
    fn exception_names_line_up() {
        assert_eq!(EXCEPTION_NAMES[8], "Double Fault");
        assert_eq!(EXCEPTION_NAMES[13], "General Protection Fault");
        assert_eq!(EXCEPTION_NAMES[14], "Page Fault");
    }

    #[test]
    fn irq_registration_and_dispatch() {
        static FIRED: AtomicU32 = AtomicU32::new(0);
        fn handler(frame: &mut InterruptFrame) {
            FIRED.fetch_add(1, Ordering::SeqCst);
            frame.eax = 0x1234;
        }

        let mut dispatcher = TrapDispatcher::new();
        dispatcher.register_irq(1, handler).expect("slot free");
        // Double registration of the same line is refused.
        assert!(dispatcher.register_irq(1, handler).is_err());

        let mut frame = InterruptFrame::for_vector(33);
        assert!(dispatcher.dispatch_irq(1, &mut frame));
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        assert_eq!(frame.eax, 0x1234);

        // Unregistered lines fall back to the counted no-op.
        assert!(!dispatcher.dispatch_irq(2, &mut frame));
        assert_eq!(dispatcher.counts(), (1, 1));

        dispatcher.unregister_irq(1);
        assert!(!dispatcher.dispatch_irq(1, &mut frame));
    }

    #[test]
    fn out_of_range_irq_is_rejected() {
        fn handler(_: &mut InterruptFrame) {}
        let mut dispatcher = TrapDispatcher::new();
        assert!(dispatcher.register_irq(16, handler).is_err());
    }

    #[test]
    fn fault_depth_guard_nests_and_unwinds() {
        let base = fault_depth();
        {
            let g1 = FaultDepthGuard::enter();
            assert_eq!(g1.depth(), base + 1);
            {
                let g2 = FaultDepthGuard::enter();
                assert_eq!(g2.depth(), base + 2);
                assert!(!g2.exceeded() || base + 2 > MAX_FAULT_DEPTH);
            }
            assert_eq!(fault_depth(), base + 1);
        }
        assert_eq!(fault_depth(), base);
    }

    #[test]
    fn user_mode_detection_uses_cs_rpl() {
        let mut frame = InterruptFrame::for_vector(0x80);
        frame.cs = 0x1B;
        assert!(frame.from_user_mode());
        frame.cs = 0x08;
        assert!(!frame.from_user_mode());
    }
}
