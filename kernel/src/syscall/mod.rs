//! System call interface
//!
//! `INT 0x80`: number in EAX, arguments in EBX, ECX, EDX, ESI, EDI, EBP,
//! result back in EAX. Negative returns are Linux errno values. The table
//! is a dense array bounded by [`SYS_MAX`]; unknown or unimplemented
//! numbers return `-ENOSYS` and warn exactly once.

pub mod fs;
pub mod info;
pub mod net;
pub mod power;
pub mod process;
pub mod time;

use crate::drivers::console::Console;
use crate::error::KernelError;
use crate::fs::{FileTable, Initrd};
use crate::mm::phys::PhysAccess;
use crate::mm::user_copy;
use crate::mm::vas::AddressSpace;
use crate::mm::vmm::Vmm;
use crate::mm::{FrameAllocator, VirtualAddress};
use crate::trap::InterruptFrame;

pub use net::{NetStack, NoNetwork};
pub use power::{PowerAction, PowerControl};
pub use time::SystemClock;

// -- syscall numbers (historical i386 table) --------------------------------

pub const SYS_EXIT: usize = 1;
pub const SYS_READ: usize = 3;
pub const SYS_WRITE: usize = 4;
pub const SYS_OPEN: usize = 5;
pub const SYS_CLOSE: usize = 6;
pub const SYS_TIME: usize = 13;
pub const SYS_LSEEK: usize = 19;
pub const SYS_GETPID: usize = 20;
pub const SYS_GETUID: usize = 24;
pub const SYS_DUP: usize = 41;
pub const SYS_BRK: usize = 45;
pub const SYS_GETGID: usize = 47;
pub const SYS_GETEUID: usize = 49;
pub const SYS_GETEGID: usize = 50;
pub const SYS_IOCTL: usize = 54;
pub const SYS_FCNTL: usize = 55;
pub const SYS_DUP2: usize = 63;
pub const SYS_GETPPID: usize = 64;
pub const SYS_UNAME: usize = 122;
pub const SYS_NANOSLEEP: usize = 162;
pub const SYS_EXIT_GROUP: usize = 252;
pub const SYS_SOCKET: usize = 359;
pub const SYS_BIND: usize = 361;
pub const SYS_SENDTO: usize = 369;
pub const SYS_RECVFROM: usize = 371;
/// Not in the historical table; private number for the power control call.
pub const SYS_POWER: usize = 403;

/// Table bound.
pub const SYS_MAX: usize = 512;

// -- errno ------------------------------------------------------------------

pub const EPERM: i32 = 1;
pub const ENOENT: i32 = 2;
pub const EBADF: i32 = 9;
pub const ENOMEM: i32 = 12;
pub const EACCES: i32 = 13;
pub const EFAULT: i32 = 14;
pub const EINVAL: i32 = 22;
pub const EMFILE: i32 = 24;
pub const ENOSYS: i32 = 38;

/// Convert a kernel error into the negative errno a syscall returns.
pub fn errno_from(err: KernelError) -> i32 {
    let errno = match err {
        KernelError::OutOfMemory { .. } => ENOMEM,
        KernelError::InvalidAddress { .. }
        | KernelError::BadUserAccess { .. }
        | KernelError::Corruption { .. } => EFAULT,
        KernelError::NotFound { .. } => ENOENT,
        KernelError::PermissionDenied { .. } => EACCES,
        KernelError::ResourceExhausted { .. } => EMFILE,
        KernelError::AlreadyMapped { .. }
        | KernelError::NotMapped { .. }
        | KernelError::NotInitialized { .. }
        | KernelError::InvalidState { .. }
        | KernelError::InvalidSize { .. }
        | KernelError::InvalidExecutable { .. } => EINVAL,
    };
    -errno
}

// -- context ----------------------------------------------------------------

/// Blocking line source for fd 0 (the keyboard driver outside this core).
pub trait LineInput {
    /// Read one line (without the newline) into `buf`; returns its length.
    fn read_line(&mut self, buf: &mut [u8]) -> usize;
}

/// Input source that always reports end-of-input.
pub struct NullInput;

impl LineInput for NullInput {
    fn read_line(&mut self, _buf: &mut [u8]) -> usize {
        0
    }
}

/// Access to the calling task's user memory.
pub struct UserMem<'a> {
    pub vmm: &'a mut Vmm,
    pub pmm: &'a mut FrameAllocator,
    pub phys: &'a dyn PhysAccess,
    pub space: &'a mut AddressSpace,
}

impl UserMem<'_> {
    pub fn read(&self, user: VirtualAddress, buf: &mut [u8]) -> Result<(), KernelError> {
        user_copy::copy_from_user(self.vmm, self.space.directory(), self.phys, user, buf)
    }

    pub fn write(&self, user: VirtualAddress, bytes: &[u8]) -> Result<(), KernelError> {
        user_copy::copy_to_user(self.vmm, self.space.directory(), self.phys, user, bytes)
    }

    pub fn read_str(&self, user: VirtualAddress, buf: &mut [u8]) -> Result<usize, KernelError> {
        user_copy::str_from_user(self.vmm, self.space.directory(), self.phys, user, buf)
    }
}

/// Everything a handler may touch, borrowed for one dispatch.
pub struct SyscallContext<'a> {
    pub console: &'a Console,
    pub input: &'a mut dyn LineInput,
    pub files: &'a mut FileTable,
    pub initrd: Option<&'a Initrd<'a>>,
    pub mem: Option<UserMem<'a>>,
    pub clock: &'a SystemClock,
    pub net: &'a mut dyn NetStack,
    pub power: &'a mut dyn PowerControl,
    pub pid: u32,
    pub ppid: u32,
    /// Set by exit/exit_group; the glue terminates the task afterwards.
    pub exit_code: Option<i32>,
}

/// Register-file arguments, left to right.
#[derive(Debug, Clone, Copy)]
pub struct SyscallArgs {
    pub nr: usize,
    pub arg: [u32; 6],
}

impl SyscallArgs {
    pub fn from_frame(frame: &InterruptFrame) -> Self {
        Self {
            nr: frame.eax as usize,
            arg: [
                frame.ebx, frame.ecx, frame.edx, frame.esi, frame.edi, frame.ebp,
            ],
        }
    }
}

pub type SyscallHandler = for<'a, 'b> fn(&'a mut SyscallContext<'b>, &SyscallArgs) -> i32;

#[derive(Clone, Copy)]
struct SyscallEntry {
    handler: Option<SyscallHandler>,
    warned: bool,
}

/// Dense dispatch table.
pub struct SyscallTable {
    entries: [SyscallEntry; SYS_MAX],
    range_warned: bool,
}

impl SyscallTable {
    pub fn empty() -> Self {
        Self {
            entries: [SyscallEntry {
                handler: None,
                warned: false,
            }; SYS_MAX],
            range_warned: false,
        }
    }

    /// The full kernel table.
    pub fn with_defaults() -> Self {
        let mut table = Self::empty();
        let defaults: &[(usize, SyscallHandler)] = &[
            (SYS_EXIT, process::sys_exit),
            (SYS_READ, fs::sys_read),
            (SYS_WRITE, fs::sys_write),
            (SYS_OPEN, fs::sys_open),
            (SYS_CLOSE, fs::sys_close),
            (SYS_TIME, time::sys_time),
            (SYS_LSEEK, fs::sys_lseek),
            (SYS_GETPID, process::sys_getpid),
            (SYS_GETUID, process::sys_getuid),
            (SYS_DUP, fs::sys_dup),
            (SYS_BRK, process::sys_brk),
            (SYS_GETGID, process::sys_getgid),
            (SYS_GETEUID, process::sys_geteuid),
            (SYS_GETEGID, process::sys_getegid),
            (SYS_IOCTL, fs::sys_ioctl),
            (SYS_FCNTL, fs::sys_fcntl),
            (SYS_DUP2, fs::sys_dup2),
            (SYS_GETPPID, process::sys_getppid),
            (SYS_UNAME, info::sys_uname),
            (SYS_NANOSLEEP, time::sys_nanosleep),
            (SYS_EXIT_GROUP, process::sys_exit_group),
            (SYS_SOCKET, net::sys_socket),
            (SYS_BIND, net::sys_bind),
            (SYS_SENDTO, net::sys_sendto),
            (SYS_RECVFROM, net::sys_recvfrom),
            (SYS_POWER, power::sys_power),
        ];
        for &(nr, handler) in defaults {
            table
                .register(nr, handler)
                .expect("default table entries are in range and unique");
        }
        table
    }

    pub fn register(&mut self, nr: usize, handler: SyscallHandler) -> Result<(), KernelError> {
        let entry = self
            .entries
            .get_mut(nr)
            .ok_or(KernelError::InvalidSize { size: nr })?;
        if entry.handler.is_some() {
            return Err(KernelError::InvalidState {
                expected: "free syscall slot",
                actual: "already registered",
            });
        }
        entry.handler = Some(handler);
        Ok(())
    }

    pub fn is_implemented(&self, nr: usize) -> bool {
        self.entries
            .get(nr)
            .map(|e| e.handler.is_some())
            .unwrap_or(false)
    }

    /// Dispatch one trap frame: decode the registers, run the handler,
    /// store the result in EAX.
    pub fn dispatch(&mut self, frame: &mut InterruptFrame, ctx: &mut SyscallContext) {
        let args = SyscallArgs::from_frame(frame);
        let ret = match self.entries.get_mut(args.nr) {
            Some(entry) => match entry.handler {
                Some(handler) => handler(ctx, &args),
                None => {
                    if !entry.warned {
                        entry.warned = true;
                        log::warn!(target: "syscall", "unimplemented syscall {}", args.nr);
                    }
                    -ENOSYS
                }
            },
            None => {
                if !self.range_warned {
                    self.range_warned = true;
                    log::warn!(target: "syscall", "syscall {} beyond SYS_MAX", args.nr);
                }
                -ENOSYS
            }
        };
        frame.eax = ret as u32;
    }
}

// ---------------------------------------------------------------------------
// Bare-metal glue
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod kernel {
    use super::*;
    use crate::mm::phys::kernel::KERNEL_PHYS;
    use spin::Mutex;

    lazy_static::lazy_static! {
        pub static ref SYSCALL_TABLE: Mutex<SyscallTable> = Mutex::new(SyscallTable::with_defaults());
    }

    pub static SYSTEM_CLOCK: SystemClock = SystemClock::new();
    static NETWORK: Mutex<NoNetwork> = Mutex::new(NoNetwork);
    static POWER: Mutex<power::PortPower> = Mutex::new(power::PortPower);
    static INPUT: Mutex<NullInput> = Mutex::new(NullInput);

    /// INT 0x80 entry from the trap layer.
    pub fn kernel_entry(frame: &mut InterruptFrame) {
        let vmm_once = match crate::mm::vmm::VMM.get() {
            Some(vmm) => vmm,
            None => {
                frame.eax = (-ENOSYS) as u32;
                return;
            }
        };
        let mut vmm = vmm_once.lock();
        let mut pmm = crate::mm::FRAME_ALLOCATOR.lock();
        let mut sched = crate::sched::SCHEDULER.lock();
        let initrd = crate::fs::initrd::INITRD.get();

        let (pid, exited) = {
            let task = match sched.current_task_mut() {
                Some(task) => task,
                None => {
                    frame.eax = (-ENOSYS) as u32;
                    return;
                }
            };
            let pid = task.id.0;
            let space = match task.address_space.as_mut() {
                Some(space) => space,
                None => {
                    frame.eax = (-EFAULT) as u32;
                    return;
                }
            };

            let mut input = INPUT.lock();
            let mut net = NETWORK.lock();
            let mut power = POWER.lock();
            let mut ctx = SyscallContext {
                console: &crate::drivers::console::CONSOLE,
                input: &mut *input,
                files: &mut task.files,
                initrd,
                mem: Some(UserMem {
                    vmm: &mut *vmm,
                    pmm: &mut *pmm,
                    phys: &KERNEL_PHYS,
                    space,
                }),
                clock: &SYSTEM_CLOCK,
                net: &mut *net,
                power: &mut *power,
                pid,
                ppid: 0,
                exit_code: None,
            };
            SYSCALL_TABLE.lock().dispatch(frame, &mut ctx);
            (pid, ctx.exit_code)
        };

        if let Some(code) = exited {
            log::info!(target: "syscall", "task {} exited with {}", pid, code);
            sched.exit_current(code);
            drop(sched);
            drop(pmm);
            drop(vmm);
            crate::sched::yield_cpu();
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use kernel::kernel_entry;
