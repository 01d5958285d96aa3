//! Process syscalls

use super::{SyscallArgs, SyscallContext, EFAULT};

/// exit(code): mark the task terminated; the dispatch glue reschedules.
pub fn sys_exit(ctx: &mut SyscallContext, args: &SyscallArgs) -> i32 {
    ctx.exit_code = Some(args.arg[0] as i32);
    0
}

/// exit_group(code): single-threaded tasks make this exit.
pub fn sys_exit_group(ctx: &mut SyscallContext, args: &SyscallArgs) -> i32 {
    sys_exit(ctx, args)
}

pub fn sys_getpid(ctx: &mut SyscallContext, _args: &SyscallArgs) -> i32 {
    ctx.pid as i32
}

pub fn sys_getppid(ctx: &mut SyscallContext, _args: &SyscallArgs) -> i32 {
    ctx.ppid as i32
}

// uid/gid are stubbed to root.

pub fn sys_getuid(_ctx: &mut SyscallContext, _args: &SyscallArgs) -> i32 {
    0
}

pub fn sys_geteuid(_ctx: &mut SyscallContext, _args: &SyscallArgs) -> i32 {
    0
}

pub fn sys_getgid(_ctx: &mut SyscallContext, _args: &SyscallArgs) -> i32 {
    0
}

pub fn sys_getegid(_ctx: &mut SyscallContext, _args: &SyscallArgs) -> i32 {
    0
}

/// brk(addr): move the program break. Growth only extends the heap area;
/// the pages arrive zero-filled through the page-fault handler. On an
/// invalid request the current break is returned, Linux style.
pub fn sys_brk(ctx: &mut SyscallContext, args: &SyscallArgs) -> i32 {
    let mem = match ctx.mem.as_mut() {
        Some(mem) => mem,
        None => return -EFAULT,
    };
    match mem.space.set_brk(args.arg[0]) {
        Ok(brk) => brk as i32,
        Err(_) => mem.space.current_brk().as_u32() as i32,
    }
}
