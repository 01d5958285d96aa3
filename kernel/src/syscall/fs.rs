//! File and console syscalls

use crate::mm::VirtualAddress;

use super::{SyscallArgs, SyscallContext, EBADF, EFAULT, EINVAL, ENOENT};

const SEEK_SET: u32 = 0;
const SEEK_CUR: u32 = 1;
const SEEK_END: u32 = 2;

const F_DUPFD: u32 = 0;
const F_GETFL: u32 = 3;
const F_SETFL: u32 = 4;

/// Longest path accepted by open.
const PATH_MAX: usize = 256;

/// write(fd, buf, len): fd 1/2 stream to the console, everything else is
/// EBADF (the filesystem is read-only).
pub fn sys_write(ctx: &mut SyscallContext, args: &SyscallArgs) -> i32 {
    let fd = args.arg[0] as i32;
    let user = VirtualAddress::new(args.arg[1]);
    let len = args.arg[2] as usize;

    if fd != 1 && fd != 2 {
        return -EBADF;
    }
    let mem = match ctx.mem.as_ref() {
        Some(mem) => mem,
        None => return -EFAULT,
    };

    let mut chunk = [0u8; 256];
    let mut done = 0usize;
    while done < len {
        let n = (len - done).min(chunk.len());
        if mem.read(user.offset(done as u32), &mut chunk[..n]).is_err() {
            return -EFAULT;
        }
        ctx.console.write_bytes(&chunk[..n]);
        done += n;
    }
    done as i32
}

/// read(fd, buf, len): fd 0 is a blocking line read; fd >= 3 copies from
/// the open file and advances its offset.
pub fn sys_read(ctx: &mut SyscallContext, args: &SyscallArgs) -> i32 {
    let fd = args.arg[0] as i32;
    let user = VirtualAddress::new(args.arg[1]);
    let len = args.arg[2] as usize;

    match fd {
        0 => {
            let mut line = [0u8; 256];
            let max = len.min(line.len());
            let n = ctx.input.read_line(&mut line[..max]);
            let mem = match ctx.mem.as_ref() {
                Some(mem) => mem,
                None => return -EFAULT,
            };
            if mem.write(user, &line[..n]).is_err() {
                return -EFAULT;
            }
            n as i32
        }
        1 | 2 => -EBADF,
        _ => {
            let file = match ctx.files.get_mut(fd) {
                Some(file) => file,
                None => return -EBADF,
            };
            let data = match ctx.initrd {
                Some(initrd) => initrd.data(),
                None => return -EBADF,
            };
            let n = len.min(file.len - file.pos);
            if n == 0 {
                return 0;
            }
            let start = file.offset + file.pos;
            let slice = &data[start..start + n];
            let mem = match ctx.mem.as_ref() {
                Some(mem) => mem,
                None => return -EFAULT,
            };
            if mem.write(user, slice).is_err() {
                return -EFAULT;
            }
            file.pos += n;
            n as i32
        }
    }
}

/// open(path, flags, mode) against the archive-backed read-only root.
pub fn sys_open(ctx: &mut SyscallContext, args: &SyscallArgs) -> i32 {
    let mem = match ctx.mem.as_ref() {
        Some(mem) => mem,
        None => return -EFAULT,
    };
    let mut path_buf = [0u8; PATH_MAX];
    let path_len = match mem.read_str(VirtualAddress::new(args.arg[0]), &mut path_buf) {
        Ok(len) => len,
        Err(_) => return -EFAULT,
    };
    let path = match core::str::from_utf8(&path_buf[..path_len]) {
        Ok(path) => path,
        Err(_) => return -EINVAL,
    };

    let initrd = match ctx.initrd {
        Some(initrd) => initrd,
        None => return -ENOENT,
    };
    let (offset, len) = match initrd.file_range(path) {
        Some(range) => range,
        None => return -ENOENT,
    };

    match ctx.files.open(offset, len, args.arg[1]) {
        Ok(fd) => fd,
        Err(e) => super::errno_from(e),
    }
}

/// close(fd); stdin/out/err close as no-ops.
pub fn sys_close(ctx: &mut SyscallContext, args: &SyscallArgs) -> i32 {
    match ctx.files.close(args.arg[0] as i32) {
        Ok(()) => 0,
        Err(_) => -EBADF,
    }
}

/// lseek(fd, offset, whence), clamped to `[0, size]`.
pub fn sys_lseek(ctx: &mut SyscallContext, args: &SyscallArgs) -> i32 {
    let fd = args.arg[0] as i32;
    let offset = args.arg[1] as i32;
    let whence = args.arg[2];

    let file = match ctx.files.get_mut(fd) {
        Some(file) => file,
        None => return -EBADF,
    };
    let base = match whence {
        SEEK_SET => 0i64,
        SEEK_CUR => file.pos as i64,
        SEEK_END => file.len as i64,
        _ => return -EINVAL,
    };
    let target = (base + offset as i64).clamp(0, file.len as i64);
    file.pos = target as usize;
    target as i32
}

/// dup(fd) onto the lowest free descriptor.
pub fn sys_dup(ctx: &mut SyscallContext, args: &SyscallArgs) -> i32 {
    match ctx.files.dup(args.arg[0] as i32) {
        Ok(fd) => fd,
        Err(crate::error::KernelError::NotFound { .. }) => -EBADF,
        Err(e) => super::errno_from(e),
    }
}

/// dup2(fd, newfd), replacing whatever newfd held.
pub fn sys_dup2(ctx: &mut SyscallContext, args: &SyscallArgs) -> i32 {
    match ctx.files.dup2(args.arg[0] as i32, args.arg[1] as i32) {
        Ok(fd) => fd,
        Err(crate::error::KernelError::NotFound { .. }) => -EBADF,
        Err(_) => -EBADF,
    }
}

/// Minimal ioctl: terminal queries on the console descriptors succeed so a
/// shell can probe its tty; data files have no ioctls.
pub fn sys_ioctl(ctx: &mut SyscallContext, args: &SyscallArgs) -> i32 {
    let fd = args.arg[0] as i32;
    match fd {
        0..=2 => 0,
        _ if ctx.files.get(fd).is_some() => -EINVAL,
        _ => -EBADF,
    }
}

/// Minimal fcntl: duplicate and flag get/set.
pub fn sys_fcntl(ctx: &mut SyscallContext, args: &SyscallArgs) -> i32 {
    let fd = args.arg[0] as i32;
    let cmd = args.arg[1];

    if (0..3).contains(&fd) {
        // The console descriptors report no flags.
        return match cmd {
            F_GETFL | F_SETFL => 0,
            _ => -EINVAL,
        };
    }

    match cmd {
        F_DUPFD => sys_dup(ctx, args),
        F_GETFL => match ctx.files.get(fd) {
            Some(file) => file.flags as i32,
            None => -EBADF,
        },
        F_SETFL => match ctx.files.get_mut(fd) {
            Some(file) => {
                file.flags = args.arg[2];
                0
            }
            None => -EBADF,
        },
        _ => -EINVAL,
    }
}
