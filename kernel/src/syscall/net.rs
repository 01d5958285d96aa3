//! Network syscalls
//!
//! The kernel core has no protocol stack; socket calls are forwarded to a
//! [`NetStack`] collaborator. The default [`NoNetwork`] reports the calls
//! as unimplemented.

use crate::mm::VirtualAddress;

use super::{SyscallArgs, SyscallContext, EFAULT, ENOSYS};

/// Socket address size cap for bind/sendto.
const ADDR_MAX: usize = 128;
/// Datagram payload cap per call.
const DATA_MAX: usize = 1024;

/// The network collaborator the dispatcher forwards to.
pub trait NetStack {
    fn socket(&mut self, domain: u32, socket_type: u32, protocol: u32) -> i32;
    fn bind(&mut self, fd: i32, addr: &[u8]) -> i32;
    fn sendto(&mut self, fd: i32, data: &[u8], addr: &[u8]) -> i32;
    fn recvfrom(&mut self, fd: i32, buf: &mut [u8]) -> i32;
}

/// Stack used when no network collaborator is attached.
pub struct NoNetwork;

impl NetStack for NoNetwork {
    fn socket(&mut self, _domain: u32, _socket_type: u32, _protocol: u32) -> i32 {
        -ENOSYS
    }

    fn bind(&mut self, _fd: i32, _addr: &[u8]) -> i32 {
        -ENOSYS
    }

    fn sendto(&mut self, _fd: i32, _data: &[u8], _addr: &[u8]) -> i32 {
        -ENOSYS
    }

    fn recvfrom(&mut self, _fd: i32, _buf: &mut [u8]) -> i32 {
        -ENOSYS
    }
}

pub fn sys_socket(ctx: &mut SyscallContext, args: &SyscallArgs) -> i32 {
    ctx.net.socket(args.arg[0], args.arg[1], args.arg[2])
}

pub fn sys_bind(ctx: &mut SyscallContext, args: &SyscallArgs) -> i32 {
    let mem = match ctx.mem.as_ref() {
        Some(mem) => mem,
        None => return -EFAULT,
    };
    let len = (args.arg[2] as usize).min(ADDR_MAX);
    let mut addr = [0u8; ADDR_MAX];
    if mem.read(VirtualAddress::new(args.arg[1]), &mut addr[..len]).is_err() {
        return -EFAULT;
    }
    ctx.net.bind(args.arg[0] as i32, &addr[..len])
}

pub fn sys_sendto(ctx: &mut SyscallContext, args: &SyscallArgs) -> i32 {
    let mem = match ctx.mem.as_ref() {
        Some(mem) => mem,
        None => return -EFAULT,
    };
    let data_len = (args.arg[2] as usize).min(DATA_MAX);
    let mut data = [0u8; DATA_MAX];
    if mem
        .read(VirtualAddress::new(args.arg[1]), &mut data[..data_len])
        .is_err()
    {
        return -EFAULT;
    }
    let addr_len = (args.arg[5] as usize).min(ADDR_MAX);
    let mut addr = [0u8; ADDR_MAX];
    if addr_len > 0
        && mem
            .read(VirtualAddress::new(args.arg[4]), &mut addr[..addr_len])
            .is_err()
    {
        return -EFAULT;
    }
    ctx.net
        .sendto(args.arg[0] as i32, &data[..data_len], &addr[..addr_len])
}

pub fn sys_recvfrom(ctx: &mut SyscallContext, args: &SyscallArgs) -> i32 {
    let len = (args.arg[2] as usize).min(DATA_MAX);
    let mut data = [0u8; DATA_MAX];
    let received = ctx.net.recvfrom(args.arg[0] as i32, &mut data[..len]);
    if received <= 0 {
        return received;
    }
    let mem = match ctx.mem.as_ref() {
        Some(mem) => mem,
        None => return -EFAULT,
    };
    match mem.write(
        VirtualAddress::new(args.arg[1]),
        &data[..received as usize],
    ) {
        Ok(()) => received,
        Err(_) => -EFAULT,
    }
}
