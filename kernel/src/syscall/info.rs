//! System identification

use crate::mm::VirtualAddress;

use super::{SyscallArgs, SyscallContext, EFAULT};

/// Field width of each utsname member (64 chars + NUL).
const UTS_LEN: usize = 65;
/// sysname, nodename, release, version, machine, domainname.
const UTS_FIELDS: usize = 6;

fn fill_field(buf: &mut [u8], index: usize, value: &str) {
    let start = index * UTS_LEN;
    let bytes = value.as_bytes();
    let len = bytes.len().min(UTS_LEN - 1);
    buf[start..start + len].copy_from_slice(&bytes[..len]);
}

/// uname(buf): fill the fixed utsname struct.
pub fn sys_uname(ctx: &mut SyscallContext, args: &SyscallArgs) -> i32 {
    let mem = match ctx.mem.as_ref() {
        Some(mem) => mem,
        None => return -EFAULT,
    };

    let mut uts = [0u8; UTS_LEN * UTS_FIELDS];
    fill_field(&mut uts, 0, "EmberOS");
    fill_field(&mut uts, 1, "ember");
    fill_field(&mut uts, 2, env!("CARGO_PKG_VERSION"));
    fill_field(&mut uts, 3, "EmberOS kernel");
    fill_field(&mut uts, 4, "i686");
    fill_field(&mut uts, 5, "(none)");

    match mem.write(VirtualAddress::new(args.arg[0]), &uts) {
        Ok(()) => 0,
        Err(_) => -EFAULT,
    }
}
