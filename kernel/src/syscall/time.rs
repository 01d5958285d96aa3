//! Time syscalls
//!
//! The clock is a monotonic fake epoch that advances by one second per
//! query; nanosleep is a calibrated busy wait (there is no timer-driven
//! sleep queue in a cooperative kernel).

use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch;
use crate::mm::VirtualAddress;

use super::{SyscallArgs, SyscallContext, EFAULT, EINVAL};

/// Where the fake epoch starts.
const FAKE_EPOCH_BASE: u32 = 1_700_000_000;

/// Monotonic fake wall clock.
pub struct SystemClock {
    ticks: AtomicU32,
}

impl SystemClock {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU32::new(0),
        }
    }

    /// Read the clock, advancing it by one second.
    pub fn now_advancing(&self) -> u32 {
        FAKE_EPOCH_BASE + self.ticks.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current(&self) -> u32 {
        FAKE_EPOCH_BASE + self.ticks.load(Ordering::SeqCst)
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Busy-wait loops per millisecond. Host tests shrink this so nanosleep
/// costs nothing.
#[cfg(all(target_arch = "x86", target_os = "none"))]
const SPINS_PER_MS: u64 = 100_000;
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
const SPINS_PER_MS: u64 = 1;

fn busy_wait_ms(ms: u64) {
    for _ in 0..ms.saturating_mul(SPINS_PER_MS) {
        arch::pause();
    }
}

/// time(ptr): return the epoch, optionally storing it through `ptr`.
pub fn sys_time(ctx: &mut SyscallContext, args: &SyscallArgs) -> i32 {
    let now = ctx.clock.now_advancing();
    if args.arg[0] != 0 {
        let mem = match ctx.mem.as_ref() {
            Some(mem) => mem,
            None => return -EFAULT,
        };
        if mem
            .write(VirtualAddress::new(args.arg[0]), &now.to_le_bytes())
            .is_err()
        {
            return -EFAULT;
        }
    }
    now as i32
}

/// nanosleep(req, rem): busy wait proportional to the requested interval.
pub fn sys_nanosleep(ctx: &mut SyscallContext, args: &SyscallArgs) -> i32 {
    let mem = match ctx.mem.as_ref() {
        Some(mem) => mem,
        None => return -EFAULT,
    };
    let mut ts = [0u8; 8];
    if mem.read(VirtualAddress::new(args.arg[0]), &mut ts).is_err() {
        return -EFAULT;
    }
    let tv_sec = i32::from_le_bytes(ts[0..4].try_into().expect("4 bytes"));
    let tv_nsec = i32::from_le_bytes(ts[4..8].try_into().expect("4 bytes"));
    if tv_sec < 0 || !(0..1_000_000_000).contains(&tv_nsec) {
        return -EINVAL;
    }

    busy_wait_ms(tv_sec as u64 * 1000 + tv_nsec as u64 / 1_000_000);

    // The wait always completes: remaining time is zero.
    if args.arg[1] != 0 {
        let _ = mem.write(VirtualAddress::new(args.arg[1]), &[0u8; 8]);
    }
    0
}
