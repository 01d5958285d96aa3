//! User-memory transfer helpers
//!
//! Every kernel path that touches user memory goes through these: the
//! range is checked against the user/kernel split, SMAP is opened for the
//! duration (STAC/CLAC brackets via [`UserAccessGuard`]), and the copy
//! walks the target address space page by page through the physical
//! window, so it works under any CR3.

use super::phys::PhysAccess;
use super::vmm::Vmm;
use super::{PhysicalAddress, VirtualAddress, KERNEL_BASE, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::security::cpu_features::UserAccessGuard;

fn check_user_range(user: VirtualAddress, len: usize) -> KernelResult<()> {
    let start = user.as_u32() as u64;
    let end = start + len as u64;
    if end > KERNEL_BASE as u64 {
        return Err(KernelError::BadUserAccess { addr: user.as_u32() });
    }
    Ok(())
}

fn page_chunk(addr: u32, remaining: usize) -> usize {
    let to_page_end = PAGE_SIZE - (addr as usize % PAGE_SIZE);
    remaining.min(to_page_end)
}

fn frame_of(paddr: PhysicalAddress) -> (PhysicalAddress, usize) {
    let offset = paddr.as_u32() as usize % PAGE_SIZE;
    (
        PhysicalAddress::new(paddr.as_u32() & !(PAGE_SIZE as u32 - 1)),
        offset,
    )
}

/// Copy `buf.len()` bytes from user memory into `buf`.
pub fn copy_from_user(
    vmm: &Vmm,
    dir: PhysicalAddress,
    phys: &dyn PhysAccess,
    user: VirtualAddress,
    buf: &mut [u8],
) -> KernelResult<()> {
    check_user_range(user, buf.len())?;
    let _smap = UserAccessGuard::new();

    let mut copied = 0;
    while copied < buf.len() {
        let vaddr = VirtualAddress::new(user.as_u32() + copied as u32);
        let paddr = vmm
            .translate(dir, vaddr, phys)
            .ok_or(KernelError::BadUserAccess { addr: vaddr.as_u32() })?;
        let chunk = page_chunk(vaddr.as_u32(), buf.len() - copied);
        let (frame, offset) = frame_of(paddr);
        // SAFETY: the frame backs a mapped user page; chunk stays inside it.
        unsafe {
            core::ptr::copy_nonoverlapping(
                phys.frame_ptr(frame).add(offset),
                buf[copied..].as_mut_ptr(),
                chunk,
            );
        }
        copied += chunk;
    }
    Ok(())
}

/// Copy `bytes` into user memory.
pub fn copy_to_user(
    vmm: &Vmm,
    dir: PhysicalAddress,
    phys: &dyn PhysAccess,
    user: VirtualAddress,
    bytes: &[u8],
) -> KernelResult<()> {
    check_user_range(user, bytes.len())?;
    let _smap = UserAccessGuard::new();

    let mut copied = 0;
    while copied < bytes.len() {
        let vaddr = VirtualAddress::new(user.as_u32() + copied as u32);
        let paddr = vmm
            .translate(dir, vaddr, phys)
            .ok_or(KernelError::BadUserAccess { addr: vaddr.as_u32() })?;
        let chunk = page_chunk(vaddr.as_u32(), bytes.len() - copied);
        let (frame, offset) = frame_of(paddr);
        // SAFETY: as in copy_from_user.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes[copied..].as_ptr(),
                phys.frame_ptr(frame).add(offset),
                chunk,
            );
        }
        copied += chunk;
    }
    Ok(())
}

/// Copy a NUL-terminated user string into `buf`. Returns its length
/// (without the terminator); fails if no NUL shows up within `buf.len()`.
pub fn str_from_user(
    vmm: &Vmm,
    dir: PhysicalAddress,
    phys: &dyn PhysAccess,
    user: VirtualAddress,
    buf: &mut [u8],
) -> KernelResult<usize> {
    let _smap = UserAccessGuard::new();

    for i in 0..buf.len() {
        let vaddr = VirtualAddress::new(user.as_u32() + i as u32);
        check_user_range(vaddr, 1)?;
        let paddr = vmm
            .translate(dir, vaddr, phys)
            .ok_or(KernelError::BadUserAccess { addr: vaddr.as_u32() })?;
        let (frame, offset) = frame_of(paddr);
        // SAFETY: single byte inside a mapped frame.
        let byte = unsafe { *phys.frame_ptr(frame).add(offset) };
        if byte == 0 {
            return Ok(i);
        }
        buf[i] = byte;
    }
    Err(KernelError::InvalidSize { size: buf.len() })
}
