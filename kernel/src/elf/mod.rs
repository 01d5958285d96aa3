//! ELF32 loader
//!
//! Validates a 32-bit little-endian i386 executable and maps its PT_LOAD
//! segments into a fresh address space. The load phase runs with the new
//! directory in CR3 behind an RAII switch, so the previous address space
//! is restored on every path out, including errors; file bytes are copied
//! page-by-page through the physical window and the BSS remainder stays
//! zero because segment frames are zeroed when allocated. On failure the
//! new directory is torn down before the error is returned.

use core::mem::size_of;

use crate::error::{KernelError, KernelResult};
use crate::mm::phys::{zero_frame, PhysAccess};
use crate::mm::user_copy::copy_to_user;
use crate::mm::vmm::{AddressSpaceSwitch, Vmm};
use crate::mm::{
    align_down, align_up, FrameAllocator, PageFlags, PhysicalAddress, VirtualAddress, KERNEL_BASE,
    PAGE_SIZE,
};

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
pub const ELFCLASS32: u8 = 1;
pub const ELFDATA2LSB: u8 = 1;
pub const EV_CURRENT: u32 = 1;
pub const ET_EXEC: u16 = 2;
pub const EM_386: u16 = 3;
pub const PT_LOAD: u32 = 1;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

/// ELF32 file header.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Elf32Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// ELF32 program header.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Elf32Phdr {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

fn read_struct<T: Copy>(bytes: &[u8], offset: usize) -> Option<T> {
    if offset.checked_add(size_of::<T>())? > bytes.len() {
        return None;
    }
    // SAFETY: bounds were just checked; T is a plain repr(C) record read
    // unaligned.
    Some(unsafe { (bytes.as_ptr().add(offset) as *const T).read_unaligned() })
}

fn bad(reason: &'static str) -> KernelError {
    KernelError::InvalidExecutable { reason }
}

/// Validate the identification and header fields the loader relies on.
pub fn validate(image: &[u8]) -> KernelResult<Elf32Ehdr> {
    let ehdr: Elf32Ehdr = read_struct(image, 0).ok_or(bad("truncated ELF header"))?;

    if ehdr.e_ident[..4] != ELF_MAGIC {
        return Err(bad("bad ELF magic"));
    }
    if ehdr.e_ident[4] != ELFCLASS32 {
        return Err(bad("not a 32-bit ELF"));
    }
    if ehdr.e_ident[5] != ELFDATA2LSB {
        return Err(bad("not little-endian"));
    }
    if ehdr.e_ident[6] != EV_CURRENT as u8 {
        return Err(bad("unknown ELF ident version"));
    }
    if ehdr.e_type != ET_EXEC {
        return Err(bad("not an executable"));
    }
    if ehdr.e_machine != EM_386 {
        return Err(bad("not an i386 binary"));
    }
    if ehdr.e_version != EV_CURRENT {
        return Err(bad("unknown ELF version"));
    }
    if ehdr.e_ehsize as usize != size_of::<Elf32Ehdr>() {
        return Err(bad("unexpected ELF header size"));
    }
    if ehdr.e_phentsize as usize != size_of::<Elf32Phdr>() {
        return Err(bad("unexpected program header size"));
    }
    if ehdr.e_phnum == 0 {
        return Err(bad("no program headers"));
    }
    Ok(ehdr)
}

/// What the loader mapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Entry point from the header.
    pub entry: u32,
    /// Lowest page any segment occupies.
    pub base: u32,
    /// Union of all mapped pages.
    pub mapped: core::ops::Range<u32>,
    /// Union of the zero-initialized tails, when any segment has one.
    pub bss: Option<core::ops::Range<u32>>,
}

/// Load `image` into a brand-new address space. Returns the new directory
/// and the load report; on any failure the directory is destroyed.
pub fn load(
    image: &[u8],
    vmm: &mut Vmm,
    pmm: &mut FrameAllocator,
    phys: &dyn PhysAccess,
) -> KernelResult<(PhysicalAddress, LoadReport)> {
    let ehdr = validate(image)?;
    let dir = vmm.create_directory(pmm, phys)?;
    match load_segments(image, &ehdr, dir, vmm, pmm, phys) {
        Ok(report) => Ok((dir, report)),
        Err(e) => {
            let _ = vmm.destroy_directory(dir, pmm, phys);
            Err(e)
        }
    }
}

fn load_segments(
    image: &[u8],
    ehdr: &Elf32Ehdr,
    dir: PhysicalAddress,
    vmm: &mut Vmm,
    pmm: &mut FrameAllocator,
    phys: &dyn PhysAccess,
) -> KernelResult<LoadReport> {
    // The fresh directory stays installed for the whole load phase; the
    // guard puts the previous CR3 back no matter how we leave.
    let _switch = AddressSpaceSwitch::enter(dir);

    let mut mapped_lo = u32::MAX;
    let mut mapped_hi = 0u32;
    let mut bss_lo = u32::MAX;
    let mut bss_hi = 0u32;

    for i in 0..ehdr.e_phnum as usize {
        let offset = ehdr.e_phoff as usize + i * ehdr.e_phentsize as usize;
        let phdr: Elf32Phdr = read_struct(image, offset).ok_or(bad("truncated program header"))?;
        if phdr.p_type != PT_LOAD || phdr.p_memsz == 0 {
            continue;
        }

        let file_end = phdr
            .p_offset
            .checked_add(phdr.p_filesz)
            .ok_or(bad("segment file range overflows"))?;
        if file_end as usize > image.len() {
            return Err(bad("segment extends past the image"));
        }
        if phdr.p_filesz > phdr.p_memsz {
            return Err(bad("file size exceeds memory size"));
        }
        let mem_end = phdr
            .p_vaddr
            .checked_add(phdr.p_memsz)
            .ok_or(bad("segment address range overflows"))?;
        if mem_end > KERNEL_BASE {
            return Err(bad("segment reaches kernel space"));
        }

        let seg_start = align_down(phdr.p_vaddr as usize, PAGE_SIZE) as u32;
        let seg_end = align_up(mem_end as usize, PAGE_SIZE) as u32;

        let mut flags = PageFlags::USER;
        if phdr.p_flags & PF_W != 0 {
            flags |= PageFlags::WRITABLE;
        }

        let mut page = seg_start;
        while page < seg_end {
            let vaddr = VirtualAddress::new(page);
            if !vmm.is_mapped(dir, vaddr, phys) {
                let frame = pmm.alloc_frame()?;
                zero_frame(phys, frame);
                vmm.map_page(dir, vaddr, frame, flags, pmm, phys)?;
            }
            page += PAGE_SIZE as u32;
        }

        if phdr.p_filesz > 0 {
            let src = &image[phdr.p_offset as usize..file_end as usize];
            copy_to_user(vmm, dir, phys, VirtualAddress::new(phdr.p_vaddr), src)?;
        }

        mapped_lo = mapped_lo.min(seg_start);
        mapped_hi = mapped_hi.max(seg_end);
        if phdr.p_memsz > phdr.p_filesz {
            bss_lo = bss_lo.min(phdr.p_vaddr + phdr.p_filesz);
            bss_hi = bss_hi.max(mem_end);
        }
    }

    if mapped_lo == u32::MAX {
        return Err(bad("no loadable segments"));
    }

    Ok(LoadReport {
        entry: ehdr.e_entry,
        base: mapped_lo,
        mapped: mapped_lo..mapped_hi,
        bss: if bss_lo == u32::MAX {
            None
        } else {
            Some(bss_lo..bss_hi)
        },
    })
}
