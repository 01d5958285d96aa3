//! Architecture support
//!
//! Only 32-bit x86 is supported. All raw-hardware access lives under
//! `arch::x86` behind `cfg(all(target_arch = "x86", target_os = "none"))`;
//! host builds get mirrors backed by ordinary statics so the rest of the
//! kernel (and its test suite) is architecture-clean.

pub mod x86;

pub use x86::{
    disable_interrupts, enable_interrupts, halt, has_invlpg, has_smap, has_smep,
    interrupts_enabled, invlpg, pause, read_cr0, read_cr2, read_cr3, read_cr4, read_tsc,
    write_cr0, write_cr3, write_cr4,
};
