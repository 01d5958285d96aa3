//! Kernel error types
//!
//! One central error enum with struct-variant context replaces ad-hoc string
//! errors. Subsystems return these directly; the syscall layer converts them
//! to negative Linux errno values at the boundary (see `syscall::errno_from`).

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// No free frame, no heap block, or the heap cannot expand further.
    OutOfMemory { requested: usize },
    /// Misaligned, out of range, or freeing something not currently
    /// allocated (this is how double-free of a frame is reported).
    InvalidAddress { addr: u32 },
    /// The target PTE is already present.
    AlreadyMapped { vaddr: u32 },
    /// The target PTE is not present.
    NotMapped { vaddr: u32 },
    /// Subsystem used before its init completed.
    NotInitialized { subsystem: &'static str },
    /// Already-initialized, re-init attempted, or an operation that the
    /// current state forbids.
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    /// Zero or larger-than-permitted size argument.
    InvalidSize { size: usize },
    /// Magic mismatch, checksum failure, double free, canary violation.
    /// Continuing past corruption is unsafe; callers panic on this.
    Corruption { what: &'static str },
    /// ELF image failed validation.
    InvalidExecutable { reason: &'static str },
    /// A named object (path, task, descriptor slot) does not exist.
    NotFound { what: &'static str },
    /// The access is forbidden by protection flags.
    PermissionDenied { operation: &'static str },
    /// A fixed-capacity table is full.
    ResourceExhausted { resource: &'static str },
    /// A user-supplied pointer does not resolve to mapped memory.
    BadUserAccess { addr: u32 },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "Out of memory: requested {} bytes", requested)
            }
            Self::InvalidAddress { addr } => write!(f, "Invalid address: {:#010x}", addr),
            Self::AlreadyMapped { vaddr } => write!(f, "Already mapped: {:#010x}", vaddr),
            Self::NotMapped { vaddr } => write!(f, "Not mapped: {:#010x}", vaddr),
            Self::NotInitialized { subsystem } => {
                write!(f, "Subsystem not initialized: {}", subsystem)
            }
            Self::InvalidState { expected, actual } => {
                write!(f, "Invalid state: expected {}, got {}", expected, actual)
            }
            Self::InvalidSize { size } => write!(f, "Invalid size: {}", size),
            Self::Corruption { what } => write!(f, "Corruption detected: {}", what),
            Self::InvalidExecutable { reason } => write!(f, "Invalid executable: {}", reason),
            Self::NotFound { what } => write!(f, "Not found: {}", what),
            Self::PermissionDenied { operation } => {
                write!(f, "Permission denied: {}", operation)
            }
            Self::ResourceExhausted { resource } => {
                write!(f, "Resource exhausted: {}", resource)
            }
            Self::BadUserAccess { addr } => {
                write!(f, "Bad user-space access at {:#010x}", addr)
            }
        }
    }
}

impl KernelError {
    /// Short category string for the panic screen (row 1).
    pub fn category(&self) -> &'static str {
        match self {
            Self::OutOfMemory { .. } => "OUT OF MEMORY",
            Self::InvalidAddress { .. } | Self::BadUserAccess { .. } => "INVALID ADDRESS",
            Self::AlreadyMapped { .. } | Self::NotMapped { .. } => "MAPPING STATE",
            Self::NotInitialized { .. } | Self::InvalidState { .. } => "INVALID STATE",
            Self::InvalidSize { .. } => "INVALID SIZE",
            Self::Corruption { .. } => "MEMORY CORRUPTION",
            Self::InvalidExecutable { .. } => "BAD EXECUTABLE",
            Self::NotFound { .. } => "NOT FOUND",
            Self::PermissionDenied { .. } => "PERMISSION DENIED",
            Self::ResourceExhausted { .. } => "RESOURCE EXHAUSTED",
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        use alloc::string::ToString;

        let err = KernelError::InvalidAddress { addr: 0xB000_1000 };
        assert!(err.to_string().contains("0xb0001000"));

        let err = KernelError::NotInitialized { subsystem: "vmm" };
        assert!(err.to_string().contains("vmm"));
    }

    #[test]
    fn corruption_has_its_own_category() {
        let err = KernelError::Corruption { what: "heap block" };
        assert_eq!(err.category(), "MEMORY CORRUPTION");
    }
}
