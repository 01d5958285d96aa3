//! SMEP/SMAP control
//!
//! Probed once via CPUID at boot; when present, CR4.SMEP/CR4.SMAP are set
//! and every legitimate kernel access to user memory must sit inside an
//! [`UserAccessGuard`] bracket (STAC on entry, CLAC on exit). The bracket
//! nests; only the outermost close drops access again.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitflags::bitflags;

use crate::arch;

bitflags! {
    /// Supervisor-mode protections the CPU supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuSecurityFeatures: u32 {
        const SMEP = 1 << 0;
        const SMAP = 1 << 1;
    }
}

static SMAP_ACTIVE: AtomicBool = AtomicBool::new(false);
static USER_ACCESS_DEPTH: AtomicU32 = AtomicU32::new(0);

/// CPUID structured-feature probe.
pub fn probe() -> CpuSecurityFeatures {
    let mut features = CpuSecurityFeatures::empty();
    if arch::x86::has_smep() {
        features |= CpuSecurityFeatures::SMEP;
    }
    if arch::x86::has_smap() {
        features |= CpuSecurityFeatures::SMAP;
    }
    features
}

/// Turn the supported features on in CR4.
pub fn enable(features: CpuSecurityFeatures) {
    let mut cr4 = arch::read_cr4();
    if features.contains(CpuSecurityFeatures::SMEP) {
        cr4 |= arch::x86::CR4_SMEP;
    }
    if features.contains(CpuSecurityFeatures::SMAP) {
        cr4 |= arch::x86::CR4_SMAP;
    }
    arch::write_cr4(cr4);
    SMAP_ACTIVE.store(features.contains(CpuSecurityFeatures::SMAP), Ordering::SeqCst);
}

/// Open user-memory access (STAC). Prefer [`UserAccessGuard`].
pub fn enable_user_access() {
    if USER_ACCESS_DEPTH.fetch_add(1, Ordering::SeqCst) == 0
        && SMAP_ACTIVE.load(Ordering::SeqCst)
    {
        arch::x86::stac();
    }
}

/// Close user-memory access (CLAC) when the outermost bracket ends.
pub fn disable_user_access() {
    if USER_ACCESS_DEPTH.fetch_sub(1, Ordering::SeqCst) == 1
        && SMAP_ACTIVE.load(Ordering::SeqCst)
    {
        arch::x86::clac();
    }
}

/// True while some bracket is open (assertion hook).
pub fn user_access_open() -> bool {
    USER_ACCESS_DEPTH.load(Ordering::SeqCst) > 0
}

/// RAII STAC/CLAC bracket.
pub struct UserAccessGuard(());

impl UserAccessGuard {
    pub fn new() -> Self {
        enable_user_access();
        Self(())
    }
}

impl Default for UserAccessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UserAccessGuard {
    fn drop(&mut self) {
        disable_user_access();
    }
}
