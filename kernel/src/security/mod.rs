//! Corruption defenses
//!
//! Stack canary, SMEP/SMAP control, and the allocation tracker with
//! redzones. Heap and PMM magics/checksums live with their owners in `mm`;
//! guard pages live in `mm::vas`.

pub mod canary;
pub mod cpu_features;
pub mod heap_tracker;

pub use cpu_features::{CpuSecurityFeatures, UserAccessGuard};
pub use heap_tracker::CorruptionDetectionTracker;

/// Bring up the defenses: seed the canary, then enable whatever the CPU
/// offers.
pub fn init() {
    canary::init();
    let features = cpu_features::probe();
    cpu_features::enable(features);
    log::info!(target: "security", "features enabled: {:?}", features);
}
