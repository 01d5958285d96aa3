//! Allocation corruption tracker
//!
//! An optional layer in front of the kernel heap: every tracked allocation
//! is wrapped in front and rear redzones plus two canary words, and a
//! record (pointer, size, times, canary, caller tag, checksum) is kept
//! while it is outstanding. Frees and sweeps verify the wrapping before
//! anything is reused.
//!
//! Layout of a tracked allocation:
//! `[front redzone][canary][payload][canary][rear redzone]`

use crate::arch;
use crate::error::{KernelError, KernelResult};
use crate::mm::heap::{HeapBacking, KernelHeap};

/// Redzone length on each side, in bytes.
pub const REDZONE_SIZE: usize = 16;
/// Byte the redzones are filled with.
pub const REDZONE_PATTERN: u8 = 0xA5;

const CANARY_SIZE: usize = core::mem::size_of::<u32>();
const FRONT_OVERHEAD: usize = REDZONE_SIZE + CANARY_SIZE;
const TOTAL_OVERHEAD: usize = 2 * (REDZONE_SIZE + CANARY_SIZE);

/// Most allocations tracked at once.
pub const MAX_TRACKED: usize = 64;

/// Book-keeping for one outstanding allocation.
#[derive(Debug, Clone, Copy)]
pub struct AllocationRecord {
    pub payload: usize,
    pub size: usize,
    pub alloc_time: u64,
    pub free_time: u64,
    pub canary: u32,
    pub caller_tag: &'static str,
    checksum: u32,
}

impl AllocationRecord {
    fn compute_checksum(&self) -> u32 {
        (self.payload as u32)
            .rotate_left(7)
            .wrapping_add(self.size as u32)
            .rotate_left(7)
            .wrapping_add(self.alloc_time as u32)
            ^ self.canary
    }

    fn verify(&self) -> KernelResult<()> {
        if self.compute_checksum() != self.checksum {
            return Err(KernelError::Corruption {
                what: "allocation record checksum",
            });
        }
        Ok(())
    }
}

/// Tracks allocations and validates their redzones and canaries.
pub struct CorruptionDetectionTracker {
    records: [Option<AllocationRecord>; MAX_TRACKED],
    next_canary: u32,
}

impl CorruptionDetectionTracker {
    pub fn new() -> Self {
        Self {
            records: [None; MAX_TRACKED],
            next_canary: crate::security::canary::generate(arch::read_tsc(), 0x7261_636B),
        }
    }

    fn fresh_canary(&mut self) -> u32 {
        self.next_canary = self.next_canary.rotate_left(13).wrapping_add(0x9E37_79B9);
        self.next_canary
    }

    /// Allocate `size` tracked bytes through `heap`.
    pub fn alloc<B: HeapBacking>(
        &mut self,
        heap: &mut KernelHeap<B>,
        size: usize,
        caller_tag: &'static str,
    ) -> *mut u8 {
        if size == 0 {
            return core::ptr::null_mut();
        }
        let raw = heap.kmalloc(size + TOTAL_OVERHEAD);
        if raw.is_null() {
            return raw;
        }

        let canary = self.fresh_canary();
        // SAFETY: kmalloc returned size + TOTAL_OVERHEAD writable bytes.
        unsafe {
            core::ptr::write_bytes(raw, REDZONE_PATTERN, REDZONE_SIZE);
            (raw.add(REDZONE_SIZE) as *mut u32).write_unaligned(canary);
            let payload = raw.add(FRONT_OVERHEAD);
            (payload.add(size) as *mut u32).write_unaligned(canary);
            core::ptr::write_bytes(payload.add(size + CANARY_SIZE), REDZONE_PATTERN, REDZONE_SIZE);
        }

        let payload = raw as usize + FRONT_OVERHEAD;
        let mut record = AllocationRecord {
            payload,
            size,
            alloc_time: arch::read_tsc(),
            free_time: 0,
            canary,
            caller_tag,
            checksum: 0,
        };
        record.checksum = record.compute_checksum();

        if let Some(slot) = self.records.iter_mut().find(|s| s.is_none()) {
            *slot = Some(record);
        } else {
            log::warn!(target: "security", "allocation tracker full; {} untracked", caller_tag);
        }
        payload as *mut u8
    }

    fn verify_wrapping(record: &AllocationRecord) -> KernelResult<()> {
        record.verify()?;
        let raw = (record.payload - FRONT_OVERHEAD) as *const u8;
        // SAFETY: the wrapped allocation is still owned by the tracker.
        unsafe {
            for i in 0..REDZONE_SIZE {
                if *raw.add(i) != REDZONE_PATTERN {
                    return Err(KernelError::Corruption {
                        what: "front redzone",
                    });
                }
            }
            if (raw.add(REDZONE_SIZE) as *const u32).read_unaligned() != record.canary {
                return Err(KernelError::Corruption {
                    what: "front allocation canary",
                });
            }
            let payload = raw.add(FRONT_OVERHEAD);
            if (payload.add(record.size) as *const u32).read_unaligned() != record.canary {
                return Err(KernelError::Corruption {
                    what: "rear allocation canary",
                });
            }
            let rear = payload.add(record.size + CANARY_SIZE);
            for i in 0..REDZONE_SIZE {
                if *rear.add(i) != REDZONE_PATTERN {
                    return Err(KernelError::Corruption { what: "rear redzone" });
                }
            }
        }
        Ok(())
    }

    /// Free a pointer previously returned by [`alloc`](Self::alloc).
    /// Untracked pointers fall through to the heap unchanged. Corruption
    /// is reported and the memory is deliberately leaked.
    pub fn free<B: HeapBacking>(
        &mut self,
        heap: &mut KernelHeap<B>,
        payload: *mut u8,
    ) -> KernelResult<()> {
        let addr = payload as usize;
        let slot = self
            .records
            .iter_mut()
            .find(|s| s.as_ref().is_some_and(|r| r.payload == addr));

        let slot = match slot {
            Some(slot) => slot,
            None => return heap.kfree(payload),
        };
        let mut record = slot.take().expect("slot was matched as Some");

        if let Err(e) = Self::verify_wrapping(&record) {
            // Put the record back so a sweep still sees the damage.
            record.free_time = arch::read_tsc();
            *slot = Some(record);
            return Err(e);
        }

        heap.kfree((addr - FRONT_OVERHEAD) as *mut u8)
    }

    /// Validate every outstanding allocation; returns how many were
    /// checked.
    pub fn sweep(&self) -> KernelResult<usize> {
        let mut checked = 0;
        for record in self.records.iter().flatten() {
            Self::verify_wrapping(record)?;
            checked += 1;
        }
        Ok(checked)
    }

    pub fn outstanding(&self) -> usize {
        self.records.iter().flatten().count()
    }
}

impl Default for CorruptionDetectionTracker {
    fn default() -> Self {
        Self::new()
    }
}
