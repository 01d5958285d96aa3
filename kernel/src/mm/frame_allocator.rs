//! Physical frame allocator
//!
//! One bit per 4 KiB frame over a single global bitmap, seeded from the
//! sanitized boot region table. Bit set means Used/Reserved; the free count
//! always equals the number of clear bits. Frames below the kernel-end
//! watermark are never handed out, and freeing one is reported as
//! `InvalidAddress` -- the same check that catches double frees.
//!
//! Searches advance word-at-a-time, skipping fully-set words, with two
//! rotating hints: one for the DMA zone below 16 MiB and one for the rest.

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mm::region::RegionTable;
use crate::mm::{PhysicalAddress, PAGE_SHIFT, PAGE_SIZE};

/// Highest physical address the bitmap covers (256 MiB baseline ceiling).
pub const PHYS_CEILING: u32 = 0x1000_0000;
/// Frames under the ceiling.
pub const MAX_FRAMES: usize = (PHYS_CEILING >> PAGE_SHIFT) as usize;
const BITMAP_WORDS: usize = MAX_FRAMES / 32;

/// First frame above the legacy DMA zone (16 MiB).
pub const DMA_LIMIT_FRAME: u32 = (16 * 1024 * 1024) >> PAGE_SHIFT;

const METADATA_MAGIC_HEAD: u32 = 0x504D_4D68; // "PMMh"
const METADATA_MAGIC_FOOT: u32 = 0x504D_4D66; // "PMMf"

/// Zone preference for single-frame allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZonePreference {
    /// Below 16 MiB (legacy DMA devices).
    Low,
    /// At or above 16 MiB.
    High,
    /// Wherever a frame is free (high zone preferred).
    Any,
}

/// Checksummed counters wrapped around the bitmap.
#[derive(Debug, Clone, Copy)]
struct BitmapMetadata {
    magic_header: u32,
    checksum: u32,
    total_frames: u32,
    free_frames: u32,
    hint_low: u32,
    hint_high: u32,
    magic_footer: u32,
}

impl BitmapMetadata {
    const fn new() -> Self {
        Self {
            magic_header: METADATA_MAGIC_HEAD,
            checksum: 0,
            total_frames: 0,
            free_frames: 0,
            hint_low: 0,
            hint_high: 0,
            magic_footer: METADATA_MAGIC_FOOT,
        }
    }

    fn compute_checksum(&self) -> u32 {
        self.magic_header
            .wrapping_mul(31)
            .wrapping_add(self.total_frames)
            .rotate_left(7)
            .wrapping_add(self.free_frames)
            .rotate_left(7)
            .wrapping_add(self.hint_low)
            .rotate_left(7)
            .wrapping_add(self.hint_high)
            ^ self.magic_footer
    }
}

/// Allocator statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmmStats {
    pub total_frames: u32,
    pub free_frames: u32,
    pub used_frames: u32,
    pub alloc_count: u64,
    pub free_count: u64,
}

/// The bitmap frame allocator.
pub struct FrameAllocator {
    /// One bit per frame; set = Used/Reserved.
    bitmap: [u32; BITMAP_WORDS],
    meta: BitmapMetadata,
    /// Frames below this are never free.
    kernel_end_frame: u32,
    /// Frames managed: `[0, top_frame)`.
    top_frame: u32,
    alloc_count: u64,
    free_count: u64,
    initialized: bool,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            bitmap: [u32::MAX; BITMAP_WORDS],
            meta: BitmapMetadata::new(),
            kernel_end_frame: 0,
            top_frame: 0,
            alloc_count: 0,
            free_count: 0,
            initialized: false,
        }
    }

    /// Seed the bitmap from the sanitized region table.
    ///
    /// Pages inside Available regions become free; everything else --
    /// reserved regions, the kernel image, the initrd, and all frames below
    /// `kernel_end` -- stays used. (The bitmap itself lives inside the
    /// kernel image, so its pages are covered by the watermark.)
    pub fn init(&mut self, regions: &RegionTable, kernel_end: PhysicalAddress) -> KernelResult<()> {
        if self.initialized {
            return Err(KernelError::InvalidState {
                expected: "uninitialized frame allocator",
                actual: "already initialized",
            });
        }
        regions.verify()?;

        let top = regions
            .highest_available()
            .min(PHYS_CEILING as u64) as u32;
        if top == 0 {
            return Err(KernelError::InvalidState {
                expected: "at least one available region",
                actual: "empty memory map",
            });
        }
        self.top_frame = top >> PAGE_SHIFT;
        self.kernel_end_frame =
            (crate::mm::align_up(kernel_end.as_usize(), PAGE_SIZE) >> PAGE_SHIFT) as u32;

        // Everything starts used; punch out the available regions.
        for word in self.bitmap.iter_mut() {
            *word = u32::MAX;
        }
        for region in regions.iter_available() {
            let first = (region.base >> PAGE_SHIFT) as u32;
            let last = (region.end() >> PAGE_SHIFT).min(self.top_frame as u64) as u32;
            for frame in first..last {
                self.clear_bit(frame);
            }
        }
        // Force the watermark.
        for frame in 0..self.kernel_end_frame.min(self.top_frame) {
            self.set_bit(frame);
        }

        self.meta.total_frames = self.top_frame;
        self.meta.free_frames = self.count_free_bits();
        self.meta.hint_low = self.kernel_end_frame.min(DMA_LIMIT_FRAME);
        self.meta.hint_high = self.kernel_end_frame.max(DMA_LIMIT_FRAME);
        self.update_checksum();
        self.initialized = true;

        log::info!(
            target: "pmm",
            "{} frames managed, {} free, watermark at frame {}",
            self.meta.total_frames,
            self.meta.free_frames,
            self.kernel_end_frame
        );
        Ok(())
    }

    // -- bit helpers --------------------------------------------------------

    #[inline]
    const fn word_index(frame: u32) -> usize {
        (frame / 32) as usize
    }

    #[inline]
    const fn bit_mask(frame: u32) -> u32 {
        1 << (frame % 32)
    }

    #[inline]
    fn is_used(&self, frame: u32) -> bool {
        self.bitmap[Self::word_index(frame)] & Self::bit_mask(frame) != 0
    }

    #[inline]
    fn set_bit(&mut self, frame: u32) {
        self.bitmap[Self::word_index(frame)] |= Self::bit_mask(frame);
    }

    #[inline]
    fn clear_bit(&mut self, frame: u32) {
        self.bitmap[Self::word_index(frame)] &= !Self::bit_mask(frame);
    }

    fn count_free_bits(&self) -> u32 {
        let mut free = 0;
        for frame in 0..self.top_frame {
            if !self.is_used(frame) {
                free += 1;
            }
        }
        free
    }

    fn update_checksum(&mut self) {
        self.meta.checksum = self.meta.compute_checksum();
    }

    fn require_init(&self) -> KernelResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(KernelError::NotInitialized { subsystem: "pmm" })
        }
    }

    // -- allocation ---------------------------------------------------------

    /// Scan `[start, end)` for a clear bit beginning at `hint`, wrapping
    /// once. Fully-set words are skipped 32 frames at a time.
    fn scan_range(&self, start: u32, end: u32, hint: u32) -> Option<u32> {
        if start >= end {
            return None;
        }
        let hint = hint.clamp(start, end - 1);
        self.scan_linear(hint, end)
            .or_else(|| self.scan_linear(start, hint))
    }

    fn scan_linear(&self, from: u32, to: u32) -> Option<u32> {
        let mut frame = from;
        while frame < to {
            if frame % 32 == 0 && frame + 32 <= to {
                // Hot path: skip fully used words.
                if self.bitmap[Self::word_index(frame)] == u32::MAX {
                    frame += 32;
                    continue;
                }
            }
            if !self.is_used(frame) {
                return Some(frame);
            }
            frame += 1;
        }
        None
    }

    fn zone_bounds(&self, pref: ZonePreference) -> (u32, u32) {
        match pref {
            ZonePreference::Low => (
                self.kernel_end_frame.min(DMA_LIMIT_FRAME),
                DMA_LIMIT_FRAME.min(self.top_frame),
            ),
            ZonePreference::High | ZonePreference::Any => (
                self.kernel_end_frame.max(DMA_LIMIT_FRAME).min(self.top_frame),
                self.top_frame,
            ),
        }
    }

    /// Allocate one frame honoring a zone preference.
    pub fn alloc_page(&mut self, pref: ZonePreference) -> KernelResult<PhysicalAddress> {
        self.require_init()?;

        let frame = match pref {
            ZonePreference::Low => {
                let (start, end) = self.zone_bounds(ZonePreference::Low);
                self.scan_range(start, end, self.meta.hint_low)
            }
            ZonePreference::High => {
                let (start, end) = self.zone_bounds(ZonePreference::High);
                self.scan_range(start, end, self.meta.hint_high)
            }
            ZonePreference::Any => {
                let (hs, he) = self.zone_bounds(ZonePreference::High);
                let (ls, le) = self.zone_bounds(ZonePreference::Low);
                self.scan_range(hs, he, self.meta.hint_high)
                    .or_else(|| self.scan_range(ls, le, self.meta.hint_low))
            }
        }
        .ok_or(KernelError::OutOfMemory {
            requested: PAGE_SIZE,
        })?;

        self.set_bit(frame);
        self.meta.free_frames -= 1;
        if frame < DMA_LIMIT_FRAME {
            self.meta.hint_low = frame + 1;
        } else {
            self.meta.hint_high = frame + 1;
        }
        self.alloc_count += 1;
        self.update_checksum();
        Ok(PhysicalAddress::new(frame << PAGE_SHIFT))
    }

    /// Allocate the next free frame at or after the rotating hint.
    pub fn alloc_frame(&mut self) -> KernelResult<PhysicalAddress> {
        self.alloc_page(ZonePreference::Any)
    }

    /// Allocate `n` physically contiguous frames.
    pub fn alloc_frames(&mut self, n: usize) -> KernelResult<PhysicalAddress> {
        self.require_init()?;
        if n == 0 {
            return Err(KernelError::InvalidSize { size: 0 });
        }

        let mut run_start = self.kernel_end_frame;
        let mut run_len: usize = 0;
        let mut frame = self.kernel_end_frame;
        while frame < self.top_frame {
            if run_len == 0 && frame % 32 == 0 && frame + 32 <= self.top_frame {
                if self.bitmap[Self::word_index(frame)] == u32::MAX {
                    frame += 32;
                    continue;
                }
            }
            if self.is_used(frame) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = frame;
                }
                run_len += 1;
                if run_len == n {
                    for f in run_start..run_start + n as u32 {
                        self.set_bit(f);
                    }
                    self.meta.free_frames -= n as u32;
                    // Advance the hint past the block.
                    self.meta.hint_high = run_start + n as u32;
                    self.alloc_count += 1;
                    self.update_checksum();
                    return Ok(PhysicalAddress::new(run_start << PAGE_SHIFT));
                }
            }
            frame += 1;
        }
        Err(KernelError::OutOfMemory {
            requested: n * PAGE_SIZE,
        })
    }

    /// Allocate `n` frames, preferring one contiguous block and falling
    /// back to singles. Returns how many frames landed in `out` and whether
    /// the full request was satisfied.
    pub fn alloc_scattered(&mut self, n: usize, out: &mut [PhysicalAddress]) -> (usize, bool) {
        let want = n.min(out.len());
        if want == 0 {
            return (0, n == 0);
        }

        if let Ok(base) = self.alloc_frames(want) {
            for (i, slot) in out.iter_mut().take(want).enumerate() {
                *slot = base.offset((i * PAGE_SIZE) as u32);
            }
            return (want, want == n);
        }

        let mut got = 0;
        while got < want {
            match self.alloc_frame() {
                Ok(addr) => {
                    out[got] = addr;
                    got += 1;
                }
                Err(_) => break,
            }
        }
        (got, got == n)
    }

    // -- freeing ------------------------------------------------------------

    fn validate_free(&self, addr: PhysicalAddress) -> KernelResult<u32> {
        self.require_init()?;
        if !addr.is_page_aligned() {
            return Err(KernelError::InvalidAddress { addr: addr.as_u32() });
        }
        let frame = addr.as_frame().as_u32();
        if frame >= self.top_frame || frame < self.kernel_end_frame {
            return Err(KernelError::InvalidAddress { addr: addr.as_u32() });
        }
        if !self.is_used(frame) {
            // Double free.
            return Err(KernelError::InvalidAddress { addr: addr.as_u32() });
        }
        Ok(frame)
    }

    /// Return one frame. Misaligned, out-of-range, below-watermark, and
    /// not-currently-used addresses are all rejected without mutation.
    pub fn free_frame(&mut self, addr: PhysicalAddress) -> KernelResult<()> {
        let frame = self.validate_free(addr)?;
        self.clear_bit(frame);
        self.meta.free_frames += 1;
        self.free_count += 1;
        self.update_checksum();
        Ok(())
    }

    /// Return `n` contiguous frames; all of them are validated before any
    /// bit changes, so the call is atomic in effect.
    pub fn free_frames(&mut self, base: PhysicalAddress, n: usize) -> KernelResult<()> {
        if n == 0 {
            return Err(KernelError::InvalidSize { size: 0 });
        }
        for i in 0..n {
            self.validate_free(base.offset((i * PAGE_SIZE) as u32))?;
        }
        for i in 0..n {
            let frame = base.offset((i * PAGE_SIZE) as u32).as_frame().as_u32();
            self.clear_bit(frame);
        }
        self.meta.free_frames += n as u32;
        self.free_count += 1;
        self.update_checksum();
        Ok(())
    }

    // -- inspection ---------------------------------------------------------

    /// Longest run of free frames above the watermark, in frames.
    pub fn find_largest_free_block(&self) -> usize {
        let mut best = 0;
        let mut run = 0;
        for frame in self.kernel_end_frame..self.top_frame {
            if self.is_used(frame) {
                run = 0;
            } else {
                run += 1;
                best = best.max(run);
            }
        }
        best
    }

    pub fn stats(&self) -> PmmStats {
        PmmStats {
            total_frames: self.meta.total_frames,
            free_frames: self.meta.free_frames,
            used_frames: self.meta.total_frames - self.meta.free_frames,
            alloc_count: self.alloc_count,
            free_count: self.free_count,
        }
    }

    pub fn free_frames_count(&self) -> u32 {
        self.meta.free_frames
    }

    pub fn is_frame_used(&self, addr: PhysicalAddress) -> bool {
        let frame = addr.as_frame().as_u32();
        frame >= self.top_frame || self.is_used(frame)
    }

    /// Verify the metadata magics, the checksum, and that the free counter
    /// agrees with the bitmap. Returns `Corruption`; the caller decides to
    /// panic (the PMM itself never does).
    pub fn check_corruption(&self) -> KernelResult<()> {
        self.require_init()?;
        if self.meta.magic_header != METADATA_MAGIC_HEAD
            || self.meta.magic_footer != METADATA_MAGIC_FOOT
        {
            return Err(KernelError::Corruption {
                what: "pmm metadata magic",
            });
        }
        if self.meta.compute_checksum() != self.meta.checksum {
            return Err(KernelError::Corruption {
                what: "pmm metadata checksum",
            });
        }
        if self.count_free_bits() != self.meta.free_frames {
            return Err(KernelError::Corruption {
                what: "pmm free count vs bitmap",
            });
        }
        Ok(())
    }

    #[cfg(all(test, not(target_os = "none")))]
    fn corrupt_free_count_for_test(&mut self) {
        self.meta.free_frames = self.meta.free_frames.wrapping_add(1);
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Global frame allocator instance
pub static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());
