//! Synchronization primitives
//!
//! Built on `core::sync::atomic` (lock-prefixed on x86): a test-and-set
//! [`SpinLock`] with a PAUSE loop, an interrupt-safe variant that saves
//! EFLAGS.IF, a parking [`Mutex`], a bounded counting [`Semaphore`], a
//! reader-writer lock assembled from semaphores, and a generation
//! [`Barrier`].
//!
//! Only the parking paths may suspend; IRQ handlers must stick to the
//! spinlocks. Timeout parameters are accepted but treated as indefinite.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use alloc::collections::VecDeque;

use crate::arch;
use crate::sched::{self, TaskId};

// ---------------------------------------------------------------------------
// Spinlocks
// ---------------------------------------------------------------------------

/// Test-and-set spinlock with a PAUSE spin.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: the lock serializes all access to the inner value.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    pub fn acquire(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                arch::pause();
            }
        }
        SpinLockGuard { lock: self }
    }

    pub fn try_acquire(&self) -> Option<SpinLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// Spinlock that additionally masks interrupts, restoring the saved IF
/// state on release. The variant IRQ handlers are allowed to share.
pub struct IrqSpinLock<T> {
    inner: SpinLock<T>,
}

pub struct IrqSpinLockGuard<'a, T> {
    guard: Option<SpinLockGuard<'a, T>>,
    reenable: bool,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: SpinLock::new(value),
        }
    }

    pub fn acquire(&self) -> IrqSpinLockGuard<'_, T> {
        let reenable = arch::interrupts_enabled();
        arch::disable_interrupts();
        IrqSpinLockGuard {
            guard: Some(self.inner.acquire()),
            reenable,
        }
    }
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard present until drop")
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard present until drop")
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before interrupts come back.
        self.guard.take();
        if self.reenable {
            arch::enable_interrupts();
        }
    }
}

// ---------------------------------------------------------------------------
// Wait queue
// ---------------------------------------------------------------------------

/// FIFO of parked tasks.
pub struct WaitQueue {
    waiters: SpinLock<VecDeque<TaskId>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Park the current task on this queue and yield. Without a current
    /// task (early boot) this degrades to a plain yield.
    pub fn wait(&self) {
        match sched::current_task_id() {
            Some(id) => {
                self.waiters.acquire().push_back(id);
                sched::block_current();
            }
            None => sched::yield_cpu(),
        }
    }

    /// Wake the longest-waiting task. Returns whether one was woken.
    pub fn wake_one(&self) -> bool {
        let id = self.waiters.acquire().pop_front();
        match id {
            Some(id) => {
                sched::wake(id);
                true
            }
            None => false,
        }
    }

    /// Wake everyone.
    pub fn wake_all(&self) -> usize {
        let drained: VecDeque<TaskId> = core::mem::take(&mut *self.waiters.acquire());
        let count = drained.len();
        for id in drained {
            sched::wake(id);
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.acquire().is_empty()
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

/// Sleeping mutex: atomic fast path, parking slow path.
pub struct Mutex {
    locked: AtomicBool,
    owner: AtomicU32,
    waiters: WaitQueue,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicU32::new(u32::MAX),
            waiters: WaitQueue::new(),
        }
    }

    pub fn try_lock(&self) -> bool {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            let owner = sched::current_task_id().map(|t| t.0).unwrap_or(u32::MAX);
            self.owner.store(owner, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn lock(&self) {
        while !self.try_lock() {
            self.waiters.wait();
        }
    }

    /// `timeout_ms > 0` is accepted and treated as indefinite.
    pub fn lock_timeout(&self, _timeout_ms: u32) {
        self.lock();
    }

    pub fn unlock(&self) {
        self.owner.store(u32::MAX, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        self.waiters.wake_one();
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Semaphore
// ---------------------------------------------------------------------------

struct SemState {
    count: u32,
    max: u32,
}

/// Counting semaphore bounded by `max_count`.
pub struct Semaphore {
    state: SpinLock<SemState>,
    waiters: WaitQueue,
}

impl Semaphore {
    pub const fn new(initial: u32, max_count: u32) -> Self {
        Self {
            state: SpinLock::new(SemState {
                count: initial,
                max: max_count,
            }),
            waiters: WaitQueue::new(),
        }
    }

    /// Decrement, parking while the count is zero.
    pub fn wait(&self) {
        loop {
            {
                let mut state = self.state.acquire();
                if state.count > 0 {
                    state.count -= 1;
                    return;
                }
            }
            self.waiters.wait();
        }
    }

    /// Non-blocking decrement.
    pub fn try_wait(&self) -> bool {
        let mut state = self.state.acquire();
        if state.count > 0 {
            state.count -= 1;
            true
        } else {
            false
        }
    }

    /// Increment (saturating at `max_count`) and wake one waiter.
    pub fn post(&self) {
        {
            let mut state = self.state.acquire();
            if state.count < state.max {
                state.count += 1;
            }
        }
        self.waiters.wake_one();
    }

    pub fn count(&self) -> u32 {
        self.state.acquire().count
    }
}

// ---------------------------------------------------------------------------
// Reader-writer lock
// ---------------------------------------------------------------------------

/// RW lock from semaphores: the first reader takes the write semaphore,
/// the last reader releases it.
pub struct RwLock {
    write_sem: Semaphore,
    reader_lock: Mutex,
    reader_count: AtomicU32,
}

impl RwLock {
    pub const fn new() -> Self {
        Self {
            write_sem: Semaphore::new(1, 1),
            reader_lock: Mutex::new(),
            reader_count: AtomicU32::new(0),
        }
    }

    pub fn read_lock(&self) {
        self.reader_lock.lock();
        if self.reader_count.fetch_add(1, Ordering::AcqRel) == 0 {
            self.write_sem.wait();
        }
        self.reader_lock.unlock();
    }

    pub fn read_unlock(&self) {
        self.reader_lock.lock();
        if self.reader_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.write_sem.post();
        }
        self.reader_lock.unlock();
    }

    pub fn write_lock(&self) {
        self.write_sem.wait();
    }

    pub fn try_write_lock(&self) -> bool {
        self.write_sem.try_wait()
    }

    pub fn write_unlock(&self) {
        self.write_sem.post();
    }

    pub fn reader_count(&self) -> u32 {
        self.reader_count.load(Ordering::Relaxed)
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Barrier
// ---------------------------------------------------------------------------

struct BarrierState {
    arrived: u32,
    generation: u32,
}

/// All-or-nothing rendezvous for a fixed party count.
pub struct Barrier {
    parties: u32,
    state: SpinLock<BarrierState>,
}

impl Barrier {
    pub const fn new(parties: u32) -> Self {
        Self {
            parties,
            state: SpinLock::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
        }
    }

    /// Block until all parties arrive. Returns true for the task that
    /// tripped the barrier.
    pub fn wait(&self) -> bool {
        let my_generation;
        {
            let mut state = self.state.acquire();
            state.arrived += 1;
            if state.arrived == self.parties {
                state.arrived = 0;
                state.generation = state.generation.wrapping_add(1);
                return true;
            }
            my_generation = state.generation;
        }
        while self.state.acquire().generation == my_generation {
            sched::yield_cpu();
            arch::pause();
        }
        false
    }

    pub fn generation(&self) -> u32 {
        self.state.acquire().generation
    }
}
