//! Cooperative scheduler
//!
//! Single CPU, no preemption: switches happen only at syscall exit,
//! explicit yields, and blocking primitives. Tasks live in a slab arena;
//! the ready queue is an intrusive singly linked ring over [`TaskId`]
//! links. `schedule` picks the next Ready task after the current one and
//! produces a [`SwitchPlan`] the arch layer executes outside the lock.

use alloc::vec::Vec;

use super::task::{Task, TaskId, TaskState};

/// Everything the low-level switch needs; computed under the scheduler
/// lock, executed after it is released.
#[derive(Debug, Clone, Copy)]
pub struct SwitchPlan {
    /// Where the outgoing task's ESP is saved.
    pub prev_esp: *mut usize,
    pub next_esp: usize,
    pub next_cr3: u32,
    pub next: TaskId,
}

/// Scheduler statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedStats {
    pub spawned: u64,
    pub switches: u64,
    pub reaped: u64,
}

/// The task arena plus the ready ring.
pub struct Scheduler {
    tasks: Vec<Option<Task>>,
    current: Option<TaskId>,
    stats: SchedStats,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            tasks: Vec::new(),
            current: None,
            stats: SchedStats::default_const(),
        }
    }

    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    pub fn stats(&self) -> SchedStats {
        self.stats
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub fn current_task_mut(&mut self) -> Option<&mut Task> {
        let id = self.current?;
        self.task_mut(id)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.iter().flatten().count()
    }

    /// Insert a task into the arena and the ready ring. The first task
    /// becomes current and Running.
    pub fn spawn(&mut self, mut task: Task) -> TaskId {
        let slot = self.tasks.iter().position(Option::is_none);
        let id = match slot {
            Some(idx) => TaskId(idx as u32),
            None => {
                self.tasks.push(None);
                TaskId(self.tasks.len() as u32 - 1)
            }
        };
        task.id = id;

        match self.current {
            None => {
                // First task: a self-ring, immediately Running.
                task.next = Some(id);
                task.state = TaskState::Running;
                self.tasks[id.0 as usize] = Some(task);
                self.current = Some(id);
            }
            Some(anchor) => {
                let anchor_next = self
                    .task(anchor)
                    .and_then(|t| t.next)
                    .unwrap_or(anchor);
                task.next = Some(anchor_next);
                task.state = TaskState::Ready;
                self.tasks[id.0 as usize] = Some(task);
                if let Some(anchor_task) = self.task_mut(anchor) {
                    anchor_task.next = Some(id);
                }
            }
        }

        self.stats.spawned += 1;
        id
    }

    /// Walk the ring from `from.next`, returning the first Ready task.
    fn next_ready(&self, from: TaskId) -> Option<TaskId> {
        let mut cursor = self.task(from)?.next?;
        loop {
            if let Some(task) = self.task(cursor) {
                if task.state == TaskState::Ready {
                    return Some(cursor);
                }
            }
            if cursor == from {
                return None;
            }
            cursor = self.task(cursor)?.next?;
        }
    }

    /// Pick the next Ready task and flip states. Returns the plan the
    /// caller must execute, or `None` when the current task keeps running.
    pub fn schedule(&mut self) -> Option<SwitchPlan> {
        let current = self.current?;
        let next = self.next_ready(current)?;
        if next == current {
            return None;
        }

        if let Some(task) = self.task_mut(current) {
            if task.state == TaskState::Running {
                task.state = TaskState::Ready;
            }
        }

        let prev_esp = {
            let task = self.task_mut(current)?;
            &mut task.kernel_esp as *mut usize
        };

        let (next_esp, next_cr3) = {
            let task = self.task_mut(next)?;
            task.state = TaskState::Running;
            (task.kernel_esp, task.page_directory.as_u32())
        };

        self.current = Some(next);
        self.stats.switches += 1;
        Some(SwitchPlan {
            prev_esp,
            next_esp,
            next_cr3,
            next,
        })
    }

    /// Mark the current task Waiting (a blocking primitive parked it).
    pub fn block_current(&mut self) {
        if let Some(task) = self.current_task_mut() {
            task.state = TaskState::Waiting;
        }
    }

    /// Make a Waiting task Ready again.
    pub fn wake(&mut self, id: TaskId) {
        if let Some(task) = self.task_mut(id) {
            if task.state == TaskState::Waiting {
                task.state = TaskState::Ready;
            }
        }
    }

    /// Terminate the current task with an exit code; it leaves the ring at
    /// the next reap.
    pub fn exit_current(&mut self, code: i32) {
        if let Some(task) = self.current_task_mut() {
            task.state = TaskState::Terminated;
            task.exit_code = Some(code);
        }
    }

    /// Remove a Terminated task from the arena and the ring, returning the
    /// TCB so the caller can tear down its address space.
    pub fn reap(&mut self, id: TaskId) -> Option<Task> {
        match self.task(id) {
            Some(task) if task.state == TaskState::Terminated => {}
            _ => return None,
        }

        // Unlink: find the predecessor in the ring.
        let successor = self.task(id).and_then(|t| t.next);
        let predecessor = self
            .tasks
            .iter()
            .flatten()
            .find(|t| t.next == Some(id) && t.id != id)
            .map(|t| t.id);
        if let Some(pred) = predecessor {
            if let Some(pred_task) = self.task_mut(pred) {
                pred_task.next = if successor == Some(id) { Some(pred) } else { successor };
            }
        }

        if self.current == Some(id) {
            self.current = predecessor;
            if let Some(task) = self.current_task_mut() {
                if task.state == TaskState::Ready {
                    task.state = TaskState::Running;
                }
            }
        }

        self.stats.reaped += 1;
        self.tasks[id.0 as usize].take()
    }
}

impl SchedStats {
    const fn default_const() -> Self {
        Self {
            spawned: 0,
            switches: 0,
            reaped: 0,
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: SwitchPlan's raw pointer targets a TCB field inside the
// scheduler arena; it is consumed on the same CPU before the next
// scheduler operation.
unsafe impl Send for SwitchPlan {}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::PhysicalAddress;

    fn task(name: &str) -> Task {
        Task::new(name, PhysicalAddress::new(0x4000))
    }

    #[test]
    fn first_task_becomes_running_self_ring() {
        let mut sched = Scheduler::new();
        let id = sched.spawn(task("init"));
        assert_eq!(sched.current(), Some(id));
        let t = sched.task(id).expect("task exists");
        assert_eq!(t.state, TaskState::Running);
        assert_eq!(t.next, Some(id));
        // Nothing else to run.
        assert!(sched.schedule().is_none());
    }

    #[test]
    fn round_robin_rotates_through_ready_tasks() {
        let mut sched = Scheduler::new();
        let a = sched.spawn(task("a"));
        let b = sched.spawn(task("b"));
        let c = sched.spawn(task("c"));

        let plan = sched.schedule().expect("b or c is ready");
        let first = plan.next;
        assert_ne!(first, a);
        assert_eq!(sched.task(a).expect("a").state, TaskState::Ready);
        assert_eq!(sched.task(first).expect("next").state, TaskState::Running);

        let second = sched.schedule().expect("another ready task").next;
        let third = sched.schedule().expect("back around").next;
        assert_ne!(first, second);
        assert_ne!(second, third);
        // After a full rotation we are back at the start.
        let fourth = sched.schedule().expect("cycle").next;
        assert_eq!(fourth, first);
        let _ = (b, c);
    }

    #[test]
    fn waiting_tasks_are_skipped_until_woken() {
        let mut sched = Scheduler::new();
        let _a = sched.spawn(task("a"));
        let b = sched.spawn(task("b"));

        sched.task_mut(b).expect("b").state = TaskState::Waiting;
        assert!(sched.schedule().is_none());

        sched.wake(b);
        let plan = sched.schedule().expect("b is ready now");
        assert_eq!(plan.next, b);
    }

    #[test]
    fn wake_only_affects_waiting_tasks() {
        let mut sched = Scheduler::new();
        let a = sched.spawn(task("a"));
        sched.exit_current(0);
        sched.wake(a);
        assert_eq!(sched.task(a).expect("a").state, TaskState::Terminated);
    }

    #[test]
    fn exit_and_reap_unlink_from_the_ring() {
        let mut sched = Scheduler::new();
        let a = sched.spawn(task("a"));
        let b = sched.spawn(task("b"));

        // Switch to b, then terminate it.
        let plan = sched.schedule().expect("b ready");
        assert_eq!(plan.next, b);
        sched.exit_current(7);

        let reaped = sched.reap(b).expect("terminated task reaps");
        assert_eq!(reaped.exit_code, Some(7));
        assert_eq!(sched.task_count(), 1);
        // Ring is a self-loop on a again.
        assert_eq!(sched.task(a).expect("a").next, Some(a));
        assert_eq!(sched.current(), Some(a));

        // Reaping a live task is refused.
        assert!(sched.reap(a).is_none());
    }

    #[test]
    fn slots_are_reused_after_reap() {
        let mut sched = Scheduler::new();
        let _a = sched.spawn(task("a"));
        let b = sched.spawn(task("b"));
        let plan = sched.schedule().expect("b ready");
        assert_eq!(plan.next, b);
        sched.exit_current(0);
        sched.reap(b).expect("reap b");

        let c = sched.spawn(task("c"));
        assert_eq!(c.0, b.0, "arena slot is recycled");
    }

    #[test]
    fn switch_plan_carries_context() {
        let mut sched = Scheduler::new();
        let a = sched.spawn(task("a"));
        let mut b_task = task("b");
        b_task.kernel_esp = 0xCAFE_0000;
        b_task.page_directory = PhysicalAddress::new(0x8000);
        let b = sched.spawn(b_task);

        let plan = sched.schedule().expect("plan");
        assert_eq!(plan.next, b);
        assert_eq!(plan.next_esp, 0xCAFE_0000);
        assert_eq!(plan.next_cr3, 0x8000);
        // prev_esp points into a's TCB.
        let a_esp_ptr = &mut sched.task_mut(a).expect("a").kernel_esp as *mut usize;
        assert_eq!(plan.prev_esp, a_esp_ptr);
    }
}
